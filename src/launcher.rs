//! The boundary between the driver and the step components.
//!
//! A [`StepLauncher`] runs one [`StepInvocation`] to completion and reports
//! success or failure; nothing else flows back. [`MlflowLauncher`] does this
//! with `mlflow run`, [`DryRunLauncher`] only prints what it would run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::binder::StepInvocation;
use crate::config::ConfigTree;
use crate::errors::{ConfigError, StepError};
use crate::settings::Settings;
use crate::ui::PipelineUI;

/// Variables the step components read to group their tracking runs.
pub const PROJECT_VAR: &str = "WANDB_PROJECT";
pub const RUN_GROUP_VAR: &str = "WANDB_RUN_GROUP";

/// Per-run context shared by every launched step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEnvironment {
    pub project_name: String,
    pub run_group: String,
    /// Working directory for child processes
    pub working_dir: PathBuf,
}

impl RunEnvironment {
    /// Read `main.project_name` and `main.experiment_name`.
    pub fn from_config(config: &ConfigTree, working_dir: PathBuf) -> Result<Self, ConfigError> {
        Ok(Self {
            project_name: config.require_str("main.project_name")?.to_string(),
            run_group: config.require_str("main.experiment_name")?.to_string(),
            working_dir,
        })
    }

    /// Environment variables set on every child process.
    pub fn vars(&self) -> [(&'static str, &str); 2] {
        [
            (PROJECT_VAR, self.project_name.as_str()),
            (RUN_GROUP_VAR, self.run_group.as_str()),
        ]
    }
}

/// Result of a successful launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub exit_code: i32,
    pub duration: Duration,
}

#[async_trait]
pub trait StepLauncher: Send + Sync {
    /// Run the step and wait for it to finish.
    async fn launch(
        &self,
        invocation: &StepInvocation,
        env: &RunEnvironment,
    ) -> Result<LaunchOutcome, StepError>;
}

/// Arguments for `mlflow` (after the program itself) that run `invocation`.
pub fn command_args(invocation: &StepInvocation, default_env_manager: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        invocation.uri.clone(),
        "-e".to_string(),
        invocation.entry_point.to_string(),
    ];
    if let Some(version) = invocation.version {
        args.push("-v".to_string());
        args.push(version.to_string());
    }
    if let Some(manager) = invocation.env_manager.or(default_env_manager) {
        args.push("--env-manager".to_string());
        args.push(manager.to_string());
    }
    for pair in invocation.parameters.to_cli_pairs() {
        args.push("-P".to_string());
        args.push(pair);
    }
    args
}

/// Split a configured command such as `conda run -n tools mlflow` into program and leading args.
fn split_command(command: &str) -> (String, Vec<String>) {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next().unwrap_or_else(|| "mlflow".to_string());
    (program, parts.collect())
}

/// Render a command line for display, quoting arguments the shell would split.
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().map(|a| shell_quote(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+#".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Runs steps with `mlflow run`.
pub struct MlflowLauncher {
    program: String,
    leading_args: Vec<String>,
    default_env_manager: Option<String>,
    stderr_tail_lines: usize,
    ui: Option<Arc<PipelineUI>>,
}

impl MlflowLauncher {
    pub fn new(command: &str) -> Self {
        let (program, leading_args) = split_command(command);
        Self {
            program,
            leading_args,
            default_env_manager: None,
            stderr_tail_lines: 20,
            ui: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut launcher = Self::new(&settings.mlflow_cmd());
        launcher.default_env_manager = settings.launcher.env_manager.clone();
        launcher.stderr_tail_lines = settings.launcher.stderr_tail_lines;
        launcher
    }

    pub fn with_ui(mut self, ui: Arc<PipelineUI>) -> Self {
        self.ui = Some(ui);
        self
    }

    fn full_args(&self, invocation: &StepInvocation) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.extend(command_args(
            invocation,
            self.default_env_manager.as_deref(),
        ));
        args
    }

    fn echo(&self, invocation: &StepInvocation, line: &str, is_stderr: bool) {
        match self.ui {
            Some(ref ui) => {
                ui.child_line(line, is_stderr);
                debug!(target: "mlpipe::step", step = %invocation.step, "{}", line);
            }
            None => info!(target: "mlpipe::step", step = %invocation.step, "{}", line),
        }
    }
}

#[async_trait]
impl StepLauncher for MlflowLauncher {
    async fn launch(
        &self,
        invocation: &StepInvocation,
        env: &RunEnvironment,
    ) -> Result<LaunchOutcome, StepError> {
        let step = invocation.step;
        let args = self.full_args(invocation);
        debug!(
            step = %step,
            command = %display_command(&self.program, &args),
            "spawning step"
        );

        let start = Instant::now();
        let mut child = Command::new(&self.program)
            .args(&args)
            .envs(env.vars())
            .current_dir(&env.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StepError::SpawnFailed {
                step,
                command: self.program.clone(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_stdout = async {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    self.echo(invocation, &line, false);
                }
            }
            Ok::<_, std::io::Error>(())
        };

        let read_stderr = async {
            let mut tail = VecDeque::with_capacity(self.stderr_tail_lines);
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(line) = lines.next_line().await? {
                    self.echo(invocation, &line, true);
                    if self.stderr_tail_lines > 0 {
                        if tail.len() == self.stderr_tail_lines {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            }
            Ok::<_, std::io::Error>(tail)
        };

        let (stdout_done, stderr_tail) = tokio::join!(read_stdout, read_stderr);
        let io_err = |source: std::io::Error| StepError::Io { step, source };
        let status = child.wait().await.map_err(io_err)?;
        stdout_done.map_err(io_err)?;
        let stderr_tail = stderr_tail.map_err(io_err)?;

        let duration = start.elapsed();
        let exit_code = status.code().unwrap_or(-1);
        debug!(step = %step, exit_code, elapsed_secs = duration.as_secs_f64(), "step exited");

        if !status.success() {
            return Err(StepError::NonZeroExit {
                step,
                exit_code,
                stderr_tail: stderr_tail.into(),
            });
        }

        Ok(LaunchOutcome {
            exit_code,
            duration,
        })
    }
}

/// Prints the `mlflow run` command for each step to stdout instead of running it.
#[derive(Debug, Clone)]
pub struct DryRunLauncher {
    program: String,
    leading_args: Vec<String>,
    default_env_manager: Option<String>,
}

impl DryRunLauncher {
    pub fn from_settings(settings: &Settings) -> Self {
        let (program, leading_args) = split_command(&settings.mlflow_cmd());
        Self {
            program,
            leading_args,
            default_env_manager: settings.launcher.env_manager.clone(),
        }
    }

    /// The full command line, environment assignments included.
    pub fn command_line(&self, invocation: &StepInvocation, env: &RunEnvironment) -> String {
        let mut args = self.leading_args.clone();
        args.extend(command_args(
            invocation,
            self.default_env_manager.as_deref(),
        ));
        let assignments: Vec<String> = env
            .vars()
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
            .collect();
        format!(
            "{} {}",
            assignments.join(" "),
            display_command(&self.program, &args)
        )
    }
}

#[async_trait]
impl StepLauncher for DryRunLauncher {
    async fn launch(
        &self,
        invocation: &StepInvocation,
        env: &RunEnvironment,
    ) -> Result<LaunchOutcome, StepError> {
        let line = self.command_line(invocation, env);
        println!("{}", line);
        info!(step = %invocation.step, command = %line, "dry run");
        Ok(LaunchOutcome {
            exit_code: 0,
            duration: Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::ParameterBinder;
    use crate::config::tests::SAMPLE_CONFIG;
    use crate::step::Step;
    use std::path::Path;
    use tempfile::tempdir;

    fn sample() -> ConfigTree {
        ConfigTree::parse(SAMPLE_CONFIG).unwrap()
    }

    fn env_in(dir: &Path) -> RunEnvironment {
        RunEnvironment::from_config(&sample(), dir.to_path_buf()).unwrap()
    }

    #[test]
    fn test_run_environment_from_config() {
        let env = env_in(Path::new("/tmp"));
        assert_eq!(
            env.vars(),
            [
                ("WANDB_PROJECT", "nyc_airbnb"),
                ("WANDB_RUN_GROUP", "development")
            ]
        );
    }

    #[test]
    fn test_run_environment_requires_names() {
        let mut config = sample();
        config.apply_overrides(&["~main.experiment_name"]).unwrap();
        assert!(matches!(
            RunEnvironment::from_config(&config, PathBuf::from("/tmp")),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_command_args_for_repository_step() {
        let config = sample();
        let scratch = tempdir().unwrap();
        let inv = ParameterBinder::new(&config, Path::new("/project"), scratch.path())
            .bind(Step::Download)
            .unwrap();
        assert_eq!(
            command_args(&inv, Some("local")),
            vec![
                "run",
                "https://github.com/example/ml-components#components/get_data",
                "-e",
                "main",
                "-v",
                "main",
                "--env-manager",
                "conda",
                "-P",
                "sample=sample1.csv",
                "-P",
                "artifact_name=sample.csv",
                "-P",
                "artifact_type=raw_data",
                "-P",
                "artifact_description=Raw file as downloaded",
            ]
        );
    }

    #[test]
    fn test_command_args_for_local_step_use_default_env_manager() {
        let config = sample();
        let scratch = tempdir().unwrap();
        let inv = ParameterBinder::new(&config, Path::new("/project"), scratch.path())
            .bind(Step::TestRegressionModel)
            .unwrap();
        assert_eq!(
            command_args(&inv, None),
            vec![
                "run",
                "/project/components/test_regression_model",
                "-e",
                "main",
                "-P",
                "mlflow_model=random_forest_export.csv:prod",
                "-P",
                "test_dataset=test_data.csv:latest",
            ]
        );
        assert!(
            command_args(&inv, Some("virtualenv"))
                .windows(2)
                .any(|w| w == ["--env-manager", "virtualenv"])
        );
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("mlflow"), ("mlflow".to_string(), vec![]));
        assert_eq!(
            split_command("conda run -n tools mlflow"),
            (
                "conda".to_string(),
                vec!["run".to_string(), "-n".to_string(), "tools".to_string(), "mlflow".to_string()]
            )
        );
        assert_eq!(split_command("  "), ("mlflow".to_string(), vec![]));
    }

    #[test]
    fn test_display_command_quotes_when_needed() {
        let args = vec![
            "-P".to_string(),
            "artifact_description=Raw file as downloaded".to_string(),
            "it's".to_string(),
        ];
        assert_eq!(
            display_command("mlflow", &args),
            r"mlflow -P 'artifact_description=Raw file as downloaded' 'it'\''s'"
        );
    }

    #[tokio::test]
    async fn test_dry_run_launcher_always_succeeds() {
        let config = sample();
        let scratch = tempdir().unwrap();
        let inv = ParameterBinder::new(&config, Path::new("/project"), scratch.path())
            .bind(Step::DataSplit)
            .unwrap();
        let launcher = DryRunLauncher::from_settings(&Settings::default());
        let env = env_in(scratch.path());

        let line = launcher.command_line(&inv, &env);
        assert!(line.starts_with("WANDB_PROJECT=nyc_airbnb WANDB_RUN_GROUP=development "));
        assert!(line.contains("-P input=clean_sample.csv:latest"));

        let outcome = launcher.launch(&inv, &env).await.unwrap();
        assert_eq!(outcome.exit_code, 0);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::fs;

        /// Write a fake mlflow script and return a launcher command that runs it via `sh`.
        fn fake_mlflow(dir: &Path, body: &str) -> String {
            let script = dir.join("fake-mlflow.sh");
            fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
            format!("sh {}", script.display())
        }

        fn download_invocation(scratch: &Path) -> StepInvocation {
            ParameterBinder::new(&sample(), Path::new("/project"), scratch)
                .bind(Step::Download)
                .unwrap()
        }

        #[tokio::test]
        async fn test_mlflow_launcher_passes_args_env_and_cwd() {
            let dir = tempdir().unwrap();
            let log = dir.path().join("calls.log");
            let command = fake_mlflow(
                dir.path(),
                &format!(
                    "echo \"$WANDB_PROJECT|$WANDB_RUN_GROUP|$(pwd)|$*\" >> {}",
                    log.display()
                ),
            );
            let launcher = MlflowLauncher::new(&command);
            let inv = download_invocation(dir.path());
            let env = env_in(dir.path());

            let outcome = launcher.launch(&inv, &env).await.unwrap();
            assert_eq!(outcome.exit_code, 0);

            let logged = fs::read_to_string(&log).unwrap();
            let fields: Vec<&str> = logged.trim().splitn(4, '|').collect();
            assert_eq!(fields[0], "nyc_airbnb");
            assert_eq!(fields[1], "development");
            assert_eq!(
                fs::canonicalize(fields[2]).unwrap(),
                fs::canonicalize(dir.path()).unwrap()
            );
            assert!(fields[3].starts_with("run https://github.com/example/ml-components#components/get_data -e main -v main --env-manager conda"));
            assert!(fields[3].contains("-P sample=sample1.csv"));
        }

        #[tokio::test]
        async fn test_mlflow_launcher_reports_non_zero_exit_with_stderr_tail() {
            let dir = tempdir().unwrap();
            let command = fake_mlflow(
                dir.path(),
                "echo first >&2\necho second >&2\necho third >&2\nexit 3",
            );
            let mut launcher = MlflowLauncher::new(&command);
            launcher.stderr_tail_lines = 2;
            let inv = download_invocation(dir.path());

            let err = launcher
                .launch(&inv, &env_in(dir.path()))
                .await
                .unwrap_err();
            match err {
                StepError::NonZeroExit {
                    step,
                    exit_code,
                    stderr_tail,
                } => {
                    assert_eq!(step, Step::Download);
                    assert_eq!(exit_code, 3);
                    assert_eq!(stderr_tail, vec!["second", "third"]);
                }
                other => panic!("Expected NonZeroExit, got {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_mlflow_launcher_spawn_failure() {
            let dir = tempdir().unwrap();
            let launcher = MlflowLauncher::new("/nonexistent/mlflow-binary");
            let inv = download_invocation(dir.path());

            let err = launcher
                .launch(&inv, &env_in(dir.path()))
                .await
                .unwrap_err();
            assert!(matches!(err, StepError::SpawnFailed { .. }));
        }
    }
}
