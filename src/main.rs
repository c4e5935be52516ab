use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use mlpipe::config::DEFAULT_CONFIG_NAME;
use mlpipe::errors::{ConfigError, PipelineError};
use mlpipe::logging::{self, LogFormat};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "mlpipe")]
#[command(version, about = "Run an ML pipeline as a sequence of mlflow projects")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding the local step components (default: current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Directory holding the pipeline configuration (default: project directory)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Configuration file name, with or without the .yaml extension
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_NAME)]
    pub config_name: String,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the active pipeline steps in order
    Run {
        /// Configuration overrides (key=value, +key=value, ++key=value, ~key)
        overrides: Vec<String>,

        /// Print the mlflow commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the steps a run would launch and where their inputs come from
    Plan {
        /// Configuration overrides (key=value, +key=value, ++key=value, ~key)
        overrides: Vec<String>,
    },
    /// List pipeline steps in execution order
    Steps,
    /// Print the composed configuration and validate mlpipe.toml
    Config {
        /// Configuration overrides (key=value, +key=value, ++key=value, ~key)
        overrides: Vec<String>,
    },
    /// List recorded runs, newest first
    History {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

impl Cli {
    /// The project directory as an absolute path.
    ///
    /// Steps run from the scratch directory, so local component paths built
    /// from this must not depend on the driver's working directory.
    pub fn project_dir(&self) -> Result<PathBuf> {
        match self.project_dir {
            Some(ref dir) => std::path::absolute(dir)
                .with_context(|| format!("Failed to resolve project directory {}", dir.display())),
            None => std::env::current_dir().context("Failed to get current directory"),
        }
    }
}

/// Exit status for a failed command: 2 for configuration problems, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(pipeline_err) = err.downcast_ref::<PipelineError>() {
        return pipeline_err.exit_code();
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    1
}

async fn dispatch(cli: &Cli) -> Result<()> {
    let project_dir = cli.project_dir()?;

    match &cli.command {
        Commands::Run { overrides, dry_run } => {
            cmd::cmd_run(cli, &project_dir, overrides, *dry_run).await
        }
        Commands::Plan { overrides } => cmd::cmd_plan(cli, &project_dir, overrides),
        Commands::Steps => cmd::cmd_steps(),
        Commands::Config { overrides } => cmd::cmd_config(cli, &project_dir, overrides),
        Commands::History { limit } => cmd::cmd_history(&project_dir, *limit),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    if let Err(e) = logging::init(cli.verbose, cli.log_format) {
        eprintln!("{} {:#}", style("warning:").yellow().bold(), e);
    }

    match dispatch(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", style("error:").red().bold(), err);
            ExitCode::from(exit_code(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlpipe::errors::StepError;
    use mlpipe::step::Step;

    #[test]
    fn test_exit_code_for_config_errors() {
        let err = anyhow::Error::new(PipelineError::from(ConfigError::EmptyStepList));
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::Error::new(ConfigError::NotAMapping).context("Failed to load config");
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn test_exit_code_for_step_and_other_errors() {
        let err = anyhow::Error::new(PipelineError::from(StepError::NonZeroExit {
            step: Step::Download,
            exit_code: 1,
            stderr_tail: Vec::new(),
        }));
        assert_eq!(exit_code(&err), 1);
        assert_eq!(exit_code(&anyhow::anyhow!("disk full")), 1);
    }

    #[test]
    fn test_relative_project_dir_is_made_absolute() {
        let cli = Cli::try_parse_from(["mlpipe", "--project-dir", "proj", "steps"]).unwrap();
        let dir = cli.project_dir().unwrap();
        assert!(dir.is_absolute());
        assert_eq!(dir, std::env::current_dir().unwrap().join("proj"));
    }

    #[test]
    fn test_cli_parses_overrides_and_globals() {
        let cli = Cli::try_parse_from([
            "mlpipe",
            "run",
            "main.steps=download",
            "~etl.min_price",
            "--dry-run",
            "--config-name",
            "dev",
        ])
        .unwrap();
        assert_eq!(cli.config_name, "dev");
        match cli.command {
            Commands::Run { overrides, dry_run } => {
                assert_eq!(overrides, vec!["main.steps=download", "~etl.min_price"]);
                assert!(dry_run);
            }
            _ => panic!("Expected run command"),
        }
    }
}
