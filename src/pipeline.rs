//! Sequential pipeline driver.
//!
//! A run resolves the active steps, binds every one of them up front, then
//! launches them one at a time in canonical order and stops at the first
//! failure. Nothing is launched if any step cannot be bound.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tempfile::TempDir;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifact::{ArtifactRef, Handoff, handoff_for};
use crate::audit::{AuditLogger, RunContext, RunOutcome, StepOutcome, StepRecord};
use crate::binder::{ParameterBinder, StepInvocation};
use crate::config::ConfigTree;
use crate::errors::{ConfigError, PipelineError, StepError};
use crate::launcher::{RunEnvironment, StepLauncher};
use crate::settings::Settings;
use crate::step::{ActiveSteps, Step};
use crate::ui::PipelineUI;

const STEPS_KEY: &str = "main.steps";

/// Resolve `main.steps`, given either as a string or as a list of names.
pub fn active_steps(config: &ConfigTree) -> Result<ActiveSteps, ConfigError> {
    let malformed = || ConfigError::Malformed {
        key: STEPS_KEY.to_string(),
        expected: "\"all\", a comma-separated string or a list of step names",
    };
    match config.require(STEPS_KEY)? {
        Value::String(raw) => ActiveSteps::resolve(raw),
        Value::Array(items) => {
            let names = items
                .iter()
                .map(|v| v.as_str().ok_or_else(malformed))
                .collect::<Result<Vec<_>, _>>()?;
            ActiveSteps::from_names(names)
        }
        _ => Err(malformed()),
    }
}

/// `main.steps` as written, for records and display.
fn requested_steps(config: &ConfigTree) -> String {
    match config.get(STEPS_KEY) {
        Some(Value::String(raw)) => raw.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(","),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Everything bound for a run, before anything is launched.
///
/// Field order matters: invocations (and the scratch files they own) drop
/// before the scratch directory.
pub struct RunPlan {
    pub environment: RunEnvironment,
    pub active: ActiveSteps,
    pub requested: String,
    pub invocations: Vec<StepInvocation>,
    scratch: TempDir,
}

/// Where one consumed artifact comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffNote {
    pub consumer: Step,
    pub parameter: String,
    pub input: ArtifactRef,
    pub handoff: Handoff,
}

impl RunPlan {
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Steps that will run, in order.
    pub fn steps(&self) -> Vec<Step> {
        self.invocations.iter().map(|inv| inv.step).collect()
    }

    /// For every artifact a planned step reads, whether this run produces it.
    pub fn handoffs(&self) -> Vec<HandoffNote> {
        let running = self.steps();
        let mut notes = Vec::new();
        for inv in &self.invocations {
            for input in &inv.inputs {
                notes.push(HandoffNote {
                    consumer: inv.step,
                    parameter: input.parameter.clone(),
                    input: input.artifact.clone(),
                    handoff: handoff_for(&input.artifact, inv.step, &running),
                });
            }
        }
        notes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutedStep {
    pub step: Step,
    pub duration: Duration,
}

/// Summary of a successful run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub executed: Vec<ExecutedStep>,
    /// Run record written to the audit directory, when auditing is on
    pub record_path: Option<PathBuf>,
    pub unknown_steps: Vec<String>,
}

impl RunReport {
    pub fn steps(&self) -> Vec<Step> {
        self.executed.iter().map(|e| e.step).collect()
    }
}

pub struct Pipeline {
    config: ConfigTree,
    project_dir: PathBuf,
    settings: Settings,
    launcher: Box<dyn StepLauncher>,
    ui: Arc<PipelineUI>,
    overrides: Vec<String>,
    audit: bool,
}

impl Pipeline {
    pub fn new(config: ConfigTree, project_dir: &Path, launcher: Box<dyn StepLauncher>) -> Self {
        let settings = Settings::default();
        let audit = settings.audit.enabled;
        Self {
            config,
            project_dir: project_dir.to_path_buf(),
            settings,
            launcher,
            ui: Arc::new(PipelineUI::hidden()),
            overrides: Vec::new(),
            audit,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.audit = settings.audit.enabled;
        self.settings = settings;
        self
    }

    pub fn with_ui(mut self, ui: Arc<PipelineUI>) -> Self {
        self.ui = ui;
        self
    }

    /// Overrides already applied to the config, kept for the run record.
    pub fn with_overrides(mut self, overrides: Vec<String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Skip the run record regardless of settings.
    pub fn without_audit(mut self) -> Self {
        self.audit = false;
        self
    }

    pub fn config(&self) -> &ConfigTree {
        &self.config
    }

    /// Resolve and bind every active step without launching anything.
    pub fn plan(&self) -> Result<RunPlan, PipelineError> {
        let active = active_steps(&self.config)?;
        for name in active.unknown() {
            warn!(name = %name, "ignoring unknown step name in main.steps");
            self.ui.unknown_step(name);
        }

        let scratch = tempfile::Builder::new()
            .prefix("mlpipe-")
            .tempdir()
            .map_err(|source| PipelineError::Scratch {
                path: std::env::temp_dir(),
                source,
            })?;
        let environment = RunEnvironment::from_config(&self.config, scratch.path().to_path_buf())?;

        let binder = ParameterBinder::new(&self.config, &self.project_dir, scratch.path())
            .with_ref_validation(self.settings.validation.artifact_refs);
        let invocations = active
            .in_canonical_order()
            .map(|step| binder.bind(step))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RunPlan {
            environment,
            requested: requested_steps(&self.config),
            active,
            invocations,
            scratch,
        })
    }

    /// Run every active step in order, stopping at the first failure or at Ctrl-C.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        self.run_until(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`Pipeline::run`], but stops when `interrupt` completes.
    ///
    /// The running step's launch is dropped (killing its process) and the run
    /// fails with [`StepError::Interrupted`], so the scratch directory is still
    /// removed on the way out.
    pub async fn run_until(
        &self,
        interrupt: impl Future<Output = ()>,
    ) -> Result<RunReport, PipelineError> {
        tokio::pin!(interrupt);
        let plan = self.plan()?;
        self.ui.set_total(plan.invocations.len());
        info!(
            project = %plan.environment.project_name,
            group = %plan.environment.run_group,
            steps = ?plan.steps(),
            "starting pipeline run"
        );

        let mut audit = self
            .audit
            .then(|| AuditLogger::new(&self.settings.audit_dir(&self.project_dir)));
        let run_id = match audit.as_mut() {
            Some(logger) => logger
                .start_run(self.run_context(&plan))
                .map_err(PipelineError::Audit)?,
            None => Uuid::new_v4(),
        };

        let mut executed = Vec::new();
        let mut failure: Option<StepError> = None;

        for inv in &plan.invocations {
            info!(step = %inv.step, uri = %inv.uri, "starting step");
            self.ui.start_step(inv.step);
            if let Some(logger) = audit.as_mut() {
                logger
                    .start_step(StepRecord::new(inv))
                    .map_err(PipelineError::Audit)?;
            }

            let launched = tokio::select! {
                result = self.launcher.launch(inv, &plan.environment) => result,
                () = &mut interrupt => {
                    warn!(step = %inv.step, "interrupted, stopping run");
                    Err(StepError::Interrupted { step: inv.step })
                }
            };

            match launched {
                Ok(outcome) => {
                    info!(
                        step = %inv.step,
                        elapsed_secs = outcome.duration.as_secs_f64(),
                        "step finished"
                    );
                    self.ui.step_succeeded(inv.step, outcome.duration);
                    if let Some(logger) = audit.as_mut() {
                        logger
                            .finish_step(StepOutcome::succeeded(outcome.duration))
                            .map_err(PipelineError::Audit)?;
                    }
                    executed.push(ExecutedStep {
                        step: inv.step,
                        duration: outcome.duration,
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    // Child stderr has already been echoed line by line.
                    let summary = message.lines().next().unwrap_or_default();
                    error!(step = %inv.step, error = %summary, "step failed");
                    self.ui.step_failed(inv.step, summary);
                    if let Some(logger) = audit.as_mut() {
                        logger
                            .finish_step(StepOutcome::Failed { message })
                            .map_err(PipelineError::Audit)?;
                    }
                    failure = Some(err);
                    break;
                }
            }
        }

        let record_path = match audit.as_mut() {
            Some(logger) => {
                let outcome = match failure {
                    Some(ref err) => RunOutcome::Failed {
                        step: Some(err.step()),
                        message: err.to_string(),
                    },
                    None => RunOutcome::Completed,
                };
                Some(logger.finish_run(outcome).map_err(PipelineError::Audit)?)
            }
            None => None,
        };

        if let Some(err) = failure {
            return Err(err.into());
        }

        self.ui.finish(executed.len());
        info!(run_id = %run_id, executed = executed.len(), "pipeline run complete");

        Ok(RunReport {
            run_id,
            executed,
            record_path,
            unknown_steps: plan.active.unknown().to_vec(),
        })
    }

    fn run_context(&self, plan: &RunPlan) -> RunContext {
        RunContext {
            project_dir: self.project_dir.clone(),
            project_name: plan.environment.project_name.clone(),
            experiment_name: plan.environment.run_group.clone(),
            requested_steps: plan.requested.clone(),
            overrides: self.overrides.clone(),
            unknown_steps: plan.active.unknown().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE_CONFIG;
    use crate::launcher::LaunchOutcome;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// What a launcher saw for one step.
    #[derive(Debug, Clone)]
    struct Launch {
        step: Step,
        parameters: Vec<String>,
        rf_config: Option<String>,
        project: String,
        group: String,
        working_dir: PathBuf,
    }

    #[derive(Default)]
    struct RecordingLauncher {
        launches: Arc<Mutex<Vec<Launch>>>,
        fail_on: Option<Step>,
        hang_on: Option<Step>,
    }

    #[async_trait]
    impl StepLauncher for RecordingLauncher {
        async fn launch(
            &self,
            invocation: &StepInvocation,
            env: &RunEnvironment,
        ) -> Result<LaunchOutcome, StepError> {
            let rf_config = invocation
                .parameters
                .get_str("rf_config")
                .map(|path| std::fs::read_to_string(path).unwrap());
            self.launches.lock().unwrap().push(Launch {
                step: invocation.step,
                parameters: invocation.parameters.to_cli_pairs(),
                rf_config,
                project: env.project_name.clone(),
                group: env.run_group.clone(),
                working_dir: env.working_dir.clone(),
            });
            if self.hang_on == Some(invocation.step) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.fail_on == Some(invocation.step) {
                return Err(StepError::NonZeroExit {
                    step: invocation.step,
                    exit_code: 1,
                    stderr_tail: vec!["boom".to_string()],
                });
            }
            Ok(LaunchOutcome {
                exit_code: 0,
                duration: Duration::from_millis(10),
            })
        }
    }

    struct Harness {
        pipeline: Pipeline,
        launches: Arc<Mutex<Vec<Launch>>>,
        project: TempDir,
    }

    impl Harness {
        fn launched(&self) -> Vec<Step> {
            self.launches.lock().unwrap().iter().map(|l| l.step).collect()
        }
    }

    fn harness(overrides: &[&str], fail_on: Option<Step>) -> Harness {
        let mut config = ConfigTree::parse(SAMPLE_CONFIG).unwrap();
        config.apply_overrides(overrides).unwrap();
        let launches = Arc::new(Mutex::new(Vec::new()));
        let launcher = RecordingLauncher {
            launches: Arc::clone(&launches),
            fail_on,
            ..Default::default()
        };
        let project = tempdir().unwrap();
        let pipeline = Pipeline::new(config, project.path(), Box::new(launcher)).without_audit();
        Harness {
            pipeline,
            launches,
            project,
        }
    }

    #[tokio::test]
    async fn test_all_runs_default_steps_in_order() {
        let h = harness(&[], None);
        let report = h.pipeline.run().await.unwrap();
        let expected = vec![
            Step::Download,
            Step::BasicCleaning,
            Step::DataCheck,
            Step::DataSplit,
            Step::TrainRandomForest,
        ];
        assert_eq!(report.steps(), expected);
        assert_eq!(h.launched(), expected);
        assert!(report.record_path.is_none());
    }

    #[tokio::test]
    async fn test_listed_order_does_not_change_execution_order() {
        let h = harness(&["main.steps=data_split,download"], None);
        h.pipeline.run().await.unwrap();
        assert_eq!(h.launched(), vec![Step::Download, Step::DataSplit]);
    }

    #[tokio::test]
    async fn test_regression_test_runs_when_listed_alone() {
        let h = harness(&["main.steps=test_regression_model"], None);
        h.pipeline.run().await.unwrap();
        assert_eq!(h.launched(), vec![Step::TestRegressionModel]);
    }

    #[tokio::test]
    async fn test_steps_as_yaml_sequence() {
        let h = harness(&["main.steps=[train_random_forest, basic_cleaning]"], None);
        h.pipeline.run().await.unwrap();
        assert_eq!(
            h.launched(),
            vec![Step::BasicCleaning, Step::TrainRandomForest]
        );
    }

    #[tokio::test]
    async fn test_unknown_names_are_reported_and_inert() {
        let h = harness(&["main.steps=download,upload"], None);
        let report = h.pipeline.run().await.unwrap();
        assert_eq!(h.launched(), vec![Step::Download]);
        assert_eq!(report.unknown_steps, vec!["upload"]);
    }

    #[tokio::test]
    async fn test_missing_field_aborts_before_any_launch() {
        let h = harness(&["~etl.min_price"], None);
        let err = h.pipeline.run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::MissingField { ref key }) if key == "etl.min_price"
        ));
        assert_eq!(err.exit_code(), 2);
        assert!(h.launched().is_empty());
    }

    #[tokio::test]
    async fn test_missing_field_of_inactive_step_is_ignored() {
        let h = harness(&["~etl.min_price", "main.steps=download,data_split"], None);
        h.pipeline.run().await.unwrap();
        assert_eq!(h.launched(), vec![Step::Download, Step::DataSplit]);
    }

    #[tokio::test]
    async fn test_empty_step_list_is_config_error() {
        let h = harness(&["main.steps=,"], None);
        let err = h.pipeline.run().await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::EmptyStepList)
        ));
    }

    #[tokio::test]
    async fn test_non_string_steps_is_malformed() {
        let h = harness(&["main.steps=3"], None);
        assert!(matches!(
            h.pipeline.plan(),
            Err(PipelineError::Config(ConfigError::Malformed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_failure_stops_the_run() {
        let h = harness(&[], Some(Step::DataCheck));
        let err = h.pipeline.run().await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        match err {
            PipelineError::Step(step_err) => assert_eq!(step_err.step(), Step::DataCheck),
            other => panic!("Expected step error, got {:?}", other),
        }
        assert_eq!(
            h.launched(),
            vec![Step::Download, Step::BasicCleaning, Step::DataCheck]
        );
    }

    #[tokio::test]
    async fn test_environment_is_fixed_for_every_launch() {
        let h = harness(&[], None);
        h.pipeline.run().await.unwrap();
        let launches = h.launches.lock().unwrap();
        assert_eq!(launches.len(), 5);
        for launch in launches.iter() {
            assert_eq!(launch.project, "nyc_airbnb");
            assert_eq!(launch.group, "development");
            assert_eq!(launch.working_dir, launches[0].working_dir);
        }
    }

    #[tokio::test]
    async fn test_rf_config_visible_during_launch() {
        let h = harness(&["main.steps=train_random_forest"], None);
        h.pipeline.run().await.unwrap();
        let launches = h.launches.lock().unwrap();
        let written: Value =
            serde_json::from_str(launches[0].rf_config.as_deref().unwrap()).unwrap();
        assert_eq!(
            written,
            serde_json::json!({"n_estimators": 100, "max_depth": 15})
        );
        assert!(
            launches[0]
                .parameters
                .iter()
                .any(|p| p == "output_artifact=random_forest_export.csv")
        );
    }

    #[tokio::test]
    async fn test_scratch_removed_after_success_and_failure() {
        for fail_on in [None, Some(Step::TrainRandomForest)] {
            let h = harness(&[], fail_on);
            let _ = h.pipeline.run().await;
            let launches = h.launches.lock().unwrap();
            let scratch = &launches[0].working_dir;
            assert!(!scratch.exists(), "scratch dir survived run: {:?}", fail_on);
        }
    }

    #[tokio::test]
    async fn test_interrupt_stops_run_and_removes_scratch() {
        let mut h = harness(&[], None);
        let launcher = RecordingLauncher {
            launches: Arc::clone(&h.launches),
            hang_on: Some(Step::DataCheck),
            ..Default::default()
        };
        let config = h.pipeline.config().clone();
        h.pipeline = Pipeline::new(config, h.project.path(), Box::new(launcher));

        let err = h
            .pipeline
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Step(StepError::Interrupted {
                step: Step::DataCheck
            })
        ));
        assert_eq!(err.exit_code(), 130);
        assert_eq!(
            h.launched(),
            vec![Step::Download, Step::BasicCleaning, Step::DataCheck]
        );

        let launches = h.launches.lock().unwrap();
        assert!(!launches[0].working_dir.exists());

        let logger = AuditLogger::new(&h.project.path().join(".mlpipe/audit"));
        let record = logger.load_run(&logger.list_runs().unwrap()[0]).unwrap();
        assert!(matches!(
            record.outcome,
            RunOutcome::Failed {
                step: Some(Step::DataCheck),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_plan_reports_handoffs() {
        let h = harness(&["main.steps=basic_cleaning,data_check,test_regression_model"], None);
        let plan = h.pipeline.plan().unwrap();
        assert_eq!(
            plan.steps(),
            vec![
                Step::BasicCleaning,
                Step::DataCheck,
                Step::TestRegressionModel
            ]
        );
        assert!(plan.scratch_dir().exists());

        let notes = plan.handoffs();
        let find = |consumer: Step, parameter: &str| {
            notes
                .iter()
                .find(|n| n.consumer == consumer && n.parameter == parameter)
                .unwrap()
                .handoff
                .clone()
        };
        assert_eq!(
            find(Step::BasicCleaning, "input_artifact"),
            Handoff::ExpectedInStore {
                producer: Some(Step::Download)
            }
        );
        assert_eq!(
            find(Step::DataCheck, "csv"),
            Handoff::ProducedThisRun {
                producer: Step::BasicCleaning
            }
        );
        let data_check_parameters: Vec<_> = notes
            .iter()
            .filter(|n| n.consumer == Step::DataCheck)
            .map(|n| n.parameter.as_str())
            .collect();
        assert_eq!(data_check_parameters, vec!["csv", "ref"]);
        assert_eq!(
            find(Step::TestRegressionModel, "mlflow_model"),
            Handoff::ExpectedInStore {
                producer: Some(Step::TrainRandomForest)
            }
        );
        assert!(h.launched().is_empty());
    }

    #[tokio::test]
    async fn test_audit_record_written() {
        let mut h = harness(&["main.steps=download,basic_cleaning"], Some(Step::BasicCleaning));
        let launcher = RecordingLauncher {
            launches: Arc::clone(&h.launches),
            fail_on: Some(Step::BasicCleaning),
            ..Default::default()
        };
        let config = h.pipeline.config().clone();
        h.pipeline = Pipeline::new(config, h.project.path(), Box::new(launcher))
            .with_overrides(vec!["main.steps=download,basic_cleaning".to_string()]);

        assert!(h.pipeline.run().await.is_err());

        let logger = AuditLogger::new(&h.project.path().join(".mlpipe/audit"));
        let runs = logger.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        let record = logger.load_run(&runs[0]).unwrap();
        assert_eq!(record.context.requested_steps, "download,basic_cleaning");
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.succeeded_steps().collect::<Vec<_>>(), vec![Step::Download]);
        assert!(matches!(
            record.outcome,
            RunOutcome::Failed {
                step: Some(Step::BasicCleaning),
                ..
            }
        ));
    }
}
