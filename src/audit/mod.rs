//! Run history.
//!
//! Every non-dry run is recorded as JSON: which steps were launched, with
//! which parameters, and how each ended. The record for the run in progress
//! lives in `current-run.json`; finished runs move to `runs/`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::binder::{StepInvocation, StepParameters};
use crate::step::Step;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub context: RunContext,
    pub steps: Vec<StepRecord>,
    pub outcome: RunOutcome,
}

impl RunRecord {
    pub fn new(context: RunContext) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            context,
            steps: Vec::new(),
            outcome: RunOutcome::InProgress,
        }
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
    }

    /// Steps that finished successfully, in launch order.
    pub fn succeeded_steps(&self) -> impl Iterator<Item = Step> + '_ {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Succeeded { .. }))
            .map(|s| s.step)
    }
}

/// What the run was asked to do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunContext {
    pub project_dir: PathBuf,
    pub project_name: String,
    pub experiment_name: String,
    /// `main.steps` as configured
    pub requested_steps: String,
    /// Command-line overrides applied to the configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<String>,
    /// Names in `main.steps` that matched no step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: Step,
    pub uri: String,
    pub parameters: StepParameters,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: StepOutcome,
}

impl StepRecord {
    pub fn new(invocation: &StepInvocation) -> Self {
        Self {
            step: invocation.step,
            uri: invocation.uri.clone(),
            parameters: invocation.parameters.clone(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: StepOutcome::InProgress,
        }
    }

    pub fn finish(&mut self, outcome: StepOutcome) {
        self.ended_at = Some(Utc::now());
        self.outcome = outcome;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StepOutcome {
    InProgress,
    Succeeded { duration_secs: f64 },
    Failed { message: String },
}

impl StepOutcome {
    pub fn succeeded(duration: Duration) -> Self {
        StepOutcome::Succeeded {
            duration_secs: duration.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RunOutcome {
    InProgress,
    Completed,
    Failed { step: Option<Step>, message: String },
}

pub mod logger;
pub use logger::AuditLogger;
