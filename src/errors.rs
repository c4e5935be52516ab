//! Typed error hierarchy for the pipeline driver.
//!
//! Three enums cover the failure domains:
//! - `ConfigError`: configuration tree, overrides, settings and step selection
//! - `StepError`: a single external step invocation
//! - `PipelineError`: a whole run, wrapping the two above plus scratch/audit I/O

use std::path::PathBuf;

use thiserror::Error;

use crate::step::Step;

/// Errors from loading, overriding or reading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {origin}: {source}")]
    ParseFailed {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Configuration root must be a mapping")]
    NotAMapping,

    #[error("Missing required configuration field '{key}'")]
    MissingField { key: String },

    #[error("Configuration field '{key}' is malformed: expected {expected}")]
    Malformed { key: String, expected: &'static str },

    #[error("Invalid override '{raw}': {reason}")]
    InvalidOverride { raw: String, reason: String },

    #[error("Could not override '{key}': key not in config (use +{key}=... to add it)")]
    OverrideUnknownKey { key: String },

    #[error("Could not append '{key}': key already in config (use ++{key}=... to override it)")]
    OverrideKeyExists { key: String },

    #[error("main.steps is empty; use \"all\" or a comma-separated list of step names")]
    EmptyStepList,

    #[error("Artifact reference '{reference}' for step {step} is malformed: {reason}")]
    InvalidArtifactRef {
        step: Step,
        reference: String,
        reason: &'static str,
    },

    #[error("Failed to load settings from {path}: {message}")]
    InvalidSettings { path: PathBuf, message: String },
}

/// Errors from a single step invocation.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Failed to spawn '{command}' for step {step}: {source}")]
    SpawnFailed {
        step: Step,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Step {step} exited with non-zero code {exit_code}{}", format_tail(.stderr_tail))]
    NonZeroExit {
        step: Step,
        exit_code: i32,
        stderr_tail: Vec<String>,
    },

    #[error("I/O error while running step {step}: {source}")]
    Io {
        step: Step,
        #[source]
        source: std::io::Error,
    },

    #[error("Interrupted while running step {step}")]
    Interrupted { step: Step },
}

impl StepError {
    /// The step this error belongs to.
    pub fn step(&self) -> Step {
        match self {
            StepError::SpawnFailed { step, .. }
            | StepError::NonZeroExit { step, .. }
            | StepError::Io { step, .. }
            | StepError::Interrupted { step } => *step,
        }
    }
}

fn format_tail(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!("\n  stderr:\n    {}", lines.join("\n    "))
    }
}

/// Errors from a pipeline run as a whole.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error("Failed to prepare scratch file {path}: {source}")]
    Scratch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to record run history: {0}")]
    Audit(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Process exit code for this error: 2 for configuration problems, 130 for
    /// an interrupt, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Step(StepError::Interrupted { .. }) => 130,
            _ => 1,
        }
    }
}
