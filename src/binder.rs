//! Per-step parameter binding.
//!
//! Each step component has a fixed parameter contract. The binder fills it from
//! configuration fields and from the artifact naming conventions in
//! [`crate::artifact`], producing a [`StepInvocation`] ready to hand to a launcher.
//!
//! The training step additionally needs `modeling.random_forest` as a JSON file.
//! That file is created in the run's scratch directory and owned by the
//! invocation, so it is removed as soon as the invocation is dropped.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::TempPath;

use crate::artifact::{
    ArtifactRef, CLEAN_SAMPLE, LATEST, MODEL_EXPORT, PROD, RAW_SAMPLE, TEST_DATA, TRAINVAL_DATA,
};
use crate::config::ConfigTree;
use crate::errors::{ConfigError, PipelineError};
use crate::step::{ComponentSource, Step};

/// mlflow entry point used by every component.
pub const ENTRY_POINT: &str = "main";

/// Ordered parameter mapping passed to one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepParameters(Map<String, Value>);

impl StepParameters {
    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `name=value` pairs in insertion order, values rendered for a command line.
    pub fn to_cli_pairs(&self) -> Vec<String> {
        self.iter()
            .map(|(name, value)| format!("{}={}", name, render_value(value)))
            .collect()
    }
}

/// Render a parameter value the way it is passed on the command line.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// An artifact a step reads, and the parameter that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundInput {
    pub parameter: String,
    pub artifact: ArtifactRef,
}

/// Everything needed to launch one step.
#[derive(Debug)]
pub struct StepInvocation {
    pub step: Step,
    /// mlflow project URI (repository sub-directory or local path)
    pub uri: String,
    pub entry_point: &'static str,
    /// Git version for repository components
    pub version: Option<&'static str>,
    /// Environment manager pinned by the step, if any
    pub env_manager: Option<&'static str>,
    pub parameters: StepParameters,
    /// Artifacts this step reads from the store, with the parameter naming each
    pub inputs: Vec<BoundInput>,
    /// Artifact names this step registers in the store
    pub outputs: Vec<String>,
    scratch_files: Vec<TempPath>,
}

impl StepInvocation {
    fn new(step: Step, uri: String) -> Self {
        let version = match step.component() {
            ComponentSource::Repository { version, .. } => Some(version),
            ComponentSource::Local { .. } => None,
        };
        Self {
            step,
            uri,
            entry_point: ENTRY_POINT,
            version,
            env_manager: step.env_manager(),
            parameters: StepParameters::default(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            scratch_files: Vec::new(),
        }
    }

    /// Temporary files kept alive for this invocation.
    pub fn scratch_files(&self) -> impl Iterator<Item = &Path> {
        self.scratch_files.iter().map(|p| &**p)
    }
}

/// Fail unless `artifact` renders to a reference that parses back to itself.
pub fn check_reference(step: Step, artifact: &ArtifactRef) -> Result<(), ConfigError> {
    let reference = artifact.to_string();
    let invalid = |reason| ConfigError::InvalidArtifactRef {
        step,
        reference: reference.clone(),
        reason,
    };
    let parsed = ArtifactRef::parse(&reference).map_err(invalid)?;
    if &parsed != artifact {
        return Err(invalid("alias contains ':'"));
    }
    Ok(())
}

/// Builds [`StepInvocation`]s from the configuration tree.
pub struct ParameterBinder<'a> {
    config: &'a ConfigTree,
    project_dir: &'a Path,
    scratch_dir: &'a Path,
    validate_refs: bool,
}

impl<'a> ParameterBinder<'a> {
    pub fn new(config: &'a ConfigTree, project_dir: &'a Path, scratch_dir: &'a Path) -> Self {
        Self {
            config,
            project_dir,
            scratch_dir,
            validate_refs: true,
        }
    }

    /// Enable or disable the artifact reference check.
    ///
    /// Inputs are built from the fixed naming table in [`crate::artifact`], so
    /// the check guards that table: every name and alias must survive a
    /// render-then-parse round trip unchanged.
    pub fn with_ref_validation(mut self, enabled: bool) -> Self {
        self.validate_refs = enabled;
        self
    }

    /// Build the invocation for `step`.
    ///
    /// Fails with [`ConfigError::MissingField`] or [`ConfigError::Malformed`]
    /// when a configuration field the step needs is absent or not a scalar.
    pub fn bind(&self, step: Step) -> Result<StepInvocation, PipelineError> {
        let mut inv = StepInvocation::new(step, self.component_uri(step)?);

        match step {
            Step::Download => {
                self.from_config(&mut inv, "sample", "etl.sample")?;
                self.output(&mut inv, "artifact_name", RAW_SAMPLE);
                inv.parameters.insert("artifact_type", "raw_data");
                inv.parameters
                    .insert("artifact_description", "Raw file as downloaded");
            }
            Step::BasicCleaning => {
                self.input(&mut inv, "input_artifact", RAW_SAMPLE, LATEST)?;
                self.output(&mut inv, "output_artifact", CLEAN_SAMPLE);
                inv.parameters.insert("output_type", "clean_sample");
                inv.parameters.insert(
                    "output_description",
                    "Data with outliers and null values removed",
                );
                self.from_config(&mut inv, "min_price", "etl.min_price")?;
                self.from_config(&mut inv, "max_price", "etl.max_price")?;
            }
            Step::DataCheck => {
                self.input(&mut inv, "csv", CLEAN_SAMPLE, LATEST)?;
                self.input(&mut inv, "ref", CLEAN_SAMPLE, LATEST)?;
                self.from_config(&mut inv, "kl_threshold", "data_check.kl_threshold")?;
                self.from_config(&mut inv, "min_price", "etl.min_price")?;
                self.from_config(&mut inv, "max_price", "etl.max_price")?;
            }
            Step::DataSplit => {
                self.input(&mut inv, "input", CLEAN_SAMPLE, LATEST)?;
                self.from_config(&mut inv, "test_size", "modeling.test_size")?;
                self.from_config(&mut inv, "random_seed", "modeling.random_seed")?;
                self.from_config(&mut inv, "stratify_by", "modeling.stratify_by")?;
                // Registered by the component itself, not named by a parameter.
                inv.outputs.push(TRAINVAL_DATA.to_string());
                inv.outputs.push(TEST_DATA.to_string());
            }
            Step::TrainRandomForest => {
                self.input(&mut inv, "trainval_artifact", TRAINVAL_DATA, LATEST)?;
                self.from_config(&mut inv, "val_size", "modeling.val_size")?;
                self.from_config(&mut inv, "random_seed", "modeling.random_seed")?;
                self.from_config(&mut inv, "stratify_by", "modeling.stratify_by")?;
                let rf_config = self.write_rf_config()?;
                inv.parameters
                    .insert("rf_config", rf_config.display().to_string());
                inv.scratch_files.push(rf_config);
                self.from_config(
                    &mut inv,
                    "max_tfidf_features",
                    "modeling.max_tfidf_features",
                )?;
                self.output(&mut inv, "output_artifact", MODEL_EXPORT);
            }
            Step::TestRegressionModel => {
                self.input(&mut inv, "mlflow_model", MODEL_EXPORT, PROD)?;
                self.input(&mut inv, "test_dataset", TEST_DATA, LATEST)?;
            }
        }

        Ok(inv)
    }

    fn component_uri(&self, step: Step) -> Result<String, ConfigError> {
        match step.component() {
            ComponentSource::Repository { subdir, .. } => {
                let repository = self.config.require_str("main.components_repository")?;
                Ok(format!("{}/{}", repository.trim_end_matches('/'), subdir))
            }
            ComponentSource::Local { path } => Ok(self.project_dir.join(path).display().to_string()),
        }
    }

    fn from_config(
        &self,
        inv: &mut StepInvocation,
        name: &str,
        key: &str,
    ) -> Result<(), ConfigError> {
        let value = self.config.require_scalar(key)?;
        inv.parameters.insert(name, value.clone());
        Ok(())
    }

    fn input(
        &self,
        inv: &mut StepInvocation,
        name: &str,
        artifact: &str,
        alias: &str,
    ) -> Result<(), ConfigError> {
        let artifact = ArtifactRef::new(artifact, alias);
        if self.validate_refs {
            check_reference(inv.step, &artifact)?;
        }
        inv.parameters.insert(name, artifact.to_string());
        inv.inputs.push(BoundInput {
            parameter: name.to_string(),
            artifact,
        });
        Ok(())
    }

    fn output(&self, inv: &mut StepInvocation, name: &str, artifact: &str) {
        inv.outputs.push(artifact.to_string());
        inv.parameters.insert(name, artifact);
    }

    /// Serialize `modeling.random_forest` to a fresh JSON file in the scratch dir.
    fn write_rf_config(&self) -> Result<TempPath, PipelineError> {
        let forest = self.config.require_mapping("modeling.random_forest")?;
        let scratch_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| PipelineError::Scratch { path, source }
        };

        // The path is handed to another process, so it must not be relative.
        let dir = std::path::absolute(self.scratch_dir).map_err(scratch_err(self.scratch_dir))?;
        let mut file = tempfile::Builder::new()
            .prefix("rf_config_")
            .suffix(".json")
            .tempfile_in(&dir)
            .map_err(scratch_err(&dir))?;

        serde_json::to_writer(&mut file, forest)
            .map_err(std::io::Error::from)
            .map_err(scratch_err(file.path()))?;
        file.flush().map_err(scratch_err(file.path()))?;

        Ok(file.into_temp_path())
    }
}
