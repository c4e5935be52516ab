//! Pipeline steps and step selection.
//!
//! This module provides:
//! - `Step`, the fixed set of pipeline steps in canonical order
//! - `ActiveSteps`, the steps selected by `main.steps` for one run
//!
//! Execution always follows [`Step::CANONICAL`]; the order in which steps are
//! listed in `main.steps` only decides membership.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Sentinel value of `main.steps` selecting every default step.
pub const ALL_STEPS: &str = "all";

/// A single pipeline step, run as an independent mlflow project.
///
/// Variant order is canonical order, so `Ord` sorts steps the way they run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Download,
    BasicCleaning,
    DataCheck,
    DataSplit,
    TrainRandomForest,
    TestRegressionModel,
}

/// Where a step's mlflow project lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentSource {
    /// Sub-directory of `main.components_repository`, pinned to a branch.
    Repository {
        subdir: &'static str,
        version: &'static str,
    },
    /// Path relative to the project directory.
    Local { path: &'static str },
}

impl Step {
    /// Every step, in execution order.
    pub const CANONICAL: [Step; 6] = [
        Step::Download,
        Step::BasicCleaning,
        Step::DataCheck,
        Step::DataSplit,
        Step::TrainRandomForest,
        Step::TestRegressionModel,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Download => "download",
            Step::BasicCleaning => "basic_cleaning",
            Step::DataCheck => "data_check",
            Step::DataSplit => "data_split",
            Step::TrainRandomForest => "train_random_forest",
            Step::TestRegressionModel => "test_regression_model",
        }
    }

    /// Whether `main.steps=all` selects this step.
    ///
    /// The regression test needs a model export promoted to `prod` first,
    /// so it only runs when named explicitly.
    pub fn in_default_set(self) -> bool {
        !matches!(self, Step::TestRegressionModel)
    }

    /// Steps selected by `main.steps=all`, in canonical order.
    pub fn default_steps() -> impl Iterator<Item = Step> {
        Self::CANONICAL.into_iter().filter(|s| s.in_default_set())
    }

    pub fn component(self) -> ComponentSource {
        match self {
            Step::Download => ComponentSource::Repository {
                subdir: "get_data",
                version: "main",
            },
            Step::DataSplit => ComponentSource::Repository {
                subdir: "train_val_test_split",
                version: "main",
            },
            Step::BasicCleaning => ComponentSource::Local {
                path: "src/basic_cleaning",
            },
            Step::DataCheck => ComponentSource::Local {
                path: "src/data_check",
            },
            Step::TrainRandomForest => ComponentSource::Local {
                path: "src/train_random_forest",
            },
            Step::TestRegressionModel => ComponentSource::Local {
                path: "components/test_regression_model",
            },
        }
    }

    /// Environment manager the step insists on, if any.
    pub fn env_manager(self) -> Option<&'static str> {
        match self {
            Step::Download => Some("conda"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for Step {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::CANONICAL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown step '{}'. Valid steps: {}",
                    s,
                    Self::CANONICAL.map(Step::as_str).join(", ")
                )
            })
    }
}

/// The steps selected for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveSteps {
    steps: BTreeSet<Step>,
    unknown: Vec<String>,
}

impl ActiveSteps {
    /// Resolve a raw `main.steps` value.
    ///
    /// `"all"` selects the default set. Anything else is a comma-separated
    /// list; entries are trimmed, empty entries dropped, and names that are not
    /// steps are remembered in [`Self::unknown`] but otherwise ignored.
    pub fn resolve(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw == ALL_STEPS {
            return Ok(Self {
                steps: Step::default_steps().collect(),
                unknown: Vec::new(),
            });
        }
        Self::from_names(raw.split(','))
    }

    /// Resolve a list of step names (the YAML sequence form of `main.steps`).
    ///
    /// Unlike [`Self::resolve`], `"all"` is not special here.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
        let mut active = Self::default();
        let mut any = false;

        for name in names.into_iter().map(str::trim).filter(|n| !n.is_empty()) {
            any = true;
            match name.parse::<Step>() {
                Ok(step) => {
                    active.steps.insert(step);
                }
                Err(_) => {
                    if !active.unknown.iter().any(|u| u == name) {
                        active.unknown.push(name.to_string());
                    }
                }
            }
        }

        if !any {
            return Err(ConfigError::EmptyStepList);
        }
        Ok(active)
    }

    pub fn contains(&self, step: Step) -> bool {
        self.steps.contains(&step)
    }

    /// Selected steps in canonical order.
    pub fn in_canonical_order(&self) -> impl Iterator<Item = Step> + '_ {
        Step::CANONICAL
            .into_iter()
            .filter(move |step| self.contains(*step))
    }

    /// Names in `main.steps` that matched no step.
    pub fn unknown(&self) -> &[String] {
        &self.unknown
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
