//! The pipeline configuration tree.
//!
//! Configuration lives in `<config-dir>/<config-name>.yaml` and is grouped into
//! sections:
//!
//! ```yaml
//! main:
//!   components_repository: "https://github.com/example/ml-components#components"
//!   project_name: nyc_airbnb
//!   experiment_name: development
//!   steps: all
//! etl:
//!   sample: "sample1.csv"
//!   min_price: 10
//!   max_price: 350
//! data_check:
//!   kl_threshold: 0.2
//! modeling:
//!   test_size: 0.2
//!   val_size: 0.2
//!   random_seed: 42
//!   stratify_by: "neighbourhood_group"
//!   max_tfidf_features: 5
//!   random_forest:
//!     n_estimators: 100
//!     max_depth: 15
//! ```
//!
//! The file is loaded once, command-line overrides are applied on top, and the
//! tree is read-only from then on. Fields are addressed with dotted paths such
//! as `etl.min_price`.

pub mod overrides;

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::errors::ConfigError;

pub use overrides::{Override, OverrideKind};

/// Config file name used when none is given on the command line.
pub const DEFAULT_CONFIG_NAME: &str = "config";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: Map<String, Value>,
}

impl ConfigTree {
    /// Parse a YAML document into a configuration tree.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::parse_with_origin(content, "<inline>")
    }

    fn parse_with_origin(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_yaml::from_str(content).map_err(|source| ConfigError::ParseFailed {
                origin: origin.to_string(),
                source,
            })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            // An empty file is an empty configuration.
            Value::Null => Ok(Self::default()),
            _ => Err(ConfigError::NotAMapping),
        }
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_with_origin(&content, &path.display().to_string())
    }

    /// Find `<config_name>.yaml` (or `.yml`) in `config_dir`.
    ///
    /// A name that already carries an extension is used as-is.
    pub fn locate(config_dir: &Path, config_name: &str) -> PathBuf {
        if Path::new(config_name).extension().is_some() {
            return config_dir.join(config_name);
        }
        let yaml = config_dir.join(format!("{}.yaml", config_name));
        let yml = config_dir.join(format!("{}.yml", config_name));
        if !yaml.exists() && yml.exists() {
            yml
        } else {
            yaml
        }
    }

    /// Load the named config and apply overrides in order.
    pub fn compose<S: AsRef<str>>(
        config_dir: &Path,
        config_name: &str,
        overrides: &[S],
    ) -> Result<Self, ConfigError> {
        let mut tree = Self::load(&Self::locate(config_dir, config_name))?;
        tree.apply_overrides(overrides)?;
        Ok(tree)
    }

    pub fn apply_overrides<S: AsRef<str>>(&mut self, overrides: &[S]) -> Result<(), ConfigError> {
        for raw in overrides {
            let ov = Override::parse(raw.as_ref())?;
            self.apply(&ov)?;
        }
        Ok(())
    }

    /// Apply a single parsed override.
    pub fn apply(&mut self, ov: &Override) -> Result<(), ConfigError> {
        let segments: Vec<&str> = ov.key.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(ConfigError::InvalidOverride {
                raw: ov.key.clone(),
                reason: "empty key".to_string(),
            });
        };

        let create = matches!(ov.kind, OverrideKind::Add | OverrideKind::ForceAdd);
        let parent = walk_mut(&mut self.root, parents, create, &ov.key)?;
        let value = ov.value.clone().unwrap_or(Value::Null);

        match ov.kind {
            OverrideKind::Set => {
                let slot = parent
                    .get_mut(*last)
                    .ok_or_else(|| ConfigError::OverrideUnknownKey {
                        key: ov.key.clone(),
                    })?;
                *slot = value;
            }
            OverrideKind::Add => {
                if parent.contains_key(*last) {
                    return Err(ConfigError::OverrideKeyExists {
                        key: ov.key.clone(),
                    });
                }
                parent.insert(last.to_string(), value);
            }
            OverrideKind::ForceAdd => {
                parent.insert(last.to_string(), value);
            }
            OverrideKind::Delete => {
                if parent.shift_remove(*last).is_none() {
                    return Err(ConfigError::OverrideUnknownKey {
                        key: ov.key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Look up a dotted key path.
    pub fn get(&self, key: &str) -> Option<&Value> {
        let mut segments = key.split('.');
        let mut current = self.root.get(segments.next()?)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    pub fn require(&self, key: &str) -> Result<&Value, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingField {
            key: key.to_string(),
        })
    }

    pub fn require_str(&self, key: &str) -> Result<&str, ConfigError> {
        self.require(key)?
            .as_str()
            .ok_or_else(|| malformed(key, "a string"))
    }

    /// A string, number or boolean. Null and collections are rejected.
    pub fn require_scalar(&self, key: &str) -> Result<&Value, ConfigError> {
        match self.require(key)? {
            v @ (Value::String(_) | Value::Number(_) | Value::Bool(_)) => Ok(v),
            _ => Err(malformed(key, "a string, number or boolean")),
        }
    }

    pub fn require_mapping(&self, key: &str) -> Result<&Map<String, Value>, ConfigError> {
        self.require(key)?
            .as_object()
            .ok_or_else(|| malformed(key, "a mapping"))
    }

    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    /// Render the tree back to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(&self.root)?)
    }
}

fn malformed(key: &str, expected: &'static str) -> ConfigError {
    ConfigError::Malformed {
        key: key.to_string(),
        expected,
    }
}

fn walk_mut<'a>(
    root: &'a mut Map<String, Value>,
    parents: &[&str],
    create: bool,
    full_key: &str,
) -> Result<&'a mut Map<String, Value>, ConfigError> {
    let mut current = root;
    for (depth, segment) in parents.iter().enumerate() {
        if create && !current.contains_key(*segment) {
            current.insert(segment.to_string(), Value::Object(Map::new()));
        }
        current = match current.get_mut(*segment) {
            Some(Value::Object(inner)) => inner,
            Some(_) => return Err(malformed(&parents[..=depth].join("."), "a mapping")),
            None => {
                return Err(ConfigError::OverrideUnknownKey {
                    key: full_key.to_string(),
                });
            }
        };
    }
    Ok(current)
}
