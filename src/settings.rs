//! Driver settings for mlpipe.
//!
//! These settings describe how the driver runs, not what the pipeline does, and
//! are read from an optional `mlpipe.toml` in the project directory:
//!
//! ```toml
//! [launcher]
//! command = "mlflow"
//! env_manager = "conda"
//! stderr_tail_lines = 20
//!
//! [audit]
//! enabled = true
//! dir = ".mlpipe/audit"
//!
//! [validation]
//! artifact_refs = true
//! ```
//!
//! Layering is file, then environment (`MLFLOW_CMD`), then built-in defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings file name, looked up in the project directory.
pub const SETTINGS_FILE: &str = "mlpipe.toml";

/// Environment managers `mlflow run --env-manager` accepts.
pub const ENV_MANAGERS: &[&str] = &["local", "conda", "virtualenv", "uv"];

/// How step components are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherSection {
    /// mlflow executable (default: `MLFLOW_CMD` or "mlflow")
    #[serde(default)]
    pub command: Option<String>,
    /// Environment manager for steps that do not pin their own
    #[serde(default)]
    pub env_manager: Option<String>,
    /// Number of trailing stderr lines kept for error reports
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

fn default_stderr_tail_lines() -> usize {
    20
}

impl Default for LauncherSection {
    fn default() -> Self {
        Self {
            command: None,
            env_manager: None,
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

/// Run history recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditSection {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Directory for run records, relative to the project directory
    #[serde(default = "default_audit_dir")]
    pub dir: PathBuf,
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from(".mlpipe/audit")
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            dir: default_audit_dir(),
        }
    }
}

/// Checks applied while binding step parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSection {
    /// Check the shape of artifact references before launching anything
    #[serde(default = "default_validate_artifact_refs")]
    pub artifact_refs: bool,
}

fn default_validate_artifact_refs() -> bool {
    true
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            artifact_refs: default_validate_artifact_refs(),
        }
    }
}

/// The complete mlpipe.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub launcher: LauncherSection,
    #[serde(default)]
    pub audit: AuditSection,
    #[serde(default)]
    pub validation: ValidationSection,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse mlpipe.toml")
    }

    /// Load `mlpipe.toml` from the project directory, or defaults if it is absent.
    pub fn load_or_default(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(SETTINGS_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// The mlflow command, falling back to `MLFLOW_CMD` and then "mlflow".
    pub fn mlflow_cmd(&self) -> String {
        self.launcher
            .command
            .clone()
            .or_else(|| std::env::var("MLFLOW_CMD").ok())
            .unwrap_or_else(|| "mlflow".to_string())
    }

    /// Absolute audit directory for a project.
    pub fn audit_dir(&self, project_dir: &Path) -> PathBuf {
        if self.audit.dir.is_absolute() {
            self.audit.dir.clone()
        } else {
            project_dir.join(&self.audit.dir)
        }
    }

    /// Validate the settings and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Some(ref manager) = self.launcher.env_manager
            && !ENV_MANAGERS.contains(&manager.as_str())
        {
            warnings.push(format!(
                "Unknown launcher.env_manager '{}': expected one of {}",
                manager,
                ENV_MANAGERS.join(", ")
            ));
        }

        if let Some(ref command) = self.launcher.command
            && command.trim().is_empty()
        {
            warnings.push("launcher.command is empty".to_string());
        }

        if self.launcher.stderr_tail_lines == 0 {
            warnings.push(
                "launcher.stderr_tail_lines is 0: step failures will carry no stderr".to_string(),
            );
        }

        warnings
    }
}
