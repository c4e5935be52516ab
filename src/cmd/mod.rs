//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `run`     | `Run`            |
//! | `plan`    | `Plan`           |
//! | `steps`   | `Steps`          |
//! | `config`  | `Config`         |
//! | `history` | `History`        |

pub mod config;
pub mod history;
pub mod plan;
pub mod run;
pub mod steps;

pub use config::cmd_config;
pub use history::cmd_history;
pub use plan::cmd_plan;
pub use run::cmd_run;
pub use steps::cmd_steps;

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use mlpipe::config::ConfigTree;
use mlpipe::errors::ConfigError;
use mlpipe::settings::{SETTINGS_FILE, Settings};

use super::Cli;

/// Read `mlpipe.toml`, reporting failures as configuration errors.
pub fn read_settings(project_dir: &Path) -> Result<Settings> {
    Settings::load_or_default(project_dir).map_err(|e| {
        anyhow::Error::new(ConfigError::InvalidSettings {
            path: project_dir.join(SETTINGS_FILE),
            message: format!("{:#}", e),
        })
    })
}

/// Read `mlpipe.toml` and log any validation warnings.
pub fn load_settings(project_dir: &Path) -> Result<Settings> {
    let settings = read_settings(project_dir)?;
    for warning in settings.validate() {
        warn!("{}", warning);
    }
    Ok(settings)
}

pub fn config_dir(cli: &Cli, project_dir: &Path) -> PathBuf {
    cli.config_dir
        .clone()
        .unwrap_or_else(|| project_dir.to_path_buf())
}

/// Load the pipeline configuration and apply command-line overrides.
pub fn load_config(cli: &Cli, project_dir: &Path, overrides: &[String]) -> Result<ConfigTree> {
    let dir = config_dir(cli, project_dir);
    let path = ConfigTree::locate(&dir, &cli.config_name);
    debug!(path = %path.display(), overrides = overrides.len(), "loading configuration");
    Ok(ConfigTree::compose(&dir, &cli.config_name, overrides)?)
}
