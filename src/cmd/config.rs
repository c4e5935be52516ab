//! Configuration view: `mlpipe config`.

use anyhow::{Context, Result};
use std::path::Path;

use mlpipe::config::ConfigTree;
use mlpipe::settings::SETTINGS_FILE;

use super::super::Cli;
use super::{config_dir, load_config, read_settings};

/// Print the composed configuration as YAML.
///
/// Driver settings are summarized in trailing comments so the output stays
/// valid YAML.
pub fn cmd_config(cli: &Cli, project_dir: &Path, overrides: &[String]) -> Result<()> {
    let config = load_config(cli, project_dir, overrides)?;
    let settings = read_settings(project_dir)?;

    let source = ConfigTree::locate(&config_dir(cli, project_dir), &cli.config_name);
    println!("# source: {}", source.display());
    for ov in overrides {
        println!("# override: {}", ov);
    }
    print!("{}", config.to_yaml().context("Failed to render configuration")?);

    let settings_path = project_dir.join(SETTINGS_FILE);
    println!();
    if settings_path.exists() {
        println!("# settings: {}", settings_path.display());
    } else {
        println!("# settings: defaults ({} not found)", SETTINGS_FILE);
    }
    println!("# mlflow command: {}", settings.mlflow_cmd());
    if let Some(ref manager) = settings.launcher.env_manager {
        println!("# default env manager: {}", manager);
    }
    println!(
        "# audit: {}",
        if settings.audit.enabled {
            settings.audit_dir(project_dir).display().to_string()
        } else {
            "disabled".to_string()
        }
    );

    let warnings = settings.validate();
    if warnings.is_empty() {
        println!("# settings are valid");
    }
    for warning in warnings {
        println!("# warning: {}", warning);
    }
    Ok(())
}
