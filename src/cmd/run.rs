//! Pipeline execution: `mlpipe run`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use mlpipe::launcher::{DryRunLauncher, MlflowLauncher, StepLauncher};
use mlpipe::logging::LogFormat;
use mlpipe::pipeline::Pipeline;
use mlpipe::ui::PipelineUI;
use mlpipe::ui::icons::SPARKLE;
use mlpipe::ui::progress::format_elapsed;

use super::super::Cli;
use super::{load_config, load_settings};

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    overrides: &[String],
    dry_run: bool,
) -> Result<()> {
    let settings = load_settings(project_dir)?;
    let config = load_config(cli, project_dir, overrides)?;

    // JSON logs carry everything the UI would show.
    let ui = match cli.log_format {
        LogFormat::Text => Some(Arc::new(PipelineUI::new(0, cli.verbose))),
        LogFormat::Json => None,
    };

    let launcher: Box<dyn StepLauncher> = if dry_run {
        if let Some(ref ui) = ui {
            ui.dry_run_notice();
        }
        Box::new(DryRunLauncher::from_settings(&settings))
    } else {
        let launcher = MlflowLauncher::from_settings(&settings);
        match ui {
            Some(ref ui) => Box::new(launcher.with_ui(Arc::clone(ui))),
            None => Box::new(launcher),
        }
    };

    let mut pipeline = Pipeline::new(config, project_dir, launcher)
        .with_settings(settings)
        .with_overrides(overrides.to_vec());
    if let Some(ui) = ui {
        pipeline = pipeline.with_ui(ui);
    }
    if dry_run {
        pipeline = pipeline.without_audit();
    }

    let report = pipeline.run().await?;

    if dry_run {
        return Ok(());
    }

    println!(
        "{}{} step(s) complete (run {})",
        SPARKLE,
        report.executed.len(),
        &report.run_id.to_string()[..8]
    );
    for executed in &report.executed {
        println!(
            "  {:<24} {}",
            executed.step,
            style(format_elapsed(executed.duration)).dim()
        );
    }
    if let Some(ref path) = report.record_path {
        println!("Run record: {}", path.display());
    }
    Ok(())
}
