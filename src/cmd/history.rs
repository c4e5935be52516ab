//! Run history: `mlpipe history`.

use anyhow::Result;
use console::style;
use std::path::Path;
use tracing::warn;

use mlpipe::audit::{AuditLogger, RunOutcome};
use mlpipe::ui::icons::{CHECK, CROSS, RUNNING};

use super::read_settings;

pub fn cmd_history(project_dir: &Path, limit: usize) -> Result<()> {
    let settings = read_settings(project_dir)?;
    let audit_dir = settings.audit_dir(project_dir);
    let mut logger = AuditLogger::new(&audit_dir);

    if logger.load_current()?
        && let Some(run) = logger.current_run()
    {
        println!(
            "{}{} started {} ({} step(s) so far, not finished)",
            RUNNING,
            &run.run_id.to_string()[..8],
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.steps.len()
        );
    }

    let runs = logger.list_runs()?;
    if runs.is_empty() {
        println!("No recorded runs in {}", audit_dir.display());
        return Ok(());
    }

    for path in runs.iter().take(limit) {
        let run = match logger.load_run(path) {
            Ok(run) => run,
            Err(e) => {
                warn!(path = %path.display(), "skipping unreadable run record: {:#}", e);
                continue;
            }
        };

        let (icon, status) = match run.outcome {
            RunOutcome::Completed => (CHECK, style("completed".to_string()).green()),
            RunOutcome::Failed {
                step: Some(step), ..
            } => (CROSS, style(format!("failed at {}", step)).red()),
            RunOutcome::Failed { step: None, .. } => (CROSS, style("failed".to_string()).red()),
            RunOutcome::InProgress => (RUNNING, style("interrupted".to_string()).yellow()),
        };
        let steps: Vec<String> = run.succeeded_steps().map(|s| s.to_string()).collect();

        println!(
            "{}{} {} {:<12} {} [{}] {}",
            icon,
            &run.run_id.to_string()[..8],
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.context.experiment_name,
            status,
            run.context.requested_steps,
            style(steps.join(" → ")).dim()
        );
    }

    if runs.len() > limit {
        println!("... {} older run(s) not shown", runs.len() - limit);
    }
    Ok(())
}
