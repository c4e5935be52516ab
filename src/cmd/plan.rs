//! Run preview: `mlpipe plan`.

use anyhow::Result;
use console::style;
use std::path::Path;

use mlpipe::artifact::Handoff;
use mlpipe::launcher::DryRunLauncher;
use mlpipe::pipeline::Pipeline;

use super::super::Cli;
use super::{load_config, load_settings};

pub fn cmd_plan(cli: &Cli, project_dir: &Path, overrides: &[String]) -> Result<()> {
    let settings = load_settings(project_dir)?;
    let config = load_config(cli, project_dir, overrides)?;
    let launcher = DryRunLauncher::from_settings(&settings);
    let pipeline = Pipeline::new(config, project_dir, Box::new(launcher.clone()))
        .with_settings(settings)
        .without_audit();

    let plan = pipeline.plan()?;

    println!(
        "{} {} (main.steps = {:?})",
        style("Plan").bold(),
        plan.environment.project_name,
        plan.requested
    );
    println!(
        "  WANDB_PROJECT={} WANDB_RUN_GROUP={}",
        plan.environment.project_name, plan.environment.run_group
    );
    println!();

    if plan.invocations.is_empty() {
        println!("No steps selected.");
    }
    for (i, inv) in plan.invocations.iter().enumerate() {
        println!("{:>2}. {}", i + 1, style(inv.step).bold());
        println!("    {}", launcher.command_line(inv, &plan.environment));
    }

    let handoffs = plan.handoffs();
    if !handoffs.is_empty() {
        println!();
        println!("{}", style("Inputs").bold());
        for note in &handoffs {
            let source = match note.handoff {
                Handoff::ProducedThisRun { producer } => {
                    style(format!("produced by {} in this run", producer)).green()
                }
                Handoff::ExpectedInStore {
                    producer: Some(producer),
                } => style(format!(
                    "must already be in the artifact store (producer {} not running)",
                    producer
                ))
                .yellow(),
                Handoff::ExpectedInStore { producer: None } => {
                    style("must already be in the artifact store".to_string()).yellow()
                }
            };
            println!(
                "  {:<24} {:<18} {:<32} {}",
                note.consumer,
                note.parameter,
                note.input.to_string(),
                source
            );
        }
    }

    if !plan.active.unknown().is_empty() {
        println!();
        println!(
            "{} {}",
            style("Ignored unknown step names:").yellow(),
            plan.active.unknown().join(", ")
        );
    }

    Ok(())
}
