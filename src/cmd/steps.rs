//! Step listing: `mlpipe steps`.

use anyhow::Result;
use console::style;

use mlpipe::step::{ALL_STEPS, ComponentSource, Step};

pub fn cmd_steps() -> Result<()> {
    println!("Pipeline steps, in execution order:");
    println!();
    for (i, step) in Step::CANONICAL.into_iter().enumerate() {
        let location = match step.component() {
            ComponentSource::Repository { subdir, version } => {
                format!("<components_repository>/{}@{}", subdir, version)
            }
            ComponentSource::Local { path } => path.to_string(),
        };
        let membership = if step.in_default_set() {
            style(format!("in \"{}\"", ALL_STEPS)).green()
        } else {
            style("explicit only".to_string()).yellow()
        };
        println!("{:>2}. {:<24} {:<16} {}", i + 1, step, membership, location);
    }
    Ok(())
}
