use crate::step::Step;
use crate::ui::icons::{CHECK, CLOCK, CROSS, DRY_RUN, RUNNING, SKIPPED, SPARKLE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

/// Terminal UI for a pipeline run, rendered via an `indicatif` progress bar.
///
/// A single step bar tracks how many of the active steps have finished; child
/// process output and step results are printed above it.
pub struct PipelineUI {
    multi: MultiProgress,
    step_bar: ProgressBar,
    verbose: bool,
    enabled: bool,
}

impl PipelineUI {
    /// Create the UI with a bar sized for `total_steps`.
    ///
    /// When `verbose` is set, the child's stdout is echoed as well as its stderr.
    pub fn new(total_steps: u64, verbose: bool) -> Self {
        Self::with_target(total_steps, verbose, ProgressDrawTarget::stderr(), true)
    }

    /// A UI that prints nothing. Used for tests and machine-readable log output.
    pub fn hidden() -> Self {
        Self::with_target(0, false, ProgressDrawTarget::hidden(), false)
    }

    fn with_target(
        total_steps: u64,
        verbose: bool,
        target: ProgressDrawTarget,
        enabled: bool,
    ) -> Self {
        let multi = MultiProgress::with_draw_target(target);

        let step_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let step_bar = multi.add(ProgressBar::new(total_steps));
        step_bar.set_style(step_style);
        step_bar.set_prefix("Steps");

        Self {
            multi,
            step_bar,
            verbose,
            enabled,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` when stderr
    /// is not a terminal or the rich UI fails.
    pub fn print_line(&self, msg: impl AsRef<str>) {
        if !self.enabled {
            return;
        }
        if self.multi.is_hidden() || self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Resize the step bar once the active step set is known.
    pub fn set_total(&self, total_steps: usize) {
        self.step_bar.set_length(total_steps as u64);
    }

    pub fn start_step(&self, step: Step) {
        self.step_bar
            .set_message(format!("{}{}", RUNNING, style(step).yellow()));
        self.print_line(format!("{}{}", RUNNING, style(step).bold()));
    }

    /// Echo one line of child output, indented under the running step.
    ///
    /// stderr lines are always shown; stdout only in verbose mode.
    pub fn child_line(&self, line: &str, is_stderr: bool) {
        if is_stderr || self.verbose {
            self.print_line(format!("    {} {}", style("│").dim(), style(line).dim()));
        }
    }

    /// Announce that steps will be printed rather than launched.
    pub fn dry_run_notice(&self) {
        self.print_line(format!(
            "{}{}",
            DRY_RUN,
            style("dry run: printing mlflow commands, nothing is launched").cyan()
        ));
    }

    pub fn step_succeeded(&self, step: Step, elapsed: Duration) {
        self.step_bar.inc(1);
        self.print_line(format!(
            "{}{} {}",
            CHECK,
            style(step).green(),
            style(format!("{}{}", CLOCK, format_elapsed(elapsed))).dim()
        ));
    }

    pub fn step_failed(&self, step: Step, message: &str) {
        self.step_bar.abandon_with_message(format!("{}{}", CROSS, style(step).red()));
        self.print_line(format!("{}{}: {}", CROSS, style(step).red().bold(), message));
    }

    /// Note that `main.steps` named something that is not a step.
    pub fn unknown_step(&self, name: &str) {
        self.print_line(format!(
            "{}{}",
            SKIPPED,
            style(format!("ignoring unknown step '{}'", name)).yellow()
        ));
    }

    /// Finish the step bar after every active step succeeded.
    pub fn finish(&self, executed: usize) {
        self.step_bar.finish_with_message(format!(
            "{}{} step(s) complete",
            SPARKLE, executed
        ));
    }
}

/// Formats as `Xs` or `Xm Ys` when >= 60 seconds.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}
