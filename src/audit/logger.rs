use super::{RunContext, RunOutcome, RunRecord, StepOutcome, StepRecord};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub struct AuditLogger {
    audit_dir: PathBuf,
    current_run: Option<RunRecord>,
    current_run_file: PathBuf,
}

impl AuditLogger {
    pub fn new(audit_dir: &Path) -> Self {
        let current_run_file = audit_dir.join("current-run.json");
        Self {
            audit_dir: audit_dir.to_path_buf(),
            current_run: None,
            current_run_file,
        }
    }

    fn runs_dir(&self) -> PathBuf {
        self.audit_dir.join("runs")
    }

    pub fn start_run(&mut self, context: RunContext) -> Result<Uuid> {
        fs::create_dir_all(&self.audit_dir).with_context(|| {
            format!(
                "Failed to create audit directory {}",
                self.audit_dir.display()
            )
        })?;
        let run = RunRecord::new(context);
        let run_id = run.run_id;
        self.current_run = Some(run);
        self.save_current()?;
        Ok(run_id)
    }

    /// Append a step record to the current run.
    ///
    /// Returns an error if no run is active.
    pub fn start_step(&mut self, step: StepRecord) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("start_step called with no active run"))?;
        run.steps.push(step);
        self.save_current()
    }

    /// Close the most recently started step.
    ///
    /// Returns an error if no run is active or it has no steps yet.
    pub fn finish_step(&mut self, outcome: StepOutcome) -> Result<()> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("finish_step called with no active run"))?;
        let step = run
            .steps
            .last_mut()
            .ok_or_else(|| anyhow::anyhow!("finish_step called with no steps in run"))?;
        step.finish(outcome);
        self.save_current()
    }

    /// Finalize the current run and move it to `runs/`.
    pub fn finish_run(&mut self, outcome: RunOutcome) -> Result<PathBuf> {
        let run = self
            .current_run
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("No current run to finish"))?;

        run.finish(outcome);

        let filename = format!(
            "{}_{}.json",
            run.started_at.format("%Y-%m-%dT%H-%M-%S"),
            &run.run_id.to_string()[..8]
        );
        let runs_dir = self.audit_dir.join("runs");
        fs::create_dir_all(&runs_dir)
            .with_context(|| format!("Failed to create {}", runs_dir.display()))?;
        let run_file = runs_dir.join(&filename);

        let json = serde_json::to_string_pretty(&run).context("Failed to serialize run record")?;
        fs::write(&run_file, json).context("Failed to write run record")?;

        if self.current_run_file.exists() {
            fs::remove_file(&self.current_run_file)
                .context("Failed to remove current-run.json after finishing run")?;
        }

        self.current_run = None;
        Ok(run_file)
    }

    pub fn save_current(&self) -> Result<()> {
        if let Some(ref run) = self.current_run {
            let json =
                serde_json::to_string_pretty(&run).context("Failed to serialize current run")?;
            fs::write(&self.current_run_file, json).context("Failed to write current run file")?;
        }
        Ok(())
    }

    /// Load an unfinished run left behind by an interrupted process.
    pub fn load_current(&mut self) -> Result<bool> {
        if self.current_run_file.exists() {
            let content = fs::read_to_string(&self.current_run_file)
                .context("Failed to read current run file")?;
            let run: RunRecord =
                serde_json::from_str(&content).context("Failed to parse current run file")?;
            self.current_run = Some(run);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn current_run(&self) -> Option<&RunRecord> {
        self.current_run.as_ref()
    }

    /// Finished run files, most recent first.
    pub fn list_runs(&self) -> Result<Vec<PathBuf>> {
        let runs_dir = self.runs_dir();
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs: Vec<PathBuf> = fs::read_dir(&runs_dir)
            .with_context(|| format!("Failed to list {}", runs_dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();

        runs.sort();
        runs.reverse();
        Ok(runs)
    }

    pub fn load_run(&self, path: &Path) -> Result<RunRecord> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run record {}", path.display()))?;
        let run: RunRecord = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run record {}", path.display()))?;
        Ok(run)
    }
}
