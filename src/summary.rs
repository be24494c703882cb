//! Run summary - serializable snapshot of finished runs

use crate::core::{PoolOutcome, RunId, RunState, ShellRun};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One run as reported after completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub print_prefix: String,
    pub command: String,
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl From<&ShellRun> for RunSummary {
    fn from(run: &ShellRun) -> Self {
        let started_at = run.started_at();
        let ended_at = run.ended_at();
        Self {
            id: run.id(),
            print_prefix: run.config().print_prefix().to_string(),
            command: run.config().command().to_string(),
            state: run.state(),
            exit_code: run.exit_code(),
            attempts: run.attempt(),
            error: run.error().map(|e| e.to_string()),
            started_at,
            ended_at,
            duration_ms: started_at
                .zip(ended_at)
                .map(|(start, end)| (end - start).num_milliseconds()),
        }
    }
}

/// Outcome of a pool wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub generated_at: DateTime<Utc>,
    pub ok: usize,
    pub failed: usize,
    pub runs: Vec<RunSummary>,
}

impl PoolSummary {
    /// Summaries in submission order, regardless of outcome
    pub fn from_outcome(outcome: &PoolOutcome) -> Self {
        let mut runs: Vec<RunSummary> = outcome
            .ok
            .iter()
            .map(|run| RunSummary::from(run.as_ref()))
            .chain(outcome.errors.iter().map(|(_, run)| RunSummary::from(run.as_ref())))
            .collect();
        runs.sort_by_key(|run| run.id);

        Self {
            generated_at: Utc::now(),
            ok: outcome.ok.len(),
            failed: outcome.errors.len(),
            runs,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize pool summary")
    }

    /// Write the summary as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        log::debug!("Summary saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read summary {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse summary")
    }
}
