//! Run and batch reports.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use meshbench_core::{EnvironmentKind, Result};
use serde::{Deserialize, Serialize};

use crate::stage::{PipelineStage, StageTiming};

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub topology: PathBuf,
    pub environment: EnvironmentKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageTiming>,
    pub success: bool,

    /// Result file (server mode) or job log (job mode).
    pub artifact: Option<PathBuf>,

    /// First stage that failed.
    pub failed_stage: Option<PipelineStage>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// All runs of a batch, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub runs: Vec<RunReport>,

    /// Set when the operator aborted before every run was attempted.
    pub cancelled: bool,

    /// Failure deleting the batch's cluster after the runs finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_error: Option<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.runs.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|r| !r.success).count()
    }

    pub fn all_succeeded(&self) -> bool {
        !self.cancelled && self.cluster_error.is_none() && self.failed() == 0
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
