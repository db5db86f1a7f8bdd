//! Pipeline stage definitions and timing.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use meshbench_core::{obs, Result};
use serde::{Deserialize, Serialize};

/// Forward stages of a run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Topology → service-graph and client manifests.
    GenerateManifests,

    /// Rewrite the monitoring configuration with this run's labels.
    ConfigureMonitoring,

    /// Install the mesh (mesh environment only).
    SetUpEnvironment,

    /// Create the workload namespace and objects.
    DeployWorkload,

    /// Rollouts complete and every service pod ready.
    WaitForWorkload,

    /// Fixed buffer before load is issued.
    Settle,

    /// Deploy the client and wait until it can be driven.
    DeployClient,

    LoadTest,

    PersistResult,

    /// Let the monitoring system scrape the final data point.
    ScrapeDelay,
}

impl PipelineStage {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::GenerateManifests => "generate_manifests",
            PipelineStage::ConfigureMonitoring => "configure_monitoring",
            PipelineStage::SetUpEnvironment => "set_up_environment",
            PipelineStage::DeployWorkload => "deploy_workload",
            PipelineStage::WaitForWorkload => "wait_for_workload",
            PipelineStage::Settle => "settle",
            PipelineStage::DeployClient => "deploy_client",
            PipelineStage::LoadTest => "load_test",
            PipelineStage::PersistResult => "persist_result",
            PipelineStage::ScrapeDelay => "scrape_delay",
        }
    }
}

/// How long a stage took and whether it succeeded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub duration_ms: u64,
    pub success: bool,
}

/// Collects stage timings for one run.
#[derive(Debug, Default)]
pub struct StageLog {
    timings: Mutex<Vec<StageTiming>>,
}

impl StageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: PipelineStage, elapsed: Duration, success: bool) {
        let duration_ms = elapsed.as_millis() as u64;
        obs::emit_stage_finished(stage.name(), duration_ms, success);
        if let Ok(mut timings) = self.timings.lock() {
            timings.push(StageTiming {
                stage,
                duration_ms,
                success,
            });
        }
    }

    /// Run `fut` as `stage`, emitting start/finish events.
    pub async fn time<T, Fut>(&self, stage: PipelineStage, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        obs::emit_stage_started(stage.name());
        let start = Instant::now();
        let result = fut.await;
        self.record(stage, start.elapsed(), result.is_ok());
        result
    }

    /// Start `stage` whose end is observed elsewhere, e.g. inside a scope body.
    ///
    /// The returned guard records a failure if dropped without [`StageGuard::finish`].
    pub fn start(&self, stage: PipelineStage) -> StageGuard<'_> {
        obs::emit_stage_started(stage.name());
        StageGuard {
            log: self,
            stage,
            start: Instant::now(),
            finished: false,
        }
    }

    pub fn timings(&self) -> Vec<StageTiming> {
        self.timings
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    /// The stage that failed, if any.
    pub fn failed_stage(&self) -> Option<PipelineStage> {
        self.timings()
            .into_iter()
            .find(|t| !t.success)
            .map(|t| t.stage)
    }
}

/// An in-flight stage. See [`StageLog::start`].
pub struct StageGuard<'a> {
    log: &'a StageLog,
    stage: PipelineStage,
    start: Instant,
    finished: bool,
}

impl StageGuard<'_> {
    pub fn finish(mut self) {
        self.finished = true;
        self.log.record(self.stage, self.start.elapsed(), true);
    }
}

impl Drop for StageGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.log.record(self.stage, self.start.elapsed(), false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbench_core::Error;

    #[test]
    fn test_stage_names() {
        assert_eq!(PipelineStage::GenerateManifests.name(), "generate_manifests");
        assert_eq!(PipelineStage::WaitForWorkload.name(), "wait_for_workload");
        assert_eq!(PipelineStage::ScrapeDelay.name(), "scrape_delay");
    }

    #[tokio::test]
    async fn test_time_records_outcome() {
        let log = StageLog::new();
        let ok: Result<u8> = log.time(PipelineStage::Settle, async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);
        let err: Result<()> = log
            .time(PipelineStage::LoadTest, async {
                Err(Error::LoadTest("empty body".into()))
            })
            .await;
        assert!(err.is_err());

        let timings = log.timings();
        assert_eq!(timings.len(), 2);
        assert!(timings[0].success);
        assert!(!timings[1].success);
        assert_eq!(log.failed_stage(), Some(PipelineStage::LoadTest));
    }

    #[test]
    fn test_guard_records_failure_when_dropped() {
        let log = StageLog::new();
        log.start(PipelineStage::SetUpEnvironment).finish();
        drop(log.start(PipelineStage::DeployWorkload));

        let timings = log.timings();
        assert_eq!(timings.len(), 2);
        assert!(timings[0].success);
        assert_eq!(timings[1].stage, PipelineStage::DeployWorkload);
        assert!(!timings[1].success);
    }
}
