//! meshbench-pipeline: experiment orchestration
//!
//! Takes a topology through manifest generation, monitoring relabeling, an
//! optional mesh install, workload deployment, a load test and teardown, and
//! reports the outcome of every run in a batch.

pub mod generator;
pub mod load;
pub mod monitoring;
pub mod pipeline;
pub mod report;
pub mod spec;
pub mod stage;

pub use generator::{CommandGenerator, GenerateRequest, GeneratedManifests, ManifestGenerator};
pub use load::{FortioClient, LoadGenerator, LoadTestRequest};
pub use monitoring::{MonitoringConfigurator, MonitoringRenderer, PrometheusValues, ScrapeTarget};
pub use pipeline::{EnvironmentFactory, MeshFactory, Pipeline};
pub use report::{BatchReport, RunReport};
pub use spec::PipelineRun;
pub use stage::{PipelineStage, StageGuard, StageLog, StageTiming};
