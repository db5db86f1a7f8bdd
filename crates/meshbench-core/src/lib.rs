//! meshbench-core: the building blocks of the benchmark harness.
//!
//! - [`exec`]: the command boundary to `kubectl`, `helm`, `gcloud` and friends
//! - [`poll`]: readiness checks and the cancellable polling loop
//! - [`lifecycle`]: scoped setup/teardown with a teardown policy
//! - [`manifest`]: manifest and namespace scopes
//! - [`cluster`]: ephemeral cluster provisioning
//! - [`config`]: TOML settings

pub mod cluster;
pub mod config;
pub mod error;
pub mod exec;
pub mod fakes;
pub mod lifecycle;
pub mod manifest;
pub mod obs;
pub mod poll;
pub mod telemetry;

pub use cluster::ClusterProvisioner;
pub use config::{ClientMode, EnvironmentKind, Names, Qps, Settings, TimingSettings};
pub use error::{Error, Result};
pub use exec::{CommandExecutor, CommandOutput, CommandSpec, ProcessExecutor};
pub use lifecycle::{with_resource, ResourceHandle, ScopeState, ScopeTracker, TeardownPolicy};
pub use manifest::ManifestScopes;
pub use poll::{
    wait_until, wait_until_all, JobComplete, NamespaceAbsent, PodSetReady, PollConfig, Poller,
    ReadinessCheck, RolloutComplete, ServiceExternalIp,
};
pub use telemetry::init_tracing;
