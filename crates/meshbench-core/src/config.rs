//! Typed runner settings loaded from TOML.
//!
//! Every name, namespace and delay the harness uses lives here and is threaded
//! through the orchestrator explicitly, so two runs (or two tests) never share
//! hidden process-wide state.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lifecycle::TeardownPolicy;

/// Whether a run installs a service mesh alongside the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    None,
    Mesh,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentKind::None => "none",
            EnvironmentKind::Mesh => "mesh",
        }
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(EnvironmentKind::None),
            "mesh" => Ok(EnvironmentKind::Mesh),
            other => Err(Error::configuration(format!(
                "unknown environment kind {other:?} (expected \"none\" or \"mesh\")"
            ))),
        }
    }
}

/// How the load-generating client produces its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientMode {
    /// Long-running load-generator server driven over HTTP.
    #[default]
    Server,
    /// Batch job that drives load itself; its logs are the result.
    Job,
}

/// Requests per second for the load test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "QpsRepr", into = "QpsRepr")]
pub enum Qps {
    #[default]
    Max,
    Fixed(u32),
}

impl Qps {
    /// Value sent to the load generator; `-1` means unthrottled.
    pub fn as_query_value(&self) -> i64 {
        match self {
            Qps::Max => -1,
            Qps::Fixed(n) => i64::from(*n),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum QpsRepr {
    Fixed(u32),
    Named(String),
}

impl TryFrom<QpsRepr> for Qps {
    type Error = String;

    fn try_from(repr: QpsRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            QpsRepr::Fixed(n) => Ok(Qps::Fixed(n)),
            QpsRepr::Named(s) if s.eq_ignore_ascii_case("max") => Ok(Qps::Max),
            QpsRepr::Named(s) => Err(format!("invalid qps {s:?}: expected an integer or \"max\"")),
        }
    }
}

impl From<Qps> for QpsRepr {
    fn from(qps: Qps) -> Self {
        match qps {
            Qps::Max => QpsRepr::Named("max".to_string()),
            Qps::Fixed(n) => QpsRepr::Fixed(n),
        }
    }
}

/// Names and ports shared by every stage of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Names {
    pub workload_namespace: String,
    pub mesh_namespace: String,
    pub monitoring_namespace: String,
    pub client_name: String,
    pub client_namespace: String,
    pub client_port: u16,
    pub service_port: u16,
    pub service_selector: String,
    pub ingress_gateway: String,
    pub ingress_gateway_port: u16,
    pub service_graph_node_pool: String,
    pub client_node_pool: String,
}

impl Default for Names {
    fn default() -> Self {
        Self {
            workload_namespace: "service-graph".to_string(),
            mesh_namespace: "istio-system".to_string(),
            monitoring_namespace: "monitoring".to_string(),
            client_name: "client".to_string(),
            client_namespace: "default".to_string(),
            client_port: 8080,
            service_port: 8080,
            service_selector: "role=service".to_string(),
            ingress_gateway: "istio-ingressgateway".to_string(),
            ingress_gateway_port: 80,
            service_graph_node_pool: "service-graph-pool".to_string(),
            client_node_pool: "client-pool".to_string(),
        }
    }
}

impl Names {
    /// GKE node selector pinning pods to a node pool.
    pub fn node_selector(pool: &str) -> String {
        format!("cloud.google.com/gke-nodepool={pool}")
    }

    /// In-cluster URL of a service.
    pub fn in_cluster_url(service: &str, namespace: &str, port: u16) -> String {
        format!("http://{service}.{namespace}.svc.cluster.local:{port}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSettings {
    pub name: String,
    pub project: Option<String>,
    pub zone: String,
    pub version: String,
    /// Provision the cluster before the batch.
    pub create: bool,
    /// Delete the cluster after the batch (only when `create` is set).
    pub tear_down: bool,
    pub bootstrap_machine_type: String,
    pub bootstrap_disk_size_gb: u32,
    pub monitoring_chart_repo: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "meshbench-cluster".to_string(),
            project: None,
            zone: "us-central1-a".to_string(),
            version: "latest".to_string(),
            create: false,
            tear_down: true,
            bootstrap_machine_type: "n1-standard-1".to_string(),
            bootstrap_disk_size_gb: 16,
            monitoring_chart_repo: "https://s3-eu-west-1.amazonaws.com/coreos-charts/stable"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub machine_type: String,
    pub disk_size_gb: u32,
    pub num_nodes: u32,
    pub image: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            machine_type: "n1-standard-4".to_string(),
            disk_size_gb: 16,
            num_nodes: 3,
            image: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    pub machine_type: String,
    pub disk_size_gb: u32,
    pub image: String,
    pub args: Vec<String>,
    pub mode: ClientMode,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            machine_type: "n1-standard-4".to_string(),
            disk_size_gb: 16,
            image: String::new(),
            args: Vec::new(),
            mode: ClientMode::Server,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshSettings {
    pub source_url: String,
    pub source_ref: String,
    /// Image repository the control plane is pulled from (and pushed to when building).
    pub hub: String,
    pub tag: String,
    /// Build and push images from source; skip to reuse prebuilt images.
    pub build: bool,
    pub release_name: String,
    /// Chart location relative to the source checkout.
    pub chart_path: PathBuf,
    pub install_args: Vec<String>,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            source_url: "https://github.com/istio/istio.git".to_string(),
            source_ref: "master".to_string(),
            hub: String::new(),
            tag: String::new(),
            build: false,
            release_name: "istio".to_string(),
            chart_path: PathBuf::from("install/kubernetes/helm/istio"),
            install_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoadTestSettings {
    pub qps: Qps,
    /// Passed through verbatim to the load generator (e.g. `"1m"`).
    pub duration: String,
    pub connections: u32,
}

impl Default for LoadTestSettings {
    fn default() -> Self {
        Self {
            qps: Qps::Max,
            duration: "1m".to_string(),
            connections: 16,
        }
    }
}

/// Poll interval plus the fixed delays of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingSettings {
    #[serde(with = "humantime_duration")]
    pub poll_interval: Duration,

    /// Buffer between workload readiness and issuing load. Absorbs propagation
    /// lag in the proxy and metrics data plane that no signal currently covers.
    #[serde(with = "humantime_duration")]
    pub settle_delay: Duration,

    /// One scrape interval, waited after the load test so the final data
    /// point is captured before teardown.
    #[serde(with = "humantime_duration")]
    pub scrape_interval: Duration,

    /// Upper bound for readiness waits; unbounded when absent.
    #[serde(with = "humantime_duration_opt")]
    pub max_wait: Option<Duration>,
}

/// Default for [`TimingSettings::settle_delay`].
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(30);

/// Default for [`TimingSettings::scrape_interval`].
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(30);

/// Default for [`TimingSettings::poll_interval`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            max_wait: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathSettings {
    /// Generated manifests and values documents.
    pub work_dir: PathBuf,
    /// Result artifacts and job logs.
    pub output_dir: PathBuf,
    /// Argv prefix of the manifest generator.
    pub generator: Vec<String>,
    pub monitoring_release: String,
    pub monitoring_chart: String,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".meshbench"),
            output_dir: PathBuf::from("."),
            generator: vec![
                "go".to_string(),
                "run".to_string(),
                "convert/main.go".to_string(),
                "kubernetes".to_string(),
            ],
            monitoring_release: "prometheus".to_string(),
            monitoring_chart: "coreos/prometheus".to_string(),
        }
    }
}

/// Complete runner configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub topology_paths: Vec<PathBuf>,
    pub environments: Vec<EnvironmentKind>,
    pub cluster: ClusterSettings,
    pub server: ServerSettings,
    pub client: ClientSettings,
    pub mesh: MeshSettings,
    pub load_test: LoadTestSettings,
    pub timing: TimingSettings,
    pub teardown: TeardownPolicy,
    pub names: Names,
    pub paths: PathSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            topology_paths: Vec::new(),
            environments: vec![EnvironmentKind::None, EnvironmentKind::Mesh],
            cluster: ClusterSettings::default(),
            server: ServerSettings::default(),
            client: ClientSettings::default(),
            mesh: MeshSettings::default(),
            load_test: LoadTestSettings::default(),
            timing: TimingSettings::default(),
            teardown: TeardownPolicy::default(),
            names: Names::default(),
            paths: PathSettings::default(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load settings from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings that would fail only after resources exist.
    pub fn validate(&self) -> Result<()> {
        if self.topology_paths.is_empty() {
            return Err(Error::configuration("no topology paths configured"));
        }
        if self.environments.is_empty() {
            return Err(Error::configuration("no environments configured"));
        }
        if self.server.image.trim().is_empty() {
            return Err(Error::configuration("server.image must be set"));
        }
        if self.client.image.trim().is_empty() {
            return Err(Error::configuration("client.image must be set"));
        }
        if self.load_test.connections == 0 {
            return Err(Error::configuration("load_test.connections must be positive"));
        }
        if self.paths.generator.is_empty() {
            return Err(Error::configuration("paths.generator must not be empty"));
        }
        if self.timing.poll_interval.is_zero() {
            return Err(Error::configuration("timing.poll_interval must be positive"));
        }
        if self.environments.contains(&EnvironmentKind::Mesh)
            && (self.mesh.hub.trim().is_empty() || self.mesh.tag.trim().is_empty())
        {
            return Err(Error::configuration(
                "mesh.hub and mesh.tag must be set when the mesh environment is enabled",
            ));
        }
        if !self.names.service_selector.contains('=') {
            return Err(Error::configuration(format!(
                "names.service_selector {:?} is not a key=value selector",
                self.names.service_selector
            )));
        }
        Ok(())
    }

    /// Static labels describing the infrastructure, attached to every run's metrics.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            labels.insert(k.to_string(), v);
        };
        put("mesh_hub", self.mesh.hub.clone());
        put("mesh_tag", self.mesh.tag.clone());
        put("cluster_version", self.cluster.version.clone());
        put("cluster_zone", self.cluster.zone.clone());
        put("server_machine_type", self.server.machine_type.clone());
        put("server_disk_size_gb", self.server.disk_size_gb.to_string());
        put("server_num_nodes", self.server.num_nodes.to_string());
        put("server_image", self.server.image.clone());
        put("client_machine_type", self.client.machine_type.clone());
        put("client_disk_size_gb", self.client.disk_size_gb.to_string());
        put("client_image", self.client.image.clone());
        labels
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod humantime_duration_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|r| humantime::parse_duration(&r).map_err(serde::de::Error::custom))
            .transpose()
    }
}
