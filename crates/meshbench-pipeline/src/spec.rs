//! Per-run identity, derived labels and artifact paths.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use meshbench_core::{EnvironmentKind, Error, Names, Result, Settings};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One topology × environment execution of the experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineRun {
    /// Fresh UUID v4 per run.
    pub run_id: String,

    pub topology_path: PathBuf,

    /// Basename of the topology file without extension.
    pub topology_name: String,

    /// SHA-256 of the topology file's contents (hex).
    pub topology_hash: String,

    pub environment: EnvironmentKind,

    /// Name of the topology's entrypoint service.
    pub entrypoint: String,

    /// Static labels merged with the derived run labels.
    pub labels: BTreeMap<String, String>,

    pub service_graph_manifest: PathBuf,
    pub client_manifest: PathBuf,

    /// `<topology>_<environment>.json`
    pub result_path: PathBuf,

    /// `<topology>_<environment>.log`
    pub log_path: PathBuf,
}

impl PipelineRun {
    /// Read the topology and derive everything the run needs.
    ///
    /// Fails with a configuration error before anything is created if the
    /// topology cannot be read or has no unique entrypoint.
    pub fn prepare(
        topology_path: &Path,
        environment: EnvironmentKind,
        static_labels: &BTreeMap<String, String>,
        settings: &Settings,
    ) -> Result<Self> {
        let contents = std::fs::read(topology_path).map_err(|e| {
            Error::configuration(format!(
                "cannot read topology {}: {e}",
                topology_path.display()
            ))
        })?;
        let topology_name = topology_name(topology_path)?;
        let topology_hash = topology_hash(&contents);
        let entrypoint = find_entrypoint(&String::from_utf8_lossy(&contents)).map_err(|e| {
            Error::configuration(format!("topology {}: {e}", topology_path.display()))
        })?;

        let labels = derive_labels(static_labels, environment, &topology_name, &topology_hash);
        let work_dir = &settings.paths.work_dir;
        let output_dir = &settings.paths.output_dir;

        Ok(Self {
            run_id: Uuid::new_v4().to_string(),
            topology_path: topology_path.to_path_buf(),
            service_graph_manifest: work_dir.join(format!("{topology_name}-service-graph.yaml")),
            client_manifest: work_dir.join(format!("{topology_name}-client.yaml")),
            result_path: output_dir.join(artifact_name(&topology_name, environment, "json")),
            log_path: output_dir.join(artifact_name(&topology_name, environment, "log")),
            topology_name,
            topology_hash,
            environment,
            entrypoint,
            labels,
        })
    }

    /// In-cluster URL of the entrypoint, used when no mesh ingress exists.
    pub fn entrypoint_url(&self, names: &Names) -> String {
        Names::in_cluster_url(&self.entrypoint, &names.workload_namespace, names.service_port)
    }
}

/// Basename without extension.
pub fn topology_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::configuration(format!("topology path {} has no file name", path.display()))
        })
}

/// Stable content hash of a topology document.
pub fn topology_hash(contents: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents);
    hex::encode(hasher.finalize())
}

/// `<topology>_<environment>.<ext>`
pub fn artifact_name(topology_name: &str, environment: EnvironmentKind, ext: &str) -> String {
    format!("{topology_name}_{}.{ext}", environment.as_str())
}

/// Static labels plus `environment`, `topology_name` and `topology_hash`.
///
/// Derived labels win over static labels with the same key.
pub fn derive_labels(
    static_labels: &BTreeMap<String, String>,
    environment: EnvironmentKind,
    topology_name: &str,
    topology_hash: &str,
) -> BTreeMap<String, String> {
    let mut labels = static_labels.clone();
    labels.insert("environment".to_string(), environment.as_str().to_string());
    labels.insert("topology_name".to_string(), topology_name.to_string());
    labels.insert("topology_hash".to_string(), topology_hash.to_string());
    labels
}

#[derive(Debug, Deserialize)]
struct TopologyDoc {
    #[serde(default)]
    services: Vec<ServiceDoc>,
}

#[derive(Debug, Deserialize)]
struct ServiceDoc {
    name: String,
    #[serde(default, rename = "isEntrypoint")]
    is_entrypoint: bool,
}

/// Name of the single service marked `isEntrypoint`.
pub fn find_entrypoint(topology_yaml: &str) -> Result<String> {
    let doc: TopologyDoc = serde_yaml::from_str(topology_yaml)?;
    let mut entrypoints = doc.services.into_iter().filter(|s| s.is_entrypoint);
    match (entrypoints.next(), entrypoints.next()) {
        (Some(svc), None) => Ok(svc.name),
        (None, _) => Err(Error::configuration("no service is marked isEntrypoint")),
        (Some(_), Some(_)) => Err(Error::configuration(
            "more than one service is marked isEntrypoint",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FANOUT: &str = "\
apiVersion: v1alpha1
services:
- name: a
  isEntrypoint: true
  script:
  - - call: b
    - call: c
- name: b
- name: c
";

    #[test]
    fn test_find_entrypoint() {
        assert_eq!(find_entrypoint(FANOUT).unwrap(), "a");
    }

    #[test]
    fn test_find_entrypoint_requires_exactly_one() {
        let none = "services:\n- name: a\n- name: b\n";
        assert!(matches!(find_entrypoint(none), Err(Error::Configuration(_))));

        let two = "services:\n- name: a\n  isEntrypoint: true\n- name: b\n  isEntrypoint: true\n";
        assert!(matches!(find_entrypoint(two), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_derived_labels_always_present() {
        let statics = BTreeMap::from([("a".to_string(), "1".to_string())]);
        let labels = derive_labels(&statics, EnvironmentKind::Mesh, "fanout", "abc");
        assert_eq!(labels.get("a").map(String::as_str), Some("1"));
        assert_eq!(labels.get("environment").map(String::as_str), Some("mesh"));
        assert_eq!(labels.get("topology_name").map(String::as_str), Some("fanout"));
        assert_eq!(labels.get("topology_hash").map(String::as_str), Some("abc"));
    }

    #[test]
    fn test_topology_hash_tracks_contents() {
        assert_eq!(topology_hash(b"x"), topology_hash(b"x"));
        assert_ne!(topology_hash(b"x"), topology_hash(b"y"));
        assert_eq!(topology_hash(b"x").len(), 64);
    }

    #[test]
    fn test_prepare_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fanout.yaml");
        std::fs::write(&path, FANOUT).unwrap();
        let mut settings = Settings::default();
        settings.paths.output_dir = dir.path().join("out");

        let statics = BTreeMap::from([("a".to_string(), "1".to_string())]);
        let run = PipelineRun::prepare(&path, EnvironmentKind::None, &statics, &settings).unwrap();

        assert_eq!(run.topology_name, "fanout");
        assert_eq!(run.entrypoint, "a");
        assert_eq!(run.topology_hash, topology_hash(FANOUT.as_bytes()));
        assert!(run.result_path.ends_with("out/fanout_none.json"));
        assert!(run.log_path.ends_with("out/fanout_none.log"));
        assert_eq!(
            run.entrypoint_url(&settings.names),
            "http://a.service-graph.svc.cluster.local:8080"
        );
        assert!(Uuid::parse_str(&run.run_id).is_ok());
    }

    #[test]
    fn test_prepare_missing_file_is_configuration_error() {
        let err = PipelineRun::prepare(
            Path::new("/nonexistent/topology.yaml"),
            EnvironmentKind::None,
            &BTreeMap::new(),
            &Settings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
