//! Monitoring configuration per run.
//!
//! Every metric scraped during a run carries the run's labels, so results
//! from different runs stay distinguishable downstream. The configuration is
//! cluster-wide and rewritten in place before each run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use meshbench_core::exec::{helm, CommandExecutor};
use meshbench_core::{Names, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Produces a monitoring configuration document from a label map.
pub trait MonitoringRenderer: Send + Sync {
    fn render(&self, labels: &BTreeMap<String, String>) -> Result<String>;
}

/// A scraped component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeTarget {
    pub name: String,
    pub match_labels: BTreeMap<String, String>,
    pub namespace: String,
    pub target_port: u16,
}

/// Chart values with one service monitor per scrape target.
#[derive(Debug, Clone)]
pub struct PrometheusValues {
    targets: Vec<ScrapeTarget>,
}

impl PrometheusValues {
    pub fn new(targets: Vec<ScrapeTarget>) -> Self {
        Self { targets }
    }

    /// Service graph, client, and mesh telemetry.
    pub fn for_names(names: &Names) -> Self {
        let target = |name: &str, key: &str, value: &str, namespace: &str, port: u16| ScrapeTarget {
            name: name.to_string(),
            match_labels: BTreeMap::from([(key.to_string(), value.to_string())]),
            namespace: namespace.to_string(),
            target_port: port,
        };
        Self::new(vec![
            target(
                "service-graph-monitor",
                "app",
                "service-graph",
                &names.workload_namespace,
                names.service_port,
            ),
            target(
                "client-monitor",
                "app",
                &names.client_name,
                &names.client_namespace,
                names.client_port,
            ),
            target(
                "istio-mixer-monitor",
                "istio",
                "mixer",
                &names.mesh_namespace,
                42422,
            ),
        ])
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ValuesDoc {
    service_monitors: Vec<ServiceMonitor>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ServiceMonitor {
    name: String,
    selector: LabelSelector,
    namespace_selector: NamespaceSelector,
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct LabelSelector {
    match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct NamespaceSelector {
    match_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Endpoint {
    target_port: u16,
    metric_relabelings: Vec<Relabeling>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Relabeling {
    target_label: String,
    replacement: String,
}

impl MonitoringRenderer for PrometheusValues {
    fn render(&self, labels: &BTreeMap<String, String>) -> Result<String> {
        let relabelings = || {
            labels
                .iter()
                .map(|(k, v)| Relabeling {
                    target_label: k.clone(),
                    replacement: v.clone(),
                })
                .collect::<Vec<_>>()
        };
        let doc = ValuesDoc {
            service_monitors: self
                .targets
                .iter()
                .map(|t| ServiceMonitor {
                    name: t.name.clone(),
                    selector: LabelSelector {
                        match_labels: t.match_labels.clone(),
                    },
                    namespace_selector: NamespaceSelector {
                        match_names: vec![t.namespace.clone()],
                    },
                    endpoints: vec![Endpoint {
                        target_port: t.target_port,
                        metric_relabelings: relabelings(),
                    }],
                })
                .collect(),
        };
        Ok(serde_yaml::to_string(&doc)?)
    }
}

/// Writes rendered values and upgrades the monitoring release with them.
pub struct MonitoringConfigurator {
    exec: Arc<dyn CommandExecutor>,
    renderer: Arc<dyn MonitoringRenderer>,
    release: String,
    chart: String,
    values_path: PathBuf,
}

impl MonitoringConfigurator {
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        renderer: Arc<dyn MonitoringRenderer>,
        release: impl Into<String>,
        chart: impl Into<String>,
        values_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exec,
            renderer,
            release: release.into(),
            chart: chart.into(),
            values_path: values_path.into(),
        }
    }

    /// Returns only after the upgrade command has completed.
    pub async fn apply(&self, labels: &BTreeMap<String, String>) -> Result<PathBuf> {
        let values = self.renderer.render(labels)?;
        if let Some(parent) = self.values_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.values_path, values).await?;

        info!(release = %self.release, "updating monitoring configuration");
        let values_path = self.values_path.display().to_string();
        self.exec
            .execute_checked(&helm([
                "upgrade",
                self.release.as_str(),
                self.chart.as_str(),
                "--values",
                values_path.as_str(),
            ]))
            .await?;
        Ok(self.values_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbench_core::fakes::ScriptedExecutor;

    #[test]
    fn test_render_applies_labels_to_every_monitor() {
        let labels = BTreeMap::from([
            ("user".to_string(), "ops".to_string()),
            ("custom".to_string(), "stuff".to_string()),
        ]);
        let yaml = PrometheusValues::for_names(&Names::default())
            .render(&labels)
            .unwrap();
        let doc: ValuesDoc = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(doc.service_monitors.len(), 3);
        let sg = &doc.service_monitors[0];
        assert_eq!(sg.name, "service-graph-monitor");
        assert_eq!(sg.namespace_selector.match_names, vec!["service-graph"]);
        assert_eq!(sg.endpoints[0].target_port, 8080);
        for monitor in &doc.service_monitors {
            let targets: Vec<_> = monitor.endpoints[0]
                .metric_relabelings
                .iter()
                .map(|r| (r.target_label.as_str(), r.replacement.as_str()))
                .collect();
            assert_eq!(targets, vec![("custom", "stuff"), ("user", "ops")]);
        }
        assert_eq!(doc.service_monitors[2].selector.match_labels["istio"], "mixer");
        assert!(yaml.contains("serviceMonitors"));
        assert!(yaml.contains("metricRelabelings"));
    }

    #[tokio::test]
    async fn test_apply_writes_values_then_upgrades() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(ScriptedExecutor::new());
        let configurator = MonitoringConfigurator::new(
            exec.clone(),
            Arc::new(PrometheusValues::for_names(&Names::default())),
            "prometheus",
            "coreos/prometheus",
            dir.path().join("gen/prometheus-values.yaml"),
        );

        let labels = BTreeMap::from([("environment".to_string(), "none".to_string())]);
        let path = configurator.apply(&labels).await.unwrap();

        assert!(std::fs::read_to_string(&path).unwrap().contains("environment"));
        assert_eq!(
            exec.call_lines(),
            vec![format!(
                "helm upgrade prometheus coreos/prometheus --values {}",
                path.display()
            )]
        );
    }
}
