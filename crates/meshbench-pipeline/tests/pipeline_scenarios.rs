//! End-to-end pipeline scenarios over the scripted executor.

use async_trait::async_trait;
use meshbench_core::exec::CommandOutput;
use meshbench_core::fakes::ScriptedExecutor;
use meshbench_core::{
    ClientMode, EnvironmentKind, Error, NamespaceAbsent, ReadinessCheck, Result, Settings,
};
use meshbench_pipeline::{
    GenerateRequest, GeneratedManifests, LoadGenerator, LoadTestRequest, ManifestGenerator,
    Pipeline, PipelineStage,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const RESULT: &str = r#"{"ActualQPS": 998.7, "DurationHistogram": {"Count": 59922}}"#;

/// Records requests and hands back the paths it was asked to write.
#[derive(Default)]
struct RecordingGenerator {
    requests: Mutex<Vec<GenerateRequest>>,
}

#[async_trait]
impl ManifestGenerator for RecordingGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedManifests> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(GeneratedManifests {
            service_graph: request.service_graph_out.clone(),
            client: request.client_out.clone(),
        })
    }
}

#[derive(Default)]
struct RecordingLoad {
    requests: Mutex<Vec<LoadTestRequest>>,
}

#[async_trait]
impl LoadGenerator for RecordingLoad {
    async fn run(&self, request: &LoadTestRequest, _cancel: &CancellationToken) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(RESULT.to_string())
    }
}

fn write_topology(dir: &Path, name: &str, entrypoint: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(
        &path,
        format!(
            "services:\n- name: {entrypoint}\n  isEntrypoint: true\n  script: [[{{call: b}}]]\n- name: b\n"
        ),
    )
    .unwrap();
    path
}

fn settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.server.image = "gcr.io/bench/service-graph:1".into();
    settings.client.image = "gcr.io/bench/client:1".into();
    settings.mesh.hub = "gcr.io/bench".into();
    settings.mesh.tag = "dev".into();
    settings.paths.work_dir = dir.join("work");
    settings.paths.output_dir = dir.join("out");
    settings
}

/// A converging cluster: one deployment, ready pods, a client address,
/// and namespaces that disappear once deleted.
///
/// `script` runs first, so its rules take precedence.
fn cluster_with(script: impl FnOnce(&ScriptedExecutor)) -> Arc<ScriptedExecutor> {
    let exec = Arc::new(ScriptedExecutor::new());
    script(&exec);
    exec.always("service-graph get deployment", CommandOutput::success("a"));
    exec.when(
        "get pods --selector role=service",
        vec![
            CommandOutput::success("True False"),
            CommandOutput::success("True True"),
        ],
    );
    exec.when(
        "get service client",
        vec![CommandOutput::success(""), CommandOutput::success("10.0.0.7")],
    );
    exec.always("helm template", CommandOutput::success("kind: Deployment"));
    exec.always("get namespace", CommandOutput::failure(1, "Error from server (NotFound)"));
    exec
}

fn cluster() -> Arc<ScriptedExecutor> {
    cluster_with(|_| {})
}

struct Harness {
    exec: Arc<ScriptedExecutor>,
    generator: Arc<RecordingGenerator>,
    load: Arc<RecordingLoad>,
    pipeline: Pipeline,
}

fn harness(exec: Arc<ScriptedExecutor>, settings: Settings) -> Harness {
    let generator = Arc::new(RecordingGenerator::default());
    let load = Arc::new(RecordingLoad::default());
    let pipeline = Pipeline::new(settings, exec.clone())
        .with_manifest_generator(generator.clone())
        .with_load_generator(load.clone());
    Harness {
        exec,
        generator,
        load,
        pipeline,
    }
}

fn ordered(exec: &ScriptedExecutor, patterns: &[&str]) {
    let positions: Vec<usize> = patterns
        .iter()
        .map(|p| {
            exec.position(p)
                .unwrap_or_else(|| panic!("no call matching {p:?} in {:#?}", exec.call_lines()))
        })
        .collect();
    assert!(
        positions.windows(2).all(|w| w[0] < w[1]),
        "expected order {patterns:?}, got positions {positions:?}"
    );
}

/// Test: fanout.yaml without a mesh deploys, tests, persists, and tears down
#[tokio::test(start_paused = true)]
async fn test_fanout_without_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let topology = write_topology(dir.path(), "fanout.yaml", "a");
    let h = harness(cluster(), settings(dir.path()));
    let labels = BTreeMap::from([("a".to_string(), "1".to_string())]);

    let artifact = h
        .pipeline
        .run(&topology, EnvironmentKind::None, &labels, &CancellationToken::new())
        .await
        .expect("run failed");

    assert_eq!(artifact, dir.path().join("out/fanout_none.json"));
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), RESULT);

    let generated = h.generator.requests.lock().unwrap();
    assert_eq!(generated.len(), 1);
    assert_eq!(generated[0].service_image, "gcr.io/bench/service-graph:1");
    assert_eq!(
        generated[0].client_selector,
        "cloud.google.com/gke-nodepool=client-pool"
    );

    let load = h.load.requests.lock().unwrap();
    assert_eq!(load.len(), 1);
    assert_eq!(load[0].client_address, "10.0.0.7");
    assert_eq!(load[0].target_url, "http://a.service-graph.svc.cluster.local:8080");
    assert!(load[0]
        .url()
        .contains("/fortio?json=on&qps=-1&t=1m&c=16&load=Start&url=http://a.service-graph"));

    ordered(
        &h.exec,
        &[
            "helm upgrade prometheus",
            "create namespace service-graph",
            "fanout-service-graph.yaml",
            "rollout status deployment a",
            "get pods --selector role=service",
            "fanout-client.yaml",
            "get service client",
            "delete -f",
            "delete namespace service-graph",
        ],
    );
    assert_eq!(h.exec.count("delete namespace service-graph"), 1);
    assert_eq!(h.exec.count("istio"), 0, "no mesh without the mesh environment");

    let absent = NamespaceAbsent::new(h.exec.clone(), "service-graph");
    assert!(absent.is_ready().await.unwrap());
    assert!(absent.is_ready().await.unwrap());
}

/// Test: the monitoring values carry the run's derived labels
#[tokio::test(start_paused = true)]
async fn test_monitoring_relabeled_before_workload() {
    let dir = tempfile::tempdir().unwrap();
    let topology = write_topology(dir.path(), "fanout.yaml", "a");
    let h = harness(cluster(), settings(dir.path()));
    let labels = BTreeMap::from([("a".to_string(), "1".to_string())]);

    h.pipeline
        .run(&topology, EnvironmentKind::None, &labels, &CancellationToken::new())
        .await
        .expect("run failed");

    let values =
        std::fs::read_to_string(dir.path().join("work/monitoring-values.yaml")).unwrap();
    for expected in [
        "targetLabel: a",
        "targetLabel: environment",
        "replacement: none",
        "targetLabel: topology_name",
        "replacement: fanout",
        "targetLabel: topology_hash",
    ] {
        assert!(values.contains(expected), "missing {expected:?} in\n{values}");
    }
}

/// Test: the mesh is installed before the workload and removed after it
#[tokio::test(start_paused = true)]
async fn test_fanout_with_mesh() {
    let dir = tempfile::tempdir().unwrap();
    let topology = write_topology(dir.path(), "fanout.yaml", "a");
    let h = harness(cluster(), settings(dir.path()));

    let artifact = h
        .pipeline
        .run(
            &topology,
            EnvironmentKind::Mesh,
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .expect("run failed");

    assert_eq!(artifact, dir.path().join("out/fanout_mesh.json"));
    assert_eq!(
        h.load.requests.lock().unwrap()[0].target_url,
        "http://istio-ingressgateway.istio-system.svc.cluster.local:80"
    );

    ordered(
        &h.exec,
        &[
            "git clone",
            "helm template",
            "create namespace istio-system",
            "mesh-install.yaml",
            "create namespace service-graph",
            "fanout-service-graph.yaml",
            "delete namespace service-graph",
            "delete namespace istio-system",
        ],
    );
    assert_eq!(h.exec.count("delete namespace"), 2);
    for ns in ["service-graph", "istio-system"] {
        let absent = NamespaceAbsent::new(h.exec.clone(), ns);
        assert!(absent.is_ready().await.unwrap(), "{ns} still exists");
    }
}

/// Test: a broken rollout fails its run, unwinds, and the batch continues
#[tokio::test(start_paused = true)]
async fn test_broken_rollout_fails_run_and_batch_continues() {
    let dir = tempfile::tempdir().unwrap();
    let exec = cluster_with(|exec| {
        exec.when(
            "service-graph get deployment",
            vec![CommandOutput::success("broken"), CommandOutput::success("a")],
        );
        exec.always(
            "rollout status deployment broken",
            CommandOutput::failure(1, "error: deployment \"broken\" exceeded its progress deadline"),
        );
    });

    let mut settings = settings(dir.path());
    settings.topology_paths = vec![
        write_topology(dir.path(), "broken.yaml", "a"),
        write_topology(dir.path(), "fanout.yaml", "a"),
    ];
    settings.environments = vec![EnvironmentKind::None];
    let h = harness(exec, settings);

    let batch = h.pipeline.run_batch(&CancellationToken::new()).await;

    assert_eq!(batch.runs.len(), 2);
    assert_eq!(batch.failed(), 1);
    assert_eq!(batch.succeeded(), 1);
    assert!(!batch.cancelled);

    let broken = &batch.runs[0];
    assert!(!broken.success);
    assert_eq!(broken.failed_stage, Some(PipelineStage::WaitForWorkload));
    assert!(broken.error.as_deref().unwrap().contains("deployment/broken"));
    assert!(broken.artifact.is_none());

    let fanout = &batch.runs[1];
    assert!(fanout.success);
    assert_eq!(
        fanout.artifact.as_deref(),
        Some(dir.path().join("out/fanout_none.json").as_path())
    );

    // Both runs removed their namespace; the failed one never deployed a client.
    assert_eq!(h.exec.count("delete namespace service-graph"), 2);
    assert_eq!(h.exec.count("apply -f") - h.exec.count("apply -f -"), 3);
    assert!(!dir.path().join("out/broken_none.json").exists());
}

/// Test: with error teardown disabled, a failed run leaves its namespace
#[tokio::test(start_paused = true)]
async fn test_failed_run_keeps_resources_when_configured() {
    let dir = tempfile::tempdir().unwrap();
    let exec = cluster_with(|exec| {
        exec.always(
            "rollout status deployment a",
            CommandOutput::failure(1, "error: unable to decode"),
        );
    });
    let mut settings = settings(dir.path());
    settings.teardown.tear_down_on_error = false;
    let topology = write_topology(dir.path(), "fanout.yaml", "a");
    let h = harness(exec, settings);

    let err = h
        .pipeline
        .run(
            &topology,
            EnvironmentKind::None,
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RolloutIncomplete { .. }));
    assert_eq!(h.exec.count("delete"), 0);
}

/// Test: job mode waits for completion and persists the job's logs
#[tokio::test(start_paused = true)]
async fn test_job_client_persists_logs() {
    let dir = tempfile::tempdir().unwrap();
    let exec = cluster_with(|exec| {
        exec.when(
            "get job client",
            vec![CommandOutput::success(""), CommandOutput::success("True")],
        );
        exec.always(
            "logs job/client",
            CommandOutput::success("Ended after 1m0s : 59922 calls. qps=998.7"),
        );
    });
    let mut settings = settings(dir.path());
    settings.client.mode = ClientMode::Job;
    let topology = write_topology(dir.path(), "fanout.yaml", "a");
    let h = harness(exec, settings);

    let artifact = h
        .pipeline
        .run(
            &topology,
            EnvironmentKind::None,
            &BTreeMap::new(),
            &CancellationToken::new(),
        )
        .await
        .expect("run failed");

    assert_eq!(artifact, dir.path().join("out/fanout_none.log"));
    assert!(std::fs::read_to_string(&artifact)
        .unwrap()
        .contains("qps=998.7"));
    assert!(h.load.requests.lock().unwrap().is_empty());
    assert_eq!(h.exec.count("get service client"), 0);
    ordered(&h.exec, &["get job client", "logs job/client", "delete -f"]);
}

/// Test: cancelling mid-run unwinds the active scopes and stops the batch
#[tokio::test(start_paused = true)]
async fn test_cancel_during_readiness_stops_batch() {
    let dir = tempfile::tempdir().unwrap();
    let exec = cluster_with(|exec| {
        exec.always("get pods --selector role=service", CommandOutput::success(""));
    });

    let mut settings = settings(dir.path());
    settings.topology_paths = vec![
        write_topology(dir.path(), "fanout.yaml", "a"),
        write_topology(dir.path(), "chain.yaml", "a"),
    ];
    settings.environments = vec![EnvironmentKind::None];
    let h = harness(exec, settings);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        trigger.cancel();
    });

    let batch = h.pipeline.run_batch(&cancel).await;

    assert!(batch.cancelled);
    assert_eq!(batch.runs.len(), 1);
    assert_eq!(batch.runs[0].failed_stage, Some(PipelineStage::WaitForWorkload));
    assert!(batch.runs[0].error.as_deref().unwrap().contains("cancelled"));
    assert_eq!(h.exec.count("delete namespace service-graph"), 1);
    assert_eq!(h.generator.requests.lock().unwrap().len(), 1);
}

/// Test: a failed cluster delete is recorded without losing the batch
#[tokio::test(start_paused = true)]
async fn test_cluster_delete_failure_keeps_batch_report() {
    let dir = tempfile::tempdir().unwrap();
    let exec = cluster_with(|exec| {
        exec.always("config get-value account", CommandOutput::success("ops@example.com"));
        exec.always(
            "clusters delete",
            CommandOutput::failure(1, "ERROR: (gcloud.container.clusters.delete) timed out"),
        );
    });
    let mut settings = settings(dir.path());
    settings.cluster.create = true;
    settings.topology_paths = vec![write_topology(dir.path(), "fanout.yaml", "a")];
    settings.environments = vec![EnvironmentKind::None];
    let h = harness(exec, settings);

    let batch = h
        .pipeline
        .run_all(&CancellationToken::new())
        .await
        .expect("batch ran");

    assert_eq!(batch.runs.len(), 1);
    assert_eq!(batch.succeeded(), 1);
    assert!(batch
        .cluster_error
        .as_deref()
        .unwrap()
        .contains("teardown of cluster/"));
    assert!(!batch.all_succeeded());
    ordered(&h.exec, &["clusters create", "fanout-service-graph.yaml", "clusters delete"]);
}

/// Test: a cluster that fails provisioning is deleted and no run starts
#[tokio::test(start_paused = true)]
async fn test_cluster_provisioning_failure_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(dir.path());
    settings.cluster.create = true;
    settings.topology_paths = vec![write_topology(dir.path(), "fanout.yaml", "a")];
    settings.environments = vec![EnvironmentKind::None];
    let h = harness(cluster(), settings);

    let err = h.pipeline.run_all(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Configuration(_)));
    assert!(h.generator.requests.lock().unwrap().is_empty());
    assert_eq!(h.exec.count("clusters delete"), 1);
}
