//! Scenario tests for scopes + readiness polling over the scripted executor.

use meshbench_core::exec::CommandOutput;
use meshbench_core::fakes::ScriptedExecutor;
use meshbench_core::{
    Error, ManifestScopes, NamespaceAbsent, PollConfig, Poller, ReadinessCheck, TeardownPolicy,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn poll() -> PollConfig {
    PollConfig {
        interval: Duration::from_secs(2),
        max_wait: None,
    }
}

fn workload_cluster() -> Arc<ScriptedExecutor> {
    let exec = Arc::new(ScriptedExecutor::new());
    exec.always("get deployment -o", CommandOutput::success("a b"));
    exec.when(
        "get pods --selector role=service",
        vec![
            CommandOutput::success("True False"),
            CommandOutput::success("True True"),
        ],
    );
    exec.when(
        "get namespace service-graph",
        vec![
            CommandOutput::success("service-graph   Terminating"),
            CommandOutput::failure(1, "Error from server (NotFound)"),
        ],
    );
    exec
}

/// Test: deploy, wait for rollout and pods, then converge on deletion
#[tokio::test(start_paused = true)]
async fn test_deploy_wait_and_converge() {
    let exec = workload_cluster();
    let cancel = CancellationToken::new();
    let scopes = ManifestScopes::new(exec.clone(), poll(), TeardownPolicy::always());
    let poller = Poller::new(exec.clone(), poll(), cancel.clone());

    scopes
        .with_namespaced_manifest(Path::new("sg.yaml"), "service-graph", &cancel, || async {
            poller.rollouts("service-graph").await?;
            poller.pods_ready("service-graph", "role=service").await
        })
        .await
        .expect("scenario failed");

    assert_eq!(exec.count("rollout status deployment"), 2);
    assert_eq!(exec.count("get pods"), 2);

    // Namespace absence holds afterwards and stays true.
    let absent = NamespaceAbsent::new(exec.clone(), "service-graph");
    assert!(absent.is_ready().await.unwrap());
    assert!(absent.is_ready().await.unwrap());
}

/// Test: a broken rollout fails the scope but the namespace is still removed
#[tokio::test(start_paused = true)]
async fn test_broken_rollout_unwinds() {
    let exec = workload_cluster();
    exec.always(
        "rollout status deployment b",
        CommandOutput::failure(1, "error: unable to decode"),
    );
    let cancel = CancellationToken::new();
    let scopes = ManifestScopes::new(exec.clone(), poll(), TeardownPolicy::always());
    let poller = Poller::new(exec.clone(), poll(), cancel.clone());

    let err = scopes
        .with_namespaced_manifest(Path::new("sg.yaml"), "service-graph", &cancel, || async {
            poller.rollouts("service-graph").await
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RolloutIncomplete { .. }));
    assert_eq!(exec.count("get pods"), 0, "pods are never polled");
    assert_eq!(exec.count("delete namespace service-graph"), 1);
}

/// Test: operator cancellation mid-wait still tears the namespace down
#[tokio::test(start_paused = true)]
async fn test_cancel_during_pod_wait() {
    let exec = Arc::new(ScriptedExecutor::new());
    exec.always("get pods", CommandOutput::success(""));
    exec.always("get namespace", CommandOutput::failure(1, "NotFound"));
    let cancel = CancellationToken::new();
    let scopes = ManifestScopes::new(exec.clone(), poll(), TeardownPolicy::always());
    let poller = Poller::new(exec.clone(), poll(), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let err = scopes
        .with_namespaced_manifest(Path::new("sg.yaml"), "service-graph", &cancel, || async {
            poller.pods_ready("service-graph", "role=service").await
        })
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(exec.count("delete -f sg.yaml"), 1);
    assert_eq!(exec.count("delete namespace service-graph"), 1);
}
