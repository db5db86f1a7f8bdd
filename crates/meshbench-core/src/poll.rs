//! Readiness polling.
//!
//! [`wait_until`] blocks until a [`ReadinessCheck`] reports ready, sleeping a
//! fixed interval between attempts. Query failures count as "not ready yet";
//! only errors for which [`Error::aborts_poll`] holds end a wait early. Every
//! wait is cancellable and optionally bounded by `max_wait`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::TimingSettings;
use crate::error::{Error, Result};
use crate::exec::{kubectl, CommandExecutor, CommandOutput, CommandSpec};

/// Stderr marker of a rollout-status long poll that dropped its connection.
pub const WATCH_CLOSED: &str = "watch closed";

/// How often and for how long to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    /// `None` waits until cancelled.
    pub max_wait: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: crate::config::DEFAULT_POLL_INTERVAL,
            max_wait: None,
        }
    }
}

impl PollConfig {
    pub fn from_timing(timing: &TimingSettings) -> Self {
        Self {
            interval: timing.poll_interval,
            max_wait: timing.max_wait,
        }
    }
}

/// A side-effect-free predicate over live infrastructure state.
///
/// Implementations must tolerate being called an unbounded number of times.
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    /// Human-readable description for logs.
    fn describe(&self) -> String;

    async fn is_ready(&self) -> Result<bool>;
}

/// Sleep for `duration` unless cancelled first.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
    during: &str,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(during)),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Poll `probe` until it yields a value.
///
/// `Ok(None)` and non-aborting errors both mean "try again after the interval".
pub async fn poll_until_some<T, F, Fut>(
    description: &str,
    config: &PollConfig,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let mut attempts = 0u64;

    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(description)),
            r = probe() => r,
        };

        match outcome {
            Ok(Some(value)) => {
                debug!(check = %description, attempts, "ready");
                return Ok(value);
            }
            Ok(None) => {
                debug!(check = %description, attempts, "not ready yet");
            }
            Err(e) if e.aborts_poll() => return Err(e),
            Err(e) => {
                debug!(check = %description, attempts, error = %e, "query failed, still waiting");
            }
        }

        if let Some(max) = config.max_wait {
            if started.elapsed() + config.interval > max {
                return Err(Error::PollTimeout {
                    check: description.to_string(),
                    waited: started.elapsed(),
                });
            }
        }
        sleep_cancellable(config.interval, cancel, description).await?;
    }
}

/// Block until `check` reports ready.
pub async fn wait_until(
    check: &dyn ReadinessCheck,
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let description = check.describe();
    info!(check = %description, "waiting");
    poll_until_some(&description, config, cancel, || async {
        Ok::<_, Error>(check.is_ready().await?.then_some(()))
    })
    .await
}

/// Block until every check reports ready. Checks are polled concurrently.
pub async fn wait_until_all(
    checks: &[&dyn ReadinessCheck],
    config: &PollConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    try_join_all(checks.iter().map(|c| wait_until(*c, config, cancel))).await?;
    Ok(())
}

/// Ready when at least one pod matches `selector` and none reports a false
/// `Ready` condition.
pub struct PodSetReady {
    exec: Arc<dyn CommandExecutor>,
    namespace: String,
    selector: String,
}

impl PodSetReady {
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        namespace: impl Into<String>,
        selector: impl Into<String>,
    ) -> Self {
        Self {
            exec,
            namespace: namespace.into(),
            selector: selector.into(),
        }
    }
}

#[async_trait]
impl ReadinessCheck for PodSetReady {
    fn describe(&self) -> String {
        format!("pods {} in {} to be ready", self.selector, self.namespace)
    }

    async fn is_ready(&self) -> Result<bool> {
        let cmd = kubectl([
            "--namespace",
            &self.namespace,
            "get",
            "pods",
            "--selector",
            &self.selector,
            "-o",
            r#"jsonpath={.items[*].status.conditions[?(@.type=="Ready")].status}"#,
        ]);
        let out = self.exec.execute_checked(&cmd).await?.stdout;
        // An empty set is eventual-consistency lag, not readiness.
        Ok(!out.is_empty() && !out.split_whitespace().any(|s| s == "False"))
    }
}

/// Ready when the job's `Complete` condition is true.
pub struct JobComplete {
    exec: Arc<dyn CommandExecutor>,
    namespace: String,
    name: String,
}

impl JobComplete {
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            exec,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl ReadinessCheck for JobComplete {
    fn describe(&self) -> String {
        format!("job/{} in {} to complete", self.name, self.namespace)
    }

    async fn is_ready(&self) -> Result<bool> {
        let cmd = kubectl([
            "--namespace",
            &self.namespace,
            "get",
            "job",
            &self.name,
            "-o",
            r#"jsonpath={.status.conditions[?(@.type=="Complete")].status}"#,
        ]);
        let out = self.exec.execute_checked(&cmd).await?.stdout;
        Ok(out == "True")
    }
}

/// Ready when querying the namespace fails.
///
/// Any failure counts as absence, not a particular error code, so teardown
/// convergence is unconditional.
pub struct NamespaceAbsent {
    exec: Arc<dyn CommandExecutor>,
    name: String,
}

impl NamespaceAbsent {
    pub fn new(exec: Arc<dyn CommandExecutor>, name: impl Into<String>) -> Self {
        Self {
            exec,
            name: name.into(),
        }
    }
}

#[async_trait]
impl ReadinessCheck for NamespaceAbsent {
    fn describe(&self) -> String {
        format!("namespace {} to be deleted", self.name)
    }

    async fn is_ready(&self) -> Result<bool> {
        let cmd = kubectl(["get", "namespace", &self.name]);
        match self.exec.execute(&cmd).await {
            Ok(out) => Ok(!out.succeeded()),
            Err(_) => Ok(true),
        }
    }
}

/// Ready once a load-balancer ingress IP is assigned to the service.
pub struct ServiceExternalIp {
    exec: Arc<dyn CommandExecutor>,
    namespace: String,
    name: String,
}

impl ServiceExternalIp {
    pub fn new(
        exec: Arc<dyn CommandExecutor>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            exec,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The assigned address, if any.
    pub async fn external_ip(&self) -> Result<Option<String>> {
        let cmd = kubectl([
            "--namespace",
            &self.namespace,
            "get",
            "service",
            &self.name,
            "-o",
            "jsonpath={.status.loadBalancer.ingress[0].ip}",
        ]);
        let out = self.exec.execute_checked(&cmd).await?.stdout;
        Ok((!out.is_empty()).then_some(out))
    }

    /// Block until an address is assigned and return it.
    pub async fn wait(&self, config: &PollConfig, cancel: &CancellationToken) -> Result<String> {
        let description = self.describe();
        info!(check = %description, "waiting");
        let ip = poll_until_some(&description, config, cancel, || self.external_ip()).await?;
        debug!(service = %self.name, ip = %ip, "external address assigned");
        Ok(ip)
    }
}

#[async_trait]
impl ReadinessCheck for ServiceExternalIp {
    fn describe(&self) -> String {
        format!("service/{} in {} to get an external IP", self.name, self.namespace)
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(self.external_ip().await?.is_some())
    }
}

/// Waits for every rollout-tracked object of the given kinds in a namespace.
///
/// Each object blocks on `kubectl rollout status`. A "watch closed" failure
/// re-queues the object at the back of the work list; any other failure
/// abandons that object so its siblings can still converge. Abandoned objects
/// are reported as [`Error::RolloutIncomplete`] once the list drains.
pub struct RolloutComplete {
    exec: Arc<dyn CommandExecutor>,
    namespace: String,
    kinds: Vec<String>,
}

impl RolloutComplete {
    pub fn new(exec: Arc<dyn CommandExecutor>, namespace: impl Into<String>) -> Self {
        Self {
            exec,
            namespace: namespace.into(),
            kinds: vec!["deployment".to_string()],
        }
    }

    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    async fn list(&self, kind: &str) -> Result<Vec<String>> {
        let cmd = kubectl([
            "--namespace",
            &self.namespace,
            "get",
            kind,
            "-o",
            "jsonpath={.items[*].metadata.name}",
        ]);
        let out = self.exec.execute_checked(&cmd).await?.stdout;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }

    fn status_command(&self, kind: &str, name: &str) -> CommandSpec {
        kubectl(["--namespace", &self.namespace, "rollout", "status", kind, name])
    }

    pub async fn wait(&self, config: &PollConfig, cancel: &CancellationToken) -> Result<()> {
        let mut queue: VecDeque<(String, String, u32)> = VecDeque::new();
        for kind in &self.kinds {
            let listing = format!("{kind} list in {}", self.namespace);
            let names = poll_until_some(&listing, config, cancel, || async {
                self.list(kind).await.map(Some)
            })
            .await?;
            for name in names {
                queue.push_back((kind.clone(), name, 0));
            }
        }
        info!(
            namespace = %self.namespace,
            objects = %queue.iter().map(|(k, n, _)| format!("{k}/{n}")).collect::<Vec<_>>().join(", "),
            "waiting for rollouts"
        );

        let mut abandoned = Vec::new();
        while let Some((kind, name, retries)) = queue.pop_front() {
            if retries > 0 {
                sleep_cancellable(config.interval, cancel, "rollout retry").await?;
            }

            let cmd = self.status_command(&kind, &name);
            let output = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled(format!("rollout of {kind}/{name}")));
                }
                r = self.exec.execute(&cmd) => r,
            };

            match classify_rollout(&cmd, output) {
                Ok(()) => debug!(object = %format!("{kind}/{name}"), "rolled out"),
                Err(e) if e.is_transient_poll() => {
                    debug!(object = %format!("{kind}/{name}"), "watch closed; retrying later");
                    queue.push_back((kind, name, retries + 1));
                }
                Err(e) => {
                    error!(
                        object = %format!("{kind}/{name}"),
                        error = %e,
                        "failed to check rollout status; abandoning"
                    );
                    abandoned.push(format!("{kind}/{name}"));
                }
            }
        }

        if abandoned.is_empty() {
            Ok(())
        } else {
            Err(Error::RolloutIncomplete {
                namespace: self.namespace.clone(),
                abandoned,
            })
        }
    }
}

/// Map a rollout-status result onto the poll error taxonomy.
fn classify_rollout(cmd: &CommandSpec, output: Result<CommandOutput>) -> Result<()> {
    let output = output?;
    if output.succeeded() {
        return Ok(());
    }
    if output.stderr.contains(WATCH_CLOSED) {
        return Err(Error::TransientPoll(output.stderr));
    }
    output.check(cmd).map(|_| ())
}

/// Executor plus poll settings plus cancellation, for call sites that wait a lot.
#[derive(Clone)]
pub struct Poller {
    exec: Arc<dyn CommandExecutor>,
    config: PollConfig,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(exec: Arc<dyn CommandExecutor>, config: PollConfig, cancel: CancellationToken) -> Self {
        Self {
            exec,
            config,
            cancel,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub async fn until(&self, check: &dyn ReadinessCheck) -> Result<()> {
        wait_until(check, &self.config, &self.cancel).await
    }

    pub async fn rollouts(&self, namespace: &str) -> Result<()> {
        RolloutComplete::new(self.exec.clone(), namespace)
            .wait(&self.config, &self.cancel)
            .await
    }

    pub async fn pods_ready(&self, namespace: &str, selector: &str) -> Result<()> {
        self.until(&PodSetReady::new(self.exec.clone(), namespace, selector))
            .await
    }

    pub async fn job_complete(&self, namespace: &str, name: &str) -> Result<()> {
        self.until(&JobComplete::new(self.exec.clone(), namespace, name))
            .await
    }

    pub async fn namespace_absent(&self, name: &str) -> Result<()> {
        self.until(&NamespaceAbsent::new(self.exec.clone(), name))
            .await
    }

    pub async fn external_ip(&self, namespace: &str, service: &str) -> Result<String> {
        ServiceExternalIp::new(self.exec.clone(), namespace, service)
            .wait(&self.config, &self.cancel)
            .await
    }
}
