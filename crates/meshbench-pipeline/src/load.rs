//! HTTP-driven load generation.

use std::time::Duration;

use async_trait::async_trait;
use meshbench_core::poll::sleep_cancellable;
use meshbench_core::{Error, Qps, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One load-test invocation against the client's load-generator server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTestRequest {
    /// Externally reachable address of the client service.
    pub client_address: String,
    pub client_port: u16,
    pub qps: Qps,
    /// Passed through verbatim, e.g. `"1m"`.
    pub duration: String,
    pub connections: u32,
    /// URL the client sends load to.
    pub target_url: String,
}

impl LoadTestRequest {
    /// `http://<addr>:<port>/fortio?json=on&qps=..&t=..&c=..&load=Start&url=<target>`
    pub fn url(&self) -> String {
        format!(
            "http://{}:{}/fortio?json=on&qps={}&t={}&c={}&load=Start&url={}",
            self.client_address,
            self.client_port,
            self.qps.as_query_value(),
            self.duration,
            self.connections,
            self.target_url
        )
    }
}

/// Issues a load test and returns the raw JSON result.
#[async_trait]
pub trait LoadGenerator: Send + Sync {
    async fn run(&self, request: &LoadTestRequest, cancel: &CancellationToken) -> Result<String>;
}

/// Fortio server client.
///
/// Failures before a response arrives are retried without bound until
/// `cancel` fires; the client is only reachable once the cluster has converged.
pub struct FortioClient {
    http: reqwest::Client,
    retry_interval: Duration,
}

impl FortioClient {
    pub fn new(retry_interval: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            retry_interval,
        }
    }

    async fn attempt(&self, url: &str) -> Result<String> {
        let response = self.http.get(url).send().await.map_err(classify_send)?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::LoadTest(format!("reading load generator response: {e}")))?;
        if !status.is_success() {
            return Err(Error::LoadTest(format!("load generator returned {status}: {body}")));
        }
        serde_json::from_str::<serde_json::Value>(&body)
            .map_err(|e| Error::LoadTest(format!("load generator returned invalid JSON: {e}")))?;
        Ok(body)
    }
}

/// A send that failed before any response arrived (refused, reset, empty
/// reply) means the client is not reachable yet.
fn classify_send(e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_request() {
        Error::Connection(e.to_string())
    } else {
        Error::LoadTest(e.to_string())
    }
}

#[async_trait]
impl LoadGenerator for FortioClient {
    async fn run(&self, request: &LoadTestRequest, cancel: &CancellationToken) -> Result<String> {
        let url = request.url();
        info!(url = %url, "starting load test");
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled("load test")),
                r = self.attempt(&url) => r,
            };
            match outcome {
                Err(e) if e.is_connection() => {
                    debug!(attempts, error = %e, "load generator unreachable, retrying");
                    sleep_cancellable(self.retry_interval, cancel, "load test").await?;
                }
                other => return other,
            }
        }
    }
}
