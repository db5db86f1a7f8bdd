//! Scoped create/destroy of externally managed resources.
//!
//! A scope pairs a setup action with a teardown action and runs a body while
//! the resource is active:
//!
//! ```text
//! PENDING --setup ok--> ACTIVE --body ok--> TORN_DOWN
//!    |                     |
//!    | setup err           +--body err / cancel--> TORN_DOWN_ON_ERROR
//!    v
//! (never created, no teardown)
//! ```
//!
//! Teardown runs at most once, governed by [`TeardownPolicy`]. Cancellation
//! is observed by the waits inside setup and body (they all take the token),
//! so an abort surfaces as an [`Error::Cancelled`] from the innermost scope
//! and every active scope unwinds in turn. Teardown itself is never raced
//! against the token and runs to completion. Scopes nest by calling
//! [`with_resource`] from inside another scope's body.

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::obs;

/// When a scope's teardown runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeardownPolicy {
    pub tear_down_on_success: bool,
    /// Disable to keep failed resources around for post-mortem debugging.
    pub tear_down_on_error: bool,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self::always()
    }
}

impl TeardownPolicy {
    pub fn always() -> Self {
        Self {
            tear_down_on_success: true,
            tear_down_on_error: true,
        }
    }

    pub fn never() -> Self {
        Self {
            tear_down_on_success: false,
            tear_down_on_error: false,
        }
    }

    pub fn keep_on_error(mut self) -> Self {
        self.tear_down_on_error = false;
        self
    }
}

/// Identifies a set of externally created resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    /// Path or name the resource set is known by.
    pub id: String,
    pub namespace: Option<String>,
    pub policy: TeardownPolicy,
}

impl ResourceHandle {
    pub fn new(id: impl Into<String>, policy: TeardownPolicy) -> Self {
        Self {
            id: id.into(),
            namespace: None,
            policy,
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} (namespace {})", self.id, ns),
            None => f.write_str(&self.id),
        }
    }
}

/// Lifecycle state of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    Pending,
    Active,
    TornDown,
    TornDownOnError,
    /// Body finished but policy kept the resource.
    Retained,
}

/// Tracks one scope's state transitions; handy for reports and assertions.
#[derive(Debug, Clone)]
pub struct ScopeTracker {
    handle: ResourceHandle,
    state: ScopeState,
}

impl ScopeTracker {
    pub fn new(handle: ResourceHandle) -> Self {
        Self {
            handle,
            state: ScopeState::Pending,
        }
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn handle(&self) -> &ResourceHandle {
        &self.handle
    }

    /// Run `body` inside this scope. See [`with_resource`].
    pub async fn run<R, T, SetupFn, SetupFut, TeardownFn, TeardownFut, BodyFn, BodyFut>(
        &mut self,
        cancel: &CancellationToken,
        setup: SetupFn,
        teardown: TeardownFn,
        body: BodyFn,
    ) -> Result<T>
    where
        R: Clone,
        SetupFn: FnOnce() -> SetupFut,
        SetupFut: Future<Output = Result<R>>,
        TeardownFn: FnOnce(R) -> TeardownFut,
        TeardownFut: Future<Output = Result<()>>,
        BodyFn: FnOnce(R) -> BodyFut,
        BodyFut: Future<Output = Result<T>>,
    {
        let handle = self.handle.clone();
        let policy = handle.policy;

        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("setup of {handle}")));
        }
        let resource = setup().await?;
        self.state = ScopeState::Active;
        obs::emit_scope_active(&handle.to_string());

        // The body is not raced against `cancel`: dropping it would skip the
        // teardown of any scope nested inside it.
        let outcome = body(resource.clone()).await;

        match outcome {
            Ok(value) => {
                if !policy.tear_down_on_success {
                    self.state = ScopeState::Retained;
                    obs::emit_scope_retained(&handle.to_string());
                    return Ok(value);
                }
                let result = teardown(resource).await;
                self.state = ScopeState::TornDown;
                match result {
                    Ok(()) => {
                        obs::emit_scope_torn_down(&handle.to_string(), false);
                        Ok(value)
                    }
                    Err(e) => {
                        obs::emit_scope_teardown_failed(&handle.to_string(), &e);
                        Err(Error::Teardown {
                            resource: handle.to_string(),
                            message: e.to_string(),
                        })
                    }
                }
            }
            Err(original) => {
                error!(resource = %handle, error = %original, "scope failed");
                if !policy.tear_down_on_error {
                    self.state = ScopeState::Retained;
                    warn!(resource = %handle, "leaving resource in place for debugging");
                    obs::emit_scope_retained(&handle.to_string());
                    return Err(original);
                }
                info!(resource = %handle, "tearing down after error");
                if let Err(e) = teardown(resource).await {
                    // The first failure is the one reported.
                    obs::emit_scope_teardown_failed(&handle.to_string(), &e);
                } else {
                    obs::emit_scope_torn_down(&handle.to_string(), true);
                }
                self.state = ScopeState::TornDownOnError;
                Err(original)
            }
        }
    }
}

/// Run `body` while the resource created by `setup` is active.
///
/// * If `cancel` already fired or `setup` fails, nothing was created and
///   `teardown` is not invoked.
/// * If `body` succeeds, `teardown` runs when `tear_down_on_success`; a
///   teardown failure is then surfaced as [`Error::Teardown`].
/// * If `body` fails (including with [`Error::Cancelled`] from a cancellable
///   wait), `teardown` runs when `tear_down_on_error`, its failure is logged,
///   and the original error is returned.
pub async fn with_resource<R, T, SetupFn, SetupFut, TeardownFn, TeardownFut, BodyFn, BodyFut>(
    handle: ResourceHandle,
    cancel: &CancellationToken,
    setup: SetupFn,
    teardown: TeardownFn,
    body: BodyFn,
) -> Result<T>
where
    R: Clone,
    SetupFn: FnOnce() -> SetupFut,
    SetupFut: Future<Output = Result<R>>,
    TeardownFn: FnOnce(R) -> TeardownFut,
    TeardownFut: Future<Output = Result<()>>,
    BodyFn: FnOnce(R) -> BodyFut,
    BodyFut: Future<Output = Result<T>>,
{
    ScopeTracker::new(handle)
        .run(cancel, setup, teardown, body)
        .await
}
