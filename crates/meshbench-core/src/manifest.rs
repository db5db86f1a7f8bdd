//! Manifest and namespace scopes built on [`with_resource`].
//!
//! A namespaced manifest is a namespace scope wrapping a manifest scope, so
//! the objects are deleted first and the namespace last. Namespace teardown
//! only returns once [`NamespaceAbsent`] holds.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;
use crate::exec::{kubectl, CommandExecutor};
use crate::lifecycle::{with_resource, ResourceHandle, TeardownPolicy};
use crate::poll::{wait_until, NamespaceAbsent, PollConfig};

/// `kubectl apply -f <path>`
pub async fn apply_file(exec: &dyn CommandExecutor, path: &Path) -> Result<()> {
    let path = path.display().to_string();
    exec.execute_checked(&kubectl(["apply", "-f", &path])).await?;
    Ok(())
}

/// `kubectl delete -f <path> --ignore-not-found`
pub async fn delete_file(exec: &dyn CommandExecutor, path: &Path) -> Result<()> {
    let path = path.display().to_string();
    exec.execute_checked(&kubectl(["delete", "-f", &path, "--ignore-not-found"]))
        .await?;
    Ok(())
}

/// Apply a manifest document passed on stdin.
pub async fn apply_document(exec: &dyn CommandExecutor, yaml: &str) -> Result<()> {
    exec.execute_checked(&kubectl(["apply", "-f", "-"]).with_stdin(yaml))
        .await?;
    Ok(())
}

/// Create `namespace` unless it already exists.
pub async fn ensure_namespace(exec: &dyn CommandExecutor, namespace: &str) -> Result<()> {
    let rendered = exec
        .execute_checked(&kubectl([
            "create",
            "namespace",
            namespace,
            "--dry-run=client",
            "-o",
            "yaml",
        ]))
        .await?;
    apply_document(exec, &rendered.stdout).await
}

/// Delete `namespace` and block until it is gone.
///
/// The convergence wait ignores operator cancellation: a teardown that was
/// started runs to completion. `config.max_wait` still bounds it.
pub async fn delete_namespace(
    exec: Arc<dyn CommandExecutor>,
    namespace: &str,
    config: &PollConfig,
) -> Result<()> {
    info!(namespace = %namespace, "deleting namespace");
    exec.execute_checked(&kubectl([
        "delete",
        "namespace",
        namespace,
        "--ignore-not-found",
    ]))
    .await?;
    wait_until(
        &NamespaceAbsent::new(exec, namespace),
        config,
        &CancellationToken::new(),
    )
    .await
}

/// Factory for the pipeline's manifest and namespace scopes.
#[derive(Clone)]
pub struct ManifestScopes {
    exec: Arc<dyn CommandExecutor>,
    poll: PollConfig,
    policy: TeardownPolicy,
}

impl ManifestScopes {
    pub fn new(exec: Arc<dyn CommandExecutor>, poll: PollConfig, policy: TeardownPolicy) -> Self {
        Self { exec, poll, policy }
    }

    pub fn policy(&self) -> TeardownPolicy {
        self.policy
    }

    /// Run `body` while the objects in `path` exist. No namespace lifecycle.
    pub async fn with_manifest<T, F, Fut>(
        &self,
        path: &Path,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let exec = self.exec.clone();
        with_resource(
            ResourceHandle::new(path.display().to_string(), self.policy),
            cancel,
            || async {
                info!(manifest = %path.display(), "applying manifest");
                apply_file(exec.as_ref(), path).await?;
                Ok(path.to_path_buf())
            },
            |p: PathBuf| async move {
                info!(manifest = %p.display(), "deleting manifest");
                delete_file(self.exec.as_ref(), &p).await
            },
            |_| body(),
        )
        .await
    }

    /// Run `body` while `namespace` exists.
    pub async fn with_namespace<T, F, Fut>(
        &self,
        namespace: &str,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_resource(
            ResourceHandle::new(format!("namespace/{namespace}"), self.policy)
                .in_namespace(namespace),
            cancel,
            || async {
                info!(namespace = %namespace, "creating namespace");
                ensure_namespace(self.exec.as_ref(), namespace).await
            },
            |()| delete_namespace(self.exec.clone(), namespace, &self.poll),
            |()| body(),
        )
        .await
    }

    /// Run `body` while the objects in `path` exist inside `namespace`.
    pub async fn with_namespaced_manifest<T, F, Fut>(
        &self,
        path: &Path,
        namespace: &str,
        cancel: &CancellationToken,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_namespace(namespace, cancel, || {
            self.with_manifest(path, cancel, body)
        })
        .await
    }
}
