//! Mesh control-plane install and teardown.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use meshbench_core::exec::{git, helm, make, CommandExecutor};
use meshbench_core::lifecycle::{with_resource, ResourceHandle, TeardownPolicy};
use meshbench_core::manifest::{apply_file, delete_file, delete_namespace, ensure_namespace};
use meshbench_core::{Error, Names, PollConfig, Result, RolloutComplete};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ingress::IngressRules;
use crate::params::MeshParams;

/// An installed environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentContext {
    /// Where load should be sent to reach the entrypoint through the mesh.
    pub ingress_url: String,
    pub namespace: String,
    pub install_manifest: PathBuf,
    pub ingress_manifest: PathBuf,
    pub hub: String,
    pub tag: String,
    pub source_ref: String,
}

/// Installs and removes an environment around a run.
#[async_trait]
pub trait EnvironmentController: Send + Sync {
    /// Human-readable name for logs and scope handles.
    fn describe(&self) -> String;

    /// Install the environment. When installation fails partway, whatever
    /// was created is removed only if `policy.tear_down_on_error` is set.
    async fn set_up(
        &self,
        policy: TeardownPolicy,
        cancel: &CancellationToken,
    ) -> Result<EnvironmentContext>;

    /// Remove the environment. Every step is attempted; the first failure is returned.
    async fn tear_down(&self, context: EnvironmentContext) -> Result<()>;
}

/// Run `body` while the environment is installed.
pub async fn with_environment<T, F, Fut>(
    controller: &dyn EnvironmentController,
    policy: TeardownPolicy,
    cancel: &CancellationToken,
    body: F,
) -> Result<T>
where
    F: FnOnce(EnvironmentContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_resource(
        ResourceHandle::new(controller.describe(), policy),
        cancel,
        || controller.set_up(policy, cancel),
        |ctx| controller.tear_down(ctx),
        body,
    )
    .await
}

/// Installs a mesh from source with `helm template` + `kubectl apply`.
pub struct MeshController {
    exec: Arc<dyn CommandExecutor>,
    params: MeshParams,
    poll: PollConfig,
}

impl MeshController {
    pub fn new(exec: Arc<dyn CommandExecutor>, params: MeshParams, poll: PollConfig) -> Self {
        Self { exec, params, poll }
    }

    pub fn params(&self) -> &MeshParams {
        &self.params
    }

    async fn fetch_source(&self, repo: &Path) -> Result<()> {
        let repo_str = repo.display().to_string();
        info!(source = %self.params.source_url, reference = %self.params.source_ref, "cloning mesh source");
        self.exec
            .execute_checked(&git([
                "clone",
                "--quiet",
                self.params.source_url.as_str(),
                repo_str.as_str(),
            ]))
            .await?;
        self.exec
            .execute_checked(&git([
                "-C",
                repo_str.as_str(),
                "checkout",
                "--quiet",
                self.params.source_ref.as_str(),
            ]))
            .await?;
        Ok(())
    }

    async fn build_and_push(&self, go_path: &Path, repo: &Path) -> Result<()> {
        info!(hub = %self.params.hub, tag = %self.params.tag, "building and pushing mesh images");
        let cmd = make(["docker.push"])
            .with_current_dir(repo)
            .with_env("GOPATH", go_path.display().to_string())
            .with_env("HUB", self.params.hub.as_str())
            .with_env("TAG", self.params.tag.as_str());
        self.exec.execute_checked(&cmd).await?;
        Ok(())
    }

    /// Render the chart into the install manifest. Touches nothing in the cluster.
    async fn render_install_manifest(&self, repo: &Path) -> Result<PathBuf> {
        let values_path = self.params.values_path();
        tokio::fs::write(&values_path, self.params.render_values()?).await?;

        let chart = repo.join(&self.params.chart_path).display().to_string();
        let values = values_path.display().to_string();
        let cmd = helm([
            "template",
            chart.as_str(),
            "--name",
            self.params.release_name.as_str(),
            "--namespace",
            self.params.namespace.as_str(),
            "--values",
            values.as_str(),
        ])
        .args(self.params.install_args.iter().cloned());
        let rendered = self.exec.execute_checked(&cmd).await?.stdout;
        if rendered.is_empty() {
            return Err(Error::configuration(format!(
                "chart {chart} rendered no objects"
            )));
        }

        let path = self.params.install_manifest_path();
        tokio::fs::write(&path, format!("{rendered}\n")).await?;
        debug!(manifest = %path.display(), "wrote install manifest");
        Ok(path)
    }

    /// Clone, optionally build, and render. The scratch checkout is removed on return.
    async fn prepare(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.params.work_dir).await?;
        // A stale ingress manifest would make teardown delete rules never applied.
        let _ = tokio::fs::remove_file(self.params.ingress_manifest_path()).await;
        let scratch = tempfile::Builder::new().prefix("meshbench-gopath").tempdir()?;
        let repo = scratch.path().join("src").join("istio.io").join("istio");

        self.fetch_source(&repo).await?;
        if self.params.build {
            self.build_and_push(scratch.path(), &repo).await?;
        } else {
            debug!("reusing published mesh images");
        }
        self.render_install_manifest(&repo).await
    }

    async fn install(&self, context: &EnvironmentContext, cancel: &CancellationToken) -> Result<()> {
        info!(namespace = %context.namespace, "installing mesh");
        ensure_namespace(self.exec.as_ref(), &context.namespace).await?;
        apply_file(self.exec.as_ref(), &context.install_manifest).await?;
        RolloutComplete::new(self.exec.clone(), context.namespace.as_str())
            .wait(&self.poll, cancel)
            .await?;

        info!(entrypoint = %self.params.entrypoint_service, "creating ingress rules");
        let rules = IngressRules::for_entrypoint(
            &self.params.entrypoint_service,
            self.params.service_port,
            self.params.ingress_gateway_port,
        )?;
        tokio::fs::write(&context.ingress_manifest, rules.to_yaml()?).await?;
        apply_file(self.exec.as_ref(), &context.ingress_manifest).await
    }
}

#[async_trait]
impl EnvironmentController for MeshController {
    fn describe(&self) -> String {
        format!("mesh {}:{} (namespace {})", self.params.hub, self.params.tag, self.params.namespace)
    }

    async fn set_up(
        &self,
        policy: TeardownPolicy,
        cancel: &CancellationToken,
    ) -> Result<EnvironmentContext> {
        self.params.validate()?;
        let install_manifest = self.prepare().await?;

        let context = EnvironmentContext {
            ingress_url: Names::in_cluster_url(
                &self.params.ingress_gateway,
                &self.params.namespace,
                self.params.ingress_gateway_port,
            ),
            namespace: self.params.namespace.clone(),
            install_manifest,
            ingress_manifest: self.params.ingress_manifest_path(),
            hub: self.params.hub.clone(),
            tag: self.params.tag.clone(),
            source_ref: self.params.source_ref.clone(),
        };

        // From here on the cluster is mutated; undo what was reached on failure.
        if let Err(e) = self.install(&context, cancel).await {
            if !policy.tear_down_on_error {
                error!(
                    error = %e,
                    namespace = %context.namespace,
                    "mesh install failed, leaving partial install for debugging"
                );
                return Err(e);
            }
            error!(error = %e, "mesh install failed, removing partial install");
            if let Err(cleanup) = self.tear_down(context).await {
                warn!(error = %cleanup, "partial mesh cleanup failed");
            }
            return Err(e);
        }

        info!(ingress = %context.ingress_url, "mesh ready");
        Ok(context)
    }

    async fn tear_down(&self, context: EnvironmentContext) -> Result<()> {
        info!(namespace = %context.namespace, "removing mesh");
        let mut first_error = None;
        if context.ingress_manifest.exists() {
            let deleted = delete_file(self.exec.as_ref(), &context.ingress_manifest).await;
            keep_first(&mut first_error, "ingress rules", deleted);
        }
        let deleted = delete_file(self.exec.as_ref(), &context.install_manifest).await;
        keep_first(&mut first_error, "install manifest", deleted);
        let deleted = delete_namespace(self.exec.clone(), &context.namespace, &self.poll).await;
        keep_first(&mut first_error, "mesh namespace", deleted);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn keep_first(first_error: &mut Option<Error>, step: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(step = %step, error = %e, "mesh teardown step failed, continuing");
        first_error.get_or_insert(e);
    }
}
