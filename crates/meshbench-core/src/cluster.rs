//! Ephemeral GKE cluster provisioning.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{ClientSettings, ClusterSettings, Names, ServerSettings, Settings};
use crate::error::{Error, Result};
use crate::exec::{gcloud, helm, kubectl, CommandExecutor, CommandSpec};
use crate::lifecycle::{with_resource, ResourceHandle, TeardownPolicy};
use crate::poll::{PollConfig, RolloutComplete};

/// Creates a cluster with monitoring and the two node pools, and deletes it.
pub struct ClusterProvisioner {
    exec: Arc<dyn CommandExecutor>,
    cluster: ClusterSettings,
    server: ServerSettings,
    client: ClientSettings,
    names: Names,
    monitoring_release: String,
    monitoring_chart: String,
    poll: PollConfig,
}

impl ClusterProvisioner {
    pub fn new(exec: Arc<dyn CommandExecutor>, settings: &Settings) -> Self {
        Self {
            exec,
            cluster: settings.cluster.clone(),
            server: settings.server.clone(),
            client: settings.client.clone(),
            names: settings.names.clone(),
            monitoring_release: settings.paths.monitoring_release.clone(),
            monitoring_chart: settings.paths.monitoring_chart.clone(),
            poll: PollConfig::from_timing(&settings.timing),
        }
    }

    fn gcloud(&self, args: &[&str]) -> CommandSpec {
        let cmd = gcloud(args.iter().copied());
        match &self.cluster.project {
            Some(project) => cmd.args(["--project", project.as_str()]),
            None => cmd,
        }
    }

    async fn run(&self, cmd: CommandSpec) -> Result<String> {
        Ok(self.exec.execute_checked(&cmd).await?.stdout)
    }

    /// Create the cluster and provision it.
    pub async fn set_up(&self, cancel: &CancellationToken) -> Result<()> {
        self.create().await?;
        self.provision(cancel).await
    }

    /// The create call alone; everything after it runs on an existing cluster.
    async fn create(&self) -> Result<()> {
        let name = self.cluster.name.as_str();
        let zone = self.cluster.zone.as_str();
        info!(cluster = %name, zone = %zone, "creating cluster");

        self.run(self.gcloud(&[
            "container",
            "clusters",
            "create",
            name,
            "--zone",
            zone,
            "--cluster-version",
            &self.cluster.version,
            "--machine-type",
            &self.cluster.bootstrap_machine_type,
            "--disk-size",
            &self.cluster.bootstrap_disk_size_gb.to_string(),
            "--num-nodes",
            "1",
        ]))
        .await?;
        Ok(())
    }

    /// Credentials, monitoring and node pools on a created cluster.
    async fn provision(&self, cancel: &CancellationToken) -> Result<()> {
        let name = self.cluster.name.as_str();
        self.run(self.gcloud(&["config", "set", "container/cluster", name]))
            .await?;
        self.run(self.gcloud(&[
            "container",
            "clusters",
            "get-credentials",
            name,
            "--zone",
            &self.cluster.zone,
        ]))
        .await?;

        self.grant_cluster_admin().await?;
        self.install_monitoring(cancel).await?;

        self.create_node_pool(
            &self.names.service_graph_node_pool,
            self.server.num_nodes,
            &self.server.machine_type,
            self.server.disk_size_gb,
        )
        .await?;
        self.create_node_pool(
            &self.names.client_node_pool,
            1,
            &self.client.machine_type,
            self.client.disk_size_gb,
        )
        .await?;

        info!(cluster = %self.cluster.name, "cluster ready");
        Ok(())
    }

    async fn grant_cluster_admin(&self) -> Result<()> {
        let account = self.run(self.gcloud(&["config", "get-value", "account"])).await?;
        if account.is_empty() {
            return Err(Error::configuration("no active gcloud account"));
        }
        info!(account = %account, "creating cluster-admin-binding");
        self.run(kubectl([
            "create",
            "clusterrolebinding",
            "cluster-admin-binding",
            "--clusterrole",
            "cluster-admin",
            "--user",
            &account,
        ]))
        .await?;
        Ok(())
    }

    async fn install_monitoring(&self, cancel: &CancellationToken) -> Result<()> {
        info!("initializing helm");
        self.run(kubectl(["create", "serviceaccount", "tiller", "--namespace", "kube-system"]))
            .await?;
        self.run(kubectl([
            "create",
            "clusterrolebinding",
            "tiller",
            "--clusterrole",
            "cluster-admin",
            "--serviceaccount",
            "kube-system:tiller",
        ]))
        .await?;
        self.run(helm(["init", "--service-account", "tiller", "--wait"]))
            .await?;

        let (repo, _) = self
            .monitoring_chart
            .split_once('/')
            .unwrap_or(("coreos", ""));
        self.run(helm(["repo", "add", repo, self.cluster.monitoring_chart_repo.as_str()]))
            .await?;

        let ns = self.names.monitoring_namespace.as_str();
        let operator_chart = format!("{repo}/prometheus-operator");
        info!(chart = %operator_chart, "installing monitoring operator");
        self.run(helm([
            "install",
            &operator_chart,
            "--name",
            "prometheus-operator",
            "--namespace",
            ns,
        ]))
        .await?;
        info!(chart = %self.monitoring_chart, "installing monitoring");
        self.run(helm([
            "install",
            &self.monitoring_chart,
            "--name",
            &self.monitoring_release,
            "--namespace",
            ns,
        ]))
        .await?;

        RolloutComplete::new(self.exec.clone(), ns)
            .with_kinds(["statefulset"])
            .wait(&self.poll, cancel)
            .await
    }

    async fn create_node_pool(
        &self,
        pool: &str,
        num_nodes: u32,
        machine_type: &str,
        disk_size_gb: u32,
    ) -> Result<()> {
        info!(pool = %pool, nodes = num_nodes, "creating node pool");
        self.run(self.gcloud(&[
            "container",
            "node-pools",
            "create",
            pool,
            "--cluster",
            &self.cluster.name,
            "--zone",
            &self.cluster.zone,
            "--machine-type",
            machine_type,
            "--num-nodes",
            &num_nodes.to_string(),
            "--disk-size",
            &disk_size_gb.to_string(),
        ]))
        .await?;
        Ok(())
    }

    pub async fn tear_down(&self) -> Result<()> {
        info!(cluster = %self.cluster.name, "deleting cluster");
        self.run(self.gcloud(&[
            "container",
            "clusters",
            "delete",
            &self.cluster.name,
            "--zone",
            &self.cluster.zone,
            "--quiet",
        ]))
        .await?;
        Ok(())
    }

    /// Run `body` inside a freshly provisioned cluster.
    ///
    /// Once the create call succeeds the cluster is owned by the scope, so a
    /// provisioning failure deletes it like a failing body would.
    pub async fn with_cluster<T, F, Fut>(&self, cancel: &CancellationToken, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = if self.cluster.tear_down {
            TeardownPolicy::always()
        } else {
            TeardownPolicy::never()
        };
        with_resource(
            ResourceHandle::new(format!("cluster/{}", self.cluster.name), policy),
            cancel,
            || self.create(),
            |()| self.tear_down(),
            |()| async move {
                self.provision(cancel).await?;
                body().await
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::fakes::ScriptedExecutor;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.cluster.name = "bench".into();
        s.cluster.zone = "us-west1-b".into();
        s.cluster.version = "1.10.4-gke.2".into();
        s.cluster.create = true;
        s.server.num_nodes = 5;
        s
    }

    #[tokio::test]
    async fn test_set_up_sequence() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.always(
            "config get-value account",
            CommandOutput::success("ops@example.com"),
        );
        let provisioner = ClusterProvisioner::new(exec.clone(), &settings());

        provisioner
            .set_up(&CancellationToken::new())
            .await
            .expect("set up");

        let lines = exec.call_lines();
        assert!(lines[0].starts_with(
            "gcloud container clusters create bench --zone us-west1-b --cluster-version 1.10.4-gke.2"
        ));
        assert!(lines.iter().any(|l| l.ends_with("--user ops@example.com")));
        let monitoring = exec.position("install coreos/prometheus --name prometheus").unwrap();
        let statefulsets = exec.position("get statefulset").unwrap();
        let pool = exec.position("node-pools create service-graph-pool").unwrap();
        assert!(monitoring < statefulsets && statefulsets < pool);
        assert!(lines[pool].contains("--num-nodes 5"));
        assert!(exec.position("node-pools create client-pool").unwrap() > pool);
    }

    #[tokio::test]
    async fn test_with_cluster_deletes_after_failure() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.always("config get-value account", CommandOutput::success("ops"));
        let provisioner = ClusterProvisioner::new(exec.clone(), &settings());

        let err = provisioner
            .with_cluster(&CancellationToken::new(), || async {
                Err::<(), _>(Error::configuration("batch exploded"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(
            exec.count("gcloud container clusters delete bench --zone us-west1-b --quiet"),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_account_deletes_created_cluster() {
        let exec = Arc::new(ScriptedExecutor::new());
        let provisioner = ClusterProvisioner::new(exec.clone(), &settings());

        let err = provisioner
            .with_cluster(&CancellationToken::new(), || async { Ok(()) })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(exec.count("helm"), 0);
        assert_eq!(exec.count("clusters delete bench"), 1);
    }

    #[tokio::test]
    async fn test_failed_node_pool_deletes_cluster_before_body() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.always("config get-value account", CommandOutput::success("ops"));
        exec.always(
            "node-pools create client-pool",
            CommandOutput::failure(1, "ERROR: (gcloud.container.node-pools.create) quota exceeded"),
        );
        let provisioner = ClusterProvisioner::new(exec.clone(), &settings());
        let body_ran = AtomicBool::new(false);
        let ran = &body_ran;

        let err = provisioner
            .with_cluster(&CancellationToken::new(), move || async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ExternalCommand { .. }));
        assert!(!body_ran.load(Ordering::SeqCst));
        assert_eq!(exec.count("clusters create"), 1);
        assert_eq!(exec.count("clusters delete"), 1);
    }

    #[tokio::test]
    async fn test_failed_create_deletes_nothing() {
        let exec = Arc::new(ScriptedExecutor::new());
        exec.always(
            "clusters create",
            CommandOutput::failure(1, "ERROR: (gcloud.container.clusters.create) already exists"),
        );
        let provisioner = ClusterProvisioner::new(exec.clone(), &settings());

        provisioner
            .with_cluster(&CancellationToken::new(), || async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(exec.count("clusters delete"), 0);
        assert_eq!(exec.count("kubectl"), 0);
    }

    #[tokio::test]
    async fn test_provisioning_failure_keeps_cluster_without_teardown() {
        let exec = Arc::new(ScriptedExecutor::new());
        let mut s = settings();
        s.cluster.tear_down = false;
        let provisioner = ClusterProvisioner::new(exec.clone(), &s);

        provisioner
            .with_cluster(&CancellationToken::new(), || async { Ok(()) })
            .await
            .unwrap_err();

        assert_eq!(exec.count("clusters delete"), 0);
    }

    #[test]
    fn test_project_flag_is_appended() {
        let mut s = settings();
        s.cluster.project = Some("my-proj".into());
        let provisioner = ClusterProvisioner::new(Arc::new(ScriptedExecutor::new()), &s);
        let cmd = provisioner.gcloud(&["config", "list"]);
        assert_eq!(cmd.display(), "gcloud config list --project my-proj");
    }
}
