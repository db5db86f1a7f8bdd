//! Experiment pipeline orchestration.
//!
//! One run takes a topology through these steps:
//!
//! 1. generate manifests
//! 2. relabel monitoring
//! 3. (mesh only) install the mesh
//! 4. deploy the workload and wait for it
//! 5. settle
//! 6. drive the client
//! 7. persist the result
//! 8. wait one scrape interval
//!
//! Each resource is a lifecycle scope nested inside the previous one, so
//! unwinding goes client, workload namespace, then mesh.
//!
//! Runs in a batch are strictly sequential. A failed run is reported and the
//! batch moves on; cancellation stops the batch after unwinding the active run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use mesh_env_manager::{with_environment, EnvironmentController, MeshController, MeshParams};
use meshbench_core::exec::{kubectl, CommandExecutor};
use meshbench_core::poll::sleep_cancellable;
use meshbench_core::{
    obs, ClientMode, ClusterProvisioner, EnvironmentKind, Error, ManifestScopes, Names,
    PollConfig, Poller, Result, Settings,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};
use uuid::Uuid;

use crate::generator::{CommandGenerator, GenerateRequest, GeneratedManifests, ManifestGenerator};
use crate::load::{FortioClient, LoadGenerator, LoadTestRequest};
use crate::monitoring::{MonitoringConfigurator, MonitoringRenderer, PrometheusValues};
use crate::report::{BatchReport, RunReport};
use crate::spec::PipelineRun;
use crate::stage::{PipelineStage, StageGuard, StageLog};

/// Builds the environment controller for a run.
///
/// The mesh routes ingress to the run's entrypoint, so controllers are per run.
pub trait EnvironmentFactory: Send + Sync {
    fn for_run(&self, run: &PipelineRun) -> Arc<dyn EnvironmentController>;
}

/// Mesh installs driven by the `[mesh]` settings.
pub struct MeshFactory {
    exec: Arc<dyn CommandExecutor>,
    settings: Settings,
}

impl MeshFactory {
    pub fn new(exec: Arc<dyn CommandExecutor>, settings: Settings) -> Self {
        Self { exec, settings }
    }
}

impl EnvironmentFactory for MeshFactory {
    fn for_run(&self, run: &PipelineRun) -> Arc<dyn EnvironmentController> {
        Arc::new(MeshController::new(
            self.exec.clone(),
            MeshParams::from_settings(&self.settings, &run.entrypoint),
            PollConfig::from_timing(&self.settings.timing),
        ))
    }
}

/// The experiment pipeline.
pub struct Pipeline {
    settings: Settings,
    exec: Arc<dyn CommandExecutor>,
    generator: Arc<dyn ManifestGenerator>,
    monitoring: Arc<dyn MonitoringRenderer>,
    load: Arc<dyn LoadGenerator>,
    environments: Arc<dyn EnvironmentFactory>,
}

impl Pipeline {
    /// Pipeline with the default collaborators: the configured generator
    /// command, Prometheus values, the Fortio client and mesh installs.
    pub fn new(settings: Settings, exec: Arc<dyn CommandExecutor>) -> Self {
        Self {
            generator: Arc::new(CommandGenerator::new(
                exec.clone(),
                settings.paths.generator.clone(),
            )),
            monitoring: Arc::new(PrometheusValues::for_names(&settings.names)),
            load: Arc::new(FortioClient::new(settings.timing.poll_interval)),
            environments: Arc::new(MeshFactory::new(exec.clone(), settings.clone())),
            settings,
            exec,
        }
    }

    pub fn with_manifest_generator(mut self, generator: Arc<dyn ManifestGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_monitoring_renderer(mut self, renderer: Arc<dyn MonitoringRenderer>) -> Self {
        self.monitoring = renderer;
        self
    }

    pub fn with_load_generator(mut self, load: Arc<dyn LoadGenerator>) -> Self {
        self.load = load;
        self
    }

    pub fn with_environment_factory(mut self, environments: Arc<dyn EnvironmentFactory>) -> Self {
        self.environments = environments;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one topology in one environment and return the artifact path.
    pub async fn run(
        &self,
        topology: &Path,
        environment: EnvironmentKind,
        static_labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let run = PipelineRun::prepare(topology, environment, static_labels, &self.settings)?;
        self.execute(&run, &StageLog::new(), cancel).await
    }

    /// Like [`Pipeline::run`], but never fails: the outcome is in the report.
    pub async fn run_reported(
        &self,
        topology: &Path,
        environment: EnvironmentKind,
        static_labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let started_at = Utc::now();
        let stages = StageLog::new();

        let (run_id, result) =
            match PipelineRun::prepare(topology, environment, static_labels, &self.settings) {
                Ok(run) => {
                    let span = obs::run_span(&run.run_id, &run.topology_name, environment.as_str());
                    let result = async {
                        obs::emit_run_started(
                            &run.run_id,
                            &run.topology_name,
                            environment.as_str(),
                        );
                        self.execute(&run, &stages, cancel).await
                    }
                    .instrument(span)
                    .await;
                    (run.run_id, result)
                }
                Err(e) => (Uuid::new_v4().to_string(), Err(e)),
            };

        let finished_at = Utc::now();
        let report = RunReport {
            run_id,
            topology: topology.to_path_buf(),
            environment,
            started_at,
            finished_at,
            stages: stages.timings(),
            success: result.is_ok(),
            failed_stage: stages.failed_stage(),
            error: result.as_ref().err().map(|e| e.to_string()),
            artifact: result.ok(),
        };
        obs::emit_run_finished(&report.run_id, report.duration_ms(), report.success);
        report
    }

    /// Every configured topology in every configured environment.
    ///
    /// Failed runs do not stop the batch. Cancellation does, once the active
    /// run has unwound.
    pub async fn run_batch(&self, cancel: &CancellationToken) -> BatchReport {
        let started_at = Utc::now();
        let static_labels = self.settings.labels();
        let mut runs = Vec::new();
        let mut cancelled = false;

        'batch: for topology in &self.settings.topology_paths {
            for &environment in &self.settings.environments {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break 'batch;
                }
                let report = self
                    .run_reported(topology, environment, &static_labels, cancel)
                    .await;
                if let Some(err) = &report.error {
                    error!(
                        topology = %topology.display(),
                        environment = environment.as_str(),
                        stage = report.failed_stage.map(|s| s.name()).unwrap_or("prepare"),
                        error = %err,
                        "run failed"
                    );
                }
                runs.push(report);
            }
        }
        if cancel.is_cancelled() {
            cancelled = true;
        }

        let batch = BatchReport {
            started_at,
            finished_at: Utc::now(),
            runs,
            cancelled,
            cluster_error: None,
        };
        info!(
            succeeded = batch.succeeded(),
            failed = batch.failed(),
            cancelled = batch.cancelled,
            "batch finished"
        );
        batch
    }

    /// [`Pipeline::run_batch`], inside a fresh cluster when `cluster.create` is set.
    ///
    /// Fails only when the cluster could not be provisioned. Once the batch
    /// has run, a failure deleting the cluster is recorded on the report.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        if !self.settings.cluster.create {
            return Ok(self.run_batch(cancel).await);
        }
        let mut finished = None;
        let slot = &mut finished;
        let outcome = ClusterProvisioner::new(self.exec.clone(), &self.settings)
            .with_cluster(cancel, move || async move {
                *slot = Some(self.run_batch(cancel).await);
                Ok(())
            })
            .await;

        let Some(mut batch) = finished else {
            return Err(outcome.err().unwrap_or_else(|| {
                Error::configuration("cluster scope ended before the batch ran")
            }));
        };
        if let Err(e) = outcome {
            error!(error = %e, "batch finished but the cluster was not deleted");
            batch.cluster_error = Some(e.to_string());
        }
        Ok(batch)
    }

    async fn execute(
        &self,
        run: &PipelineRun,
        stages: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let manifests = stages
            .time(
                PipelineStage::GenerateManifests,
                self.generator.generate(&self.generate_request(run)),
            )
            .await?;

        stages
            .time(
                PipelineStage::ConfigureMonitoring,
                self.monitoring_configurator().apply(&run.labels),
            )
            .await?;

        match run.environment {
            EnvironmentKind::None => {
                let target = run.entrypoint_url(&self.settings.names);
                self.deploy_and_test(run, &manifests, &target, stages, cancel)
                    .await
            }
            EnvironmentKind::Mesh => {
                let controller = self.environments.for_run(run);
                let set_up = stages.start(PipelineStage::SetUpEnvironment);
                with_environment(
                    controller.as_ref(),
                    self.settings.teardown,
                    cancel,
                    move |ctx| async move {
                        set_up.finish();
                        info!(ingress = %ctx.ingress_url, "mesh ready");
                        self.deploy_and_test(run, &manifests, &ctx.ingress_url, stages, cancel)
                            .await
                    },
                )
                .await
            }
        }
    }

    /// Steps 4 to 8, inside the workload namespace scope.
    async fn deploy_and_test(
        &self,
        run: &PipelineRun,
        manifests: &GeneratedManifests,
        target_url: &str,
        stages: &StageLog,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let names = &self.settings.names;
        let scopes = &self.scopes();
        let poller = &self.poller(cancel);

        let deploy = stages.start(PipelineStage::DeployWorkload);
        scopes
            .with_namespaced_manifest(
                &manifests.service_graph,
                &names.workload_namespace,
                cancel,
                move || async move {
                    deploy.finish();
                    stages
                        .time(PipelineStage::WaitForWorkload, async {
                            poller.rollouts(&names.workload_namespace).await?;
                            poller
                                .pods_ready(&names.workload_namespace, &names.service_selector)
                                .await
                        })
                        .await?;

                    let settle = self.settings.timing.settle_delay;
                    info!(delay = ?settle, "workload ready, settling before load");
                    stages
                        .time(
                            PipelineStage::Settle,
                            sleep_cancellable(settle, cancel, "settle delay"),
                        )
                        .await?;

                    let client = stages.start(PipelineStage::DeployClient);
                    scopes
                        .with_manifest(&manifests.client, cancel, move || {
                            self.drive_client(run, target_url, stages, client, poller, cancel)
                        })
                        .await
                },
            )
            .await
    }

    /// Steps 6 to 8, with the client deployed.
    async fn drive_client(
        &self,
        run: &PipelineRun,
        target_url: &str,
        stages: &StageLog,
        deploy: StageGuard<'_>,
        poller: &Poller,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let names = &self.settings.names;
        let artifact = match self.settings.client.mode {
            ClientMode::Server => {
                let address = poller
                    .external_ip(&names.client_namespace, &names.client_name)
                    .await?;
                deploy.finish();

                let request = LoadTestRequest {
                    client_address: address,
                    client_port: names.client_port,
                    qps: self.settings.load_test.qps,
                    duration: self.settings.load_test.duration.clone(),
                    connections: self.settings.load_test.connections,
                    target_url: target_url.to_string(),
                };
                let body = stages
                    .time(PipelineStage::LoadTest, self.load.run(&request, cancel))
                    .await?;
                stages
                    .time(
                        PipelineStage::PersistResult,
                        write_artifact(&run.result_path, body),
                    )
                    .await?;
                run.result_path.clone()
            }
            ClientMode::Job => {
                deploy.finish();
                stages
                    .time(
                        PipelineStage::LoadTest,
                        poller.job_complete(&names.client_namespace, &names.client_name),
                    )
                    .await?;
                stages
                    .time(PipelineStage::PersistResult, async {
                        let logs = self
                            .exec
                            .execute_checked(&kubectl([
                                "--namespace".to_string(),
                                names.client_namespace.clone(),
                                "logs".to_string(),
                                format!("job/{}", names.client_name),
                            ]))
                            .await?;
                        write_artifact(&run.log_path, logs.stdout).await
                    })
                    .await?;
                run.log_path.clone()
            }
        };
        info!(artifact = %artifact.display(), "result persisted");

        let scrape = self.settings.timing.scrape_interval;
        stages
            .time(
                PipelineStage::ScrapeDelay,
                sleep_cancellable(scrape, cancel, "scrape delay"),
            )
            .await?;
        Ok(artifact)
    }

    fn generate_request(&self, run: &PipelineRun) -> GenerateRequest {
        let names = &self.settings.names;
        GenerateRequest {
            topology: run.topology_path.clone(),
            service_image: self.settings.server.image.clone(),
            client_image: self.settings.client.image.clone(),
            service_graph_out: run.service_graph_manifest.clone(),
            client_out: run.client_manifest.clone(),
            service_graph_selector: Names::node_selector(&names.service_graph_node_pool),
            client_selector: Names::node_selector(&names.client_node_pool),
        }
    }

    fn monitoring_configurator(&self) -> MonitoringConfigurator {
        let paths = &self.settings.paths;
        MonitoringConfigurator::new(
            self.exec.clone(),
            self.monitoring.clone(),
            paths.monitoring_release.clone(),
            paths.monitoring_chart.clone(),
            paths.work_dir.join("monitoring-values.yaml"),
        )
    }

    fn scopes(&self) -> ManifestScopes {
        ManifestScopes::new(
            self.exec.clone(),
            PollConfig::from_timing(&self.settings.timing),
            self.settings.teardown,
        )
    }

    fn poller(&self, cancel: &CancellationToken) -> Poller {
        Poller::new(
            self.exec.clone(),
            PollConfig::from_timing(&self.settings.timing),
            cancel.clone(),
        )
    }
}

async fn write_artifact(path: &Path, contents: String) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;
    Ok(())
}
