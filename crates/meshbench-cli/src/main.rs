//! meshbench - service-mesh benchmark harness CLI
//!
//! ## Commands
//!
//! - `run`: run every topology in every environment and write a batch report
//! - `check`: validate the configuration and show what a run would do
//! - `cluster up` / `cluster down`: manage the benchmark cluster by hand
//!
//! An interrupt cancels the batch: the active run unwinds its scopes and no
//! further runs start. A second interrupt exits immediately.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use meshbench_core::{ClusterProvisioner, EnvironmentKind, ProcessExecutor, Settings};
use meshbench_pipeline::{BatchReport, Pipeline, PipelineRun};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "meshbench")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Service-mesh benchmark harness", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Settings file
    #[arg(
        short,
        long,
        global = true,
        env = "MESHBENCH_CONFIG",
        default_value = "meshbench.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the benchmark batch
    Run(RunArgs),

    /// Validate the configuration and print the planned runs
    Check(RunArgs),

    /// Manage the benchmark cluster
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Topology files (default: `topology_paths` from the settings file)
    topologies: Vec<PathBuf>,

    /// Environments to run, repeatable (default: from the settings file)
    #[arg(short, long = "environment")]
    environments: Vec<EnvironmentKind>,

    /// Provision a cluster before the batch and delete it afterwards
    #[arg(long)]
    create_cluster: bool,

    /// Keep resources of failed runs for debugging
    #[arg(long)]
    keep_on_error: bool,

    /// Batch report path (default: `<output_dir>/batch-report.json`)
    #[arg(long)]
    report: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, settings: &mut Settings) {
        if !self.topologies.is_empty() {
            settings.topology_paths = self.topologies.clone();
        }
        if !self.environments.is_empty() {
            settings.environments = self.environments.clone();
        }
        if self.create_cluster {
            settings.cluster.create = true;
        }
        if self.keep_on_error {
            settings.teardown = settings.teardown.keep_on_error();
        }
    }
}

#[derive(Subcommand)]
enum ClusterAction {
    /// Create the cluster, monitoring stack and node pools
    Up,
    /// Delete the cluster
    Down,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    meshbench_core::init_tracing(cli.json, level);

    let mut settings = load_settings(&cli.config)?;

    match cli.command {
        Commands::Run(args) => {
            args.apply(&mut settings);
            cmd_run(settings, args.report, cancel_on_interrupt()).await
        }
        Commands::Check(args) => {
            args.apply(&mut settings);
            cmd_check(&settings)
        }
        Commands::Cluster { action } => match action {
            ClusterAction::Up => cmd_cluster_up(&settings, cancel_on_interrupt()).await,
            ClusterAction::Down => cmd_cluster_down(&settings).await,
        },
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    Settings::from_toml_file(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

/// Cancel on the first interrupt; exit on the second.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupted; unwinding active resources (interrupt again to exit immediately)");
        token.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("interrupted twice; exiting without teardown");
            std::process::exit(130);
        }
    });
    cancel
}

/// Run the batch and write its report.
async fn cmd_run(
    settings: Settings,
    report: Option<PathBuf>,
    cancel: CancellationToken,
) -> Result<()> {
    settings.validate().context("Invalid configuration")?;
    let report_path =
        report.unwrap_or_else(|| settings.paths.output_dir.join("batch-report.json"));

    info!(
        topologies = settings.topology_paths.len(),
        environments = settings.environments.len(),
        create_cluster = settings.cluster.create,
        "starting batch"
    );
    let pipeline = Pipeline::new(settings, Arc::new(ProcessExecutor::new()));
    let batch = pipeline
        .run_all(&cancel)
        .await
        .context("Cluster provisioning failed")?;

    batch
        .write_json(&report_path)
        .with_context(|| format!("Failed to write report to {}", report_path.display()))?;
    print_summary(&batch);
    println!("Report: {}", report_path.display());

    if let Some(cluster_error) = &batch.cluster_error {
        bail!(
            "Cluster {} was not deleted: {cluster_error}",
            pipeline.settings().cluster.name
        );
    }
    if batch.cancelled {
        bail!("Batch cancelled after {} run(s)", batch.runs.len());
    }
    if !batch.all_succeeded() {
        bail!("{} of {} runs failed", batch.failed(), batch.runs.len());
    }
    Ok(())
}

fn print_summary(batch: &BatchReport) {
    for run in &batch.runs {
        let status = if run.success { "ok  " } else { "FAIL" };
        let detail = match (&run.artifact, &run.error) {
            (Some(artifact), _) => artifact.display().to_string(),
            (None, Some(error)) => match run.failed_stage {
                Some(stage) => format!("{}: {error}", stage.name()),
                None => error.clone(),
            },
            (None, None) => String::new(),
        };
        println!(
            "{status} {} [{}] {:.1}s {detail}",
            run.topology.display(),
            run.environment.as_str(),
            run.duration_ms() as f64 / 1000.0,
        );
    }
    println!(
        "{} succeeded, {} failed{}",
        batch.succeeded(),
        batch.failed(),
        if batch.cancelled { " (cancelled)" } else { "" }
    );
    if let Some(cluster_error) = &batch.cluster_error {
        println!("cluster teardown failed: {cluster_error}");
    }
}

/// Validate settings and every topology without touching the cluster.
fn cmd_check(settings: &Settings) -> Result<()> {
    settings.validate().context("Invalid configuration")?;
    let labels = settings.labels();

    let mut invalid = 0usize;
    for topology in &settings.topology_paths {
        for &environment in &settings.environments {
            match PipelineRun::prepare(topology, environment, &labels, settings) {
                Ok(run) => println!(
                    "{} [{}] entrypoint={} hash={} -> {}",
                    topology.display(),
                    environment.as_str(),
                    run.entrypoint,
                    &run.topology_hash[..12],
                    run.result_path.display()
                ),
                Err(e) => {
                    invalid += 1;
                    println!("{} [{}] invalid: {e}", topology.display(), environment.as_str());
                }
            }
        }
    }
    if settings.cluster.create {
        println!("cluster {} will be created in {}", settings.cluster.name, settings.cluster.zone);
    }

    if invalid > 0 {
        bail!("{invalid} planned run(s) are invalid");
    }
    Ok(())
}

async fn cmd_cluster_up(settings: &Settings, cancel: CancellationToken) -> Result<()> {
    ClusterProvisioner::new(Arc::new(ProcessExecutor::new()), settings)
        .set_up(&cancel)
        .await
        .with_context(|| format!("Failed to set up cluster {}", settings.cluster.name))?;
    println!("Cluster {} is ready", settings.cluster.name);
    Ok(())
}

async fn cmd_cluster_down(settings: &Settings) -> Result<()> {
    ClusterProvisioner::new(Arc::new(ProcessExecutor::new()), settings)
        .tear_down()
        .await
        .with_context(|| format!("Failed to delete cluster {}", settings.cluster.name))?;
    println!("Cluster {} deleted", settings.cluster.name);
    Ok(())
}
