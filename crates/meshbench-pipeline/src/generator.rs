//! Manifest generation from a topology.
//!
//! The generator is an external program; this module only builds its argv.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use meshbench_core::exec::{CommandExecutor, CommandSpec};
use meshbench_core::{Error, Result};
use tracing::info;

/// Inputs for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateRequest {
    pub topology: PathBuf,
    pub service_image: String,
    pub client_image: String,
    pub service_graph_out: PathBuf,
    pub client_out: PathBuf,
    /// `key=value` node selector for service-graph pods.
    pub service_graph_selector: String,
    pub client_selector: String,
}

/// Paths of the generated, ready-to-apply manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedManifests {
    pub service_graph: PathBuf,
    pub client: PathBuf,
}

/// Converts a topology into deployable manifests. Treated as atomic.
#[async_trait]
pub trait ManifestGenerator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedManifests>;
}

/// Runs the generator command through the executor.
pub struct CommandGenerator {
    exec: Arc<dyn CommandExecutor>,
    argv_prefix: Vec<String>,
}

impl CommandGenerator {
    pub fn new(exec: Arc<dyn CommandExecutor>, argv_prefix: Vec<String>) -> Self {
        Self { exec, argv_prefix }
    }

    pub fn command(&self, request: &GenerateRequest) -> Result<CommandSpec> {
        if self.argv_prefix.is_empty() {
            return Err(Error::configuration("manifest generator command is empty"));
        }
        Ok(CommandSpec::new(self.argv_prefix.iter().cloned()).args([
            "--service-image".to_string(),
            request.service_image.clone(),
            "--client-image".to_string(),
            request.client_image.clone(),
            request.topology.display().to_string(),
            request.service_graph_out.display().to_string(),
            request.client_out.display().to_string(),
            request.service_graph_selector.clone(),
            request.client_selector.clone(),
        ]))
    }
}

#[async_trait]
impl ManifestGenerator for CommandGenerator {
    async fn generate(&self, request: &GenerateRequest) -> Result<GeneratedManifests> {
        info!(topology = %request.topology.display(), "generating manifests");
        for out in [&request.service_graph_out, &request.client_out] {
            if let Some(parent) = out.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        self.exec.execute_checked(&self.command(request)?).await?;
        Ok(GeneratedManifests {
            service_graph: request.service_graph_out.clone(),
            client: request.client_out.clone(),
        })
    }
}
