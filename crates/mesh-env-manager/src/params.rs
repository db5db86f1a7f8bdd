//! Build and install parameters for a mesh control plane.

use std::path::PathBuf;

use meshbench_core::{Error, Result, Settings};
use serde::{Deserialize, Serialize};

use crate::ingress::validate_dns_name;

/// Everything the controller needs to install one mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshParams {
    pub source_url: String,
    /// Branch, tag or commit checked out before building.
    pub source_ref: String,
    /// Image repository the control-plane images are pulled from.
    pub hub: String,
    pub tag: String,
    /// Build and push images from source. Off when reusing published images.
    pub build: bool,
    pub release_name: String,
    /// Chart directory relative to the checkout.
    pub chart_path: PathBuf,
    pub install_args: Vec<String>,
    pub namespace: String,
    /// Service the ingress routes `/` to.
    pub entrypoint_service: String,
    pub service_port: u16,
    pub ingress_gateway: String,
    pub ingress_gateway_port: u16,
    /// Where generated values and manifests are written.
    pub work_dir: PathBuf,
}

impl MeshParams {
    pub fn from_settings(settings: &Settings, entrypoint_service: impl Into<String>) -> Self {
        let mesh = &settings.mesh;
        let names = &settings.names;
        Self {
            source_url: mesh.source_url.clone(),
            source_ref: mesh.source_ref.clone(),
            hub: mesh.hub.clone(),
            tag: mesh.tag.clone(),
            build: mesh.build,
            release_name: mesh.release_name.clone(),
            chart_path: mesh.chart_path.clone(),
            install_args: mesh.install_args.clone(),
            namespace: names.mesh_namespace.clone(),
            entrypoint_service: entrypoint_service.into(),
            service_port: names.service_port,
            ingress_gateway: names.ingress_gateway.clone(),
            ingress_gateway_port: names.ingress_gateway_port,
            work_dir: settings.paths.work_dir.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_url.trim().is_empty() {
            return Err(Error::configuration("mesh source url is empty"));
        }
        if self.hub.trim().is_empty() || self.tag.trim().is_empty() {
            return Err(Error::configuration("mesh hub and tag must be set"));
        }
        if self.tag.contains(char::is_whitespace) || self.tag.contains(':') {
            return Err(Error::configuration(format!("invalid image tag {:?}", self.tag)));
        }
        validate_dns_name(&self.namespace)?;
        validate_dns_name(&self.release_name)?;
        validate_dns_name(&self.entrypoint_service)?;
        validate_dns_name(&self.ingress_gateway)?;
        Ok(())
    }

    /// The install-time values document: image repository and tag overrides.
    pub fn render_values(&self) -> Result<String> {
        let values = InstallValues {
            global: GlobalValues {
                hub: self.hub.clone(),
                tag: self.tag.clone(),
            },
        };
        Ok(serde_yaml::to_string(&values)?)
    }

    pub fn values_path(&self) -> PathBuf {
        self.work_dir.join("mesh-values.yaml")
    }

    pub fn install_manifest_path(&self) -> PathBuf {
        self.work_dir.join("mesh-install.yaml")
    }

    pub fn ingress_manifest_path(&self) -> PathBuf {
        self.work_dir.join("mesh-ingress.yaml")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct InstallValues {
    global: GlobalValues,
}

#[derive(Debug, Serialize, Deserialize)]
struct GlobalValues {
    hub: String,
    tag: String,
}
