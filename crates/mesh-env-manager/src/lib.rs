//! Mesh-Env-Manager: service-mesh control planes for meshbench runs
//!
//! Installs a mesh from a source checkout (optionally building and pushing its
//! images), wires ingress routing to the experiment's entrypoint, and removes
//! it again. Use [`with_environment`] to scope an installation to a run.

pub mod controller;
pub mod ingress;
pub mod params;

pub use controller::{with_environment, EnvironmentContext, EnvironmentController, MeshController};
pub use ingress::{validate_dns_name, IngressRules};
pub use params::MeshParams;
