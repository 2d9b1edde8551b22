//! Local OCI registry mirrors for kind clusters.
//!
//! [`RegistryManager`] owns registry containers; [`MirrorOrchestrator`]
//! sequences them with node-side containerd configuration. Everything talks
//! to the container engine through [`ContainerEngine`].

#![deny(missing_docs)]

pub mod config;
pub mod engine;
pub mod health;
pub mod manager;
pub mod mirror;

pub use config::{
    expand_env, registry_configs, MirrorSpec, RegistryConfig, RegistryInfo, RegistryState,
};
pub use engine::{CliEngine, ContainerEngine, ContainerSummary};
pub use health::{HealthCheckConfig, Probe};
pub use manager::{RegistryManager, REGISTRY_CONTAINER_PORT, REGISTRY_IMAGE};
pub use mirror::{hosts_toml_path, render_hosts_toml, MirrorOrchestrator};
