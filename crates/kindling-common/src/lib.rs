//! Shared building blocks for kindling: errors, transient-failure
//! classification, bounded parallel execution and cluster state snapshots.

#![deny(missing_docs)]

pub mod error;
pub mod parallel;
pub mod retry;
pub mod state;

pub use error::{Error, ResultExt};
pub use parallel::{task, ParallelExecutor, Results, SyncWriter, Task};
pub use retry::{
    exponential_delay, is_retryable, is_retryable_message, retry_transient, RetryConfig,
};
pub use state::ClusterStateStore;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label marking containers created by kindling
pub const MANAGED_BY_LABEL: &str = "io.kindling.managed-by";

/// Value of [`MANAGED_BY_LABEL`] on kindling-owned containers
pub const MANAGED_BY_VALUE: &str = "kindling";

/// Label carrying the cluster a registry container belongs to
pub const CLUSTER_LABEL: &str = "io.kindling.cluster";

/// Label carrying the registry host a container serves (e.g. `docker.io`)
pub const REGISTRY_HOST_LABEL: &str = "io.kindling.registry-host";

/// Label kind puts on its node containers
pub const KIND_CLUSTER_LABEL: &str = "io.x-k8s.kind.cluster";

/// Default container network shared by kind nodes and registries
pub const DEFAULT_NETWORK: &str = "kind";
