//! Common plumbing for cluster-set RBAC synchronization: errors, kube client
//! construction, retries, telemetry and metrics.

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager recorded on every RoleBinding the operator creates or replaces
pub const FIELD_MANAGER: &str = "clusterset-rbac-operator";

/// API group of the open-cluster-management cluster resources
pub const CLUSTER_API_GROUP: &str = "cluster.open-cluster-management.io";

/// Label carrying the name of the cluster set an object belongs to
pub const CLUSTER_SET_LABEL: &str = "cluster.open-cluster-management.io/clusterset";
