//! Cluster-set RBAC operator
//!
//! Feeds the RoleBinding sync engine with live inputs: set membership from
//! watched ManagedClusters and Hive resources, and subject access derived
//! from ClusterRoles and ClusterRoleBindings.

#![deny(missing_docs)]

pub mod access_cache;
pub mod config;
pub mod membership;

pub use access_cache::{KubeRbacReader, RbacReader, RbacSubjectCache};
pub use config::Config;
pub use membership::MembershipWatcher;
