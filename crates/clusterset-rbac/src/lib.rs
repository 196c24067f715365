//! Cluster-set RoleBinding synchronization
//!
//! Keeps one `admin` and one `view` RoleBinding in every namespace that
//! belongs to a managed cluster set, granting the subjects that hold that
//! role on the set. The engine is level-triggered: each pass recomputes the
//! desired bindings from a membership snapshot and the subject access caches,
//! converges the cluster toward them and deletes managed bindings that are no
//! longer wanted.

#![deny(missing_docs)]

pub mod client;
pub mod desired;
pub mod mapper;
pub mod naming;
pub mod reconciler;
pub mod subjects;

pub use client::{KubeRoleBindingClient, RoleBindingClient};
pub use desired::{desired_bindings, DesiredBinding, NamespaceEntry, NamespaceSubjectMap};
pub use mapper::SetMapper;
pub use naming::SetRole;
pub use reconciler::{
    apply_role_binding, ApplyOutcome, MembershipSnapshot, MembershipSource, PassReport,
    Reconciler, RoleReport, SyncAction, SyncError, DEFAULT_APPLY_CONCURRENCY,
};
pub use subjects::{resolve, SubjectAccessCache, SubjectRecord, SubjectsBySet, ALL_SETS};
