//! Deterministic names and labels for managed RoleBindings
//!
//! These strings are persisted in live clusters; changing any of them orphans
//! existing bindings.

use std::collections::BTreeMap;
use std::fmt;

pub use clusterset_common::CLUSTER_SET_LABEL;

/// Label carrying the role (admin/view) a managed binding grants
pub const CLUSTER_SET_ROLE_LABEL: &str = "cluster.open-cluster-management.io/role";

/// Prefix shared by every managed binding name
pub const BINDING_NAME_PREFIX: &str = "open-cluster-management:managedclusterset";

/// Access level a subject holds on a cluster set
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SetRole {
    /// Full control of the set's resources
    Admin,
    /// Read-only access
    View,
}

impl SetRole {
    /// Every role, in the order a pass processes them
    pub const ALL: [SetRole; 2] = [SetRole::Admin, SetRole::View];

    /// Role string used in labels, names and the ClusterRole reference
    pub fn as_str(&self) -> &'static str {
        match self {
            SetRole::Admin => "admin",
            SetRole::View => "view",
        }
    }

    /// Name of the binding for this role; identical in every namespace
    pub fn binding_name(&self) -> String {
        format!("{}:{}", BINDING_NAME_PREFIX, self.as_str())
    }

    /// ClusterRole the binding references
    pub fn cluster_role(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for SetRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels stamped on a managed binding
pub fn binding_labels(set_name: &str, role: SetRole) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_SET_LABEL.to_string(), set_name.to_string()),
        (CLUSTER_SET_ROLE_LABEL.to_string(), role.as_str().to_string()),
    ])
}

/// Selector matching every binding this subsystem manages
///
/// Existence only: bindings written before the role label existed must still
/// be garbage-collected.
pub fn managed_selector() -> &'static str {
    CLUSTER_SET_LABEL
}
