//! Subject access derived from cluster RBAC
//!
//! Who may administer or view a cluster set is whatever ClusterRoles and
//! ClusterRoleBindings say:
//!
//! - admin: `create` on `managedclustersets/join`
//! - view: `get` on `managedclustersets`
//!
//! both in the `cluster.open-cluster-management.io` group. A rule limited by
//! `resourceNames` grants only those sets; otherwise it grants every set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule};
use kube::{Api, Client};
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
