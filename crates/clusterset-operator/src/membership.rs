//! Cluster set membership from watched cluster resources
//!
//! Reflectors keep local caches of ManagedClusters (cluster scoped) and of
//! Hive ClusterPools and ClusterDeployments (namespaced). Each sync pass
//! derives fresh [`SetMapper`]s from those caches:
//!
//! - clusters: set label of a ManagedCluster → cluster name
//! - namespaces: set label of a pool or deployment → its namespace
//! - global: every ManagedCluster → the global set
//!
//! Objects are visited in (namespace, name) order so that when two objects
//! disagree about a namespace's set, the outcome does not depend on watch
//! event order.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clusterset_common::kube_utils::HasApiResource;
use clusterset_common::{Error, CLUSTER_API_GROUP, CLUSTER_SET_LABEL};
use clusterset_rbac::{MembershipSnapshot, MembershipSource, SetMapper};

/// `cluster.open-cluster-management.io/v1` ManagedCluster
pub struct ManagedClusterKind;

impl HasApiResource for ManagedClusterKind {
    const API_VERSION: &'static str = "cluster.open-cluster-management.io/v1";
    const KIND: &'static str = "ManagedCluster";
}

/// `hive.openshift.io/v1` ClusterPool
pub struct ClusterPoolKind;

impl HasApiResource for ClusterPoolKind {
    const API_VERSION: &'static str = "hive.openshift.io/v1";
    const KIND: &'static str = "ClusterPool";
}

/// `hive.openshift.io/v1` ClusterDeployment
pub struct ClusterDeploymentKind;

impl HasApiResource for ClusterDeploymentKind {
    const API_VERSION: &'static str = "hive.openshift.io/v1";
    const KIND: &'static str = "ClusterDeployment";
}

fn set_label(obj: &DynamicObject) -> Option<&str> {
    obj.labels()
        .get(CLUSTER_SET_LABEL)
        .map(String::as_str)
        .filter(|set| !set.is_empty())
}

fn sorted<'a, I>(objects: I) -> Vec<&'a DynamicObject>
where
    I: IntoIterator<Item = &'a DynamicObject>,
{
    let mut objects: Vec<_> = objects.into_iter().collect();
    objects.sort_by_key(|obj| (obj.namespace(), obj.name_any()));
    objects
}

/// Set → cluster mapper and global set → cluster mapper from ManagedClusters
pub fn cluster_mappers<'a, I>(clusters: I, global_set: &str) -> (SetMapper, SetMapper)
where
    I: IntoIterator<Item = &'a DynamicObject>,
{
    let mut by_set = SetMapper::new();
    let mut global = SetMapper::new();

    for cluster in sorted(clusters) {
        let name = cluster.name_any();
        if let Some(set) = set_label(cluster) {
            by_set.add(set, name.clone());
        }
        global.add(global_set, name);
    }

    (by_set, global)
}

/// Set → namespace mapper from namespaced cluster resources
///
/// A namespace's set is taken from the set label of the objects it holds.
pub fn namespace_mapper<'a, I>(objects: I) -> SetMapper
where
    I: IntoIterator<Item = &'a DynamicObject>,
{
    let mut mapper = SetMapper::new();
    for obj in sorted(objects) {
        if let (Some(namespace), Some(set)) = (obj.namespace(), set_label(obj)) {
            mapper.add(set, namespace);
        }
    }
    mapper
}

/// Reflector-backed [`MembershipSource`]
pub struct MembershipWatcher {
    clusters: Store<DynamicObject>,
    pools: Store<DynamicObject>,
    deployments: Store<DynamicObject>,
    global_set: String,
}

impl MembershipWatcher {
    /// Build a watcher over existing stores
    pub fn from_stores(
        clusters: Store<DynamicObject>,
        pools: Store<DynamicObject>,
        deployments: Store<DynamicObject>,
        global_set: impl Into<String>,
    ) -> Self {
        Self {
            clusters,
            pools,
            deployments,
            global_set: global_set.into(),
        }
    }

    /// Start one reflector per watched kind
    ///
    /// The returned tasks end when `cancel` fires.
    pub fn start(
        client: Client,
        global_set: impl Into<String>,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let cluster_ar = ManagedClusterKind::api_resource();
        let pool_ar = ClusterPoolKind::api_resource();
        let deployment_ar = ClusterDeploymentKind::api_resource();

        let (clusters, clusters_task) = spawn_reflector(
            Api::all_with(client.clone(), &cluster_ar),
            cluster_ar,
            cancel.clone(),
        );
        let (pools, pools_task) = spawn_reflector(
            Api::all_with(client.clone(), &pool_ar),
            pool_ar,
            cancel.clone(),
        );
        let (deployments, deployments_task) = spawn_reflector(
            Api::all_with(client, &deployment_ar),
            deployment_ar,
            cancel,
        );

        info!(group = CLUSTER_API_GROUP, "Membership watchers started");
        (
            Self::from_stores(clusters, pools, deployments, global_set),
            vec![clusters_task, pools_task, deployments_task],
        )
    }

    /// Wait until the stores have seen their initial list
    ///
    /// ManagedClusters are required: an empty cluster store would make the
    /// first pass delete every binding in every cluster namespace, so this
    /// keeps waiting (warning every `timeout`) until they are listed. The
    /// Hive kinds are optional; a kind whose CRD is not installed never
    /// becomes ready, is logged after `timeout` and treated as empty.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), Error> {
        loop {
            match tokio::time::timeout(timeout, self.clusters.wait_until_ready()).await {
                Ok(Ok(())) => {
                    debug!(kind = ManagedClusterKind::KIND, "Membership store ready");
                    break;
                }
                Ok(Err(e)) => {
                    return Err(Error::internal_with_context(
                        "membership",
                        format!("{} store writer dropped: {}", ManagedClusterKind::KIND, e),
                    ));
                }
                Err(_) => warn!(
                    kind = ManagedClusterKind::KIND,
                    waited_secs = timeout.as_secs(),
                    "Membership store not ready yet, still waiting"
                ),
            }
        }

        let optional = [
            (ClusterPoolKind::KIND, &self.pools),
            (ClusterDeploymentKind::KIND, &self.deployments),
        ];
        for (kind, store) in optional {
            match tokio::time::timeout(timeout, store.wait_until_ready()).await {
                Ok(Ok(())) => debug!(kind, "Membership store ready"),
                Ok(Err(e)) => warn!(kind, error = %e, "Membership store writer dropped"),
                Err(_) => warn!(kind, "Membership store not ready, continuing without it"),
            }
        }
        Ok(())
    }
}

impl MembershipSource for MembershipWatcher {
    fn snapshot(&self) -> MembershipSnapshot {
        let clusters = self.clusters.state();
        let (by_set, global) = cluster_mappers(clusters.iter().map(Arc::as_ref), &self.global_set);

        let pools = self.pools.state();
        let deployments = self.deployments.state();
        let namespaces = namespace_mapper(pools.iter().chain(deployments.iter()).map(Arc::as_ref));

        MembershipSnapshot {
            clusters: by_set,
            namespaces,
            global,
        }
    }
}

fn spawn_reflector(
    api: Api<DynamicObject>,
    ar: ApiResource,
    cancel: CancellationToken,
) -> (Store<DynamicObject>, JoinHandle<()>) {
    let kind = ar.kind.clone();
    let writer = Writer::new(ar);
    let store = writer.as_reader();

    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default()))
        .default_backoff()
        .applied_objects();

    let task = tokio::spawn(async move {
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = stream.next() => match item {
                    Some(Ok(obj)) => {
                        debug!(kind = %kind, name = %obj.name_any(), "Membership object changed")
                    }
                    Some(Err(e)) => warn!(kind = %kind, error = %e, "Membership watch error"),
                    None => break,
                },
            }
        }
        debug!(kind = %kind, "Membership watcher stopped");
    });

    (store, task)
}
