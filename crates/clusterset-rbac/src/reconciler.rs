//! Periodic RoleBinding reconciliation
//!
//! Every tick takes one membership snapshot, computes the desired bindings
//! for each role, applies them and garbage-collects managed bindings whose
//! namespace is no longer desired. Nothing is carried between ticks: a failed
//! write is simply retried by the next pass.
//!
//! Per role the pass is:
//!
//! 1. union the namespace and cluster mappers (view additionally layers the
//!    global mapper on top)
//! 2. resolve who holds the role on which set
//! 3. build the namespace → subjects map
//! 4. apply every desired binding, bounded by `concurrency`
//! 5. list managed bindings and delete the role's bindings in namespaces
//!    that are not desired
//!
//! Errors never abort a pass. They are collected into the [`PassReport`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use k8s_openapi::api::rbac::v1::RoleBinding;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use clusterset_common::metrics::{self, SYNC_PASS_DURATION};
use clusterset_common::Error;

use crate::client::RoleBindingClient;
use crate::desired::{desired_bindings, DesiredBinding, NamespaceSubjectMap};
use crate::mapper::SetMapper;
use crate::naming::{managed_selector, SetRole};
use crate::subjects::{resolve, SubjectAccessCache, SubjectsBySet};

/// Default number of concurrent writes within one role's pass
pub const DEFAULT_APPLY_CONCURRENCY: usize = 16;

/// Set membership as seen at the start of a pass
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MembershipSnapshot {
    /// Set → managed cluster names (a cluster's namespace equals its name)
    pub clusters: SetMapper,
    /// Set → additional namespaces
    pub namespaces: SetMapper,
    /// Global set → every managed cluster
    pub global: SetMapper,
}

impl MembershipSnapshot {
    /// Namespaces and clusters combined; clusters win on conflict
    pub fn set_members(&self) -> SetMapper {
        self.namespaces.union(&self.clusters)
    }

    /// Desired namespace → subjects map for `role`
    ///
    /// The view map layers global viewers over the set-level viewers so
    /// both keep access.
    pub fn desired(&self, role: SetRole, subjects: &SubjectsBySet) -> NamespaceSubjectMap {
        let sets = NamespaceSubjectMap::build(&self.set_members(), subjects);
        match role {
            SetRole::Admin => sets,
            SetRole::View => sets.layer(NamespaceSubjectMap::build(&self.global, subjects)),
        }
    }
}

/// Supplier of the membership snapshot taken at every tick
pub trait MembershipSource: Send + Sync {
    /// Current membership; later changes must not affect the returned value
    fn snapshot(&self) -> MembershipSnapshot;
}

impl MembershipSource for MembershipSnapshot {
    fn snapshot(&self) -> MembershipSnapshot {
        self.clone()
    }
}

/// What applying one desired binding did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The binding did not exist
    Created,
    /// Subjects or labels were rewritten in place
    Updated,
    /// roleRef differed; the binding was deleted and created again
    Recreated,
    /// Nothing to do
    Unchanged,
}

impl ApplyOutcome {
    /// Metric/log label
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Updated => "updated",
            ApplyOutcome::Recreated => "recreated",
            ApplyOutcome::Unchanged => "unchanged",
        }
    }
}

fn labels_match(existing: &RoleBinding, wanted: &RoleBinding) -> bool {
    let Some(wanted) = wanted.metadata.labels.as_ref() else {
        return true;
    };
    let existing = existing.metadata.labels.as_ref();
    wanted
        .iter()
        .all(|(k, v)| existing.and_then(|labels| labels.get(k)) == Some(v))
}

fn subjects_match(existing: &RoleBinding, wanted: &RoleBinding) -> bool {
    existing.subjects.as_deref().unwrap_or_default()
        == wanted.subjects.as_deref().unwrap_or_default()
}

/// Make the live binding match `desired`
///
/// Labels owned by others are preserved on update. roleRef is immutable in
/// Kubernetes, so a roleRef change costs a delete and a create.
pub async fn apply_role_binding(
    client: &dyn RoleBindingClient,
    desired: &DesiredBinding,
) -> Result<ApplyOutcome, Error> {
    let wanted = desired.to_role_binding();
    let name = desired.name();

    let Some(existing) = client.get(&desired.namespace, &name).await? else {
        client.create(&wanted).await?;
        return Ok(ApplyOutcome::Created);
    };

    if existing.role_ref != wanted.role_ref {
        client.delete(&desired.namespace, &name).await?;
        client.create(&wanted).await?;
        return Ok(ApplyOutcome::Recreated);
    }

    if subjects_match(&existing, &wanted) && labels_match(&existing, &wanted) {
        return Ok(ApplyOutcome::Unchanged);
    }

    let mut updated = existing;
    updated.subjects = wanted.subjects;
    let labels = updated.metadata.labels.get_or_insert_with(Default::default);
    labels.extend(wanted.metadata.labels.unwrap_or_default());
    client.update(&updated).await?;
    Ok(ApplyOutcome::Updated)
}

/// Object-store operation that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Get/create/update of a desired binding
    Apply,
    /// Deletion of a binding that is no longer desired
    Delete,
    /// Listing managed bindings for garbage collection
    List,
}

impl SyncAction {
    /// Metric/log label
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Apply => "apply",
            SyncAction::Delete => "delete",
            SyncAction::List => "list",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed operation within a pass
#[derive(Debug, Error)]
#[error(
    "{action} of {role} binding {name} in {} failed: {source}",
    .namespace.as_deref().unwrap_or("all namespaces")
)]
pub struct SyncError {
    /// Role whose pass failed
    pub role: SetRole,
    /// Operation that failed
    pub action: SyncAction,
    /// Namespace of the binding; `None` for a cluster-wide list
    pub namespace: Option<String>,
    /// Binding name
    pub name: String,
    /// Underlying error
    pub source: Error,
}

/// Outcome counts for one role in one pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleReport {
    /// Role reconciled
    pub role: SetRole,
    /// Namespaces that should carry a binding
    pub desired: usize,
    /// Bindings created
    pub created: usize,
    /// Bindings updated in place
    pub updated: usize,
    /// Bindings deleted and recreated
    pub recreated: usize,
    /// Bindings already correct
    pub unchanged: usize,
    /// Stale bindings deleted
    pub deleted: usize,
    /// Garbage collection did not run because listing failed
    pub gc_skipped: bool,
}

impl RoleReport {
    fn new(role: SetRole, desired: usize) -> Self {
        Self {
            role,
            desired,
            created: 0,
            updated: 0,
            recreated: 0,
            unchanged: 0,
            deleted: 0,
            gc_skipped: false,
        }
    }

    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Updated => self.updated += 1,
            ApplyOutcome::Recreated => self.recreated += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Number of write operations the role's pass performed
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.recreated + self.deleted
    }
}

/// Result of one full pass over both roles
#[derive(Debug, Default)]
pub struct PassReport {
    /// Per-role counts, in processing order
    pub roles: Vec<RoleReport>,
    /// Every failure of the pass
    pub errors: Vec<SyncError>,
}

impl PassReport {
    /// Counts for `role`, if it was processed
    pub fn role(&self, role: SetRole) -> Option<&RoleReport> {
        self.roles.iter().find(|r| r.role == role)
    }

    /// True when nothing failed
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// Write operations across all roles
    pub fn mutations(&self) -> usize {
        self.roles.iter().map(RoleReport::mutations).sum()
    }
}

/// Drives RoleBinding reconciliation for both roles
pub struct Reconciler {
    client: Arc<dyn RoleBindingClient>,
    admin_cache: Arc<dyn SubjectAccessCache>,
    view_cache: Arc<dyn SubjectAccessCache>,
    concurrency: usize,
}

impl Reconciler {
    /// Create a reconciler with the default write concurrency
    pub fn new(
        client: Arc<dyn RoleBindingClient>,
        admin_cache: Arc<dyn SubjectAccessCache>,
        view_cache: Arc<dyn SubjectAccessCache>,
    ) -> Self {
        Self {
            client,
            admin_cache,
            view_cache,
            concurrency: DEFAULT_APPLY_CONCURRENCY,
        }
    }

    /// Bound the number of concurrent writes (minimum 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    fn cache(&self, role: SetRole) -> &dyn SubjectAccessCache {
        match role {
            SetRole::Admin => self.admin_cache.as_ref(),
            SetRole::View => self.view_cache.as_ref(),
        }
    }

    /// Run one full pass over both roles
    #[instrument(skip_all)]
    pub async fn reconcile(&self, snapshot: &MembershipSnapshot) -> PassReport {
        let start = Instant::now();
        let mut report = PassReport::default();

        for role in SetRole::ALL {
            self.sync_role(role, snapshot, &mut report).await;
        }

        SYNC_PASS_DURATION.record(start.elapsed().as_secs_f64(), &[]);
        report
    }

    #[instrument(skip_all, fields(role = %role))]
    async fn sync_role(
        &self,
        role: SetRole,
        snapshot: &MembershipSnapshot,
        report: &mut PassReport,
    ) {
        let subjects = resolve(self.cache(role), role);
        let desired = snapshot.desired(role, &subjects);
        metrics::record_desired(role.as_str(), desired.len());

        let mut role_report = RoleReport::new(role, desired.len());
        self.apply_all(role, &desired, &mut role_report, report).await;
        self.collect_garbage(role, &desired, &mut role_report, report).await;

        debug!(
            desired = role_report.desired,
            created = role_report.created,
            updated = role_report.updated,
            recreated = role_report.recreated,
            deleted = role_report.deleted,
            "role synced"
        );
        report.roles.push(role_report);
    }

    async fn apply_all(
        &self,
        role: SetRole,
        desired: &NamespaceSubjectMap,
        role_report: &mut RoleReport,
        report: &mut PassReport,
    ) {
        let client = self.client.as_ref();
        let results: Vec<_> = stream::iter(desired_bindings(desired, role))
            .map(|binding| async move {
                let result = apply_role_binding(client, &binding).await;
                (binding, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (binding, result) in results {
            match result {
                Ok(outcome) => {
                    if outcome != ApplyOutcome::Unchanged {
                        info!(
                            namespace = %binding.namespace,
                            set = %binding.set_name,
                            outcome = outcome.as_str(),
                            "RoleBinding applied"
                        );
                    }
                    metrics::record_outcome(role.as_str(), outcome.as_str());
                    role_report.record(outcome);
                }
                Err(e) => {
                    if e.is_conflict() {
                        debug!(
                            namespace = %binding.namespace,
                            "RoleBinding changed concurrently, retrying next pass"
                        );
                    } else {
                        warn!(
                            namespace = %binding.namespace,
                            error = %e,
                            "Failed to apply RoleBinding"
                        );
                    }
                    metrics::record_error(role.as_str(), SyncAction::Apply.as_str());
                    report.errors.push(SyncError {
                        role,
                        action: SyncAction::Apply,
                        name: binding.name(),
                        namespace: Some(binding.namespace),
                        source: e,
                    });
                }
            }
        }
    }

    async fn collect_garbage(
        &self,
        role: SetRole,
        desired: &NamespaceSubjectMap,
        role_report: &mut RoleReport,
        report: &mut PassReport,
    ) {
        let name = role.binding_name();

        let existing = match self.client.list(managed_selector()).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!(error = %e, "Failed to list RoleBindings, skipping garbage collection");
                metrics::record_error(role.as_str(), SyncAction::List.as_str());
                role_report.gc_skipped = true;
                report.errors.push(SyncError {
                    role,
                    action: SyncAction::List,
                    namespace: None,
                    name,
                    source: e,
                });
                return;
            }
        };

        let stale: Vec<String> = existing
            .into_iter()
            .filter(|rb| rb.metadata.name.as_deref() == Some(name.as_str()))
            .filter_map(|rb| rb.metadata.namespace)
            .filter(|namespace| !desired.contains(namespace))
            .collect();

        let client = self.client.as_ref();
        let name = name.as_str();
        let results: Vec<_> = stream::iter(stale)
            .map(|namespace| async move {
                let result = client.delete(&namespace, name).await;
                (namespace, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (namespace, result) in results {
            match result {
                Ok(()) => {
                    info!(namespace = %namespace, "Deleted stale RoleBinding");
                    metrics::record_outcome(role.as_str(), "deleted");
                    role_report.deleted += 1;
                }
                Err(e) => {
                    warn!(
                        namespace = %namespace,
                        error = %e,
                        "Failed to delete stale RoleBinding"
                    );
                    metrics::record_error(role.as_str(), SyncAction::Delete.as_str());
                    report.errors.push(SyncError {
                        role,
                        action: SyncAction::Delete,
                        namespace: Some(namespace),
                        name: name.to_string(),
                        source: e,
                    });
                }
            }
        }
    }

    /// Reconcile immediately, then every `period` until `cancel` fires
    ///
    /// Missed ticks are delayed, never bursted. Cancellation also abandons a
    /// pass that is in flight.
    pub async fn run<S>(&self, period: Duration, source: &S, cancel: CancellationToken)
    where
        S: MembershipSource + ?Sized,
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period_secs = period.as_secs(),
            "RoleBinding sync loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let snapshot = source.snapshot();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancelled during RoleBinding sync pass");
                    break;
                }
                report = self.reconcile(&snapshot) => log_report(&report),
            }
        }

        info!("RoleBinding sync loop stopped");
    }

    /// Run [`Reconciler::run`] on its own task
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        source: Arc<dyn MembershipSource>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(period, source.as_ref(), cancel).await
        })
    }
}

fn log_report(report: &PassReport) {
    if report.is_clean() {
        debug!(
            mutations = report.mutations(),
            "RoleBinding sync pass complete"
        );
    } else {
        warn!(
            mutations = report.mutations(),
            errors = report.errors.len(),
            "RoleBinding sync pass completed with errors"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use k8s_openapi::api::rbac::v1::{RoleRef, Subject};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;
    use parking_lot::Mutex;
    use rstest::rstest;

    use crate::client::MockRoleBindingClient;
    use crate::naming::{CLUSTER_SET_LABEL, CLUSTER_SET_ROLE_LABEL};
    use crate::subjects::{user_subject, MockSubjectAccessCache, SubjectRecord};

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        }))
    }

    fn mapper(pairs: &[(&str, &str)]) -> SetMapper {
        pairs.iter().copied().collect()
    }

    fn desired(namespace: &str, role: SetRole, subjects: Vec<Subject>) -> DesiredBinding {
        DesiredBinding {
            namespace: namespace.to_string(),
            role,
            set_name: "s1".to_string(),
            subjects,
        }
    }

    fn live(desired: &DesiredBinding) -> RoleBinding {
        let mut rb = desired.to_role_binding();
        rb.metadata.resource_version = Some("42".to_string());
        rb
    }

    fn managed(namespace: &str, name: &str) -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn cache(records: Vec<SubjectRecord>) -> Arc<dyn SubjectAccessCache> {
        let mut cache = MockSubjectAccessCache::new();
        cache
            .expect_subject_records()
            .returning(move |_| records.clone());
        Arc::new(cache)
    }

    /// Captures every write so tests assert on outcomes instead of call shapes
    #[derive(Clone, Default)]
    struct WriteCapture {
        created: Arc<Mutex<Vec<RoleBinding>>>,
        updated: Arc<Mutex<Vec<RoleBinding>>>,
        deleted: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl WriteCapture {
        fn created_namespaces(&self) -> Vec<String> {
            let created = self.created.lock();
            let mut ns: Vec<String> = created
                .iter()
                .filter_map(|rb| rb.metadata.namespace.clone())
                .collect();
            ns.sort();
            ns
        }

        fn deleted(&self) -> Vec<(String, String)> {
            let mut d = self.deleted.lock().clone();
            d.sort();
            d
        }

        fn updated(&self) -> Vec<RoleBinding> {
            self.updated.lock().clone()
        }

        /// Mock that records writes; `get` and `list` are left to the test
        fn client(&self) -> MockRoleBindingClient {
            let mut client = MockRoleBindingClient::new();
            let created = self.created.clone();
            client.expect_create().returning(move |rb| {
                created.lock().push(rb.clone());
                Ok(rb.clone())
            });
            let updated = self.updated.clone();
            client.expect_update().returning(move |rb| {
                updated.lock().push(rb.clone());
                Ok(rb.clone())
            });
            let deleted = self.deleted.clone();
            client.expect_delete().returning(move |ns, name| {
                deleted.lock().push((ns.to_string(), name.to_string()));
                Ok(())
            });
            client
        }
    }

    // ===== apply_role_binding =====

    #[tokio::test]
    async fn test_absent_binding_is_created() {
        let capture = WriteCapture::default();
        let mut client = capture.client();
        client.expect_get().returning(|_, _| Ok(None));

        let d = desired("ns-a", SetRole::Admin, vec![user_subject("x")]);
        let outcome = apply_role_binding(&client, &d).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Created);
        assert_eq!(capture.created_namespaces(), vec!["ns-a"]);
    }

    /// Story: a second apply of an identical binding performs no mutation
    #[tokio::test]
    async fn story_apply_is_idempotent() {
        let d = desired("ns-a", SetRole::Admin, vec![user_subject("x")]);
        let existing = live(&d);

        // No create/update/delete expectations: any write would panic
        let mut client = MockRoleBindingClient::new();
        client
            .expect_get()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let outcome = apply_role_binding(&client, &d).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_missing_subjects_equal_empty_subjects() {
        let d = desired("ns-a", SetRole::View, vec![]);
        let mut existing = live(&d);
        existing.subjects = None;

        let mut client = MockRoleBindingClient::new();
        client
            .expect_get()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let outcome = apply_role_binding(&client, &d).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_changed_subjects_update_in_place_keeping_resource_version() {
        let d = desired("ns-a", SetRole::Admin, vec![user_subject("y")]);
        let mut existing = live(&d);
        existing.subjects = Some(vec![user_subject("x")]);

        let capture = WriteCapture::default();
        let mut client = capture.client();
        client
            .expect_get()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let outcome = apply_role_binding(&client, &d).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Updated);
        let updated = capture.updated();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].subjects, Some(vec![user_subject("y")]));
        assert_eq!(updated[0].metadata.resource_version.as_deref(), Some("42"));
    }

    /// Story: a binding written by an older version without the role label is
    /// relabeled, and labels added by other tools survive
    #[tokio::test]
    async fn story_missing_label_is_restored_and_foreign_labels_kept() {
        let d = desired("ns-a", SetRole::Admin, vec![user_subject("x")]);
        let mut existing = live(&d);
        existing.metadata.labels = Some(
            [
                (CLUSTER_SET_LABEL.to_string(), "s1".to_string()),
                ("team".to_string(), "blue".to_string()),
            ]
            .into(),
        );

        let capture = WriteCapture::default();
        let mut client = capture.client();
        client
            .expect_get()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let outcome = apply_role_binding(&client, &d).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Updated);
        let labels = capture.updated()[0].metadata.labels.clone().unwrap();
        assert_eq!(labels[CLUSTER_SET_ROLE_LABEL], "admin");
        assert_eq!(labels["team"], "blue");
    }

    #[tokio::test]
    async fn test_changed_role_ref_recreates() {
        let d = desired("ns-a", SetRole::View, vec![user_subject("x")]);
        let mut existing = live(&d);
        existing.role_ref = RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: "edit".to_string(),
        };

        let capture = WriteCapture::default();
        let mut client = capture.client();
        client
            .expect_get()
            .returning(move |_, _| Ok(Some(existing.clone())));

        let outcome = apply_role_binding(&client, &d).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Recreated);
        assert_eq!(
            capture.deleted(),
            vec![("ns-a".to_string(), SetRole::View.binding_name())]
        );
        assert_eq!(capture.created_namespaces(), vec!["ns-a"]);
    }

    #[tokio::test]
    async fn test_get_failure_propagates() {
        let mut client = MockRoleBindingClient::new();
        client.expect_get().returning(|_, _| Err(api_error(500)));

        let d = desired("ns-a", SetRole::Admin, vec![]);
        assert!(apply_role_binding(&client, &d).await.is_err());
    }

    // ===== snapshot → desired =====

    #[test]
    fn test_clusters_win_over_namespaces() {
        let snapshot = MembershipSnapshot {
            clusters: mapper(&[("s2", "shared")]),
            namespaces: mapper(&[("s1", "shared"), ("s1", "ns-only")]),
            global: SetMapper::new(),
        };
        let members = snapshot.set_members();
        assert_eq!(members.owner_of("shared"), Some("s2"));
        assert_eq!(members.owner_of("ns-only"), Some("s1"));
    }

    #[rstest]
    #[case::admin_ignores_global(SetRole::Admin, 1)]
    #[case::view_includes_global(SetRole::View, 2)]
    fn test_global_only_counts_for_view(#[case] role: SetRole, #[case] expected: usize) {
        let snapshot = MembershipSnapshot {
            clusters: mapper(&[("s1", "cluster-1")]),
            namespaces: SetMapper::new(),
            global: mapper(&[("global", "cluster-1"), ("global", "cluster-2")]),
        };
        let subjects: SubjectsBySet = [
            ("s1".to_string(), vec![user_subject("x")]),
            ("global".to_string(), vec![user_subject("g")]),
        ]
        .into();

        assert_eq!(snapshot.desired(role, &subjects).len(), expected);
    }

    // ===== reconcile =====

    fn reconciler(client: MockRoleBindingClient, records: Vec<SubjectRecord>) -> Reconciler {
        Reconciler::new(Arc::new(client), cache(records.clone()), cache(records))
    }

    /// Story: one namespace failing to apply does not stop the others; the
    /// failure is reported with its namespace
    #[tokio::test]
    async fn story_partial_failure_is_isolated() {
        let capture = WriteCapture::default();
        let mut client = capture.client();
        client.expect_get().returning(|ns, _| {
            if ns == "ns-bad" {
                Err(api_error(500))
            } else {
                Ok(None)
            }
        });
        client.expect_list().returning(|_| Ok(vec![]));

        let snapshot = MembershipSnapshot {
            namespaces: mapper(&[("s1", "ns-bad"), ("s1", "ns-good")]),
            ..Default::default()
        };
        let r = reconciler(client, vec![SubjectRecord::user("x", ["s1"])]);

        let report = r.reconcile(&snapshot).await;

        // admin + view each create ns-good
        assert_eq!(capture.created_namespaces(), vec!["ns-good", "ns-good"]);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .all(|e| e.action == SyncAction::Apply && e.namespace.as_deref() == Some("ns-bad")));
        assert_eq!(report.role(SetRole::Admin).map(|r| r.created), Some(1));
    }

    /// Story: garbage collection only touches bindings carrying this role's
    /// name, and only in namespaces that are no longer desired
    #[tokio::test]
    async fn story_gc_is_scoped_to_role_name_and_undesired_namespaces() {
        let admin = SetRole::Admin.binding_name();
        let view = SetRole::View.binding_name();
        let existing = vec![
            managed("ns-a", &admin),
            managed("ns-gone", &admin),
            managed("ns-gone", &view),
            managed("ns-gone", "someone-elses-binding"),
        ];

        let capture = WriteCapture::default();
        let mut client = capture.client();
        client.expect_get().returning(|_, _| Ok(None));
        client
            .expect_list()
            .returning(move |_| Ok(existing.clone()));

        let snapshot = MembershipSnapshot {
            namespaces: mapper(&[("s1", "ns-a")]),
            ..Default::default()
        };
        let r = reconciler(client, vec![SubjectRecord::user("x", ["s1"])]);

        let report = r.reconcile(&snapshot).await;

        assert!(report.is_clean());
        assert_eq!(
            capture.deleted(),
            vec![
                ("ns-gone".to_string(), admin),
                ("ns-gone".to_string(), view),
            ]
        );
    }

    #[tokio::test]
    async fn test_gc_uses_managed_label_selector() {
        let mut client = MockRoleBindingClient::new();
        client
            .expect_list()
            .withf(|selector| selector == CLUSTER_SET_LABEL)
            .times(2)
            .returning(|_| Ok(vec![]));

        let r = reconciler(client, vec![]);
        let report = r.reconcile(&MembershipSnapshot::default()).await;
        assert_eq!(report.mutations(), 0);
    }

    /// Story: when listing fails, creates still happen but nothing is deleted
    #[tokio::test]
    async fn story_list_failure_skips_gc() {
        let capture = WriteCapture::default();
        let mut client = capture.client();
        client.expect_get().returning(|_, _| Ok(None));
        client.expect_list().returning(|_| Err(api_error(503)));

        let snapshot = MembershipSnapshot {
            namespaces: mapper(&[("s1", "ns-a")]),
            ..Default::default()
        };
        let r = reconciler(client, vec![SubjectRecord::user("x", ["s1"])]);

        let report = r.reconcile(&snapshot).await;

        assert!(capture.deleted().is_empty());
        assert_eq!(capture.created_namespaces().len(), 2);
        assert!(report.roles.iter().all(|r| r.gc_skipped));
        assert!(report.errors.iter().all(|e| e.action == SyncAction::List));
        assert_eq!(report.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_failure_is_reported() {
        let admin = SetRole::Admin.binding_name();
        let mut client = MockRoleBindingClient::new();
        client
            .expect_list()
            .returning(move |_| Ok(vec![managed("ns-gone", &admin)]));
        client.expect_delete().returning(|_, _| Err(api_error(403)));

        let r = reconciler(client, vec![]);
        let report = r.reconcile(&MembershipSnapshot::default()).await;

        assert_eq!(report.errors.len(), 1);
        let err = &report.errors[0];
        assert_eq!(err.action, SyncAction::Delete);
        assert_eq!(err.role, SetRole::Admin);
        assert!(err.to_string().contains("ns-gone"));
    }

    /// Story: a binding edited by someone else between get and update loses
    /// the race; the conflict is reported and the next pass picks it up
    #[tokio::test]
    async fn story_update_conflict_is_reported_not_fatal() {
        let mut client = MockRoleBindingClient::new();
        client.expect_get().returning(|ns, name| {
            let role = if name == SetRole::Admin.binding_name() {
                SetRole::Admin
            } else {
                SetRole::View
            };
            Ok(Some(live(&desired(ns, role, vec![]))))
        });
        client.expect_update().returning(|_| Err(api_error(409)));
        client.expect_list().returning(|_| Ok(vec![]));

        let snapshot = MembershipSnapshot {
            namespaces: mapper(&[("s1", "ns-a")]),
            ..Default::default()
        };
        let r = reconciler(client, vec![SubjectRecord::user("x", ["s1"])]);

        let report = r.reconcile(&snapshot).await;

        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .all(|e| e.action == SyncAction::Apply && e.source.is_conflict()));
        assert_eq!(report.roles.len(), 2);
    }

    /// Client that tracks how many `get` calls are in flight at once
    #[derive(Default)]
    struct PeakClient {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RoleBindingClient for PeakClient {
        async fn get(&self, _: &str, _: &str) -> Result<Option<RoleBinding>, Error> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }
        async fn create(&self, rb: &RoleBinding) -> Result<RoleBinding, Error> {
            Ok(rb.clone())
        }
        async fn update(&self, rb: &RoleBinding) -> Result<RoleBinding, Error> {
            Ok(rb.clone())
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn list(&self, _: &str) -> Result<Vec<RoleBinding>, Error> {
            Ok(vec![])
        }
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(4)]
    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bounds_in_flight_writes(#[case] limit: usize) {
        let client = Arc::new(PeakClient::default());
        let records = vec![SubjectRecord::user("x", ["s1"])];
        let r = Reconciler::new(client.clone(), cache(records.clone()), cache(records));
        let r = r.with_concurrency(limit);

        let namespaces: Vec<String> = (0..8).map(|i| format!("ns-{i}")).collect();
        let snapshot = MembershipSnapshot {
            namespaces: namespaces.iter().map(|ns| ("s1", ns.as_str())).collect(),
            ..Default::default()
        };

        let report = r.reconcile(&snapshot).await;

        assert!(report.is_clean());
        assert_eq!(report.role(SetRole::Admin).map(|r| r.created), Some(8));
        assert_eq!(client.peak.load(Ordering::SeqCst), limit);
    }

    #[test]
    fn test_zero_concurrency_is_raised_to_one() {
        let r = reconciler(MockRoleBindingClient::new(), vec![]).with_concurrency(0);
        assert_eq!(r.concurrency, 1);
    }

    #[test]
    fn test_list_error_message_names_all_namespaces() {
        let err = SyncError {
            role: SetRole::View,
            action: SyncAction::List,
            namespace: None,
            name: SetRole::View.binding_name(),
            source: api_error(500),
        };
        assert!(err.to_string().starts_with("list of view binding"));
        assert!(err.to_string().contains("all namespaces"));
    }

    // ===== run loop =====

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl MembershipSource for CountingSource {
        fn snapshot(&self) -> MembershipSnapshot {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MembershipSnapshot::default()
        }
    }

    fn idle_client() -> MockRoleBindingClient {
        let mut client = MockRoleBindingClient::new();
        client.expect_list().returning(|_| Ok(vec![]));
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pass_is_immediate_then_periodic() {
        let r = Arc::new(reconciler(idle_client(), vec![]));
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();

        let handle = r.spawn(Duration::from_secs(60), source.clone(), cancel.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    /// Client whose reads never complete, to hold a pass in flight
    struct StuckClient;

    #[async_trait::async_trait]
    impl RoleBindingClient for StuckClient {
        async fn get(&self, _: &str, _: &str) -> Result<Option<RoleBinding>, Error> {
            std::future::pending().await
        }
        async fn create(&self, rb: &RoleBinding) -> Result<RoleBinding, Error> {
            Ok(rb.clone())
        }
        async fn update(&self, rb: &RoleBinding) -> Result<RoleBinding, Error> {
            Ok(rb.clone())
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
        async fn list(&self, _: &str) -> Result<Vec<RoleBinding>, Error> {
            std::future::pending().await
        }
    }

    /// Story: shutdown does not wait for a pass stuck on the API server
    #[tokio::test(start_paused = true)]
    async fn story_cancel_aborts_in_flight_pass() {
        let records = vec![SubjectRecord::user("x", ["s1"])];
        let r = Arc::new(Reconciler::new(
            Arc::new(StuckClient),
            cache(records.clone()),
            cache(records),
        ));
        let source: Arc<dyn MembershipSource> = Arc::new(MembershipSnapshot {
            namespaces: mapper(&[("s1", "ns-a")]),
            ..Default::default()
        });
        let cancel = CancellationToken::new();

        let handle = r.spawn(Duration::from_secs(60), source, cancel.clone());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!handle.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_before_start_returns_without_a_pass() {
        let source = CountingSource {
            calls: AtomicUsize::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        reconciler(MockRoleBindingClient::new(), vec![])
            .run(Duration::from_secs(60), &source, cancel)
            .await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }
}
