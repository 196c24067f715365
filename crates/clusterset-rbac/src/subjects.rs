//! Subject resolution: who holds a role on which cluster set
//!
//! Access caches are keyed by subject (a user or group and the sets it may
//! act on). Bindings are keyed by set, so [`resolve`] inverts the records.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::rbac::v1::Subject;

#[cfg(test)]
use mockall::automock;

use crate::naming::SetRole;

/// Set name meaning "every cluster set"
pub const ALL_SETS: &str = "*";

/// API group of User and Group subjects
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Subjects holding a role, keyed by set name
pub type SubjectsBySet = BTreeMap<String, Vec<Subject>>;

/// One subject and the sets on which it holds a role
#[derive(Clone, Debug, PartialEq)]
pub struct SubjectRecord {
    /// The user or group
    pub subject: Subject,
    /// Set names, possibly including [`ALL_SETS`]
    pub sets: BTreeSet<String>,
}

impl SubjectRecord {
    /// Record for a user
    pub fn user<I, S>(name: impl Into<String>, sets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subject: user_subject(name),
            sets: sets.into_iter().map(Into::into).collect(),
        }
    }

    /// Record for a group
    pub fn group<I, S>(name: impl Into<String>, sets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subject: group_subject(name),
            sets: sets.into_iter().map(Into::into).collect(),
        }
    }
}

/// RBAC subject for a user
pub fn user_subject(name: impl Into<String>) -> Subject {
    Subject {
        kind: "User".to_string(),
        name: name.into(),
        api_group: Some(RBAC_API_GROUP.to_string()),
        namespace: None,
    }
}

/// RBAC subject for a group
pub fn group_subject(name: impl Into<String>) -> Subject {
    Subject {
        kind: "Group".to_string(),
        name: name.into(),
        api_group: Some(RBAC_API_GROUP.to_string()),
        namespace: None,
    }
}

/// Read-only view of which subjects hold a role on which sets
///
/// Implementations return a fresh snapshot on every call; the caller never
/// mutates it.
#[cfg_attr(test, automock)]
pub trait SubjectAccessCache: Send + Sync {
    /// Every subject holding `role` on at least one set
    fn subject_records(&self, role: SetRole) -> Vec<SubjectRecord>;
}

/// Append `subject` unless an equal subject is already present
pub(crate) fn push_unique(subjects: &mut Vec<Subject>, subject: &Subject) {
    if !subjects.contains(subject) {
        subjects.push(subject.clone());
    }
}

/// Invert the cache's subject records into set → subjects for `role`
///
/// Subjects keep the order the cache reported them in and appear once per
/// set. Sets without subjects are absent from the result.
pub fn resolve(cache: &dyn SubjectAccessCache, role: SetRole) -> SubjectsBySet {
    let mut by_set = SubjectsBySet::new();
    for record in cache.subject_records(role) {
        for set in &record.sets {
            push_unique(by_set.entry(set.clone()).or_default(), &record.subject);
        }
    }
    by_set
}
