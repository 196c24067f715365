//! Desired state: which subjects belong in which namespace's binding
//!
//! Built from scratch every pass from a membership snapshot and resolved
//! subjects; nothing here is persisted.

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::mapper::SetMapper;
use crate::naming::{binding_labels, SetRole};
use crate::subjects::{push_unique, SubjectsBySet, ALL_SETS, RBAC_API_GROUP};

/// What a single namespace's binding must contain
#[derive(Clone, Debug, PartialEq)]
pub struct NamespaceEntry {
    /// Set that owns the namespace (written to the set label)
    pub set_name: String,
    /// Subjects to bind
    pub subjects: Vec<Subject>,
}

/// Namespace → binding content for one role
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NamespaceSubjectMap {
    entries: BTreeMap<String, NamespaceEntry>,
}

impl NamespaceSubjectMap {
    /// Join set membership with the subjects holding the role on each set
    ///
    /// Every member of a set gets that set's subjects followed by the
    /// subjects granted on [`ALL_SETS`]. Members of a set with neither are
    /// left out entirely, which is what removes their binding.
    pub fn build(mapper: &SetMapper, subjects_by_set: &SubjectsBySet) -> Self {
        let wildcard = subjects_by_set.get(ALL_SETS);
        let mut entries = BTreeMap::new();

        for (set, objects) in mapper.sets() {
            let direct = subjects_by_set.get(set);
            if direct.is_none() && wildcard.is_none() {
                continue;
            }

            let mut subjects = Vec::new();
            for subject in direct.into_iter().chain(wildcard).flatten() {
                push_unique(&mut subjects, subject);
            }

            for object in objects {
                entries.insert(
                    object.clone(),
                    NamespaceEntry {
                        set_name: set.to_string(),
                        subjects: subjects.clone(),
                    },
                );
            }
        }

        Self { entries }
    }

    /// Lay `overlay` on top of this map
    ///
    /// Namespaces of both maps are kept. Where both have a namespace the
    /// overlay's set name wins (as in [`SetMapper::union`]) and the subject
    /// lists are concatenated without duplicates.
    pub fn layer(mut self, overlay: NamespaceSubjectMap) -> Self {
        for (namespace, top) in overlay.entries {
            match self.entries.get_mut(&namespace) {
                Some(base) => {
                    base.set_name = top.set_name;
                    for subject in &top.subjects {
                        push_unique(&mut base.subjects, subject);
                    }
                }
                None => {
                    self.entries.insert(namespace, top);
                }
            }
        }
        self
    }

    /// Entry for `namespace`
    pub fn get(&self, namespace: &str) -> Option<&NamespaceEntry> {
        self.entries.get(namespace)
    }

    /// True when `namespace` should carry a binding
    pub fn contains(&self, namespace: &str) -> bool {
        self.entries.contains_key(namespace)
    }

    /// Namespaces with their entries, ordered by namespace
    pub fn iter(&self) -> impl Iterator<Item = (&str, &NamespaceEntry)> {
        self.entries.iter().map(|(ns, entry)| (ns.as_str(), entry))
    }

    /// Number of namespaces
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no namespace should carry a binding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One [`DesiredBinding`] per namespace of `map` for `role`
pub fn desired_bindings(map: &NamespaceSubjectMap, role: SetRole) -> Vec<DesiredBinding> {
    map.iter()
        .map(|(namespace, entry)| DesiredBinding {
            namespace: namespace.to_string(),
            role,
            set_name: entry.set_name.clone(),
            subjects: entry.subjects.clone(),
        })
        .collect()
}

/// A binding the cluster should contain
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredBinding {
    /// Target namespace
    pub namespace: String,
    /// Role granted
    pub role: SetRole,
    /// Owning set
    pub set_name: String,
    /// Subjects granted the role
    pub subjects: Vec<Subject>,
}

impl DesiredBinding {
    /// Binding object name (same in every namespace)
    pub fn name(&self) -> String {
        self.role.binding_name()
    }

    /// Reference to the ClusterRole named after the role
    pub fn role_ref(&self) -> RoleRef {
        RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: self.role.cluster_role().to_string(),
        }
    }

    /// Render the Kubernetes object
    pub fn to_role_binding(&self) -> RoleBinding {
        RoleBinding {
            metadata: ObjectMeta {
                name: Some(self.name()),
                namespace: Some(self.namespace.clone()),
                labels: Some(binding_labels(&self.set_name, self.role)),
                ..Default::default()
            },
            role_ref: self.role_ref(),
            subjects: Some(self.subjects.clone()),
        }
    }
}
