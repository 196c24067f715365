//! Bidirectional cluster set ↔ member object mapping
//!
//! A [`SetMapper`] records which set owns each object (a managed cluster name
//! or a namespace; a managed cluster's namespace equals its name). Every
//! object has at most one owner:
//!
//! - [`SetMapper::add`] moves an object that is already owned (last write wins)
//! - [`SetMapper::union`] lets the argument win over the receiver
//!
//! Both rules are part of the contract and are covered by tests.

use std::collections::{BTreeMap, BTreeSet};

static EMPTY: BTreeSet<String> = BTreeSet::new();

/// Partition of object names into named cluster sets
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetMapper {
    set_to_objects: BTreeMap<String, BTreeSet<String>>,
    object_to_set: BTreeMap<String, String>,
}

impl SetMapper {
    /// Create an empty mapper
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `object` as a member of `set`, moving it out of any set that
    /// previously owned it
    pub fn add(&mut self, set: impl Into<String>, object: impl Into<String>) {
        let set = set.into();
        let object = object.into();

        if let Some(previous) = self.object_to_set.get(&object) {
            if *previous == set {
                return;
            }
            let previous = previous.clone();
            self.detach(&previous, &object);
        }

        self.set_to_objects
            .entry(set.clone())
            .or_default()
            .insert(object.clone());
        self.object_to_set.insert(object, set);
    }

    /// Drop the membership of `object`; no-op when it has none
    pub fn remove(&mut self, object: &str) {
        if let Some(set) = self.object_to_set.remove(object) {
            self.detach(&set, object);
        }
    }

    /// Make `objects` the complete member list of `set`
    ///
    /// Members of `set` not listed are dropped; listed objects owned by other
    /// sets are moved here.
    pub fn replace_set<I, S>(&mut self, set: &str, objects: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.remove_set(set);
        for object in objects {
            self.add(set, object);
        }
    }

    /// Drop a set and every membership it holds
    pub fn remove_set(&mut self, set: &str) {
        if let Some(objects) = self.set_to_objects.remove(set) {
            for object in objects {
                self.object_to_set.remove(&object);
            }
        }
    }

    /// Combine two mappers into a new one
    ///
    /// Contains every (set, object) pair of both operands. An object owned by
    /// different sets in the two operands ends up owned by `other`'s set.
    /// Neither operand is modified.
    pub fn union(&self, other: &SetMapper) -> SetMapper {
        let mut merged = self.clone();
        for (object, set) in &other.object_to_set {
            merged.add(set.as_str(), object.as_str());
        }
        merged
    }

    /// Members of `set`; empty when the set is unknown
    pub fn objects_of(&self, set: &str) -> &BTreeSet<String> {
        self.set_to_objects.get(set).unwrap_or(&EMPTY)
    }

    /// Set owning `object`, if any
    pub fn owner_of(&self, object: &str) -> Option<&str> {
        self.object_to_set.get(object).map(String::as_str)
    }

    /// Iterate over every non-empty set with its members, ordered by set name
    pub fn sets(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.set_to_objects
            .iter()
            .map(|(set, objects)| (set.as_str(), objects))
    }

    /// Number of objects with an owner
    pub fn len(&self) -> usize {
        self.object_to_set.len()
    }

    /// True when no object has an owner
    pub fn is_empty(&self) -> bool {
        self.object_to_set.is_empty()
    }

    fn detach(&mut self, set: &str, object: &str) {
        if let Some(objects) = self.set_to_objects.get_mut(set) {
            objects.remove(object);
            if objects.is_empty() {
                self.set_to_objects.remove(set);
            }
        }
    }
}

impl<S, O> FromIterator<(S, O)> for SetMapper
where
    S: Into<String>,
    O: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (S, O)>>(iter: I) -> Self {
        let mut mapper = SetMapper::new();
        for (set, object) in iter {
            mapper.add(set, object);
        }
        mapper
    }
}
