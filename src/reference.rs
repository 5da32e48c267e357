//! Process-wide reference index for reverse owner lookups.
//!
//! Migrations reference plans, plans reference clusters and storage, and
//! clusters know nothing of either. Forward references live on the specs;
//! the reverse direction (which migrations care about this plan?) goes
//! through this index, updated by watch predicates. Resources never embed
//! parent pointers.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Identifies a referenced target.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Target {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

/// Identifies an owner holding a reference.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Owner {
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
}

/// Maps `(target kind, namespace, name)` to the set of owners referencing
/// it. Shared by all controllers in the process.
#[derive(Debug, Default)]
pub struct RefIndex {
    inner: RwLock<HashMap<Target, BTreeSet<Owner>>>,
}

impl RefIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of targets an owner references. Called on every add
    /// or update watch event for the owner.
    pub fn set_owner(&self, owner: Owner, targets: Vec<Target>) {
        let mut inner = self.inner.write().expect("reference index poisoned");
        for owners in inner.values_mut() {
            owners.remove(&owner);
        }
        for target in targets {
            inner.entry(target).or_default().insert(owner.clone());
        }
        inner.retain(|_, owners| !owners.is_empty());
    }

    /// Remove an owner entirely. Called on delete watch events.
    pub fn remove_owner(&self, owner: &Owner) {
        let mut inner = self.inner.write().expect("reference index poisoned");
        for owners in inner.values_mut() {
            owners.remove(owner);
        }
        inner.retain(|_, owners| !owners.is_empty());
    }

    /// Owners currently referencing a target, sorted for determinism.
    pub fn owners_of(&self, target: &Target) -> Vec<Owner> {
        self.inner
            .read()
            .expect("reference index poisoned")
            .get(target)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> Target {
        Target {
            kind: "MigPlan",
            namespace: "openshift-migration".to_string(),
            name: name.to_string(),
        }
    }

    fn owner(name: &str) -> Owner {
        Owner {
            kind: "MigMigration",
            namespace: "openshift-migration".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_set_and_lookup() {
        let index = RefIndex::new();
        index.set_owner(owner("m1"), vec![target("plan-a")]);
        index.set_owner(owner("m2"), vec![target("plan-a")]);

        let owners = index.owners_of(&target("plan-a"));
        assert_eq!(owners.len(), 2);
    }

    #[test]
    fn test_set_owner_replaces_previous_targets() {
        let index = RefIndex::new();
        index.set_owner(owner("m1"), vec![target("plan-a")]);
        index.set_owner(owner("m1"), vec![target("plan-b")]);

        assert!(index.owners_of(&target("plan-a")).is_empty());
        assert_eq!(index.owners_of(&target("plan-b")).len(), 1);
    }

    #[test]
    fn test_remove_owner() {
        let index = RefIndex::new();
        index.set_owner(owner("m1"), vec![target("plan-a")]);
        index.remove_owner(&owner("m1"));
        assert!(index.owners_of(&target("plan-a")).is_empty());
    }
}
