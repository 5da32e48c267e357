//! Common resource generation utilities.
//!
//! Correlation labels and owner references shared by every object the
//! controllers create. Cross-cluster objects carry correlation labels only
//! (owner references do not span clusters); host-cluster objects get a
//! real owner reference for garbage collection.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};

/// API version of the migration group.
pub const API_VERSION: &str = "migration.openshift.io/v1alpha1";

/// Create an owner reference for a migration-group resource on the host
/// cluster, so owned objects are garbage collected with their owner.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
        ..Default::default()
    }
}

/// Merge two label maps, the right side winning on conflicts.
pub fn merged_labels(
    base: BTreeMap<String, String>,
    extra: BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = base;
    labels.extend(extra);
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MigMigration, MigMigrationSpec};

    #[test]
    fn test_owner_reference_kind() {
        let migration = MigMigration::new("final-1", MigMigrationSpec::default());
        let owner_ref = owner_reference(&migration);
        assert_eq!(owner_ref.kind, "MigMigration");
        assert_eq!(owner_ref.name, "final-1");
        assert_eq!(owner_ref.api_version, API_VERSION);
        assert_eq!(owner_ref.controller, Some(true));
    }

    #[test]
    fn test_merged_labels_right_wins() {
        let mut base = BTreeMap::new();
        base.insert("a".to_string(), "1".to_string());
        base.insert("b".to_string(), "1".to_string());
        let mut extra = BTreeMap::new();
        extra.insert("b".to_string(), "2".to_string());

        let merged = merged_labels(base, extra);
        assert_eq!(merged.get("a"), Some(&"1".to_string()));
        assert_eq!(merged.get("b"), Some(&"2".to_string()));
    }
}
