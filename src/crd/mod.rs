//! Custom resource definitions for the migration API group.
//!
//! All resources live under `migration.openshift.io/v1alpha1` and follow a
//! common shape: a `spec` holding user intent and a `status` holding
//! conditions plus observed state. Foreign APIs (the BR engine's resources
//! and OpenShift routes/image streams) are declared in [`velero`] and
//! [`route`] with only the fields this controller touches.

pub mod cluster;
pub mod condition;
pub mod direct_image;
pub mod direct_volume;
pub mod hook;
pub mod migration;
pub mod plan;
pub mod route;
pub mod storage;
pub mod velero;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use cluster::{MigCluster, MigClusterSpec, MigClusterStatus};
pub use condition::{Category, Condition, Conditions, FALSE, TRUE};
pub use direct_image::{DirectImageMigration, DirectImageMigrationSpec, DirectImageMigrationStatus};
pub use direct_volume::{
    DirectVolumeMigration, DirectVolumeMigrationProgress, DirectVolumeMigrationProgressSpec,
    DirectVolumeMigrationProgressStatus, DirectVolumeMigrationSpec, DirectVolumeMigrationStatus,
    PodProgress, RsyncPodStatus,
};
pub use hook::{MigHook, MigHookSpec, MigHookStatus};
pub use migration::{MigMigration, MigMigrationSpec, MigMigrationStatus};
pub use plan::{
    HookBinding, MigPlan, MigPlanSpec, MigPlanStatus, PlanPv, PvAction, PvCopyMethod, PvSelection,
    PvcRef,
};
pub use storage::{MigStorage, MigStorageSpec, MigStorageStatus};

/// Namespace the controller and the BR engine are deployed in.
pub const MIGRATION_NAMESPACE: &str = "openshift-migration";

/// Namespace the BR engine watches for backups and restores.
pub const VELERO_NAMESPACE: &str = "openshift-migration";

/// Correlation labels. Every cluster resource the controller creates on
/// either cluster carries the owning plan and migration UID so parallel
/// migrations cannot collide.
pub const MIG_PLAN_LABEL: &str = "migration.openshift.io/migplan";
pub const MIG_MIGRATION_LABEL: &str = "migration.openshift.io/migmigration";
pub const MIG_PLAN_DEBUG_LABEL: &str = "migplan";
pub const MIG_MIGRATION_DEBUG_LABEL: &str = "migmigration";

/// Condition types shared across resources.
pub const READY: &str = "Ready";
pub const RUNNING: &str = "Running";
pub const SUCCEEDED: &str = "Succeeded";
pub const FAILED: &str = "Failed";
pub const CANCELING: &str = "Canceling";
pub const CANCELED: &str = "Canceled";

/// A reference to another object by namespace and name.
///
/// Cluster-scoped targets leave `namespace` empty.
#[derive(
    Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether both coordinates are populated.
    pub fn is_set(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty()
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ref_display() {
        assert_eq!(ObjectRef::new("ns", "name").to_string(), "ns/name");
        assert_eq!(ObjectRef::new("", "name").to_string(), "name");
    }

    #[test]
    fn test_object_ref_is_set() {
        assert!(ObjectRef::new("ns", "name").is_set());
        assert!(!ObjectRef::new("", "name").is_set());
        assert!(!ObjectRef::default().is_set());
    }
}
