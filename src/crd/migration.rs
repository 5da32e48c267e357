//! MigMigration Custom Resource Definition.
//!
//! A MigMigration is one attempt to execute a MigPlan. The task engine
//! persists its resume point in `status.phase` and the itinerary name in
//! `status.itinerary`; both are opaque strings to everything but the engine.

use std::collections::BTreeMap;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::{MIG_MIGRATION_DEBUG_LABEL, MIG_MIGRATION_LABEL, ObjectRef};

/// MigMigration executes a MigPlan.
///
/// `migPlanRef` and `stage` are immutable once set; everything else may be
/// edited while the migration runs (notably `canceled`).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "MigMigration",
    plural = "migmigrations",
    status = "MigMigrationStatus",
    namespaced,
    printcolumn = r#"{"name":"Plan", "type":"string", "jsonPath":".spec.migPlanRef.name"}"#,
    printcolumn = r#"{"name":"Stage", "type":"boolean", "jsonPath":".spec.stage"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Itinerary", "type":"string", "jsonPath":".status.itinerary"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigMigrationSpec {
    /// Reference to the MigPlan to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mig_plan_ref: Option<ObjectRef>,

    /// Run the stage itinerary (volume pre-copy) instead of the final
    /// cut-over.
    #[serde(default)]
    pub stage: bool,

    /// Scale application workloads to zero for the duration of the copy.
    #[serde(default)]
    pub quiesce_pods: bool,

    /// Verify copied data after restore.
    #[serde(default)]
    pub verify: bool,

    /// Keep migration annotations and labels on migrated resources.
    #[serde(default)]
    pub keep_annotations: bool,

    /// Cancel the migration. The next reconcile switches to the cancel
    /// itinerary.
    #[serde(default)]
    pub canceled: bool,

    /// Roll back a completed or failed migration.
    #[serde(default)]
    pub rollback: bool,
}

/// Observed state of a MigMigration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigMigrationStatus {
    /// Conditions describing the migration.
    #[serde(default)]
    pub conditions: Conditions,

    /// Current phase: the persistent resume point of the task engine.
    #[serde(default)]
    pub phase: String,

    /// Name of the itinerary the phase belongs to.
    #[serde(default)]
    pub itinerary: String,

    /// Human-readable progress lines for the current phase.
    #[serde(default)]
    pub progress: Vec<String>,

    /// Accumulated error strings.
    #[serde(default)]
    pub errors: Vec<String>,

    /// When the migration started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    /// When the migration reached a terminal phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MigMigration {
    /// Whether any errors were recorded.
    pub fn has_errors(&self) -> bool {
        self.status.as_ref().is_some_and(|s| !s.errors.is_empty())
    }

    /// Append errors, skipping duplicates.
    pub fn add_errors(&mut self, errors: &[String]) {
        let status = self.status.get_or_insert_with(Default::default);
        for error in errors {
            if !status.errors.contains(error) {
                status.errors.push(error.clone());
            }
        }
    }

    /// Correlation labels identifying resources owned by this migration.
    pub fn correlation_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            MIG_MIGRATION_LABEL.to_string(),
            self.uid().unwrap_or_default(),
        );
        labels.insert(MIG_MIGRATION_DEBUG_LABEL.to_string(), self.name_any());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_errors_deduplicates() {
        let mut migration = MigMigration::new("m", MigMigrationSpec::default());
        migration.add_errors(&["boom".to_string()]);
        migration.add_errors(&["boom".to_string(), "bang".to_string()]);

        let errors = migration.status.unwrap().errors;
        assert_eq!(errors, vec!["boom".to_string(), "bang".to_string()]);
    }

    #[test]
    fn test_has_errors() {
        let mut migration = MigMigration::new("m", MigMigrationSpec::default());
        assert!(!migration.has_errors());
        migration.add_errors(&["boom".to_string()]);
        assert!(migration.has_errors());
    }
}
