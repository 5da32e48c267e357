//! DirectImageMigration Custom Resource Definition.
//!
//! Mirrors container image streams tag-by-tag between the internal
//! registries of the two clusters, without staging through object storage.

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::condition::Conditions;
use super::{MIG_MIGRATION_DEBUG_LABEL, MIG_MIGRATION_LABEL, ObjectRef};

/// DirectImageMigration mirrors image streams between clusters.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "DirectImageMigration",
    plural = "directimagemigrations",
    shortname = "dim",
    status = "DirectImageMigrationStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DirectImageMigrationSpec {
    /// Reference to the source MigCluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_mig_cluster_ref: Option<ObjectRef>,

    /// Reference to the destination MigCluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_mig_cluster_ref: Option<ObjectRef>,

    /// Namespaces whose image streams are mirrored, `src` or `src:dest`.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

/// Completion record for one image stream.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamResult {
    /// Image stream namespace/name.
    pub namespace: String,
    pub name: String,

    /// Whether the mirror completed successfully.
    #[serde(default)]
    pub succeeded: bool,

    /// Failure reasons, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Observed state of a DirectImageMigration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectImageMigrationStatus {
    /// Conditions describing the mirror.
    #[serde(default)]
    pub conditions: Conditions,

    /// Current phase of the mirror itinerary.
    #[serde(default)]
    pub phase: String,

    /// Accumulated error strings.
    #[serde(default)]
    pub errors: Vec<String>,

    /// Per-stream results.
    #[serde(default)]
    pub image_streams: Vec<ImageStreamResult>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DirectImageMigration {
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

    /// Correlation labels identifying resources owned by this mirror.
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
