//! DirectVolumeMigration and DirectVolumeMigrationProgress CRDs.
//!
//! A DirectVolumeMigration copies PVC data from source to destination with
//! rsync over a TLS tunnel, bypassing object storage. Each client pod gets a
//! DirectVolumeMigrationProgress resource that the progress controller fills
//! in asynchronously from the pod's logs.

use std::collections::BTreeMap;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::plan::PvcRef;
use super::{MIG_MIGRATION_DEBUG_LABEL, MIG_MIGRATION_LABEL, ObjectRef};

/// DirectVolumeMigration copies claims between clusters with rsync.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "DirectVolumeMigration",
    plural = "directvolumemigrations",
    shortname = "dvm",
    status = "DirectVolumeMigrationStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DirectVolumeMigrationSpec {
    /// Reference to the source MigCluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_mig_cluster_ref: Option<ObjectRef>,

    /// Reference to the destination MigCluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_mig_cluster_ref: Option<ObjectRef>,

    /// Claims to transfer.
    #[serde(default)]
    pub persistent_volume_claims: Vec<PvcRef>,

    /// Delete per-PVC progress resources during teardown.
    #[serde(default)]
    pub delete_progress_reporting_crs: bool,
}

/// Progress summary for one rsync client pod.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodProgress {
    /// The pod being tracked.
    pub pod_ref: ObjectRef,

    /// Most recent progress percent, as reported ("94%").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_observed_progress_percent: String,

    /// Most recent transfer rate, as reported ("40.95MB/s").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_observed_transfer_rate: String,
}

/// Observed state of a DirectVolumeMigration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectVolumeMigrationStatus {
    /// Conditions describing the transfer.
    #[serde(default)]
    pub conditions: Conditions,

    /// Current phase of the transfer itinerary.
    #[serde(default)]
    pub phase: String,

    /// Name of the itinerary the phase belongs to.
    #[serde(default)]
    pub itinerary: String,

    /// Accumulated error strings.
    #[serde(default)]
    pub errors: Vec<String>,

    /// Externally reachable rsync route host per destination namespace.
    #[serde(default)]
    pub rsync_routes: BTreeMap<String, String>,

    /// Client pods currently transferring.
    #[serde(default)]
    pub running_pods: Vec<PodProgress>,

    /// Client pods that failed.
    #[serde(default)]
    pub failed_pods: Vec<PodProgress>,

    /// Client pods that finished successfully.
    #[serde(default)]
    pub successful_pods: Vec<PodProgress>,

    /// When the transfer started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DirectVolumeMigration {
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

    /// Claims grouped by namespace, iteration order stable.
    pub fn pvc_namespace_map(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for pvc in &self.spec.persistent_volume_claims {
            map.entry(pvc.namespace.clone())
                .or_default()
                .push(pvc.name.clone());
        }
        map
    }

    /// Correlation labels identifying resources owned by this transfer.
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

/// Per-pod rsync status snapshot kept by the progress controller.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RsyncPodStatus {
    /// Name of the rsync client pod.
    #[serde(default)]
    pub pod_name: String,

    /// Pod phase at last observation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod_phase: String,

    /// Most recent parsed progress percent ("94%").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_observed_progress_percent: String,

    /// Most recent parsed transfer rate ("40.95MB/s").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_observed_transfer_rate: String,

    /// Container exit code when terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Tail of parsed progress lines.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_message: String,
}

/// DirectVolumeMigrationProgress tracks one rsync client pod.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "DirectVolumeMigrationProgress",
    plural = "directvolumemigrationprogresses",
    shortname = "dvmp",
    status = "DirectVolumeMigrationProgressStatus",
    namespaced,
    printcolumn = r#"{"name":"Progress", "type":"string", "jsonPath":".status.lastObservedProgressPercent"}"#,
    printcolumn = r#"{"name":"Rate", "type":"string", "jsonPath":".status.lastObservedTransferRate"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DirectVolumeMigrationProgressSpec {
    /// The cluster the pod runs on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_ref: Option<ObjectRef>,

    /// The rsync client pod to watch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ref: Option<ObjectRef>,
}

/// Observed state of a DirectVolumeMigrationProgress.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectVolumeMigrationProgressStatus {
    /// Conditions describing observation health.
    #[serde(default)]
    pub conditions: Conditions,

    /// Status of the currently watched pod attempt.
    #[serde(flatten)]
    pub rsync_pod_status: RsyncPodStatus,

    /// Statuses of all observed pod attempts (retries included).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rsync_pod_statuses: Vec<RsyncPodStatus>,

    /// Mean percent across distinct observed pods ("40%").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cumulative_progress_percentage: String,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
