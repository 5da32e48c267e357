//! Foreign resource definitions for the backup/restore engine.
//!
//! The BR engine (Velero) owns these APIs; only the fields this controller
//! reads or writes are modeled. Unknown fields are preserved by the API
//! server, so partial specs are safe for create/get/list.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label the BR engine sets on per-volume backup children.
pub const BACKUP_NAME_LABEL: &str = "velero.io/backup-name";

/// Backup phases reported by the BR engine.
pub mod backup_phase {
    pub const NEW: &str = "New";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    pub const PARTIALLY_FAILED: &str = "PartiallyFailed";
    pub const FAILED_VALIDATION: &str = "FailedValidation";
}

/// Restore phases reported by the BR engine.
pub mod restore_phase {
    pub const NEW: &str = "New";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    pub const PARTIALLY_FAILED: &str = "PartiallyFailed";
    pub const FAILED_VALIDATION: &str = "FailedValidation";
}

/// Per-volume backup phases.
pub mod pod_volume_backup_phase {
    pub const IN_PROGRESS: &str = "InProgress";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
}

/// A BR-engine backup of cluster state.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "Backup",
    plural = "backups",
    status = "BackupStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Namespaces captured by this backup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_namespaces: Vec<String>,

    /// Resource kinds included (empty means all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,

    /// Resource kinds excluded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,

    /// Restrict capture to resources matching this selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,

    /// Whether cluster-scoped resources are included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_cluster_resources: Option<bool>,

    /// Name of the BackupStorageLocation to write to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_location: String,

    /// Names of VolumeSnapshotLocations for snapshot copies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_snapshot_locations: Vec<String>,

    /// Retention, e.g. "720h0m0s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

/// Object-count progress for a backup.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    #[serde(default)]
    pub items_backed_up: i64,
    #[serde(default)]
    pub total_items: i64,
}

/// Observed state of a backup.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<BackupProgress>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,
}

/// A BR-engine restore of a replicated backup.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "Restore",
    plural = "restores",
    status = "RestoreStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    /// Name of the backup to restore from.
    pub backup_name: String,

    /// Resource kinds included (empty means all).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included_resources: Vec<String>,

    /// Resource kinds excluded.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_resources: Vec<String>,

    /// Whether PVs are restored from volume backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_pvs: Option<bool>,
}

/// Observed state of a restore.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    #[serde(default)]
    pub errors: i64,

    #[serde(default)]
    pub warnings: i64,
}

/// Requests garbage collection of a backup and its data.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "DeleteBackupRequest",
    plural = "deletebackuprequests",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeleteBackupRequestSpec {
    pub backup_name: String,
}

/// Per-volume file-level backup performed by the BR engine's node sidecar.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "PodVolumeBackup",
    plural = "podvolumebackups",
    status = "PodVolumeBackupStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeBackupSpec {
    /// Volume being backed up.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume: String,
}

/// Byte-count progress for a pod volume backup.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeProgress {
    #[serde(default)]
    pub bytes_done: i64,
    #[serde(default)]
    pub total_bytes: i64,
}

/// Observed state of a pod volume backup.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodVolumeBackupStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<PodVolumeProgress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_timestamp: Option<String>,
}

/// Where backup objects live.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "BackupStorageLocation",
    plural = "backupstoragelocations",
    status = "BackupStorageLocationStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationSpec {
    /// Object storage provider.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,

    /// Bucket settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_storage: Option<ObjectStorageLocation>,

    /// Provider-specific settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<std::collections::BTreeMap<String, String>>,
}

/// Bucket and prefix for a storage location.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStorageLocation {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Observed state of a storage location.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStorageLocationStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
}

/// Where volume snapshots live.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "velero.io",
    version = "v1",
    kind = "VolumeSnapshotLocation",
    plural = "volumesnapshotlocations",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotLocationSpec {
    /// Snapshot provider.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,

    /// Provider-specific settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<std::collections::BTreeMap<String, String>>,
}
