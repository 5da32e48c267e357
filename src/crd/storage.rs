//! MigStorage Custom Resource Definition.
//!
//! A MigStorage names the shared backup storage (object store) and the
//! volume snapshot location both clusters' BR engines use. The controller
//! materializes a BackupStorageLocation and VolumeSnapshotLocation from it
//! on each cluster and propagates the credentials secret.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::ObjectRef;

/// MigStorage describes where backups and volume snapshots live.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "MigStorage",
    plural = "migstorages",
    status = "MigStorageStatus",
    namespaced,
    printcolumn = r#"{"name":"Provider", "type":"string", "jsonPath":".spec.backupStorageProvider"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigStorageSpec {
    /// Object storage provider (e.g. "aws", "gcp", "azure").
    pub backup_storage_provider: String,

    /// Provider-specific backup storage settings.
    #[serde(default)]
    pub backup_storage_config: StorageConfig,

    /// Snapshot provider; defaults to the backup provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_provider: Option<String>,

    /// Provider-specific snapshot settings.
    #[serde(default)]
    pub volume_snapshot_config: StorageConfig,
}

/// Provider-specific storage settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Bucket or container name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,

    /// Provider region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Endpoint override for S3-compatible stores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_url: Option<String>,

    /// Reference to the cloud credentials secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creds_secret_ref: Option<ObjectRef>,
}

/// Observed state of a MigStorage.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigStorageStatus {
    /// Conditions describing storage readiness.
    #[serde(default)]
    pub conditions: Conditions,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MigStorage {
    /// Whether the storage has a `Ready` condition set to true.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.has(super::READY))
    }
}
