//! MigHook Custom Resource Definition.
//!
//! A MigHook is a user-supplied action executed as a one-shot job at one of
//! the four hook points of a final migration. Custom hooks run an arbitrary
//! image; playbook hooks run ansible-runner against an inline playbook.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;

/// Hook point names.
pub const PRE_BACKUP_HOOK_PHASE: &str = "PreBackup";
pub const POST_BACKUP_HOOK_PHASE: &str = "PostBackup";
pub const PRE_RESTORE_HOOK_PHASE: &str = "PreRestore";
pub const POST_RESTORE_HOOK_PHASE: &str = "PostRestore";

/// Label carrying the hook point on hook jobs and configmaps.
pub const PHASE_LABEL: &str = "phase";

/// Target cluster values.
pub const SOURCE_CLUSTER: &str = "source";
pub const DESTINATION_CLUSTER: &str = "destination";

/// MigHook declares a user action run during migration.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "MigHook",
    plural = "mighooks",
    status = "MigHookStatus",
    namespaced,
    printcolumn = r#"{"name":"Image", "type":"string", "jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.targetCluster"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigHookSpec {
    /// Run the image's own entrypoint instead of ansible-runner.
    #[serde(default)]
    pub custom: bool,

    /// Container image for the hook job.
    pub image: String,

    /// Base64-encoded ansible playbook. Required unless `custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playbook: Option<String>,

    /// Which cluster the job runs on: "source" or "destination".
    pub target_cluster: String,

    /// Deadline in seconds for the hook job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
}

/// Observed state of a MigHook.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigHookStatus {
    /// Conditions describing hook validity.
    #[serde(default)]
    pub conditions: Conditions,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
