//! MigPlan Custom Resource Definition.
//!
//! A MigPlan pairs a source and destination cluster with a storage
//! location, selects the namespaces and persistent volumes to migrate, and
//! binds any user hooks. Migrations execute a plan; the plan itself carries
//! the validated selection state.

use std::collections::BTreeMap;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::{MIG_PLAN_DEBUG_LABEL, MIG_PLAN_LABEL, ObjectRef};

/// MigPlan declares what to migrate and between which clusters.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "MigPlan",
    plural = "migplans",
    status = "MigPlanStatus",
    namespaced,
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.srcMigClusterRef.name"}"#,
    printcolumn = r#"{"name":"Destination", "type":"string", "jsonPath":".spec.destMigClusterRef.name"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigPlanSpec {
    /// Reference to the source MigCluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_mig_cluster_ref: Option<ObjectRef>,

    /// Reference to the destination MigCluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest_mig_cluster_ref: Option<ObjectRef>,

    /// Reference to the MigStorage shared by both clusters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mig_storage_ref: Option<ObjectRef>,

    /// Namespaces to migrate. Each entry is `src` or `src:dest` to rename
    /// the namespace on the destination.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Persistent volumes discovered for the plan with their selections.
    #[serde(default)]
    pub persistent_volumes: Vec<PlanPv>,

    /// Hook bindings executed at the four hook points.
    #[serde(default)]
    pub hooks: Vec<HookBinding>,

    /// Close the plan: no further migrations may run against it.
    #[serde(default)]
    pub closed: bool,
}

/// What to do with a persistent volume.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PvAction {
    /// Copy volume data to a new volume on the destination.
    #[default]
    Copy,
    /// Move the PV resource itself (shared storage).
    Move,
    /// Leave the volume behind.
    Skip,
}

/// How volume data is copied.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum PvCopyMethod {
    /// File-level copy through the BR engine sidecar or direct transfer.
    #[default]
    Filesystem,
    /// Storage-provider snapshot.
    Snapshot,
}

/// A persistent volume selected on a plan.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanPv {
    /// PV name.
    pub name: String,

    /// The bound claim.
    pub pvc: PvcRef,

    /// User selection for this volume.
    #[serde(default)]
    pub selection: PvSelection,

    /// Capacity as reported by the source cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,

    /// Storage class on the source cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Reference to a claim by namespace and name.
#[derive(
    Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct PvcRef {
    pub namespace: String,
    pub name: String,
}

/// User selection for a persistent volume.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvSelection {
    /// Action to take for this volume.
    #[serde(default)]
    pub action: PvAction,

    /// Copy method when `action` is `Copy`.
    #[serde(default)]
    pub copy_method: PvCopyMethod,

    /// Target storage class on the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Target access mode on the destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,

    /// Verify copied data after transfer.
    #[serde(default)]
    pub verify: bool,
}

/// Binds a MigHook to a hook point on the plan.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookBinding {
    /// Reference to the MigHook resource.
    pub reference: ObjectRef,

    /// Which hook point: PreBackup, PostBackup, PreRestore, PostRestore.
    pub phase: String,

    /// Namespace the hook job runs in.
    pub execution_namespace: String,

    /// Service account the hook job runs as.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
}

/// A namespace observed to contain resources the destination cannot accept.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncompatibleNamespace {
    pub name: String,
    /// Group/version/kind triples, rendered lowercase.
    #[serde(default)]
    pub gvks: Vec<IncompatibleGvk>,
}

/// A group/version/kind the destination cluster does not serve.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IncompatibleGvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// Observed state of a MigPlan.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigPlanStatus {
    /// Conditions describing plan readiness.
    #[serde(default)]
    pub conditions: Conditions,

    /// Resource kinds excluded from backups for this plan.
    #[serde(default)]
    pub excluded_resources: Vec<String>,

    /// Namespaces containing resources incompatible with the destination.
    #[serde(default)]
    pub incompatible_namespaces: Vec<IncompatibleNamespace>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MigPlan {
    /// Whether the plan has a `Ready` condition set to true.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.has(super::READY))
    }

    /// Source-side namespace names, mapping syntax stripped.
    pub fn source_namespaces(&self) -> Vec<String> {
        self.spec
            .namespaces
            .iter()
            .map(|ns| ns.split(':').next().unwrap_or(ns).to_string())
            .collect()
    }

    /// Destination-side namespace names. An entry `src:dest` lands in
    /// `dest`; a bare entry keeps its name.
    pub fn destination_namespaces(&self) -> Vec<String> {
        self.spec
            .namespaces
            .iter()
            .map(|ns| match ns.split_once(':') {
                Some((_, dest)) if !dest.is_empty() => dest.to_string(),
                _ => ns.split(':').next().unwrap_or(ns).to_string(),
            })
            .collect()
    }

    /// Persistent volumes that are not skipped.
    pub fn included_pvs(&self) -> Vec<&PlanPv> {
        self.spec
            .persistent_volumes
            .iter()
            .filter(|pv| pv.selection.action != PvAction::Skip)
            .collect()
    }

    /// Whether any PV participates in the migration.
    pub fn has_pvs(&self) -> bool {
        !self.included_pvs().is_empty()
    }

    /// Whether the final cut-over moves volume data (any copy or move PV).
    pub fn migrates_pvs_in_final(&self) -> bool {
        self.has_pvs()
    }

    /// Hook binding for the given hook point, if any.
    pub fn hook_for_phase(&self, phase: &str) -> Option<&HookBinding> {
        self.spec.hooks.iter().find(|h| h.phase == phase)
    }

    /// Correlation labels identifying resources owned by this plan.
    pub fn correlation_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(MIG_PLAN_LABEL.to_string(), self.uid().unwrap_or_default());
        labels.insert(MIG_PLAN_DEBUG_LABEL.to_string(), self.name_any());
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_namespaces(namespaces: &[&str]) -> MigPlan {
        MigPlan::new(
            "plan",
            MigPlanSpec {
                namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_namespace_mapping() {
        let plan = plan_with_namespaces(&["app", "db:db-new"]);
        assert_eq!(plan.source_namespaces(), vec!["app", "db"]);
        assert_eq!(plan.destination_namespaces(), vec!["app", "db-new"]);
    }

    #[test]
    fn test_included_pvs_filters_skip() {
        let mut plan = plan_with_namespaces(&["app"]);
        plan.spec.persistent_volumes = vec![
            PlanPv {
                name: "pv-1".to_string(),
                pvc: PvcRef {
                    namespace: "app".to_string(),
                    name: "data".to_string(),
                },
                ..Default::default()
            },
            PlanPv {
                name: "pv-2".to_string(),
                pvc: PvcRef {
                    namespace: "app".to_string(),
                    name: "cache".to_string(),
                },
                selection: PvSelection {
                    action: PvAction::Skip,
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        assert_eq!(plan.included_pvs().len(), 1);
        assert!(plan.has_pvs());
    }

    #[test]
    fn test_no_pvs() {
        let plan = plan_with_namespaces(&["app"]);
        assert!(!plan.has_pvs());
        assert!(!plan.migrates_pvs_in_final());
    }
}
