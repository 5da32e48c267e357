//! Restore phases of the task engine.
//!
//! Restores run on the destination cluster against the replicated backup.
//! The stage restore rebuilds volumes from the stage backup; the final
//! restore replays the initial backup minus the staged kinds. Teardown of
//! restored resources (cancel and rollback paths) also lives here.

use kube::api::{DeleteParams, ListParams, PropagationPolicy};
use kube::ResourceExt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};

use crate::crd::velero::{restore_phase, Restore, RestoreSpec};
use crate::crd::VELERO_NAMESPACE;
use crate::controller::error::{Error, Result};
use crate::settings;

use super::backup::{selector, union};
use super::task::{BackupKind, Phase, RestoreKind, Task};

/// Labels tying restores to a migration.
pub const STAGE_RESTORE_LABEL: &str = "migration-stage-restore";
pub const FINAL_RESTORE_LABEL: &str = "migration-final-restore";

impl Task<'_> {
    /// Ensure the stage restore exists on the destination, referencing the
    /// replicated stage backup by name.
    pub(super) async fn ensure_stage_restore(&mut self) -> Result<Restore> {
        if let Some(restore) = self.get_restore(RestoreKind::Stage).await? {
            return Ok(restore);
        }
        let backup = self
            .get_backup(BackupKind::Stage)
            .await?
            .ok_or_else(|| Error::Transient("Backup not found".to_string()))?;

        let restore = self.build_restore(
            RestoreKind::Stage,
            backup.name_any(),
            self.excluded_resources(),
        );
        Ok(self
            .plan
            .dest_client
            .create(VELERO_NAMESPACE, &restore)
            .await?)
    }

    /// Ensure the final restore exists on the destination, referencing the
    /// replicated initial backup and excluding the staged kinds.
    pub(super) async fn ensure_final_restore(&mut self) -> Result<Restore> {
        if let Some(restore) = self.get_restore(RestoreKind::Final).await? {
            return Ok(restore);
        }
        let backup = self
            .get_backup(BackupKind::Initial)
            .await?
            .ok_or_else(|| Error::Transient("Backup not found".to_string()))?;

        let excluded = union(
            settings::excluded_initial_resources(),
            self.excluded_resources(),
        );
        let restore = self.build_restore(RestoreKind::Final, backup.name_any(), excluded);
        Ok(self
            .plan
            .dest_client
            .create(VELERO_NAMESPACE, &restore)
            .await?)
    }

    fn build_restore(
        &self,
        kind: RestoreKind,
        backup_name: String,
        excluded_resources: Vec<String>,
    ) -> Restore {
        let mut restore = Restore::new(
            "",
            RestoreSpec {
                backup_name,
                restore_pvs: Some(true),
                excluded_resources,
                ..Default::default()
            },
        );
        restore.metadata.name = None;
        restore.metadata.generate_name = Some(format!("{}-", self.owner.name_any()));
        restore.metadata.namespace = Some(VELERO_NAMESPACE.to_string());
        let mut labels = self.correlation_labels();
        let kind_label = match kind {
            RestoreKind::Stage => STAGE_RESTORE_LABEL,
            RestoreKind::Final => FINAL_RESTORE_LABEL,
        };
        labels.insert(kind_label.to_string(), self.uid());
        restore.metadata.labels = Some(labels);
        restore
    }

    /// Find an existing restore of the given kind by correlation labels.
    pub(super) async fn get_restore(&self, kind: RestoreKind) -> Result<Option<Restore>> {
        let mut labels = self.correlation_labels();
        let kind_label = match kind {
            RestoreKind::Stage => STAGE_RESTORE_LABEL,
            RestoreKind::Final => FINAL_RESTORE_LABEL,
        };
        labels.insert(kind_label.to_string(), self.uid());
        let params = ListParams::default().labels(&selector(&labels));
        let mut restores = self
            .plan
            .dest_client
            .list::<Restore>(VELERO_NAMESPACE, &params)
            .await?;
        Ok(if restores.is_empty() {
            None
        } else {
            Some(restores.remove(0))
        })
    }

    /// Observe a restore until terminal.
    pub(super) async fn observe_restore_phase(&mut self, kind: RestoreKind) -> Result<()> {
        let restore = self
            .get_restore(kind)
            .await?
            .ok_or_else(|| Error::Transient("Restore not found".to_string()))?;

        let namespace = restore.namespace().unwrap_or_default();
        let name = restore.name_any();
        let phase = restore
            .status
            .as_ref()
            .map(|s| s.phase.as_str())
            .unwrap_or_default();

        match phase {
            restore_phase::COMPLETED => {
                self.progress
                    .push(format!("Restore {namespace}/{name}: Completed"));
                self.next();
            }
            restore_phase::FAILED => {
                self.fail_restore(kind, vec![format!("Restore: {namespace}/{name} failed.")]);
            }
            restore_phase::PARTIALLY_FAILED => {
                self.fail_restore(
                    kind,
                    vec![format!("Restore: {namespace}/{name} partially failed.")],
                );
            }
            restore_phase::FAILED_VALIDATION => {
                let mut reasons = restore
                    .status
                    .as_ref()
                    .map(|s| s.validation_errors.clone())
                    .unwrap_or_default();
                reasons.push(format!("Restore: {namespace}/{name} validation failed."));
                self.fail_restore(kind, reasons);
            }
            restore_phase::IN_PROGRESS => {
                self.progress
                    .push(format!("Restore {namespace}/{name}: In progress"));
                self.requeue = None;
            }
            _ => {
                self.progress
                    .push(format!("Restore {namespace}/{name}: Not started yet"));
                self.requeue = None;
            }
        }
        Ok(())
    }

    fn fail_restore(&mut self, kind: RestoreKind, reasons: Vec<String>) {
        let fail_phase = match kind {
            RestoreKind::Stage => Phase::StageRestoreFailed,
            RestoreKind::Final => Phase::FinalRestoreFailed,
        };
        self.fail(fail_phase, reasons);
    }

    /// Delete restores correlated with the plan on the destination.
    pub(super) async fn delete_restores(&mut self) -> Result<()> {
        let params =
            ListParams::default().labels(&selector(&self.plan.plan.correlation_labels()));
        let restores = self
            .plan
            .dest_client
            .list::<Restore>(VELERO_NAMESPACE, &params)
            .await?;
        let delete = background_delete();
        for restore in restores {
            let result = self
                .plan
                .dest_client
                .delete::<Restore>(VELERO_NAMESPACE, &restore.name_any(), &delete)
                .await;
            tolerate_not_found(result)?;
        }
        Ok(())
    }

    /// Delete migrated resources on the destination: everything in the
    /// destination namespaces carrying this migration's correlation label.
    pub(super) async fn delete_migrated(&mut self) -> Result<()> {
        let labels = self.correlation_labels();
        let params = ListParams::default().labels(&selector(&labels));
        for namespace in self.destination_namespaces() {
            self.delete_labeled::<Pod>(&namespace, &params).await?;
            self.delete_labeled::<Service>(&namespace, &params).await?;
            self.delete_labeled::<ConfigMap>(&namespace, &params).await?;
            self.delete_labeled::<Secret>(&namespace, &params).await?;
            self.delete_labeled::<PersistentVolumeClaim>(&namespace, &params)
                .await?;
            self.delete_labeled::<Deployment>(&namespace, &params).await?;
            self.delete_labeled::<StatefulSet>(&namespace, &params).await?;
            self.delete_labeled::<DaemonSet>(&namespace, &params).await?;
            self.delete_labeled::<ReplicaSet>(&namespace, &params).await?;
        }
        Ok(())
    }

    async fn delete_labeled<K>(&self, namespace: &str, params: &ListParams) -> Result<()>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
            + Clone
            + serde::de::DeserializeOwned
            + serde::Serialize
            + std::fmt::Debug,
    {
        let items = self.plan.dest_client.list::<K>(namespace, params).await?;
        let delete = background_delete();
        for item in items {
            let result = self
                .plan
                .dest_client
                .delete::<K>(namespace, &item.name_any(), &delete)
                .await;
            tolerate_not_found(result)?;
        }
        Ok(())
    }

    /// Whether everything delete_migrated targets is gone.
    pub(super) async fn migrated_resources_deleted(&self) -> Result<bool> {
        let labels = self.correlation_labels();
        let params = ListParams::default().labels(&selector(&labels));
        for namespace in self.destination_namespaces() {
            let pods = self.plan.dest_client.list::<Pod>(&namespace, &params).await?;
            if !pods.is_empty() {
                return Ok(false);
            }
            let claims = self
                .plan
                .dest_client
                .list::<PersistentVolumeClaim>(&namespace, &params)
                .await?;
            if !claims.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Post-restore verification: every pod in the destination namespaces
    /// has settled out of Pending. Unhealthy pods surface as progress.
    pub(super) async fn verification_completed(&mut self) -> Result<bool> {
        let mut completed = true;
        for namespace in self.destination_namespaces() {
            let pods = self
                .plan
                .dest_client
                .list::<Pod>(&namespace, &ListParams::default())
                .await?;
            for pod in pods {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                if phase == "Pending" {
                    completed = false;
                    self.progress.push(format!(
                        "Pod {namespace}/{}: Pending",
                        pod.name_any()
                    ));
                }
            }
        }
        Ok(completed)
    }
}

/// Deletion with background propagation, the policy for all teardown.
pub(super) fn background_delete() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

/// Teardown is best-effort: a 404 means the work is already done.
pub(super) fn tolerate_not_found<T>(
    result: std::result::Result<T, crate::compat::CompatError>,
) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
