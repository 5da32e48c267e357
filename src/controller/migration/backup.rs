//! Backup phases of the task engine.
//!
//! Two logical backups exist per final migration: the initial backup
//! captures namespaced and cluster resources minus volumes, and the stage
//! backup captures exactly what is needed to reconstruct volumes, filtered
//! to stage pods by label selector. Both are created in the BR engine's
//! namespace on the source cluster and observed until terminal.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ListParams;
use kube::ResourceExt;

use crate::crd::velero::{
    backup_phase, Backup, BackupSpec, DeleteBackupRequest, DeleteBackupRequestSpec,
    PodVolumeBackup, pod_volume_backup_phase, BACKUP_NAME_LABEL, BackupStorageLocation,
    VolumeSnapshotLocation,
};
use crate::crd::{MIGRATION_NAMESPACE, VELERO_NAMESPACE};
use crate::controller::error::{Error, Result};
use crate::settings;

use super::task::{BackupKind, Phase, Task};

/// Labels tying backups to a migration.
pub const INITIAL_BACKUP_LABEL: &str = "migration-initial-backup";
pub const STAGE_BACKUP_LABEL: &str = "migration-stage-backup";
/// Label selecting resources (stage pods included) into the stage backup.
pub const INCLUDED_IN_STAGE_BACKUP_LABEL: &str = "migration-included-stage-backup";
/// Label tying storage locations to their MigStorage.
pub const MIG_STORAGE_LABEL: &str = "migration.openshift.io/migstorage";

/// Name of the cloud credentials secret the BR engine mounts.
const CLOUD_CREDENTIALS_SECRET: &str = "cloud-credentials";

/// Backup retention.
const BACKUP_TTL: &str = "720h0m0s";

impl Task<'_> {
    /// Ensure the initial backup exists on the source cluster.
    pub(super) async fn ensure_initial_backup(&mut self) -> Result<Backup> {
        if let Some(backup) = self.get_backup(BackupKind::Initial).await? {
            return Ok(backup);
        }

        let mut backup = self.build_backup().await?;
        let labels = backup.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(INITIAL_BACKUP_LABEL.to_string(), self.uid());
        backup.spec.included_resources = difference(
            settings::included_initial_resources(),
            self.excluded_resources(),
        );
        backup.spec.excluded_resources = union(
            settings::excluded_initial_resources(),
            self.excluded_resources(),
        );
        Ok(self
            .plan
            .src_client
            .create(VELERO_NAMESPACE, &backup)
            .await?)
    }

    /// Ensure the stage backup exists on the source cluster.
    pub(super) async fn ensure_stage_backup(&mut self) -> Result<Backup> {
        if let Some(backup) = self.get_backup(BackupKind::Stage).await? {
            return Ok(backup);
        }

        let mut backup = self.build_backup().await?;
        let labels = backup.metadata.labels.get_or_insert_with(Default::default);
        labels.insert(STAGE_BACKUP_LABEL.to_string(), self.uid());
        backup.spec.included_resources = difference(
            settings::included_stage_resources(),
            self.excluded_resources(),
        );
        backup.spec.excluded_resources = self.excluded_resources();
        backup.spec.label_selector = Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                INCLUDED_IN_STAGE_BACKUP_LABEL.to_string(),
                self.uid(),
            )])),
            ..Default::default()
        });
        Ok(self
            .plan
            .src_client
            .create(VELERO_NAMESPACE, &backup)
            .await?)
    }

    /// Find an existing backup of the given kind by correlation labels.
    pub(super) async fn get_backup(&self, kind: BackupKind) -> Result<Option<Backup>> {
        let mut labels = self.correlation_labels();
        let kind_label = match kind {
            BackupKind::Initial => INITIAL_BACKUP_LABEL,
            BackupKind::Stage => STAGE_BACKUP_LABEL,
        };
        labels.insert(kind_label.to_string(), self.uid());
        let params = ListParams::default().labels(&selector(&labels));
        let mut backups = self
            .plan
            .src_client
            .list::<Backup>(VELERO_NAMESPACE, &params)
            .await?;
        Ok(if backups.is_empty() {
            None
        } else {
            Some(backups.remove(0))
        })
    }

    /// Observe a backup until terminal: advance on Completed, fail on any
    /// failure phase, hold otherwise. Progress lines land in the status.
    pub(super) async fn observe_backup_phase(&mut self, kind: BackupKind) -> Result<()> {
        let backup = self
            .get_backup(kind)
            .await?
            .ok_or_else(|| Error::Transient("Backup not found".to_string()))?;

        let (completed, reasons, progress) = self.backup_report(&backup).await?;
        self.progress = progress;
        if completed {
            if reasons.is_empty() {
                self.next();
            } else {
                let fail_phase = match kind {
                    BackupKind::Initial => Phase::InitialBackupFailed,
                    BackupKind::Stage => Phase::StageBackupFailed,
                };
                self.fail(fail_phase, reasons);
            }
        } else {
            self.requeue = None;
        }
        Ok(())
    }

    /// Observe replication: the destination cluster's BR engine discovers
    /// backups from the shared storage location.
    pub(super) async fn observe_backup_replicated(&mut self, kind: BackupKind) -> Result<()> {
        let backup = self
            .get_backup(kind)
            .await?
            .ok_or_else(|| Error::Transient("Backup not found".to_string()))?;
        if self.backup_replicated(&backup).await? {
            self.next();
        } else {
            self.requeue = None;
        }
        Ok(())
    }

    /// A backup is replicated iff the destination can get it by name.
    pub(super) async fn backup_replicated(&self, backup: &Backup) -> Result<bool> {
        let namespace = backup.namespace().unwrap_or_default();
        Ok(self
            .plan
            .dest_client
            .get_opt::<Backup>(&namespace, &backup.name_any())
            .await?
            .is_some())
    }

    /// Gather completion state, failure reasons, and progress lines.
    async fn backup_report(&self, backup: &Backup) -> Result<(bool, Vec<String>, Vec<String>)> {
        let mut completed = false;
        let mut reasons = Vec::new();
        let mut progress = Vec::new();

        let namespace = backup.namespace().unwrap_or_default();
        let name = backup.name_any();
        let phase = backup
            .status
            .as_ref()
            .map(|s| s.phase.as_str())
            .unwrap_or_default();

        match phase {
            backup_phase::IN_PROGRESS => {
                let counts = backup.status.as_ref().and_then(|s| s.progress.as_ref());
                progress.push(format!(
                    "Backup {namespace}/{name}: {} out of estimated total of {} objects backed up",
                    counts.map(|p| p.items_backed_up).unwrap_or_default(),
                    counts.map(|p| p.total_items).unwrap_or_default(),
                ));
                progress.extend(self.pod_volume_backup_progress(backup).await?);
            }
            backup_phase::COMPLETED => {
                completed = true;
                progress.push(format!("Backup {namespace}/{name}: Completed"));
                progress.extend(self.pod_volume_backup_progress(backup).await?);
            }
            backup_phase::FAILED => {
                completed = true;
                let message = format!("Backup: {namespace}/{name} failed.");
                reasons.push(message.clone());
                progress.push(message);
                progress.extend(self.pod_volume_backup_progress(backup).await?);
            }
            backup_phase::PARTIALLY_FAILED => {
                completed = true;
                let message = format!("Backup: {namespace}/{name} partially failed.");
                reasons.push(message.clone());
                progress.push(message);
                progress.extend(self.pod_volume_backup_progress(backup).await?);
            }
            backup_phase::FAILED_VALIDATION => {
                completed = true;
                if let Some(status) = &backup.status {
                    reasons.extend(status.validation_errors.iter().cloned());
                }
                reasons.push(format!("Backup: {namespace}/{name} validation failed."));
            }
            _ => {
                progress.push(format!("Backup {namespace}/{name}: Not started yet"));
            }
        }

        Ok((completed, reasons, progress))
    }

    /// One progress line per per-volume backup child, sorted by
    /// namespace/name for stable ordering across ticks.
    async fn pod_volume_backup_progress(&self, backup: &Backup) -> Result<Vec<String>> {
        let params = ListParams::default().labels(&format!(
            "{}={}",
            BACKUP_NAME_LABEL,
            backup.name_any()
        ));
        let children = self
            .plan
            .src_client
            .list::<PodVolumeBackup>(VELERO_NAMESPACE, &params)
            .await?;

        let mut lines = BTreeMap::new();
        for pvb in &children {
            let key = format!(
                "{}/{}",
                pvb.namespace().unwrap_or_default(),
                pvb.name_any()
            );
            let status = pvb.status.as_ref();
            let done = status
                .and_then(|s| s.progress.as_ref())
                .map(|p| p.bytes_done)
                .unwrap_or_default();
            let total = status
                .and_then(|s| s.progress.as_ref())
                .map(|p| p.total_bytes)
                .unwrap_or_default();
            let elapsed = status
                .map(|s| elapsed_suffix(s.start_timestamp.as_deref(), s.completion_timestamp.as_deref()))
                .unwrap_or_default();
            let message = match status.map(|s| s.phase.as_str()).unwrap_or_default() {
                pod_volume_backup_phase::IN_PROGRESS => format!(
                    "PodVolumeBackup {key}: {} out of {} backed up{elapsed}",
                    bytes_to_si(done),
                    bytes_to_si(total),
                ),
                pod_volume_backup_phase::COMPLETED => format!(
                    "PodVolumeBackup {key}: Completed, {} out of {} backed up{elapsed}",
                    bytes_to_si(done),
                    bytes_to_si(total),
                ),
                pod_volume_backup_phase::FAILED => {
                    format!("PodVolumeBackup {key}: Failed{elapsed}")
                }
                _ => format!("PodVolumeBackup {key}: Waiting for ongoing volume backup(s) to complete"),
            };
            lines.insert(key, message);
        }
        Ok(lines.into_values().collect())
    }

    /// Base backup shared by the initial and stage variants.
    async fn build_backup(&self) -> Result<Backup> {
        let bsl = self.get_bsl().await?;
        let vsl = self.get_vsl().await?;
        let mut backup = Backup::new(
            "",
            BackupSpec {
                include_cluster_resources: None,
                storage_location: bsl.name_any(),
                volume_snapshot_locations: vec![vsl.name_any()],
                ttl: Some(BACKUP_TTL.to_string()),
                included_namespaces: self.source_namespaces(),
                ..Default::default()
            },
        );
        backup.metadata.name = None;
        backup.metadata.generate_name = Some(format!("{}-", self.owner.name_any()));
        backup.metadata.namespace = Some(VELERO_NAMESPACE.to_string());
        backup.metadata.labels = Some(self.correlation_labels());
        Ok(backup)
    }

    /// The storage location on the source cluster for the plan's storage.
    async fn get_bsl(&self) -> Result<BackupStorageLocation> {
        let storage_uid = self.plan.storage.uid().unwrap_or_default();
        let params =
            ListParams::default().labels(&format!("{MIG_STORAGE_LABEL}={storage_uid}"));
        let mut locations = self
            .plan
            .src_client
            .list::<BackupStorageLocation>(VELERO_NAMESPACE, &params)
            .await?;
        if locations.is_empty() {
            return Err(Error::Transient("BSL not found".to_string()));
        }
        Ok(locations.remove(0))
    }

    /// The snapshot location on the source cluster for the plan's storage.
    async fn get_vsl(&self) -> Result<VolumeSnapshotLocation> {
        let storage_uid = self.plan.storage.uid().unwrap_or_default();
        let params =
            ListParams::default().labels(&format!("{MIG_STORAGE_LABEL}={storage_uid}"));
        let mut locations = self
            .plan
            .src_client
            .list::<VolumeSnapshotLocation>(VELERO_NAMESPACE, &params)
            .await?;
        if locations.is_empty() {
            return Err(Error::Transient("VSL not found".to_string()));
        }
        Ok(locations.remove(0))
    }

    /// Delete all backups correlated with the plan by issuing delete
    /// requests the BR engine honors (removing stored data too).
    pub(super) async fn delete_backups(&mut self) -> Result<()> {
        let params =
            ListParams::default().labels(&selector(&self.plan.plan.correlation_labels()));
        let backups = self
            .plan
            .src_client
            .list::<Backup>(VELERO_NAMESPACE, &params)
            .await?;
        for backup in backups {
            let mut request = DeleteBackupRequest::new(
                "",
                DeleteBackupRequestSpec {
                    backup_name: backup.name_any(),
                },
            );
            request.metadata.name = None;
            request.metadata.generate_name = Some(format!("{}-", backup.name_any()));
            request.metadata.namespace = Some(VELERO_NAMESPACE.to_string());
            self.plan
                .src_client
                .create(VELERO_NAMESPACE, &request)
                .await?;
        }
        Ok(())
    }

    /// Whether the cloud credentials secret has reached the BR engine on
    /// both clusters.
    pub(super) async fn cloud_secrets_propagated(&self) -> Result<bool> {
        let Some(creds_ref) = self
            .plan
            .storage
            .spec
            .backup_storage_config
            .creds_secret_ref
            .clone()
        else {
            return Err(Error::MissingField("backupStorageConfig.credsSecretRef".into()));
        };
        let source: kube::Api<Secret> =
            kube::Api::namespaced(self.client.clone(), &creds_ref.namespace);
        let expected = source.get(&creds_ref.name).await?.data;

        for client in [&self.plan.src_client, &self.plan.dest_client] {
            let found = client
                .get_opt::<Secret>(MIGRATION_NAMESPACE, CLOUD_CREDENTIALS_SECRET)
                .await?;
            match found {
                Some(secret) if secret.data == expected => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Resource kinds the plan excludes from backups.
    pub(super) fn excluded_resources(&self) -> Vec<String> {
        self.plan
            .plan
            .status
            .as_ref()
            .map(|s| s.excluded_resources.clone())
            .unwrap_or_default()
    }
}

/// Render a label map as a list-params selector.
pub(super) fn selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Set difference preserving the left side's order.
pub(super) fn difference(left: Vec<String>, right: Vec<String>) -> Vec<String> {
    left.into_iter().filter(|x| !right.contains(x)).collect()
}

/// Set union preserving order, left first.
pub(super) fn union(left: Vec<String>, right: Vec<String>) -> Vec<String> {
    let mut result = left;
    for item in right {
        if !result.contains(&item) {
            result.push(item);
        }
    }
    result
}

/// Render raw bytes in the nearest SI unit with two decimal digits.
pub(super) fn bytes_to_si(bytes: i64) -> String {
    const BASE: i64 = 1000;
    if bytes < BASE {
        return format!("{bytes} bytes");
    }
    const UNITS: &[char] = &['k', 'M', 'G', 'T', 'P', 'E'];
    let mut div = BASE;
    let mut exp = 0;
    let mut n = bytes / BASE;
    while n >= BASE {
        div *= BASE;
        exp += 1;
        n /= BASE;
    }
    format!("{:.2} {}B", bytes as f64 / div as f64, UNITS[exp])
}

/// Render ` (elapsed)` from RFC3339 start/completion timestamps; empty
/// when the child has not started.
pub(super) fn elapsed_suffix(start: Option<&str>, completion: Option<&str>) -> String {
    let Some(start) = start.and_then(|s| s.parse::<jiff::Timestamp>().ok()) else {
        return String::new();
    };
    let end = completion
        .and_then(|s| s.parse::<jiff::Timestamp>().ok())
        .unwrap_or_else(jiff::Timestamp::now);
    let seconds = (end - start).get_seconds().max(0);
    format!(" ({})", fmt_duration(seconds))
}

/// Format whole seconds the way Go renders durations: `38s`, `2m3s`,
/// `1h2m3s`.
pub(super) fn fmt_duration(total_seconds: i64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_si() {
        assert_eq!(bytes_to_si(999), "999 bytes");
        assert_eq!(bytes_to_si(1_650_000_000), "1.65 GB");
        assert_eq!(bytes_to_si(2_000), "2.00 kB");
        assert_eq!(bytes_to_si(1_000_000), "1.00 MB");
    }

    #[test]
    fn test_fmt_duration() {
        assert_eq!(fmt_duration(38), "38s");
        assert_eq!(fmt_duration(123), "2m3s");
        assert_eq!(fmt_duration(3723), "1h2m3s");
    }

    #[test]
    fn test_set_operations() {
        let included = vec!["pods".to_string(), "secrets".to_string()];
        let excluded = vec!["secrets".to_string()];
        assert_eq!(
            difference(included.clone(), excluded.clone()),
            vec!["pods".to_string()]
        );
        assert_eq!(
            union(excluded, vec!["configmaps".to_string(), "secrets".to_string()]),
            vec!["secrets".to_string(), "configmaps".to_string()]
        );
    }

    #[test]
    fn test_selector_rendering() {
        let labels = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        assert_eq!(selector(&labels), "a=1,b=2");
    }

    #[test]
    fn test_elapsed_suffix_completed() {
        let suffix = elapsed_suffix(
            Some("2026-08-01T10:00:00Z"),
            Some("2026-08-01T10:02:03Z"),
        );
        assert_eq!(suffix, " (2m3s)");
    }

    #[test]
    fn test_elapsed_suffix_missing_start() {
        assert_eq!(elapsed_suffix(None, None), "");
    }
}
