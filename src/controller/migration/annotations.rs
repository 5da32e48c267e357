//! Annotation and label phases of the task engine.
//!
//! Before the stage backup, the resources participating in volume capture
//! are marked: namespaces, PVs, PVCs, and stage pods get the stage-backup
//! inclusion label, PVs carry their selected action, and stage pods carry
//! the BR engine's volume-backup annotation naming the volumes to capture.
//! The marks are removed on the way out unless the migration asks to keep
//! them; a later run cleans up leftovers in its Prepare phase either way.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Namespace, PersistentVolume, PersistentVolumeClaim, Pod};
use kube::api::ListParams;

use crate::compat::CompatClient;
use crate::crd::{PvAction, PvcRef};
use crate::controller::error::Result;

use super::backup::{selector, INCLUDED_IN_STAGE_BACKUP_LABEL};
use super::stage::STAGE_POD_LABEL;
use super::task::Task;

/// Annotation carrying the selected PV action.
pub const PV_ACTION_ANNOTATION: &str = "openshift.io/migrate-type";
/// Annotation carrying the copy phase on marked pods.
pub const COPY_PHASE_ANNOTATION: &str = "openshift.io/migrate-copy-phase";
/// The BR engine's annotation naming volumes for file-level capture.
pub const RESTIC_PV_BACKUP_ANNOTATION: &str = "backup.velero.io/backup-volumes";

impl Task<'_> {
    /// Mark everything the stage backup must capture.
    pub(super) async fn annotate_stage_resources(&mut self) -> Result<()> {
        let client = self.plan.src_client.clone();
        let uid = self.uid();
        let mapping = self.pvc_mapping();
        let copy_phase = if self.stage() { "stage" } else { "final" };

        // Namespaces
        for namespace in self.source_namespaces() {
            let mut ns = client.get_cluster::<Namespace>(&namespace).await?;
            if label_missing(ns.metadata.labels.as_ref(), &uid) {
                ns.metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(INCLUDED_IN_STAGE_BACKUP_LABEL.to_string(), uid.clone());
                client.update_cluster(&ns).await?;
            }
        }

        // PVs and their claims
        for pv in self.plan.plan.included_pvs() {
            let action = match pv.selection.action {
                PvAction::Copy => "copy",
                PvAction::Move => "move",
                PvAction::Skip => continue,
            };
            let mut volume = client.get_cluster::<PersistentVolume>(&pv.name).await?;
            let mut changed = false;
            let annotations = volume
                .metadata
                .annotations
                .get_or_insert_with(Default::default);
            if annotations.get(PV_ACTION_ANNOTATION).map(String::as_str) != Some(action) {
                annotations.insert(PV_ACTION_ANNOTATION.to_string(), action.to_string());
                changed = true;
            }
            if label_missing(volume.metadata.labels.as_ref(), &uid) {
                volume
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(INCLUDED_IN_STAGE_BACKUP_LABEL.to_string(), uid.clone());
                changed = true;
            }
            if changed {
                client.update_cluster(&volume).await?;
            }

            let mut claim = client
                .get::<PersistentVolumeClaim>(&pv.pvc.namespace, &pv.pvc.name)
                .await?;
            if label_missing(claim.metadata.labels.as_ref(), &uid) {
                claim
                    .metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(INCLUDED_IN_STAGE_BACKUP_LABEL.to_string(), uid.clone());
                client.update(&pv.pvc.namespace, &claim).await?;
            }
        }

        // Stage pods: the volume-backup annotation tells the BR engine's
        // sidecar which volumes to capture.
        let params = ListParams::default().labels(&selector(&self.stage_pod_cleanup_label()));
        for namespace in self.source_namespaces() {
            let pods = client.list::<Pod>(&namespace, &params).await?;
            for mut pod in pods {
                let volume_names = backup_volume_names(&pod, &namespace, &mapping);
                if volume_names.is_empty() {
                    continue;
                }
                let annotations = pod
                    .metadata
                    .annotations
                    .get_or_insert_with(Default::default);
                let wanted = volume_names.join(",");
                let mut changed = false;
                if annotations.get(RESTIC_PV_BACKUP_ANNOTATION) != Some(&wanted) {
                    annotations.insert(RESTIC_PV_BACKUP_ANNOTATION.to_string(), wanted);
                    changed = true;
                }
                if annotations.get(COPY_PHASE_ANNOTATION).map(String::as_str) != Some(copy_phase)
                {
                    annotations
                        .insert(COPY_PHASE_ANNOTATION.to_string(), copy_phase.to_string());
                    changed = true;
                }
                if changed {
                    client.update(&namespace, &pod).await?;
                }
            }
        }

        Ok(())
    }

    /// Remove migration annotations from marked resources on both
    /// clusters.
    pub(super) async fn delete_annotations(&mut self) -> Result<()> {
        let sides = [
            (self.plan.src_client.clone(), self.source_namespaces()),
            (self.plan.dest_client.clone(), self.destination_namespaces()),
        ];
        for (client, namespaces) in sides {
            strip_pv_annotations(&client).await?;
            for namespace in namespaces {
                strip_pod_annotations(&client, &namespace).await?;
            }
        }
        Ok(())
    }

    /// Remove migration labels from namespaces, PVs, PVCs, and pods on
    /// both clusters.
    pub(super) async fn delete_labels(&mut self) -> Result<()> {
        let sides = [
            (self.plan.src_client.clone(), self.source_namespaces()),
            (self.plan.dest_client.clone(), self.destination_namespaces()),
        ];
        for (client, namespaces) in sides {
            for namespace in &namespaces {
                if let Some(mut ns) = get_cluster_opt::<Namespace>(&client, namespace).await? {
                    if strip_labels(ns.metadata.labels.as_mut()) {
                        client.update_cluster(&ns).await?;
                    }
                }
                let claims = client
                    .list::<PersistentVolumeClaim>(namespace, &ListParams::default())
                    .await?;
                for mut claim in claims {
                    if strip_labels(claim.metadata.labels.as_mut()) {
                        client.update(namespace, &claim).await?;
                    }
                }
                let pods = client.list::<Pod>(namespace, &ListParams::default()).await?;
                for mut pod in pods {
                    if strip_labels(pod.metadata.labels.as_mut()) {
                        client.update(namespace, &pod).await?;
                    }
                }
            }
            let volumes = client
                .list_cluster::<PersistentVolume>(&ListParams::default())
                .await?;
            for mut volume in volumes {
                if strip_labels(volume.metadata.labels.as_mut()) {
                    client.update_cluster(&volume).await?;
                }
            }
        }
        Ok(())
    }
}

fn label_missing(labels: Option<&BTreeMap<String, String>>, uid: &str) -> bool {
    labels
        .and_then(|l| l.get(INCLUDED_IN_STAGE_BACKUP_LABEL))
        .map(String::as_str)
        != Some(uid)
}

/// Volume names on a stage pod whose claims are filesystem-copied.
fn backup_volume_names(
    pod: &Pod,
    namespace: &str,
    mapping: &BTreeMap<PvcRef, crate::crd::PlanPv>,
) -> Vec<String> {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(|volumes| {
            volumes
                .iter()
                .filter(|v| {
                    v.persistent_volume_claim.as_ref().is_some_and(|claim| {
                        mapping.contains_key(&PvcRef {
                            namespace: namespace.to_string(),
                            name: claim.claim_name.clone(),
                        })
                    })
                })
                .map(|v| v.name.clone())
                .collect()
        })
        .unwrap_or_default()
}

async fn get_cluster_opt<K>(client: &CompatClient, name: &str) -> Result<Option<K>>
where
    K: kube::Resource<Scope = k8s_openapi::ClusterResourceScope, DynamicType = ()>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
{
    match client.get_cluster::<K>(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn strip_pv_annotations(client: &CompatClient) -> Result<()> {
    let params =
        ListParams::default().labels(INCLUDED_IN_STAGE_BACKUP_LABEL);
    let volumes = client.list_cluster::<PersistentVolume>(&params).await?;
    for mut volume in volumes {
        let mut changed = false;
        if let Some(annotations) = volume.metadata.annotations.as_mut() {
            changed |= annotations.remove(PV_ACTION_ANNOTATION).is_some();
        }
        changed |= strip_labels(volume.metadata.labels.as_mut());
        if changed {
            client.update_cluster(&volume).await?;
        }
    }
    Ok(())
}

async fn strip_pod_annotations(client: &CompatClient, namespace: &str) -> Result<()> {
    let params = ListParams::default().labels(&format!("{STAGE_POD_LABEL}=true"));
    let pods = client.list::<Pod>(namespace, &params).await?;
    for mut pod in pods {
        let mut changed = false;
        if let Some(annotations) = pod.metadata.annotations.as_mut() {
            changed |= annotations.remove(RESTIC_PV_BACKUP_ANNOTATION).is_some();
            changed |= annotations.remove(COPY_PHASE_ANNOTATION).is_some();
        }
        if changed {
            client.update(namespace, &pod).await?;
        }
    }
    Ok(())
}

/// Remove the stage-backup and stage-pod labels; true when changed.
fn strip_labels(labels: Option<&mut BTreeMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return false;
    };
    let mut changed = false;
    changed |= labels.remove(INCLUDED_IN_STAGE_BACKUP_LABEL).is_some();
    changed |= labels.remove(STAGE_POD_LABEL).is_some();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::plan::{PlanPv, PvSelection};
    use k8s_openapi::api::core::v1::{PersistentVolumeClaimVolumeSource, PodSpec, Volume};

    #[test]
    fn test_backup_volume_names_filters_unselected() {
        let pod = Pod {
            spec: Some(PodSpec {
                volumes: Some(vec![
                    Volume {
                        name: "data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: "data".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "scratch".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let pvc = PvcRef {
            namespace: "app".to_string(),
            name: "data".to_string(),
        };
        let mapping = BTreeMap::from([(
            pvc.clone(),
            PlanPv {
                name: "pv-data".to_string(),
                pvc,
                selection: PvSelection::default(),
                ..Default::default()
            },
        )]);

        assert_eq!(
            backup_volume_names(&pod, "app", &mapping),
            vec!["data".to_string()]
        );
    }

    #[test]
    fn test_strip_labels() {
        let mut labels = BTreeMap::from([
            (INCLUDED_IN_STAGE_BACKUP_LABEL.to_string(), "uid".to_string()),
            ("app".to_string(), "web".to_string()),
        ]);
        assert!(strip_labels(Some(&mut labels)));
        assert!(!labels.contains_key(INCLUDED_IN_STAGE_BACKUP_LABEL));
        assert!(labels.contains_key("app"));
        assert!(!strip_labels(Some(&mut labels)));
    }
}
