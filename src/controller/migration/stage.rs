//! Stage pod phases of the task engine.
//!
//! Stage pods are discovered in three passes (running pods, workload
//! controller pod templates, and orphaned bound claims) and deduplicated
//! by volume-source set. They exist only so the BR engine's volume sidecar
//! finds the claims attached during the stage backup, and are torn down as
//! soon as the stage restore lands.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::{LimitRange, PersistentVolumeClaim, Pod};
use kube::api::{DeleteParams, ListParams};
use kube::ResourceExt;

use crate::compat::CompatClient;
use crate::crd::condition::{Category, Condition, TRUE};
use crate::crd::plan::PvcRef;
use crate::crd::{MIGRATION_NAMESPACE, PvAction, PvCopyMethod};
use crate::controller::error::Result;
use crate::resources::stage_pod::{
    build_resource_limit_mapping, build_stage_pod, build_stage_pods, ResourceLimitMapping,
    StagePodList,
};
use crate::settings::Settings;

use super::backup::{selector, INCLUDED_IN_STAGE_BACKUP_LABEL};
use super::restore::{background_delete, tolerate_not_found};
use super::task::{Task, STAGE_PODS_CREATED};

/// Label marking stage pods for cleanup.
pub const STAGE_POD_LABEL: &str = "migration-stage-pod";

/// Restic discovery labels in the BR engine namespace.
const RESTIC_POD_LABEL_KEY: &str = "name";
const RESTIC_POD_LABEL_VALUE: &str = "restic";

/// Stage pod start report.
#[derive(Debug, Default)]
pub struct PodStartReport {
    /// Failure detected (unhealthy claims, failed pod).
    pub failed: bool,
    /// Failure reasons.
    pub reasons: Vec<String>,
    /// All stage pods started.
    pub started: bool,
    /// Progress lines.
    pub progress: Vec<String>,
}

impl Task<'_> {
    /// Cleanup label applied to all stage pods.
    pub(super) fn stage_pod_cleanup_label(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(STAGE_POD_LABEL.to_string(), "true".to_string())])
    }

    /// Full stage pod label set: correlation labels of both plan and
    /// migration, the stage backup inclusion label, and the cleanup label.
    pub(super) fn stage_pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.correlation_labels();
        labels.insert(INCLUDED_IN_STAGE_BACKUP_LABEL.to_string(), self.uid());
        labels.extend(self.stage_pod_cleanup_label());
        labels
    }

    /// Stage pods discovered from currently running pods.
    pub(super) async fn ensure_stage_pods_from_running(&mut self) -> Result<()> {
        let client = self.plan.src_client.clone();
        let labels = self.stage_pod_labels();
        let mapping = self.pvc_mapping();
        let limits = self.resource_limit_mapping(&client).await?;
        let image = Settings::get().migration.stage_pod_image.clone();

        let mut stage_pods = StagePodList::new();
        for namespace in self.source_namespaces() {
            let pods = client
                .list::<Pod>(&namespace, &ListParams::default())
                .await?;
            stage_pods.merge(
                build_stage_pods(&labels, &mapping, &pods, &image, &limits).into_pods(),
            );
        }

        let created = self.create_stage_pods(&client, stage_pods).await?;
        self.record_stage_pods_created(created);
        Ok(())
    }

    /// Stage pods discovered from workload controller pod templates, so
    /// claims mounted only by scaled-down or unscheduled workloads are
    /// still captured.
    pub(super) async fn ensure_stage_pods_from_templates(&mut self) -> Result<()> {
        let client = self.plan.src_client.clone();
        let labels = self.stage_pod_labels();
        let mapping = self.pvc_mapping();
        let limits = self.resource_limit_mapping(&client).await?;
        let image = Settings::get().migration.stage_pod_image.clone();

        let template_pods = self.list_template_pods(&client).await?;
        let stage_pods = build_stage_pods(&labels, &mapping, &template_pods, &image, &limits);

        let created = self.create_stage_pods(&client, stage_pods).await?;
        self.record_stage_pods_created(created);
        Ok(())
    }

    /// Stage pods for bound claims no pod or template mounts.
    pub(super) async fn ensure_stage_pods_from_orphaned_pvcs(&mut self) -> Result<()> {
        let client = self.plan.src_client.clone();
        let labels = self.stage_pod_labels();
        let mapping = self.pvc_mapping();
        let limits = self.resource_limit_mapping(&client).await?;
        let image = Settings::get().migration.stage_pod_image.clone();

        let existing = self.list_stage_pods(&client).await?;
        let mut stage_pods = StagePodList::new();
        for namespace in self.source_namespaces() {
            let claims = client
                .list::<PersistentVolumeClaim>(&namespace, &ListParams::default())
                .await?;
            for pvc in claims {
                let bound = pvc
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.as_deref())
                    == Some("Bound");
                if !bound {
                    continue;
                }
                let key = PvcRef {
                    namespace: namespace.clone(),
                    name: pvc.name_any(),
                };
                let eligible = mapping.get(&key).is_some_and(|pv| {
                    pv.selection.action == PvAction::Copy
                        && pv.selection.copy_method == PvCopyMethod::Filesystem
                });
                if !eligible || pvc_mounted(&existing, &key) {
                    continue;
                }
                stage_pods.merge([build_stage_pod(&pvc, &labels, &image, &limits)]);
            }
        }

        let created = self.create_stage_pods(&client, stage_pods).await?;
        self.record_stage_pods_created(created);
        Ok(())
    }

    /// Create any stage pods not already covered; returns the total count
    /// of stage pods that exist after the call.
    async fn create_stage_pods(
        &self,
        client: &CompatClient,
        stage_pods: StagePodList,
    ) -> Result<usize> {
        let existing = self.list_stage_pods(client).await?;
        let mut created = 0;
        for pod in stage_pods.into_pods() {
            if existing.contains(&pod) {
                continue;
            }
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            match client.create(&namespace, &pod).await {
                Ok(_) => created += 1,
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(created + existing.len())
    }

    async fn list_stage_pods(&self, client: &CompatClient) -> Result<StagePodList> {
        let params = ListParams::default().labels(&selector(&self.stage_pod_labels()));
        let mut pods = Vec::new();
        for namespace in self.source_namespaces() {
            pods.extend(client.list::<Pod>(&namespace, &params).await?);
        }
        Ok(StagePodList::from_pods(pods))
    }

    /// Synthesize pods from workload controller templates. Listing goes
    /// through the compat layer, so old clusters serve the legacy groups.
    async fn list_template_pods(&self, client: &CompatClient) -> Result<Vec<Pod>> {
        let params = ListParams::default();
        let mut pods = Vec::new();
        for namespace in self.source_namespaces() {
            for deployment in client.list::<Deployment>(&namespace, &params).await? {
                if let Some(spec) = deployment.spec {
                    pods.push(template_pod(&namespace, spec.template.spec));
                }
            }
            for stateful_set in client.list::<StatefulSet>(&namespace, &params).await? {
                if let Some(spec) = stateful_set.spec {
                    pods.push(template_pod(&namespace, spec.template.spec));
                }
            }
            for daemon_set in client.list::<DaemonSet>(&namespace, &params).await? {
                if let Some(spec) = daemon_set.spec {
                    pods.push(template_pod(&namespace, spec.template.spec));
                }
            }
            for replica_set in client.list::<ReplicaSet>(&namespace, &params).await? {
                if let Some(spec) = replica_set.spec
                    && let Some(template) = spec.template
                {
                    pods.push(template_pod(&namespace, template.spec));
                }
            }
        }
        Ok(pods)
    }

    async fn resource_limit_mapping(
        &self,
        client: &CompatClient,
    ) -> Result<ResourceLimitMapping> {
        let namespaces = self.source_namespaces();
        let mut ranges = BTreeMap::new();
        for namespace in &namespaces {
            let list = client
                .list::<LimitRange>(namespace, &ListParams::default())
                .await?;
            ranges.insert(namespace.clone(), list);
        }
        Ok(build_resource_limit_mapping(&namespaces, &ranges))
    }

    fn record_stage_pods_created(&mut self, count: usize) {
        if count > 0 {
            self.conditions().set(
                Condition::new(STAGE_PODS_CREATED, TRUE, Category::Advisory)
                    .reason("Created")
                    .message("[] Stage pods created.")
                    .items(vec![count.to_string()])
                    .durable(true),
            );
        }
    }

    /// Whether stage pods have started on the source cluster, with claim
    /// health checked for pods stuck waiting.
    pub(super) async fn stage_pods_started(&self) -> Result<PodStartReport> {
        let client = &self.plan.src_client;
        let mut report = PodStartReport::default();
        let params = ListParams::default().labels(&selector(&self.owner.correlation_labels()));

        for namespace in self.source_namespaces() {
            let pods = client.list::<Pod>(&namespace, &params).await?;
            for pod in &pods {
                let name = pod.name_any();
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                match phase.as_str() {
                    "Running" => {
                        report
                            .progress
                            .push(format!("Pod {namespace}/{name}: Running"));
                        report.started = true;
                    }
                    "Pending" => {
                        let scheduled = pod
                            .spec
                            .as_ref()
                            .and_then(|s| s.node_name.as_deref())
                            .is_some();
                        if scheduled && !self.claims_healthy(client, pod, &mut report).await? {
                            report.failed = true;
                            return Ok(report);
                        }
                        if let Some(statuses) = pod
                            .status
                            .as_ref()
                            .and_then(|s| s.container_statuses.as_ref())
                        {
                            for status in statuses {
                                if let Some(waiting) =
                                    status.state.as_ref().and_then(|s| s.waiting.as_ref())
                                {
                                    report.progress.push(format!(
                                        "Pod {namespace}/{name}: Container {} {}",
                                        status.name,
                                        waiting.message.clone().unwrap_or_default()
                                    ));
                                }
                            }
                        }
                        report.started = false;
                    }
                    "Failed" | "Unknown" => {
                        report.failed = true;
                        report
                            .reasons
                            .push(format!("Pod {namespace}/{name}: {phase}"));
                    }
                    _ => {}
                }
            }
        }
        Ok(report)
    }

    /// Check the claims a stage pod mounts; a missing, deleted, or unbound
    /// claim fails the migration so the user can fix the plan.
    async fn claims_healthy(
        &self,
        client: &CompatClient,
        pod: &Pod,
        report: &mut PodStartReport,
    ) -> Result<bool> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let volumes = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .cloned()
            .unwrap_or_default();
        for volume in volumes {
            let Some(claim) = volume.persistent_volume_claim else {
                continue;
            };
            let key = format!("{namespace}/{}", claim.claim_name);
            match client
                .get_opt::<PersistentVolumeClaim>(&namespace, &claim.claim_name)
                .await?
            {
                None => {
                    report.reasons.push(format!("PVC: {key}, not-found."));
                    return Ok(false);
                }
                Some(pvc) if pvc.metadata.deletion_timestamp.is_some() => {
                    report.reasons.push(format!("PVC: {key}, deleted."));
                    return Ok(false);
                }
                Some(pvc) => {
                    let bound = pvc
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        == Some("Bound");
                    if !bound {
                        report.reasons.push(format!("PVC: {key}, not bound."));
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Delete stage pods in every migrated namespace on both clusters.
    pub(super) async fn ensure_stage_pods_deleted(&mut self) -> Result<()> {
        let params = ListParams::default().labels(&selector(&self.stage_pod_cleanup_label()));
        let sides = [
            (self.plan.src_client.clone(), self.source_namespaces()),
            (self.plan.dest_client.clone(), self.destination_namespaces()),
        ];
        for (client, namespaces) in sides {
            for namespace in namespaces {
                let pods = client.list::<Pod>(&namespace, &params).await?;
                for pod in pods {
                    let result = client
                        .delete::<Pod>(&namespace, &pod.name_any(), &DeleteParams::default())
                        .await;
                    tolerate_not_found(result)?;
                    tracing::info!(ns = %namespace, name = %pod.name_any(), "Stage pod deleted.");
                }
            }
        }
        Ok(())
    }

    /// Whether deleted stage pods have finished terminating on both
    /// clusters. Clears the StagePodsCreated condition once true.
    pub(super) async fn stage_pods_terminated(&mut self) -> Result<bool> {
        let params = ListParams::default().labels(&selector(&self.stage_pod_cleanup_label()));
        let sides = [
            (self.plan.src_client.clone(), self.source_namespaces()),
            (self.plan.dest_client.clone(), self.destination_namespaces()),
        ];
        for (client, namespaces) in sides {
            for namespace in namespaces {
                let pods = client.list::<Pod>(&namespace, &params).await?;
                for pod in pods {
                    let phase = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.clone())
                        .unwrap_or_default();
                    if !matches!(phase.as_str(), "Succeeded" | "Failed" | "Unknown") {
                        return Ok(false);
                    }
                }
            }
        }
        self.conditions().delete(STAGE_PODS_CREATED);
        Ok(true)
    }

    /// Measure real usage of the plan's claims through the BR engine's
    /// node agents, one node at a time concurrently. Sizes surface as
    /// progress lines and feed destination capacity selection.
    pub(super) async fn collect_volume_usage(&mut self) -> Result<()> {
        use crate::controller::analytic::{PvDetails, ResticDfExecutor};

        let client = self.plan.src_client.clone();
        let mapping = self.pvc_mapping();
        let mut node_map: std::collections::HashMap<String, Vec<PvDetails>> =
            std::collections::HashMap::new();
        for namespace in self.source_namespaces() {
            let pods = client
                .list::<Pod>(&namespace, &ListParams::default())
                .await?;
            for pod in &pods {
                let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) else {
                    continue;
                };
                let pod_uid = pod.uid().unwrap_or_default();
                let volumes = pod
                    .spec
                    .as_ref()
                    .and_then(|s| s.volumes.as_ref())
                    .cloned()
                    .unwrap_or_default();
                for volume in volumes {
                    let Some(claim) = volume.persistent_volume_claim else {
                        continue;
                    };
                    let key = PvcRef {
                        namespace: namespace.clone(),
                        name: claim.claim_name.clone(),
                    };
                    if let Some(pv) = mapping.get(&key) {
                        node_map.entry(node.clone()).or_default().push(PvDetails {
                            name: key.name,
                            namespace: key.namespace,
                            volume_name: pv.name.clone(),
                            pod_uid: pod_uid.clone(),
                        });
                    }
                }
            }
        }

        let mut executor = ResticDfExecutor::new(MIGRATION_NAMESPACE.to_string(), client);
        for output in executor.execute(node_map).await? {
            if output.is_error {
                continue;
            }
            if let Some(used) = output.usage_mb {
                self.progress.push(format!(
                    "PVC {}/{}: {}M used",
                    output.namespace, output.name, used
                ));
            }
        }
        Ok(())
    }

    /// Restart the BR engine's restic daemonset pods on the source so they
    /// observe newly attached stage pod volumes.
    pub(super) async fn restart_restic_pods(&mut self) -> Result<()> {
        let client = &self.plan.src_client;
        let params = ListParams::default()
            .labels(&format!("{RESTIC_POD_LABEL_KEY}={RESTIC_POD_LABEL_VALUE}"));
        let pods = client.list::<Pod>(MIGRATION_NAMESPACE, &params).await?;
        for pod in pods {
            let result = client
                .delete::<Pod>(MIGRATION_NAMESPACE, &pod.name_any(), &background_delete())
                .await;
            tolerate_not_found(result)?;
        }
        Ok(())
    }

    /// Whether the restarted restic pods are running again.
    pub(super) async fn restic_pods_started(&self) -> Result<bool> {
        let client = &self.plan.src_client;
        let params = ListParams::default()
            .labels(&format!("{RESTIC_POD_LABEL_KEY}={RESTIC_POD_LABEL_VALUE}"));
        let pods = client.list::<Pod>(MIGRATION_NAMESPACE, &params).await?;
        if pods.is_empty() {
            return Ok(false);
        }
        for pod in pods {
            if pod.metadata.deletion_timestamp.is_some() {
                return Ok(false);
            }
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_default();
            if phase != "Running" {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn pvc_mounted(list: &StagePodList, claim: &PvcRef) -> bool {
    list.pods().iter().any(|pod| {
        pod.metadata.namespace.as_deref() == Some(claim.namespace.as_str())
            && pod
                .spec
                .as_ref()
                .and_then(|s| s.volumes.as_ref())
                .is_some_and(|volumes| {
                    volumes.iter().any(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .is_some_and(|c| c.claim_name == claim.name)
                    })
                })
    })
}

fn template_pod(
    namespace: &str,
    spec: Option<k8s_openapi::api::core::v1::PodSpec>,
) -> Pod {
    Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec,
        ..Default::default()
    }
}
