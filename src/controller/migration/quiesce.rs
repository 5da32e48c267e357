//! Quiesce phases of the task engine.
//!
//! Quiescing scales application workloads to zero for the duration of the
//! copy so volume data stops changing. The previous scale is remembered in
//! an annotation and restored on UnQuiesce. DaemonSets cannot be scaled,
//! so they get an unsatisfiable node selector; CronJobs are suspended.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::ResourceExt;

use crate::compat::CompatClient;
use crate::controller::error::Result;

use super::task::Task;

/// Annotation remembering the pre-quiesce replica count.
pub const REPLICAS_ANNOTATION: &str = "migration.openshift.io/preQuiesceReplicas";
/// Annotation remembering a suspended CronJob.
pub const SUSPEND_ANNOTATION: &str = "migration.openshift.io/preQuiesceSuspend";
/// Node selector no node satisfies, parking DaemonSet pods.
pub const QUIESCE_NODE_SELECTOR: &str = "migration.openshift.io/quiesceDaemonSet";

impl Task<'_> {
    /// Scale workload controllers to zero in every source namespace.
    pub(super) async fn quiesce_applications(&mut self) -> Result<()> {
        let client = self.plan.src_client.clone();
        for namespace in self.source_namespaces() {
            quiesce_deployments(&client, &namespace).await?;
            quiesce_stateful_sets(&client, &namespace).await?;
            quiesce_replica_sets(&client, &namespace).await?;
            quiesce_daemon_sets(&client, &namespace).await?;
            quiesce_cron_jobs(&client, &namespace).await?;
            quiesce_jobs(&client, &namespace).await?;
        }
        Ok(())
    }

    /// Reverse quiesce: restore remembered scale and selectors.
    pub(super) async fn unquiesce_applications(&mut self) -> Result<()> {
        let client = self.plan.src_client.clone();
        for namespace in self.source_namespaces() {
            unquiesce_deployments(&client, &namespace).await?;
            unquiesce_stateful_sets(&client, &namespace).await?;
            unquiesce_replica_sets(&client, &namespace).await?;
            unquiesce_daemon_sets(&client, &namespace).await?;
            unquiesce_cron_jobs(&client, &namespace).await?;
        }
        Ok(())
    }

    /// Whether all controller-owned pods have terminated in the source
    /// namespaces.
    pub(super) async fn quiesced_pods_terminated(&self) -> Result<bool> {
        let client = &self.plan.src_client;
        let owned_kinds = ["ReplicaSet", "StatefulSet", "DaemonSet", "Job"];
        for namespace in self.source_namespaces() {
            let pods = client.list::<Pod>(&namespace, &ListParams::default()).await?;
            for pod in pods {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                if matches!(phase.as_str(), "Succeeded" | "Failed") {
                    continue;
                }
                let controller_owned = pod
                    .metadata
                    .owner_references
                    .as_ref()
                    .is_some_and(|refs| refs.iter().any(|r| owned_kinds.contains(&r.kind.as_str())));
                if controller_owned {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn remember_replicas(annotations: &mut BTreeMap<String, String>, replicas: i32) {
    annotations
        .entry(REPLICAS_ANNOTATION.to_string())
        .or_insert_with(|| replicas.to_string());
}

fn recall_replicas(annotations: &mut BTreeMap<String, String>) -> Option<i32> {
    annotations
        .remove(REPLICAS_ANNOTATION)
        .and_then(|v| v.parse().ok())
}

/// Whether a resource is controlled by another workload controller and
/// will be quiesced through its owner instead.
fn controller_owned(refs: Option<&Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>>, kinds: &[&str]) -> bool {
    refs.is_some_and(|refs| {
        refs.iter()
            .any(|r| r.controller == Some(true) && kinds.contains(&r.kind.as_str()))
    })
}

async fn quiesce_deployments(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut deployment in client
        .list::<Deployment>(namespace, &ListParams::default())
        .await?
    {
        let Some(spec) = deployment.spec.as_mut() else {
            continue;
        };
        if spec.replicas == Some(0) {
            continue;
        }
        remember_replicas(
            deployment
                .metadata
                .annotations
                .get_or_insert_with(Default::default),
            deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1),
        );
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(0);
        }
        client.update(namespace, &deployment).await?;
    }
    Ok(())
}

async fn unquiesce_deployments(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut deployment in client
        .list::<Deployment>(namespace, &ListParams::default())
        .await?
    {
        let Some(annotations) = deployment.metadata.annotations.as_mut() else {
            continue;
        };
        let Some(replicas) = recall_replicas(annotations) else {
            continue;
        };
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        client.update(namespace, &deployment).await?;
    }
    Ok(())
}

async fn quiesce_stateful_sets(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut set in client
        .list::<StatefulSet>(namespace, &ListParams::default())
        .await?
    {
        let Some(spec) = set.spec.as_mut() else { continue };
        if spec.replicas == Some(0) {
            continue;
        }
        let current = spec.replicas.unwrap_or(1);
        remember_replicas(
            set.metadata.annotations.get_or_insert_with(Default::default),
            current,
        );
        if let Some(spec) = set.spec.as_mut() {
            spec.replicas = Some(0);
        }
        client.update(namespace, &set).await?;
    }
    Ok(())
}

async fn unquiesce_stateful_sets(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut set in client
        .list::<StatefulSet>(namespace, &ListParams::default())
        .await?
    {
        let Some(annotations) = set.metadata.annotations.as_mut() else {
            continue;
        };
        let Some(replicas) = recall_replicas(annotations) else {
            continue;
        };
        if let Some(spec) = set.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        client.update(namespace, &set).await?;
    }
    Ok(())
}

async fn quiesce_replica_sets(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut set in client
        .list::<ReplicaSet>(namespace, &ListParams::default())
        .await?
    {
        // Deployment-owned sets are quiesced through their deployment.
        if controller_owned(set.metadata.owner_references.as_ref(), &["Deployment"]) {
            continue;
        }
        let Some(spec) = set.spec.as_mut() else { continue };
        if spec.replicas == Some(0) {
            continue;
        }
        let current = spec.replicas.unwrap_or(1);
        remember_replicas(
            set.metadata.annotations.get_or_insert_with(Default::default),
            current,
        );
        if let Some(spec) = set.spec.as_mut() {
            spec.replicas = Some(0);
        }
        client.update(namespace, &set).await?;
    }
    Ok(())
}

async fn unquiesce_replica_sets(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut set in client
        .list::<ReplicaSet>(namespace, &ListParams::default())
        .await?
    {
        if controller_owned(set.metadata.owner_references.as_ref(), &["Deployment"]) {
            continue;
        }
        let Some(annotations) = set.metadata.annotations.as_mut() else {
            continue;
        };
        let Some(replicas) = recall_replicas(annotations) else {
            continue;
        };
        if let Some(spec) = set.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        client.update(namespace, &set).await?;
    }
    Ok(())
}

async fn quiesce_daemon_sets(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut set in client
        .list::<DaemonSet>(namespace, &ListParams::default())
        .await?
    {
        let Some(spec) = set.spec.as_mut() else { continue };
        let Some(pod_spec) = spec.template.spec.as_mut() else {
            continue;
        };
        let selector = pod_spec.node_selector.get_or_insert_with(Default::default);
        if selector.contains_key(QUIESCE_NODE_SELECTOR) {
            continue;
        }
        selector.insert(QUIESCE_NODE_SELECTOR.to_string(), "quiesced".to_string());
        client.update(namespace, &set).await?;
    }
    Ok(())
}

async fn unquiesce_daemon_sets(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut set in client
        .list::<DaemonSet>(namespace, &ListParams::default())
        .await?
    {
        let Some(spec) = set.spec.as_mut() else { continue };
        let Some(pod_spec) = spec.template.spec.as_mut() else {
            continue;
        };
        let Some(selector) = pod_spec.node_selector.as_mut() else {
            continue;
        };
        if selector.remove(QUIESCE_NODE_SELECTOR).is_none() {
            continue;
        }
        client.update(namespace, &set).await?;
    }
    Ok(())
}

async fn quiesce_cron_jobs(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut job in client
        .list::<CronJob>(namespace, &ListParams::default())
        .await?
    {
        let Some(spec) = job.spec.as_mut() else { continue };
        if spec.suspend == Some(true) {
            continue;
        }
        job.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .entry(SUSPEND_ANNOTATION.to_string())
            .or_insert_with(|| "false".to_string());
        if let Some(spec) = job.spec.as_mut() {
            spec.suspend = Some(true);
        }
        client.update(namespace, &job).await?;
    }
    Ok(())
}

async fn unquiesce_cron_jobs(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut job in client
        .list::<CronJob>(namespace, &ListParams::default())
        .await?
    {
        let Some(annotations) = job.metadata.annotations.as_mut() else {
            continue;
        };
        if annotations.remove(SUSPEND_ANNOTATION).is_none() {
            continue;
        }
        if let Some(spec) = job.spec.as_mut() {
            spec.suspend = Some(false);
        }
        client.update(namespace, &job).await?;
    }
    Ok(())
}

async fn quiesce_jobs(client: &CompatClient, namespace: &str) -> Result<()> {
    for mut job in client.list::<Job>(namespace, &ListParams::default()).await? {
        // CronJob-owned jobs stop with their owner's suspension.
        if controller_owned(job.metadata.owner_references.as_ref(), &["CronJob"]) {
            continue;
        }
        let Some(spec) = job.spec.as_mut() else { continue };
        if spec.parallelism == Some(0) {
            continue;
        }
        remember_replicas(
            job.metadata.annotations.get_or_insert_with(Default::default),
            spec.parallelism.unwrap_or(1),
        );
        if let Some(spec) = job.spec.as_mut() {
            spec.parallelism = Some(0);
        }
        client.update(namespace, &job).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn test_remember_and_recall_replicas() {
        let mut annotations = BTreeMap::new();
        remember_replicas(&mut annotations, 3);
        assert_eq!(
            annotations.get(REPLICAS_ANNOTATION).map(String::as_str),
            Some("3")
        );

        assert_eq!(recall_replicas(&mut annotations), Some(3));
        assert!(!annotations.contains_key(REPLICAS_ANNOTATION));
    }

    #[test]
    fn test_remember_replicas_keeps_first_value() {
        // A second quiesce pass must not overwrite the remembered scale
        // with the already-zeroed replica count.
        let mut annotations = BTreeMap::new();
        remember_replicas(&mut annotations, 5);
        remember_replicas(&mut annotations, 0);
        assert_eq!(recall_replicas(&mut annotations), Some(5));
    }

    #[test]
    fn test_recall_replicas_missing_or_malformed() {
        let mut annotations = BTreeMap::new();
        assert_eq!(recall_replicas(&mut annotations), None);

        annotations.insert(REPLICAS_ANNOTATION.to_string(), "many".to_string());
        assert_eq!(recall_replicas(&mut annotations), None);
        // A malformed value is still consumed so unquiesce settles.
        assert!(!annotations.contains_key(REPLICAS_ANNOTATION));
    }

    fn owner_ref(kind: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            kind: kind.to_string(),
            controller: Some(controller),
            ..Default::default()
        }
    }

    #[test]
    fn test_controller_owned_matches_kind() {
        let refs = vec![owner_ref("Deployment", true)];
        assert!(controller_owned(Some(&refs), &["Deployment"]));
        assert!(!controller_owned(Some(&refs), &["CronJob"]));
    }

    #[test]
    fn test_controller_owned_requires_controller_flag() {
        let refs = vec![owner_ref("CronJob", false)];
        assert!(!controller_owned(Some(&refs), &["CronJob"]));
        assert!(!controller_owned(None, &["CronJob"]));
    }
}
