//! Builders for hook jobs and their playbook configmaps.
//!
//! A bound hook materializes as a configmap carrying the decoded playbook
//! and a one-shot job running either the hook image's own entrypoint
//! (custom hooks) or ansible-runner against the playbook. Labels carry the
//! hook phase and owner correlation so an in-flight job is rediscovered
//! across reconciles instead of recreated.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::hook::{MigHook, PHASE_LABEL};
use crate::crd::plan::HookBinding;

/// Where the playbook lands inside the hook container.
const PLAYBOOK_MOUNT_PATH: &str = "/tmp/playbook";

/// Errors building hook resources.
#[derive(Debug, thiserror::Error)]
pub enum HookBuildError {
    #[error("hook playbook is not valid base64: {0}")]
    Playbook(#[from] base64::DecodeError),

    #[error("hook {0} has no playbook and is not custom")]
    MissingPlaybook(String),
}

/// Labels identifying one hook invocation: correlation labels plus the
/// hook phase.
pub fn hook_labels(
    correlation: &BTreeMap<String, String>,
    phase: &str,
) -> BTreeMap<String, String> {
    let mut labels = correlation.clone();
    labels.insert(PHASE_LABEL.to_string(), phase.to_string());
    labels
}

/// Configmap holding the decoded playbook body.
pub fn playbook_config_map(
    hook: &MigHook,
    binding: &HookBinding,
    labels: &BTreeMap<String, String>,
) -> Result<ConfigMap, HookBuildError> {
    let playbook = match &hook.spec.playbook {
        Some(encoded) => String::from_utf8_lossy(&BASE64.decode(encoded)?).to_string(),
        None if hook.spec.custom => String::new(),
        None => {
            return Err(HookBuildError::MissingPlaybook(
                hook.metadata.name.clone().unwrap_or_default(),
            ));
        }
    };

    Ok(ConfigMap {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", binding.phase.to_lowercase())),
            namespace: Some(binding.execution_namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "playbook.yml".to_string(),
            playbook,
        )])),
        ..Default::default()
    })
}

/// One-shot job running the hook.
pub fn hook_job(
    hook: &MigHook,
    binding: &HookBinding,
    config_map_name: &str,
    labels: &BTreeMap<String, String>,
) -> Job {
    let command = if hook.spec.custom {
        None
    } else {
        Some(vec![
            "/bin/entrypoint".to_string(),
            "ansible-runner".to_string(),
            "run".to_string(),
            "/tmp/runner".to_string(),
            "-p".to_string(),
            format!("{PLAYBOOK_MOUNT_PATH}/playbook.yml"),
        ])
    };

    Job {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", binding.phase.to_lowercase())),
            namespace: Some(binding.execution_namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: hook.spec.active_deadline_seconds,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    service_account_name: binding.service_account.clone(),
                    containers: vec![Container {
                        name: binding.phase.to_lowercase(),
                        image: Some(hook.spec.image.clone()),
                        command,
                        volume_mounts: Some(vec![VolumeMount {
                            name: "playbook".to_string(),
                            mount_path: PLAYBOOK_MOUNT_PATH.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "playbook".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: config_map_name.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::hook::MigHookSpec;
    use crate::crd::ObjectRef;

    fn binding() -> HookBinding {
        HookBinding {
            reference: ObjectRef::new("openshift-migration", "pre-backup-hook"),
            phase: "PreBackup".to_string(),
            execution_namespace: "app".to_string(),
            service_account: Some("hook-runner".to_string()),
        }
    }

    fn playbook_hook() -> MigHook {
        MigHook::new(
            "pre-backup-hook",
            MigHookSpec {
                image: "quay.io/konveyor/hook-runner:latest".to_string(),
                playbook: Some(BASE64.encode("- hosts: localhost\n")),
                target_cluster: "source".to_string(),
                active_deadline_seconds: Some(300),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_playbook_decoded_into_config_map() {
        let labels = BTreeMap::new();
        let cm = playbook_config_map(&playbook_hook(), &binding(), &labels).unwrap();
        assert_eq!(
            cm.data.unwrap()["playbook.yml"],
            "- hosts: localhost\n".to_string()
        );
    }

    #[test]
    fn test_missing_playbook_rejected_for_non_custom() {
        let mut hook = playbook_hook();
        hook.spec.playbook = None;
        let result = playbook_config_map(&hook, &binding(), &BTreeMap::new());
        assert!(matches!(result, Err(HookBuildError::MissingPlaybook(_))));
    }

    #[test]
    fn test_job_carries_deadline_and_labels() {
        let labels = hook_labels(
            &BTreeMap::from([("migmigration".to_string(), "uid".to_string())]),
            "PreBackup",
        );
        let job = hook_job(&playbook_hook(), &binding(), "pre-backup-cm", &labels);

        let spec = job.spec.unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(300));
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(
            job.metadata.labels.unwrap().get(PHASE_LABEL),
            Some(&"PreBackup".to_string())
        );
    }

    #[test]
    fn test_custom_hook_uses_image_entrypoint() {
        let mut hook = playbook_hook();
        hook.spec.custom = true;
        let job = hook_job(&hook, &binding(), "cm", &BTreeMap::new());
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        assert!(container.command.is_none());
    }
}
