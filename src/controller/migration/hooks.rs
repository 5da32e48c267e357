//! Hook phases of the task engine.
//!
//! Each of the four hook points runs at most one bound hook as a one-shot
//! job on the hook's target cluster. Jobs and their playbook configmaps
//! are labeled with the hook phase and the migration's correlation labels,
//! so an in-flight job is rediscovered across reconciles rather than
//! recreated.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::{Api, ResourceExt};

use crate::compat::CompatClient;
use crate::crd::hook::{
    DESTINATION_CLUSTER, MigHook, POST_BACKUP_HOOK_PHASE, POST_RESTORE_HOOK_PHASE,
    PRE_BACKUP_HOOK_PHASE, PRE_RESTORE_HOOK_PHASE,
};
use crate::controller::error::Result;
use crate::resources::hook_job::{hook_job, hook_labels, playbook_config_map};

use super::backup::selector;
use super::task::{Phase, Task};

/// Outcome of driving one hook point for one tick.
enum HookStatus {
    /// No hook bound, or the job succeeded.
    Completed,
    /// The job is still running.
    Running,
    /// The job failed or exceeded its deadline.
    Failed(Vec<String>),
}

impl Task<'_> {
    /// Drive the hook point for the current phase: advance on success,
    /// hold while running, fail to the matching `*HooksFailed` phase.
    pub(super) async fn run_hook_phase(&mut self) -> Result<()> {
        let (hook_phase, fail_phase) = match self.phase {
            Phase::PreBackupHooks => (PRE_BACKUP_HOOK_PHASE, Phase::PreBackupHooksFailed),
            Phase::PostBackupHooks => (POST_BACKUP_HOOK_PHASE, Phase::PostBackupHooksFailed),
            Phase::PreRestoreHooks => (PRE_RESTORE_HOOK_PHASE, Phase::PreRestoreHooksFailed),
            Phase::PostRestoreHooks => (POST_RESTORE_HOOK_PHASE, Phase::PostRestoreHooksFailed),
            _ => return Ok(()),
        };

        match self.run_hooks(hook_phase).await? {
            HookStatus::Completed => self.next(),
            HookStatus::Running => self.requeue = None,
            HookStatus::Failed(reasons) => self.fail(fail_phase, reasons),
        }
        Ok(())
    }

    async fn run_hooks(&mut self, hook_phase: &str) -> Result<HookStatus> {
        let Some(binding) = self.plan.plan.hook_for_phase(hook_phase).cloned() else {
            return Ok(HookStatus::Completed);
        };

        let hooks: Api<MigHook> =
            Api::namespaced(self.client.clone(), &binding.reference.namespace);
        let hook = hooks.get(&binding.reference.name).await?;

        let client = self.hook_cluster_client(&hook)?;
        let labels = hook_labels(&self.owner.correlation_labels(), hook_phase);
        let params = ListParams::default().labels(&selector(&labels));

        // Rediscover an in-flight job before creating anything.
        let jobs = client
            .list::<Job>(&binding.execution_namespace, &params)
            .await?;
        if let Some(job) = jobs.first() {
            return Ok(job_status(job));
        }

        // Materialize the playbook, then the job referencing it.
        let config_maps = client
            .list::<ConfigMap>(&binding.execution_namespace, &params)
            .await?;
        let config_map = match config_maps.into_iter().next() {
            Some(existing) => existing,
            None => {
                let config_map = playbook_config_map(&hook, &binding, &labels)?;
                client
                    .create(&binding.execution_namespace, &config_map)
                    .await?
            }
        };

        let job = hook_job(&hook, &binding, &config_map.name_any(), &labels);
        client.create(&binding.execution_namespace, &job).await?;
        Ok(HookStatus::Running)
    }

    fn hook_cluster_client(&self, hook: &MigHook) -> Result<CompatClient> {
        if hook.spec.target_cluster == DESTINATION_CLUSTER {
            Ok(self.plan.dest_client.clone())
        } else {
            Ok(self.plan.src_client.clone())
        }
    }
}

fn job_status(job: &Job) -> HookStatus {
    let Some(status) = &job.status else {
        return HookStatus::Running;
    };
    if status.succeeded.unwrap_or_default() > 0 {
        return HookStatus::Completed;
    }
    if let Some(conditions) = &status.conditions {
        for condition in conditions {
            if condition.type_ == "Failed" && condition.status == "True" {
                return HookStatus::Failed(vec![format!(
                    "Hook job {} failed: {}",
                    job.name_any(),
                    condition.message.clone().unwrap_or_default()
                )]);
            }
        }
    }
    HookStatus::Running
}
