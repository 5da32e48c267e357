//! DirectVolumeMigration controller.
//!
//! Reconciles one rsync transfer between clusters: resolves the two
//! cluster references, runs one tick of the transfer itinerary, and writes
//! phase, pod progress, and route hosts back to status.

pub mod task;

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error};

use crate::crd::condition::{Category, Condition, TRUE};
use crate::crd::{DirectVolumeMigration, MigCluster, RUNNING, SUCCEEDED};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};

use task::{Phase, Task, FAST_REQUEUE};

/// Reconcile a DirectVolumeMigration: one itinerary tick per event.
pub async fn reconcile(obj: Arc<DirectVolumeMigration>, ctx: Arc<Context>) -> Result<Action> {
    let started = std::time::Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling DirectVolumeMigration");

    let api: Api<DirectVolumeMigration> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut migration = (*obj).clone();

    if migration
        .status
        .as_ref()
        .map(|s| s.phase == Phase::Completed.as_str())
        .unwrap_or(false)
    {
        return Ok(Action::await_change());
    }

    let status = migration.status.get_or_insert_with(Default::default);
    status.conditions.begin_staging();
    if status.start_timestamp.is_none() {
        status.start_timestamp = Some(jiff::Timestamp::now().to_string());
    }

    let src_client = cluster_client(&ctx, &migration, true).await?;
    let dest_client = cluster_client(&ctx, &migration, false).await?;

    let mut task = Task::new(ctx.client.clone(), &mut migration, src_client, dest_client);
    let run_result = task.run().await;
    let phase = task.phase;
    let itinerary = task.itinerary;
    let requeue = task.requeue;
    let errors = std::mem::take(&mut task.errors);
    drop(task);

    if let Err(e) = &run_result {
        error!(name = %name, phase = %phase, error = %e, "Phase handler failed");
    }

    migration.add_errors(&errors);
    let status = migration.status.get_or_insert_with(Default::default);
    status.phase = phase.as_str().to_string();
    status.itinerary = itinerary.name.to_string();

    if phase == Phase::Completed {
        if !status.conditions.has(crate::crd::FAILED) {
            status.conditions.set(
                Condition::new(SUCCEEDED, TRUE, Category::Advisory)
                    .reason(phase.as_str())
                    .message("The volume migration has completed.")
                    .durable(true),
            );
        }
    } else {
        status.conditions.set(
            Condition::new(RUNNING, TRUE, Category::Advisory)
                .reason(phase.as_str())
                .message("The volume migration is running."),
        );
    }
    status.conditions.end_staging();
    status.observed_generation = migration.metadata.generation;

    let patch = serde_json::json!({ "status": &migration.status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    if let Some(state) = &ctx.health_state {
        state
            .metrics
            .record_reconcile("directvolumemigration", started.elapsed().as_secs_f64());
        if let Some(status) = &migration.status {
            state.metrics.set_rsync_client_pods(
                status.running_pods.len() as i64,
                status.successful_pods.len() as i64,
                status.failed_pods.len() as i64,
            );
        }
        state.mark_reconciled();
    }

    run_result?;

    match requeue {
        Some(duration) if duration > Duration::ZERO => Ok(Action::requeue(duration)),
        _ => Ok(Action::await_change()),
    }
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<DirectVolumeMigration>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed"
    );
    if let Some(state) = &ctx.health_state {
        state.metrics.record_error("directvolumemigration");
    }
    if error.is_retryable() {
        Action::requeue(FAST_REQUEUE)
    } else {
        Action::requeue(error.requeue_after())
    }
}

async fn cluster_client(
    ctx: &Context,
    migration: &DirectVolumeMigration,
    source: bool,
) -> Result<crate::compat::CompatClient> {
    let (field, reference) = if source {
        ("srcMigClusterRef", migration.spec.src_mig_cluster_ref.clone())
    } else {
        ("destMigClusterRef", migration.spec.dest_mig_cluster_ref.clone())
    };
    let reference = reference.ok_or_else(|| Error::MissingField(field.into()))?;
    let clusters: Api<MigCluster> = Api::namespaced(ctx.client.clone(), &reference.namespace);
    let cluster = clusters.get(&reference.name).await?;
    Ok(ctx.registry.client_for(&cluster).await?)
}
