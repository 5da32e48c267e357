//! MigMigration controller: validation, plan resolution, and the task
//! engine driving one migration attempt per plan execution.
//!
//! The reconciler validates the plan reference, resolves both clusters to
//! usable clients, runs exactly one engine tick, and writes the updated
//! phase, progress, and conditions back to status. All forward progress is
//! persisted through status; the engine itself holds no state between
//! ticks.

pub mod annotations;
pub mod backup;
pub mod hooks;
pub mod quiesce;
pub mod restore;
pub mod stage;
pub mod task;

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::crd::condition::{Category, Condition, TRUE};
use crate::crd::{
    FAILED, MigCluster, MigMigration, MigPlan, MigStorage, RUNNING, SUCCEEDED,
};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};

use task::{PlanResources, Phase, Task, FAST_REQUEUE, POLL_REQUEUE};

/// Validation condition types.
pub const INVALID_PLAN_REF: &str = "InvalidPlanRef";
pub const PLAN_NOT_READY: &str = "PlanNotReady";

/// Validation reasons.
pub const NOT_SET: &str = "NotSet";
pub const NOT_FOUND: &str = "NotFound";

/// Validation messages.
const INVALID_PLAN_REF_MESSAGE: &str = "The `migPlanRef` must reference a valid `migplan`.";
const PLAN_NOT_READY_MESSAGE: &str =
    "The referenced `migPlanRef` does not have a `Ready` condition.";

/// Reconcile a MigMigration: one engine tick per event.
pub async fn reconcile(obj: Arc<MigMigration>, ctx: Arc<Context>) -> Result<Action> {
    let started = std::time::Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling MigMigration");

    let api: Api<MigMigration> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut migration = (*obj).clone();

    // Keep the reverse index current so plan events wake this migration.
    if let Some(plan_ref) = &migration.spec.mig_plan_ref {
        ctx.ref_index.set_owner(
            crate::reference::Owner {
                kind: "MigMigration",
                namespace: namespace.clone(),
                name: name.clone(),
            },
            vec![crate::reference::Target {
                kind: "MigPlan",
                namespace: plan_ref.namespace.clone(),
                name: plan_ref.name.clone(),
            }],
        );
    }

    // Terminal migrations are left alone.
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

    // Validation: a critical condition parks the migration until the spec
    // or the plan changes.
    let plan = match validate(&ctx, &mut migration).await? {
        Some(plan) => plan,
        None => {
            ctx.publish_warning_event(
                &*obj,
                "ValidationFailed",
                "Validating",
                Some("The migration cannot start; see status conditions.".to_string()),
            )
            .await;
            let status = migration.status.get_or_insert_with(Default::default);
            status.conditions.end_staging();
            write_status(&api, &migration).await?;
            return Ok(Action::requeue(POLL_REQUEUE));
        }
    };

    // Resolve plan resources; failures here are transient (cluster
    // unreachable) and retried with backoff.
    let plan_resources = resolve_plan_resources(&ctx, plan).await?;

    if migration
        .status
        .as_ref()
        .and_then(|s| s.start_timestamp.clone())
        .is_none()
    {
        migration
            .status
            .get_or_insert_with(Default::default)
            .start_timestamp = Some(jiff::Timestamp::now().to_string());
    }

    // Run one engine tick.
    let previous_phase = migration
        .status
        .as_ref()
        .map(|s| s.phase.clone())
        .unwrap_or_default();
    let mut task = Task::new(ctx.client.clone(), &mut migration, plan_resources);
    let run_result = task.run().await;

    let phase = task.phase;
    let itinerary = task.itinerary;
    let requeue = task.requeue;
    let progress = std::mem::take(&mut task.progress);
    let errors = std::mem::take(&mut task.errors);
    drop(task);

    if let Err(e) = &run_result {
        error!(name = %name, phase = %phase, error = %e, "Phase handler failed");
    }

    // Persist engine outcome.
    let (step, total) = itinerary.progress_report(phase);
    migration.add_errors(&errors);
    let status = migration.status.get_or_insert_with(Default::default);
    status.phase = phase.as_str().to_string();
    status.itinerary = itinerary.name.to_string();
    status.progress = progress;

    if phase == Phase::Completed {
        status.completion_timestamp = Some(jiff::Timestamp::now().to_string());
        let failed = status.conditions.has(FAILED);
        let canceled = status.conditions.has(crate::crd::CANCELED);
        if !failed && !canceled {
            status.conditions.set(
                Condition::new(SUCCEEDED, TRUE, Category::Advisory)
                    .reason(phase.as_str())
                    .message(task::SUCCEEDED_MESSAGE)
                    .durable(true),
            );
        }
    } else {
        status.conditions.set(
            Condition::new(RUNNING, TRUE, Category::Advisory)
                .reason(phase.as_str())
                .message(format!("Step: {step}/{total}")),
        );
    }
    status.conditions.end_staging();
    status.observed_generation = migration.metadata.generation;

    let completed = phase == Phase::Completed;
    let failed = migration
        .status
        .as_ref()
        .is_some_and(|s| s.conditions.has(FAILED));
    let canceled = migration
        .status
        .as_ref()
        .is_some_and(|s| s.conditions.has(crate::crd::CANCELED));

    write_status(&api, &migration).await?;

    if completed {
        if failed {
            ctx.publish_warning_event(
                &*obj,
                "MigrationFailed",
                "Migrating",
                Some(task::FAILED_MESSAGE.to_string()),
            )
            .await;
        } else if canceled {
            ctx.publish_normal_event(
                &*obj,
                "MigrationCanceled",
                "Migrating",
                Some(task::CANCELED_MESSAGE.to_string()),
            )
            .await;
        } else {
            ctx.publish_normal_event(
                &*obj,
                "MigrationSucceeded",
                "Migrating",
                Some(task::SUCCEEDED_MESSAGE.to_string()),
            )
            .await;
        }
    }

    if let Some(state) = &ctx.health_state {
        state
            .metrics
            .record_reconcile("migmigration", started.elapsed().as_secs_f64());
        if phase.as_str() != previous_phase {
            state
                .metrics
                .record_phase_transition(itinerary.name, phase.as_str());
        }
        if completed {
            let outcome = if canceled {
                "canceled"
            } else if failed {
                "failed"
            } else {
                "succeeded"
            };
            state.metrics.record_completion(outcome);
        }
        // The StagePodsCreated condition carries the pod count as its item.
        let stage_pods = migration
            .status
            .as_ref()
            .and_then(|s| s.conditions.find(task::STAGE_PODS_CREATED))
            .and_then(|c| c.items.first())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        state.metrics.set_stage_pods(stage_pods);
        state.mark_reconciled();
    }

    run_result?;

    match requeue {
        Some(duration) if duration > Duration::ZERO => Ok(Action::requeue(duration)),
        _ => Ok(Action::await_change()),
    }
}

/// Error policy for the controller: requeue with the error's suggested
/// backoff.
pub fn error_policy(obj: Arc<MigMigration>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        name = %obj.name_any(),
        error = %error,
        "Reconciliation failed"
    );
    if let Some(state) = &ctx.health_state {
        state.metrics.record_error("migmigration");
    }
    if error.is_retryable() {
        Action::requeue(FAST_REQUEUE)
    } else {
        Action::requeue(error.requeue_after())
    }
}

/// Validate the plan reference. Returns the plan when valid, or `None`
/// after setting a critical condition.
async fn validate(ctx: &Context, migration: &mut MigMigration) -> Result<Option<MigPlan>> {
    let Some(plan_ref) = migration.spec.mig_plan_ref.clone() else {
        set_critical(
            migration,
            INVALID_PLAN_REF,
            NOT_SET,
            INVALID_PLAN_REF_MESSAGE,
        );
        return Ok(None);
    };
    if !plan_ref.is_set() {
        set_critical(
            migration,
            INVALID_PLAN_REF,
            NOT_SET,
            INVALID_PLAN_REF_MESSAGE,
        );
        return Ok(None);
    }

    let plans: Api<MigPlan> = Api::namespaced(ctx.client.clone(), &plan_ref.namespace);
    let plan = match plans.get_opt(&plan_ref.name).await? {
        Some(plan) => plan,
        None => {
            set_critical(
                migration,
                INVALID_PLAN_REF,
                NOT_FOUND,
                INVALID_PLAN_REF_MESSAGE,
            );
            return Ok(None);
        }
    };

    if !plan.is_ready() {
        set_critical(migration, PLAN_NOT_READY, "", PLAN_NOT_READY_MESSAGE);
        return Ok(None);
    }

    Ok(Some(plan))
}

fn set_critical(migration: &mut MigMigration, r#type: &str, reason: &str, message: &str) {
    migration
        .status
        .get_or_insert_with(Default::default)
        .conditions
        .set(
            Condition::new(r#type, TRUE, Category::Critical)
                .reason(reason)
                .message(message),
        );
}

/// Resolve the plan's clusters and storage into usable clients for this
/// tick.
pub async fn resolve_plan_resources(ctx: &Context, plan: MigPlan) -> Result<PlanResources> {
    let src_ref = plan
        .spec
        .src_mig_cluster_ref
        .clone()
        .ok_or_else(|| Error::MissingField("srcMigClusterRef".into()))?;
    let dest_ref = plan
        .spec
        .dest_mig_cluster_ref
        .clone()
        .ok_or_else(|| Error::MissingField("destMigClusterRef".into()))?;
    let storage_ref = plan
        .spec
        .mig_storage_ref
        .clone()
        .ok_or_else(|| Error::MissingField("migStorageRef".into()))?;

    let clusters: Api<MigCluster> = Api::namespaced(ctx.client.clone(), &src_ref.namespace);
    let src_cluster = clusters.get(&src_ref.name).await?;
    let clusters: Api<MigCluster> = Api::namespaced(ctx.client.clone(), &dest_ref.namespace);
    let dest_cluster = clusters.get(&dest_ref.name).await?;
    let storages: Api<MigStorage> = Api::namespaced(ctx.client.clone(), &storage_ref.namespace);
    let storage = storages.get(&storage_ref.name).await?;

    let src_client = ctx.registry.client_for(&src_cluster).await?;
    let dest_client = ctx.registry.client_for(&dest_cluster).await?;

    info!(
        src = %src_cluster.name_any(),
        dest = %dest_cluster.name_any(),
        "Plan resources resolved"
    );

    Ok(PlanResources {
        plan,
        src_cluster,
        dest_cluster,
        storage,
        src_client,
        dest_client,
    })
}

async fn write_status(api: &Api<MigMigration>, migration: &MigMigration) -> Result<()> {
    let name = migration.name_any();
    let patch = serde_json::json!({ "status": &migration.status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
