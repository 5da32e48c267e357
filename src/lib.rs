//! migration-operator library crate
//!
//! This module exports the controllers, CRD definitions, the
//! version-normalizing client, and resource generators.

pub mod clusters;
pub mod compat;
pub mod controller;
pub mod crd;
pub mod health;
pub mod reference;
pub mod resources;
pub mod settings;

pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt, TryStreamExt};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::Context;
use crd::{DirectImageMigration, DirectVolumeMigration, DirectVolumeMigrationProgress, MigMigration, MigPlan};
use reference::{Owner, Target};

/// Create the default watcher configuration for all controllers.
///
/// This ensures consistent behavior across all controllers:
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Invokes `on_delete` for Deleted events before they are dropped, so
///   process-wide bookkeeping (the reference index) stays in sync
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
    on_delete: impl Fn(&K) + Send + 'static,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .inspect_ok(move |event| {
            if let watcher::Event::Delete(obj) = event {
                on_delete(obj);
            }
        })
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Run all four controllers until the process stops.
///
/// Each controller is serialized per owner resource by its work queue; the
/// controllers themselves run concurrently in this task.
pub async fn run_controllers(client: Client, health_state: Option<Arc<HealthState>>) {
    info!("Starting migration controllers");

    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), health_state));
    let watcher_config = default_watcher_config();

    // MigMigration: also wakes on plan changes, mapped back to owning
    // migrations through the reference index. Deleted migrations drop out
    // of the index so plan events stop resolving to them.
    let migrations: Api<MigMigration> = Api::all(client.clone());
    let plans: Api<MigPlan> = Api::all(client.clone());
    let delete_index = ctx.ref_index.clone();
    let (reader, migration_stream) = create_filtered_stream(
        migrations,
        watcher_config.clone(),
        move |migration: &MigMigration| {
            delete_index.remove_owner(&Owner {
                kind: "MigMigration",
                namespace: migration.namespace().unwrap_or_default(),
                name: migration.name_any(),
            });
        },
    );
    let ref_index = ctx.ref_index.clone();
    let migration_controller = Controller::for_stream(migration_stream, reader)
        .watches(plans, watcher_config.clone(), move |plan: MigPlan| {
            let target = Target {
                kind: "MigPlan",
                namespace: plan.namespace().unwrap_or_default(),
                name: plan.name_any(),
            };
            ref_index
                .owners_of(&target)
                .into_iter()
                .map(|owner: Owner| {
                    kube::runtime::reflector::ObjectRef::new(&owner.name)
                        .within(&owner.namespace)
                })
                .collect::<Vec<_>>()
        })
        .run(
            controller::migration::reconcile,
            controller::migration::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result);

    // DirectVolumeMigration
    let dvms: Api<DirectVolumeMigration> = Api::all(client.clone());
    let dvm_controller = Controller::new(dvms, watcher_config.clone())
        .run(
            controller::dvm::reconcile,
            controller::dvm::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result);

    // DirectVolumeMigrationProgress
    let progresses: Api<DirectVolumeMigrationProgress> = Api::all(client.clone());
    let progress_controller = Controller::new(progresses, watcher_config.clone())
        .run(
            controller::dvm_progress::reconcile,
            controller::dvm_progress::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result);

    // DirectImageMigration
    let dims: Api<DirectImageMigration> = Api::all(client.clone());
    let dim_controller = Controller::new(dims, watcher_config)
        .run(
            controller::dim::reconcile,
            controller::dim::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result);

    futures::join!(
        migration_controller,
        dvm_controller,
        progress_controller,
        dim_controller,
    );

    // This should never complete in normal operation
    error!("Controller streams ended unexpectedly");
}

async fn log_reconcile_result<K>(
    result: Result<
        (kube::runtime::reflector::ObjectRef<K>, kube::runtime::controller::Action),
        kube::runtime::controller::Error<controller::error::Error, watcher::Error>,
    >,
) where
    K: kube::Resource,
    K::DynamicType: std::fmt::Debug + std::hash::Hash + Eq + Clone,
{
    match result {
        Ok((obj, _action)) => {
            debug!("Reconciled: {}", obj.name);
        }
        Err(e) => {
            // NotFound errors are expected after deletion when related
            // watch events trigger reconciliation for a deleted object.
            let is_not_found = match &e {
                kube::runtime::controller::Error::ObjectNotFound(_) => true,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) => err.is_not_found(),
                _ => false,
            };
            if is_not_found {
                debug!("Object no longer exists (likely deleted): {:?}", e);
            } else {
                error!("Reconciliation error: {:?}", e);
            }
        }
    }
}
