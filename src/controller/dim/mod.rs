//! DirectImageMigration controller.
//!
//! Mirrors container image streams between the internal registries of the
//! two clusters, tag by tag, without staging through object storage. The
//! itinerary is linear and small; per-stream failures are aggregated and
//! fail the migration as a whole once every stream has settled.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::compat::CompatClient;
use crate::crd::condition::{Category, Condition, TRUE};
use crate::crd::direct_image::ImageStreamResult;
use crate::crd::route::{ImageStream, ImageStreamTag, TagReference};
use crate::crd::{DirectImageMigration, FAILED, MigCluster, RUNNING, SUCCEEDED};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};

// Requeue. Local to this controller.
pub const FAST_REQUEUE: Duration = Duration::from_millis(100);
pub const POLL_REQUEUE: Duration = Duration::from_secs(3);

const FAILED_MESSAGE: &str = "The image migration has failed. See: Errors.";

/// Phases of the image mirror itinerary.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Phase {
    #[default]
    Created,
    Started,
    Prepare,
    CreateDestinationNamespaces,
    ListImageStreams,
    CreateImageStreamMigrations,
    WaitingForImageStreamMigrationsToComplete,
    MigrationFailed,
    Completed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Created => "",
            Phase::Started => "Started",
            Phase::Prepare => "Prepare",
            Phase::CreateDestinationNamespaces => "CreateDestinationNamespaces",
            Phase::ListImageStreams => "ListImageStreams",
            Phase::CreateImageStreamMigrations => "CreateImageStreamMigrations",
            Phase::WaitingForImageStreamMigrationsToComplete => {
                "WaitingForImageStreamMigrationsToComplete"
            }
            Phase::MigrationFailed => "MigrationFailed",
            Phase::Completed => "Completed",
        }
    }

    pub fn parse(name: &str) -> Option<Phase> {
        [
            Phase::Created,
            Phase::Started,
            Phase::Prepare,
            Phase::CreateDestinationNamespaces,
            Phase::ListImageStreams,
            Phase::CreateImageStreamMigrations,
            Phase::WaitingForImageStreamMigrationsToComplete,
            Phase::MigrationFailed,
            Phase::Completed,
        ]
        .into_iter()
        .find(|p| p.as_str() == name)
    }

    fn next(self, failed: bool) -> Phase {
        if failed {
            return match self {
                Phase::MigrationFailed => Phase::Completed,
                _ => Phase::MigrationFailed,
            };
        }
        match self {
            Phase::Created => Phase::Started,
            Phase::Started => Phase::Prepare,
            Phase::Prepare => Phase::CreateDestinationNamespaces,
            Phase::CreateDestinationNamespaces => Phase::ListImageStreams,
            Phase::ListImageStreams => Phase::CreateImageStreamMigrations,
            Phase::CreateImageStreamMigrations => {
                Phase::WaitingForImageStreamMigrationsToComplete
            }
            Phase::WaitingForImageStreamMigrationsToComplete => Phase::Completed,
            Phase::MigrationFailed => Phase::Completed,
            Phase::Completed => Phase::Completed,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reconcile a DirectImageMigration: one phase per event.
pub async fn reconcile(obj: Arc<DirectImageMigration>, ctx: Arc<Context>) -> Result<Action> {
    let started = std::time::Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling DirectImageMigration");

    let api: Api<DirectImageMigration> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut migration = (*obj).clone();

    if migration
        .status
        .as_ref()
        .map(|s| s.phase == Phase::Completed.as_str())
        .unwrap_or(false)
    {
        return Ok(Action::await_change());
    }

    let src_client = cluster_client(&ctx, migration.spec.src_mig_cluster_ref.clone()).await?;
    let dest_client = cluster_client(&ctx, migration.spec.dest_mig_cluster_ref.clone()).await?;

    let failed = migration.has_errors()
        || migration
            .status
            .as_ref()
            .is_some_and(|s| s.conditions.has(FAILED));
    let mut phase = migration
        .status
        .as_ref()
        .and_then(|s| Phase::parse(&s.phase))
        .unwrap_or_default();
    let mut requeue = Some(FAST_REQUEUE);

    info!(phase = %phase, "[RUN]");
    match phase {
        Phase::Created | Phase::Started | Phase::Prepare => phase = phase.next(failed),
        Phase::CreateDestinationNamespaces => {
            ensure_destination_namespaces(&migration, &src_client, &dest_client).await?;
            phase = phase.next(failed);
        }
        Phase::ListImageStreams => {
            let streams = list_image_streams(&migration, &src_client).await?;
            let status = migration.status.get_or_insert_with(Default::default);
            status.image_streams = streams
                .iter()
                .map(|s| ImageStreamResult {
                    namespace: s.namespace().unwrap_or_default(),
                    name: s.name_any(),
                    succeeded: false,
                    errors: Vec::new(),
                })
                .collect();
            phase = phase.next(failed);
        }
        Phase::CreateImageStreamMigrations => {
            mirror_image_streams(&migration, &src_client, &dest_client).await?;
            phase = phase.next(failed);
        }
        Phase::WaitingForImageStreamMigrationsToComplete => {
            let (completed, reasons) = check_completion(&mut migration, &dest_client).await?;
            if completed {
                if reasons.is_empty() {
                    phase = phase.next(failed);
                } else {
                    migration.add_errors(&reasons);
                    migration
                        .status
                        .get_or_insert_with(Default::default)
                        .conditions
                        .set(
                            Condition::new(FAILED, TRUE, Category::Critical)
                                .reason(phase.as_str())
                                .message(FAILED_MESSAGE)
                                .durable(true),
                        );
                    phase = Phase::MigrationFailed;
                }
            } else {
                requeue = Some(POLL_REQUEUE);
            }
        }
        Phase::MigrationFailed => phase = Phase::Completed,
        Phase::Completed => {}
    }

    let status = migration.status.get_or_insert_with(Default::default);
    status.conditions.begin_staging();
    status.phase = phase.as_str().to_string();
    if phase == Phase::Completed {
        requeue = None;
        if !status.conditions.has(FAILED) {
            status.conditions.set(
                Condition::new(SUCCEEDED, TRUE, Category::Advisory)
                    .reason(phase.as_str())
                    .message("The image migration has completed.")
                    .durable(true),
            );
        }
        info!("[COMPLETED]");
    } else {
        status.conditions.set(
            Condition::new(RUNNING, TRUE, Category::Advisory)
                .reason(phase.as_str())
                .message("The image migration is running."),
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
            .record_reconcile("directimagemigration", started.elapsed().as_secs_f64());
        state.mark_reconciled();
    }

    match requeue {
        Some(duration) => Ok(Action::requeue(duration)),
        None => Ok(Action::await_change()),
    }
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<DirectImageMigration>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(name = %obj.name_any(), error = %error, "Reconciliation failed");
    if let Some(state) = &ctx.health_state {
        state.metrics.record_error("directimagemigration");
    }
    if error.is_retryable() {
        Action::requeue(FAST_REQUEUE)
    } else {
        Action::requeue(error.requeue_after())
    }
}

fn source_namespaces(migration: &DirectImageMigration) -> Vec<String> {
    migration
        .spec
        .namespaces
        .iter()
        .map(|ns| ns.split(':').next().unwrap_or(ns).to_string())
        .collect()
}

fn destination_namespace(entry: &str) -> String {
    match entry.split_once(':') {
        Some((_, dest)) if !dest.is_empty() => dest.to_string(),
        _ => entry.split(':').next().unwrap_or(entry).to_string(),
    }
}

async fn cluster_client(
    ctx: &Context,
    reference: Option<crate::crd::ObjectRef>,
) -> Result<CompatClient> {
    let reference = reference.ok_or_else(|| Error::MissingField("migClusterRef".into()))?;
    let clusters: Api<MigCluster> = Api::namespaced(ctx.client.clone(), &reference.namespace);
    let cluster = clusters.get(&reference.name).await?;
    Ok(ctx.registry.client_for(&cluster).await?)
}

async fn ensure_destination_namespaces(
    migration: &DirectImageMigration,
    src_client: &CompatClient,
    dest_client: &CompatClient,
) -> Result<()> {
    for entry in &migration.spec.namespaces {
        let source_name = entry.split(':').next().unwrap_or(entry);
        let source = src_client.get_cluster::<Namespace>(source_name).await?;
        let mut destination = Namespace::default();
        destination.metadata.name = Some(destination_namespace(entry));
        destination.metadata.annotations = source.metadata.annotations.clone();
        match dest_client.create_cluster(&destination).await {
            Ok(_) => info!(namespace = %destination_namespace(entry), "Destination namespace created"),
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn list_image_streams(
    migration: &DirectImageMigration,
    src_client: &CompatClient,
) -> Result<Vec<ImageStream>> {
    let mut streams = Vec::new();
    for namespace in source_namespaces(migration) {
        streams.extend(
            src_client
                .list::<ImageStream>(&namespace, &ListParams::default())
                .await?,
        );
    }
    Ok(streams)
}

/// Recreate each source image stream on the destination with tags that
/// reference the source registry's externally reachable repository, so the
/// destination registry imports every tag.
async fn mirror_image_streams(
    migration: &DirectImageMigration,
    src_client: &CompatClient,
    dest_client: &CompatClient,
) -> Result<()> {
    for entry in &migration.spec.namespaces {
        let source_ns = entry.split(':').next().unwrap_or(entry).to_string();
        let dest_ns = destination_namespace(entry);
        let streams = src_client
            .list::<ImageStream>(&source_ns, &ListParams::default())
            .await?;
        for stream in streams {
            let repository = stream
                .status
                .as_ref()
                .map(|s| {
                    if s.public_docker_image_repository.is_empty() {
                        s.docker_image_repository.clone()
                    } else {
                        s.public_docker_image_repository.clone()
                    }
                })
                .unwrap_or_default();
            if repository.is_empty() {
                continue;
            }
            let tags = stream
                .status
                .as_ref()
                .map(|s| {
                    s.tags
                        .iter()
                        .map(|t| ImageStreamTag {
                            name: t.tag.clone(),
                            from: Some(TagReference {
                                kind: "DockerImage".to_string(),
                                name: format!("{repository}:{}", t.tag),
                            }),
                        })
                        .collect()
                })
                .unwrap_or_default();

            let mut mirrored = ImageStream::new(
                &stream.name_any(),
                crate::crd::route::ImageStreamSpec { tags },
            );
            mirrored.metadata.namespace = Some(dest_ns.clone());
            mirrored.metadata.labels = Some(migration.correlation_labels());
            match dest_client.create(&dest_ns, &mirrored).await {
                Ok(_) => {
                    info!(namespace = %dest_ns, name = %stream.name_any(), "Image stream mirrored");
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

/// Check the destination for each mirrored stream; a stream completes
/// when every tag has an imported image, and fails when the destination
/// reports no repository for it.
async fn check_completion(
    migration: &mut DirectImageMigration,
    dest_client: &CompatClient,
) -> Result<(bool, Vec<String>)> {
    let mut reasons = Vec::new();
    let mut all_settled = true;

    let mut results = migration
        .status
        .as_ref()
        .map(|s| s.image_streams.clone())
        .unwrap_or_default();

    for result in &mut results {
        if result.succeeded {
            continue;
        }
        let found = dest_client
            .get_opt::<ImageStream>(&result.namespace, &result.name)
            .await?;
        match found {
            Some(stream) => {
                let spec_tags = stream.spec.tags.len();
                let imported_tags = stream
                    .status
                    .as_ref()
                    .map(|s| s.tags.iter().filter(|t| !t.items.is_empty()).count())
                    .unwrap_or(0);
                if spec_tags == 0 || imported_tags >= spec_tags {
                    result.succeeded = true;
                } else {
                    all_settled = false;
                }
            }
            None => {
                result.errors = vec!["image stream missing on destination".to_string()];
                reasons.push(format!(
                    "ImageStream: {}/{} failed to migrate.",
                    result.namespace, result.name
                ));
            }
        }
    }

    migration
        .status
        .get_or_insert_with(Default::default)
        .image_streams = results;

    Ok((all_settled, reasons))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_sequence() {
        let mut phase = Phase::Created;
        let mut seen = vec![phase];
        while phase != Phase::Completed {
            phase = phase.next(false);
            seen.push(phase);
        }
        assert_eq!(seen.last(), Some(&Phase::Completed));
        assert!(seen.contains(&Phase::ListImageStreams));
        assert!(!seen.contains(&Phase::MigrationFailed));
    }

    #[test]
    fn test_failed_collapses_to_completed() {
        assert_eq!(Phase::ListImageStreams.next(true), Phase::MigrationFailed);
        assert_eq!(Phase::MigrationFailed.next(true), Phase::Completed);
    }

    #[test]
    fn test_destination_namespace_mapping() {
        assert_eq!(destination_namespace("app"), "app");
        assert_eq!(destination_namespace("app:renamed"), "renamed");
    }
}
