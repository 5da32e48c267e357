//! The direct volume transfer task engine.
//!
//! Copies PVC data from source to destination with rsync over a TLS
//! tunnel, without staging through object storage. One transfer pod per
//! destination namespace serves every migrated claim in it; one client pod
//! per claim keeps failures isolated. The itinerary is linear; failure
//! splices in a one-step teardown itinerary.

use std::time::Duration;

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, PropagationPolicy};
use kube::ResourceExt;
use tracing::info;

use crate::compat::CompatClient;
use crate::crd::condition::{Category, Condition, TRUE};
use crate::crd::direct_volume::PodProgress;
use crate::crd::route::Route;
use crate::crd::{
    DirectVolumeMigration, DirectVolumeMigrationProgress, DirectVolumeMigrationProgressSpec,
    FAILED, MIGRATION_NAMESPACE, ObjectRef,
};
use crate::controller::error::{Error, Result};
use crate::resources::common::owner_reference;
use crate::resources::rsync;
use crate::settings::Settings;

// Requeue. Local to this controller.
pub const FAST_REQUEUE: Duration = Duration::from_millis(100);
pub const POLL_REQUEUE: Duration = Duration::from_secs(3);

pub const FAILED_MESSAGE: &str = "The volume migration has failed. See: Errors.";

/// Phases of the transfer itinerary.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Phase {
    /// Initial phase; serialized as the empty string.
    #[default]
    Created,
    Started,
    Prepare,
    CreateDestinationNamespaces,
    CreateRsyncConfig,
    CreateRsyncRoute,
    CreateRsyncTransferPods,
    WaitForRsyncTransferPodsRunning,
    CreatePVProgressCRs,
    CreateRsyncClientPods,
    WaitForRsyncClientPodsCompleted,
    DeleteRsyncResources,
    WaitForRsyncResourcesTerminated,
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
            Phase::CreateRsyncConfig => "CreateRsyncConfig",
            Phase::CreateRsyncRoute => "CreateRsyncRoute",
            Phase::CreateRsyncTransferPods => "CreateRsyncTransferPods",
            Phase::WaitForRsyncTransferPodsRunning => "WaitForRsyncTransferPodsRunning",
            Phase::CreatePVProgressCRs => "CreatePVProgressCRs",
            Phase::CreateRsyncClientPods => "CreateRsyncClientPods",
            Phase::WaitForRsyncClientPodsCompleted => "WaitForRsyncClientPodsCompleted",
            Phase::DeleteRsyncResources => "DeleteRsyncResources",
            Phase::WaitForRsyncResourcesTerminated => "WaitForRsyncResourcesTerminated",
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
            Phase::CreateRsyncConfig,
            Phase::CreateRsyncRoute,
            Phase::CreateRsyncTransferPods,
            Phase::WaitForRsyncTransferPodsRunning,
            Phase::CreatePVProgressCRs,
            Phase::CreateRsyncClientPods,
            Phase::WaitForRsyncClientPodsCompleted,
            Phase::DeleteRsyncResources,
            Phase::WaitForRsyncResourcesTerminated,
            Phase::MigrationFailed,
            Phase::Completed,
        ]
        .into_iter()
        .find(|p| p.as_str() == name)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named, ordered phase list.
#[derive(Debug)]
pub struct Itinerary {
    pub name: &'static str,
    pub phases: &'static [Phase],
}

impl Itinerary {
    pub fn first_phase(&self) -> Phase {
        self.phases.first().copied().unwrap_or(Phase::Completed)
    }

    fn position(&self, phase: Phase) -> Option<usize> {
        self.phases.iter().position(|p| *p == phase)
    }
}

/// The transfer itinerary.
pub static VOLUME_ITINERARY: Itinerary = Itinerary {
    name: "VolumeMigration",
    phases: &[
        Phase::Created,
        Phase::Started,
        Phase::Prepare,
        Phase::CreateDestinationNamespaces,
        Phase::CreateRsyncConfig,
        Phase::CreateRsyncRoute,
        Phase::CreateRsyncTransferPods,
        Phase::WaitForRsyncTransferPodsRunning,
        Phase::CreatePVProgressCRs,
        Phase::CreateRsyncClientPods,
        Phase::WaitForRsyncClientPodsCompleted,
        Phase::DeleteRsyncResources,
        Phase::WaitForRsyncResourcesTerminated,
        Phase::Completed,
    ],
};

/// Teardown after failure.
pub static FAILED_ITINERARY: Itinerary = Itinerary {
    name: "Failed",
    phases: &[
        Phase::MigrationFailed,
        Phase::DeleteRsyncResources,
        Phase::WaitForRsyncResourcesTerminated,
        Phase::Completed,
    ],
};

/// One transfer attempt in flight.
pub struct Task<'a> {
    pub client: kube::Client,
    pub owner: &'a mut DirectVolumeMigration,
    pub src_client: CompatClient,
    pub dest_client: CompatClient,
    pub phase: Phase,
    pub requeue: Option<Duration>,
    pub itinerary: &'static Itinerary,
    pub errors: Vec<String>,
}

impl<'a> Task<'a> {
    pub fn new(
        client: kube::Client,
        owner: &'a mut DirectVolumeMigration,
        src_client: CompatClient,
        dest_client: CompatClient,
    ) -> Self {
        let phase = owner
            .status
            .as_ref()
            .and_then(|s| Phase::parse(&s.phase))
            .unwrap_or_default();
        Self {
            client,
            owner,
            src_client,
            dest_client,
            phase,
            requeue: Some(FAST_REQUEUE),
            itinerary: &VOLUME_ITINERARY,
            errors: Vec::new(),
        }
    }

    /// Run one tick of the transfer itinerary.
    pub async fn run(&mut self) -> Result<()> {
        self.init();
        info!(itinerary = self.itinerary.name, phase = %self.phase, "[RUN]");

        match self.phase {
            Phase::Created | Phase::Started | Phase::Prepare => self.next(),
            Phase::CreateDestinationNamespaces => {
                self.ensure_destination_namespaces().await?;
                self.next();
            }
            Phase::CreateRsyncConfig => {
                self.create_rsync_config().await?;
                self.next();
            }
            Phase::CreateRsyncRoute => {
                self.create_rsync_route().await?;
                self.next();
            }
            Phase::CreateRsyncTransferPods => {
                self.create_rsync_transfer_pods().await?;
                self.next();
            }
            Phase::WaitForRsyncTransferPodsRunning => {
                if self.transfer_pods_running().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::CreatePVProgressCRs => {
                self.create_pv_progress_crs().await?;
                self.next();
            }
            Phase::CreateRsyncClientPods => {
                self.create_rsync_client_pods().await?;
                self.next();
            }
            Phase::WaitForRsyncClientPodsCompleted => {
                let (completed, any_failed) = self.client_pods_completed().await?;
                if completed {
                    if any_failed {
                        self.fail(
                            Phase::MigrationFailed,
                            vec!["One or more rsync client pods failed.".to_string()],
                        );
                    } else {
                        self.next();
                    }
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::DeleteRsyncResources => {
                self.delete_rsync_resources().await?;
                self.next();
            }
            Phase::WaitForRsyncResourcesTerminated => {
                if self.rsync_resources_deleted().await? {
                    self.next();
                } else {
                    self.requeue = Some(POLL_REQUEUE);
                }
            }
            Phase::MigrationFailed => self.next(),
            Phase::Completed => {}
        }

        if self.phase == Phase::Completed {
            self.requeue = None;
            info!("[COMPLETED]");
        }

        Ok(())
    }

    fn init(&mut self) {
        self.requeue = Some(FAST_REQUEUE);
        let failed = self.owner.has_errors()
            || self
                .owner
                .status
                .as_ref()
                .is_some_and(|s| s.conditions.has(FAILED));
        self.itinerary = if failed {
            &FAILED_ITINERARY
        } else {
            &VOLUME_ITINERARY
        };
        let recorded = self
            .owner
            .status
            .as_ref()
            .map(|s| s.itinerary.clone())
            .unwrap_or_default();
        if recorded != self.itinerary.name {
            self.phase = self.itinerary.first_phase();
        }
    }

    pub fn next(&mut self) {
        match self.itinerary.position(self.phase) {
            Some(current) => {
                self.phase = self
                    .itinerary
                    .phases
                    .get(current + 1)
                    .copied()
                    .unwrap_or(Phase::Completed);
            }
            None => self.phase = Phase::Completed,
        }
    }

    pub fn fail(&mut self, next_phase: Phase, reasons: Vec<String>) {
        let failed_at = self.phase;
        self.errors.extend(reasons);
        let errors = self.errors.clone();
        self.owner.add_errors(&errors);
        self.owner
            .status
            .get_or_insert_with(Default::default)
            .conditions
            .set(
                Condition::new(FAILED, TRUE, Category::Critical)
                    .reason(failed_at.as_str())
                    .message(FAILED_MESSAGE)
                    .durable(true),
            );
        self.phase = next_phase;
    }

    /// Create each destination namespace, carrying the source namespace's
    /// annotations (security context bits included).
    async fn ensure_destination_namespaces(&mut self) -> Result<()> {
        for namespace in self.owner.pvc_namespace_map().keys() {
            let source = self.src_client.get_cluster::<Namespace>(namespace).await?;
            let mut destination = Namespace::default();
            destination.metadata.name = Some(namespace.clone());
            destination.metadata.annotations = source.metadata.annotations.clone();
            match self.dest_client.create_cluster(&destination).await {
                Ok(_) => info!(namespace = %namespace, "Destination namespace created"),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Materialize rsync configuration and credentials in every migrated
    /// namespace on both sides, generating the password and tunnel
    /// certificates once per migration.
    async fn create_rsync_config(&mut self) -> Result<()> {
        let password = self.ensure_rsync_password().await?;
        let certs = self.ensure_transfer_certs().await?;

        for (namespace, pvcs) in self.owner.pvc_namespace_map() {
            for config_map in [
                rsync::rsyncd_config_map(&namespace, &pvcs),
                rsync::stunnel_config_map(&namespace),
            ] {
                match self.dest_client.create(&namespace, &config_map).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {
                        info!(namespace = %namespace, "Configmap already exists on destination");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            for (client, secret) in [
                (&self.src_client, rsync::source_creds_secret(&namespace, &password)),
                (&self.dest_client, rsync::dest_creds_secret(&namespace, &password)),
                (&self.dest_client, rsync::stunnel_certs_secret(&namespace, &certs)),
            ] {
                match client.create(&namespace, &secret).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {
                        info!(namespace = %namespace, "Secret already exists");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Get or create the per-migration rsync password on the host cluster.
    async fn ensure_rsync_password(&self) -> Result<String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), MIGRATION_NAMESPACE);
        match secrets.get_opt(rsync::RSYNC_PASSWORD_SECRET_NAME).await? {
            Some(secret) => {
                let password = secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get("password"))
                    .map(|b| String::from_utf8_lossy(&b.0).to_string())
                    .ok_or_else(|| Error::MissingField("password".into()))?;
                Ok(password)
            }
            None => {
                let password = rsync::generate_password();
                let secret = rsync::password_secret(MIGRATION_NAMESPACE, &password);
                match secrets.create(&Default::default(), &secret).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        info!("Password secret already exists on host");
                    }
                    Err(e) => return Err(e.into()),
                }
                Ok(password)
            }
        }
    }

    /// Get or generate the tunnel certificate material, cached in the
    /// first destination namespace's certs secret.
    async fn ensure_transfer_certs(&self) -> Result<rsync::TransferCerts> {
        for namespace in self.owner.pvc_namespace_map().keys() {
            if let Some(secret) = self
                .dest_client
                .get_opt::<Secret>(namespace, rsync::STUNNEL_CERTS_NAME)
                .await?
                && let Some(data) = secret.data
                && let (Some(cert), Some(key)) = (data.get("tls.crt"), data.get("tls.key"))
            {
                return Ok(rsync::TransferCerts {
                    cert_pem: String::from_utf8_lossy(&cert.0).to_string(),
                    key_pem: String::from_utf8_lossy(&key.0).to_string(),
                });
            }
        }
        let hosts = self
            .owner
            .status
            .as_ref()
            .map(|s| s.rsync_routes.values().cloned().collect())
            .unwrap_or_default();
        Ok(rsync::generate_transfer_certs(hosts)?)
    }

    /// Service plus TLS-passthrough route per destination namespace; the
    /// admitted route host is recorded in status.
    async fn create_rsync_route(&mut self) -> Result<()> {
        for namespace in self.owner.pvc_namespace_map().keys() {
            match self
                .dest_client
                .create(namespace, &rsync::transfer_service(namespace))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    info!(namespace = %namespace, "Transfer service already exists");
                }
                Err(e) => return Err(e.into()),
            }
            match self
                .dest_client
                .create(namespace, &rsync::transfer_route(namespace))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => {
                    info!(namespace = %namespace, "Transfer route already exists");
                }
                Err(e) => return Err(e.into()),
            }

            let route = self
                .dest_client
                .get::<Route>(namespace, rsync::TRANSFER_ROUTE_NAME)
                .await?;
            if let Some(host) = route.spec.host.clone() {
                self.owner
                    .status
                    .get_or_insert_with(Default::default)
                    .rsync_routes
                    .insert(namespace.clone(), host);
            }
        }
        Ok(())
    }

    /// One transfer pod per destination namespace mounting every migrated
    /// claim in it.
    async fn create_rsync_transfer_pods(&mut self) -> Result<()> {
        let image = Settings::get().migration.rsync_transfer_image.clone();
        for (namespace, pvcs) in self.owner.pvc_namespace_map() {
            let pod = rsync::transfer_pod(&namespace, &pvcs, &image);
            match self.dest_client.create(&namespace, &pod).await {
                Ok(_) => {
                    info!(namespace = %namespace, "Rsync transfer pod created");
                }
                Err(e) if e.is_already_exists() => {
                    info!(namespace = %namespace, "Rsync transfer pod already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Whether every transfer pod reports Running.
    async fn transfer_pods_running(&self) -> Result<bool> {
        let params = ListParams::default().labels(&labels_selector(&rsync::transfer_labels()));
        for namespace in self.owner.pvc_namespace_map().keys() {
            let pods = self.dest_client.list::<Pod>(namespace, &params).await?;
            if pods.is_empty() {
                return Ok(false);
            }
            for pod in pods {
                let phase = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                if phase != "Running" {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// One progress resource per client pod, owned by this migration so
    /// teardown can garbage-collect them.
    async fn create_pv_progress_crs(&mut self) -> Result<()> {
        let progresses: Api<DirectVolumeMigrationProgress> =
            Api::namespaced(self.client.clone(), MIGRATION_NAMESPACE);
        for (namespace, pvcs) in self.owner.pvc_namespace_map() {
            for pvc in pvcs {
                let mut progress = DirectVolumeMigrationProgress::new(
                    &rsync::client_pod_name(&pvc),
                    DirectVolumeMigrationProgressSpec {
                        cluster_ref: self.owner.spec.src_mig_cluster_ref.clone(),
                        pod_ref: Some(ObjectRef::new(&namespace, &rsync::client_pod_name(&pvc))),
                    },
                );
                progress.metadata.namespace = Some(MIGRATION_NAMESPACE.to_string());
                progress.metadata.owner_references = Some(vec![owner_reference(self.owner)]);
                progress.metadata.labels = Some(self.owner.correlation_labels());
                match progresses.create(&Default::default(), &progress).await {
                    Ok(_) => {
                        info!(name = %progress.name_any(), "Rsync progress resource created");
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// One one-shot client pod per claim on the source, pointed at the
    /// destination service IP.
    async fn create_rsync_client_pods(&mut self) -> Result<()> {
        let password = self.ensure_rsync_password().await?;
        let image = Settings::get().migration.rsync_transfer_image.clone();
        for (namespace, pvcs) in self.owner.pvc_namespace_map() {
            let service = self
                .dest_client
                .get::<Service>(&namespace, rsync::TRANSFER_SVC_NAME)
                .await?;
            let ip = service
                .spec
                .as_ref()
                .and_then(|s| s.cluster_ip.clone())
                .ok_or_else(|| Error::Transient("Transfer service has no cluster IP".into()))?;

            for pvc in pvcs {
                let pod = rsync::client_pod(&namespace, &pvc, &ip, &password, &image);
                match self.src_client.create(&namespace, &pod).await {
                    Ok(_) => {
                        info!(namespace = %namespace, pvc = %pvc, "Rsync client pod created");
                    }
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Roll up per-claim progress and decide completion: every claim has
    /// either succeeded or failed.
    async fn client_pods_completed(&mut self) -> Result<(bool, bool)> {
        let progresses: Api<DirectVolumeMigrationProgress> =
            Api::namespaced(self.client.clone(), MIGRATION_NAMESPACE);

        let mut running = Vec::new();
        let mut failed = Vec::new();
        let mut successful = Vec::new();
        let total = self.owner.spec.persistent_volume_claims.len();

        for (namespace, pvcs) in self.owner.pvc_namespace_map() {
            for pvc in pvcs {
                let name = rsync::client_pod_name(&pvc);
                let progress = progresses.get(&name).await?;
                let status = progress.status.unwrap_or_default();
                let entry = PodProgress {
                    pod_ref: ObjectRef::new(&namespace, &name),
                    last_observed_progress_percent: status
                        .rsync_pod_status
                        .last_observed_progress_percent
                        .clone(),
                    last_observed_transfer_rate: status
                        .rsync_pod_status
                        .last_observed_transfer_rate
                        .clone(),
                };
                match status.rsync_pod_status.pod_phase.as_str() {
                    "Running" => running.push(entry),
                    "Failed" => failed.push(entry),
                    "Succeeded" => successful.push(entry),
                    _ => {}
                }
            }
        }

        let completed = successful.len() + failed.len() == total;
        let any_failed = !failed.is_empty();

        let status = self.owner.status.get_or_insert_with(Default::default);
        status.running_pods = running;
        status.failed_pods = failed;
        status.successful_pods = successful;

        Ok((completed, any_failed))
    }

    /// Delete everything labeled as transfer machinery in every migrated
    /// namespace on both clusters, the host password secret, and (when
    /// requested) the per-claim progress resources.
    async fn delete_rsync_resources(&mut self) -> Result<()> {
        for client in [self.src_client.clone(), self.dest_client.clone()] {
            self.find_and_delete_resources(&client).await?;
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), MIGRATION_NAMESPACE);
        match secrets
            .delete(rsync::RSYNC_PASSWORD_SECRET_NAME, &background_delete())
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 404 => {}
            Err(e) => return Err(e.into()),
        }

        if self.owner.spec.delete_progress_reporting_crs {
            self.delete_progress_crs().await?;
        }
        Ok(())
    }

    async fn find_and_delete_resources(&self, client: &CompatClient) -> Result<()> {
        let params = ListParams::default().labels(&labels_selector(&rsync::app_labels()));
        let delete = background_delete();
        for namespace in self.owner.pvc_namespace_map().keys() {
            for pod in client.list::<Pod>(namespace, &params).await? {
                delete_tolerant(client.delete::<Pod>(namespace, &pod.name_any(), &delete).await)?;
            }
            for secret in client.list::<Secret>(namespace, &params).await? {
                delete_tolerant(
                    client
                        .delete::<Secret>(namespace, &secret.name_any(), &delete)
                        .await,
                )?;
            }
            for route in client.list::<Route>(namespace, &params).await? {
                delete_tolerant(
                    client
                        .delete::<Route>(namespace, &route.name_any(), &delete)
                        .await,
                )?;
            }
            for service in client.list::<Service>(namespace, &params).await? {
                delete_tolerant(
                    client
                        .delete::<Service>(namespace, &service.name_any(), &delete)
                        .await,
                )?;
            }
            for config_map in client.list::<ConfigMap>(namespace, &params).await? {
                delete_tolerant(
                    client
                        .delete::<ConfigMap>(namespace, &config_map.name_any(), &delete)
                        .await,
                )?;
            }
        }
        Ok(())
    }

    async fn delete_progress_crs(&self) -> Result<()> {
        let progresses: Api<DirectVolumeMigrationProgress> =
            Api::namespaced(self.client.clone(), MIGRATION_NAMESPACE);
        for (_, pvcs) in self.owner.pvc_namespace_map() {
            for pvc in pvcs {
                match progresses
                    .delete(&rsync::client_pod_name(&pvc), &background_delete())
                    .await
                {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Whether teardown finished on both clusters.
    async fn rsync_resources_deleted(&self) -> Result<bool> {
        let params = ListParams::default().labels(&labels_selector(&rsync::app_labels()));
        for client in [&self.src_client, &self.dest_client] {
            for namespace in self.owner.pvc_namespace_map().keys() {
                let pods = client.list::<Pod>(namespace, &params).await?;
                let secrets = client.list::<Secret>(namespace, &params).await?;
                let config_maps = client.list::<ConfigMap>(namespace, &params).await?;
                let services = client.list::<Service>(namespace, &params).await?;
                let routes = client.list::<Route>(namespace, &params).await?;
                if !pods.is_empty()
                    || !secrets.is_empty()
                    || !config_maps.is_empty()
                    || !services.is_empty()
                    || !routes.is_empty()
                {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

fn labels_selector(labels: &std::collections::BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn background_delete() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

fn delete_tolerant(result: std::result::Result<(), crate::compat::CompatError>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trip() {
        for phase in VOLUME_ITINERARY.phases {
            assert_eq!(Phase::parse(phase.as_str()), Some(*phase));
        }
        assert_eq!(Phase::parse(""), Some(Phase::Created));
        assert_eq!(Phase::parse("Bogus"), None);
    }

    #[test]
    fn test_itinerary_order() {
        let position = |phase| {
            VOLUME_ITINERARY
                .phases
                .iter()
                .position(|p| *p == phase)
                .unwrap()
        };
        // The password and config must exist before any client pod runs.
        assert!(position(Phase::CreateRsyncConfig) < position(Phase::CreateRsyncTransferPods));
        assert!(
            position(Phase::WaitForRsyncTransferPodsRunning)
                < position(Phase::CreateRsyncClientPods)
        );
        assert!(position(Phase::CreatePVProgressCRs) < position(Phase::CreateRsyncClientPods));
        assert_eq!(
            VOLUME_ITINERARY.phases.last().copied(),
            Some(Phase::Completed)
        );
    }

    #[test]
    fn test_failed_itinerary_tears_down() {
        assert!(FAILED_ITINERARY
            .phases
            .contains(&Phase::DeleteRsyncResources));
        assert_eq!(
            FAILED_ITINERARY.phases.last().copied(),
            Some(Phase::Completed)
        );
    }
}
