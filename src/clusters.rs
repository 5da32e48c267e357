//! Cluster registry: builds and caches a [`CompatClient`] per MigCluster.
//!
//! The host cluster reuses the controller's own client. Remote clusters get
//! a client built from the registered API URL and the service-account token
//! secret the MigCluster references. Clients are cached by cluster UID for
//! the lifetime of the process; re-registering a cluster (new UID) builds a
//! fresh client.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, ResourceExt};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

use crate::compat::{CompatClient, CompatError};
use crate::crd::MigCluster;

/// Key in the service-account secret holding the bearer token.
const SA_TOKEN_KEY: &str = "saToken";

/// Errors building a cluster client.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Compat(#[from] CompatError),

    #[error("cluster {0} is missing {1}")]
    MissingField(String, String),

    #[error("kubeconfig assembly failed: {0}")]
    Kubeconfig(String),
}

/// Caches one CompatClient per registered cluster.
#[derive(Clone)]
pub struct ClusterRegistry {
    host: Client,
    cache: Arc<RwLock<HashMap<String, CompatClient>>>,
}

impl ClusterRegistry {
    /// Create a registry around the controller's own (host) client.
    pub fn new(host: Client) -> Self {
        Self {
            host,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get or build the client for a registered cluster.
    pub async fn client_for(&self, cluster: &MigCluster) -> Result<CompatClient, RegistryError> {
        let uid = cluster.uid().unwrap_or_default();
        if let Some(client) = self.cache.read().await.get(&uid) {
            return Ok(client.clone());
        }

        let client = if cluster.spec.is_host_cluster {
            CompatClient::new(self.host.clone()).await?
        } else {
            self.build_remote(cluster).await?
        };

        debug!(
            cluster = %cluster.name_any(),
            major = client.major,
            minor = client.minor,
            "Cluster client ready"
        );
        self.cache.write().await.insert(uid, client.clone());
        Ok(client)
    }

    async fn build_remote(&self, cluster: &MigCluster) -> Result<CompatClient, RegistryError> {
        let name = cluster.name_any();
        let url = cluster
            .spec
            .url
            .clone()
            .ok_or_else(|| RegistryError::MissingField(name.clone(), "spec.url".into()))?;
        let secret_ref = cluster.spec.service_account_secret_ref.clone().ok_or_else(|| {
            RegistryError::MissingField(name.clone(), "spec.serviceAccountSecretRef".into())
        })?;

        let secrets: Api<Secret> = Api::namespaced(self.host.clone(), &secret_ref.namespace);
        let secret = secrets.get(&secret_ref.name).await?;
        let token = secret
            .data
            .as_ref()
            .and_then(|d| d.get(SA_TOKEN_KEY))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).trim().to_string())
            .ok_or_else(|| RegistryError::MissingField(name.clone(), SA_TOKEN_KEY.into()))?;

        // Assemble a single-context kubeconfig rather than poking at the
        // typed Config internals; from_custom_kubeconfig resolves auth the
        // same way a file-based kubeconfig would.
        let mut cluster_entry = json!({"server": url});
        if cluster.spec.insecure {
            cluster_entry["insecure-skip-tls-verify"] = json!(true);
        } else if let Some(ca) = &cluster.spec.ca_bundle {
            cluster_entry["certificate-authority-data"] = json!(ca);
        }
        let kubeconfig: Kubeconfig = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{"name": name, "cluster": cluster_entry}],
            "users": [{"name": name, "user": {"token": token}}],
            "contexts": [{"name": name, "context": {"cluster": name, "user": name}}],
            "current-context": name,
        }))
        .map_err(|e| RegistryError::Kubeconfig(e.to_string()))?;

        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| RegistryError::Kubeconfig(e.to_string()))?;
        let client = Client::try_from(config)?;
        Ok(CompatClient::new(client).await?)
    }
}
