//! MigCluster Custom Resource Definition.
//!
//! A MigCluster registers one of the two clusters taking part in a
//! migration. The host cluster (where this operator runs) is marked with
//! `isHostCluster`; remote clusters carry a URL and a reference to a
//! service-account token secret used to build their client.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::Conditions;
use super::ObjectRef;

/// MigCluster registers a cluster with the migration controller.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.openshift.io",
    version = "v1alpha1",
    kind = "MigCluster",
    plural = "migclusters",
    status = "MigClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Host", "type":"boolean", "jsonPath":".spec.isHostCluster"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MigClusterSpec {
    /// Whether this is the cluster the controller itself runs on.
    #[serde(default)]
    pub is_host_cluster: bool,

    /// API server URL for remote clusters. Ignored for the host cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Reference to a secret holding a service-account bearer token
    /// (`saToken` key) for the remote cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_secret_ref: Option<ObjectRef>,

    /// Skip TLS verification when talking to the remote API server.
    #[serde(default)]
    pub insecure: bool,

    /// CA bundle for the remote API server, base64-encoded PEM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Observed state of a MigCluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigClusterStatus {
    /// Conditions describing cluster readiness.
    #[serde(default)]
    pub conditions: Conditions,

    /// Observed Kubernetes major version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_major_version: Option<i32>,

    /// Observed Kubernetes minor version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_minor_version: Option<i32>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MigCluster {
    /// Whether the cluster has a `Ready` condition set to true.
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.has(super::READY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::condition::{Category, Condition, TRUE};

    #[test]
    fn test_ready_requires_condition() {
        let mut cluster = MigCluster::new("src", MigClusterSpec::default());
        assert!(!cluster.is_ready());

        let mut status = MigClusterStatus::default();
        status
            .conditions
            .set(Condition::new("Ready", TRUE, Category::Required));
        cluster.status = Some(status);
        assert!(cluster.is_ready());
    }
}
