//! API-version-normalizing client wrapper.
//!
//! The two clusters taking part in a migration can run different Kubernetes
//! versions. A [`CompatClient`] hides that: before each outbound call the
//! object is down-converted to the group/version the target cluster serves,
//! and every reply is up-converted back to the caller's preferred version.
//! Callers never branch on cluster version.
//!
//! Conversion is driven by the compiled table in [`conversion`]; kinds with
//! no entry take the typed fast path untouched. List pagination, label
//! selectors, delete propagation, and resourceVersion semantics all pass
//! through to the underlying client.

pub mod conversion;

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

use conversion::Rule;

/// Errors from the compat layer.
#[derive(Debug, thiserror::Error)]
pub enum CompatError {
    /// Kubernetes API error from either cluster.
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// An object could not be converted between API versions.
    #[error("conversion of {kind} failed: {reason}")]
    Conversion { kind: String, reason: String },

    /// Serialization error while converting.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The API server reported a non-numeric version.
    #[error("unparseable server version: {0}")]
    ServerVersion(String),
}

impl CompatError {
    /// Whether the error is a 404 from the API server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CompatError::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Whether the error is a 409 AlreadyExists.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            CompatError::Kube(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists"
        )
    }
}

/// Result alias for compat operations.
pub type Result<T, E = CompatError> = std::result::Result<T, E>;

/// A version-aware client for one cluster.
#[derive(Clone)]
pub struct CompatClient {
    client: Client,
    /// Kubernetes major version reported by discovery.
    pub major: i32,
    /// Kubernetes minor version reported by discovery.
    pub minor: i32,
}

impl CompatClient {
    /// Wrap a client, discovering the server version.
    pub async fn new(client: Client) -> Result<Self> {
        let info = client.apiserver_version().await?;
        let major = parse_version_field(&info.major)?;
        let minor = parse_version_field(&info.minor)?;
        Ok(Self::with_version(client, major, minor))
    }

    /// Wrap a client with a known server version.
    pub fn with_version(client: Client, major: i32, minor: i32) -> Self {
        Self {
            client,
            major,
            minor,
        }
    }

    /// The underlying client, for operations the compat layer does not
    /// mediate (log streams, subresources).
    pub fn raw(&self) -> &Client {
        &self.client
    }

    fn rule_for<K>(&self) -> Option<&'static Rule>
    where
        K: Resource<DynamicType = ()>,
    {
        conversion::rule_for(&K::kind(&()), self.minor)
    }

    /// Get a namespaced resource, converting as needed.
    pub async fn get<K>(&self, namespace: &str, name: &str) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        match self.rule_for::<K>() {
            Some(rule) => {
                let api = self.legacy_api(namespace, rule);
                let obj = api.get(name).await?;
                up_convert::<K>(obj, rule)
            }
            None => Ok(Api::<K>::namespaced(self.client.clone(), namespace)
                .get(name)
                .await?),
        }
    }

    /// Get a namespaced resource, mapping 404 to `None`.
    pub async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        match self.get(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List namespaced resources, converting each item as needed.
    pub async fn list<K>(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        match self.rule_for::<K>() {
            Some(rule) => {
                let api = self.legacy_api(namespace, rule);
                let list = api.list(params).await?;
                list.items
                    .into_iter()
                    .map(|obj| up_convert::<K>(obj, rule))
                    .collect()
            }
            None => Ok(Api::<K>::namespaced(self.client.clone(), namespace)
                .list(params)
                .await?
                .items),
        }
    }

    /// Create a namespaced resource, converting as needed.
    pub async fn create<K>(&self, namespace: &str, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        match self.rule_for::<K>() {
            Some(rule) => {
                let api = self.legacy_api(namespace, rule);
                let wire = down_convert(obj, rule)?;
                let created = api.create(&PostParams::default(), &wire).await?;
                up_convert::<K>(created, rule)
            }
            None => Ok(Api::<K>::namespaced(self.client.clone(), namespace)
                .create(&PostParams::default(), obj)
                .await?),
        }
    }

    /// Update (replace) a namespaced resource, converting as needed.
    pub async fn update<K>(&self, namespace: &str, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let name = obj.name_any();
        match self.rule_for::<K>() {
            Some(rule) => {
                let api = self.legacy_api(namespace, rule);
                let wire = down_convert(obj, rule)?;
                let replaced = api.replace(&name, &PostParams::default(), &wire).await?;
                up_convert::<K>(replaced, rule)
            }
            None => Ok(Api::<K>::namespaced(self.client.clone(), namespace)
                .replace(&name, &PostParams::default(), obj)
                .await?),
        }
    }

    /// Delete a namespaced resource. Propagation policy passes through.
    pub async fn delete<K>(&self, namespace: &str, name: &str, params: &DeleteParams) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        match self.rule_for::<K>() {
            Some(rule) => {
                let api = self.legacy_api(namespace, rule);
                api.delete(name, params).await?;
            }
            None => {
                Api::<K>::namespaced(self.client.clone(), namespace)
                    .delete(name, params)
                    .await?;
            }
        }
        Ok(())
    }

    /// Get a cluster-scoped resource. No conversion rules apply to
    /// cluster-scoped kinds.
    pub async fn get_cluster<K>(&self, name: &str) -> Result<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(Api::<K>::all(self.client.clone()).get(name).await?)
    }

    /// List cluster-scoped resources.
    pub async fn list_cluster<K>(&self, params: &ListParams) -> Result<Vec<K>>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(Api::<K>::all(self.client.clone()).list(params).await?.items)
    }

    /// Create a cluster-scoped resource.
    pub async fn create_cluster<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        Ok(Api::<K>::all(self.client.clone())
            .create(&PostParams::default(), obj)
            .await?)
    }

    /// Update (replace) a cluster-scoped resource.
    pub async fn update_cluster<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let name = obj.name_any();
        Ok(Api::<K>::all(self.client.clone())
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    /// Delete a cluster-scoped resource.
    pub async fn delete_cluster<K>(&self, name: &str, params: &DeleteParams) -> Result<()>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Api::<K>::all(self.client.clone()).delete(name, params).await?;
        Ok(())
    }

    fn legacy_api(&self, namespace: &str, rule: &Rule) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(rule.group, rule.version, rule.kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, rule.plural);
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

fn parse_version_field(field: &str) -> Result<i32> {
    field
        .trim_end_matches('+')
        .parse()
        .map_err(|_| CompatError::ServerVersion(field.to_string()))
}

/// Convert a typed object into its legacy wire form.
fn down_convert<K>(obj: &K, rule: &Rule) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut value = serde_json::to_value(obj)?;
    (rule.down)(&mut value).map_err(|reason| CompatError::Conversion {
        kind: K::kind(&()).to_string(),
        reason,
    })?;
    value["apiVersion"] = rule.api_version().into();
    value["kind"] = rule.kind.into();
    Ok(serde_json::from_value(value)?)
}

/// Convert a legacy wire object back to the caller's preferred type.
fn up_convert<K>(obj: DynamicObject, rule: &Rule) -> Result<K>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let mut value = serde_json::to_value(&obj)?;
    (rule.up)(&mut value).map_err(|reason| CompatError::Conversion {
        kind: K::kind(&()).to_string(),
        reason,
    })?;
    value["apiVersion"] = K::api_version(&()).to_string().into();
    value["kind"] = K::kind(&()).to_string().into();
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use serde_json::json;

    #[test]
    fn test_parse_version_field() {
        assert_eq!(parse_version_field("1").unwrap(), 1);
        assert_eq!(parse_version_field("21+").unwrap(), 21);
        assert!(parse_version_field("one").is_err());
    }

    #[test]
    fn test_down_convert_rewrites_api_version() {
        let deployment: Deployment = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "app"},
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [{"name": "web", "image": "web:1"}]}
                }
            }
        }))
        .unwrap();

        let rule = conversion::rule_for("Deployment", 15).unwrap();
        let wire = down_convert(&deployment, rule).unwrap();
        assert_eq!(
            wire.types.as_ref().map(|t| t.api_version.as_str()),
            Some("apps/v1beta1")
        );
    }

    #[test]
    fn test_round_trip_preserves_container_names() {
        let deployment: Deployment = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "app"},
            "spec": {
                "selector": {"matchLabels": {"app": "web"}},
                "template": {
                    "metadata": {"labels": {"app": "web"}},
                    "spec": {"containers": [
                        {"name": "web", "image": "web:1"},
                        {"name": "sidecar", "image": "sidecar:1"}
                    ]}
                }
            }
        }))
        .unwrap();

        let rule = conversion::rule_for("Deployment", 15).unwrap();
        let wire = down_convert(&deployment, rule).unwrap();
        let back: Deployment = up_convert(wire, rule).unwrap();

        let names: Vec<_> = back
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();
        assert_eq!(names, vec!["web".to_string(), "sidecar".to_string()]);
        assert_eq!(back, deployment);
    }
}
