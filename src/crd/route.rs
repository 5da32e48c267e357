//! Foreign resource definitions for OpenShift networking and images.
//!
//! Routes expose the rsync TLS tunnel outside the destination cluster;
//! ImageStreams are the unit of direct image migration. Only the fields the
//! controller touches are modeled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// TLS termination type used by the transfer route.
pub const TLS_TERMINATION_PASSTHROUGH: &str = "passthrough";

/// An externally reachable route to a service.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "route.openshift.io",
    version = "v1",
    kind = "Route",
    plural = "routes",
    status = "RouteStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Hostname assigned by the router (populated after admission).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// The backing service.
    pub to: RouteTargetReference,

    /// Target port on the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,

    /// TLS settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouteTls>,
}

/// The service a route points at.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    pub kind: String,
    pub name: String,
}

/// Target port selection.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    pub target_port: i32,
}

/// TLS settings for a route.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteTls {
    /// One of "edge", "passthrough", "reencrypt".
    pub termination: String,
}

/// Observed state of a route.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<RouteIngress>,
}

/// Router admission record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// A stream of container image tags in the internal registry.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "image.openshift.io",
    version = "v1",
    kind = "ImageStream",
    plural = "imagestreams",
    status = "ImageStreamStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamSpec {
    /// Tag definitions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<ImageStreamTag>,
}

/// One tag definition in an image stream.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamTag {
    pub name: String,

    /// Source of the tag (external image reference).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TagReference>,
}

/// Reference a tag points at.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TagReference {
    pub kind: String,
    pub name: String,
}

/// Observed state of an image stream.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageStreamStatus {
    /// Registry repository backing the stream.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_image_repository: String,

    /// Externally reachable repository, when the registry is exposed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub public_docker_image_repository: String,

    /// Observed tag history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<NamedTagEventList>,
}

/// Tag history for one tag.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedTagEventList {
    pub tag: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<TagEvent>,
}

/// One image in a tag's history.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_image_reference: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}
