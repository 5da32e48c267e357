//! Stage pod construction.
//!
//! A stage pod is a no-op `sleep infinity` pod whose only purpose is to
//! hold PVC attachments so the BR engine's volume sidecar can capture the
//! claims. Stage pods are deduplicated by their volume-source set within a
//! namespace: two source pods mounting the same claims coalesce into one
//! stage pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, LimitRange, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::plan::{PlanPv, PvAction, PvCopyMethod, PvcRef};

/// Default stage pod resource requests, lifted per-namespace by LimitRange.
pub const DEFAULT_MEMORY: &str = "128Mi";
pub const DEFAULT_CPU: &str = "100m";

/// Per-namespace resource floor for stage pods.
pub type ResourceLimitMapping = BTreeMap<String, (Quantity, Quantity)>;

/// A list of stage pods with built-in deduplication.
#[derive(Clone, Debug, Default)]
pub struct StagePodList {
    pods: Vec<Pod>,
}

impl StagePodList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pods(pods: Vec<Pod>) -> Self {
        let mut list = Self::new();
        list.merge(pods);
        list
    }

    pub fn pods(&self) -> &[Pod] {
        &self.pods
    }

    pub fn into_pods(self) -> Vec<Pod> {
        self.pods
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    /// Whether an equivalent pod (same namespace, volume sources contained)
    /// is already present.
    pub fn contains(&self, pod: &Pod) -> bool {
        self.pods.iter().any(|existing| volumes_contained(pod, existing))
    }

    /// Add pods, skipping any whose volume set is already covered.
    pub fn merge(&mut self, pods: impl IntoIterator<Item = Pod>) {
        for pod in pods {
            if !self.contains(&pod) {
                self.pods.push(pod);
            }
        }
    }
}

/// Whether every volume source of `pod` appears in `other`, namespace
/// matching. Volume names are ignored; only the sources matter.
fn volumes_contained(pod: &Pod, other: &Pod) -> bool {
    if pod.metadata.namespace != other.metadata.namespace {
        return false;
    }
    let empty = Vec::new();
    let pod_volumes = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .unwrap_or(&empty);
    let other_volumes = other
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .unwrap_or(&empty);

    pod_volumes.iter().all(|volume| {
        other_volumes
            .iter()
            .any(|candidate| volume_source_equal(volume, candidate))
    })
}

fn volume_source_equal(a: &Volume, b: &Volume) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.name = String::new();
    b.name = String::new();
    a == b
}

/// Build stage pods for every source pod mounting a filesystem-copied PVC.
///
/// The result is deduplicated by `{namespace, volume-source set}`; running
/// it over its own output is a no-op.
pub fn build_stage_pods(
    labels: &BTreeMap<String, String>,
    pvc_mapping: &BTreeMap<PvcRef, PlanPv>,
    pods: &[Pod],
    image: &str,
    limits: &ResourceLimitMapping,
) -> StagePodList {
    let mut stage_pods = StagePodList::new();
    for pod in pods {
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let volumes: Vec<Volume> = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_ref())
            .map(|volumes| {
                volumes
                    .iter()
                    .filter(|volume| {
                        let Some(claim) = &volume.persistent_volume_claim else {
                            return false;
                        };
                        let key = PvcRef {
                            namespace: namespace.clone(),
                            name: claim.claim_name.clone(),
                        };
                        pvc_mapping.get(&key).is_some_and(|pv| {
                            pv.selection.action == PvAction::Copy
                                && pv.selection.copy_method == PvCopyMethod::Filesystem
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if volumes.is_empty() {
            continue;
        }
        stage_pods.merge([build_stage_pod_from_pod(pod, labels, volumes, image, limits)]);
    }
    stage_pods
}

/// Look up the per-namespace resource floor, falling back to defaults.
fn namespace_resources(namespace: &str, limits: &ResourceLimitMapping) -> (Quantity, Quantity) {
    limits.get(namespace).cloned().unwrap_or_else(|| {
        (
            Quantity(DEFAULT_MEMORY.to_string()),
            Quantity(DEFAULT_CPU.to_string()),
        )
    })
}

fn stage_resources(memory: Quantity, cpu: Quantity) -> ResourceRequirements {
    let mut list = BTreeMap::new();
    list.insert("memory".to_string(), memory);
    list.insert("cpu".to_string(), cpu);
    ResourceRequirements {
        requests: Some(list.clone()),
        limits: Some(list),
        ..Default::default()
    }
}

/// Build a stage pod shaped after an existing source pod, keeping only the
/// migrated PVC volumes and their mounts.
pub fn build_stage_pod_from_pod(
    pod: &Pod,
    labels: &BTreeMap<String, String>,
    pvc_volumes: Vec<Volume>,
    image: &str,
    limits: &ResourceLimitMapping,
) -> Pod {
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let name = pod.metadata.name.clone().unwrap_or_default();
    let (memory, cpu) = namespace_resources(&namespace, limits);
    let source_spec = pod.spec.clone().unwrap_or_default();

    let in_volumes = |mount: &VolumeMount| pvc_volumes.iter().any(|v| v.name == mount.name);

    let containers = source_spec
        .containers
        .iter()
        .enumerate()
        .map(|(i, container)| {
            let mounts: Vec<VolumeMount> = container
                .volume_mounts
                .as_ref()
                .map(|mounts| mounts.iter().filter(|m| in_volumes(m)).cloned().collect())
                .unwrap_or_default();
            Container {
                name: format!("sleep-{i}"),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string()]),
                args: Some(vec!["infinity".to_string()]),
                volume_mounts: Some(mounts),
                resources: Some(stage_resources(memory.clone(), cpu.clone())),
                ..Default::default()
            }
        })
        .collect();

    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace),
            generate_name: Some(format!("{}-", truncate_name(&format!("stage-{name}")))),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers,
            node_name: source_spec.node_name,
            volumes: Some(pvc_volumes),
            security_context: source_spec.security_context,
            service_account_name: source_spec.service_account_name,
            automount_service_account_token: source_spec.automount_service_account_token,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build a generic stage pod for an orphaned bound claim with no pod
/// template to copy from.
pub fn build_stage_pod(
    pvc: &PersistentVolumeClaim,
    labels: &BTreeMap<String, String>,
    image: &str,
    limits: &ResourceLimitMapping,
) -> Pod {
    let namespace = pvc.metadata.namespace.clone().unwrap_or_default();
    let name = pvc.metadata.name.clone().unwrap_or_default();
    let (memory, cpu) = namespace_resources(&namespace, limits);

    Pod {
        metadata: ObjectMeta {
            namespace: Some(namespace),
            generate_name: Some(format!("{}-", truncate_name(&format!("stage-{name}")))),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "sleep".to_string(),
                image: Some(image.to_string()),
                command: Some(vec!["sleep".to_string()]),
                args: Some(vec!["infinity".to_string()]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "stage".to_string(),
                    mount_path: "/var/data".to_string(),
                    ..Default::default()
                }]),
                resources: Some(stage_resources(memory, cpu)),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "stage".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: name,
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the per-namespace resource floor from LimitRanges: start from the
/// defaults and lift to the largest container/pod minimum found.
pub fn build_resource_limit_mapping(
    namespaces: &[String],
    limit_ranges: &BTreeMap<String, Vec<LimitRange>>,
) -> ResourceLimitMapping {
    let mut mapping = ResourceLimitMapping::new();
    for namespace in namespaces {
        let mut memory = parse_quantity(DEFAULT_MEMORY).unwrap_or_default();
        let mut cpu = parse_quantity(DEFAULT_CPU).unwrap_or_default();
        let mut memory_quantity = Quantity(DEFAULT_MEMORY.to_string());
        let mut cpu_quantity = Quantity(DEFAULT_CPU.to_string());

        for limit_range in limit_ranges.get(namespace).map(Vec::as_slice).unwrap_or(&[]) {
            let Some(spec) = &limit_range.spec else {
                continue;
            };
            for limit in &spec.limits {
                if limit.type_ != "Container" && limit.type_ != "Pod" {
                    continue;
                }
                let Some(min) = &limit.min else { continue };
                if let Some(quantity) = min.get("memory")
                    && let Some(value) = parse_quantity(&quantity.0)
                    && value > memory
                {
                    memory = value;
                    memory_quantity = quantity.clone();
                }
                if let Some(quantity) = min.get("cpu")
                    && let Some(value) = parse_quantity(&quantity.0)
                    && value > cpu
                {
                    cpu = value;
                    cpu_quantity = quantity.clone();
                }
            }
        }
        mapping.insert(namespace.clone(), (memory_quantity, cpu_quantity));
    }
    mapping
}

/// Collapse repeated dashes, trim trailing dashes, and cap at 57 chars so
/// generateName still has room for its random suffix.
pub fn truncate_name(name: &str) -> String {
    let mut collapsed = String::with_capacity(name.len());
    let mut last_dash = false;
    for c in name.chars() {
        if c == '-' {
            if !last_dash {
                collapsed.push(c);
            }
            last_dash = true;
        } else {
            collapsed.push(c);
            last_dash = false;
        }
    }
    let trimmed = collapsed.trim_end_matches('-');
    trimmed.chars().take(57).collect()
}

/// Parse a Kubernetes quantity into a comparable f64.
pub fn parse_quantity(quantity: &str) -> Option<f64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.' && c != '-')
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let base: f64 = number.parse().ok()?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0_f64.powi(4),
        "Pi" => 1024.0_f64.powi(5),
        _ => return None,
    };
    Some(base * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::plan::PvSelection;

    fn pvc_volume(name: &str, claim: &str) -> Volume {
        Volume {
            name: name.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn source_pod(namespace: &str, name: &str, claims: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "app".to_string(),
                    volume_mounts: Some(
                        claims
                            .iter()
                            .map(|claim| VolumeMount {
                                name: claim.to_string(),
                                mount_path: format!("/data/{claim}"),
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                volumes: Some(claims.iter().map(|c| pvc_volume(c, c)).collect()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn copy_mapping(namespace: &str, claims: &[&str]) -> BTreeMap<PvcRef, PlanPv> {
        claims
            .iter()
            .map(|claim| {
                let pvc = PvcRef {
                    namespace: namespace.to_string(),
                    name: claim.to_string(),
                };
                (
                    pvc.clone(),
                    PlanPv {
                        name: format!("pv-{claim}"),
                        pvc,
                        selection: PvSelection::default(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_build_stage_pods_filters_non_copy_claims() {
        let pods = vec![source_pod("app", "web-0", &["data"])];
        let mut mapping = copy_mapping("app", &["data"]);
        mapping.get_mut(&PvcRef {
            namespace: "app".to_string(),
            name: "data".to_string(),
        })
        .unwrap()
        .selection
        .action = PvAction::Skip;

        let stage_pods =
            build_stage_pods(&BTreeMap::new(), &mapping, &pods, "img", &BTreeMap::new());
        assert!(stage_pods.is_empty());
    }

    #[test]
    fn test_pods_sharing_claims_coalesce() {
        let pods = vec![
            source_pod("app", "web-0", &["data"]),
            source_pod("app", "web-1", &["data"]),
        ];
        let mapping = copy_mapping("app", &["data"]);

        let stage_pods =
            build_stage_pods(&BTreeMap::new(), &mapping, &pods, "img", &BTreeMap::new());
        assert_eq!(stage_pods.len(), 1);
    }

    #[test]
    fn test_build_stage_pods_idempotent() {
        let pods = vec![
            source_pod("app", "web-0", &["data"]),
            source_pod("app", "db-0", &["pgdata"]),
        ];
        let mapping = copy_mapping("app", &["data", "pgdata"]);

        let first = build_stage_pods(&BTreeMap::new(), &mapping, &pods, "img", &BTreeMap::new());
        assert_eq!(first.len(), 2);

        let second = build_stage_pods(
            &BTreeMap::new(),
            &mapping,
            first.pods(),
            "img",
            &BTreeMap::new(),
        );
        assert_eq!(second.len(), first.len());

        let mut merged = StagePodList::from_pods(first.pods().to_vec());
        merged.merge(second.into_pods());
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_stage_pod_keeps_node_and_service_account() {
        let mut pod = source_pod("app", "web-0", &["data"]);
        if let Some(spec) = pod.spec.as_mut() {
            spec.node_name = Some("node-1".to_string());
            spec.service_account_name = Some("runner".to_string());
        }
        let volumes = vec![pvc_volume("data", "data")];

        let stage = build_stage_pod_from_pod(&pod, &BTreeMap::new(), volumes, "img", &BTreeMap::new());
        let spec = stage.spec.unwrap();
        assert_eq!(spec.node_name.as_deref(), Some("node-1"));
        assert_eq!(spec.service_account_name.as_deref(), Some("runner"));
        assert_eq!(spec.containers[0].command.as_ref().unwrap()[0], "sleep");
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("stage--web---0"), "stage-web-0");
        assert_eq!(truncate_name("stage-web-"), "stage-web");
        let long = format!("stage-{}", "a".repeat(80));
        assert_eq!(truncate_name(&long).len(), 57);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("128Mi"), Some(128.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("100m"), Some(0.1));
        assert_eq!(parse_quantity("2"), Some(2.0));
        assert_eq!(parse_quantity("1G"), Some(1e9));
        assert_eq!(parse_quantity("bogus"), None);
    }

    #[test]
    fn test_limit_range_lifts_defaults() {
        use k8s_openapi::api::core::v1::{LimitRangeItem, LimitRangeSpec};

        let limit_range = LimitRange {
            spec: Some(LimitRangeSpec {
                limits: vec![LimitRangeItem {
                    type_: "Container".to_string(),
                    min: Some(BTreeMap::from([
                        ("memory".to_string(), Quantity("256Mi".to_string())),
                        ("cpu".to_string(), Quantity("50m".to_string())),
                    ])),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        };
        let ranges = BTreeMap::from([("app".to_string(), vec![limit_range])]);
        let mapping = build_resource_limit_mapping(&["app".to_string()], &ranges);

        let (memory, cpu) = &mapping["app"];
        // 256Mi floor is above the 128Mi default; 50m is below 100m and ignored.
        assert_eq!(memory.0, "256Mi");
        assert_eq!(cpu.0, "100m");
    }
}
