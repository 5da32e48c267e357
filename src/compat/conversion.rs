//! Conversion registry for API-version drift.
//!
//! Each entry maps a kind to the legacy group/version an older cluster
//! serves, gated on the cluster's minor version, together with a pair of
//! field-wise converters. Kinds without an entry pass through unchanged.
//!
//! The converters operate on the JSON body only; the client swaps
//! `apiVersion`/`kind` itself. Up-conversion strips fields that exist only
//! in the legacy form, so `up(down(x)) == x` for any object expressed in
//! the caller's preferred version.

use serde_json::Value;

/// A field-wise converter. Mutates the object body in place; returns an
/// error message on unconvertible input.
pub type ConvertFn = fn(&mut Value) -> Result<(), String>;

/// Legacy coordinates for a kind on old clusters.
#[derive(Clone, Copy, Debug)]
pub struct Rule {
    /// Kind this rule applies to.
    pub kind: &'static str,
    /// Clusters with a minor version below this use the legacy form.
    pub cutoff_minor: i32,
    /// Legacy API group.
    pub group: &'static str,
    /// Legacy API version.
    pub version: &'static str,
    /// Legacy resource plural.
    pub plural: &'static str,
    /// Caller-preferred form to wire form.
    pub down: ConvertFn,
    /// Wire form to caller-preferred form.
    pub up: ConvertFn,
}

impl Rule {
    /// Legacy `apiVersion` string.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

fn passthrough(_obj: &mut Value) -> Result<(), String> {
    Ok(())
}

/// Drop a field from `spec` if present. Legacy-only fields must not leak
/// into the caller's preferred version.
fn strip_spec_field(obj: &mut Value, field: &str) -> Result<(), String> {
    match obj.get_mut("spec") {
        Some(Value::Object(spec)) => {
            spec.remove(field);
            Ok(())
        }
        Some(_) => Err("spec is not an object".to_string()),
        None => Ok(()),
    }
}

fn up_deployment(obj: &mut Value) -> Result<(), String> {
    strip_spec_field(obj, "rollbackTo")
}

fn up_daemon_set(obj: &mut Value) -> Result<(), String> {
    strip_spec_field(obj, "templateGeneration")
}

/// The compiled conversion table.
///
/// Workload controllers fall back to their pre-unified groups below 1.16;
/// CronJob falls back to its alpha stage below 1.8.
static RULES: &[Rule] = &[
    Rule {
        kind: "Deployment",
        cutoff_minor: 16,
        group: "apps",
        version: "v1beta1",
        plural: "deployments",
        down: passthrough,
        up: up_deployment,
    },
    Rule {
        kind: "StatefulSet",
        cutoff_minor: 16,
        group: "apps",
        version: "v1beta1",
        plural: "statefulsets",
        down: passthrough,
        up: passthrough,
    },
    Rule {
        kind: "DaemonSet",
        cutoff_minor: 16,
        group: "extensions",
        version: "v1beta1",
        plural: "daemonsets",
        down: passthrough,
        up: up_daemon_set,
    },
    Rule {
        kind: "ReplicaSet",
        cutoff_minor: 16,
        group: "extensions",
        version: "v1beta1",
        plural: "replicasets",
        down: passthrough,
        up: passthrough,
    },
    Rule {
        kind: "CronJob",
        cutoff_minor: 8,
        group: "batch",
        version: "v2alpha1",
        plural: "cronjobs",
        down: passthrough,
        up: passthrough,
    },
];

/// Look up the rule for a kind on a cluster of the given minor version.
///
/// Returns `None` when the cluster serves the caller's preferred version.
pub fn rule_for(kind: &str, minor: i32) -> Option<&'static Rule> {
    RULES
        .iter()
        .find(|rule| rule.kind == kind && minor < rule.cutoff_minor)
}

/// All registered rules; exposed for round-trip testing.
pub fn rules() -> &'static [Rule] {
    RULES
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_applies_below_cutoff() {
        assert!(rule_for("Deployment", 15).is_some());
        assert!(rule_for("Deployment", 16).is_none());
        assert!(rule_for("Deployment", 18).is_none());
    }

    #[test]
    fn test_cronjob_has_its_own_cutoff() {
        let rule = rule_for("CronJob", 7).unwrap();
        assert_eq!(rule.api_version(), "batch/v2alpha1");
        assert!(rule_for("CronJob", 8).is_none());
        assert!(rule_for("CronJob", 15).is_none());
    }

    #[test]
    fn test_unregistered_kind_passes_through() {
        assert!(rule_for("Pod", 12).is_none());
        assert!(rule_for("Secret", 12).is_none());
    }

    #[test]
    fn test_legacy_api_version() {
        let rule = rule_for("DaemonSet", 15).unwrap();
        assert_eq!(rule.api_version(), "extensions/v1beta1");
    }

    #[test]
    fn test_round_trip_preserves_preferred_form() {
        let original = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "app"},
            "spec": {
                "replicas": 2,
                "template": {"spec": {"containers": [{"name": "web"}]}}
            }
        });
        for rule in rules() {
            let mut value = original.clone();
            (rule.down)(&mut value).unwrap();
            (rule.up)(&mut value).unwrap();
            assert_eq!(value, original, "round trip changed body for {}", rule.kind);
        }
    }

    #[test]
    fn test_up_strips_legacy_fields() {
        let mut value = json!({
            "spec": {"replicas": 1, "rollbackTo": {"revision": 3}}
        });
        up_deployment(&mut value).unwrap();
        assert!(value["spec"].get("rollbackTo").is_none());
        assert_eq!(value["spec"]["replicas"], 1);
    }
}
