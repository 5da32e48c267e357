//! API-version conversion round-trip tests.
//!
//! A source cluster on an old minor version serves the legacy groups; the
//! compat layer must down-convert on the wire and up-convert replies so
//! callers never see the drift.

use migration_operator::compat::conversion::{rule_for, rules};
use serde_json::json;

#[test]
fn test_every_registered_kind_round_trips() {
    // up(down(x)) == x for every registered kind, for an object expressed
    // in the caller's preferred version.
    let body = json!({
        "metadata": {"name": "web", "namespace": "app"},
        "spec": {
            "replicas": 3,
            "selector": {"matchLabels": {"app": "web"}},
            "template": {
                "metadata": {"labels": {"app": "web"}},
                "spec": {"containers": [
                    {"name": "web", "image": "web:1"},
                    {"name": "sidecar", "image": "sidecar:1"}
                ]}
            }
        }
    });

    for rule in rules() {
        let mut value = body.clone();
        (rule.down)(&mut value).unwrap();
        (rule.up)(&mut value).unwrap();
        assert_eq!(value, body, "round trip changed {}", rule.kind);
    }
}

#[test]
fn test_workload_kinds_fall_back_below_cutoff() {
    // Source minor=15: workload controllers use the pre-unified groups.
    assert_eq!(rule_for("Deployment", 15).unwrap().api_version(), "apps/v1beta1");
    assert_eq!(rule_for("StatefulSet", 15).unwrap().api_version(), "apps/v1beta1");
    assert_eq!(
        rule_for("DaemonSet", 15).unwrap().api_version(),
        "extensions/v1beta1"
    );
    assert_eq!(
        rule_for("ReplicaSet", 15).unwrap().api_version(),
        "extensions/v1beta1"
    );
}

#[test]
fn test_destination_above_cutoff_passes_through() {
    // Destination minor=18: no conversion for workload controllers.
    for kind in ["Deployment", "StatefulSet", "DaemonSet", "ReplicaSet"] {
        assert!(rule_for(kind, 18).is_none(), "{kind} should pass through");
    }
}

#[test]
fn test_round_trip_preserves_container_names() {
    // The drift scenario: a Deployment read from a minor=15 source keeps
    // its container names through the conversion cycle.
    let rule = rule_for("Deployment", 15).unwrap();
    let mut value = json!({
        "spec": {
            "template": {"spec": {"containers": [
                {"name": "api"}, {"name": "worker"}
            ]}}
        }
    });
    (rule.down)(&mut value).unwrap();
    (rule.up)(&mut value).unwrap();

    let names: Vec<&str> = value["spec"]["template"]["spec"]["containers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["api", "worker"]);
}

#[test]
fn test_unregistered_kinds_never_convert() {
    for kind in ["Pod", "Secret", "ConfigMap", "Service", "Namespace"] {
        for minor in [7, 12, 15, 20, 30] {
            assert!(rule_for(kind, minor).is_none());
        }
    }
}
