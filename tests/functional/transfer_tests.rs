//! Wire-format and progress tests for the direct volume transfer.

use migration_operator::controller::dvm_progress::{
    cumulative_progress_percentage, parse_progress_lines,
};
use migration_operator::crd::RsyncPodStatus;
use migration_operator::resources::rsync;
use migration_operator::resources::stage_pod::{build_stage_pods, StagePodList};

use std::collections::BTreeMap;

#[test]
fn test_rsyncd_config_wire_format() {
    let config = rsync::rsyncd_config("app", &["data".to_string()]);

    // Documented format: one module per PVC rooted at /mnt/<ns>/<pvc>,
    // auth user root, secrets file, localhost-only.
    let expected_lines = [
        "auth users = root",
        "secrets file = /etc/rsyncd.secrets",
        "hosts allow = ::1, 127.0.0.1, localhost",
        "[data]",
        "    path = /mnt/app/data",
        "    read only = false",
    ];
    for line in expected_lines {
        assert!(config.contains(line), "missing {line:?} in:\n{config}");
    }
}

#[test]
fn test_client_pod_destination_uri() {
    let pod = rsync::client_pod("app", "data", "172.30.4.12", "secret", "img");
    let command = pod.spec.unwrap().containers[0].command.clone().unwrap();
    assert_eq!(command.last().unwrap(), "rsync://root@172.30.4.12/data");
    assert!(command.contains(&"--partial".to_string()));
    assert!(command.contains(&"--hard-links".to_string()));
}

#[test]
fn test_tunnel_port_is_2222() {
    let service = rsync::transfer_service("app");
    let port = service.spec.unwrap().ports.unwrap()[0].port;
    assert_eq!(port, 2222);

    let route = rsync::transfer_route("app");
    assert_eq!(route.spec.port.unwrap().target_port, 2222);
}

#[test]
fn test_progress_excerpt_parses_every_line() {
    // Twenty repetitions of a real rsync log line, each expected to yield
    // a line ending in the progress report plus two timestamp characters.
    let line = "          1.65G  94%   40.95MB/s    0:00:38 (xfr#139, to-chk=23/163)2020/11/03 23:16:34 [1] <f+++++++++ file76";
    let log = [line; 20].join("\n");

    let parsed = parse_progress_lines(&log);
    assert_eq!(parsed.len(), 20);
    for parsed_line in &parsed {
        assert!(parsed_line.ends_with("(xfr#139, to-chk=23/163)20"), "{parsed_line}");
    }
}

#[test]
fn test_cumulative_progress_over_transfers() {
    let status = |name: &str, pct: &str| RsyncPodStatus {
        pod_name: name.to_string(),
        last_observed_progress_percent: pct.to_string(),
        ..Default::default()
    };

    // Five transfers, one malformed: the malformed entry still counts in
    // the denominator.
    let statuses = vec![
        status("transfer-a", "100%"),
        status("transfer-b", "50%"),
        status("transfer-c", "25%"),
        status("transfer-d", "not-yet"),
        status("transfer-e", "75%"),
    ];
    assert_eq!(cumulative_progress_percentage(&statuses), "50%");
}

#[test]
fn test_stage_pod_build_is_idempotent() {
    use k8s_openapi::api::core::v1::{
        Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use migration_operator::crd::{PlanPv, PvSelection, PvcRef};

    let pod = Pod {
        metadata: ObjectMeta {
            namespace: Some("app".to_string()),
            name: Some("web-0".to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/data".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: "data".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pvc = PvcRef {
        namespace: "app".to_string(),
        name: "data".to_string(),
    };
    let mapping = BTreeMap::from([(
        pvc.clone(),
        PlanPv {
            name: "pv-data".to_string(),
            pvc,
            selection: PvSelection::default(),
            ..Default::default()
        },
    )]);

    // BuildStagePods over its own output changes nothing.
    let first = build_stage_pods(&BTreeMap::new(), &mapping, &[pod], "img", &BTreeMap::new());
    assert_eq!(first.len(), 1);

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
    assert_eq!(merged.len(), 1);
}
