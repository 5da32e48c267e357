//! Builders for the rsync transfer machinery.
//!
//! Volume data moves source-to-destination through an rsync daemon behind a
//! TLS tunnel. The destination side of each migrated namespace gets one
//! transfer pod (rsyncd + stunnel), its configuration, a service, and an
//! externally reachable passthrough route. The source side gets one
//! one-shot client pod per PVC so failures stay isolated per volume.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, KeyToPath, Pod, PodSpec,
    PersistentVolumeClaimVolumeSource, Secret, SecretVolumeSource, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use rand::Rng;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use thiserror::Error;

use crate::crd::route::{Route, RoutePort, RouteSpec, RouteTargetReference, RouteTls, TLS_TERMINATION_PASSTHROUGH};

/// App label shared by every transfer resource; teardown selects on it.
pub const RSYNC_APP_KEY: &str = "app";
pub const RSYNC_APP_VALUE: &str = "directvolumemigration-rsync-transfer";

const OWNER_KEY: &str = "owner";
const OWNER_VALUE: &str = "directvolumemigration";
const PURPOSE_KEY: &str = "purpose";
const PURPOSE_VALUE: &str = "rsync";

/// Resource names, fixed per namespace.
pub const RSYNCD_CONFIG_NAME: &str = "directvolumemigration-rsync-config";
pub const RSYNC_CREDS_NAME: &str = "directvolumemigration-rsync-creds";
pub const STUNNEL_CONFIG_NAME: &str = "directvolumemigration-stunnel-config";
pub const STUNNEL_CERTS_NAME: &str = "directvolumemigration-stunnel-certs";
pub const RSYNC_PASSWORD_SECRET_NAME: &str = "directvolumemigration-rsync-pass";
pub const TRANSFER_POD_NAME: &str = "directvolumemigration-rsync-transfer";
pub const TRANSFER_SVC_NAME: &str = "directvolumemigration-rsync-transfer-svc";
pub const TRANSFER_ROUTE_NAME: &str = "directvolumemigration-rsync-transfer-route";

/// Ports: stunnel terminates TLS on 2222 and forwards to rsyncd on 22.
pub const STUNNEL_PORT: i32 = 2222;
pub const RSYNCD_PORT: i32 = 22;

/// The single rsync user the daemon authenticates.
pub const RSYNC_USER: &str = "root";

/// Name of the client pod (and its progress resource) for a PVC.
pub fn client_pod_name(pvc: &str) -> String {
    format!("directvolumemigration-rsync-transfer-{pvc}")
}

/// Full label set for transfer pods; the service selector matches it.
pub fn transfer_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(RSYNC_APP_KEY.to_string(), RSYNC_APP_VALUE.to_string());
    labels.insert(OWNER_KEY.to_string(), OWNER_VALUE.to_string());
    labels.insert(PURPOSE_KEY.to_string(), PURPOSE_VALUE.to_string());
    labels
}

/// App-only label set for configuration objects and cleanup selection.
pub fn app_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(RSYNC_APP_KEY.to_string(), RSYNC_APP_VALUE.to_string());
    labels
}

/// Render the rsync daemon configuration: one module per PVC rooted at
/// `/mnt/<namespace>/<pvc>`, a single authenticated user, localhost-only.
pub fn rsyncd_config(namespace: &str, pvcs: &[String]) -> String {
    let mut config = String::new();
    config.push_str("syslog facility = local7\n");
    config.push_str("read only = no\n");
    config.push_str("list = yes\n");
    config.push_str("max = 3\n");
    config.push_str(&format!("auth users = {RSYNC_USER}\n"));
    config.push_str("secrets file = /etc/rsyncd.secrets\n");
    config.push_str("hosts allow = ::1, 127.0.0.1, localhost\n");
    config.push_str("uid = root\n");
    config.push_str("gid = root\n");
    for pvc in pvcs {
        config.push_str(&format!("[{pvc}]\n"));
        config.push_str(&format!("    comment = archive for {pvc}\n"));
        config.push_str(&format!("    path = /mnt/{namespace}/{pvc}\n"));
        config.push_str("    uid = root\n");
        config.push_str("    gid = root\n");
        config.push_str("    list = yes\n");
        config.push_str("    hosts allow = ::1, 127.0.0.1, localhost\n");
        config.push_str(&format!("    auth users = {RSYNC_USER}\n"));
        config.push_str("    secrets file = /etc/rsyncd.secrets\n");
        config.push_str("    read only = false\n");
    }
    config
}

/// Render the stunnel server configuration for the tunnel sidecar.
pub fn stunnel_server_config() -> String {
    [
        "foreground = yes",
        "pid =",
        "socket = l:TCP_NODELAY=1",
        "socket = r:TCP_NODELAY=1",
        "",
        "[rsync]",
        &format!("accept = {STUNNEL_PORT}"),
        &format!("connect = 127.0.0.1:{RSYNCD_PORT}"),
        "key = /etc/stunnel/certs/tls.key",
        "cert = /etc/stunnel/certs/tls.crt",
    ]
    .join("\n")
}

/// Generate the rsync password: six mixed-case letters.
pub fn generate_password() -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Key size for the tunnel key pair.
const TRANSFER_KEY_BITS: usize = 4096;

/// Errors generating tunnel certificate material.
#[derive(Debug, Error)]
pub enum TransferCertError {
    /// RSA key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    /// Key could not be encoded to PKCS#8.
    #[error("key encoding failed: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),

    /// Certificate generation failed.
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
}

/// Self-signed certificate material for the TLS tunnel.
pub struct TransferCerts {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a fresh 4096-bit RSA key pair and self-signed certificate for
/// the tunnel. One set per migration; both ends trust the same
/// certificate because the route is TLS passthrough.
pub fn generate_transfer_certs(hosts: Vec<String>) -> Result<TransferCerts, TransferCertError> {
    let mut subject_alt_names = hosts;
    subject_alt_names.push("localhost".to_string());

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, TRANSFER_KEY_BITS)?;
    let key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?;

    let key_pair = rcgen::KeyPair::from_pem(&key_pem)?;
    let params = rcgen::CertificateParams::new(subject_alt_names)?;
    let cert = params.self_signed(&key_pair)?;

    Ok(TransferCerts {
        cert_pem: cert.pem(),
        key_pem: key_pem.to_string(),
    })
}

/// Secret on the controller's host cluster holding the generated password.
pub fn password_secret(controller_namespace: &str, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(RSYNC_PASSWORD_SECRET_NAME.to_string()),
            namespace: Some(controller_namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/basic-auth".to_string()),
        string_data: Some(BTreeMap::from([(
            "password".to_string(),
            password.to_string(),
        )])),
        ..Default::default()
    }
}

/// rsync daemon configmap for one destination namespace.
pub fn rsyncd_config_map(namespace: &str, pvcs: &[String]) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(RSYNCD_CONFIG_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "rsyncd.conf".to_string(),
            rsyncd_config(namespace, pvcs),
        )])),
        ..Default::default()
    }
}

/// stunnel configmap for one destination namespace.
pub fn stunnel_config_map(namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(STUNNEL_CONFIG_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "stunnel.conf".to_string(),
            stunnel_server_config(),
        )])),
        ..Default::default()
    }
}

/// Tunnel certificate secret for one destination namespace.
pub fn stunnel_certs_secret(namespace: &str, certs: &TransferCerts) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(STUNNEL_CERTS_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([
            (
                "tls.crt".to_string(),
                ByteString(certs.cert_pem.clone().into_bytes()),
            ),
            (
                "tls.key".to_string(),
                ByteString(certs.key_pem.clone().into_bytes()),
            ),
            (
                "ca.crt".to_string(),
                ByteString(certs.cert_pem.clone().into_bytes()),
            ),
        ])),
        ..Default::default()
    }
}

/// Source-side credentials: the raw password, injected into client pods.
pub fn source_creds_secret(namespace: &str, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(RSYNC_CREDS_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "RSYNC_PASSWORD".to_string(),
            ByteString(password.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

/// Destination-side credentials: `user:password`, mounted as the daemon's
/// secrets file.
pub fn dest_creds_secret(namespace: &str, password: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(RSYNC_CREDS_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "credentials".to_string(),
            ByteString(format!("{RSYNC_USER}:{password}").into_bytes()),
        )])),
        ..Default::default()
    }
}

fn privileged_context() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        run_as_user: Some(0),
        read_only_root_filesystem: Some(true),
        ..Default::default()
    }
}

/// The transfer pod for one destination namespace: rsyncd + stunnel,
/// mounting every migrated PVC in that namespace.
pub fn transfer_pod(namespace: &str, pvcs: &[String], image: &str) -> Pod {
    let mode = 0o600;

    let mut volumes = vec![
        Volume {
            name: "stunnel-conf".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: STUNNEL_CONFIG_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "stunnel-certs".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(STUNNEL_CERTS_NAME.to_string()),
                items: Some(vec![
                    KeyToPath {
                        key: "tls.crt".to_string(),
                        path: "tls.crt".to_string(),
                        ..Default::default()
                    },
                    KeyToPath {
                        key: "ca.crt".to_string(),
                        path: "ca.crt".to_string(),
                        ..Default::default()
                    },
                    KeyToPath {
                        key: "tls.key".to_string(),
                        path: "tls.key".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "rsync-creds".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(RSYNC_CREDS_NAME.to_string()),
                default_mode: Some(mode),
                items: Some(vec![KeyToPath {
                    key: "credentials".to_string(),
                    path: "rsyncd.secrets".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "rsyncd-conf".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: RSYNCD_CONFIG_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];

    let mut rsyncd_mounts = vec![
        VolumeMount {
            name: "rsyncd-conf".to_string(),
            mount_path: "/etc/rsyncd.conf".to_string(),
            sub_path: Some("rsyncd.conf".to_string()),
            ..Default::default()
        },
        VolumeMount {
            name: "rsync-creds".to_string(),
            mount_path: "/etc/rsyncd.secrets".to_string(),
            sub_path: Some("rsyncd.secrets".to_string()),
            ..Default::default()
        },
    ];

    for pvc in pvcs {
        rsyncd_mounts.push(VolumeMount {
            name: pvc.clone(),
            mount_path: format!("/mnt/{namespace}/{pvc}"),
            ..Default::default()
        });
        volumes.push(Volume {
            name: pvc.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(TRANSFER_POD_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(transfer_labels()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(volumes),
            containers: vec![
                Container {
                    name: "rsyncd".to_string(),
                    image: Some(image.to_string()),
                    command: Some(
                        ["/usr/bin/rsync", "--daemon", "--no-detach", "--port=22", "-vvv"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    ),
                    ports: Some(vec![ContainerPort {
                        name: Some("rsyncd".to_string()),
                        container_port: RSYNCD_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    volume_mounts: Some(rsyncd_mounts),
                    security_context: Some(privileged_context()),
                    ..Default::default()
                },
                Container {
                    name: "stunnel".to_string(),
                    image: Some(image.to_string()),
                    command: Some(
                        ["/bin/stunnel", "/etc/stunnel/stunnel.conf"]
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    ),
                    ports: Some(vec![ContainerPort {
                        name: Some("stunnel".to_string()),
                        container_port: STUNNEL_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "stunnel-conf".to_string(),
                            mount_path: "/etc/stunnel/stunnel.conf".to_string(),
                            sub_path: Some("stunnel.conf".to_string()),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "stunnel-certs".to_string(),
                            mount_path: "/etc/stunnel/certs".to_string(),
                            ..Default::default()
                        },
                    ]),
                    security_context: Some(privileged_context()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service fronting the stunnel port of the transfer pod.
pub fn transfer_service(namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(TRANSFER_SVC_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some("stunnel".to_string()),
                protocol: Some("TCP".to_string()),
                port: STUNNEL_PORT,
                target_port: Some(IntOrString::Int(STUNNEL_PORT)),
                ..Default::default()
            }]),
            selector: Some(transfer_labels()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Externally reachable route with TLS passthrough to the tunnel port.
pub fn transfer_route(namespace: &str) -> Route {
    Route::new(
        TRANSFER_ROUTE_NAME,
        RouteSpec {
            to: RouteTargetReference {
                kind: "Service".to_string(),
                name: TRANSFER_SVC_NAME.to_string(),
            },
            port: Some(RoutePort {
                target_port: STUNNEL_PORT,
            }),
            tls: Some(RouteTls {
                termination: TLS_TERMINATION_PASSTHROUGH.to_string(),
            }),
            ..Default::default()
        },
    )
    .within(namespace)
    .with_labels(app_labels())
}

trait RouteExt {
    fn within(self, namespace: &str) -> Self;
    fn with_labels(self, labels: BTreeMap<String, String>) -> Self;
}

impl RouteExt for Route {
    fn within(mut self, namespace: &str) -> Self {
        self.metadata.namespace = Some(namespace.to_string());
        self
    }

    fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.metadata.labels = Some(labels);
        self
    }
}

/// One-shot client pod copying a single PVC to the destination service.
pub fn client_pod(namespace: &str, pvc: &str, svc_ip: &str, password: &str, image: &str) -> Pod {
    let mut labels = app_labels();
    labels.insert(
        "directvolumemigration".to_string(),
        "rsync-client".to_string(),
    );

    Pod {
        metadata: ObjectMeta {
            name: Some(client_pod_name(pvc)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![Volume {
                name: pvc.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            containers: vec![Container {
                name: "rsync-client".to_string(),
                image: Some(image.to_string()),
                env: Some(vec![EnvVar {
                    name: "RSYNC_PASSWORD".to_string(),
                    value: Some(password.to_string()),
                    ..Default::default()
                }]),
                termination_message_policy: Some("FallbackToLogsOnError".to_string()),
                command: Some(vec![
                    "rsync".to_string(),
                    "--archive".to_string(),
                    "--hard-links".to_string(),
                    "--human-readable".to_string(),
                    "--partial".to_string(),
                    "--delete".to_string(),
                    "--port".to_string(),
                    STUNNEL_PORT.to_string(),
                    "--log-file".to_string(),
                    "/dev/stdout".to_string(),
                    "--info=COPY2,DEL2,REMOVE2,SKIP2,FLIST2,PROGRESS2,STATS2".to_string(),
                    format!("/mnt/{namespace}/{pvc}/"),
                    format!("rsync://{RSYNC_USER}@{svc_ip}/{pvc}"),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: pvc.to_string(),
                    mount_path: format!("/mnt/{namespace}/{pvc}"),
                    ..Default::default()
                }]),
                security_context: Some(privileged_context()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsyncd_config_module_per_pvc() {
        let config = rsyncd_config("app", &["data".to_string(), "cache".to_string()]);
        assert!(config.contains("auth users = root"));
        assert!(config.contains("secrets file = /etc/rsyncd.secrets"));
        assert!(config.contains("hosts allow = ::1, 127.0.0.1, localhost"));
        assert!(config.contains("[data]"));
        assert!(config.contains("path = /mnt/app/data"));
        assert!(config.contains("[cache]"));
        assert!(config.contains("path = /mnt/app/cache"));
    }

    #[test]
    fn test_generate_password_shape() {
        for _ in 0..32 {
            let password = generate_password();
            assert_eq!(password.len(), 6);
            assert!(password.chars().all(|c| c.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn test_transfer_pod_mounts_every_pvc() {
        let pod = transfer_pod("app", &["data".to_string(), "cache".to_string()], "img");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 2);

        let rsyncd = &spec.containers[0];
        let mounts = rsyncd.volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == "/mnt/app/data"));
        assert!(mounts.iter().any(|m| m.mount_path == "/mnt/app/cache"));

        let stunnel = &spec.containers[1];
        assert_eq!(
            stunnel.ports.as_ref().unwrap()[0].container_port,
            STUNNEL_PORT
        );
    }

    #[test]
    fn test_client_pod_is_one_shot_single_pvc() {
        let pod = client_pod("app", "data", "10.0.0.5", "hunter", "img");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.volumes.as_ref().unwrap().len(), 1);

        let command = spec.containers[0].command.as_ref().unwrap();
        assert_eq!(
            command.last().unwrap(),
            "rsync://root@10.0.0.5/data"
        );
        assert!(command.contains(&"--archive".to_string()));
        assert!(command.contains(&"--delete".to_string()));
    }

    #[test]
    fn test_route_is_tls_passthrough() {
        let route = transfer_route("app");
        let tls = route.spec.tls.as_ref().unwrap();
        assert_eq!(tls.termination, TLS_TERMINATION_PASSTHROUGH);
        assert_eq!(route.spec.port.as_ref().unwrap().target_port, STUNNEL_PORT);
    }

    #[test]
    fn test_dest_creds_format() {
        let secret = dest_creds_secret("app", "hunter2");
        let data = secret.data.unwrap();
        assert_eq!(data["credentials"].0, b"root:hunter2");
    }
}
