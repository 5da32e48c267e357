//! Volume usage collection through the BR engine's node agents.
//!
//! The restic daemonset mounts every pod volume on its node under
//! `/host_pods`, so running `df` inside the restic pod of a node reports
//! real usage for the claims scheduled there. The sweep fans out one task
//! per node, funnels results through a bounded channel into a shared map,
//! and joins before returning; a node without a restic pod degrades to
//! per-claim errors instead of failing the sweep.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, AttachParams, ListParams};
use kube::ResourceExt;
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::compat::CompatClient;
use crate::controller::error::Result;

/// Restic pod discovery labels.
const RESTIC_POD_LABEL_KEY: &str = "name";
const RESTIC_POD_LABEL_VALUE: &str = "restic";

/// Where the restic pod mounts node-local pod volumes.
const BASE_LOCATION: &str = "/host_pods";

/// Block size passed to df; sizes come back in MB.
const BLOCK_SIZE: &str = "1M";

/// At most this many in-flight results queue before senders wait.
const RESULT_BUFFER: usize = 10;

/// A claim to measure, with enough context to locate its mount inside the
/// restic pod.
#[derive(Clone, Debug)]
pub struct PvDetails {
    pub name: String,
    pub namespace: String,
    /// Name of the bound PersistentVolume.
    pub volume_name: String,
    /// UID of the pod mounting the claim on this node.
    pub pod_uid: String,
}

/// Usage measured for one claim.
#[derive(Clone, Debug, Default)]
pub struct DfOutput {
    pub name: String,
    pub namespace: String,
    pub node: String,
    pub is_error: bool,
    /// Used megabytes, when the df line parsed.
    pub usage_mb: Option<i64>,
    /// Available megabytes, when the df line parsed.
    pub available_mb: Option<i64>,
}

/// One df invocation's raw output for a node.
#[derive(Clone, Debug, Default)]
pub struct DfCommand {
    pub stdout: String,
    pub stderr: String,
}

impl DfCommand {
    /// Find the df row for a claim by its pod UID and volume name.
    pub fn output_for_pv(&self, volume_name: &str, pod_uid: &str) -> DfOutput {
        for line in self.stdout.lines() {
            if !line.contains(volume_name) || !line.contains(pod_uid) {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            // Filesystem / blocks / used / available / use% / mounted-on
            if fields.len() >= 4 {
                let used = fields[2].trim_end_matches('M').parse().ok();
                let available = fields[3].trim_end_matches('M').parse().ok();
                return DfOutput {
                    usage_mb: used,
                    available_mb: available,
                    is_error: used.is_none(),
                    ..Default::default()
                };
            }
        }
        DfOutput {
            is_error: true,
            ..Default::default()
        }
    }
}

/// Runs `df` through restic pods, one node at a time, concurrently.
pub struct ResticDfExecutor {
    /// Namespace the restic daemonset runs in.
    pub namespace: String,
    /// Client for the cluster being measured.
    pub client: CompatClient,
    /// Restic pod per node, loaded once per sweep.
    pod_references: HashMap<String, Pod>,
}

impl ResticDfExecutor {
    pub fn new(namespace: String, client: CompatClient) -> Self {
        Self {
            namespace,
            client,
            pod_references: HashMap::new(),
        }
    }

    /// Measure every claim in the node map. Nodes run concurrently; the
    /// call returns only after every node has reported.
    pub async fn execute(
        &mut self,
        pvc_node_map: HashMap<String, Vec<PvDetails>>,
    ) -> Result<Vec<DfOutput>> {
        self.load_restic_pod_references().await?;

        let mut gathered = Vec::new();
        let outputs: Arc<Mutex<HashMap<String, DfCommand>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (sender, mut receiver) = mpsc::channel::<(String, DfCommand)>(RESULT_BUFFER);

        let collector = {
            let outputs = outputs.clone();
            tokio::spawn(async move {
                while let Some((node, output)) = receiver.recv().await {
                    outputs.lock().await.insert(node, output);
                }
            })
        };

        let mut tasks = JoinSet::new();
        for (node, pvs) in &pvc_node_map {
            let Some(pod) = self.pod_references.get(node) else {
                // No restic pod on this node: every claim there reports an
                // error instead of failing the sweep.
                for pv in pvs {
                    gathered.push(DfOutput {
                        is_error: true,
                        name: pv.name.clone(),
                        namespace: pv.namespace.clone(),
                        node: node.clone(),
                        ..Default::default()
                    });
                }
                continue;
            };

            let client = self.client.clone();
            let namespace = self.namespace.clone();
            let pod_name = pod.name_any();
            let node = node.clone();
            let pvs = pvs.clone();
            let sender = sender.clone();
            tasks.spawn(async move {
                let output = run_df(&client, &namespace, &pod_name, &pvs).await;
                // A full buffer backpressures here rather than hammering
                // the API server with concurrent exec streams.
                let _ = sender.send((node, output)).await;
            });
        }
        drop(sender);

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "df task panicked");
            }
        }
        let _ = collector.await;

        let outputs = outputs.lock().await;
        for (node, pvs) in &pvc_node_map {
            let Some(command) = outputs.get(node) else {
                continue;
            };
            for pv in pvs {
                let mut info = command.output_for_pv(&pv.volume_name, &pv.pod_uid);
                info.node = node.clone();
                info.name = pv.name.clone();
                info.namespace = pv.namespace.clone();
                gathered.push(info);
            }
        }
        Ok(gathered)
    }

    /// Cache the restic pod serving each node.
    async fn load_restic_pod_references(&mut self) -> Result<()> {
        let params = ListParams::default()
            .labels(&format!("{RESTIC_POD_LABEL_KEY}={RESTIC_POD_LABEL_VALUE}"));
        let pods = self.client.list::<Pod>(&self.namespace, &params).await?;
        for pod in pods {
            if let Some(node) = pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                self.pod_references.insert(node, pod);
            }
        }
        info!(nodes = self.pod_references.len(), "Restic pods loaded");
        Ok(())
    }
}

/// Exec df inside a restic pod. Errors are folded into stderr; the caller
/// decides per-claim from the parsed rows.
async fn run_df(
    client: &CompatClient,
    namespace: &str,
    pod_name: &str,
    pvs: &[PvDetails],
) -> DfCommand {
    let mut paths = Vec::new();
    for pv in pvs {
        paths.push(format!(
            "{BASE_LOCATION}/{}/volumes/*/{}",
            pv.pod_uid, pv.volume_name
        ));
    }
    let script = format!("df -B {BLOCK_SIZE} {}", paths.join(" "));
    let command = vec!["/bin/bash".to_string(), "-c".to_string(), script];

    let pods: Api<Pod> = Api::namespaced(client.raw().clone(), namespace);
    let params = AttachParams::default().stderr(true);
    let mut output = DfCommand::default();
    match pods.exec(pod_name, command, &params).await {
        Ok(mut process) => {
            if let Some(mut stdout) = process.stdout() {
                let mut buffer = String::new();
                let mut reader = tokio::io::BufReader::new(&mut stdout);
                if reader.read_to_string(&mut buffer).await.is_ok() {
                    output.stdout = buffer;
                }
            }
            if let Some(mut stderr) = process.stderr() {
                let mut buffer = String::new();
                let mut reader = tokio::io::BufReader::new(&mut stderr);
                if reader.read_to_string(&mut buffer).await.is_ok() {
                    output.stderr = buffer;
                }
            }
            let _ = process.join().await;
        }
        Err(e) => {
            info!(pod = %pod_name, "df command inside pod returned non-zero error code");
            output.stderr = e.to_string();
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_for_pv_parses_row() {
        let command = DfCommand {
            stdout: "\
Filesystem     1M-blocks  Used Available Use% Mounted on
/dev/sdb            5120M  1024M     4096M  20% /host_pods/uid-1/volumes/kubernetes.io~csi/pv-data
"
            .to_string(),
            stderr: String::new(),
        };
        let output = command.output_for_pv("pv-data", "uid-1");
        assert!(!output.is_error);
        assert_eq!(output.usage_mb, Some(1024));
        assert_eq!(output.available_mb, Some(4096));
    }

    #[test]
    fn test_output_for_pv_missing_row() {
        let command = DfCommand::default();
        let output = command.output_for_pv("pv-data", "uid-1");
        assert!(output.is_error);
    }

    #[test]
    fn test_output_for_pv_requires_matching_uid() {
        let command = DfCommand {
            stdout: "/dev/sdb 5120M 1024M 4096M 20% /host_pods/uid-2/volumes/kubernetes.io~csi/pv-data".to_string(),
            stderr: String::new(),
        };
        let output = command.output_for_pv("pv-data", "uid-1");
        assert!(output.is_error);
    }
}
