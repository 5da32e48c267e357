//! DirectVolumeMigrationProgress controller: the transfer progress
//! reporter.
//!
//! Runs independently of the transfer itinerary. For each progress
//! resource it opens a log stream on the referenced rsync client pod,
//! parses the rsync progress lines, and writes the latest percent, rate,
//! and pod phase back to status. The transfer engine consumes only these
//! summary fields and never touches raw logs.

use std::sync::Arc;
use std::time::Duration;

use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

use crate::crd::direct_volume::RsyncPodStatus;
use crate::crd::{DirectVolumeMigrationProgress, MigCluster};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};

/// Requeue cadence while a transfer is live. Local to this controller.
pub const PROGRESS_POLL: Duration = Duration::from_secs(5);

/// How many parsed lines are kept in the status log tail.
const LOG_TAIL_LINES: usize = 5;

/// Reconcile one progress resource: observe the pod, parse its logs,
/// update the summary.
pub async fn reconcile(
    obj: Arc<DirectVolumeMigrationProgress>,
    ctx: Arc<Context>,
) -> Result<Action> {
    let started = std::time::Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(name = %name, namespace = %namespace, "Reconciling transfer progress");

    let api: Api<DirectVolumeMigrationProgress> =
        Api::namespaced(ctx.client.clone(), &namespace);
    let mut progress = (*obj).clone();

    let Some(pod_ref) = progress.spec.pod_ref.clone() else {
        return Ok(Action::await_change());
    };
    let Some(cluster_ref) = progress.spec.cluster_ref.clone() else {
        return Ok(Action::await_change());
    };

    let clusters: Api<MigCluster> = Api::namespaced(ctx.client.clone(), &cluster_ref.namespace);
    let cluster = clusters.get(&cluster_ref.name).await?;
    let client = ctx.registry.client_for(&cluster).await?;

    let pods: Api<Pod> = Api::namespaced(client.raw().clone(), &pod_ref.namespace);
    let Some(pod) = pods.get_opt(&pod_ref.name).await? else {
        // The pod may not be scheduled yet, or teardown already removed it.
        return Ok(Action::requeue(PROGRESS_POLL));
    };

    let pod_phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();

    let mut observed = observe_pod(&pods, &pod, &pod_phase).await?;

    let status = progress.status.get_or_insert_with(Default::default);

    // Progress is monotone while the pod is alive; a parse glitch must
    // not walk the percent backwards.
    if matches!(pod_phase.as_str(), "Pending" | "Running")
        && percent_value(&observed.last_observed_progress_percent)
            < percent_value(&status.rsync_pod_status.last_observed_progress_percent)
    {
        observed.last_observed_progress_percent =
            status.rsync_pod_status.last_observed_progress_percent.clone();
    }

    status.rsync_pod_status = observed.clone();
    match status
        .rsync_pod_statuses
        .iter_mut()
        .find(|s| s.pod_name == observed.pod_name)
    {
        Some(existing) => *existing = observed,
        None => status.rsync_pod_statuses.push(observed),
    }
    status.cumulative_progress_percentage =
        cumulative_progress_percentage(&status.rsync_pod_statuses);
    status.observed_generation = progress.metadata.generation;

    let patch = serde_json::json!({ "status": &progress.status });
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    if let Some(state) = &ctx.health_state {
        state
            .metrics
            .record_reconcile("directvolumemigrationprogress", started.elapsed().as_secs_f64());
        state.mark_reconciled();
    }

    match pod_phase.as_str() {
        "Succeeded" | "Failed" => Ok(Action::await_change()),
        _ => Ok(Action::requeue(PROGRESS_POLL)),
    }
}

/// Error policy for the controller.
pub fn error_policy(
    obj: Arc<DirectVolumeMigrationProgress>,
    error: &Error,
    ctx: Arc<Context>,
) -> Action {
    error!(name = %obj.name_any(), error = %error, "Reconciliation failed");
    if let Some(state) = &ctx.health_state {
        state.metrics.record_error("directvolumemigrationprogress");
    }
    Action::requeue(error.requeue_after())
}

/// Stream the pod's logs and fold them into a status snapshot.
async fn observe_pod(pods: &Api<Pod>, pod: &Pod, pod_phase: &str) -> Result<RsyncPodStatus> {
    let mut status = RsyncPodStatus {
        pod_name: pod.name_any(),
        pod_phase: pod_phase.to_string(),
        ..Default::default()
    };

    if let Some(container_status) = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        && let Some(terminated) = container_status
            .state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
    {
        status.exit_code = Some(terminated.exit_code);
    }

    let params = LogParams {
        follow: false,
        ..Default::default()
    };
    let mut lines: Vec<String> = Vec::new();
    match pods.log_stream(&pod.name_any(), &params).await {
        Ok(stream) => {
            let mut reader = stream.lines();
            while let Some(line) = reader
                .try_next()
                .await
                .map_err(|e| Error::Transient(format!("log stream: {e}")))?
            {
                if let Some(parsed) = parse_progress_line(&line) {
                    lines.push(parsed);
                }
            }
        }
        Err(e) => {
            // Logs disappear with the pod; report what we have.
            warn!(pod = %pod.name_any(), error = %e, "Failed to stream pod logs");
        }
    }

    if let Some(last) = lines.last() {
        if let Some(percent) = extract_percent(last) {
            status.last_observed_progress_percent = percent;
        }
        if let Some(rate) = extract_rate(last) {
            status.last_observed_transfer_rate = rate;
        }
    }
    let tail_start = lines.len().saturating_sub(LOG_TAIL_LINES);
    status.log_message = lines[tail_start..].join("\n");

    Ok(status)
}

fn progress_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(\S+\s+\d+%\s+\S+\s+\S+\s+\(xfr#\d+, to-chk=\d+/\d+\))")
            .expect("static regex compiles")
    })
}

/// Parse one log line: keep the progress report up to the closing paren
/// plus two trailing characters (the start of rsync's next log
/// timestamp), or `None` for non-progress lines.
pub fn parse_progress_line(line: &str) -> Option<String> {
    let captures = progress_regex().captures(line)?;
    let matched = captures.get(1)?;
    let tail = &line[matched.end()..];
    let extra: String = tail.chars().take(2).collect();
    Some(format!("{}{extra}", matched.as_str()))
}

/// Parse a whole log excerpt into progress lines.
pub fn parse_progress_lines(log: &str) -> Vec<String> {
    log.lines().filter_map(parse_progress_line).collect()
}

/// The percent token of a progress line, `%` suffix retained.
pub fn extract_percent(line: &str) -> Option<String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"(\d+)%").expect("static regex compiles"));
    regex.captures(line).map(|c| format!("{}%", &c[1]))
}

/// The transfer rate token of a progress line.
pub fn extract_rate(line: &str) -> Option<String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex =
        REGEX.get_or_init(|| Regex::new(r"(\S+/s)").expect("static regex compiles"));
    regex.captures(line).map(|c| c[1].to_string())
}

fn percent_value(percent: &str) -> i64 {
    percent.trim_end_matches('%').parse().unwrap_or(0)
}

/// Mean percent across distinct observed pods, floored, rendered with a
/// `%` suffix. Pods with an unparseable percent count toward the
/// denominator but contribute nothing to the sum.
pub fn cumulative_progress_percentage(statuses: &[RsyncPodStatus]) -> String {
    let mut seen = std::collections::BTreeSet::new();
    let mut sum: i64 = 0;
    let mut total: i64 = 0;
    for status in statuses {
        if !seen.insert(status.pod_name.clone()) {
            continue;
        }
        total += 1;
        if let Ok(value) = status
            .last_observed_progress_percent
            .trim_end_matches('%')
            .parse::<i64>()
            && !status.last_observed_progress_percent.is_empty()
        {
            sum += value;
        }
    }
    if total == 0 {
        return "0%".to_string();
    }
    format!("{}%", sum / total)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LINE: &str = "          1.65G  94%   40.95MB/s    0:00:38 (xfr#139, to-chk=23/163)2020/11/03 23:16:34 [1] <f+++++++++ file76";

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_line(SAMPLE_LINE).as_deref(),
            Some("1.65G  94%   40.95MB/s    0:00:38 (xfr#139, to-chk=23/163)20")
        );
    }

    #[test]
    fn test_parse_skips_non_progress_lines() {
        assert_eq!(parse_progress_line("building file list ..."), None);
        assert_eq!(
            parse_progress_line("2020/11/03 23:16:34 [1] <f+++++++++ file76"),
            None
        );
    }

    #[test]
    fn test_parse_repeated_excerpt() {
        let log = [SAMPLE_LINE; 20].join("\n");
        let parsed = parse_progress_lines(&log);
        assert_eq!(parsed.len(), 20);
        for line in parsed {
            assert!(line.ends_with("xfr#139, to-chk=23/163)20"), "{line}");
        }
    }

    #[test]
    fn test_extract_percent_and_rate() {
        let line = parse_progress_line(SAMPLE_LINE).unwrap();
        assert_eq!(extract_percent(&line).as_deref(), Some("94%"));
        assert_eq!(extract_rate(&line).as_deref(), Some("40.95MB/s"));
    }

    fn pod_status(name: &str, percent: &str) -> RsyncPodStatus {
        RsyncPodStatus {
            pod_name: name.to_string(),
            last_observed_progress_percent: percent.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_cumulative_mean_of_distinct_pods() {
        let statuses = vec![
            pod_status("pod-1", "0%"),
            pod_status("pod-2", "10%"),
            pod_status("pod-3", "20%"),
            pod_status("pod-4", "10%"),
        ];
        assert_eq!(cumulative_progress_percentage(&statuses), "10%");
    }

    #[test]
    fn test_cumulative_same_pod_not_counted_twice() {
        let statuses = vec![
            pod_status("pod-1", "0%"),
            pod_status("pod-2", "10%"),
            pod_status("pod-3", "10%"),
            pod_status("pod-3", "10%"),
        ];
        // Distinct pods: 0 + 10 + 10 over 3.
        assert_eq!(cumulative_progress_percentage(&statuses), "6%");
    }

    #[test]
    fn test_cumulative_malformed_counts_in_denominator() {
        let statuses = vec![
            pod_status("pod-1", "20%"),
            pod_status("pod-2", "A%"),
            pod_status("pod-3", ""),
            pod_status("pod-4", "10%"),
        ];
        // 30 over 4 pods, floored.
        assert_eq!(cumulative_progress_percentage(&statuses), "7%");
    }

    #[test]
    fn test_cumulative_empty() {
        assert_eq!(cumulative_progress_percentage(&[]), "0%");
    }
}
