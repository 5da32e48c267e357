//! Health probes and Prometheus metrics.
//!
//! Serves `/healthz`, `/readyz`, and `/metrics` on a fixed port. Readiness
//! flips on once leadership is acquired and the controllers are running.
//!
//! The metric families follow the shape of the work this operator does:
//! per-controller reconcile counters and latencies, task-engine phase
//! transitions and terminal outcomes, and the live rsync transfer and
//! stage pod population.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Port the probe and metrics server listens on.
pub const HEALTH_PORT: u16 = 8080;

/// Which of the four controllers a sample belongs to.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ControllerLabels {
    pub controller: &'static str,
}

impl EncodeLabelSet for ControllerLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("controller", self.controller).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// An itinerary step the task engine entered.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PhaseLabels {
    pub itinerary: String,
    pub phase: String,
}

impl EncodeLabelSet for PhaseLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("itinerary", self.itinerary.as_str()).encode(encoder.encode_label())?;
        ("phase", self.phase.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Terminal outcome of a migration.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabels {
    pub outcome: &'static str,
}

impl EncodeLabelSet for OutcomeLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// State of an rsync client pod.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TransferStateLabels {
    pub state: &'static str,
}

impl EncodeLabelSet for TransferStateLabels {
    fn encode(&self, mut encoder: LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("state", self.state).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Operator metrics, registered once and shared by every controller.
pub struct Metrics {
    /// Reconciliations per controller.
    pub reconciliations_total: Family<ControllerLabels, Counter>,
    /// Reconciliation failures per controller.
    pub reconciliation_errors_total: Family<ControllerLabels, Counter>,
    /// Reconcile latency per controller.
    pub reconcile_duration_seconds: Family<ControllerLabels, Histogram>,
    /// Itinerary steps entered by the task engine.
    pub phase_transitions_total: Family<PhaseLabels, Counter>,
    /// Migrations that reached a terminal phase, by outcome.
    pub migrations_completed_total: Family<OutcomeLabels, Counter>,
    /// Current rsync client pods by state (running/succeeded/failed).
    pub rsync_client_pods: Family<TransferStateLabels, Gauge>,
    /// Stage pods the engine currently accounts for.
    pub stage_pods: Gauge,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let reconciliations_total = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "migration_operator_reconciliations",
            "Reconciliations per controller",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "migration_operator_reconciliation_errors",
            "Reconciliation failures per controller",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "migration_operator_reconcile_duration_seconds",
            "Reconcile latency per controller",
            reconcile_duration_seconds.clone(),
        );

        let phase_transitions_total = Family::<PhaseLabels, Counter>::default();
        registry.register(
            "migration_operator_phase_transitions",
            "Itinerary steps entered by the migration task engine",
            phase_transitions_total.clone(),
        );

        let migrations_completed_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "migration_operator_migrations_completed",
            "Migrations that reached a terminal phase, by outcome",
            migrations_completed_total.clone(),
        );

        let rsync_client_pods = Family::<TransferStateLabels, Gauge>::default();
        registry.register(
            "migration_operator_rsync_client_pods",
            "Rsync client pods by state",
            rsync_client_pods.clone(),
        );

        let stage_pods = Gauge::default();
        registry.register(
            "migration_operator_stage_pods",
            "Stage pods currently held for volume capture",
            stage_pods.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            phase_transitions_total,
            migrations_completed_total,
            rsync_client_pods,
            stage_pods,
            registry,
        }
    }

    /// Count one reconcile and its latency for a controller.
    pub fn record_reconcile(&self, controller: &'static str, duration_secs: f64) {
        let labels = ControllerLabels { controller };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Count one failed reconcile for a controller.
    pub fn record_error(&self, controller: &'static str) {
        self.reconciliation_errors_total
            .get_or_create(&ControllerLabels { controller })
            .inc();
    }

    /// Count the task engine entering an itinerary step.
    pub fn record_phase_transition(&self, itinerary: &str, phase: &str) {
        self.phase_transitions_total
            .get_or_create(&PhaseLabels {
                itinerary: itinerary.to_string(),
                phase: phase.to_string(),
            })
            .inc();
    }

    /// Count a migration reaching a terminal phase.
    pub fn record_completion(&self, outcome: &'static str) {
        self.migrations_completed_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    /// Publish the rsync client pod population from a transfer rollup.
    pub fn set_rsync_client_pods(&self, running: i64, succeeded: i64, failed: i64) {
        for (state, count) in [
            ("running", running),
            ("succeeded", succeeded),
            ("failed", failed),
        ] {
            self.rsync_client_pods
                .get_or_create(&TransferStateLabels { state })
                .set(count);
        }
    }

    /// Publish the number of stage pods the engine accounts for.
    pub fn set_stage_pods(&self, count: i64) {
        self.stage_pods.set(count);
    }

    /// Encode everything in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared probe state.
pub struct HealthState {
    /// Flipped on after leadership is acquired and controllers start.
    ready: RwLock<bool>,
    /// Metrics registry.
    pub metrics: Metrics,
    /// Unix timestamp of the most recent reconcile, any controller.
    last_reconcile: AtomicU64,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
            last_reconcile: AtomicU64::new(0),
        }
    }

    /// Flip readiness. Called once on startup and again on shutdown.
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Stamp the most recent reconcile time.
    pub fn mark_reconciled(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.last_reconcile.store(now, Ordering::Relaxed);
    }

    /// Unix timestamp of the most recent reconcile; 0 before the first.
    pub fn last_reconcile(&self) -> u64 {
        self.last_reconcile.load(Ordering::Relaxed)
    }
}

/// Liveness: answering at all is the signal.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness: 200 once the controllers run, 503 before and during
/// shutdown so the endpoints drain.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.encode(),
    )
}

/// Build the probe router.
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve probes and metrics until the process exits.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], HEALTH_PORT));
    info!(port = HEALTH_PORT, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_metrics_per_controller() {
        let metrics = Metrics::new();
        metrics.record_reconcile("migmigration", 0.25);
        metrics.record_reconcile("directvolumemigration", 0.5);
        metrics.record_error("migmigration");

        let encoded = metrics.encode();
        assert!(encoded.contains("migration_operator_reconciliations"));
        assert!(encoded.contains("controller=\"migmigration\""));
        assert!(encoded.contains("controller=\"directvolumemigration\""));
        assert!(encoded.contains("migration_operator_reconciliation_errors"));
    }

    #[test]
    fn test_phase_transition_metrics() {
        let metrics = Metrics::new();
        metrics.record_phase_transition("Final", "EnsureInitialBackup");
        metrics.record_phase_transition("Final", "InitialBackupCreated");
        metrics.record_completion("succeeded");

        let encoded = metrics.encode();
        assert!(encoded.contains("migration_operator_phase_transitions"));
        assert!(encoded.contains("phase=\"EnsureInitialBackup\""));
        assert!(encoded.contains("migration_operator_migrations_completed"));
        assert!(encoded.contains("outcome=\"succeeded\""));
    }

    #[test]
    fn test_transfer_and_stage_pod_gauges() {
        let metrics = Metrics::new();
        metrics.set_rsync_client_pods(3, 1, 1);
        metrics.set_stage_pods(4);

        let encoded = metrics.encode();
        assert!(encoded.contains("migration_operator_rsync_client_pods"));
        assert!(encoded.contains("state=\"running\""));
        assert!(encoded.contains("migration_operator_stage_pods"));
    }

    #[tokio::test]
    async fn test_health_state_readiness() {
        let state = HealthState::new();
        assert!(!state.is_ready().await);

        state.set_ready(true).await;
        assert!(state.is_ready().await);

        assert_eq!(state.last_reconcile(), 0);
        state.mark_reconciled();
        assert!(state.last_reconcile() > 0);
    }
}
