//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (has the initial Database list been handled?)
//! - `/metrics` - Prometheus metrics

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::crd::DatabaseState;

/// Labels for metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub name: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ReconcileLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for database state metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct StateLabels {
    pub state: String,
}

impl prometheus_client::encoding::EncodeLabelSet for StateLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("state", self.state.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for provider operation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ProviderLabels {
    pub provider: String,
    pub operation: String,
    pub outcome: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ProviderLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("provider", self.provider.as_str()).encode(encoder.encode_label())?;
        ("operation", self.operation.as_str()).encode(encoder.encode_label())?;
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Total reconciliations counter
    pub reconciliations_total: Family<ReconcileLabels, Counter>,
    /// Failed reconciliations counter
    pub reconciliation_errors_total: Family<ReconcileLabels, Counter>,
    /// Reconciliation duration histogram
    pub reconcile_duration_seconds: Family<ReconcileLabels, Histogram>,
    /// Databases by provisioning state
    pub databases_total: Family<StateLabels, Gauge>,
    /// Calls into the provisioning backend
    pub provider_operations_total: Family<ProviderLabels, Counter>,

    /// Last known state per (namespace, name), source of `databases_total`
    states: Mutex<HashMap<(String, String), DatabaseState>>,

    /// Prometheus registry
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

        let reconciliations_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "rds_operator_reconciliations",
            "Total number of reconciliations",
            reconciliations_total.clone(),
        );

        let reconciliation_errors_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "rds_operator_reconciliation_errors",
            "Total number of reconciliation errors",
            reconciliation_errors_total.clone(),
        );

        let reconcile_duration_seconds =
            Family::<ReconcileLabels, Histogram>::new_with_constructor(|| {
                // Provisioning waits can take many minutes
                Histogram::new(exponential_buckets(0.01, 2.0, 18))
            });
        registry.register(
            "rds_operator_reconcile_duration_seconds",
            "Duration of reconciliation in seconds",
            reconcile_duration_seconds.clone(),
        );

        let databases_total = Family::<StateLabels, Gauge>::default();
        registry.register(
            "rds_operator_databases",
            "Number of Database resources by state",
            databases_total.clone(),
        );

        let provider_operations_total = Family::<ProviderLabels, Counter>::default();
        registry.register(
            "rds_operator_provider_operations",
            "Provider operations by provider, operation and outcome",
            provider_operations_total.clone(),
        );

        Self {
            reconciliations_total,
            reconciliation_errors_total,
            reconcile_duration_seconds,
            databases_total,
            provider_operations_total,
            states: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// Record a finished reconciliation
    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliations_total.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    /// Record a failed reconciliation
    pub fn record_error(&self, namespace: &str, name: &str) {
        let labels = ReconcileLabels {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        self.reconciliation_errors_total
            .get_or_create(&labels)
            .inc();
    }

    /// Record one provider call
    pub fn record_provider_operation(&self, provider: &str, operation: &str, success: bool) {
        let labels = ProviderLabels {
            provider: provider.to_string(),
            operation: operation.to_string(),
            outcome: if success { "success" } else { "error" }.to_string(),
        };
        self.provider_operations_total.get_or_create(&labels).inc();
    }

    /// Track the state of one Database; `None` forgets it
    pub fn set_database_state(&self, namespace: &str, name: &str, state: Option<DatabaseState>) {
        let Ok(mut states) = self.states.lock() else {
            tracing::error!("Database state metrics lock poisoned");
            return;
        };

        let key = (namespace.to_string(), name.to_string());
        match state {
            Some(state) => {
                states.insert(key, state);
            }
            None => {
                states.remove(&key);
            }
        }

        for state in DatabaseState::ALL {
            let count = states.values().filter(|s| **s == state).count();
            let labels = StateLabels {
                state: state.to_string(),
            };
            self.databases_total
                .get_or_create(&labels)
                .set(count as i64);
        }
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the initial Database list has been dispatched
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
    /// When the last successful reconcile finished (unix seconds)
    pub last_reconcile: AtomicU64,
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

    /// Mark the operator as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the operator is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Remember when the last reconciliation finished
    pub fn touch_reconcile(&self) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.last_reconcile.store(now, Ordering::Relaxed);
    }
}

/// Liveness probe handler
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the watch has delivered its
/// initial list and again once shutdown has begun.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server on `addr`
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Health server listening");

    axum::serve(listener, app).await
}
