//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Submissions, rejections, replacements and terminal outcomes
//! - Reorgs and confirmation latency
//! - Read cache efficiency
//! - Active watches

use crate::error::{EngineError, EngineResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Submission metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "txpilot_transactions_submitted_total",
        "Transactions accepted by the network on first broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_REJECTED: CounterVec = register_counter_vec!(
        "txpilot_broadcast_rejections_total",
        "Broadcast rejections by class",
        &["chain_id", "class"]
    ).unwrap();

    pub static ref NONCES_RELEASED: CounterVec = register_counter_vec!(
        "txpilot_nonces_released_total",
        "Reserved nonces handed back after a failed build or broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_REPLACEMENTS: CounterVec = register_counter_vec!(
        "txpilot_replacements_total",
        "Same-nonce replacements sent",
        &["chain_id", "kind"]
    ).unwrap();

    // Outcome metrics
    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txpilot_transactions_confirmed_total",
        "Transactions that reached their required depth",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "txpilot_transactions_failed_total",
        "Transactions that ended failed",
        &["chain_id", "reason"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "txpilot_confirmation_latency_seconds",
        "Time from first broadcast to confirmation",
        &["chain_id"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "txpilot_reorgs_detected_total",
        "Tracked inclusion blocks displaced by a reorg",
        &["chain_id"]
    ).unwrap();

    pub static ref VERIFICATION_FAILURES: CounterVec = register_counter_vec!(
        "txpilot_verification_failures_total",
        "Confirmed receipts that failed declared checks",
        &["chain_id"]
    ).unwrap();

    // Read cache metrics
    pub static ref CACHE_REQUESTS: CounterVec = register_counter_vec!(
        "txpilot_read_cache_requests_total",
        "Read cache lookups by result",
        &["cache", "result"]
    ).unwrap();

    pub static ref ACTIVE_WATCHES: Gauge = register_gauge!(
        "txpilot_active_watches",
        "Records currently being watched"
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "txpilot_health_checks_total",
        "Health checks by result",
        &["result"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> EngineResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| EngineError::Config(format!("cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| EngineError::Internal(format!("metrics server stopped: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_rejection(chain_id: u64, class: &str) {
    TX_REJECTED
        .with_label_values(&[&chain_id.to_string(), class])
        .inc();
}

pub fn record_nonce_released(chain_id: u64) {
    NONCES_RELEASED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_acceleration(chain_id: u64) {
    TX_REPLACEMENTS
        .with_label_values(&[&chain_id.to_string(), "accelerate"])
        .inc();
}

pub fn record_cancellation(chain_id: u64) {
    TX_REPLACEMENTS
        .with_label_values(&[&chain_id.to_string(), "cancel"])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, reason: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), reason])
        .inc();
}

pub fn record_tx_latency(chain_id: u64, latency_secs: f64) {
    TX_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_reorg(chain_id: u64) {
    REORGS.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_verification_failure(chain_id: u64) {
    VERIFICATION_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_cache_hit(cache: &str) {
    CACHE_REQUESTS.with_label_values(&[cache, "hit"]).inc();
}

pub fn record_cache_miss(cache: &str) {
    CACHE_REQUESTS.with_label_values(&[cache, "miss"]).inc();
}

pub fn set_active_watches(count: usize) {
    ACTIVE_WATCHES.set(count as f64);
}

pub fn record_health_check(healthy: bool) {
    let result = if healthy { "success" } else { "failure" };
    HEALTH_CHECKS.with_label_values(&[result]).inc();
}
