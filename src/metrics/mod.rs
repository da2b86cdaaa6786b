//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Ledger connection status and event throughput
//! - Order lifecycle (registered, completed, expired, cancelled)
//! - Auctions and bids
//! - Escrow transitions, settlements, and refunds

use crate::error::{CoordinatorError, CoordinatorResult};

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Ledger metrics
    pub static ref LEDGER_CONNECTED: GaugeVec = register_gauge_vec!(
        "lockbridge_ledger_connected",
        "Ledger connection status (1=connected, 0=disconnected)",
        &["ledger_id"]
    ).unwrap();

    pub static ref EVENTS_RECEIVED: CounterVec = register_counter_vec!(
        "lockbridge_events_received_total",
        "Total ledger events received by type",
        &["ledger_id", "event_type"]
    ).unwrap();

    // Order metrics
    pub static ref ORDERS_REGISTERED: CounterVec = register_counter_vec!(
        "lockbridge_orders_registered_total",
        "Total orders registered by route",
        &["source_ledger", "dest_ledger"]
    ).unwrap();

    pub static ref ORDERS_COMPLETED: Counter = register_counter!(
        "lockbridge_orders_completed_total",
        "Total orders fully filled"
    ).unwrap();

    pub static ref ORDERS_EXPIRED: Counter = register_counter!(
        "lockbridge_orders_expired_total",
        "Total orders expired past their deadline"
    ).unwrap();

    pub static ref ORDERS_CANCELLED: Counter = register_counter!(
        "lockbridge_orders_cancelled_total",
        "Total orders cancelled before any fill"
    ).unwrap();

    // Auction metrics
    pub static ref AUCTIONS_OPENED: Counter = register_counter!(
        "lockbridge_auctions_opened_total",
        "Total auctions opened"
    ).unwrap();

    pub static ref AUCTIONS_EXPIRED: Counter = register_counter!(
        "lockbridge_auctions_expired_total",
        "Total auctions that closed without a winner"
    ).unwrap();

    pub static ref BIDS: CounterVec = register_counter_vec!(
        "lockbridge_bids_total",
        "Total bids received by outcome",
        &["outcome"]
    ).unwrap();

    // Escrow metrics
    pub static ref ESCROWS_CREATED: CounterVec = register_counter_vec!(
        "lockbridge_escrows_created_total",
        "Total escrows created by leg",
        &["leg"]
    ).unwrap();

    pub static ref ESCROWS_CLAIMED: CounterVec = register_counter_vec!(
        "lockbridge_escrows_claimed_total",
        "Total escrows claimed by leg",
        &["leg"]
    ).unwrap();

    pub static ref ESCROWS_REFUNDED: CounterVec = register_counter_vec!(
        "lockbridge_escrows_refunded_total",
        "Total escrows refunded by leg",
        &["leg"]
    ).unwrap();

    pub static ref ESCROWS_OPEN: Gauge = register_gauge!(
        "lockbridge_escrows_open",
        "Escrows currently open across all ledgers"
    ).unwrap();

    pub static ref REFUNDS_SUBMITTED: Counter = register_counter!(
        "lockbridge_refunds_submitted_total",
        "Total refund transactions submitted"
    ).unwrap();

    // Fill metrics
    pub static ref FILLS_SETTLED: Counter = register_counter!(
        "lockbridge_fills_settled_total",
        "Total fills settled"
    ).unwrap();

    pub static ref FILL_VOLUME: Counter = register_counter!(
        "lockbridge_fill_volume_total",
        "Total source units settled across all fills"
    ).unwrap();

    pub static ref FILLS_FAILED: Counter = register_counter!(
        "lockbridge_fills_failed_total",
        "Total fills that failed before settlement"
    ).unwrap();

    pub static ref CLAIM_PROPAGATION_FAILURES: Counter = register_counter!(
        "lockbridge_claim_propagation_failures_total",
        "Claims that could not be propagated to the counterpart leg"
    ).unwrap();

    pub static ref CLAIM_PROPAGATION_LATENCY: Histogram = register_histogram!(
        "lockbridge_claim_propagation_latency_seconds",
        "Time from observing a claim to submitting the counterpart claim",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    // Submission metrics
    pub static ref SUBMISSION_RETRIES: CounterVec = register_counter_vec!(
        "lockbridge_submission_retries_total",
        "Ledger submission retries by operation",
        &["operation"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: Counter = register_counter!(
        "lockbridge_health_check_success_total",
        "Total successful health checks"
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: Counter = register_counter!(
        "lockbridge_health_check_failure_total",
        "Total failed health checks"
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

    pub async fn run(&self) -> CoordinatorResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| CoordinatorError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_ledger_health(ledger_id: &str, healthy: bool) {
    LEDGER_CONNECTED
        .with_label_values(&[ledger_id])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_event(ledger_id: &str, event_type: &str) {
    EVENTS_RECEIVED
        .with_label_values(&[ledger_id, event_type])
        .inc();
}

pub fn record_order_registered(source_ledger: &str, dest_ledger: &str) {
    ORDERS_REGISTERED
        .with_label_values(&[source_ledger, dest_ledger])
        .inc();
}

pub fn record_order_completed() {
    ORDERS_COMPLETED.inc();
}

pub fn record_order_expired() {
    ORDERS_EXPIRED.inc();
}

pub fn record_order_cancelled() {
    ORDERS_CANCELLED.inc();
}

pub fn record_auction_opened() {
    AUCTIONS_OPENED.inc();
}

pub fn record_auction_expired() {
    AUCTIONS_EXPIRED.inc();
}

pub fn record_bid(outcome: &str) {
    BIDS.with_label_values(&[outcome]).inc();
}

pub fn record_escrow_created(leg: &str) {
    ESCROWS_CREATED.with_label_values(&[leg]).inc();
}

pub fn record_escrow_claimed(leg: &str) {
    ESCROWS_CLAIMED.with_label_values(&[leg]).inc();
}

pub fn record_escrow_refunded(leg: &str) {
    ESCROWS_REFUNDED.with_label_values(&[leg]).inc();
}

pub fn set_open_escrows(count: usize) {
    ESCROWS_OPEN.set(count as f64);
}

pub fn record_refund_submitted() {
    REFUNDS_SUBMITTED.inc();
}

pub fn record_fill_settled(amount: u64) {
    FILLS_SETTLED.inc();
    FILL_VOLUME.inc_by(amount as f64);
}

pub fn record_fill_failed() {
    FILLS_FAILED.inc();
}

pub fn record_claim_propagation_failure() {
    CLAIM_PROPAGATION_FAILURES.inc();
}

pub fn record_claim_propagation_latency(latency_secs: f64) {
    CLAIM_PROPAGATION_LATENCY.observe(latency_secs);
}

pub fn record_retry(operation: &str) {
    SUBMISSION_RETRIES.with_label_values(&[operation]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.inc();
}
