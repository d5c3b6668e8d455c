//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Outbound RPC calls and rate limiter pressure
//! - Subscription health
//! - Transaction escalation
//! - Chain progress

use crate::error::{ChainError, ChainResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::future::Future;
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // RPC metrics
    pub static ref RPC_CALLS: IntCounterVec = register_int_counter_vec!(
        "ethlike_rpc_calls_total",
        "Total rate limited RPC calls by method",
        &["method"]
    ).unwrap();

    pub static ref RPC_PERMIT_TIMEOUTS: IntCounter = register_int_counter!(
        "ethlike_rpc_permit_timeouts_total",
        "Total calls that gave up waiting for a rate limiter permit"
    ).unwrap();

    pub static ref RPC_IN_FLIGHT: IntGauge = register_int_gauge!(
        "ethlike_rpc_in_flight",
        "RPC calls currently holding a rate limiter permit"
    ).unwrap();

    // Subscription metrics
    pub static ref RESUBSCRIPTIONS: IntCounter = register_int_counter!(
        "ethlike_resubscriptions_total",
        "Total resubscription attempts scheduled after a subscription ended or failed"
    ).unwrap();

    pub static ref RESUBSCRIPTION_ALERTS: IntCounter = register_int_counter!(
        "ethlike_resubscription_alerts_total",
        "Total resubscription attempts made faster than the alert threshold"
    ).unwrap();

    pub static ref SUBSCRIBE_FAILURES: IntCounter = register_int_counter!(
        "ethlike_subscribe_failures_total",
        "Total failed subscribe attempts"
    ).unwrap();

    // Transaction metrics
    pub static ref TX_ESCALATIONS: IntCounterVec = register_int_counter_vec!(
        "ethlike_tx_escalations_total",
        "Total fee escalations by fee kind",
        &["kind"]
    ).unwrap();

    pub static ref TX_MINED: IntCounter = register_int_counter!(
        "ethlike_tx_mined_total",
        "Total transactions seen mined by a mining waiter"
    ).unwrap();

    pub static ref TX_GIVE_UPS: IntCounterVec = register_int_counter_vec!(
        "ethlike_tx_give_ups_total",
        "Total mining waiters that stopped before the transaction was mined",
        &["reason"]
    ).unwrap();

    pub static ref ACCOUNT_NONCE: IntGauge = register_int_gauge!(
        "ethlike_account_nonce",
        "Next nonce the nonce manager hands out"
    ).unwrap();

    // Chain metrics
    pub static ref CHAIN_BLOCK_HEIGHT: IntGauge = register_int_gauge!(
        "ethlike_chain_block_height",
        "Latest block height seen by the block counter"
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    host: String,
    port: u16,
}

impl MetricsServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Serve `/metrics` until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()> + Send + 'static) -> ChainResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ChainError::Config(format!("Invalid metrics address: {}", e)))?;
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| ChainError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ChainError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_rpc_call(method: &str) {
    RPC_CALLS.with_label_values(&[method]).inc();
}

pub fn record_permit_timeout() {
    RPC_PERMIT_TIMEOUTS.inc();
}

pub fn record_resubscription() {
    RESUBSCRIPTIONS.inc();
}

pub fn record_resubscription_alert() {
    RESUBSCRIPTION_ALERTS.inc();
}

pub fn record_subscribe_failure() {
    SUBSCRIBE_FAILURES.inc();
}

pub fn record_escalation(kind: &str) {
    TX_ESCALATIONS.with_label_values(&[kind]).inc();
}

pub fn record_mined() {
    TX_MINED.inc();
}

pub fn record_give_up(reason: &str) {
    TX_GIVE_UPS.with_label_values(&[reason]).inc();
}

pub fn record_nonce(nonce: u64) {
    ACCOUNT_NONCE.set(nonce as i64);
}

pub fn record_block_height(height: u64) {
    CHAIN_BLOCK_HEIGHT.set(height as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handler_exposes_recorded_metrics() {
        record_escalation("legacy");
        record_give_up("ceiling_reached");

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("ethlike_tx_escalations_total{kind=\"legacy\"}"));
        assert!(body.contains("ethlike_tx_give_ups_total{reason=\"ceiling_reached\"}"));
    }
}
