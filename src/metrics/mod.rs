//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Published gas estimates and estimator health
//! - Transaction lifecycle (created, attempts, confirmed, failed)
//! - Node send errors by kind
//! - Wallet balance

use crate::error::{SendErrorKind, TxmError, TxmResult};
use crate::gas::{wei_to_f64, GasEstimatorState};

use axum::{http::StatusCode, routing::get, Json, Router};
use ethers::types::U256;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

lazy_static! {
    // Estimator metrics
    pub static ref GAS_PRICE: GaugeVec = register_gauge_vec!(
        "txm_gas_price_wei",
        "Published legacy gas price",
        &["chain_id"]
    ).unwrap();

    pub static ref TIP_CAP: GaugeVec = register_gauge_vec!(
        "txm_tip_cap_wei",
        "Published EIP-1559 tip cap",
        &["chain_id"]
    ).unwrap();

    pub static ref FEE_CAP: GaugeVec = register_gauge_vec!(
        "txm_fee_cap_wei",
        "Published EIP-1559 fee cap",
        &["chain_id"]
    ).unwrap();

    pub static ref DA_PRICE: GaugeVec = register_gauge_vec!(
        "txm_da_price_wei",
        "Data availability price read from the rollup oracle",
        &["chain_id"]
    ).unwrap();

    pub static ref ESTIMATOR_FAILURES: CounterVec = register_counter_vec!(
        "txm_estimator_refresh_failures_total",
        "Gas estimator refresh cycles skipped due to errors",
        &["chain_id"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_CREATED: CounterVec = register_counter_vec!(
        "txm_transactions_created_total",
        "Total transactions created",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "txm_transactions_confirmed_total",
        "Total transactions confirmed",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "txm_transactions_failed_total",
        "Total transactions failed",
        &["chain_id"]
    ).unwrap();

    pub static ref ATTEMPTS_BROADCAST: CounterVec = register_counter_vec!(
        "txm_attempts_broadcast_total",
        "Transaction attempts broadcast",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref SEND_ERRORS: CounterVec = register_counter_vec!(
        "txm_send_errors_total",
        "Errors returned by eth_sendRawTransaction",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref CONFIRMATION_BLOCKS: HistogramVec = register_histogram_vec!(
        "txm_confirmation_blocks",
        "Blocks between broadcast of the confirming attempt and its inclusion",
        &["chain_id"],
        vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "txm_wallet_balance_wei",
        "Signing account balance",
        &["chain_id"]
    ).unwrap();
}

/// Kind of broadcast recorded in `txm_attempts_broadcast_total`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Initial,
    Bump,
}

impl AttemptKind {
    fn as_str(&self) -> &'static str {
        match self {
            AttemptKind::Initial => "initial",
            AttemptKind::Bump => "bump",
        }
    }
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TxmResult<()> {
        let app = router();

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TxmError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TxmError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }
}

fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// Helper functions to record metrics

pub fn record_gas_estimate(chain_id: u64, state: &GasEstimatorState) {
    let label = chain_id.to_string();
    if let Some(price) = state.gas_price {
        GAS_PRICE.with_label_values(&[&label]).set(wei_to_f64(price));
    }
    if let Some(tip) = state.tip_cap {
        TIP_CAP.with_label_values(&[&label]).set(wei_to_f64(tip));
    }
    if let Some(fee_cap) = state.fee_cap {
        FEE_CAP.with_label_values(&[&label]).set(wei_to_f64(fee_cap));
    }
    if let Some(da_price) = state.da_price {
        DA_PRICE.with_label_values(&[&label]).set(wei_to_f64(da_price));
    }
}

pub fn record_estimator_failure(chain_id: u64) {
    ESTIMATOR_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_created(chain_id: u64) {
    TX_CREATED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_tx_confirmed(chain_id: u64, blocks_to_confirm: u64) {
    let label = chain_id.to_string();
    TX_CONFIRMED.with_label_values(&[&label]).inc();
    CONFIRMATION_BLOCKS
        .with_label_values(&[&label])
        .observe(blocks_to_confirm as f64);
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_attempt(chain_id: u64, kind: AttemptKind) {
    ATTEMPTS_BROADCAST
        .with_label_values(&[&chain_id.to_string(), kind.as_str()])
        .inc();
}

pub fn record_send_error(chain_id: u64, kind: SendErrorKind) {
    SEND_ERRORS
        .with_label_values(&[&chain_id.to_string(), kind.as_str()])
        .inc();
}

pub fn record_wallet_balance(chain_id: u64, balance: U256) {
    WALLET_BALANCE
        .with_label_values(&[&chain_id.to_string()])
        .set(wei_to_f64(balance));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_handler_exports_recorded_values() {
        record_tx_created(424242);
        record_send_error(424242, SendErrorKind::NonceTooLow);

        let body = metrics_handler().await.unwrap();
        assert!(body.contains("txm_transactions_created_total"));
        assert!(body.contains("nonce_too_low"));
    }

    #[tokio::test]
    async fn test_health_handler() {
        let Json(body) = health_handler().await;
        assert_eq!(body["status"], "healthy");
    }
}
