//! HTTP surface of the authority node.
//!
//! All endpoints are POST and JSON. Replies are sealed envelopes bound to the
//! current chain tip. Three authentication tiers: public (rate-limited),
//! authority-signed, coordinator-signed; `/executePayouts` additionally only
//! answers on loopback.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use serde::Serialize;
use serde_json::json;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tracing::info;

use crate::db;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::minting;
use crate::payout;
use crate::registrar;
use crate::state::{AppState, SharedState};
use crate::stats;
use crate::withdrawal;

/// Per-route rate limits, keyed by peer IP.
macro_rules! rate_limit {
    ($period_ms:expr, $burst:expr) => {
        GovernorLayer::new(Arc::new(
            GovernorConfigBuilder::default()
                .period(Duration::from_millis($period_ms))
                .burst_size($burst)
                .finish()
                .expect("static rate-limit config"),
        ))
    };
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        // Public endpoints.
        .route("/ping", post(ping).layer(rate_limit!(1_000, 10)))
        .route(
            "/generateDepositAddress",
            post(generate_deposit_address).layer(rate_limit!(20_000, 1)),
        )
        .route(
            "/registerMintDepositAddress",
            post(register_mint_deposit_address).layer(rate_limit!(20_000, 1)),
        )
        .route(
            "/queryMintBalance",
            post(query_mint_balance).layer(rate_limit!(1_000, 10)),
        )
        .route(
            "/createMintTransaction",
            post(create_mint_transaction).layer(rate_limit!(5_000, 1)),
        )
        .route(
            "/queryBurnHistory",
            post(query_burn_history).layer(rate_limit!(1_000, 10)),
        )
        .route(
            "/submitWithdrawal",
            post(submit_withdrawal).layer(rate_limit!(200, 5)),
        )
        .route("/stats", post(stats_handler).layer(rate_limit!(5_000, 1)))
        // Authority-only endpoints.
        .route("/computePendingPayouts", post(compute_pending_payouts))
        .route("/computeUnspent", post(compute_unspent))
        .route("/log", post(read_log))
        .route("/dumpDatabase", post(dump_database))
        .route("/dingoDoesAHarakiri", post(harakiri))
        // Coordinator-only endpoints.
        .route("/approvePayouts", post(approve_payouts))
        .route("/approvePayoutsTest", post(approve_payouts_test))
        // Loopback-only coordinator trigger.
        .route("/executePayouts", post(execute_payouts))
        .layer(middleware::from_fn_with_state(state.clone(), record_faults))
        .with_state(state)
}

/// Buffer request bodies so uncaught failures can be appended to the fault
/// log with full context.
async fn record_faults(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, 1 << 20).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (axum::http::StatusCode::PAYLOAD_TOO_LARGE, "request too large")
                .into_response()
        }
    };
    let request = Request::from_parts(parts, Body::from(body_bytes.clone()));

    let response = next.run(request).await;
    if response.status().is_server_error() {
        let (parts, body) = response.into_parts();
        let error_bytes = axum::body::to_bytes(body, 1 << 16)
            .await
            .unwrap_or_default();
        state
            .fault_log
            .append(
                &path,
                &String::from_utf8_lossy(&body_bytes),
                &String::from_utf8_lossy(&error_bytes),
            )
            .await;
        return Response::from_parts(parts, Body::from(error_bytes));
    }
    response
}

/// Seal a handler result as the reply envelope.
async fn sealed<T: Serialize>(state: &AppState, payload: &T) -> Result<Json<Envelope>> {
    Ok(Json(state.seal(payload).await?))
}

/// Authentication tier: envelope signed by any committee member.
async fn require_authority(state: &AppState, envelope: &Envelope) -> Result<()> {
    envelope.verify_any_signer(&state.authority_addresses()?)?;
    state.verify_anchor(envelope).await
}

/// Authentication tier: envelope signed by the configured coordinator.
async fn require_coordinator(state: &AppState, envelope: &Envelope) -> Result<()> {
    envelope.verify_signer(state.coordinator_address()?)?;
    state.verify_anchor(envelope).await
}

// ============ Public endpoints ============

async fn ping(State(state): State<SharedState>) -> Result<Json<Envelope>> {
    sealed(
        &state,
        &json!({
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "version": env!("CARGO_PKG_VERSION"),
        }),
    )
    .await
}

async fn generate_deposit_address(
    State(state): State<SharedState>,
    Json(request): Json<registrar::GenerateDepositAddressRequest>,
) -> Result<Json<Envelope>> {
    let response = registrar::generate_deposit_address(&state, request).await?;
    sealed(&state, &response).await
}

async fn register_mint_deposit_address(
    State(state): State<SharedState>,
    Json(request): Json<registrar::RegisterMintDepositAddressRequest>,
) -> Result<Json<Envelope>> {
    let response = registrar::register_mint_deposit_address(&state, request).await?;
    sealed(&state, &response).await
}

async fn query_mint_balance(
    State(state): State<SharedState>,
    Json(request): Json<minting::QueryMintBalanceRequest>,
) -> Result<Json<Envelope>> {
    let response = minting::query_mint_balance(&state, request).await?;
    sealed(&state, &response).await
}

async fn create_mint_transaction(
    State(state): State<SharedState>,
    Json(request): Json<minting::CreateMintTransactionRequest>,
) -> Result<Json<Envelope>> {
    let response = minting::create_mint_transaction(&state, request).await?;
    sealed(&state, &response).await
}

async fn query_burn_history(
    State(state): State<SharedState>,
    Json(request): Json<withdrawal::QueryBurnHistoryRequest>,
) -> Result<Json<Envelope>> {
    let response = withdrawal::query_burn_history(&state, request).await?;
    sealed(&state, &response).await
}

async fn submit_withdrawal(
    State(state): State<SharedState>,
    Json(request): Json<withdrawal::SubmitWithdrawalRequest>,
) -> Result<Json<Envelope>> {
    let response = withdrawal::submit_withdrawal(&state, request).await?;
    sealed(&state, &response).await
}

async fn stats_handler(State(state): State<SharedState>) -> Result<Json<Envelope>> {
    let snapshot = stats::stats_snapshot(&state).await?;
    sealed(&state, &snapshot).await
}

// ============ Authority-only endpoints ============

async fn compute_pending_payouts(
    State(state): State<SharedState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>> {
    require_authority(&state, &envelope).await?;
    let request: payout::ComputePendingPayoutsRequest = envelope.open()?;
    let pending = payout::compute_pending_payouts(
        &state,
        request.process_deposits,
        request.process_withdrawals,
    )
    .await?;
    sealed(&state, &pending).await
}

async fn compute_unspent(
    State(state): State<SharedState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>> {
    require_authority(&state, &envelope).await?;
    let unspent = payout::compute_unspent(&state).await?;
    sealed(&state, &payout::ComputeUnspentResponse { unspent }).await
}

async fn read_log(
    State(state): State<SharedState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>> {
    require_authority(&state, &envelope).await?;
    let log = state.fault_log.read_all().await?;
    sealed(&state, &json!({ "log": log })).await
}

async fn dump_database(
    State(state): State<SharedState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>> {
    require_authority(&state, &envelope).await?;
    let _write = state.write_lock.lock().await;
    let sql = db::dump_database(&state.pool).await?;
    sealed(&state, &json!({ "sql": sql })).await
}

/// Authenticated self-termination, used for coordinated restarts. The reply
/// flushes before the process exits.
async fn harakiri(
    State(state): State<SharedState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>> {
    require_authority(&state, &envelope).await?;
    info!("harakiri requested by an authority, shutting down");
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::process::exit(0);
    });
    sealed(&state, &json!({})).await
}

// ============ Coordinator-only endpoints ============

async fn approve_payouts(
    State(state): State<SharedState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>> {
    require_coordinator(&state, &envelope).await?;
    let request: payout::ApprovePayoutsRequest = envelope.open()?;
    let response = payout::approve_payouts(&state, request, false).await?;
    sealed(&state, &response).await
}

/// Dry run: full validation and signing, no state mutation, no broadcast.
async fn approve_payouts_test(
    State(state): State<SharedState>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>> {
    require_coordinator(&state, &envelope).await?;
    let request: payout::ApprovePayoutsRequest = envelope.open()?;
    let response = payout::approve_payouts(&state, request, true).await?;
    sealed(&state, &response).await
}

// ============ Loopback-only trigger ============

async fn execute_payouts(
    State(state): State<SharedState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<payout::ExecutePayoutsRequest>,
) -> Result<Json<Envelope>> {
    if !peer.ip().is_loopback() {
        return Err(Error::Unauthorized(
            "executePayouts only answers on loopback".into(),
        ));
    }
    let response = payout::execute_payouts(&state, request).await?;
    sealed(&state, &response).await
}

// ============ Servers ============

/// Serve the signed API, with TLS when the authority certificate is
/// configured.
pub async fn serve(state: SharedState) -> eyre::Result<()> {
    let node_settings = &state.settings.node_settings;
    let addr: SocketAddr = format!("{}:{}", node_settings.bind_address, node_settings.port)
        .parse()
        .map_err(|e| eyre::eyre!("invalid bind address: {e}"))?;
    let cert = node_settings.cert_path.clone();
    let key = node_settings.key_path.clone();

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    match (cert, key) {
        (Some(cert), Some(key)) => {
            let tls = RustlsConfig::from_pem_file(&cert, &key).await?;
            info!(%addr, "API server listening (https)");
            axum_server::bind_rustls(addr, tls).serve(app).await?;
        }
        _ => {
            info!(%addr, "API server listening (plain http, dev only)");
            axum_server::bind(addr).serve(app).await?;
        }
    }
    Ok(())
}

/// Plain-HTTP health and Prometheus listener, separate from the signed API
/// surface.
pub async fn serve_health(addr: SocketAddr) -> eyre::Result<()> {
    use axum::routing::get;
    use prometheus::{Encoder, TextEncoder};

    async fn health() -> &'static str {
        "OK"
    }

    async fn prometheus_metrics() -> Response {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics",
            )
                .into_response();
        }
        ([("content-type", "text/plain; charset=utf-8")], buffer).into_response()
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics));

    info!(%addr, "health server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
