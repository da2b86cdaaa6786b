//! HTTP API for orders, bids, status, and monitoring

use crate::auction::{AuctionId, BidResult};
use crate::config::ApiConfig;
use crate::coordinator::{OrderIntent, SwapCoordinator};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::fill::{Amount, OrderId};
use crate::ledger::LedgerManager;
use crate::state::Store;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SwapCoordinator>,
    pub store: Arc<dyn Store>,
    pub ledgers: Arc<LedgerManager>,
}

/// Run the HTTP API server
pub async fn run_server(
    config: ApiConfig,
    coordinator: Arc<SwapCoordinator>,
    store: Arc<dyn Store>,
    ledgers: Arc<LedgerManager>,
) -> CoordinatorResult<()> {
    let state = AppState {
        coordinator,
        store,
        ledgers,
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/orders", post(submit_order))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id/cancel", post(cancel_order))
        .route("/auctions/:auction_id/bids", post(place_bid))
        .route("/stats", get(get_stats))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("api bind failed: {}", e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| CoordinatorError::Internal(format!("api server failed: {}", e)))?;

    Ok(())
}

fn parse_id(hex_id: &str) -> Result<[u8; 32], (StatusCode, Json<ErrorResponse>)> {
    let bytes = hex::decode(hex_id).map_err(|_| bad_request("id must be 64 hex characters"))?;
    bytes
        .try_into()
        .map_err(|_| bad_request("id must be 64 hex characters"))
}

fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn error_response(e: CoordinatorError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        CoordinatorError::OrderNotFound { .. }
        | CoordinatorError::AuctionNotFound { .. }
        | CoordinatorError::EscrowNotFound { .. }
        | CoordinatorError::LedgerNotFound { .. } => StatusCode::NOT_FOUND,
        CoordinatorError::AuctionFilled { .. }
        | CoordinatorError::AuctionExpired { .. }
        | CoordinatorError::OrderClosed { .. }
        | CoordinatorError::OrderFrozen { .. }
        | CoordinatorError::CancelAfterFill { .. }
        | CoordinatorError::OpportunityAlreadyClaimed { .. } => StatusCode::CONFLICT,
        CoordinatorError::InvalidAmount { .. }
        | CoordinatorError::InvalidTimelock { .. }
        | CoordinatorError::FillTooSmall { .. }
        | CoordinatorError::FillExceedsRemaining { .. }
        | CoordinatorError::PartialFillsDisabled { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the store and every configured ledger
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let ledger_health = state.ledgers.health_check().await;
    let ledgers_ok = ledger_health.iter().all(|(_, healthy)| *healthy);

    let response = ReadinessResponse {
        ready: db_ok && ledgers_ok,
        database: db_ok,
        ledgers: ledger_health
            .into_iter()
            .map(|(id, healthy)| LedgerHealth {
                ledger_id: id,
                healthy,
            })
            .collect(),
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Open a new order
async fn submit_order(
    State(state): State<AppState>,
    Json(intent): Json<OrderIntent>,
) -> impl IntoResponse {
    match state.coordinator.submit_order(intent, Utc::now()).await {
        Ok(order_id) => (
            StatusCode::CREATED,
            Json(SubmitOrderResponse {
                order_id: hex::encode(order_id),
            }),
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Current order state, its fills, and the latest auction
async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    let order_id: OrderId = match parse_id(&order_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.coordinator.order_status(&order_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Cancel an order that has seen no fills
async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> impl IntoResponse {
    let order_id: OrderId = match parse_id(&order_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state.coordinator.cancel_order(&order_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Submit a resolver's bid against an auction
async fn place_bid(
    State(state): State<AppState>,
    Path(auction_id): Path<String>,
    Json(bid): Json<BidRequest>,
) -> impl IntoResponse {
    let auction_id: AuctionId = match parse_id(&auction_id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    match state
        .coordinator
        .place_bid(
            &auction_id,
            &bid.resolver,
            bid.price,
            bid.fill_amount,
            Utc::now(),
        )
        .await
    {
        Ok(BidResult::Won {
            auction_id, price, ..
        }) => Json(BidResponse {
            outcome: "won".to_string(),
            auction_id: hex::encode(auction_id),
            price: Some(price),
            current_price: None,
        })
        .into_response(),
        Ok(BidResult::Lost { current_price }) => Json(BidResponse {
            outcome: "lost".to_string(),
            auction_id: hex::encode(auction_id),
            price: None,
            current_price: Some(current_price),
        })
        .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// Aggregate order and fill statistics
async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.stats().await {
        Ok(stats) => (
            StatusCode::OK,
            Json(StatsResponse {
                orders_open: stats.orders_open,
                orders_filled: stats.orders_filled,
                orders_expired: stats.orders_expired,
                fills_settled: stats.fills_settled,
                fills_failed: stats.fills_failed,
            }),
        ),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(StatsResponse {
                orders_open: 0,
                orders_filled: 0,
                orders_expired: 0,
                fills_settled: 0,
                fills_failed: 0,
            }),
        ),
    }
}

// Request and response types

#[derive(Deserialize)]
struct BidRequest {
    resolver: String,
    price: Amount,
    fill_amount: Amount,
}

#[derive(Serialize)]
struct BidResponse {
    outcome: String,
    auction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_price: Option<Amount>,
}

#[derive(Serialize)]
struct SubmitOrderResponse {
    order_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    ledgers: Vec<LedgerHealth>,
}

#[derive(Serialize)]
struct LedgerHealth {
    ledger_id: String,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    orders_open: u64,
    orders_filled: u64,
    orders_expired: u64,
    fills_settled: u64,
    fills_failed: u64,
}
