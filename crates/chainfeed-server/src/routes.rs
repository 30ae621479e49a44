//! `/api/v1` handlers.

use alloy_primitives::Address;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chainfeed_broadcast::{BroadcastService, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::ApiError;
use crate::units::parse_ether;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub service: BroadcastService,
}

/// Build the router with every `/api/v1` route.
pub fn router(service: BroadcastService) -> Router {
    let api = Router::new()
        .route("/events/ws", get(events_ws))
        .route("/events/subscribe", post(subscribe_contract))
        .route("/monitor/address", post(monitor_address))
        .route("/monitor/high-value", post(monitor_high_value))
        .route("/health", get(health));

    Router::new()
        .nest("/api/v1", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { service })
}

fn parse_address(field: &str, raw: &str) -> Result<Address, ApiError> {
    raw.trim()
        .parse::<Address>()
        .map_err(|_| ApiError::bad_request(format!("invalid {field}: {raw:?}")))
}

async fn events_ws(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    let max_frame = state.service.config().connection.max_frame_bytes;
    upgrade
        .max_message_size(max_frame)
        .on_upgrade(move |socket| async move {
            let (sink, stream) = ws::split(socket);
            if let Err(e) = state.service.accept(sink, stream).await {
                warn!(error = %e, "rejected subscriber connection");
            }
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub contract_address: String,
    #[serde(default)]
    pub event_signatures: Vec<String>,
}

async fn subscribe_contract(
    State(state): State<AppState>,
    body: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body?;
    let contract = parse_address("contractAddress", &req.contract_address)?;
    let id = state
        .service
        .subscribe_to_contract(contract, &req.event_signatures)
        .await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("subscribed to events of {contract}"),
        "subscriptionId": id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub address: String,
}

async fn monitor_address(
    State(state): State<AppState>,
    body: Result<Json<AddressRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body?;
    let address = parse_address("address", &req.address)?;
    let id = state.service.watch_address(address).await;
    Ok(Json(json!({
        "success": true,
        "message": format!("monitoring transactions from {address}"),
        "filterId": id.to_string(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighValueRequest {
    /// Decimal ether, as a string or a JSON number.
    pub min_value: Value,
}

async fn monitor_high_value(
    State(state): State<AppState>,
    body: Result<Json<HighValueRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = body?;
    let raw = match &req.min_value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(ApiError::bad_request(format!("invalid minValue: {other}"))),
    };
    let wei = parse_ether(&raw).map_err(ApiError::BadRequest)?;
    let id = state.service.watch_high_value(wei).await;
    Ok(Json(json!({
        "success": true,
        "message": format!("monitoring transactions of at least {raw} ETH"),
        "filterId": id.to_string(),
        "minValueWei": wei.to_string(),
    })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub filters: usize,
    pub upstream_subscriptions: usize,
    pub metrics: MetricsSnapshot,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let svc = &state.service;
    Json(HealthResponse {
        status: if svc.is_stopped() { "stopped" } else { "ok" },
        connections: svc.connection_count().await,
        filters: svc.processor().filter_count().await,
        upstream_subscriptions: svc.listener().open_subscriptions().await,
        metrics: svc.metrics(),
    })
}
