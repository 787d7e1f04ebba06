//! Request handlers for the API endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use serde_json::Value;
use tracing::debug;

use super::AppState;
use super::types::{ErrorResponse, EventAccepted, StateResponse, TradesQuery};
use crate::events::LiveEvent;
use crate::sim::scheduler::LedgerEntry;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: String) -> ApiError {
    (status, Json(ErrorResponse { error: message }))
}

/// Returns simulation config, KPI report and the run snapshot.
///
/// `GET /state` → 200 + `StateResponse` JSON
pub async fn get_state(State(state): State<Arc<AppState>>) -> Json<StateResponse> {
    let view = state.view();
    Json(StateResponse {
        config: state.config.clone(),
        kpi: view.kpi,
        snapshot: view.snapshot,
    })
}

/// Returns trades, optionally filtered by slot range and area.
///
/// `GET /trades` → 200 + `Vec<LedgerEntry>` JSON
/// `GET /trades?from_slot=N&to_slot=M&area=House%201` → filtered (inclusive)
/// `GET /trades?from_slot=10&to_slot=5` → 400 + `ErrorResponse`
pub async fn get_trades(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TradesQuery>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    let from = query.from_slot.unwrap_or(0);
    let to = query.to_slot.unwrap_or(u64::MAX);

    if from > to {
        return Err(error(
            StatusCode::BAD_REQUEST,
            format!("`from_slot` ({from}) must be <= `to_slot` ({to})"),
        ));
    }

    let trades: Vec<LedgerEntry> = state
        .view()
        .trades
        .into_iter()
        .filter(|e| e.trade.time_slot >= from && e.trade.time_slot <= to)
        .filter(|e| query.area.as_deref().is_none_or(|area| e.area == area))
        .collect();

    Ok(Json(trades))
}

/// Queues a live event for the next tick barrier.
///
/// `POST /events` → 202 + `EventAccepted`
/// Malformed JSON or an invalid event → 400; simulation finished → 503.
pub async fn post_event(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<EventAccepted>), ApiError> {
    let Json(value) = body.map_err(|e| error(StatusCode::BAD_REQUEST, e.body_text()))?;
    let event = LiveEvent::from_value(&value)
        .map_err(|e| error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let event_type = event.kind();
    state
        .events
        .send(event)
        .map_err(|e| error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    debug!(event = event_type, "live event queued via API");
    Ok((StatusCode::ACCEPTED, Json(EventAccepted { event_type })))
}
