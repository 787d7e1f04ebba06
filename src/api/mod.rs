//! REST API for a running simulation.
//!
//! Provides three endpoints:
//! - `GET /state` : simulation config, KPI report and run snapshot
//! - `GET /trades` : trade ledger with optional slot range filtering
//! - `POST /events` : enqueue a live event for the next tick barrier

mod handlers;
mod types;

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use axum::Router;
use axum::routing::{get, post};
use tracing::info;

use crate::events::LiveEventSender;
use crate::sim::kpi::KpiReport;
use crate::sim::scheduler::{LedgerEntry, RunSnapshot, Scheduler};
use crate::sim::types::SimConfig;

pub use types::{ErrorResponse, EventAccepted, StateResponse, TradesQuery};

/// What the API serves about the run, refreshed by the simulation thread.
#[derive(Debug, Clone)]
pub struct RunView {
    pub snapshot: RunSnapshot,
    pub kpi: KpiReport,
    pub trades: Vec<LedgerEntry>,
}

impl RunView {
    /// Captures the current state of `scheduler`.
    pub fn capture(scheduler: &Scheduler) -> Self {
        Self {
            snapshot: scheduler.snapshot(),
            kpi: KpiReport::from_summaries(&scheduler.slot_summaries()),
            trades: scheduler.trade_ledger(),
        }
    }
}

/// Application state shared across all request handlers.
///
/// The simulation thread publishes a fresh [`RunView`] after each tick;
/// handlers only read it. Live events go through the scheduler's channel.
pub struct AppState {
    /// Simulation configuration used for this run.
    pub config: SimConfig,
    view: RwLock<RunView>,
    events: LiveEventSender,
}

impl AppState {
    pub fn new(config: SimConfig, view: RunView, events: LiveEventSender) -> Self {
        Self {
            config,
            view: RwLock::new(view),
            events,
        }
    }

    /// Builds state for `scheduler` as it is now.
    pub fn from_scheduler(scheduler: &Scheduler) -> Self {
        Self::new(
            scheduler.config().clone(),
            RunView::capture(scheduler),
            scheduler.event_sender(),
        )
    }

    /// Replaces the view served to clients.
    pub fn publish(&self, view: RunView) {
        *self.view.write().unwrap_or_else(PoisonError::into_inner) = view;
    }

    /// A copy of the view currently served.
    pub fn view(&self) -> RunView {
        self.view
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Builds the axum router with all API routes.
///
/// # Arguments
///
/// * `state` - Shared application state
///
/// # Returns
///
/// Configured `Router` ready to serve.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/state", get(handlers::get_state))
        .route("/trades", get(handlers::get_trades))
        .route("/events", post(handlers::post_event))
        .with_state(state)
}

/// Binds to the given address and serves the API.
///
/// # Arguments
///
/// * `state` - Shared application state
/// * `addr` - Socket address to bind to
///
/// # Errors
///
/// Returns an `io::Error` if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, app).await
}
