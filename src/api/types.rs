//! API response and query types.

use serde::{Deserialize, Serialize};

use crate::sim::kpi::KpiReport;
use crate::sim::scheduler::RunSnapshot;
use crate::sim::types::SimConfig;

/// Combined state response: config, KPIs and the run snapshot.
#[derive(Debug, Serialize)]
pub struct StateResponse {
    /// Simulation configuration.
    pub config: SimConfig,
    /// KPIs over the markets closed so far.
    pub kpi: KpiReport,
    /// Areas, open orders and the last tick executed.
    pub snapshot: RunSnapshot,
}

/// Optional filters for the trades endpoint.
#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    /// First slot (inclusive).
    pub from_slot: Option<u64>,
    /// Last slot (inclusive).
    pub to_slot: Option<u64>,
    /// Only trades recorded in this area's markets.
    pub area: Option<String>,
}

/// Body of a `202 Accepted` reply to `POST /events`.
#[derive(Debug, Serialize)]
pub struct EventAccepted {
    #[serde(rename = "eventType")]
    pub event_type: &'static str,
}

/// Error response body for 4xx/5xx errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}
