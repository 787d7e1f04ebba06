//! Error kinds shared by the order book, markets, areas and live events.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SimError>;

/// Typed failures surfaced by market and tree operations.
///
/// Order-book and market calls fail fast with one of these; the caller
/// decides whether to retry, skip or log. Live-event handling always
/// converts them into a logged, non-fatal outcome.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    /// Order rejected at post time (non-positive energy, negative price,
    /// self-trade, or a bid posted into a one-sided market).
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Mutation or clearing attempted on a readonly market.
    #[error("market for slot {slot} is closed")]
    MarketClosed {
        /// Slot index of the closed market.
        slot: u64,
    },

    /// Referenced order, area or market does not exist (or is no longer open).
    #[error("{0} not found")]
    NotFound(String),

    /// Target parent of a structural change is missing or cannot hold children.
    #[error("invalid parent {parent}: {reason}")]
    InvalidParent {
        /// Identifier of the rejected parent.
        parent: String,
        /// Why the parent was rejected.
        reason: String,
    },

    /// Requested energy is not available on the targeted order.
    #[error("invalid energy: requested {requested} kWh, available {available} kWh")]
    InvalidEnergy {
        /// Energy the caller asked for (kWh).
        requested: f64,
        /// Energy actually open on the order (kWh).
        available: f64,
    },

    /// Live event could not be interpreted or would break a tree invariant.
    #[error("invalid live event: {0}")]
    InvalidEvent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = SimError::InvalidEnergy {
            requested: 3.0,
            available: 1.5,
        };
        assert_eq!(
            err.to_string(),
            "invalid energy: requested 3 kWh, available 1.5 kWh"
        );
        assert_eq!(
            SimError::MarketClosed { slot: 4 }.to_string(),
            "market for slot 4 is closed"
        );
    }
}
