//! Per-slot energy markets: orders, the order book and clearing.

pub mod book;
pub mod clearing;
#[allow(clippy::module_inception)]
pub mod market;
pub mod order;

pub use book::OfferBook;
pub use clearing::{ClearingEngine, ClearingOutcome, MarketType, Match};
pub use market::{Market, MarketSummary};
pub use order::{Bid, FLOATING_POINT_TOLERANCE, Offer, OrderId, OrderRequest, Trade, TradeId};
