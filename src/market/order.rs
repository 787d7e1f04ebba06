//! Orders and trades exchanged in a market.
//!
//! Prices are energy *rates* (currency per kWh); the value of a trade is
//! `traded_energy * traded_price`.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

/// Energy differences below this are treated as zero (kWh).
pub const FLOATING_POINT_TOLERANCE: f64 = 1e-8;

/// Identifier of an open or retired order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a recorded trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TradeId(Uuid);

impl TradeId {
    /// Allocates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TradeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order parameters supplied by a participant; the book assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    /// Energy to buy or sell (kWh, must be > 0).
    pub energy: f64,
    /// Energy rate (must be >= 0).
    pub price: f64,
    /// Identity of the posting participant.
    pub owner: String,
}

impl OrderRequest {
    /// Creates a new order request.
    pub fn new(energy: f64, price: f64, owner: impl Into<String>) -> Self {
        Self {
            energy,
            price,
            owner: owner.into(),
        }
    }
}

/// A seller's willingness to sell `energy` at or above `price`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Offer {
    pub id: OrderId,
    pub energy: f64,
    pub price: f64,
    pub seller: String,
}

/// A buyer's willingness to buy `energy` at or below `price`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bid {
    pub id: OrderId,
    pub energy: f64,
    pub price: f64,
    pub buyer: String,
}

/// Common view over offers and bids used by the order book.
pub trait BookOrder: Clone {
    fn from_request(id: OrderId, request: OrderRequest) -> Self;
    fn id(&self) -> OrderId;
    fn energy(&self) -> f64;
    fn price(&self) -> f64;
    fn owner(&self) -> &str;
    /// Copy of this order under `id` carrying `energy`.
    fn reissue(&self, id: OrderId, energy: f64) -> Self;
}

impl BookOrder for Offer {
    fn from_request(id: OrderId, request: OrderRequest) -> Self {
        Self {
            id,
            energy: request.energy,
            price: request.price,
            seller: request.owner,
        }
    }

    fn id(&self) -> OrderId {
        self.id
    }

    fn energy(&self) -> f64 {
        self.energy
    }

    fn price(&self) -> f64 {
        self.price
    }

    fn owner(&self) -> &str {
        &self.seller
    }

    fn reissue(&self, id: OrderId, energy: f64) -> Self {
        Self {
            id,
            energy,
            ..self.clone()
        }
    }
}

impl BookOrder for Bid {
    fn from_request(id: OrderId, request: OrderRequest) -> Self {
        Self {
            id,
            energy: request.energy,
            price: request.price,
            buyer: request.owner,
        }
    }

    fn id(&self) -> OrderId {
        self.id
    }

    fn energy(&self) -> f64 {
        self.energy
    }

    fn price(&self) -> f64 {
        self.price
    }

    fn owner(&self) -> &str {
        &self.buyer
    }

    fn reissue(&self, id: OrderId, energy: f64) -> Self {
        Self {
            id,
            energy,
            ..self.clone()
        }
    }
}

/// An executed match. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trade {
    pub id: TradeId,
    /// Offer consumed by this trade (its id before any split).
    pub offer_id: OrderId,
    /// Bid consumed by this trade; `None` for direct offer acceptance.
    pub bid_id: Option<OrderId>,
    pub seller: String,
    pub buyer: String,
    /// Energy exchanged (kWh, > 0).
    pub traded_energy: f64,
    /// Energy rate paid (>= 0).
    pub traded_price: f64,
    pub time_slot: u64,
    /// Id of the offer remainder left open, if the offer was partially filled.
    pub residual_offer_id: Option<OrderId>,
    /// Id of the bid remainder left open, if the bid was partially filled.
    pub residual_bid_id: Option<OrderId>,
    /// Grid fee rate retained when the trade crossed an area boundary.
    pub fee_price: f64,
}

impl Trade {
    /// Total value of the trade (`energy * rate`).
    pub fn total_price(&self) -> f64 {
        self.traded_energy * self.traded_price
    }

    /// Returns `true` if `name` is the buyer or the seller.
    pub fn involves(&self, name: &str) -> bool {
        self.seller == name || self.buyer == name
    }
}

impl fmt::Display for Trade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[slot {}] {} -> {}: {:.4} kWh @ {:.4}",
            self.time_slot, self.seller, self.buyer, self.traded_energy, self.traded_price
        )?;
        if self.fee_price > 0.0 {
            write!(f, " (fee {:.4})", self.fee_price)?;
        }
        Ok(())
    }
}
