//! A single market slot: order book, clearing policy and trade record.

use serde::Serialize;
use tracing::{debug, trace};

use super::book::OfferBook;
use super::clearing::{ClearingEngine, MarketType};
use super::order::{Bid, FLOATING_POINT_TOLERANCE, Offer, OrderId, OrderRequest, Trade, TradeId};
use crate::error::{Result, SimError};

/// Market for one area and one time slot.
///
/// Mutable while its slot is current; [`Market::close`] freezes it into
/// readonly history.
#[derive(Debug, Clone)]
pub struct Market {
    time_slot: u64,
    market_type: MarketType,
    book: OfferBook,
    engine: ClearingEngine,
    trades: Vec<Trade>,
    readonly: bool,
}

impl Market {
    pub fn new(time_slot: u64, market_type: MarketType) -> Self {
        Self {
            time_slot,
            market_type,
            book: OfferBook::new(time_slot),
            engine: ClearingEngine::new(market_type),
            trades: Vec::new(),
            readonly: false,
        }
    }

    pub fn time_slot(&self) -> u64 {
        self.time_slot
    }

    pub fn market_type(&self) -> MarketType {
        self.market_type
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn book(&self) -> &OfferBook {
        &self.book
    }

    /// Open offers in FIFO order.
    pub fn offers(&self) -> Vec<&Offer> {
        self.book.offers()
    }

    /// Open bids in FIFO order (always empty in one-sided markets).
    pub fn bids(&self) -> Vec<&Bid> {
        self.book.bids()
    }

    /// Every trade recorded in this market, oldest first.
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Trades recorded at or after position `index`.
    pub fn trades_since(&self, index: usize) -> &[Trade] {
        self.trades.get(index..).unwrap_or(&[])
    }

    fn check_open(&self) -> Result<()> {
        if self.readonly {
            Err(SimError::MarketClosed {
                slot: self.time_slot,
            })
        } else {
            Ok(())
        }
    }

    pub fn post_offer(&mut self, request: OrderRequest) -> Result<OrderId> {
        self.book.post_offer(request)
    }

    /// Posts a bid.
    ///
    /// # Errors
    ///
    /// `InvalidOrder` in one-sided markets, otherwise as
    /// [`OfferBook::post_bid`].
    pub fn post_bid(&mut self, request: OrderRequest) -> Result<OrderId> {
        if !self.market_type.is_two_sided() {
            return Err(SimError::InvalidOrder(
                "bids are not accepted in a one-sided market".into(),
            ));
        }
        self.book.post_bid(request)
    }

    pub fn delete_order(&mut self, id: OrderId) -> Result<()> {
        self.book.delete(id)
    }

    pub fn replace_offer(&mut self, old_id: OrderId, request: OrderRequest) -> Result<Option<OrderId>> {
        self.book.replace_offer(old_id, request)
    }

    pub fn replace_bid(&mut self, old_id: OrderId, request: OrderRequest) -> Result<Option<OrderId>> {
        self.book.replace_bid(old_id, request)
    }

    pub(crate) fn delete_owned_by(&mut self, owner: &str) -> Result<usize> {
        self.book.delete_owned_by(owner)
    }

    /// Buys `energy` (default: all of it) from an open offer at its price.
    ///
    /// # Errors
    ///
    /// * `MarketClosed` - the market is readonly
    /// * `NotFound` - the offer is not open
    /// * `InvalidOrder` - `buyer` is the offer's seller
    /// * `InvalidEnergy` - `energy` is not positive or exceeds the offer
    pub fn accept_offer(&mut self, offer_id: OrderId, buyer: &str, energy: Option<f64>) -> Result<Trade> {
        self.fill_offer(offer_id, buyer, energy, None, 0.0)
    }

    /// Buys from an offer on behalf of a parent-market trade, at the
    /// fee-reverted `price`.
    pub(crate) fn accept_forwarded_offer(
        &mut self,
        offer_id: OrderId,
        buyer: &str,
        energy: f64,
        price: f64,
        fee_price: f64,
    ) -> Result<Trade> {
        self.fill_offer(offer_id, buyer, Some(energy), Some(price), fee_price)
    }

    /// Sells into an open bid on behalf of a parent-market trade.
    ///
    /// The seller's side has no order in this book; the trade's `offer_id`
    /// is a fresh id standing for the agent's counter-offer.
    pub(crate) fn accept_forwarded_bid(
        &mut self,
        bid_id: OrderId,
        seller: &str,
        energy: f64,
        price: f64,
        fee_price: f64,
    ) -> Result<Trade> {
        self.check_open()?;
        let bid = self
            .book
            .bid(bid_id)
            .cloned()
            .ok_or_else(|| SimError::NotFound(format!("bid {bid_id}")))?;
        if bid.buyer == seller {
            return Err(SimError::InvalidOrder(format!("{seller} cannot sell to itself")));
        }
        let (matched, residual_bid_id) = self.book.split_bid(bid_id, energy)?;
        let trade = Trade {
            id: TradeId::new(),
            offer_id: OrderId::new(),
            bid_id: Some(bid_id),
            seller: seller.to_string(),
            buyer: matched.buyer,
            traded_energy: energy,
            traded_price: price,
            time_slot: self.time_slot,
            residual_offer_id: None,
            residual_bid_id,
            fee_price,
        };
        trace!(%trade, "forwarded bid fill");
        self.trades.push(trade.clone());
        Ok(trade)
    }

    fn fill_offer(
        &mut self,
        offer_id: OrderId,
        buyer: &str,
        energy: Option<f64>,
        price: Option<f64>,
        fee_price: f64,
    ) -> Result<Trade> {
        self.check_open()?;
        let offer = self
            .book
            .offer(offer_id)
            .cloned()
            .ok_or_else(|| SimError::NotFound(format!("offer {offer_id}")))?;
        if offer.seller == buyer {
            return Err(SimError::InvalidOrder(format!("{buyer} cannot buy its own offer")));
        }
        let energy = energy.unwrap_or(offer.energy);
        if energy <= FLOATING_POINT_TOLERANCE || energy > offer.energy + FLOATING_POINT_TOLERANCE {
            return Err(SimError::InvalidEnergy {
                requested: energy,
                available: offer.energy,
            });
        }
        let (matched, residual_offer_id) = self.book.split_offer(offer_id, energy)?;
        let trade = Trade {
            id: TradeId::new(),
            offer_id,
            bid_id: None,
            seller: matched.seller,
            buyer: buyer.to_string(),
            traded_energy: energy,
            traded_price: price.unwrap_or(offer.price),
            time_slot: self.time_slot,
            residual_offer_id,
            residual_bid_id: None,
            fee_price,
        };
        trace!(%trade, "offer accepted");
        self.trades.push(trade.clone());
        Ok(trade)
    }

    /// Takes back a trade that has not been handed to anyone yet.
    ///
    /// A side flagged in `drop_offer`/`drop_bid` is not given back: its open
    /// remainder is withdrawn too. The other side gets its energy back.
    ///
    /// # Errors
    ///
    /// `MarketClosed` if the market is readonly, `NotFound` if no such trade
    /// was recorded.
    pub(crate) fn withdraw_trade(&mut self, trade_id: TradeId, drop_offer: bool, drop_bid: bool) -> Result<Trade> {
        self.check_open()?;
        let index = self
            .trades
            .iter()
            .rposition(|t| t.id == trade_id)
            .ok_or_else(|| SimError::NotFound(format!("trade {trade_id}")))?;
        let trade = self.trades.remove(index);
        if drop_offer {
            if let Some(residual) = trade.residual_offer_id.filter(|id| self.book.contains(*id)) {
                self.book.delete(residual)?;
            }
        } else {
            self.book.restore_offer(trade.offer_id, trade.traded_energy)?;
        }
        if let Some(bid_id) = trade.bid_id {
            if drop_bid {
                if let Some(residual) = trade.residual_bid_id.filter(|id| self.book.contains(*id)) {
                    self.book.delete(residual)?;
                }
            } else {
                self.book.restore_bid(bid_id, trade.traded_energy)?;
            }
        }
        debug!(slot = self.time_slot, trade = %trade.id, "trade withdrawn");
        Ok(trade)
    }

    /// Runs one clearing pass (two-sided markets only) and records the trades.
    ///
    /// # Errors
    ///
    /// `MarketClosed` if the market is readonly; the market is left untouched.
    pub fn run_clearing(&mut self) -> Result<Vec<Trade>> {
        self.check_open()?;
        let trades = self.engine.clear(&mut self.book, self.time_slot)?;
        self.trades.extend(trades.iter().cloned());
        Ok(trades)
    }

    /// Freezes the market. Idempotent.
    pub fn close(&mut self) {
        if !self.readonly {
            self.readonly = true;
            self.book.close();
            debug!(slot = self.time_slot, trades = self.trades.len(), "market closed");
        }
    }

    /// Aggregate figures for this market.
    pub fn summary(&self) -> MarketSummary {
        MarketSummary::from_market(self)
    }
}

/// Aggregate trade figures of one market.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketSummary {
    pub time_slot: u64,
    pub trade_count: usize,
    /// Total traded energy (kWh).
    pub traded_energy: f64,
    /// Energy-weighted average rate; `None` without trades.
    pub avg_price: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    /// Offer energy still open (kWh).
    pub unmatched_offer_energy: f64,
    /// Bid energy still open (kWh).
    pub unmatched_bid_energy: f64,
    /// Grid fees retained (`fee_price * energy`, summed).
    pub fees: f64,
}

impl MarketSummary {
    fn from_market(market: &Market) -> Self {
        let trades = market.trades();
        let traded_energy: f64 = trades.iter().map(|t| t.traded_energy).sum();
        let value: f64 = trades.iter().map(Trade::total_price).sum();
        let prices = trades.iter().map(|t| t.traded_price);
        Self {
            time_slot: market.time_slot(),
            trade_count: trades.len(),
            traded_energy,
            avg_price: (traded_energy > FLOATING_POINT_TOLERANCE).then(|| value / traded_energy),
            min_price: prices.clone().reduce(f64::min),
            max_price: prices.reduce(f64::max),
            unmatched_offer_energy: market.book().total_offer_energy(),
            unmatched_bid_energy: market.book().total_bid_energy(),
            fees: trades.iter().map(|t| t.fee_price * t.traded_energy).sum(),
        }
    }
}
