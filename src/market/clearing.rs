//! Matching algorithms turning open orders into trades.
//!
//! Planning is a pure function of the sorted bid and offer lists
//! ([`ClearingEngine::plan`]); applying a plan splits the matched orders in
//! the book and records trades ([`ClearingEngine::clear`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::book::OfferBook;
use super::order::{Bid, FLOATING_POINT_TOLERANCE, Offer, OrderId, Trade, TradeId};
use crate::error::Result;

/// Market design, selecting the matching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    /// Buyers accept offers directly; no bid book.
    #[serde(alias = "one-sided")]
    OneSided,
    /// Two-sided; each matched pair trades at the bid's price.
    #[default]
    #[serde(alias = "two_sided_pay_as_bid", alias = "pay-as-bid")]
    PayAsBid,
    /// Two-sided; every trade of a pass settles at one clearing price.
    #[serde(alias = "two_sided_pay_as_clear", alias = "pay-as-clear")]
    PayAsClear,
}

impl MarketType {
    /// All selectable market types.
    pub const ALL: &[MarketType] = &[Self::OneSided, Self::PayAsBid, Self::PayAsClear];

    pub fn is_two_sided(self) -> bool {
        !matches!(self, Self::OneSided)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OneSided => "one_sided",
            Self::PayAsBid => "pay_as_bid",
            Self::PayAsClear => "pay_as_clear",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "one_sided" => Ok(Self::OneSided),
            "pay_as_bid" | "two_sided_pay_as_bid" => Ok(Self::PayAsBid),
            "pay_as_clear" | "two_sided_pay_as_clear" => Ok(Self::PayAsClear),
            other => Err(format!(
                "unknown market type `{other}` (expected one_sided, pay_as_bid or pay_as_clear)"
            )),
        }
    }
}

/// One planned bid/offer pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub bid_id: OrderId,
    pub offer_id: OrderId,
    pub energy: f64,
    pub price: f64,
}

/// Result of planning a clearing pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ClearingOutcome {
    /// Uniform price of a pay-as-clear pass; `None` for pay-as-bid or when
    /// nothing cleared.
    pub clearing_price: Option<f64>,
    pub matches: Vec<Match>,
}

impl ClearingOutcome {
    pub fn matched_energy(&self) -> f64 {
        self.matches.iter().map(|m| m.energy).sum()
    }
}

/// Stateless matcher for one market design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearingEngine {
    market_type: MarketType,
}

impl ClearingEngine {
    pub fn new(market_type: MarketType) -> Self {
        Self { market_type }
    }

    pub fn market_type(&self) -> MarketType {
        self.market_type
    }

    /// Plans a clearing pass.
    ///
    /// # Arguments
    ///
    /// * `bids` - Open bids, highest price first (FIFO within a price)
    /// * `offers` - Open offers, cheapest first (FIFO within a price)
    ///
    /// # Returns
    ///
    /// The matches to execute, in execution order. One-sided markets never
    /// batch-clear and always return an empty outcome.
    pub fn plan(&self, bids: &[Bid], offers: &[Offer]) -> ClearingOutcome {
        match self.market_type {
            MarketType::OneSided => ClearingOutcome::default(),
            MarketType::PayAsBid => ClearingOutcome {
                clearing_price: None,
                matches: walk(bids, offers, f64::INFINITY, |bid, offer| {
                    (bid.price >= offer.price).then_some(bid.price)
                }),
            },
            MarketType::PayAsClear => match clearing_point(bids, offers) {
                Some((quantity, price)) => ClearingOutcome {
                    clearing_price: Some(price),
                    matches: walk(bids, offers, quantity, |_, _| Some(price)),
                },
                None => ClearingOutcome::default(),
            },
        }
    }

    /// Runs one clearing pass against `book`, splitting matched orders.
    ///
    /// A book with no changes since the previous pass is left alone, so
    /// repeated calls without new orders produce no further trades.
    ///
    /// # Errors
    ///
    /// Propagates book errors (`MarketClosed`, `NotFound`, `InvalidEnergy`).
    pub fn clear(&self, book: &mut OfferBook, time_slot: u64) -> Result<Vec<Trade>> {
        if !self.market_type.is_two_sided() || !book.is_dirty() {
            return Ok(Vec::new());
        }
        let bids = book.sorted_bids();
        let offers = book.sorted_offers();
        let outcome = self.plan(&bids, &offers);

        let mut trades = Vec::with_capacity(outcome.matches.len());
        for m in &outcome.matches {
            let offer_id = book.resolve(m.offer_id);
            let bid_id = book.resolve(m.bid_id);
            let (offer, residual_offer_id) = book.split_offer(offer_id, m.energy)?;
            let (bid, residual_bid_id) = book.split_bid(bid_id, m.energy)?;
            trace!(%offer_id, %bid_id, energy = m.energy, price = m.price, "matched");
            trades.push(Trade {
                id: TradeId::new(),
                offer_id,
                bid_id: Some(bid_id),
                seller: offer.seller,
                buyer: bid.buyer,
                traded_energy: m.energy,
                traded_price: m.price,
                time_slot,
                residual_offer_id,
                residual_bid_id,
                fee_price: 0.0,
            });
        }
        book.mark_clean();

        if !trades.is_empty() {
            debug!(
                slot = time_slot,
                market_type = %self.market_type,
                trades = trades.len(),
                energy = outcome.matched_energy(),
                clearing_price = ?outcome.clearing_price,
                "clearing pass"
            );
        }
        Ok(trades)
    }
}

/// Pairs bids (in order) with offers (in order) until `cap` energy is matched.
///
/// `price_for` returns the trade price for a pair or `None` when the pair
/// does not cross; since offers are ascending, a non-crossing offer ends the
/// scan for that bid. Pairs sharing an owner are skipped.
fn walk(
    bids: &[Bid],
    offers: &[Offer],
    cap: f64,
    price_for: impl Fn(&Bid, &Offer) -> Option<f64>,
) -> Vec<Match> {
    let mut offer_left: Vec<f64> = offers.iter().map(|o| o.energy).collect();
    let mut matched_total = 0.0;
    let mut matches = Vec::new();

    for bid in bids {
        let mut bid_left = bid.energy;
        for (j, offer) in offers.iter().enumerate() {
            let cap_left = cap - matched_total;
            if bid_left <= FLOATING_POINT_TOLERANCE || cap_left <= FLOATING_POINT_TOLERANCE {
                break;
            }
            if offer_left[j] <= FLOATING_POINT_TOLERANCE {
                continue;
            }
            let Some(price) = price_for(bid, offer) else {
                break;
            };
            if offer.seller == bid.buyer {
                trace!(owner = %bid.buyer, "skipping self match");
                continue;
            }
            let energy = bid_left.min(offer_left[j]).min(cap_left);
            bid_left -= energy;
            offer_left[j] -= energy;
            matched_total += energy;
            matches.push(Match {
                bid_id: bid.id,
                offer_id: offer.id,
                energy,
                price,
            });
        }
        if cap - matched_total <= FLOATING_POINT_TOLERANCE {
            break;
        }
    }
    matches
}

/// Integral of a step curve given as `(energy, price)` segments up to `q`.
fn cumulative_value(segments: impl Iterator<Item = (f64, f64)>, q: f64) -> f64 {
    let mut left = q;
    let mut total = 0.0;
    for (energy, price) in segments {
        if left <= 0.0 {
            break;
        }
        let take = energy.min(left);
        total += take * price;
        left -= take;
    }
    total
}

/// Finds the pay-as-clear quantity and price.
///
/// Q* is the largest quantity (up to the smaller total volume) at which the
/// total value buyers place on the first Q* kWh still covers the total cost
/// sellers ask for them. The surplus `demand(q) - supply(q)` is concave and
/// piecewise linear, so walking the curve breakpoints and solving the first
/// segment where it turns negative finds Q*. The price is that of the
/// marginal offer at Q*.
fn clearing_point(bids: &[Bid], offers: &[Offer]) -> Option<(f64, f64)> {
    let total_demand: f64 = bids.iter().map(|b| b.energy).sum();
    let total_supply: f64 = offers.iter().map(|o| o.energy).sum();
    let limit = total_demand.min(total_supply);
    if limit <= FLOATING_POINT_TOLERANCE {
        return None;
    }

    let demand = |q: f64| cumulative_value(bids.iter().map(|b| (b.energy, b.price)), q);
    let supply = |q: f64| cumulative_value(offers.iter().map(|o| (o.energy, o.price)), q);
    let surplus = |q: f64| demand(q) - supply(q);

    let mut breakpoints: Vec<f64> = Vec::new();
    let mut acc = 0.0;
    for b in bids {
        acc += b.energy;
        breakpoints.push(acc);
    }
    acc = 0.0;
    for o in offers {
        acc += o.energy;
        breakpoints.push(acc);
    }
    breakpoints.retain(|&q| q < limit - FLOATING_POINT_TOLERANCE);
    breakpoints.push(limit);
    breakpoints.sort_by(f64::total_cmp);
    breakpoints.dedup_by(|a, b| (*a - *b).abs() <= FLOATING_POINT_TOLERANCE);

    let mut quantity = limit;
    let mut prev = 0.0;
    let mut prev_surplus = 0.0;
    for &q in &breakpoints {
        let s = surplus(q);
        if s < -FLOATING_POINT_TOLERANCE {
            let slope = (s - prev_surplus) / (q - prev);
            quantity = prev - prev_surplus / slope;
            break;
        }
        prev = q;
        prev_surplus = s;
    }

    if quantity <= FLOATING_POINT_TOLERANCE {
        return None;
    }
    let price = marginal_offer_price(offers, quantity)?;
    Some((quantity, price))
}

fn marginal_offer_price(offers: &[Offer], quantity: f64) -> Option<f64> {
    let mut acc = 0.0;
    for offer in offers {
        acc += offer.energy;
        if acc >= quantity - FLOATING_POINT_TOLERANCE {
            return Some(offer.price);
        }
    }
    offers.last().map(|o| o.price)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::order::{BookOrder, OrderRequest};

    fn bid(energy: f64, price: f64, buyer: &str) -> Bid {
        Bid::from_request(OrderId::new(), OrderRequest::new(energy, price, buyer))
    }

    fn offer(energy: f64, price: f64, seller: &str) -> Offer {
        Offer::from_request(OrderId::new(), OrderRequest::new(energy, price, seller))
    }

    fn scenario() -> (Vec<Bid>, Vec<Offer>) {
        (
            vec![bid(2.0, 10.0, "B1"), bid(1.0, 8.0, "B2")],
            vec![offer(1.0, 5.0, "S1"), offer(2.0, 9.0, "S2")],
        )
    }

    #[test]
    fn pay_as_bid_pays_bid_price() {
        let (bids, offers) = scenario();
        let outcome = ClearingEngine::new(MarketType::PayAsBid).plan(&bids, &offers);
        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].offer_id, offers[0].id);
        assert_eq!(outcome.matches[1].offer_id, offers[1].id);
        for m in &outcome.matches {
            assert_eq!(m.bid_id, bids[0].id);
            assert_eq!(m.energy, 1.0);
            assert_eq!(m.price, 10.0);
        }
        assert_eq!(outcome.clearing_price, None);
    }

    #[test]
    fn pay_as_clear_single_price() {
        let (bids, offers) = scenario();
        let outcome = ClearingEngine::new(MarketType::PayAsClear).plan(&bids, &offers);
        assert_eq!(outcome.clearing_price, Some(9.0));
        assert!((outcome.matched_energy() - 3.0).abs() < 1e-9);
        assert!(outcome.matches.iter().all(|m| m.price == 9.0));
    }

    #[test]
    fn pay_as_clear_without_crossing_is_empty() {
        let bids = vec![bid(1.0, 3.0, "B")];
        let offers = vec![offer(1.0, 4.0, "S")];
        let outcome = ClearingEngine::new(MarketType::PayAsClear).plan(&bids, &offers);
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.clearing_price, None);
    }

    #[test]
    fn pay_as_clear_stops_inside_segment() {
        // surplus: +5 at q=1, then slope 1-9=-8 => Q* = 1 + 5/8
        let bids = vec![bid(1.0, 10.0, "B1"), bid(5.0, 1.0, "B2")];
        let offers = vec![offer(1.0, 5.0, "S1"), offer(5.0, 9.0, "S2")];
        let outcome = ClearingEngine::new(MarketType::PayAsClear).plan(&bids, &offers);
        assert!((outcome.matched_energy() - 1.625).abs() < 1e-9);
        assert_eq!(outcome.clearing_price, Some(9.0));
    }

    #[test]
    fn self_match_is_skipped() {
        let bids = vec![bid(1.0, 10.0, "Battery")];
        let offers = vec![offer(1.0, 2.0, "Battery"), offer(1.0, 3.0, "PV")];
        let outcome = ClearingEngine::new(MarketType::PayAsBid).plan(&bids, &offers);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].offer_id, offers[1].id);
    }

    #[test]
    fn one_sided_plans_nothing() {
        let (bids, offers) = scenario();
        let outcome = ClearingEngine::new(MarketType::OneSided).plan(&bids, &offers);
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn clear_splits_and_is_idempotent() {
        let mut book = OfferBook::new(0);
        book.post_bid(OrderRequest::new(2.0, 10.0, "B1")).unwrap();
        book.post_bid(OrderRequest::new(1.0, 8.0, "B2")).unwrap();
        book.post_offer(OrderRequest::new(1.0, 5.0, "S1")).unwrap();
        book.post_offer(OrderRequest::new(2.0, 9.0, "S2")).unwrap();

        let engine = ClearingEngine::new(MarketType::PayAsBid);
        let trades = engine.clear(&mut book, 0).unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades[1].residual_offer_id.is_some());
        assert!((book.total_offer_energy() - 1.0).abs() < 1e-9);
        assert!((book.total_bid_energy() - 1.0).abs() < 1e-9);

        assert!(engine.clear(&mut book, 0).unwrap().is_empty());
    }

    #[test]
    fn market_type_parses_aliases() {
        assert_eq!("two_sided_pay_as_clear".parse(), Ok(MarketType::PayAsClear));
        assert_eq!("One-Sided".parse(), Ok(MarketType::OneSided));
        assert!("auction".parse::<MarketType>().is_err());
    }
}
