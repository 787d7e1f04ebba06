//! Open-order storage for a single market.
//!
//! The book keeps offers and bids keyed by id together with a priority
//! sequence used for FIFO tie-breaks. Splitting an order retires its id and
//! records where the remainder went, so callers holding a stale id can follow
//! the chain with [`OfferBook::resolve`].

use std::collections::HashMap;

use tracing::{trace, warn};

use super::order::{BookOrder, Bid, FLOATING_POINT_TOLERANCE, Offer, OrderId, OrderRequest};
use crate::error::{Result, SimError};

#[derive(Debug, Clone)]
struct Entry<T> {
    seq: u64,
    order: T,
}

/// One side of the book (all offers or all bids).
#[derive(Debug, Clone)]
struct Side<T> {
    open: HashMap<OrderId, Entry<T>>,
    retired: HashMap<OrderId, OrderId>,
    /// Last matched portion of every split order, for restoring it.
    filled: HashMap<OrderId, Entry<T>>,
}

impl<T> Default for Side<T> {
    fn default() -> Self {
        Self {
            open: HashMap::new(),
            retired: HashMap::new(),
            filled: HashMap::new(),
        }
    }
}

impl<T: BookOrder> Side<T> {
    fn get(&self, id: OrderId) -> Option<&T> {
        self.open.get(&id).map(|e| &e.order)
    }

    fn fifo(&self) -> Vec<&T> {
        let mut entries: Vec<&Entry<T>> = self.open.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.order).collect()
    }

    /// Open orders sorted by price (ascending unless `descending`), FIFO within a price.
    fn by_price(&self, descending: bool) -> Vec<T> {
        let mut entries: Vec<&Entry<T>> = self.open.values().collect();
        entries.sort_by(|a, b| {
            let by_price = a.order.price().total_cmp(&b.order.price());
            let by_price = if descending {
                by_price.reverse()
            } else {
                by_price
            };
            by_price.then(a.seq.cmp(&b.seq))
        });
        entries.into_iter().map(|e| e.order.clone()).collect()
    }

    fn total_energy(&self) -> f64 {
        self.open.values().map(|e| e.order.energy()).sum()
    }

    fn resolve(&self, mut id: OrderId) -> OrderId {
        while let Some(next) = self.retired.get(&id) {
            id = *next;
        }
        id
    }

    /// Removes the matched portion of `id`, leaving the remainder open under a new id.
    fn split(&mut self, id: OrderId, matched: f64) -> Result<(T, Option<OrderId>)> {
        let Some(entry) = self.open.get(&id) else {
            return Err(SimError::NotFound(format!("order {id}")));
        };
        let available = entry.order.energy();
        if matched <= FLOATING_POINT_TOLERANCE || matched > available + FLOATING_POINT_TOLERANCE {
            return Err(SimError::InvalidEnergy {
                requested: matched,
                available,
            });
        }

        let Some(entry) = self.open.remove(&id) else {
            return Err(SimError::NotFound(format!("order {id}")));
        };
        let remainder = available - matched;
        let matched_part = entry.order.reissue(id, matched);
        self.filled.insert(
            id,
            Entry {
                seq: entry.seq,
                order: matched_part.clone(),
            },
        );
        if remainder <= FLOATING_POINT_TOLERANCE {
            return Ok((matched_part, None));
        }

        let residual_id = OrderId::new();
        let residual = entry.order.reissue(residual_id, remainder);
        self.open.insert(
            residual_id,
            Entry {
                seq: entry.seq,
                order: residual,
            },
        );
        self.retired.insert(id, residual_id);
        trace!(%id, %residual_id, matched, remainder, "split order");
        Ok((matched_part, Some(residual_id)))
    }

    /// Puts `energy` back on the order `id` was split from. The open
    /// remainder grows if there is one; otherwise the order reopens under
    /// `id` with its old priority. Returns `false` if `id` was never matched
    /// in this book.
    fn restore(&mut self, id: OrderId, energy: f64) -> bool {
        let current = self.resolve(id);
        if let Some(entry) = self.open.get_mut(&current) {
            let grown = entry.order.reissue(current, entry.order.energy() + energy);
            entry.order = grown;
            return true;
        }
        let Some(filled) = self.filled.get(&id) else {
            return false;
        };
        let entry = Entry {
            seq: filled.seq,
            order: filled.order.reissue(id, energy),
        };
        self.open.insert(id, entry);
        self.retired.remove(&id);
        true
    }
}

/// Open bids and offers of one market slot.
#[derive(Debug, Clone)]
pub struct OfferBook {
    time_slot: u64,
    offers: Side<Offer>,
    bids: Side<Bid>,
    next_seq: u64,
    closed: bool,
    dirty: bool,
}

impl OfferBook {
    /// Creates an empty book for `time_slot`.
    pub fn new(time_slot: u64) -> Self {
        Self {
            time_slot,
            offers: Side::default(),
            bids: Side::default(),
            next_seq: 0,
            closed: false,
            dirty: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(SimError::MarketClosed {
                slot: self.time_slot,
            })
        } else {
            Ok(())
        }
    }

    fn check_request(request: &OrderRequest) -> Result<()> {
        if !request.energy.is_finite() || request.energy <= FLOATING_POINT_TOLERANCE {
            return Err(SimError::InvalidOrder(format!(
                "energy must be positive, got {}",
                request.energy
            )));
        }
        if !request.price.is_finite() || request.price < 0.0 {
            return Err(SimError::InvalidOrder(format!(
                "price must be non-negative, got {}",
                request.price
            )));
        }
        Ok(())
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Posts a new offer.
    ///
    /// # Errors
    ///
    /// `MarketClosed` if the book is closed, `InvalidOrder` if energy is not
    /// positive or the price is negative.
    pub fn post_offer(&mut self, request: OrderRequest) -> Result<OrderId> {
        self.check_open()?;
        Self::check_request(&request)?;
        let id = OrderId::new();
        let seq = self.take_seq();
        trace!(%id, energy = request.energy, price = request.price, seller = %request.owner, "post offer");
        self.offers.open.insert(
            id,
            Entry {
                seq,
                order: Offer::from_request(id, request),
            },
        );
        self.dirty = true;
        Ok(id)
    }

    /// Posts a new bid. Same validation as [`OfferBook::post_offer`].
    pub fn post_bid(&mut self, request: OrderRequest) -> Result<OrderId> {
        self.check_open()?;
        Self::check_request(&request)?;
        let id = OrderId::new();
        let seq = self.take_seq();
        trace!(%id, energy = request.energy, price = request.price, buyer = %request.owner, "post bid");
        self.bids.open.insert(
            id,
            Entry {
                seq,
                order: Bid::from_request(id, request),
            },
        );
        self.dirty = true;
        Ok(id)
    }

    /// Removes an open offer or bid.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` is not open on either side.
    pub fn delete(&mut self, id: OrderId) -> Result<()> {
        self.check_open()?;
        if self.offers.open.remove(&id).is_some() || self.bids.open.remove(&id).is_some() {
            trace!(%id, "deleted order");
            self.dirty = true;
            Ok(())
        } else {
            Err(SimError::NotFound(format!("order {id}")))
        }
    }

    /// Removes every open order owned by `owner`; returns how many went.
    ///
    /// # Errors
    ///
    /// `MarketClosed` if the book is closed.
    pub fn delete_owned_by(&mut self, owner: &str) -> Result<usize> {
        self.check_open()?;
        let before = self.offers.open.len() + self.bids.open.len();
        self.offers.open.retain(|_, e| e.order.seller != owner);
        self.bids.open.retain(|_, e| e.order.buyer != owner);
        let removed = before - self.offers.open.len() - self.bids.open.len();
        if removed > 0 {
            self.dirty = true;
        }
        Ok(removed)
    }

    /// Atomically swaps an open offer for a re-priced one.
    ///
    /// Returns `Ok(None)` without touching the book when `old_id` is no longer
    /// open (it was consumed by a trade in the meantime).
    pub fn replace_offer(
        &mut self,
        old_id: OrderId,
        request: OrderRequest,
    ) -> Result<Option<OrderId>> {
        self.check_open()?;
        Self::check_request(&request)?;
        if self.offers.open.remove(&old_id).is_none() {
            warn!(%old_id, "offer already taken, skipping replace");
            return Ok(None);
        }
        self.post_offer(request).map(Some)
    }

    /// Bid counterpart of [`OfferBook::replace_offer`].
    pub fn replace_bid(
        &mut self,
        old_id: OrderId,
        request: OrderRequest,
    ) -> Result<Option<OrderId>> {
        self.check_open()?;
        Self::check_request(&request)?;
        if self.bids.open.remove(&old_id).is_none() {
            warn!(%old_id, "bid already taken, skipping replace");
            return Ok(None);
        }
        self.post_bid(request).map(Some)
    }

    /// Takes `matched_energy` off an open offer and marks the book dirty.
    ///
    /// # Returns
    ///
    /// The matched portion (carrying the original id) and, when energy is
    /// left over, the id of the residual offer that stays open.
    ///
    /// # Errors
    ///
    /// `NotFound` if the offer is not open, `InvalidEnergy` if
    /// `matched_energy` is not positive or exceeds the open energy.
    pub fn split_offer(
        &mut self,
        id: OrderId,
        matched_energy: f64,
    ) -> Result<(Offer, Option<OrderId>)> {
        self.check_open()?;
        let split = self.offers.split(id, matched_energy)?;
        self.dirty = true;
        Ok(split)
    }

    /// Bid counterpart of [`OfferBook::split_offer`].
    pub fn split_bid(&mut self, id: OrderId, matched_energy: f64) -> Result<(Bid, Option<OrderId>)> {
        self.check_open()?;
        let split = self.bids.split(id, matched_energy)?;
        self.dirty = true;
        Ok(split)
    }

    /// Undoes `energy` of a match against offer `id` (see
    /// [`OfferBook::restore_bid`]).
    pub(crate) fn restore_offer(&mut self, id: OrderId, energy: f64) -> Result<bool> {
        self.check_open()?;
        let restored = self.offers.restore(id, energy);
        self.dirty |= restored;
        Ok(restored)
    }

    /// Undoes `energy` of a match against bid `id`: the remainder grows back,
    /// or a fully matched bid reopens with its old priority. `Ok(false)` if the
    /// bid was never matched here.
    pub(crate) fn restore_bid(&mut self, id: OrderId, energy: f64) -> Result<bool> {
        self.check_open()?;
        let restored = self.bids.restore(id, energy);
        self.dirty |= restored;
        Ok(restored)
    }

    pub fn offer(&self, id: OrderId) -> Option<&Offer> {
        self.offers.get(id)
    }

    pub fn bid(&self, id: OrderId) -> Option<&Bid> {
        self.bids.get(id)
    }

    /// Returns `true` if `id` is an open offer or bid.
    pub fn contains(&self, id: OrderId) -> bool {
        self.offers.open.contains_key(&id) || self.bids.open.contains_key(&id)
    }

    /// Open offers in FIFO order.
    pub fn offers(&self) -> Vec<&Offer> {
        self.offers.fifo()
    }

    /// Open bids in FIFO order.
    pub fn bids(&self) -> Vec<&Bid> {
        self.bids.fifo()
    }

    /// Open offers posted by `owner`, in FIFO order.
    pub fn offers_by_owner(&self, owner: &str) -> Vec<&Offer> {
        self.offers().into_iter().filter(|o| o.seller == owner).collect()
    }

    /// Open bids posted by `owner`, in FIFO order.
    pub fn bids_by_owner(&self, owner: &str) -> Vec<&Bid> {
        self.bids().into_iter().filter(|b| b.buyer == owner).collect()
    }

    /// Open offers, cheapest first.
    pub fn sorted_offers(&self) -> Vec<Offer> {
        self.offers.by_price(false)
    }

    /// Open bids, highest price first.
    pub fn sorted_bids(&self) -> Vec<Bid> {
        self.bids.by_price(true)
    }

    /// Follows the retired-to-residual chain to the id currently holding
    /// what is left of `id`. Returns `id` itself if it was never split.
    pub fn resolve(&self, id: OrderId) -> OrderId {
        let offer = self.offers.resolve(id);
        if offer != id {
            offer
        } else {
            self.bids.resolve(id)
        }
    }

    pub fn total_offer_energy(&self) -> f64 {
        self.offers.total_energy()
    }

    pub fn total_bid_energy(&self) -> f64 {
        self.bids.total_energy()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.open.is_empty() && self.bids.open.is_empty()
    }

    /// Rejects all further mutation.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `true` when orders were posted, replaced or deleted since the last
    /// clearing pass.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_with_offer(energy: f64, price: f64) -> (OfferBook, OrderId) {
        let mut book = OfferBook::new(0);
        let id = book
            .post_offer(OrderRequest::new(energy, price, "PV"))
            .unwrap();
        (book, id)
    }

    #[test]
    fn post_rejects_invalid_orders() {
        let mut book = OfferBook::new(0);
        assert!(matches!(
            book.post_offer(OrderRequest::new(0.0, 1.0, "PV")),
            Err(SimError::InvalidOrder(_))
        ));
        assert!(matches!(
            book.post_bid(OrderRequest::new(1.0, -0.5, "Load")),
            Err(SimError::InvalidOrder(_))
        ));
        assert!(matches!(
            book.post_bid(OrderRequest::new(f64::NAN, 1.0, "Load")),
            Err(SimError::InvalidOrder(_))
        ));
        assert!(book.is_empty());
    }

    #[test]
    fn closed_book_rejects_posts() {
        let mut book = OfferBook::new(7);
        book.close();
        assert_eq!(
            book.post_offer(OrderRequest::new(1.0, 1.0, "PV")),
            Err(SimError::MarketClosed { slot: 7 })
        );
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let (mut book, id) = book_with_offer(1.0, 2.0);
        assert!(book.delete(id).is_ok());
        assert!(matches!(book.delete(id), Err(SimError::NotFound(_))));
    }

    #[test]
    fn split_leaves_residual_in_fifo_position() {
        let mut book = OfferBook::new(0);
        let first = book.post_offer(OrderRequest::new(3.0, 5.0, "A")).unwrap();
        let second = book.post_offer(OrderRequest::new(1.0, 5.0, "B")).unwrap();

        let (matched, residual) = book.split_offer(first, 1.0).unwrap();
        assert_eq!(matched.id, first);
        assert_eq!(matched.energy, 1.0);
        let residual = residual.unwrap();
        assert!(book.offer(first).is_none());
        assert_eq!(book.offer(residual).map(|o| o.energy), Some(2.0));
        assert_eq!(book.resolve(first), residual);

        let order: Vec<OrderId> = book.offers().iter().map(|o| o.id).collect();
        assert_eq!(order, vec![residual, second]);
    }

    #[test]
    fn split_full_energy_retires_order() {
        let (mut book, id) = book_with_offer(2.0, 3.0);
        let (matched, residual) = book.split_offer(id, 2.0).unwrap();
        assert_eq!(matched.energy, 2.0);
        assert!(residual.is_none());
        assert!(book.is_empty());
    }

    #[test]
    fn split_more_than_available_fails() {
        let (mut book, id) = book_with_offer(2.0, 3.0);
        assert!(matches!(
            book.split_offer(id, 2.5),
            Err(SimError::InvalidEnergy { .. })
        ));
        assert_eq!(book.total_offer_energy(), 2.0);
    }

    #[test]
    fn replace_consumed_order_is_noop() {
        let (mut book, id) = book_with_offer(2.0, 3.0);
        book.split_offer(id, 2.0).unwrap();
        let replaced = book.replace_offer(id, OrderRequest::new(2.0, 4.0, "PV"));
        assert_eq!(replaced, Ok(None));
        assert!(book.is_empty());
    }

    #[test]
    fn replace_swaps_price() {
        let (mut book, id) = book_with_offer(2.0, 3.0);
        let new_id = book
            .replace_offer(id, OrderRequest::new(2.0, 2.5, "PV"))
            .unwrap()
            .unwrap();
        assert!(book.offer(id).is_none());
        assert_eq!(book.offer(new_id).map(|o| o.price), Some(2.5));
    }

    #[test]
    fn sorted_views_break_ties_by_insertion() {
        let mut book = OfferBook::new(0);
        let a = book.post_bid(OrderRequest::new(1.0, 8.0, "A")).unwrap();
        let b = book.post_bid(OrderRequest::new(1.0, 10.0, "B")).unwrap();
        let c = book.post_bid(OrderRequest::new(1.0, 8.0, "C")).unwrap();
        let ids: Vec<OrderId> = book.sorted_bids().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![b, a, c]);
    }

    #[test]
    fn delete_owned_by_clears_both_sides() {
        let mut book = OfferBook::new(0);
        book.post_offer(OrderRequest::new(1.0, 1.0, "IAA House")).unwrap();
        book.post_bid(OrderRequest::new(1.0, 1.0, "IAA House")).unwrap();
        book.post_bid(OrderRequest::new(1.0, 1.0, "Load")).unwrap();
        assert_eq!(book.offers_by_owner("IAA House").len(), 1);
        assert_eq!(book.bids_by_owner("IAA House").len(), 1);
        assert!(book.offers_by_owner("Load").is_empty());
        assert_eq!(book.delete_owned_by("IAA House"), Ok(2));
        assert_eq!(book.bids().len(), 1);
    }

    #[test]
    fn delete_owned_by_respects_closed_book() {
        let mut book = OfferBook::new(3);
        book.post_offer(OrderRequest::new(1.0, 1.0, "IAA House")).unwrap();
        book.close();
        assert_eq!(
            book.delete_owned_by("IAA House"),
            Err(SimError::MarketClosed { slot: 3 })
        );
        assert_eq!(book.offers().len(), 1);
    }

    #[test]
    fn split_marks_book_dirty() {
        let (mut book, id) = book_with_offer(2.0, 5.0);
        book.mark_clean();
        book.split_offer(id, 1.0).unwrap();
        assert!(book.is_dirty());
    }

    #[test]
    fn restore_reopens_or_grows_matched_orders() {
        let mut book = OfferBook::new(0);
        let first = book.post_bid(OrderRequest::new(2.0, 9.0, "A")).unwrap();
        let second = book.post_bid(OrderRequest::new(1.0, 9.0, "B")).unwrap();

        let (_, residual) = book.split_bid(first, 0.5).unwrap();
        assert_eq!(book.restore_bid(first, 0.5), Ok(true));
        let residual = residual.unwrap();
        assert_eq!(book.bid(residual).unwrap().energy, 2.0);

        book.split_bid(second, 1.0).unwrap();
        assert!(book.bid(second).is_none());
        assert_eq!(book.restore_bid(second, 1.0), Ok(true));
        assert_eq!(book.bid(second).unwrap().energy, 1.0);
        let order: Vec<OrderId> = book.bids().iter().map(|b| b.id).collect();
        assert_eq!(order, vec![residual, second]);

        assert_eq!(book.restore_offer(OrderId::new(), 1.0), Ok(false));
    }
}
