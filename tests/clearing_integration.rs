mod common;

use gridmarket_sim::error::SimError;
use gridmarket_sim::market::{MarketType, OrderRequest};

#[test]
fn pay_as_bid_reference_book() {
    let mut market = common::reference_market(MarketType::PayAsBid);
    let trades = market.run_clearing().unwrap();

    assert_eq!(trades.len(), 2);
    assert_eq!(trades[0].seller, "S1");
    assert_eq!(trades[1].seller, "S2");
    for t in &trades {
        assert_eq!(t.buyer, "B1");
        assert_eq!(t.traded_energy, 1.0);
        assert_eq!(t.traded_price, 10.0);
    }
    // S2's remainder stays open, B2 at 8 is below it
    assert!(trades[1].residual_offer_id.is_some());
    let bids = market.bids();
    assert_eq!(bids.len(), 1);
    assert_eq!(bids[0].buyer, "B2");
    let offers = market.offers();
    assert_eq!(offers.len(), 1);
    assert!((offers[0].energy - 1.0).abs() < 1e-9);
}

#[test]
fn pay_as_clear_reference_book() {
    let mut market = common::reference_market(MarketType::PayAsClear);
    let trades = market.run_clearing().unwrap();

    let matched: f64 = trades.iter().map(|t| t.traded_energy).sum();
    assert!((matched - 3.0).abs() < 1e-9);
    assert!(trades.iter().all(|t| t.traded_price == 9.0));
    assert!(market.book().is_empty());
}

#[test]
fn trades_satisfy_basic_invariants() {
    for market_type in [MarketType::PayAsBid, MarketType::PayAsClear] {
        let mut market = common::reference_market(market_type);
        let open_bid = market.book().total_bid_energy();
        let open_offer = market.book().total_offer_energy();
        let trades = market.run_clearing().unwrap();

        let matched: f64 = trades.iter().map(|t| t.traded_energy).sum();
        assert!(matched <= open_bid.min(open_offer) + 1e-9);
        assert!((market.book().total_bid_energy() - (open_bid - matched)).abs() < 1e-9);
        assert!((market.book().total_offer_energy() - (open_offer - matched)).abs() < 1e-9);
        for t in &trades {
            assert!(t.traded_energy > 0.0);
            assert!(t.traded_price >= 0.0);
            assert_ne!(t.seller, t.buyer);
        }
    }
}

#[test]
fn second_clearing_adds_nothing() {
    for market_type in [MarketType::PayAsBid, MarketType::PayAsClear] {
        let mut market = common::reference_market(market_type);
        market.run_clearing().unwrap();
        let count = market.trades().len();
        assert!(market.run_clearing().unwrap().is_empty());
        assert_eq!(market.trades().len(), count);
    }
}

#[test]
fn closed_market_rejects_everything() {
    let mut market = common::reference_market(MarketType::PayAsBid);
    market.close();
    assert_eq!(market.run_clearing(), Err(SimError::MarketClosed { slot: 0 }));
    assert!(matches!(
        market.post_offer(OrderRequest::new(1.0, 1.0, "Late")),
        Err(SimError::MarketClosed { .. })
    ));
    assert!(market.trades().is_empty());
}

#[test]
fn partial_acceptance_leaves_remainder() {
    let mut market = common::reference_market(MarketType::PayAsBid);
    let offer = market.offers().iter().find(|o| o.seller == "S2").map(|o| o.id).unwrap();
    let trade = market.accept_offer(offer, "Buyer", Some(0.5)).unwrap();
    assert_eq!(trade.traded_price, 9.0);
    assert!(trade.bid_id.is_none());
    assert!(matches!(
        market.accept_offer(offer, "Buyer", Some(5.0)),
        Err(SimError::InvalidEnergy { .. } | SimError::NotFound(_))
    ));
}
