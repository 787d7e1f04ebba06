//! Moving orders and trades through the area tree.
//!
//! A tick runs in two passes. [`dispatch_tick`] walks the tree top-down and
//! lets every leaf act in its parent's market. [`aggregate`] then walks it
//! bottom-up: each branch mirrors its children's open orders into its own
//! market under the child's agent name (with the grid fee applied), clears,
//! and pushes resulting trades back down so that a trade of a mirror becomes
//! a trade of the original order one level below.
//!
//! One-sided markets have no bids to send up, so offers also travel down:
//! before a branch child runs its tick, the parent's offers are copied into
//! the child's market, and purchases of those copies are settled against the
//! originals as soon as the child is done.

use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::{Area, AreaKind, GridFee, Mirror, MirrorSide};
use crate::error::{Result, SimError};
use crate::market::{FLOATING_POINT_TOLERANCE, Market, OrderId, OrderRequest, Trade};
use crate::sim::clock::SimTime;
use crate::sim::types::SimConfig;
use crate::strategy::{Strategy, StrategyContext};

/// Runs every leaf strategy of the subtree for one tick, parents' leaves
/// before deeper ones. Trades a leaf causes are pushed down immediately.
pub fn dispatch_tick(area: &mut Area, time: SimTime, config: &SimConfig) {
    let Area {
        kind,
        markets,
        pushed,
        grid_fee,
        ..
    } = area;
    let AreaKind::Branch(children) = kind else {
        return;
    };
    let fee = *grid_fee;
    let mut market = markets.get_mut(&time.slot).filter(|m| !m.is_readonly());
    if let Some(market) = market.as_deref_mut() {
        for i in 0..children.len() {
            let child = &mut children[i];
            let AreaKind::Leaf(strategy) = &mut child.kind else {
                continue;
            };
            let ctx = StrategyContext {
                owner: &child.name,
                config,
                slot: time.slot,
                tick: time.tick,
            };
            if let Err(e) = strategy.on_tick(market, &ctx) {
                warn!(area = %child.name, slot = time.slot, tick = time.tick, error = %e, "strategy tick failed");
            }
            push_down(market, children, pushed, fee, config);
        }
    }
    for i in 0..children.len() {
        if children[i].is_leaf() {
            continue;
        }
        match market.as_deref_mut() {
            Some(market) if !market.market_type().is_two_sided() => {
                sync_inbound(&mut children[i], market, fee, time.slot);
                dispatch_tick(&mut children[i], time, config);
                pull_up(&mut children[i], market, fee, time.slot);
                sync_mirrors(&mut children[i], market, fee, time.slot);
                push_down(market, children, pushed, fee, config);
            }
            _ => dispatch_tick(&mut children[i], time, config),
        }
    }
}

/// Mirrors, clears and pushes down for every branch of the subtree,
/// children before parents.
pub fn aggregate(area: &mut Area, slot: u64, config: &SimConfig) {
    let Area {
        name,
        kind,
        markets,
        pushed,
        grid_fee,
        ..
    } = area;
    let AreaKind::Branch(children) = kind else {
        return;
    };
    for child in children.iter_mut() {
        aggregate(child, slot, config);
    }
    let Some(market) = markets.get_mut(&slot) else {
        return;
    };
    if market.is_readonly() {
        return;
    }
    for child in children.iter_mut().filter(|c| !c.is_leaf()) {
        sync_mirrors(child, market, *grid_fee, slot);
    }
    match market.run_clearing() {
        Ok(trades) if !trades.is_empty() => {
            debug!(area = %name, slot, trades = trades.len(), "market cleared");
        }
        Ok(_) => {}
        Err(SimError::MarketClosed { .. }) => {}
        Err(e) => warn!(area = %name, slot, error = %e, "clearing failed"),
    }
    push_down(market, children, pushed, *grid_fee, config);
}

/// Brings every mirror of the subtree up to date, deepest branches first,
/// without clearing. Run after the tree changed between ticks so that no
/// market offers a copy of an order that is gone.
pub fn refresh_mirrors(area: &mut Area, slot: u64) {
    let Area {
        kind,
        markets,
        grid_fee,
        ..
    } = area;
    let AreaKind::Branch(children) = kind else {
        return;
    };
    for child in children.iter_mut() {
        refresh_mirrors(child, slot);
    }
    let Some(market) = markets.get_mut(&slot).filter(|m| !m.is_readonly()) else {
        return;
    };
    for child in children.iter_mut().filter(|c| !c.is_leaf()) {
        sync_mirrors(child, market, *grid_fee, slot);
    }
}

/// Closes `closing` everywhere in the subtree and opens `next` if there is one.
pub fn market_cycle(area: &mut Area, closing: u64, next: Option<u64>, config: &SimConfig) {
    if let AreaKind::Leaf(strategy) = &mut area.kind {
        if let Some(slot) = next {
            let ctx = StrategyContext {
                owner: &area.name,
                config,
                slot,
                tick: 0,
            };
            strategy.on_market_cycle(&ctx);
        }
        return;
    }
    area.close_market(closing, config);
    area.mirrors.clear();
    area.inbound.clear();
    if let Some(slot) = next {
        area.open_market(slot, config);
    }
    if let AreaKind::Branch(children) = &mut area.kind {
        for child in children.iter_mut() {
            market_cycle(child, closing, next, config);
        }
    }
}

/// Brings the mirrors of `child`'s open orders in `parent_market` up to date.
/// Offers `child` holds on the parent's behalf are not sent back up.
fn sync_mirrors(child: &mut Area, parent_market: &mut Market, fee: GridFee, slot: u64) {
    let agent = child.agent_name();
    let Area {
        markets, mirrors, ..
    } = child;
    let Some(market) = markets.get(&slot).filter(|m| !m.is_readonly()) else {
        return;
    };
    let book = market.book();

    let mut by_original: HashMap<OrderId, OrderId> = HashMap::new();
    let mut stale = Vec::new();
    for (mirror_id, mirror) in mirrors.iter() {
        let original = book.resolve(mirror.original);
        if book.contains(original) && parent_market.book().contains(*mirror_id) {
            by_original.insert(original, *mirror_id);
        } else {
            stale.push(*mirror_id);
        }
    }
    for id in stale {
        mirrors.remove(&id);
        if parent_market.book().contains(id) {
            if let Err(e) = parent_market.delete_order(id) {
                warn!(agent = %agent, error = %e, "failed to withdraw stale mirror");
            }
        }
    }

    for offer in book.offers().into_iter().filter(|o| o.seller != agent) {
        let price = fee.offer_upward(offer.price);
        let request = OrderRequest::new(offer.energy, price, agent.clone());
        let result = match by_original.get(&offer.id) {
            Some(&mirror_id) => {
                if parent_market
                    .book()
                    .offer(mirror_id)
                    .is_some_and(|m| same_terms(m.energy, m.price, offer.energy, price))
                {
                    continue;
                }
                mirrors.remove(&mirror_id);
                parent_market.replace_offer(mirror_id, request)
            }
            None => parent_market.post_offer(request).map(Some),
        };
        record(mirrors, result, offer.id, MirrorSide::Offer, &agent);
    }

    if !parent_market.market_type().is_two_sided() {
        return;
    }
    for bid in book.bids() {
        let price = fee.bid_upward(bid.price);
        let request = OrderRequest::new(bid.energy, price, agent.clone());
        let result = match by_original.get(&bid.id) {
            Some(&mirror_id) => {
                if parent_market
                    .book()
                    .bid(mirror_id)
                    .is_some_and(|m| same_terms(m.energy, m.price, bid.energy, price))
                {
                    continue;
                }
                mirrors.remove(&mirror_id);
                parent_market.replace_bid(mirror_id, request)
            }
            None => parent_market.post_bid(request).map(Some),
        };
        record(mirrors, result, bid.id, MirrorSide::Bid, &agent);
    }
}

fn same_terms(energy_a: f64, price_a: f64, energy_b: f64, price_b: f64) -> bool {
    (energy_a - energy_b).abs() < FLOATING_POINT_TOLERANCE
        && (price_a - price_b).abs() < FLOATING_POINT_TOLERANCE
}

fn record(
    mirrors: &mut HashMap<OrderId, Mirror>,
    result: Result<Option<OrderId>>,
    original: OrderId,
    side: MirrorSide,
    agent: &str,
) {
    match result {
        Ok(Some(mirror_id)) => {
            trace!(agent, %original, %mirror_id, "mirrored order");
            mirrors.insert(mirror_id, Mirror { original, side });
        }
        Ok(None) => {}
        Err(e) => warn!(agent, %original, error = %e, "failed to mirror order"),
    }
}

/// Copies the offers of `parent_market` into `child`'s market under the
/// child's agent name, priced as if crossing the boundary, and drops copies
/// whose original is gone. The child's own mirrors are not copied back.
fn sync_inbound(child: &mut Area, parent_market: &Market, fee: GridFee, slot: u64) {
    let agent = child.agent_name();
    let Area {
        markets, inbound, ..
    } = child;
    let Some(market) = markets.get_mut(&slot).filter(|m| !m.is_readonly()) else {
        return;
    };
    let parent_book = parent_market.book();

    let mut by_original: HashMap<OrderId, OrderId> = HashMap::new();
    let mut stale = Vec::new();
    for (copy_id, original) in inbound.iter() {
        let original = parent_book.resolve(*original);
        if parent_book.offer(original).is_some() && market.book().offer(*copy_id).is_some() {
            by_original.insert(original, *copy_id);
        } else {
            stale.push(*copy_id);
        }
    }
    for id in stale {
        inbound.remove(&id);
        if market.book().contains(id) {
            if let Err(e) = market.delete_order(id) {
                warn!(agent = %agent, error = %e, "failed to withdraw stale inbound offer");
            }
        }
    }

    for offer in parent_book.offers().into_iter().filter(|o| o.seller != agent) {
        let price = fee.offer_upward(offer.price);
        let request = OrderRequest::new(offer.energy, price, agent.clone());
        let result = match by_original.get(&offer.id) {
            Some(&copy_id) => {
                if market
                    .book()
                    .offer(copy_id)
                    .is_some_and(|c| same_terms(c.energy, c.price, offer.energy, price))
                {
                    continue;
                }
                inbound.remove(&copy_id);
                market.replace_offer(copy_id, request)
            }
            None => market.post_offer(request).map(Some),
        };
        match result {
            Ok(Some(copy_id)) => {
                trace!(agent = %agent, original = %offer.id, %copy_id, "forwarded offer down");
                inbound.insert(copy_id, offer.id);
            }
            Ok(None) => {}
            Err(e) => warn!(agent = %agent, original = %offer.id, error = %e, "failed to forward offer down"),
        }
    }
}

/// Settles every purchase of an inbound copy in `child`'s market against
/// the original offer in `parent_market`, bought by the child's agent at
/// the fee-reverted rate.
fn pull_up(child: &mut Area, parent_market: &mut Market, fee: GridFee, slot: u64) {
    let agent = child.agent_name();
    let Area {
        name,
        markets,
        inbound,
        pulled,
        ..
    } = child;
    let Some(market) = markets.get(&slot) else {
        return;
    };
    while *pulled < market.trades().len() {
        let trade = &market.trades()[*pulled];
        *pulled += 1;
        let Some(original) = inbound.remove(&trade.offer_id) else {
            continue;
        };
        if let Some(residual) = trade.residual_offer_id {
            inbound.insert(residual, original);
        }
        let original = parent_market.book().resolve(original);
        let price = fee.revert_offer(trade.traded_price);
        let fee_price = trade.traded_price - price;
        match parent_market.accept_forwarded_offer(original, &agent, trade.traded_energy, price, fee_price) {
            Ok(settled) => {
                debug!(area = %name, trade = %settled.id, energy = settled.traded_energy, price = settled.traded_price, "inbound purchase settled");
            }
            Err(e) => warn!(area = %name, trade = %trade.id, error = %e, "failed to settle inbound purchase"),
        }
    }
}

/// Hands every trade of `market` not yet seen to the children it concerns.
///
/// A trade that consumed a child's mirror is delivered only if the order
/// behind the mirror (and behind any deeper mirror) can still supply it;
/// otherwise the trade is withdrawn before anyone hears of it.
fn push_down(
    market: &mut Market,
    children: &mut [Area],
    pushed: &mut usize,
    fee: GridFee,
    config: &SimConfig,
) {
    while *pushed < market.trades().len() {
        let trade = market.trades()[*pushed].clone();
        let forwarded = forwarded_sides(children, &trade);
        let failed: Vec<(usize, MirrorSide, SimError)> = forwarded
            .iter()
            .filter_map(|&(i, side, mirror_id)| {
                deliverable(&children[i], mirror_id, trade.traded_energy, trade.time_slot)
                    .err()
                    .map(|e| (i, side, e))
            })
            .collect();
        if !failed.is_empty() {
            withdraw(market, children, &trade, &failed, pushed);
            continue;
        }
        *pushed += 1;
        for (i, side, _) in forwarded {
            fill_mirror(&mut children[i], &trade, side, fee, config);
        }
        for child in children.iter_mut() {
            if trade.involves(&child.name)
                && let AreaKind::Leaf(strategy) = &mut child.kind
            {
                let ctx = StrategyContext {
                    owner: &child.name,
                    config,
                    slot: trade.time_slot,
                    tick: 0,
                };
                strategy.on_trade(market, &trade, &ctx);
            }
        }
    }
}

/// Children whose mirrors `trade` consumed, with the side and mirror id.
fn forwarded_sides(children: &[Area], trade: &Trade) -> Vec<(usize, MirrorSide, OrderId)> {
    let mut sides = Vec::new();
    for (i, child) in children.iter().enumerate() {
        if child.mirrors.contains_key(&trade.offer_id) {
            sides.push((i, MirrorSide::Offer, trade.offer_id));
        }
        if let Some(bid_id) = trade.bid_id.filter(|id| child.mirrors.contains_key(id)) {
            sides.push((i, MirrorSide::Bid, bid_id));
        }
    }
    sides
}

/// Checks that `child` can deliver `energy` for the mirror `mirror_id`,
/// following the chain of mirrors down to the order that was really posted.
fn deliverable(child: &Area, mirror_id: OrderId, energy: f64, slot: u64) -> Result<()> {
    let mirror = child
        .mirrors
        .get(&mirror_id)
        .ok_or_else(|| SimError::NotFound(format!("mirror {mirror_id}")))?;
    let market = child
        .markets
        .get(&slot)
        .filter(|m| !m.is_readonly())
        .ok_or(SimError::MarketClosed { slot })?;
    let original = market.book().resolve(mirror.original);
    let available = match mirror.side {
        MirrorSide::Offer => market.book().offer(original).map(|o| o.energy),
        MirrorSide::Bid => market.book().bid(original).map(|b| b.energy),
    }
    .ok_or_else(|| SimError::NotFound(format!("order {original} behind mirror {mirror_id}")))?;
    if energy > available + FLOATING_POINT_TOLERANCE {
        return Err(SimError::InvalidEnergy {
            requested: energy,
            available,
        });
    }
    match child.children().iter().find(|g| g.mirrors.contains_key(&original)) {
        Some(grandchild) => deliverable(grandchild, original, energy, slot),
        None => Ok(()),
    }
}

/// Takes back `trade` after one of its forwarded sides failed. The failed
/// mirrors are forgotten and withdrawn; the other side gets its energy back.
fn withdraw(
    market: &mut Market,
    children: &mut [Area],
    trade: &Trade,
    failed: &[(usize, MirrorSide, SimError)],
    pushed: &mut usize,
) {
    for (i, side, e) in failed {
        let child = &mut children[*i];
        warn!(area = %child.name, trade = %trade.id, error = %e, "forwarded order cannot be delivered, withdrawing trade");
        let (mirror_id, residual_id) = match side {
            MirrorSide::Offer => (Some(trade.offer_id), trade.residual_offer_id),
            MirrorSide::Bid => (trade.bid_id, trade.residual_bid_id),
        };
        for id in mirror_id.into_iter().chain(residual_id) {
            child.mirrors.remove(&id);
        }
    }
    let drop_offer = failed.iter().any(|(_, side, _)| *side == MirrorSide::Offer);
    let drop_bid = failed.iter().any(|(_, side, _)| *side == MirrorSide::Bid);
    if let Err(e) = market.withdraw_trade(trade.id, drop_offer, drop_bid) {
        warn!(trade = %trade.id, error = %e, "failed to withdraw trade");
        *pushed += 1;
    }
}

/// Turns a trade of one of `child`'s mirrors into a trade of the original
/// order in `child`'s market, then pushes that trade further down.
fn fill_mirror(child: &mut Area, trade: &Trade, side: MirrorSide, fee: GridFee, config: &SimConfig) {
    let (mirror_id, residual_id) = match side {
        MirrorSide::Offer => (Some(trade.offer_id), trade.residual_offer_id),
        MirrorSide::Bid => (trade.bid_id, trade.residual_bid_id),
    };
    let Some(mirror) = mirror_id.and_then(|id| child.mirrors.remove(&id)) else {
        warn!(area = %child.name, trade = %trade.id, "trade of unknown mirror");
        return;
    };
    if let Some(residual) = residual_id {
        child.mirrors.insert(residual, mirror);
    }

    let agent = child.agent_name();
    let slot = trade.time_slot;
    let Area {
        name,
        kind,
        markets,
        pushed,
        grid_fee,
        ..
    } = child;
    let Some(market) = markets.get_mut(&slot) else {
        warn!(area = %name, slot, "no market for forwarded trade");
        return;
    };
    let original = market.book().resolve(mirror.original);
    let result = match side {
        MirrorSide::Offer => {
            let price = fee.revert_offer(trade.traded_price);
            let fee_price = trade.traded_price - price;
            market.accept_forwarded_offer(original, &agent, trade.traded_energy, price, fee_price)
        }
        MirrorSide::Bid => {
            let price = fee.revert_bid(trade.traded_price);
            let fee_price = price - trade.traded_price;
            market.accept_forwarded_bid(original, &agent, trade.traded_energy, price, fee_price)
        }
    };
    match result {
        Ok(local) => {
            debug!(area = %name, trade = %local.id, energy = local.traded_energy, price = local.traded_price, "forwarded trade filled");
        }
        Err(e) => {
            warn!(area = %name, trade = %trade.id, error = %e, "failed to fill forwarded trade");
            return;
        }
    }
    if let AreaKind::Branch(grandchildren) = kind {
        push_down(market, grandchildren, pushed, *grid_fee, config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketType;
    use crate::strategy::{
        InfiniteBusConfig, LoadHoursConfig, PvConfig, StrategyConfig, StrategyKind,
    };

    fn leaf(name: &str, config: StrategyConfig) -> Area {
        Area::leaf(name, StrategyKind::from_config(&config, 1).unwrap())
    }

    fn load(name: &str, watts: f64, rate: f64) -> Area {
        leaf(
            name,
            StrategyConfig::LoadHours(LoadHoursConfig {
                avg_power_w: watts,
                initial_buying_rate: rate,
                final_buying_rate: rate,
                ..LoadHoursConfig::default()
            }),
        )
    }

    fn run_tick(root: &mut Area, sim: &SimConfig, time: SimTime) {
        dispatch_tick(root, time, sim);
        aggregate(root, time.slot, sim);
    }

    fn time(slot: u64, tick: u64) -> SimTime {
        SimTime {
            slot,
            tick,
            index: slot * 4 + tick,
        }
    }

    #[test]
    fn bus_in_parent_feeds_load_in_child_with_fee() {
        let sim = SimConfig::new(60, 900, 1, MarketType::PayAsBid, 0);
        let house = Area::branch("House", vec![load("Load", 1000.0, 35.0)]).unwrap();
        let bus = leaf(
            "Bus",
            StrategyConfig::InfiniteBus(InfiniteBusConfig {
                energy_rate: 20.0,
                energy_buy_rate: 0.0,
            }),
        );
        let mut grid = Area::branch("Grid", vec![house, bus])
            .unwrap()
            .with_grid_fee(GridFee::Constant(2.0));
        grid.activate(0, &sim);
        run_tick(&mut grid, &sim, time(0, 0));

        let grid_trades = grid.current_market().unwrap().trades();
        assert_eq!(grid_trades.len(), 1);
        assert_eq!(grid_trades[0].buyer, "IAA House");
        assert_eq!(grid_trades[0].seller, "Bus");
        // pay-as-bid: parent trade at the mirrored bid 35 - 2
        assert!((grid_trades[0].traded_price - 33.0).abs() < 1e-9);

        let house = grid.find_by_name("House").unwrap();
        let house_trades = house.current_market().unwrap().trades();
        assert_eq!(house_trades.len(), 1);
        assert_eq!(house_trades[0].buyer, "Load");
        assert_eq!(house_trades[0].seller, "IAA House");
        assert!((house_trades[0].traded_price - 35.0).abs() < 1e-9);
        assert!((house_trades[0].fee_price - 2.0).abs() < 1e-9);
        assert!((house_trades[0].traded_energy - 1.0).abs() < 1e-9);
        assert!(house.current_market().unwrap().bids().is_empty());
    }

    #[test]
    fn local_match_happens_before_forwarding() {
        let sim = SimConfig::new(60, 900, 1, MarketType::PayAsBid, 0);
        let pv = leaf(
            "PV",
            StrategyConfig::Pv(PvConfig {
                sunrise_hour: 0.0,
                sunset_hour: 24.0,
                noise_std: 0.0,
                panel_count: 100,
                initial_selling_rate: 10.0,
                final_selling_rate: 10.0,
                ..PvConfig::default()
            }),
        );
        let house = Area::branch("House", vec![load("Load", 500.0, 20.0), pv]).unwrap();
        let neighbour = Area::branch("Neighbour", vec![load("Load2", 500.0, 5.0)]).unwrap();
        let mut grid = Area::branch("Grid", vec![house, neighbour]).unwrap();
        grid.activate(0, &sim);
        run_tick(&mut grid, &sim, time(0, 0));

        let house = grid.find_by_name("House").unwrap();
        let local = house.current_market().unwrap().trades();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].seller, "PV");
        assert_eq!(local[0].buyer, "Load");
        // leftover PV energy is mirrored into the grid market
        let grid_market = grid.current_market().unwrap();
        assert_eq!(grid_market.offers().len(), 1);
        assert_eq!(grid_market.offers()[0].seller, "IAA House");
        assert_eq!(grid_market.bids()[0].buyer, "IAA Neighbour");
        assert!(grid_market.trades().is_empty());
    }

    #[test]
    fn stale_mirrors_are_withdrawn() {
        let sim = SimConfig::new(60, 900, 1, MarketType::PayAsBid, 0);
        let house = Area::branch("House", vec![load("Load", 1000.0, 10.0)]).unwrap();
        let other = Area::branch("Other", vec![load("Other Load", 100.0, 1.0)]).unwrap();
        let mut grid = Area::branch("Grid", vec![house, other]).unwrap();
        grid.activate(0, &sim);
        run_tick(&mut grid, &sim, time(0, 0));
        assert_eq!(grid.current_market().unwrap().bids().len(), 2);

        let house_uuid = grid.find_by_name("House").unwrap().uuid();
        let house = grid.find_mut(house_uuid).unwrap();
        let bid = house.current_market().unwrap().bids()[0].id;
        house.markets.get_mut(&0).unwrap().delete_order(bid).unwrap();
        aggregate(&mut grid, 0, &sim);
        let bids = grid.current_market().unwrap().bids();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].buyer, "IAA Other");
    }

    #[test]
    fn market_cycle_rolls_every_branch() {
        let sim = SimConfig::new(60, 900, 2, MarketType::PayAsBid, 0);
        let house = Area::branch("House", vec![load("Load", 100.0, 10.0)]).unwrap();
        let mut grid = Area::branch("Grid", vec![house]).unwrap();
        grid.activate(0, &sim);
        run_tick(&mut grid, &sim, time(0, 0));
        market_cycle(&mut grid, 0, Some(1), &sim);

        assert_eq!(grid.current_slot(), Some(1));
        assert!(grid.market(0).unwrap().is_readonly());
        let house = grid.find_by_name("House").unwrap();
        assert_eq!(house.current_slot(), Some(1));
        assert_eq!(house.summaries().len(), 1);
        assert!(grid.current_market().unwrap().bids().is_empty());
    }

    fn pv(name: &str, rate: f64) -> Area {
        leaf(
            name,
            StrategyConfig::Pv(PvConfig {
                sunrise_hour: 0.0,
                sunset_hour: 24.0,
                noise_std: 0.0,
                panel_count: 100,
                initial_selling_rate: rate,
                final_selling_rate: rate,
                ..PvConfig::default()
            }),
        )
    }

    #[test]
    fn trade_of_vanished_offer_is_withdrawn() {
        let sim = SimConfig::new(60, 900, 1, MarketType::OneSided, 0);
        let house = Area::branch("House", vec![pv("PV", 10.0)]).unwrap();
        let mut grid = Area::branch("Grid", vec![house, load("GLoad", 1000.0, 35.0)]).unwrap();
        grid.activate(0, &sim);
        run_tick(&mut grid, &sim, time(0, 0));
        let mirror = grid.current_market().unwrap().offers()[0].id;
        assert_eq!(grid.current_market().unwrap().offers()[0].seller, "IAA House");

        // the original goes away without the mirror being synced
        let house_uuid = grid.find_by_name("House").unwrap().uuid();
        let house = grid.find_mut(house_uuid).unwrap();
        let offer = house.current_market().unwrap().offers()[0].id;
        house.markets.get_mut(&0).unwrap().delete_order(offer).unwrap();

        dispatch_tick(&mut grid, time(0, 1), &sim);
        assert!(grid.current_market().unwrap().trades().is_empty());
        assert!(!grid.current_market().unwrap().book().contains(mirror));
        let house = grid.find_by_name("House").unwrap();
        assert!(house.current_market().unwrap().trades().is_empty());
        assert!(!house.mirrors.contains_key(&mirror));
    }

    #[test]
    fn refresh_drops_mirrors_of_deleted_orders() {
        let sim = SimConfig::new(60, 900, 1, MarketType::OneSided, 0);
        let house = Area::branch("House", vec![pv("PV", 10.0)]).unwrap();
        let mut grid = Area::branch("Grid", vec![house]).unwrap();
        grid.activate(0, &sim);
        run_tick(&mut grid, &sim, time(0, 0));
        assert_eq!(grid.current_market().unwrap().offers().len(), 1);

        let house_uuid = grid.find_by_name("House").unwrap().uuid();
        let house = grid.find_mut(house_uuid).unwrap();
        let offer = house.current_market().unwrap().offers()[0].id;
        house.markets.get_mut(&0).unwrap().delete_order(offer).unwrap();

        refresh_mirrors(&mut grid, 0);
        assert!(grid.current_market().unwrap().offers().is_empty());
        assert!(grid.find_by_name("House").unwrap().mirrors.is_empty());
    }

    #[test]
    fn one_sided_bus_in_parent_feeds_load_in_child() {
        let sim = SimConfig::new(60, 900, 1, MarketType::OneSided, 0);
        let house = Area::branch("House", vec![load("Load", 1000.0, 35.0)]).unwrap();
        let bus = leaf(
            "Bus",
            StrategyConfig::InfiniteBus(InfiniteBusConfig {
                energy_rate: 20.0,
                energy_buy_rate: 0.0,
            }),
        );
        let mut grid = Area::branch("Grid", vec![house, bus])
            .unwrap()
            .with_grid_fee(GridFee::Constant(2.0));
        grid.activate(0, &sim);
        run_tick(&mut grid, &sim, time(0, 0));

        let house = grid.find_by_name("House").unwrap();
        let house_trades = house.current_market().unwrap().trades();
        assert_eq!(house_trades.len(), 1);
        assert_eq!(house_trades[0].seller, "IAA House");
        assert_eq!(house_trades[0].buyer, "Load");
        assert!((house_trades[0].traded_price - 22.0).abs() < 1e-9);
        assert!((house_trades[0].traded_energy - 1.0).abs() < 1e-9);

        let grid_trades = grid.current_market().unwrap().trades();
        assert_eq!(grid_trades.len(), 1);
        assert_eq!(grid_trades[0].seller, "Bus");
        assert_eq!(grid_trades[0].buyer, "IAA House");
        assert!((grid_trades[0].traded_price - 20.0).abs() < 1e-9);
        assert!((grid_trades[0].fee_price - 2.0).abs() < 1e-9);
        assert!((grid_trades[0].traded_energy - 1.0).abs() < 1e-9);

        // the house's copy of the bus offer is not sent back up
        let grid_market = grid.current_market().unwrap();
        assert!(grid_market.offers().iter().all(|o| o.seller == "Bus"));
    }
}
