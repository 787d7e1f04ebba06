//! Shared test fixtures for integration tests.

use gridmarket_sim::area::Area;
use gridmarket_sim::config::ScenarioConfig;
use gridmarket_sim::market::{Market, MarketType, OrderRequest};
use gridmarket_sim::sim::types::SimConfig;
use gridmarket_sim::strategy::{
    InfiniteBusConfig, LoadHoursConfig, StrategyConfig, StrategyKind,
};

/// One-hour slots of four ticks for a single slot.
pub fn hourly_config(market_type: MarketType) -> SimConfig {
    SimConfig::new(60, 900, 1, market_type, 42)
}

/// A preset shortened to hourly slots of four ticks over `hours`.
pub fn hourly_preset(name: &str, hours: u64) -> ScenarioConfig {
    let mut scenario = ScenarioConfig::from_preset(name).unwrap();
    scenario.simulation.slot_length_minutes = 60;
    scenario.simulation.tick_length_seconds = 900;
    scenario.simulation.duration_hours = hours;
    scenario
}

/// Order book from the reference clearing example: bids (2 kWh @ 10,
/// 1 kWh @ 8), offers (1 kWh @ 5, 2 kWh @ 9).
pub fn reference_market(market_type: MarketType) -> Market {
    let mut market = Market::new(0, market_type);
    market.post_bid(OrderRequest::new(2.0, 10.0, "B1")).unwrap();
    market.post_bid(OrderRequest::new(1.0, 8.0, "B2")).unwrap();
    market.post_offer(OrderRequest::new(1.0, 5.0, "S1")).unwrap();
    market.post_offer(OrderRequest::new(2.0, 9.0, "S2")).unwrap();
    market
}

pub fn leaf(name: &str, config: StrategyConfig) -> Area {
    Area::leaf(name, StrategyKind::from_config(&config, 7).unwrap())
}

/// Load active all day with a flat bid rate.
pub fn flat_load(name: &str, watts: f64, rate: f64) -> Area {
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

/// Unlimited supply at `rate`; its standing bid is priced at zero.
pub fn bus(name: &str, rate: f64) -> Area {
    leaf(
        name,
        StrategyConfig::InfiniteBus(InfiniteBusConfig {
            energy_rate: rate,
            energy_buy_rate: 0.0,
        }),
    )
}
