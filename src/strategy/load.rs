//! Load that consumes constant power during configured hours of the day.

use serde::{Deserialize, Serialize};

use super::{
    OrderHandle, Participation, PriceRamp, Strategy, StrategyContext, buy_cheapest, push_error,
};
use crate::config::ConfigError;
use crate::error::Result;
use crate::market::{FLOATING_POINT_TOLERANCE, Market, Trade};

/// Parameters of a [`LoadHoursStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadHoursConfig {
    /// Average consumption while active (W).
    #[serde(alias = "avg_power_W")]
    pub avg_power_w: f64,
    /// Hours of the day (0-23) in which the load may run.
    pub hrs_of_day: Vec<u32>,
    /// Run only the first `hrs_per_day` of `hrs_of_day`; `None` runs all.
    pub hrs_per_day: Option<u32>,
    /// Bid rate at the start of each slot.
    pub initial_buying_rate: f64,
    /// Bid rate reached by the end of each slot.
    pub final_buying_rate: f64,
    /// Ticks between price updates.
    pub update_interval: u64,
    /// Rate increase per update when `fit_to_limit` is off.
    pub energy_rate_increase_per_update: f64,
    pub fit_to_limit: bool,
}

impl Default for LoadHoursConfig {
    fn default() -> Self {
        Self {
            avg_power_w: 100.0,
            hrs_of_day: (0..24).collect(),
            hrs_per_day: None,
            initial_buying_rate: 0.0,
            final_buying_rate: 35.0,
            update_interval: 1,
            energy_rate_increase_per_update: 1.0,
            fit_to_limit: true,
        }
    }
}

impl LoadHoursConfig {
    pub(crate) fn validate(&self, prefix: &str, errors: &mut Vec<ConfigError>) {
        if self.avg_power_w.is_nan() || self.avg_power_w < 0.0 {
            push_error(errors, prefix, "avg_power_w", "must be >= 0");
        }
        if self.hrs_of_day.iter().any(|h| *h > 23) {
            push_error(errors, prefix, "hrs_of_day", "hours must be in 0..=23");
        }
        if self.hrs_per_day.is_some_and(|n| n > 24) {
            push_error(errors, prefix, "hrs_per_day", "must be <= 24");
        }
        if self.initial_buying_rate < 0.0 {
            push_error(errors, prefix, "initial_buying_rate", "must be >= 0");
        }
        if self.initial_buying_rate > self.final_buying_rate {
            push_error(
                errors,
                prefix,
                "initial_buying_rate",
                "must not exceed final_buying_rate",
            );
        }
        if self.update_interval == 0 {
            push_error(errors, prefix, "update_interval", "must be > 0");
        }
    }

    /// `true` if the load runs during `hour` (0-23).
    pub fn is_active(&self, hour: u32) -> bool {
        let limit = self.hrs_per_day.map_or(self.hrs_of_day.len(), |n| n as usize);
        self.hrs_of_day.iter().take(limit).any(|h| *h == hour)
    }

    fn ramp(&self) -> PriceRamp {
        PriceRamp {
            initial: self.initial_buying_rate,
            final_rate: self.final_buying_rate,
            fit_to_limit: self.fit_to_limit,
            step: self.energy_rate_increase_per_update,
            update_interval: self.update_interval,
        }
    }
}

/// Buys the energy its load needs each slot, raising its bid over the slot.
#[derive(Debug, Clone)]
pub struct LoadHoursStrategy {
    config: LoadHoursConfig,
    /// Energy needed in the current slot (kWh).
    required_kwh: f64,
    /// Energy bought so far in the current slot (kWh).
    bought_kwh: f64,
    bid: OrderHandle,
}

impl LoadHoursStrategy {
    pub fn new(config: LoadHoursConfig) -> Self {
        Self {
            config,
            required_kwh: 0.0,
            bought_kwh: 0.0,
            bid: OrderHandle::default(),
        }
    }

    pub fn config(&self) -> &LoadHoursConfig {
        &self.config
    }

    pub(crate) fn reconfigure(&mut self, config: LoadHoursConfig) {
        self.config = config;
    }

    /// Energy still to buy in the current slot (kWh).
    pub fn energy_requirement_kwh(&self) -> f64 {
        (self.required_kwh - self.bought_kwh).max(0.0)
    }

    fn start_slot(&mut self, ctx: &StrategyContext<'_>) {
        let hour = ctx.hour_of_day().floor() as u32;
        self.required_kwh = if self.config.is_active(hour) {
            self.config.avg_power_w / 1000.0 * ctx.slot_hours()
        } else {
            0.0
        };
        self.bought_kwh = 0.0;
        self.bid.clear();
    }
}

impl Strategy for LoadHoursStrategy {
    fn participation(&self) -> Participation {
        Participation::Buyer
    }

    fn on_activate(&mut self, ctx: &StrategyContext<'_>) {
        self.start_slot(ctx);
    }

    fn on_tick(&mut self, market: &mut Market, ctx: &StrategyContext<'_>) -> Result<()> {
        let rate = self.config.ramp().rate(ctx.tick, ctx.config.ticks_per_slot());
        let needed = self.energy_requirement_kwh();
        if ctx.is_two_sided() {
            self.bid.keep_bid(market, ctx.owner, needed, rate)
        } else if needed > FLOATING_POINT_TOLERANCE {
            buy_cheapest(market, ctx.owner, needed, rate)
        } else {
            Ok(())
        }
    }

    fn on_trade(&mut self, _market: &Market, trade: &Trade, ctx: &StrategyContext<'_>) {
        if trade.buyer == ctx.owner {
            self.bought_kwh += trade.traded_energy;
        }
    }

    fn on_market_cycle(&mut self, ctx: &StrategyContext<'_>) {
        self.start_slot(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketType, OrderRequest};
    use crate::sim::types::SimConfig;

    fn sim(market_type: MarketType) -> SimConfig {
        SimConfig::new(60, 900, 24, market_type, 0)
    }

    fn ctx<'a>(config: &'a SimConfig, slot: u64, tick: u64) -> StrategyContext<'a> {
        StrategyContext {
            owner: "Load",
            config,
            slot,
            tick,
        }
    }

    #[test]
    fn active_hours_respect_hrs_per_day() {
        let config = LoadHoursConfig {
            hrs_of_day: vec![8, 9, 10],
            hrs_per_day: Some(2),
            ..LoadHoursConfig::default()
        };
        assert!(config.is_active(8));
        assert!(config.is_active(9));
        assert!(!config.is_active(10));
        assert!(!config.is_active(3));
    }

    #[test]
    fn bids_for_slot_energy_and_raises_price() {
        let sim = sim(MarketType::PayAsBid);
        let mut load = LoadHoursStrategy::new(LoadHoursConfig {
            avg_power_w: 500.0,
            initial_buying_rate: 10.0,
            final_buying_rate: 25.0,
            ..LoadHoursConfig::default()
        });
        let mut market = Market::new(0, MarketType::PayAsBid);
        load.on_activate(&ctx(&sim, 0, 0));
        assert!((load.energy_requirement_kwh() - 0.5).abs() < 1e-9);

        load.on_tick(&mut market, &ctx(&sim, 0, 0)).unwrap();
        assert_eq!(market.bids().len(), 1);
        assert_eq!(market.bids()[0].price, 10.0);

        load.on_tick(&mut market, &ctx(&sim, 0, 3)).unwrap();
        assert_eq!(market.bids().len(), 1);
        assert_eq!(market.bids()[0].price, 25.0);
    }

    #[test]
    fn one_sided_load_accepts_offers() {
        let sim = sim(MarketType::OneSided);
        let mut load = LoadHoursStrategy::new(LoadHoursConfig {
            avg_power_w: 1000.0,
            initial_buying_rate: 30.0,
            final_buying_rate: 30.0,
            ..LoadHoursConfig::default()
        });
        let mut market = Market::new(0, MarketType::OneSided);
        market.post_offer(OrderRequest::new(5.0, 20.0, "PV")).unwrap();
        load.on_activate(&ctx(&sim, 0, 0));
        load.on_tick(&mut market, &ctx(&sim, 0, 0)).unwrap();

        let trade = market.trades()[0].clone();
        assert_eq!(trade.traded_energy, 1.0);
        load.on_trade(&market, &trade, &ctx(&sim, 0, 0));
        assert_eq!(load.energy_requirement_kwh(), 0.0);

        load.on_tick(&mut market, &ctx(&sim, 0, 1)).unwrap();
        assert_eq!(market.trades().len(), 1);
    }

    #[test]
    fn inactive_hour_needs_nothing() {
        let sim = sim(MarketType::PayAsBid);
        let mut load = LoadHoursStrategy::new(LoadHoursConfig {
            hrs_of_day: vec![12],
            ..LoadHoursConfig::default()
        });
        load.on_market_cycle(&ctx(&sim, 3, 0));
        assert_eq!(load.energy_requirement_kwh(), 0.0);
        load.on_market_cycle(&ctx(&sim, 12, 0));
        assert!(load.energy_requirement_kwh() > 0.0);
    }
}
