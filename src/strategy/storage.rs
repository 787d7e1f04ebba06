//! Battery storage that buys cheap and sells dear within its SOC limits.

use serde::{Deserialize, Serialize};

use super::{
    OrderHandle, Participation, PriceRamp, Strategy, StrategyContext, buy_cheapest, push_error,
};
use crate::config::ConfigError;
use crate::error::Result;
use crate::market::{FLOATING_POINT_TOLERANCE, Market, Trade};

/// Parameters of a [`StorageStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Usable capacity (kWh).
    #[serde(alias = "battery_capacity_kWh")]
    pub battery_capacity_kwh: f64,
    /// Initial state of charge (percent).
    pub initial_soc: f64,
    /// SOC the battery never discharges below (percent).
    pub min_allowed_soc: f64,
    /// Charge/discharge power limit (kW).
    #[serde(alias = "max_abs_battery_power_kW")]
    pub max_abs_battery_power_kw: f64,
    /// Charging efficiency (0..=1).
    pub eta_charge: f64,
    /// Discharging efficiency (0..=1).
    pub eta_discharge: f64,
    pub initial_selling_rate: f64,
    pub final_selling_rate: f64,
    pub initial_buying_rate: f64,
    pub final_buying_rate: f64,
    /// Ticks between price updates.
    pub update_interval: u64,
    /// Rate change per update when `fit_to_limit` is off.
    pub energy_rate_change_per_update: f64,
    pub fit_to_limit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            battery_capacity_kwh: 1.2,
            initial_soc: 10.0,
            min_allowed_soc: 10.0,
            max_abs_battery_power_kw: 5.0,
            eta_charge: 0.95,
            eta_discharge: 0.95,
            initial_selling_rate: 30.0,
            final_selling_rate: 25.0,
            initial_buying_rate: 0.0,
            final_buying_rate: 24.9,
            update_interval: 1,
            energy_rate_change_per_update: 1.0,
            fit_to_limit: true,
        }
    }
}

impl StorageConfig {
    pub(crate) fn validate(&self, prefix: &str, errors: &mut Vec<ConfigError>) {
        if self.battery_capacity_kwh.is_nan() || self.battery_capacity_kwh <= 0.0 {
            push_error(errors, prefix, "battery_capacity_kwh", "must be > 0");
        }
        if !(0.0..=100.0).contains(&self.min_allowed_soc) {
            push_error(errors, prefix, "min_allowed_soc", "must be in [0, 100]");
        }
        if !(0.0..=100.0).contains(&self.initial_soc) || self.initial_soc < self.min_allowed_soc {
            push_error(
                errors,
                prefix,
                "initial_soc",
                "must be in [min_allowed_soc, 100]",
            );
        }
        if self.max_abs_battery_power_kw.is_nan() || self.max_abs_battery_power_kw < 0.0 {
            push_error(errors, prefix, "max_abs_battery_power_kw", "must be >= 0");
        }
        for (field, eta) in [
            ("eta_charge", self.eta_charge),
            ("eta_discharge", self.eta_discharge),
        ] {
            if !(eta > 0.0 && eta <= 1.0) {
                push_error(errors, prefix, field, "must be in (0, 1]");
            }
        }
        if self.initial_selling_rate < self.final_selling_rate {
            push_error(
                errors,
                prefix,
                "initial_selling_rate",
                "must not be below final_selling_rate",
            );
        }
        if self.initial_buying_rate > self.final_buying_rate {
            push_error(
                errors,
                prefix,
                "initial_buying_rate",
                "must not exceed final_buying_rate",
            );
        }
        if self.final_selling_rate < 0.0 || self.initial_buying_rate < 0.0 {
            push_error(errors, prefix, "final_selling_rate", "rates must be >= 0");
        }
        if self.update_interval == 0 {
            push_error(errors, prefix, "update_interval", "must be > 0");
        }
    }

    fn sell_ramp(&self) -> PriceRamp {
        PriceRamp {
            initial: self.initial_selling_rate,
            final_rate: self.final_selling_rate,
            fit_to_limit: self.fit_to_limit,
            step: self.energy_rate_change_per_update,
            update_interval: self.update_interval,
        }
    }

    fn buy_ramp(&self) -> PriceRamp {
        PriceRamp {
            initial: self.initial_buying_rate,
            final_rate: self.final_buying_rate,
            fit_to_limit: self.fit_to_limit,
            step: self.energy_rate_change_per_update,
            update_interval: self.update_interval,
        }
    }
}

/// Trades its battery on both sides of the market.
///
/// State of charge is tracked as a fraction and changes only through trades:
/// buying `e` kWh adds `e * eta_charge / capacity`, selling removes
/// `e / (capacity * eta_discharge)`.
#[derive(Debug, Clone)]
pub struct StorageStrategy {
    config: StorageConfig,
    soc: f64,
    bought_kwh: f64,
    sold_kwh: f64,
    offer: OrderHandle,
    bid: OrderHandle,
}

impl StorageStrategy {
    pub fn new(config: StorageConfig) -> Self {
        let soc = config.initial_soc / 100.0;
        Self {
            config,
            soc,
            bought_kwh: 0.0,
            sold_kwh: 0.0,
            offer: OrderHandle::default(),
            bid: OrderHandle::default(),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub(crate) fn reconfigure(&mut self, config: StorageConfig) {
        self.config = config;
    }

    /// State of charge as a fraction (0.0 to 1.0).
    pub fn soc(&self) -> f64 {
        self.soc
    }

    /// Energy the battery can still deliver this slot (kWh).
    pub fn sellable_kwh(&self, slot_hours: f64) -> f64 {
        let c = &self.config;
        let by_power = c.max_abs_battery_power_kw * slot_hours - self.sold_kwh;
        let by_soc = (self.soc - c.min_allowed_soc / 100.0) * c.battery_capacity_kwh * c.eta_discharge;
        by_power.min(by_soc).max(0.0)
    }

    /// Energy the battery can still absorb this slot (kWh).
    pub fn buyable_kwh(&self, slot_hours: f64) -> f64 {
        let c = &self.config;
        let by_power = c.max_abs_battery_power_kw * slot_hours - self.bought_kwh;
        let by_soc = (1.0 - self.soc) * c.battery_capacity_kwh / c.eta_charge;
        by_power.min(by_soc).max(0.0)
    }
}

impl Strategy for StorageStrategy {
    fn participation(&self) -> Participation {
        Participation::Both
    }

    fn on_tick(&mut self, market: &mut Market, ctx: &StrategyContext<'_>) -> Result<()> {
        let ticks = ctx.config.ticks_per_slot();
        let sell_rate = self.config.sell_ramp().rate(ctx.tick, ticks);
        let buy_rate = self.config.buy_ramp().rate(ctx.tick, ticks);
        let sellable = self.sellable_kwh(ctx.slot_hours());
        let buyable = self.buyable_kwh(ctx.slot_hours());

        self.offer.keep_offer(market, ctx.owner, sellable, sell_rate)?;
        if ctx.is_two_sided() {
            self.bid.keep_bid(market, ctx.owner, buyable, buy_rate)
        } else if buyable > FLOATING_POINT_TOLERANCE {
            buy_cheapest(market, ctx.owner, buyable, buy_rate)
        } else {
            Ok(())
        }
    }

    fn on_trade(&mut self, _market: &Market, trade: &Trade, ctx: &StrategyContext<'_>) {
        let c = &self.config;
        if trade.seller == ctx.owner {
            self.sold_kwh += trade.traded_energy;
            self.soc -= trade.traded_energy / (c.battery_capacity_kwh * c.eta_discharge);
        } else if trade.buyer == ctx.owner {
            self.bought_kwh += trade.traded_energy;
            self.soc += trade.traded_energy * c.eta_charge / c.battery_capacity_kwh;
        }
        self.soc = self.soc.clamp(0.0, 1.0);
    }

    fn on_market_cycle(&mut self, _ctx: &StrategyContext<'_>) {
        self.bought_kwh = 0.0;
        self.sold_kwh = 0.0;
        self.offer.clear();
        self.bid.clear();
    }
}
