//! PV generator selling its forecast output, lowering its price over the slot.

use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};

use super::{
    OrderHandle, Participation, PriceRamp, Strategy, StrategyContext, gaussian_noise, push_error,
};
use crate::config::ConfigError;
use crate::error::Result;
use crate::market::{Market, Trade};

/// Parameters of a [`PvStrategy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvConfig {
    pub panel_count: u32,
    /// Peak output of one panel (W).
    #[serde(alias = "max_panel_power_W")]
    pub max_panel_power_w: f64,
    /// Hour of day generation starts.
    pub sunrise_hour: f64,
    /// Hour of day generation ends.
    pub sunset_hour: f64,
    /// Standard deviation of the output noise as a fraction of output.
    pub noise_std: f64,
    pub initial_selling_rate: f64,
    pub final_selling_rate: f64,
    /// Ticks between price updates.
    pub update_interval: u64,
    /// Rate decrease per update when `fit_to_limit` is off.
    pub energy_rate_decrease_per_update: f64,
    pub fit_to_limit: bool,
}

impl Default for PvConfig {
    fn default() -> Self {
        Self {
            panel_count: 1,
            max_panel_power_w: 160.0,
            sunrise_hour: 6.0,
            sunset_hour: 18.0,
            noise_std: 0.05,
            initial_selling_rate: 30.0,
            final_selling_rate: 0.0,
            update_interval: 1,
            energy_rate_decrease_per_update: 1.0,
            fit_to_limit: true,
        }
    }
}

impl PvConfig {
    pub(crate) fn validate(&self, prefix: &str, errors: &mut Vec<ConfigError>) {
        if self.max_panel_power_w.is_nan() || self.max_panel_power_w < 0.0 {
            push_error(errors, prefix, "max_panel_power_w", "must be >= 0");
        }
        if !(0.0..24.0).contains(&self.sunrise_hour)
            || !(0.0..=24.0).contains(&self.sunset_hour)
            || self.sunrise_hour >= self.sunset_hour
        {
            push_error(
                errors,
                prefix,
                "sunrise_hour",
                "must satisfy 0 <= sunrise_hour < sunset_hour <= 24",
            );
        }
        if self.noise_std < 0.0 {
            push_error(errors, prefix, "noise_std", "must be >= 0");
        }
        if self.final_selling_rate < 0.0 {
            push_error(errors, prefix, "final_selling_rate", "must be >= 0");
        }
        if self.initial_selling_rate < self.final_selling_rate {
            push_error(
                errors,
                prefix,
                "initial_selling_rate",
                "must not be below final_selling_rate",
            );
        }
        if self.update_interval == 0 {
            push_error(errors, prefix, "update_interval", "must be > 0");
        }
    }

    /// Peak output of all panels (kW).
    pub fn peak_kw(&self) -> f64 {
        f64::from(self.panel_count) * self.max_panel_power_w / 1000.0
    }

    /// Fraction of peak output at `hour`: a half-sine between sunrise and
    /// sunset, zero at night.
    pub fn daylight_fraction(&self, hour: f64) -> f64 {
        if hour <= self.sunrise_hour || hour >= self.sunset_hour {
            return 0.0;
        }
        let progress = (hour - self.sunrise_hour) / (self.sunset_hour - self.sunrise_hour);
        (std::f64::consts::PI * progress).sin().max(0.0)
    }

    fn ramp(&self) -> PriceRamp {
        PriceRamp {
            initial: self.initial_selling_rate,
            final_rate: self.final_selling_rate,
            fit_to_limit: self.fit_to_limit,
            step: self.energy_rate_decrease_per_update,
            update_interval: self.update_interval,
        }
    }
}

/// Sells the slot's generation; unsold energy is curtailed at slot end.
#[derive(Debug, Clone)]
pub struct PvStrategy {
    config: PvConfig,
    /// Generation available in the current slot (kWh).
    available_kwh: f64,
    sold_kwh: f64,
    offer: OrderHandle,
    rng: StdRng,
}

impl PvStrategy {
    /// Creates a PV strategy; `seed` drives the output noise.
    pub fn new(config: PvConfig, seed: u64) -> Self {
        Self {
            config,
            available_kwh: 0.0,
            sold_kwh: 0.0,
            offer: OrderHandle::default(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &PvConfig {
        &self.config
    }

    pub(crate) fn reconfigure(&mut self, config: PvConfig) {
        self.config = config;
    }

    /// Generation still unsold in the current slot (kWh).
    pub fn available_energy_kwh(&self) -> f64 {
        (self.available_kwh - self.sold_kwh).max(0.0)
    }

    fn start_slot(&mut self, ctx: &StrategyContext<'_>) {
        let mid_slot = ctx.hour_of_day() + ctx.slot_hours() / 2.0;
        let frac = self.config.daylight_fraction(mid_slot % 24.0);
        self.available_kwh = if frac > 0.0 {
            let noise = 1.0 + gaussian_noise(&mut self.rng, self.config.noise_std);
            (self.config.peak_kw() * frac * noise).max(0.0) * ctx.slot_hours()
        } else {
            0.0
        };
        self.sold_kwh = 0.0;
        self.offer.clear();
    }
}

impl Strategy for PvStrategy {
    fn participation(&self) -> Participation {
        Participation::Seller
    }

    fn on_activate(&mut self, ctx: &StrategyContext<'_>) {
        self.start_slot(ctx);
    }

    fn on_tick(&mut self, market: &mut Market, ctx: &StrategyContext<'_>) -> Result<()> {
        let rate = self.config.ramp().rate(ctx.tick, ctx.config.ticks_per_slot());
        let energy = self.available_energy_kwh();
        self.offer.keep_offer(market, ctx.owner, energy, rate)
    }

    fn on_trade(&mut self, _market: &Market, trade: &Trade, ctx: &StrategyContext<'_>) {
        if trade.seller == ctx.owner {
            self.sold_kwh += trade.traded_energy;
        }
    }

    fn on_market_cycle(&mut self, ctx: &StrategyContext<'_>) {
        self.start_slot(ctx);
    }
}
