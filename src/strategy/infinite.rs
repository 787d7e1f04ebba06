//! Participants with unlimited supply (market maker) or supply and demand
//! (infinite bus) at fixed rates.

use serde::{Deserialize, Serialize};

use super::{
    INFINITE_ENERGY_KWH, OrderHandle, Participation, Strategy, StrategyContext, buy_cheapest,
    push_error,
};
use crate::config::ConfigError;
use crate::error::Result;
use crate::market::{Market, Trade};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketMakerConfig {
    /// Rate at which unlimited energy is offered.
    pub energy_rate: f64,
}

impl Default for MarketMakerConfig {
    fn default() -> Self {
        Self { energy_rate: 30.0 }
    }
}

impl MarketMakerConfig {
    pub(crate) fn validate(&self, prefix: &str, errors: &mut Vec<ConfigError>) {
        if self.energy_rate.is_nan() || self.energy_rate < 0.0 {
            push_error(errors, prefix, "energy_rate", "must be >= 0");
        }
    }
}

/// Offers unlimited energy at a fixed rate, setting the market's price cap.
#[derive(Debug, Clone)]
pub struct MarketMakerStrategy {
    config: MarketMakerConfig,
    sold_kwh: f64,
    offer: OrderHandle,
}

impl MarketMakerStrategy {
    pub fn new(config: MarketMakerConfig) -> Self {
        Self {
            config,
            sold_kwh: 0.0,
            offer: OrderHandle::default(),
        }
    }

    pub fn config(&self) -> &MarketMakerConfig {
        &self.config
    }

    pub(crate) fn reconfigure(&mut self, config: MarketMakerConfig) {
        self.config = config;
    }
}

impl Strategy for MarketMakerStrategy {
    fn participation(&self) -> Participation {
        Participation::Seller
    }

    fn on_tick(&mut self, market: &mut Market, ctx: &StrategyContext<'_>) -> Result<()> {
        let energy = INFINITE_ENERGY_KWH - self.sold_kwh;
        self.offer
            .keep_offer(market, ctx.owner, energy, self.config.energy_rate)
    }

    fn on_trade(&mut self, _market: &Market, trade: &Trade, ctx: &StrategyContext<'_>) {
        if trade.seller == ctx.owner {
            self.sold_kwh += trade.traded_energy;
        }
    }

    fn on_market_cycle(&mut self, _ctx: &StrategyContext<'_>) {
        self.sold_kwh = 0.0;
        self.offer.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfiniteBusConfig {
    /// Rate at which the bus sells.
    pub energy_rate: f64,
    /// Rate at which the bus buys (feed-in tariff).
    pub energy_buy_rate: f64,
}

impl Default for InfiniteBusConfig {
    fn default() -> Self {
        Self {
            energy_rate: 30.0,
            energy_buy_rate: 0.0,
        }
    }
}

impl InfiniteBusConfig {
    pub(crate) fn validate(&self, prefix: &str, errors: &mut Vec<ConfigError>) {
        if self.energy_rate.is_nan() || self.energy_rate < 0.0 {
            push_error(errors, prefix, "energy_rate", "must be >= 0");
        }
        if self.energy_buy_rate.is_nan() || self.energy_buy_rate < 0.0 {
            push_error(errors, prefix, "energy_buy_rate", "must be >= 0");
        }
        if self.energy_buy_rate > self.energy_rate {
            push_error(
                errors,
                prefix,
                "energy_buy_rate",
                "must not exceed energy_rate",
            );
        }
    }
}

/// Connection to an external grid: sells and buys without limit.
#[derive(Debug, Clone)]
pub struct InfiniteBusStrategy {
    config: InfiniteBusConfig,
    sold_kwh: f64,
    bought_kwh: f64,
    offer: OrderHandle,
    bid: OrderHandle,
}

impl InfiniteBusStrategy {
    pub fn new(config: InfiniteBusConfig) -> Self {
        Self {
            config,
            sold_kwh: 0.0,
            bought_kwh: 0.0,
            offer: OrderHandle::default(),
            bid: OrderHandle::default(),
        }
    }

    pub fn config(&self) -> &InfiniteBusConfig {
        &self.config
    }

    pub(crate) fn reconfigure(&mut self, config: InfiniteBusConfig) {
        self.config = config;
    }
}

impl Strategy for InfiniteBusStrategy {
    fn participation(&self) -> Participation {
        Participation::Both
    }

    fn on_tick(&mut self, market: &mut Market, ctx: &StrategyContext<'_>) -> Result<()> {
        self.offer.keep_offer(
            market,
            ctx.owner,
            INFINITE_ENERGY_KWH - self.sold_kwh,
            self.config.energy_rate,
        )?;
        if ctx.is_two_sided() {
            self.bid.keep_bid(
                market,
                ctx.owner,
                INFINITE_ENERGY_KWH - self.bought_kwh,
                self.config.energy_buy_rate,
            )
        } else {
            buy_cheapest(market, ctx.owner, INFINITE_ENERGY_KWH, self.config.energy_buy_rate)
        }
    }

    fn on_trade(&mut self, _market: &Market, trade: &Trade, ctx: &StrategyContext<'_>) {
        if trade.seller == ctx.owner {
            self.sold_kwh += trade.traded_energy;
        } else if trade.buyer == ctx.owner {
            self.bought_kwh += trade.traded_energy;
        }
    }

    fn on_market_cycle(&mut self, _ctx: &StrategyContext<'_>) {
        self.sold_kwh = 0.0;
        self.bought_kwh = 0.0;
        self.offer.clear();
        self.bid.clear();
    }
}
