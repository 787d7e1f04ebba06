//! Trading strategies attached to leaf areas.
//!
//! A strategy decides *what* to bid or offer; the market decides what trades.
//! The reference strategies here derive their energy quantities from simple
//! device models (constant load hours, a daylight PV curve with Gaussian
//! noise, an efficiency-aware battery) and ramp their prices linearly over
//! each slot.

pub mod infinite;
pub mod load;
pub mod pv;
pub mod storage;

use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ConfigError;
use crate::error::{Result, SimError};
use crate::market::{FLOATING_POINT_TOLERANCE, Market, OrderId, OrderRequest, Trade};
use crate::sim::types::SimConfig;

pub use infinite::{InfiniteBusConfig, InfiniteBusStrategy, MarketMakerConfig, MarketMakerStrategy};
pub use load::{LoadHoursConfig, LoadHoursStrategy};
pub use pv::{PvConfig, PvStrategy};
pub use storage::{StorageConfig, StorageStrategy};

/// Energy posted by participants with unlimited supply or demand (kWh).
pub const INFINITE_ENERGY_KWH: f64 = 1.0e6;

/// Which sides of the market a strategy trades on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Participation {
    Buyer,
    Seller,
    Both,
}

/// Timing and identity handed to every strategy hook.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    /// Identity the strategy trades under (its area's name).
    pub owner: &'a str,
    pub config: &'a SimConfig,
    /// Current market slot.
    pub slot: u64,
    /// Tick within the slot.
    pub tick: u64,
}

impl StrategyContext<'_> {
    pub fn slot_hours(&self) -> f64 {
        self.config.slot_hours()
    }

    pub fn hour_of_day(&self) -> f64 {
        self.config.hour_of_day(self.slot)
    }

    pub fn is_two_sided(&self) -> bool {
        self.config.market_type.is_two_sided()
    }
}

/// Hooks a leaf area's strategy receives from the scheduler.
pub trait Strategy {
    fn participation(&self) -> Participation;

    /// Called once when the owning area activates.
    fn on_activate(&mut self, _ctx: &StrategyContext<'_>) {}

    /// Posts, re-prices or accepts orders in the current market.
    ///
    /// # Errors
    ///
    /// Any market error; the scheduler logs it and moves on to the next area.
    fn on_tick(&mut self, market: &mut Market, ctx: &StrategyContext<'_>) -> Result<()>;

    /// Called for every trade in which the strategy's owner is buyer or seller.
    fn on_trade(&mut self, _market: &Market, _trade: &Trade, _ctx: &StrategyContext<'_>) {}

    /// Called after the market moved on to `ctx.slot`.
    fn on_market_cycle(&mut self, _ctx: &StrategyContext<'_>) {}
}

/// Serializable strategy parameters, tagged by `type`.
///
/// Field names follow the scenario file (`snake_case`); the unit-suffixed
/// spellings used on the live-event wire (`avg_power_W`, ...) are accepted
/// as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StrategyConfig {
    #[serde(rename = "LoadHours", alias = "Load")]
    LoadHours(LoadHoursConfig),
    #[serde(rename = "PV", alias = "Pv")]
    Pv(PvConfig),
    #[serde(rename = "Storage")]
    Storage(StorageConfig),
    #[serde(rename = "MarketMaker")]
    MarketMaker(MarketMakerConfig),
    #[serde(rename = "InfiniteBus")]
    InfiniteBus(InfiniteBusConfig),
}

impl StrategyConfig {
    /// Type names accepted in the `type` field.
    pub const TYPES: &[&str] = &["LoadHours", "PV", "Storage", "MarketMaker", "InfiniteBus"];

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::LoadHours(_) => "LoadHours",
            Self::Pv(_) => "PV",
            Self::Storage(_) => "Storage",
            Self::MarketMaker(_) => "MarketMaker",
            Self::InfiniteBus(_) => "InfiniteBus",
        }
    }

    /// Checks parameter constraints; `prefix` is prepended to field paths.
    pub fn validate(&self, prefix: &str) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        match self {
            Self::LoadHours(c) => c.validate(prefix, &mut errors),
            Self::Pv(c) => c.validate(prefix, &mut errors),
            Self::Storage(c) => c.validate(prefix, &mut errors),
            Self::MarketMaker(c) => c.validate(prefix, &mut errors),
            Self::InfiniteBus(c) => c.validate(prefix, &mut errors),
        }
        errors
    }

    /// Parses a flat field map (as found in a live-event representation).
    ///
    /// Keys are matched case-insensitively so `avg_power_W` and
    /// `avg_power_w` are the same field; keys no strategy knows are ignored.
    ///
    /// # Errors
    ///
    /// `InvalidEvent` when `type` is missing or unknown, a value has the
    /// wrong shape, or the parameters fail validation.
    pub fn from_fields(fields: &Map<String, Value>) -> Result<Self> {
        let normalized: Map<String, Value> = fields
            .iter()
            .map(|(k, v)| (normalize_key(k), v.clone()))
            .collect();
        if !normalized.contains_key("type") {
            return Err(SimError::InvalidEvent("strategy representation has no `type`".into()));
        }
        let config: Self = serde_json::from_value(Value::Object(normalized))
            .map_err(|e| SimError::InvalidEvent(format!("bad strategy parameters: {e}")))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        let errors = self.validate("");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SimError::InvalidEvent(join_errors(&errors)))
        }
    }
}

/// Field names are compared lowercase; `type` keeps its spelling.
pub(crate) fn normalize_key(key: &str) -> String {
    key.to_ascii_lowercase()
}

pub(crate) fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of a live field update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldUpdate {
    /// Fields that were recognised and applied.
    pub applied: Vec<String>,
    /// Fields the target does not know; left untouched.
    pub ignored: Vec<String>,
}

/// The strategy held by a leaf area.
///
/// A closed set of variants so a live `type` switch can swap one for another
/// in place while the area keeps its identity.
#[derive(Debug, Clone)]
pub enum StrategyKind {
    Load(LoadHoursStrategy),
    Pv(PvStrategy),
    Storage(StorageStrategy),
    MarketMaker(MarketMakerStrategy),
    InfiniteBus(InfiniteBusStrategy),
}

impl StrategyKind {
    /// Builds a strategy from validated parameters.
    ///
    /// # Arguments
    ///
    /// * `config` - Strategy parameters
    /// * `seed` - Seed for strategies with stochastic profiles
    ///
    /// # Errors
    ///
    /// Returns every constraint violation found in `config`.
    pub fn from_config(config: &StrategyConfig, seed: u64) -> std::result::Result<Self, Vec<ConfigError>> {
        let errors = config.validate("");
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(match config {
            StrategyConfig::LoadHours(c) => Self::Load(LoadHoursStrategy::new(c.clone())),
            StrategyConfig::Pv(c) => Self::Pv(PvStrategy::new(c.clone(), seed)),
            StrategyConfig::Storage(c) => Self::Storage(StorageStrategy::new(c.clone())),
            StrategyConfig::MarketMaker(c) => Self::MarketMaker(MarketMakerStrategy::new(c.clone())),
            StrategyConfig::InfiniteBus(c) => Self::InfiniteBus(InfiniteBusStrategy::new(c.clone())),
        })
    }

    /// Current parameters.
    pub fn config(&self) -> StrategyConfig {
        match self {
            Self::Load(s) => StrategyConfig::LoadHours(s.config().clone()),
            Self::Pv(s) => StrategyConfig::Pv(s.config().clone()),
            Self::Storage(s) => StrategyConfig::Storage(s.config().clone()),
            Self::MarketMaker(s) => StrategyConfig::MarketMaker(s.config().clone()),
            Self::InfiniteBus(s) => StrategyConfig::InfiniteBus(s.config().clone()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.config().type_name()
    }

    /// Applies the recognised entries of `fields` to the current parameters.
    ///
    /// Unknown keys are reported in [`FieldUpdate::ignored`]. Runtime state
    /// (state of charge, energy already traded) is kept.
    ///
    /// # Errors
    ///
    /// `InvalidEvent` if a recognised value has the wrong shape or the
    /// merged parameters fail validation; nothing is changed in that case.
    pub fn update_fields(&mut self, fields: &Map<String, Value>) -> Result<FieldUpdate> {
        let current = serde_json::to_value(self.config())
            .map_err(|e| SimError::InvalidEvent(format!("cannot serialize strategy: {e}")))?;
        let Value::Object(mut merged) = current else {
            return Err(SimError::InvalidEvent("strategy parameters are not a map".into()));
        };

        let mut update = FieldUpdate::default();
        for (key, value) in fields {
            let normalized = normalize_key(key);
            if normalized != "type" && merged.contains_key(&normalized) {
                merged.insert(normalized, value.clone());
                update.applied.push(key.clone());
            } else {
                update.ignored.push(key.clone());
            }
        }
        if !update.ignored.is_empty() {
            debug!(ignored = ?update.ignored, strategy = self.type_name(), "ignoring unknown fields");
        }

        let config: StrategyConfig = serde_json::from_value(Value::Object(merged))
            .map_err(|e| SimError::InvalidEvent(format!("bad strategy parameters: {e}")))?;
        config.check()?;
        match (self, config) {
            (Self::Load(s), StrategyConfig::LoadHours(c)) => s.reconfigure(c),
            (Self::Pv(s), StrategyConfig::Pv(c)) => s.reconfigure(c),
            (Self::Storage(s), StrategyConfig::Storage(c)) => s.reconfigure(c),
            (Self::MarketMaker(s), StrategyConfig::MarketMaker(c)) => s.reconfigure(c),
            (Self::InfiniteBus(s), StrategyConfig::InfiniteBus(c)) => s.reconfigure(c),
            (s, c) => {
                return Err(SimError::InvalidEvent(format!(
                    "update produced {} parameters for a {} strategy",
                    c.type_name(),
                    s.type_name()
                )));
            }
        }
        Ok(update)
    }

    fn inner(&mut self) -> &mut dyn Strategy {
        match self {
            Self::Load(s) => s,
            Self::Pv(s) => s,
            Self::Storage(s) => s,
            Self::MarketMaker(s) => s,
            Self::InfiniteBus(s) => s,
        }
    }
}

impl Strategy for StrategyKind {
    fn participation(&self) -> Participation {
        match self {
            Self::Load(s) => s.participation(),
            Self::Pv(s) => s.participation(),
            Self::Storage(s) => s.participation(),
            Self::MarketMaker(s) => s.participation(),
            Self::InfiniteBus(s) => s.participation(),
        }
    }

    fn on_activate(&mut self, ctx: &StrategyContext<'_>) {
        self.inner().on_activate(ctx);
    }

    fn on_tick(&mut self, market: &mut Market, ctx: &StrategyContext<'_>) -> Result<()> {
        self.inner().on_tick(market, ctx)
    }

    fn on_trade(&mut self, market: &Market, trade: &Trade, ctx: &StrategyContext<'_>) {
        self.inner().on_trade(market, trade, ctx);
    }

    fn on_market_cycle(&mut self, ctx: &StrategyContext<'_>) {
        self.inner().on_market_cycle(ctx);
    }
}

/// Linear price schedule across the ticks of a slot.
///
/// With `fit_to_limit` the rate moves from `initial` to `final_rate` evenly
/// over the slot; otherwise it moves by `step` every `update_interval` ticks
/// and stops at `final_rate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceRamp {
    pub initial: f64,
    pub final_rate: f64,
    pub fit_to_limit: bool,
    pub step: f64,
    pub update_interval: u64,
}

impl PriceRamp {
    /// Rate in effect at `tick` of a slot with `ticks_per_slot` ticks.
    pub fn rate(&self, tick: u64, ticks_per_slot: u64) -> f64 {
        let interval = self.update_interval.max(1);
        let updates = (tick / interval) as f64;
        let direction = if self.final_rate >= self.initial { 1.0 } else { -1.0 };
        let span = (self.final_rate - self.initial).abs();
        let moved = if self.fit_to_limit {
            let total_updates = (ticks_per_slot.saturating_sub(1) / interval).max(1) as f64;
            span * (updates / total_updates).min(1.0)
        } else {
            (self.step.abs() * updates).min(span)
        };
        self.initial + direction * moved
    }
}

/// Tracks one open order of a strategy across splits and re-pricing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct OrderHandle(Option<OrderId>);

impl OrderHandle {
    pub(crate) fn clear(&mut self) {
        self.0 = None;
    }

    /// Makes the open offer match `energy` at `price`, posting, replacing or
    /// withdrawing as needed.
    pub(crate) fn keep_offer(&mut self, market: &mut Market, owner: &str, energy: f64, price: f64) -> Result<()> {
        let open = self
            .0
            .map(|id| market.book().resolve(id))
            .and_then(|id| market.book().offer(id).map(|o| (id, o.energy, o.price)));
        self.0 = match open {
            Some((id, _, _)) if energy <= FLOATING_POINT_TOLERANCE => {
                market.delete_order(id)?;
                None
            }
            None if energy <= FLOATING_POINT_TOLERANCE => None,
            Some((id, e, p)) if same_order(e, p, energy, price) => Some(id),
            Some((id, _, _)) => market.replace_offer(id, OrderRequest::new(energy, price, owner))?,
            None => Some(market.post_offer(OrderRequest::new(energy, price, owner))?),
        };
        Ok(())
    }

    /// Bid counterpart of [`OrderHandle::keep_offer`].
    pub(crate) fn keep_bid(&mut self, market: &mut Market, owner: &str, energy: f64, price: f64) -> Result<()> {
        let open = self
            .0
            .map(|id| market.book().resolve(id))
            .and_then(|id| market.book().bid(id).map(|b| (id, b.energy, b.price)));
        self.0 = match open {
            Some((id, _, _)) if energy <= FLOATING_POINT_TOLERANCE => {
                market.delete_order(id)?;
                None
            }
            None if energy <= FLOATING_POINT_TOLERANCE => None,
            Some((id, e, p)) if same_order(e, p, energy, price) => Some(id),
            Some((id, _, _)) => market.replace_bid(id, OrderRequest::new(energy, price, owner))?,
            None => Some(market.post_bid(OrderRequest::new(energy, price, owner))?),
        };
        Ok(())
    }
}

fn same_order(energy: f64, price: f64, target_energy: f64, target_price: f64) -> bool {
    (energy - target_energy).abs() <= FLOATING_POINT_TOLERANCE
        && (price - target_price).abs() <= FLOATING_POINT_TOLERANCE
}

/// One-sided buying: accepts the cheapest foreign offers priced at or below
/// `max_rate` until `energy` is covered.
pub(crate) fn buy_cheapest(market: &mut Market, owner: &str, energy: f64, max_rate: f64) -> Result<()> {
    let candidates: Vec<(OrderId, f64)> = market
        .book()
        .sorted_offers()
        .into_iter()
        .filter(|o| o.seller != owner && o.price <= max_rate)
        .map(|o| (o.id, o.energy))
        .collect();
    let mut left = energy;
    for (id, available) in candidates {
        if left <= FLOATING_POINT_TOLERANCE {
            break;
        }
        let take = left.min(available);
        market.accept_offer(id, owner, Some(take))?;
        left -= take;
    }
    Ok(())
}

/// Gaussian noise via the Box-Muller transform.
///
/// # Arguments
///
/// * `rng` - Random number generator
/// * `std_dev` - Standard deviation of the noise
///
/// # Returns
///
/// Random value with mean 0 and the given standard deviation
pub fn gaussian_noise(rng: &mut StdRng, std_dev: f64) -> f64 {
    if std_dev <= 0.0 {
        return 0.0;
    }
    let u1: f64 = rng.random::<f64>().clamp(1e-12, 1.0);
    let u2: f64 = rng.random::<f64>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    z0 * std_dev
}

pub(crate) fn push_error(errors: &mut Vec<ConfigError>, prefix: &str, field: &str, message: impl Into<String>) {
    let field = if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    };
    errors.push(ConfigError {
        field,
        message: message.into(),
    });
}
