//! Market-wide simulation configuration.

use std::time::Duration;

use serde::Serialize;

use crate::market::MarketType;

/// Centralized simulation configuration.
///
/// Every market-wide constant lives here and is passed explicitly to the
/// scheduler and to each area; nothing reads global state.
///
/// # Examples
///
/// ```
/// use gridmarket_sim::market::MarketType;
/// use gridmarket_sim::sim::types::SimConfig;
///
/// let cfg = SimConfig::new(15, 60, 24, MarketType::PayAsBid, 42);
/// assert_eq!(cfg.ticks_per_slot(), 15);
/// assert_eq!(cfg.total_slots(), 96);
/// assert_eq!(cfg.slot_hours(), 0.25);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimConfig {
    /// Length of one market slot in minutes.
    pub slot_length_minutes: u64,
    /// Length of one tick in seconds.
    pub tick_length_seconds: u64,
    /// Simulated duration in hours.
    pub duration_hours: u64,
    /// Matching policy used by every market.
    pub market_type: MarketType,
    /// Master random seed for reproducibility.
    pub seed: u64,
    /// Wall-clock budget per tick; `None` runs as fast as possible.
    pub realtime_tick_ms: Option<u64>,
    /// Number of closed markets each area retains; `None` keeps all.
    pub keep_past_markets: Option<usize>,
}

impl SimConfig {
    /// Creates a new simulation configuration.
    ///
    /// # Arguments
    ///
    /// * `slot_length_minutes` - Market slot length (must be > 0)
    /// * `tick_length_seconds` - Tick length; must divide the slot evenly
    /// * `duration_hours` - Simulated duration; must cover at least one slot
    /// * `market_type` - Matching policy
    /// * `seed` - Master random seed
    ///
    /// # Panics
    ///
    /// Panics if any of the timing constraints above is violated. Scenario
    /// validation checks them first, so this only fires on programmer error.
    pub fn new(
        slot_length_minutes: u64,
        tick_length_seconds: u64,
        duration_hours: u64,
        market_type: MarketType,
        seed: u64,
    ) -> Self {
        assert!(slot_length_minutes > 0, "slot_length_minutes must be > 0");
        assert!(tick_length_seconds > 0, "tick_length_seconds must be > 0");
        assert!(
            (slot_length_minutes * 60) % tick_length_seconds == 0,
            "tick length must divide the slot length"
        );
        assert!(
            duration_hours * 60 >= slot_length_minutes,
            "duration must cover at least one slot"
        );
        Self {
            slot_length_minutes,
            tick_length_seconds,
            duration_hours,
            market_type,
            seed,
            realtime_tick_ms: None,
            keep_past_markets: None,
        }
    }

    /// Paces each tick to `ms` milliseconds of wall-clock time.
    pub fn with_realtime_tick_ms(mut self, ms: u64) -> Self {
        self.realtime_tick_ms = Some(ms);
        self
    }

    /// Limits how many closed markets each area keeps.
    pub fn with_keep_past_markets(mut self, count: usize) -> Self {
        self.keep_past_markets = Some(count);
        self
    }

    pub fn ticks_per_slot(&self) -> u64 {
        self.slot_length_minutes * 60 / self.tick_length_seconds
    }

    /// Number of complete slots in the simulated duration.
    pub fn total_slots(&self) -> u64 {
        self.duration_hours * 60 / self.slot_length_minutes
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_slots() * self.ticks_per_slot()
    }

    /// Slot length in hours (kW over one slot times this is kWh).
    pub fn slot_hours(&self) -> f64 {
        self.slot_length_minutes as f64 / 60.0
    }

    /// Hour of day (0.0..24.0) at the start of `slot`.
    pub fn hour_of_day(&self, slot: u64) -> f64 {
        ((slot * self.slot_length_minutes) % (24 * 60)) as f64 / 60.0
    }

    pub fn realtime_tick(&self) -> Option<Duration> {
        self.realtime_tick_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_config_derived_values() {
        let cfg = SimConfig::new(60, 900, 48, MarketType::OneSided, 7);
        assert_eq!(cfg.ticks_per_slot(), 4);
        assert_eq!(cfg.total_slots(), 48);
        assert_eq!(cfg.total_ticks(), 192);
        assert_eq!(cfg.slot_hours(), 1.0);
        assert_eq!(cfg.hour_of_day(25), 1.0);
        assert_eq!(cfg.realtime_tick(), None);
    }

    #[test]
    fn builder_options() {
        let cfg = SimConfig::new(15, 60, 1, MarketType::PayAsClear, 0)
            .with_realtime_tick_ms(5)
            .with_keep_past_markets(2);
        assert_eq!(cfg.realtime_tick(), Some(Duration::from_millis(5)));
        assert_eq!(cfg.keep_past_markets, Some(2));
    }

    #[test]
    #[should_panic]
    fn tick_must_divide_slot() {
        SimConfig::new(15, 7, 24, MarketType::PayAsBid, 0);
    }

    #[test]
    #[should_panic]
    fn duration_shorter_than_slot_panics() {
        SimConfig::new(120, 60, 1, MarketType::PayAsBid, 0);
    }
}
