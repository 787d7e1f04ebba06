//! Tick loop driving the area tree.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use super::clock::{SimClock, SimTime};
use super::types::SimConfig;
use crate::area::propagation::{aggregate, dispatch_tick, market_cycle, refresh_mirrors};
use crate::area::{Area, AreaState, SlotSummary};
use crate::config::{ConfigError, ScenarioConfig};
use crate::events::{EventContext, LiveEventQueue, LiveEventSender};
use crate::market::Trade;

/// Cooperative cancellation flag shared with other threads.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    /// Asks the scheduler to halt before its next tick.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of [`Scheduler::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub ticks_run: u64,
    pub slots_completed: u64,
    /// `true` if a [`StopHandle`] ended the run early.
    pub stopped: bool,
    pub events_applied: usize,
    pub events_failed: usize,
    pub trade_count: usize,
    /// Energy traded across all markets (kWh).
    pub traded_energy_kwh: f64,
}

/// One trade together with the area whose market recorded it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub area: String,
    #[serde(flatten)]
    pub trade: Trade,
}

/// Point-in-time view of a run, served by the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    /// Last tick executed; `None` before the first tick.
    pub time: Option<SimTime>,
    pub total_ticks: u64,
    pub finished: bool,
    pub areas: Vec<AreaSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AreaSnapshot {
    pub uuid: Uuid,
    pub name: String,
    pub parent: Option<Uuid>,
    pub state: AreaState,
    /// Strategy type of a leaf, `None` for a branch.
    pub strategy: Option<&'static str>,
    pub current_slot: Option<u64>,
    pub open_offers: usize,
    pub open_bids: usize,
    pub trades_in_current_market: usize,
    pub last_summary: Option<SlotSummary>,
}

/// Owns the area tree, the clock and the live-event queue, and advances
/// the simulation one tick at a time.
///
/// Within a tick the order is fixed: drain live events (re-syncing mirrors
/// if any applied), dispatch the tick top-down, aggregate and clear bottom-up, and on the last tick of a slot
/// cycle every market.
#[derive(Debug)]
pub struct Scheduler {
    config: SimConfig,
    root: Area,
    clock: SimClock,
    events: LiveEventQueue,
    archive: Vec<Area>,
    stop: StopHandle,
    activated: bool,
    seed: u64,
    last: Option<SimTime>,
    events_applied: usize,
    events_failed: usize,
}

impl Scheduler {
    /// Creates a scheduler for an already-built area tree.
    pub fn new(config: SimConfig, root: Area) -> Self {
        let clock = SimClock::new(config.total_slots(), config.ticks_per_slot());
        let seed = config.seed;
        Self {
            config,
            root,
            clock,
            events: LiveEventQueue::new(),
            archive: Vec::new(),
            stop: StopHandle::default(),
            activated: false,
            seed,
            last: None,
            events_applied: 0,
            events_failed: 0,
        }
    }

    /// Validates `scenario`, builds its area tree and schedules its events.
    ///
    /// # Errors
    ///
    /// Every configuration problem found.
    pub fn from_scenario(scenario: &ScenarioConfig) -> Result<Self, Vec<ConfigError>> {
        let errors = scenario.validate();
        if !errors.is_empty() {
            return Err(errors);
        }
        let config = scenario.simulation.to_sim_config();
        let mut seed = config.seed;
        let root = Area::from_config(&scenario.grid, &mut seed)?;
        let mut scheduler = Self::new(config, root);
        scheduler.seed = seed;
        for event in &scenario.events {
            scheduler
                .events
                .schedule(event.slot, event.tick, event.event.clone());
        }
        Ok(scheduler)
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn root(&self) -> &Area {
        &self.root
    }

    /// Areas removed by live events, with their market history.
    pub fn archive(&self) -> &[Area] {
        &self.archive
    }

    pub fn events_mut(&mut self) -> &mut LiveEventQueue {
        &mut self.events
    }

    pub fn event_sender(&self) -> LiveEventSender {
        self.events.sender()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Last tick executed.
    pub fn last_time(&self) -> Option<SimTime> {
        self.last
    }

    pub fn is_finished(&self) -> bool {
        self.clock.peek().is_none()
    }

    /// Activates the tree against the first slot. Runs once.
    pub fn activate(&mut self) {
        if self.activated {
            return;
        }
        self.activated = true;
        self.root.activate(0, &self.config);
        info!(
            areas = self.root.area_count(),
            slots = self.config.total_slots(),
            ticks_per_slot = self.config.ticks_per_slot(),
            market_type = %self.config.market_type,
            "simulation activated"
        );
    }

    /// Executes one tick.
    ///
    /// # Returns
    ///
    /// The tick executed, or `None` once the clock is exhausted or a stop
    /// was requested.
    pub fn step(&mut self) -> Option<SimTime> {
        if self.stop.is_stopped() {
            return None;
        }
        let time = self.clock.tick()?;
        let started = Instant::now();
        self.activate();

        self.events.collect(time);
        if !self.events.is_empty() {
            let mut ctx = EventContext {
                config: &self.config,
                slot: time.slot,
                seed: &mut self.seed,
            };
            let report = self.events.handle_all_events(&mut self.root, &mut ctx);
            debug!(applied = report.applied, failed = report.failed, "live events drained");
            self.events_applied += report.applied;
            self.events_failed += report.failed;
            self.archive.extend(report.retired);
            if report.applied > 0 {
                refresh_mirrors(&mut self.root, time.slot);
            }
        }

        dispatch_tick(&mut self.root, time, &self.config);
        // on the last tick this is also the final clearing pass of the slot
        aggregate(&mut self.root, time.slot, &self.config);
        if time.is_last_in_slot(self.config.ticks_per_slot()) {
            let next = Some(time.slot + 1).filter(|s| *s < self.config.total_slots());
            market_cycle(&mut self.root, time.slot, next, &self.config);
            debug!(slot = time.slot, "market cycle");
        }
        self.last = Some(time);

        if let Some(budget) = self.config.realtime_tick() {
            let elapsed = started.elapsed();
            if elapsed < budget {
                std::thread::sleep(budget - elapsed);
            }
        }
        Some(time)
    }

    /// Runs until the clock is exhausted or a stop is requested.
    pub fn run(&mut self) -> RunReport {
        let mut ticks_run = 0;
        while self.step().is_some() {
            ticks_run += 1;
        }
        let ledger = self.trade_ledger();
        let report = RunReport {
            ticks_run,
            slots_completed: self
                .last
                .map_or(0, |t| t.slot + u64::from(t.is_last_in_slot(self.config.ticks_per_slot()))),
            stopped: self.stop.is_stopped() && !self.is_finished(),
            events_applied: self.events_applied,
            events_failed: self.events_failed,
            trade_count: ledger.len(),
            traded_energy_kwh: ledger.iter().map(|e| e.trade.traded_energy).sum(),
        };
        info!(
            ticks = report.ticks_run,
            trades = report.trade_count,
            stopped = report.stopped,
            "simulation finished"
        );
        report
    }

    /// Every retained trade of every area, live and retired, in tree order
    /// then slot order.
    pub fn trade_ledger(&self) -> Vec<LedgerEntry> {
        let mut ledger = Vec::new();
        let mut collect = |area: &Area| {
            for market in area.markets() {
                ledger.extend(market.trades().iter().map(|trade| LedgerEntry {
                    area: area.name().to_string(),
                    trade: trade.clone(),
                }));
            }
        };
        self.root.walk(&mut collect);
        for retired in &self.archive {
            retired.walk(&mut collect);
        }
        ledger
    }

    /// Every slot summary recorded so far, live and retired areas.
    pub fn slot_summaries(&self) -> Vec<SlotSummary> {
        let mut summaries = Vec::new();
        let mut collect = |area: &Area| summaries.extend(area.summaries().iter().cloned());
        self.root.walk(&mut collect);
        for retired in &self.archive {
            retired.walk(&mut collect);
        }
        summaries
    }

    pub fn snapshot(&self) -> RunSnapshot {
        let mut areas = Vec::new();
        self.root.walk(&mut |area| {
            let market = area.current_market();
            areas.push(AreaSnapshot {
                uuid: area.uuid(),
                name: area.name().to_string(),
                parent: area.parent(),
                state: area.state(),
                strategy: area.strategy().map(|s| s.type_name()),
                current_slot: area.current_slot(),
                open_offers: market.map_or(0, |m| m.offers().len()),
                open_bids: market.map_or(0, |m| m.bids().len()),
                trades_in_current_market: market.map_or(0, |m| m.trades().len()),
                last_summary: area.summaries().last().cloned(),
            });
        });
        RunSnapshot {
            time: self.last,
            total_ticks: self.clock.total_ticks(),
            finished: self.is_finished(),
            areas,
        }
    }
}
