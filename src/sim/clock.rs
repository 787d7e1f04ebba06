/// Position of a tick on the simulation timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SimTime {
    /// Market slot the tick belongs to.
    pub slot: u64,
    /// Tick index within the slot (starting from 0).
    pub tick: u64,
    /// Global tick index since the start of the run.
    pub index: u64,
}

impl SimTime {
    /// `true` for the final tick of its slot, after which the market cycles.
    pub fn is_last_in_slot(&self, ticks_per_slot: u64) -> bool {
        self.tick + 1 == ticks_per_slot
    }
}

/// A simulation clock that walks ticks grouped into market slots.
///
/// The `SimClock` provides methods to advance time tick-by-tick or run
/// a function at each tick until completion.
///
/// # Examples
///
/// ```
/// use gridmarket_sim::sim::clock::SimClock;
///
/// let mut clock = SimClock::new(2, 3);
/// let mut seen = Vec::new();
///
/// clock.run(|t| seen.push((t.slot, t.tick)));
/// assert_eq!(seen, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
/// ```
#[derive(Debug, Clone)]
pub struct SimClock {
    /// Next global tick index
    current: u64,
    /// Number of slots to run
    slots: u64,
    /// Ticks in each slot
    ticks_per_slot: u64,
}

impl SimClock {
    /// Creates a new clock.
    ///
    /// # Arguments
    ///
    /// * `slots` - The number of market slots to run
    /// * `ticks_per_slot` - Ticks in each slot (must be > 0)
    ///
    /// # Panics
    ///
    /// Panics if `ticks_per_slot` is zero.
    pub fn new(slots: u64, ticks_per_slot: u64) -> Self {
        assert!(ticks_per_slot > 0, "ticks_per_slot must be > 0");
        Self {
            current: 0,
            slots,
            ticks_per_slot,
        }
    }

    pub fn total_ticks(&self) -> u64 {
        self.slots * self.ticks_per_slot
    }

    /// The tick that the next call to [`SimClock::tick`] will return, if any.
    pub fn peek(&self) -> Option<SimTime> {
        (self.current < self.total_ticks()).then(|| self.time_at(self.current))
    }

    fn time_at(&self, index: u64) -> SimTime {
        SimTime {
            slot: index / self.ticks_per_slot,
            tick: index % self.ticks_per_slot,
            index,
        }
    }

    /// Advances the clock by one tick.
    ///
    /// # Returns
    ///
    /// * `Some(time)` - The tick position before advancing
    /// * `None` - If the clock has run all slots
    pub fn tick(&mut self) -> Option<SimTime> {
        let time = self.peek()?;
        self.current += 1;
        Some(time)
    }

    /// Runs a function for each remaining tick.
    ///
    /// # Arguments
    ///
    /// * `f` - A function that takes the current tick position
    pub fn run(&mut self, mut f: impl FnMut(SimTime)) {
        while let Some(time) = self.tick() {
            f(time);
        }
    }
}
