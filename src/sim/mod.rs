/// Simulation clock for tick and slot management.
pub mod clock;
/// Post-hoc market indicators.
pub mod kpi;
/// Tick loop driving the area tree.
pub mod scheduler;
pub mod types;
