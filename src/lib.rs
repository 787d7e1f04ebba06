//! Hierarchical electricity market simulator.
//!
//! Areas form a tree; every branch runs a market per time slot in which its
//! children trade. Orders that do not match locally are forwarded to the
//! parent market, with grid fees applied at each boundary.

pub mod area;
pub mod config;
pub mod error;
pub mod events;
pub mod io;
pub mod launch;
pub mod market;
/// Clock, scheduler and indicators.
pub mod sim;
pub mod strategy;

#[cfg(feature = "api")]
pub mod api;
