//! Flow-rate admission control and safety interlocks for irrigation runs.
//!
//! [`logic::IrrigationEngine`] is the entry point: it decides whether a run
//! starts now, waits in the queue for hydraulic capacity, or is blocked by an
//! interlock.

pub mod config;
pub mod datasources;
pub mod db;
pub mod error;
pub mod logic;
pub mod models;
pub mod repository;

pub use error::{FlowGateError, Result};
