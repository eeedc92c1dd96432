//! txpilot - drives EVM transactions from intent to verified confirmation
//!
//! The engine reserves nonces, builds and signs requests, broadcasts them with
//! classified retries, then watches every record through inclusion, reorgs,
//! stuck-mempool recovery and post-confirmation execution checks.

pub mod api;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod reader;
pub mod state;
pub mod tx;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{EngineOptions, TxEngine, WatchHandle};
pub use error::{EngineError, EngineResult};
