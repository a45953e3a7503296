//! Directional spot/margin trading engine: multi-timeframe signal fusion,
//! risk-gated admission, tiered position lifecycle, and retry-hardened order
//! execution against a Kraken-style venue.

pub mod analytics;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod kraken_api;
pub mod position;
pub mod risk;
pub mod signals;
pub mod telegram;
pub mod types;
pub mod venue;
