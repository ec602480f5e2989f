//! # Prediction Trader
//!
//! Risk-managed trade decision and execution core for binary prediction
//! markets. Polls market data, turns it into scored opportunities, gates them
//! through risk limits and manual approval, and places orders while keeping a
//! hash-chained audit log that the whole state can be rebuilt from.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Market data feed, venue clients and paper trading doubles
//! - `strategy`: Signals, opportunity scanning, order lifecycle and execution
//! - `risk`: Pre-trade limits and the manual approval gate
//! - `portfolio`: Cash, positions, reservations and daily loss
//! - `audit`: Hash-chained event log and replay
//! - `persistence`: SQLite storage for the audit log
//! - `alert`: Operator notifications
//! - `engine`: Scheduling, pause/halt control and the operator console
//! - `utils`: Shared decimal helpers

pub mod alert;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod portfolio;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::TradingError;
