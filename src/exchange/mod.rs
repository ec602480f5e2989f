//! Market data and order venue integrations.
//!
//! ## Market data
//! - `GammaClient`: Polymarket Gamma listing (best bid/ask, volume, end date)
//! - `StaticMarketSource`: fixed demo markets
//! - `MarketDataFeed`: retrying, sequence-ordered polling on top of either
//!
//! ## Orders
//! - `RestVenueClient`: HMAC-signed REST venue
//! - `PaperVenue`: in-process venue for paper trading

mod client;
pub mod feed;
pub mod mock;
pub mod traits;
mod types;
mod venue;

pub use client::GammaClient;
pub use feed::{BoardEntry, FallbackBoard, MarketDataFeed, QuoteBoard};
pub use mock::{PaperVenue, StaticMarketSource};
pub use traits::{MarketDataSource, OrderVenue};
#[cfg(test)]
pub use traits::{MockMarketDataSource, MockOrderVenue};
pub use types::*;
pub use venue::RestVenueClient;
