//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Signal strategies and opportunity scanning
//! - Order lifecycle and authorization
//! - Order execution against a venue
//! - The ledger and order book shared under one lock

mod executor;
mod order;
mod scanner;
mod signals;
mod state;

pub use executor::{Admission, ExecutionSettings, OrderExecutor, Route};
pub use order::{Authorization, Grant, Order, OrderStatus};
pub use scanner::{Opportunity, OpportunityScanner, LOT_SIZE};
pub use signals::{
    strategy_from_config, ConvictionStrategy, ModelEdgeStrategy, Signal, SignalStrategy,
};
pub use state::TradingState;

#[cfg(test)]
use crate::exchange::{MarketId, OpportunityId, Side};
#[cfg(test)]
use rust_decimal::Decimal;

/// Opportunity with a fixed edge, for tests.
#[cfg(test)]
pub fn test_opportunity(market: &str, side: Side, price: Decimal, notional: Decimal) -> Opportunity {
    use rust_decimal_macros::dec;

    let now = chrono::Utc::now();
    Opportunity {
        id: OpportunityId::new(format!("opp-{market}-{}", now.timestamp_nanos_opt().unwrap_or_default())),
        market_id: MarketId::from(market),
        question: format!("Will {market} resolve YES?"),
        direction: side,
        entry_price: price,
        fair_probability: price + side.sign() * dec!(0.10),
        edge: dec!(0.10),
        suggested_notional: notional,
        confidence: dec!(0.7),
        strategy: "test".to_string(),
        resolution_date: Some(now + chrono::Duration::days(30)),
        quote_sequence: 1,
        generated_at: now,
    }
}
