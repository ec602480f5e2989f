//! Type definitions shared by the market data feed and the order venue.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Venue identifier of a prediction market.
    MarketId
);
string_id!(
    /// Internal order identifier.
    OrderId
);
string_id!(
    /// Client-generated request id used for idempotent submission.
    ClientOrderId
);
string_id!(
    /// Venue-assigned fill identifier, used to deduplicate fill delivery.
    FillId
);
string_id!(
    /// Identifier of a manual approval request.
    ApprovalId
);
string_id!(OpportunityId);

impl OrderId {
    /// Generate a fresh order id.
    pub fn generate() -> Self {
        Self(format!("ord-{}", short_uuid()))
    }
}

impl ClientOrderId {
    /// Generate a fresh client request id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl ApprovalId {
    /// Generate a fresh approval id short enough to type at the console.
    pub fn generate() -> Self {
        Self(format!("apr-{}", short_uuid()))
    }
}

fn short_uuid() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

/// Side of a trade on the YES outcome of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A binary prediction market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: MarketId,
    pub question: String,
    pub resolution_date: Option<DateTime<Utc>>,
    /// Implied probability of the YES outcome (0-1), refreshed by the feed.
    pub probability: Decimal,
    /// 24-hour traded volume in quote currency
    pub volume_24h: Decimal,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Market {
    /// Whether the market has reached its resolution date.
    pub fn is_resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.resolution_date.is_some_and(|date| date <= now)
    }
}

/// Raw market state as returned by a data source, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub market: Market,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Source-provided sequence number, monotonic per market
    pub sequence: u64,
    /// Timestamp claimed by the remote source (untrusted)
    pub remote_timestamp: Option<DateTime<Utc>>,
}

/// Normalized quote for a single market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub market_id: MarketId,
    pub bid: Decimal,
    pub ask: Decimal,
    pub sequence: u64,
    pub remote_timestamp: Option<DateTime<Utc>>,
    /// Local receipt time stamped by the feed
    pub received_at: DateTime<Utc>,
}

impl Quote {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }

    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    /// Price paid to enter on the given side.
    pub fn entry_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Bid and ask are valid probabilities and not crossed.
    pub fn is_well_formed(&self) -> bool {
        self.bid >= Decimal::ZERO
            && self.ask <= Decimal::ONE
            && self.bid <= self.ask
            && self.ask > Decimal::ZERO
    }
}

/// Order submission sent to the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub client_order_id: ClientOrderId,
    pub market_id: MarketId,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
}

/// Order status as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueOrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// A fill reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueFill {
    pub fill_id: FillId,
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Venue view of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VenueOrder {
    pub order_id: String,
    pub client_order_id: ClientOrderId,
    pub status: VenueOrderStatus,
    #[serde(default)]
    pub fills: Vec<VenueFill>,
    #[serde(default)]
    pub reject_reason: Option<String>,
}
