//! Paper trading venue and a static market source.
//!
//! Both run fully in-process so the engine can trade without network access.

use super::traits::{MarketDataSource, OrderVenue};
use super::types::*;
use crate::error::{FeedError, VenueError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Paper venue book-keeping.
#[derive(Debug, Default)]
struct PaperState {
    orders: HashMap<String, VenueOrder>,
    by_client_id: HashMap<ClientOrderId, String>,
    requests: HashMap<String, OrderRequest>,
}

/// In-process venue that fills orders at their limit price.
///
/// With `auto_fill` off, orders rest as `OPEN` until [`PaperVenue::fill`]
/// is called, which lets partial fills and cancel races be exercised.
pub struct PaperVenue {
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
    fill_id_counter: AtomicU64,
    auto_fill: bool,
}

impl PaperVenue {
    /// Create a venue that fills every order immediately.
    pub fn new() -> Self {
        Self::with_auto_fill(true)
    }

    pub fn with_auto_fill(auto_fill: bool) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState::default())),
            order_id_counter: AtomicU64::new(1),
            fill_id_counter: AtomicU64::new(1),
            auto_fill,
        }
    }

    fn next_fill_id(&self) -> FillId {
        FillId::new(format!(
            "paper-fill-{}",
            self.fill_id_counter.fetch_add(1, Ordering::SeqCst)
        ))
    }

    /// Fill `size` of a resting order at its limit price.
    pub async fn fill(&self, order_id: &str, size: Decimal) -> Result<VenueOrder, VenueError> {
        let fill_id = self.next_fill_id();
        let mut state = self.state.write().await;
        let price = state
            .requests
            .get(order_id)
            .map(|r| r.price)
            .ok_or_else(|| VenueError::NotFound(order_id.to_string()))?;
        let total = state
            .requests
            .get(order_id)
            .map(|r| r.size)
            .unwrap_or(Decimal::ZERO);

        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| VenueError::NotFound(order_id.to_string()))?;
        if matches!(
            order.status,
            VenueOrderStatus::Filled | VenueOrderStatus::Cancelled | VenueOrderStatus::Rejected
        ) {
            return Err(VenueError::Rejected(format!("order {order_id} is closed")));
        }

        let already: Decimal = order.fills.iter().map(|f| f.size).sum();
        let size = size.min(total - already);
        order.fills.push(VenueFill {
            fill_id,
            price,
            size,
            timestamp: Utc::now(),
        });
        order.status = if already + size >= total {
            VenueOrderStatus::Filled
        } else {
            VenueOrderStatus::PartiallyFilled
        };

        debug!(order_id, %size, %price, "Paper fill");
        Ok(order.clone())
    }

    /// Number of distinct orders the venue has accepted.
    pub async fn order_count(&self) -> usize {
        self.state.read().await.orders.len()
    }
}

impl Default for PaperVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OrderVenue for PaperVenue {
    async fn submit(&self, request: &OrderRequest) -> Result<VenueOrder, VenueError> {
        if request.price <= Decimal::ZERO || request.price >= Decimal::ONE {
            return Err(VenueError::Rejected(format!(
                "price {} outside (0, 1)",
                request.price
            )));
        }
        if request.size <= Decimal::ZERO {
            return Err(VenueError::Rejected("size must be positive".to_string()));
        }

        {
            let state = self.state.read().await;
            if let Some(existing) = state
                .by_client_id
                .get(&request.client_order_id)
                .and_then(|id| state.orders.get(id))
            {
                return Ok(existing.clone());
            }
        }

        let order_id = format!(
            "paper-{}",
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        );
        let mut order = VenueOrder {
            order_id: order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            status: VenueOrderStatus::Open,
            fills: Vec::new(),
            reject_reason: None,
        };

        if self.auto_fill {
            order.fills.push(VenueFill {
                fill_id: self.next_fill_id(),
                price: request.price,
                size: request.size,
                timestamp: Utc::now(),
            });
            order.status = VenueOrderStatus::Filled;
        }

        let mut state = self.state.write().await;
        state
            .by_client_id
            .insert(request.client_order_id.clone(), order_id.clone());
        state.requests.insert(order_id.clone(), request.clone());
        state.orders.insert(order_id.clone(), order.clone());

        info!(
            %order_id,
            market = %request.market_id,
            side = %request.side,
            price = %request.price,
            size = %request.size,
            "[PAPER] Order accepted"
        );
        Ok(order)
    }

    async fn cancel(&self, order_id: &str) -> Result<VenueOrder, VenueError> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| VenueError::NotFound(order_id.to_string()))?;

        match order.status {
            VenueOrderStatus::Filled => Err(VenueError::AlreadyFilled(order_id.to_string())),
            VenueOrderStatus::Open | VenueOrderStatus::PartiallyFilled => {
                order.status = VenueOrderStatus::Cancelled;
                Ok(order.clone())
            }
            VenueOrderStatus::Cancelled | VenueOrderStatus::Rejected => Ok(order.clone()),
        }
    }

    async fn query(&self, order_id: &str) -> Result<VenueOrder, VenueError> {
        self.state
            .read()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| VenueError::NotFound(order_id.to_string()))
    }

    async fn find_by_client_id(
        &self,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<VenueOrder>, VenueError> {
        let state = self.state.read().await;
        Ok(state
            .by_client_id
            .get(client_order_id)
            .and_then(|id| state.orders.get(id))
            .cloned())
    }
}

/// Market source serving a fixed set of markets.
///
/// Every fetch bumps the sequence so repeated polls produce fresh quotes.
pub struct StaticMarketSource {
    snapshots: Arc<RwLock<Vec<MarketSnapshot>>>,
    sequence: AtomicU64,
}

impl StaticMarketSource {
    pub fn new(snapshots: Vec<MarketSnapshot>) -> Self {
        Self {
            snapshots: Arc::new(RwLock::new(snapshots)),
            sequence: AtomicU64::new(1),
        }
    }

    /// Source preloaded with the demo markets.
    pub fn sample() -> Self {
        Self::new(sample_markets())
    }

    /// Replace the served markets.
    pub async fn set_snapshots(&self, snapshots: Vec<MarketSnapshot>) {
        *self.snapshots.write().await = snapshots;
    }
}

#[async_trait]
impl MarketDataSource for StaticMarketSource {
    async fn fetch_snapshots(&self) -> Result<Vec<MarketSnapshot>, FeedError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .cloned()
            .map(|mut snap| {
                snap.sequence = sequence;
                snap.remote_timestamp = Some(now);
                snap
            })
            .collect())
    }
}

fn utc_date(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).single()
}

fn sample(
    id: &str,
    question: &str,
    probability: Decimal,
    volume: Decimal,
    resolution_date: Option<DateTime<Utc>>,
    categories: &[&str],
) -> MarketSnapshot {
    MarketSnapshot {
        market: Market {
            id: MarketId::from(id),
            question: question.to_string(),
            resolution_date,
            probability,
            volume_24h: volume,
            categories: categories.iter().map(|c| c.to_string()).collect(),
        },
        bid: probability - dec!(0.01),
        ask: probability + dec!(0.01),
        sequence: 0,
        remote_timestamp: None,
    }
}

/// Demo markets used by the `static` feed source.
pub fn sample_markets() -> Vec<MarketSnapshot> {
    vec![
        sample(
            "mkt_001",
            "Who will win the 2028 US Presidential Election?",
            dec!(0.52),
            dec!(125000000),
            utc_date(2028, 11, 7),
            &["Politics", "Elections"],
        ),
        sample(
            "mkt_002",
            "Will Bitcoin exceed $150,000 by end of 2027?",
            dec!(0.35),
            dec!(2500000),
            utc_date(2027, 12, 31),
            &["Crypto", "Bitcoin"],
        ),
        sample(
            "mkt_003",
            "How many Fed rate cuts in 2027?",
            dec!(0.45),
            dec!(850000),
            utc_date(2027, 12, 31),
            &["Economy", "Fed"],
        ),
    ]
}
