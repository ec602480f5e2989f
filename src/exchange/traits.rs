//! Venue-agnostic traits for market data and order routing.
//!
//! Both traits are object safe so the engine can run against the live REST
//! clients, the paper venue, or test doubles.

use async_trait::async_trait;

use super::types::{ClientOrderId, MarketSnapshot, OrderRequest, VenueOrder};
use crate::error::{FeedError, VenueError};

/// Read-only source of market quotes.
///
/// Data is untrusted and possibly stale; the feed stamps receipt time and
/// enforces sequence ordering on top of whatever the source returns.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch the current state of all tracked markets.
    async fn fetch_snapshots(&self) -> Result<Vec<MarketSnapshot>, FeedError>;
}

/// Order venue operations.
///
/// Submission must be idempotent on `client_order_id`: resubmitting a request
/// the venue already accepted returns the existing order.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderVenue: Send + Sync {
    /// Submit a new limit order.
    async fn submit(&self, request: &OrderRequest) -> Result<VenueOrder, VenueError>;

    /// Cancel an open order by venue id.
    async fn cancel(&self, order_id: &str) -> Result<VenueOrder, VenueError>;

    /// Query an order by venue id.
    async fn query(&self, order_id: &str) -> Result<VenueOrder, VenueError>;

    /// Look up an order by client request id. `Ok(None)` means the venue never
    /// received it.
    async fn find_by_client_id(
        &self,
        client_order_id: &ClientOrderId,
    ) -> Result<Option<VenueOrder>, VenueError>;
}
