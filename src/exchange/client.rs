//! Polymarket Gamma REST client (read-only market data).

use super::traits::MarketDataSource;
use super::types::*;
use crate::config::FeedConfig;
use crate::error::FeedError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Market listing entry as returned by `GET /markets`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    id: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    best_bid: Option<Decimal>,
    #[serde(default)]
    best_ask: Option<Decimal>,
    #[serde(default)]
    last_trade_price: Option<Decimal>,
    #[serde(default)]
    volume_num: Option<Decimal>,
    #[serde(default)]
    volume24hr: Option<Decimal>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    category: Option<String>,
}

impl GammaMarket {
    /// Convert to a snapshot. Markets without a two-sided book are skipped.
    fn into_snapshot(self, received_at: DateTime<Utc>) -> Option<MarketSnapshot> {
        let (bid, ask) = match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => (bid, ask),
            _ => {
                debug!(market = %self.id, "Skipping market without two-sided book");
                return None;
            }
        };

        let probability = self
            .last_trade_price
            .unwrap_or((bid + ask) / Decimal::TWO);
        let sequence = self
            .updated_at
            .unwrap_or(received_at)
            .timestamp_millis()
            .max(0) as u64;

        Some(MarketSnapshot {
            market: Market {
                id: MarketId::new(self.id),
                question: self.question,
                resolution_date: self.end_date,
                probability,
                volume_24h: self
                    .volume24hr
                    .or(self.volume_num)
                    .unwrap_or(Decimal::ZERO),
                categories: self.category.into_iter().collect(),
            },
            bid,
            ask,
            sequence,
            remote_timestamp: self.updated_at,
        })
    }
}

/// Gamma API client for active market listings.
pub struct GammaClient {
    http: Client,
    base_url: String,
    market_limit: u32,
}

impl GammaClient {
    /// Create a new Gamma client from feed configuration.
    pub fn new(config: &FeedConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            market_limit: config.market_limit,
        })
    }
}

#[async_trait]
impl MarketDataSource for GammaClient {
    #[instrument(skip(self))]
    async fn fetch_snapshots(&self) -> Result<Vec<MarketSnapshot>, FeedError> {
        let url = format!(
            "{}/markets?active=true&closed=false&limit={}",
            self.base_url, self.market_limit
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FeedError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let markets: Vec<GammaMarket> =
            serde_json::from_str(&body).map_err(|e| FeedError::Decode(e.to_string()))?;

        let received_at = Utc::now();
        let snapshots: Vec<MarketSnapshot> = markets
            .into_iter()
            .filter_map(|m| m.into_snapshot(received_at))
            .collect();

        debug!(count = snapshots.len(), "Fetched market snapshots");
        Ok(snapshots)
    }
}
