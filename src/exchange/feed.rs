//! Polling market data feed.
//!
//! Wraps a [`MarketDataSource`] with retry/backoff, degraded-mode tracking,
//! receipt-time stamping and per-market sequence ordering. The last good
//! board is kept on disk so a restart during an outage still has prices to
//! mark positions with.

use super::traits::MarketDataSource;
use super::types::*;
use crate::alert::{Alert, AlertDispatcher, AlertKind, AlertSeverity};
use crate::config::FeedConfig;
use crate::error::TradingError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Latest market metadata and quote for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardEntry {
    pub market: Market,
    pub quote: Quote,
}

/// Latest accepted quote per market.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuoteBoard {
    entries: BTreeMap<MarketId, BoardEntry>,
}

impl QuoteBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, market: Market, quote: Quote) {
        self.entries
            .insert(quote.market_id.clone(), BoardEntry { market, quote });
    }

    pub fn get(&self, market_id: &MarketId) -> Option<&BoardEntry> {
        self.entries.get(market_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BoardEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mid price per market, used to mark open positions.
    pub fn marks(&self) -> BTreeMap<MarketId, Decimal> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.quote.mid()))
            .collect()
    }
}

/// Board as written to the cache file.
#[derive(Debug, Serialize, Deserialize)]
struct CachedBoard {
    saved_at: DateTime<Utc>,
    entries: Vec<BoardEntry>,
}

/// Board restored from a previous run, never scanned for trades.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackBoard {
    pub saved_at: DateTime<Utc>,
    pub board: QuoteBoard,
}

#[derive(Debug, Default)]
struct FeedState {
    last_sequence: HashMap<MarketId, u64>,
    board: QuoteBoard,
    fallback: Option<FallbackBoard>,
    degraded: bool,
}

/// Load a cached board written less than `max_age` before `now`.
pub fn load_cached_board(
    path: impl AsRef<Path>,
    max_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Option<FallbackBoard> {
    let path = path.as_ref();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read market cache");
            return None;
        }
    };
    let cached: CachedBoard = match serde_json::from_str(&raw) {
        Ok(cached) => cached,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable market cache");
            return None;
        }
    };

    let age = now - cached.saved_at;
    if age >= max_age {
        debug!(path = %path.display(), age_secs = age.num_seconds(), "Market cache too old");
        return None;
    }

    let mut board = QuoteBoard::new();
    for entry in cached.entries {
        board.insert(entry.market, entry.quote);
    }
    Some(FallbackBoard {
        saved_at: cached.saved_at,
        board,
    })
}

/// Write the board to `path`, replacing any previous cache.
pub fn save_cached_board(
    path: impl AsRef<Path>,
    board: &QuoteBoard,
    saved_at: DateTime<Utc>,
) -> std::io::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let cached = CachedBoard {
        saved_at,
        entries: board.iter().cloned().collect(),
    };
    let json = serde_json::to_string_pretty(&cached)?;
    // Readers never see a half-written file.
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

/// Polling feed producing normalized quotes.
pub struct MarketDataFeed {
    source: Arc<dyn MarketDataSource>,
    config: FeedConfig,
    alerts: AlertDispatcher,
    state: Mutex<FeedState>,
}

impl MarketDataFeed {
    pub fn new(source: Arc<dyn MarketDataSource>, config: FeedConfig, alerts: AlertDispatcher) -> Self {
        let fallback = config
            .cache_path
            .as_ref()
            .and_then(|path| load_cached_board(path, config.cache_max_age(), Utc::now()));
        if let Some(fallback) = &fallback {
            info!(
                markets = fallback.board.len(),
                saved_at = %fallback.saved_at,
                "Loaded cached market board"
            );
        }
        Self {
            source,
            config,
            alerts,
            state: Mutex::new(FeedState {
                fallback,
                ..FeedState::default()
            }),
        }
    }

    /// Poll the source once (with retries) and return newly accepted quotes.
    ///
    /// Failures never propagate: once retries are exhausted the feed enters
    /// degraded mode and an empty batch is returned.
    pub async fn poll(&self) -> Vec<Quote> {
        match self.fetch_with_retry().await {
            Ok(snapshots) => {
                self.mark_recovered();
                let now = Utc::now();
                let accepted = self.ingest(snapshots, now);
                if !accepted.is_empty() {
                    self.save_cache(now);
                }
                accepted
            }
            Err(e) => {
                self.mark_degraded(&e);
                Vec::new()
            }
        }
    }

    /// Fetch snapshots, retrying transient failures with capped exponential backoff.
    pub async fn fetch_with_retry(&self) -> Result<Vec<MarketSnapshot>, TradingError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.source.fetch_snapshots().await {
                Ok(snapshots) => return Ok(snapshots),
                Err(e) if e.is_transient() && attempt <= self.config.max_retries => {
                    let delay = self.backoff(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Market data fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(TradingError::TransientFeed {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        }
    }

    /// Delay before retry number `attempt` (1-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let ms = self
            .config
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Normalize snapshots into quotes, dropping malformed and out-of-order ones.
    pub fn ingest(&self, mut snapshots: Vec<MarketSnapshot>, received_at: DateTime<Utc>) -> Vec<Quote> {
        snapshots.sort_by(|a, b| {
            a.market
                .id
                .cmp(&b.market.id)
                .then(a.sequence.cmp(&b.sequence))
        });

        let mut state = self.state.lock();
        let mut accepted = Vec::with_capacity(snapshots.len());

        for snap in snapshots {
            let quote = Quote {
                market_id: snap.market.id.clone(),
                bid: snap.bid,
                ask: snap.ask,
                sequence: snap.sequence,
                remote_timestamp: snap.remote_timestamp,
                received_at,
            };

            if !quote.is_well_formed() {
                debug!(market = %quote.market_id, bid = %quote.bid, ask = %quote.ask, "Discarding malformed quote");
                continue;
            }

            if let Some(&last) = state.last_sequence.get(&quote.market_id) {
                if quote.sequence <= last {
                    debug!(market = %quote.market_id, sequence = quote.sequence, last, "Discarding stale quote");
                    continue;
                }
            }

            state
                .last_sequence
                .insert(quote.market_id.clone(), quote.sequence);
            let mut market = snap.market;
            market.probability = quote.mid();
            state.board.insert(market, quote.clone());
            accepted.push(quote);
        }

        if !state.board.is_empty() {
            state.fallback = None;
        }
        accepted
    }

    fn save_cache(&self, saved_at: DateTime<Utc>) {
        let Some(path) = &self.config.cache_path else {
            return;
        };
        let board = self.board();
        match save_cached_board(path, &board, saved_at) {
            Ok(()) => debug!(path = %path, markets = board.len(), "Market cache written"),
            Err(e) => warn!(path = %path, error = %e, "Failed to write market cache"),
        }
    }

    fn mark_degraded(&self, error: &TradingError) {
        let newly = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.degraded, true)
        };

        if newly {
            let attempts = match error {
                TradingError::TransientFeed { attempts, .. } => *attempts,
                _ => 0,
            };
            warn!(attempts, error = %error, "Market data feed degraded");
            self.alerts.notify(Alert::new(
                AlertKind::FeedDegraded {
                    attempts,
                    error: error.to_string(),
                },
                AlertSeverity::Warning,
                format!("Market data unavailable after {attempts} attempts"),
            ));
        } else {
            debug!(error = %error, "Market data feed still degraded");
        }
    }

    fn mark_recovered(&self) {
        let was_degraded = std::mem::replace(&mut self.state.lock().degraded, false);
        if was_degraded {
            info!("Market data feed recovered");
            self.alerts.notify(Alert::new(
                AlertKind::FeedRecovered,
                AlertSeverity::Info,
                "Market data feed recovered",
            ));
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    /// Delay until the next poll: the configured interval, stretched while degraded.
    pub fn next_delay(&self) -> Duration {
        let base = self.config.poll_interval();
        if self.is_degraded() {
            base * self.config.degraded_multiplier
        } else {
            base
        }
    }

    /// Copy of the current board.
    pub fn board(&self) -> QuoteBoard {
        self.state.lock().board.clone()
    }

    /// Board restored from the cache, available until the first live quote lands.
    pub fn fallback_board(&self) -> Option<FallbackBoard> {
        self.state.lock().fallback.clone()
    }
}
