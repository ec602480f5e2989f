//! Configuration management for the prediction trader.
//!
//! Loads settings from an optional `config.toml` and `PMT__*` environment
//! variables, e.g. `PMT__RISK__DAILY_LOSS_LIMIT=75`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Market data polling
    #[serde(default)]
    pub feed: FeedConfig,
    /// Risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Manual approval gate
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Opportunity detection
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Order execution
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Order venue credentials and endpoint
    #[serde(default)]
    pub venue: VenueConfig,
    /// Audit persistence
    #[serde(default)]
    pub audit: AuditConfig,
    /// Notification channel
    #[serde(default)]
    pub alerts: AlertConfig,
}

/// Where quotes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    /// Polymarket Gamma markets API
    Gamma,
    /// Built-in sample markets, no network access
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_source")]
    pub source: FeedSource,
    /// Base URL of the market data API
    #[serde(default = "default_feed_base_url")]
    pub base_url: String,
    /// Maximum number of markets fetched per poll
    #[serde(default = "default_market_limit")]
    pub market_limit: u32,
    /// Seconds between polls while healthy
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Retries per poll before the feed is declared degraded
    #[serde(default = "default_feed_max_retries")]
    pub max_retries: u32,
    /// First retry delay, doubled per attempt
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single retry delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Poll interval multiplier while degraded
    #[serde(default = "default_degraded_multiplier")]
    pub degraded_multiplier: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// File holding the last good board between runs, disabled when unset
    #[serde(default = "default_feed_cache_path")]
    pub cache_path: Option<String>,
    /// Cached boards older than this are ignored at startup
    #[serde(default = "default_feed_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum notional per market as a fraction of available capital (0.0-1.0)
    #[serde(default = "default_single_trade_cap_pct")]
    pub single_trade_cap_pct: Decimal,
    /// Maximum realized + unrealized + reserved loss per UTC day
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,
    /// Notional above which a trade needs manual approval
    #[serde(default = "default_manual_approval_threshold")]
    pub manual_approval_threshold: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Seconds a request stays pending before it expires
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
    /// Seconds between expiry sweeps
    #[serde(default = "default_approval_sweep_secs")]
    pub sweep_interval_secs: u64,
}

/// Signal strategy used by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Compare configured model probabilities against market prices
    Model,
    /// Follow strong market conviction on liquid markets
    Conviction,
}

/// Externally estimated probability for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProbability {
    pub market_id: String,
    pub probability: Decimal,
    #[serde(default = "default_model_confidence")]
    pub confidence: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "default_strategy")]
    pub strategy: StrategyKind,
    /// Minimum |fair - entry| edge to emit an opportunity
    #[serde(default = "default_min_edge")]
    pub min_edge: Decimal,
    /// Notional at full confidence
    #[serde(default = "default_base_notional")]
    pub base_notional: Decimal,
    /// Hard ceiling on suggested notional
    #[serde(default = "default_max_notional")]
    pub max_notional: Decimal,
    /// Minimum 24h volume for a market to be considered
    #[serde(default = "default_min_volume")]
    pub min_volume: Decimal,
    /// Quotes older than this are ignored
    #[serde(default = "default_max_quote_age_secs")]
    pub max_quote_age_secs: u64,
    /// Model probabilities for the `model` strategy
    #[serde(default)]
    pub models: Vec<ModelProbability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Equity the ledger starts with on an empty audit log
    #[serde(default = "default_starting_capital")]
    pub starting_capital: Decimal,
    /// Route orders to the in-process paper venue
    #[serde(default = "default_paper_trading")]
    pub paper_trading: bool,
    /// Submission attempts when the venue confirms it never saw the order
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
    /// Base delay between submission attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Seconds between open-order status syncs
    #[serde(default = "default_order_sync_interval_secs")]
    pub order_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_venue_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub passphrase: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// SQLite database holding the audit log
    #[serde(default = "default_audit_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Optional webhook receiving alerts as JSON
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Alerts buffered before new ones are dropped
    #[serde(default = "default_alert_channel_capacity")]
    pub channel_capacity: usize,
}

// Default value functions
fn default_feed_source() -> FeedSource {
    FeedSource::Gamma
}

fn default_feed_base_url() -> String {
    "https://gamma-api.polymarket.com".to_string()
}

fn default_market_limit() -> u32 {
    100
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_feed_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8_000
}

fn default_degraded_multiplier() -> u32 {
    4 // Poll every 2 minutes while degraded at the default interval
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_single_trade_cap_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_daily_loss_limit() -> Decimal {
    Decimal::new(50, 0)
}

fn default_manual_approval_threshold() -> Decimal {
    Decimal::new(100, 0)
}

fn default_approval_timeout_secs() -> u64 {
    15 * 60
}

fn default_approval_sweep_secs() -> u64 {
    5
}

fn default_strategy() -> StrategyKind {
    StrategyKind::Model
}

fn default_model_confidence() -> Decimal {
    Decimal::new(6, 1) // 0.6
}

fn default_min_edge() -> Decimal {
    Decimal::new(5, 2) // 5 percentage points
}

fn default_base_notional() -> Decimal {
    Decimal::new(40, 0)
}

fn default_max_notional() -> Decimal {
    Decimal::new(250, 0)
}

fn default_min_volume() -> Decimal {
    Decimal::new(100_000, 0) // $100K
}

fn default_max_quote_age_secs() -> u64 {
    300
}

fn default_starting_capital() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_paper_trading() -> bool {
    true
}

fn default_max_submit_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_order_sync_interval_secs() -> u64 {
    10
}

fn default_venue_base_url() -> String {
    "https://clob.polymarket.com".to_string()
}

fn default_feed_cache_path() -> Option<String> {
    Some("data/markets_cache.json".to_string())
}

fn default_feed_cache_max_age_secs() -> u64 {
    3600
}

fn default_audit_db_path() -> String {
    "data/audit.db".to_string()
}

fn default_alert_channel_capacity() -> usize {
    256
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("PMT"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.risk.single_trade_cap_pct > Decimal::ZERO
                && self.risk.single_trade_cap_pct <= Decimal::ONE,
            "single_trade_cap_pct must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.daily_loss_limit > Decimal::ZERO,
            "daily_loss_limit must be positive"
        );

        anyhow::ensure!(
            self.risk.manual_approval_threshold > Decimal::ZERO,
            "manual_approval_threshold must be positive"
        );

        anyhow::ensure!(
            self.approval.timeout_secs > 0,
            "approval timeout must be at least one second"
        );

        anyhow::ensure!(
            self.feed.poll_interval_secs > 0 && self.feed.degraded_multiplier >= 1,
            "poll_interval_secs must be positive and degraded_multiplier >= 1"
        );

        anyhow::ensure!(
            self.feed.initial_backoff_ms <= self.feed.max_backoff_ms,
            "initial_backoff_ms must not exceed max_backoff_ms"
        );

        anyhow::ensure!(
            self.scanner.min_edge > Decimal::ZERO && self.scanner.min_edge < Decimal::ONE,
            "min_edge must be between 0 and 1"
        );

        anyhow::ensure!(
            self.scanner.base_notional > Decimal::ZERO
                && self.scanner.base_notional <= self.scanner.max_notional,
            "base_notional must be positive and <= max_notional"
        );

        for model in &self.scanner.models {
            anyhow::ensure!(
                model.probability > Decimal::ZERO && model.probability < Decimal::ONE,
                "model probability for {} must be strictly between 0 and 1",
                model.market_id
            );
            anyhow::ensure!(
                model.confidence > Decimal::ZERO && model.confidence <= Decimal::ONE,
                "model confidence for {} must be in (0, 1]",
                model.market_id
            );
        }

        anyhow::ensure!(
            self.execution.starting_capital > Decimal::ZERO,
            "starting_capital must be positive"
        );

        anyhow::ensure!(
            self.execution.max_submit_attempts >= 1,
            "max_submit_attempts must be at least 1"
        );

        if !self.execution.paper_trading {
            anyhow::ensure!(
                !self.venue.api_key.is_empty() && !self.venue.secret_key.is_empty(),
                "live trading requires venue api_key and secret_key"
            );
        }

        anyhow::ensure!(
            self.alerts.channel_capacity > 0,
            "alert channel_capacity must be positive"
        );

        Ok(())
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cache_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_max_age_secs as i64)
    }
}

impl ApprovalConfig {
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.timeout_secs as i64)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            source: default_feed_source(),
            base_url: default_feed_base_url(),
            market_limit: default_market_limit(),
            poll_interval_secs: default_poll_interval_secs(),
            max_retries: default_feed_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            degraded_multiplier: default_degraded_multiplier(),
            request_timeout_secs: default_request_timeout_secs(),
            cache_path: default_feed_cache_path(),
            cache_max_age_secs: default_feed_cache_max_age_secs(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            single_trade_cap_pct: default_single_trade_cap_pct(),
            daily_loss_limit: default_daily_loss_limit(),
            manual_approval_threshold: default_manual_approval_threshold(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout_secs(),
            sweep_interval_secs: default_approval_sweep_secs(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            min_edge: default_min_edge(),
            base_notional: default_base_notional(),
            max_notional: default_max_notional(),
            min_volume: default_min_volume(),
            max_quote_age_secs: default_max_quote_age_secs(),
            models: Vec::new(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            starting_capital: default_starting_capital(),
            paper_trading: default_paper_trading(),
            max_submit_attempts: default_max_submit_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            order_sync_interval_secs: default_order_sync_interval_secs(),
        }
    }
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            base_url: default_venue_base_url(),
            api_key: String::new(),
            secret_key: String::new(),
            passphrase: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: default_audit_db_path(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            channel_capacity: default_alert_channel_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_risk_posture() {
        let risk = RiskConfig::default();
        assert_eq!(risk.single_trade_cap_pct, dec!(0.05));
        assert_eq!(risk.daily_loss_limit, dec!(50));
        assert_eq!(risk.manual_approval_threshold, dec!(100));
    }

    #[test]
    fn test_cap_out_of_range_rejected() {
        let mut config = Config::default();
        config.risk.single_trade_cap_pct = dec!(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_live_trading_requires_credentials() {
        let mut config = Config::default();
        config.execution.paper_trading = false;
        assert!(config.validate().is_err());

        config.venue.api_key = "key".to_string();
        config.venue.secret_key = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_probability_bounds() {
        let mut config = Config::default();
        config.scanner.models.push(ModelProbability {
            market_id: "mkt_001".to_string(),
            probability: dec!(1),
            confidence: dec!(0.5),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml = r#"
            [risk]
            daily_loss_limit = "75"

            [approval]
            timeout_secs = 60
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.risk.daily_loss_limit, dec!(75));
        assert_eq!(config.risk.single_trade_cap_pct, dec!(0.05));
        assert_eq!(config.approval.timeout_secs, 60);
        assert_eq!(config.feed.source, FeedSource::Gamma);
    }
}
