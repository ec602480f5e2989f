//! Best-effort trade alerts.
//!
//! Producers call [`AlertDispatcher::notify`], which never blocks: alerts are
//! queued on a bounded channel and delivered by a background task to every
//! registered [`Notifier`]. A full queue drops the alert with a warning.

use crate::exchange::MarketId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    FeedDegraded { attempts: u32, error: String },
    FeedRecovered,
    RiskRejected { opportunity_id: String, reason: String },
    ApprovalRequested { approval_id: String },
    ApprovalExpired { approval_id: String },
    OrderRejected { order_id: String, reason: String },
    SubmissionAmbiguous { order_id: String, reason: String },
    OrderFilled { order_id: String },
    TradingPaused,
    TradingResumed,
    TradingHalted { reason: String },
    DailySummary { day: chrono::NaiveDate },
}

/// A trade alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub market_id: Option<MarketId>,
    pub message: String,
    pub metrics: BTreeMap<String, Decimal>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        let alert_id = format!(
            "alert-{}-{}",
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos()
        );

        Self {
            alert_id,
            timestamp,
            kind,
            severity,
            market_id: None,
            message: message.into(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn for_market(mut self, market_id: &MarketId) -> Self {
        self.market_id = Some(market_id.clone());
        self
    }

    /// Add a metric to the alert.
    pub fn with_metric(mut self, key: &str, value: Decimal) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Emit as a structured log line.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "trade_alert", "TRADE_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "trade_alert", "TRADE_ALERT: {}", json),
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(target: "trade_alert", "TRADE_ALERT: {}", json)
            }
        }
    }
}

/// Delivery channel for alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Writes alerts to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        alert.emit();
        Ok(())
    }
}

/// Posts alerts as JSON to an HTTP endpoint.
pub struct WebhookNotifier {
    http: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, alert: &Alert) -> anyhow::Result<()> {
        self.http
            .post(&self.url)
            .json(alert)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Non-blocking alert producer handle.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Alert>,
}

impl AlertDispatcher {
    /// Start the delivery task. It exits once every dispatcher handle is dropped.
    pub fn spawn(notifiers: Vec<Arc<dyn Notifier>>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (dispatcher, mut rx) = Self::channel(capacity);

        let handle = tokio::spawn(async move {
            while let Some(alert) = rx.recv().await {
                for notifier in &notifiers {
                    if let Err(e) = notifier.deliver(&alert).await {
                        warn!(
                            notifier = notifier.name(),
                            alert_id = %alert.alert_id,
                            error = %e,
                            "Alert delivery failed"
                        );
                    }
                }
            }
            debug!("Alert dispatcher stopped");
        });

        (dispatcher, handle)
    }

    /// Dispatcher plus the raw receiving end, without a delivery task.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue an alert. Never blocks and never fails the caller.
    pub fn notify(&self, alert: Alert) {
        match self.tx.try_send(alert) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                warn!(alert_id = %alert.alert_id, kind = ?alert.kind, "Alert queue full, dropping alert");
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                debug!(alert_id = %alert.alert_id, "Alert dispatcher closed, dropping alert");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Notifier for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn deliver(&self, _alert: &Alert) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn deliver(&self, _alert: &Alert) -> anyhow::Result<()> {
            anyhow::bail!("unreachable endpoint")
        }
    }

    #[test]
    fn test_alert_serializes_with_type_tag() {
        let alert = Alert::new(
            AlertKind::OrderRejected {
                order_id: "ord-1".to_string(),
                reason: "market closed".to_string(),
            },
            AlertSeverity::Warning,
            "Order rejected",
        )
        .for_market(&MarketId::from("mkt_001"))
        .with_metric("notional", dec!(40));

        let value = serde_json::to_value(&alert).unwrap();
        assert_eq!(value["kind"]["type"], "order_rejected");
        assert_eq!(value["market_id"], "mkt_001");
        assert_eq!(value["metrics"]["notional"], "40");
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (dispatcher, mut rx) = AlertDispatcher::channel(1);
        dispatcher.notify(Alert::new(AlertKind::FeedRecovered, AlertSeverity::Info, "one"));
        dispatcher.notify(Alert::new(AlertKind::FeedRecovered, AlertSeverity::Info, "two"));

        assert_eq!(rx.try_recv().unwrap().message, "one");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_is_ignored() {
        let (dispatcher, rx) = AlertDispatcher::channel(4);
        drop(rx);
        dispatcher.notify(Alert::new(AlertKind::TradingPaused, AlertSeverity::Info, "paused"));
    }

    #[tokio::test]
    async fn test_delivery_continues_past_failing_notifier() {
        let count = Arc::new(AtomicUsize::new(0));
        let notifiers: Vec<Arc<dyn Notifier>> =
            vec![Arc::new(Failing), Arc::new(Counting(count.clone()))];
        let (dispatcher, handle) = AlertDispatcher::spawn(notifiers, 8);

        dispatcher.notify(Alert::new(AlertKind::TradingResumed, AlertSeverity::Info, "a"));
        dispatcher.notify(Alert::new(AlertKind::TradingPaused, AlertSeverity::Info, "b"));
        drop(dispatcher);
        handle.await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(serde_json::json!({"severity": "Critical"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri())).unwrap();
        let alert = Alert::new(
            AlertKind::TradingHalted {
                reason: "ledger mismatch".to_string(),
            },
            AlertSeverity::Critical,
            "Trading halted",
        );
        notifier.deliver(&alert).await.unwrap();
    }
}
