//! Trading engine: wires feed, scanner, risk, approvals and execution.
//!
//! On construction the engine replays the audit log (or opens a fresh
//! ledger) so a restart resumes with the same positions, orders, approvals
//! and pause/halt state.

mod control;
pub mod operator;
mod scheduler;

pub use control::TradingControl;
pub use scheduler::{until_next_midnight, Scheduler};

use crate::alert::{Alert, AlertDispatcher, AlertKind, AlertSeverity};
use crate::audit::{replay, AuditEvent, AuditLog};
use crate::config::Config;
use crate::error::TradingError;
use crate::exchange::{
    ApprovalId, MarketDataFeed, MarketDataSource, MarketId, OrderId, OrderVenue, Side,
};
use crate::portfolio::{PortfolioSnapshot, PositionLedger};
use crate::risk::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, ApprovalStatus, ApprovalTicket, RiskLimits,
    RiskManager, RiskVerdict,
};
use crate::strategy::{
    strategy_from_config, Admission, ExecutionSettings, Opportunity, OpportunityScanner, Order,
    OrderExecutor, Route, TradingState,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of an operator decision on an approval request.
#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    Denied,
    /// Approved; carries what happened on admission.
    Admitted(Admission),
    /// The request was already settled with this status.
    Unchanged(ApprovalStatus),
}

/// Operational view for the console and the `status` command.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub at: DateTime<Utc>,
    pub portfolio: PortfolioSnapshot,
    pub paused: bool,
    pub halted: Option<String>,
    pub feed_degraded: bool,
    /// Save time of the cached board still standing in for live quotes
    pub cached_board_at: Option<DateTime<Utc>>,
    pub pending_approvals: Vec<ApprovalRequest>,
    pub open_orders: Vec<Order>,
    pub audit_sequence: u64,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let p = &self.portfolio;
        writeln!(f, "Status at {}", self.at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        let mode = match (&self.halted, self.paused) {
            (Some(reason), _) => format!("HALTED ({reason})"),
            (None, true) => "PAUSED".to_string(),
            (None, false) => "ACTIVE".to_string(),
        };
        writeln!(f, "  Trading:      {mode}")?;
        if self.feed_degraded {
            writeln!(f, "  Feed:         DEGRADED")?;
        }
        if let Some(saved_at) = self.cached_board_at {
            writeln!(f, "  Quotes:       cached {}", saved_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        writeln!(f, "  Equity:       {:.2}", p.equity)?;
        writeln!(f, "  Cash:         {:.2}", p.cash)?;
        writeln!(f, "  Reserved:     {:.2} (worst case {:.2})", p.reserved_notional, p.reserved_loss)?;
        writeln!(f, "  Daily loss:   {:.2} ({})", p.daily_loss, p.day)?;
        writeln!(f, "  Realized:     {:.2}", p.realized_pnl)?;
        writeln!(f, "  Unrealized:   {:.2}", p.unrealized_pnl)?;
        writeln!(f, "  Audit seq:    {}", self.audit_sequence)?;

        writeln!(f, "  Positions ({}):", p.positions.len())?;
        for pos in &p.positions {
            writeln!(
                f,
                "    {:<24} qty {:>10} @ {:.4} mark {} pnl {:.2}",
                pos.market_id,
                pos.quantity,
                pos.avg_entry_price,
                pos.mark_price
                    .map(|m| format!("{m:.4}"))
                    .unwrap_or_else(|| "-".to_string()),
                pos.realized_pnl + pos.unrealized_pnl()
            )?;
        }

        writeln!(f, "  Pending approvals ({}):", self.pending_approvals.len())?;
        for req in &self.pending_approvals {
            writeln!(
                f,
                "    {} {} {} {:.2} @ {} until {}",
                req.id,
                req.opportunity.market_id,
                req.opportunity.direction,
                req.opportunity.suggested_notional,
                req.opportunity.entry_price,
                req.deadline.format("%H:%M:%S")
            )?;
        }

        writeln!(f, "  Open orders ({}):", self.open_orders.len())?;
        for order in &self.open_orders {
            writeln!(
                f,
                "    {} {} {} {}/{} @ {} {}{}",
                order.id,
                order.market_id,
                order.side,
                order.filled_quantity,
                order.quantity,
                order.limit_price,
                order.status,
                if order.ambiguous { " (ambiguous)" } else { "" }
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Intervals {
    approval_sweep: Duration,
    order_sync: Duration,
}

pub struct TradingEngine {
    feed: MarketDataFeed,
    scanner: OpportunityScanner,
    executor: OrderExecutor,
    gate: Arc<ApprovalGate>,
    audit: Arc<AuditLog>,
    alerts: AlertDispatcher,
    control: Arc<TradingControl>,
    intervals: Intervals,
    /// Direction and price last acted on per market
    handled: Mutex<HashMap<MarketId, (Side, Decimal)>>,
    /// Pending approvals restored from the log, watched once started
    restored: Mutex<Vec<ApprovalTicket>>,
}

impl TradingEngine {
    /// Build the engine, replaying `audit` or opening a fresh ledger.
    pub fn new(
        config: &Config,
        source: Arc<dyn MarketDataSource>,
        venue: Arc<dyn OrderVenue>,
        audit: Arc<AuditLog>,
        alerts: AlertDispatcher,
    ) -> Result<Self, TradingError> {
        let control = Arc::new(TradingControl::new());
        let gate = Arc::new(ApprovalGate::new(config.approval.timeout()));
        let mut restored = Vec::new();

        let state = match replay(&audit.records()?)? {
            Some(replayed) => {
                if replayed.paused {
                    control.pause();
                }
                if let Some(reason) = replayed.halted {
                    control.halt(reason);
                }
                for request in replayed.approvals {
                    if let Some(ticket) = gate.restore(request) {
                        restored.push(ticket);
                    }
                }
                info!(
                    sequence = replayed.last_sequence,
                    orders = replayed.state.orders.len(),
                    pending_approvals = restored.len(),
                    "State restored from audit log"
                );
                replayed.state
            }
            None => {
                let now = Utc::now();
                let starting_cash = config.execution.starting_capital;
                audit.append(&AuditEvent::LedgerOpened {
                    starting_cash,
                    at: now,
                })?;
                info!(%starting_cash, "Opened new ledger");
                TradingState::new(PositionLedger::new(starting_cash, now))
            }
        };

        let executor = OrderExecutor::new(
            venue,
            Arc::new(tokio::sync::Mutex::new(state)),
            audit.clone(),
            alerts.clone(),
            RiskManager::new(RiskLimits::from(&config.risk)),
            control.clone(),
            ExecutionSettings::from(&config.execution),
        );

        Ok(Self {
            feed: MarketDataFeed::new(source, config.feed.clone(), alerts.clone()),
            scanner: OpportunityScanner::new(
                config.scanner.clone(),
                strategy_from_config(&config.scanner),
            ),
            executor,
            gate,
            audit,
            alerts,
            control,
            intervals: Intervals {
                approval_sweep: Duration::from_secs(config.approval.sweep_interval_secs.max(1)),
                order_sync: Duration::from_secs(config.execution.order_sync_interval_secs.max(1)),
            },
            handled: Mutex::new(HashMap::new()),
            restored: Mutex::new(restored),
        })
    }

    pub fn executor(&self) -> &OrderExecutor {
        &self.executor
    }

    pub fn control(&self) -> &TradingControl {
        &self.control
    }

    /// Halt on fatal errors, pass everything through.
    fn escalate<T>(&self, result: Result<T, TradingError>) -> Result<T, TradingError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.executor.halt(e.to_string());
            }
        }
        result
    }

    /// One feed cycle: poll, refresh marks, scan and act on what was found.
    pub async fn poll_and_scan(&self) -> Result<Vec<Admission>, TradingError> {
        let quotes = self.feed.poll().await;
        let board = self.feed.board();
        if board.is_empty() {
            if let Some(fallback) = self.feed.fallback_board() {
                debug!(saved_at = %fallback.saved_at, "No live quotes, marking from cached board");
                self.executor.update_marks(&fallback.board.marks(), Utc::now()).await?;
            }
            return Ok(Vec::new());
        }
        let now = Utc::now();
        self.executor.update_marks(&board.marks(), now).await?;

        if !self.control.admissions_open() {
            debug!(quotes = quotes.len(), "Admissions closed, skipping scan");
            return Ok(Vec::new());
        }

        let snapshot = self.executor.snapshot(now).await;
        let awaiting: Vec<MarketId> = self
            .gate
            .pending(now)
            .into_iter()
            .map(|r| r.opportunity.market_id)
            .collect();
        let opportunities = self.scanner.scan(&board, &snapshot, now);
        info!(
            quotes = quotes.len(),
            opportunities = opportunities.len(),
            strategy = self.scanner.strategy_name(),
            "Scan complete"
        );

        self.act_on(opportunities, &awaiting).await
    }

    /// Admit scanned opportunities in rank order. An opportunity counts as
    /// handled only once admission produced a decision.
    async fn act_on(
        &self,
        opportunities: Vec<Opportunity>,
        awaiting: &[MarketId],
    ) -> Result<Vec<Admission>, TradingError> {
        let mut admissions = Vec::new();
        for opportunity in opportunities {
            if awaiting.contains(&opportunity.market_id) || self.already_handled(&opportunity) {
                continue;
            }
            match self.handle_opportunity(&opportunity).await {
                Ok(admission) => {
                    self.mark_handled(&opportunity);
                    admissions.push(admission);
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(TradingError::Halted(reason)) => {
                    debug!(%reason, "Admissions closed mid-scan");
                    break;
                }
                Err(e) => warn!(opportunity = %opportunity.id, error = %e, "Opportunity not executed"),
            }
        }
        Ok(admissions)
    }

    /// An unchanged quote is not traded twice.
    fn already_handled(&self, opportunity: &Opportunity) -> bool {
        self.handled.lock().get(&opportunity.market_id)
            == Some(&(opportunity.direction, opportunity.entry_price))
    }

    fn mark_handled(&self, opportunity: &Opportunity) {
        self.handled.lock().insert(
            opportunity.market_id.clone(),
            (opportunity.direction, opportunity.entry_price),
        );
    }

    /// Evaluate one opportunity; large trades go to the approval gate.
    pub async fn handle_opportunity(&self, opportunity: &Opportunity) -> Result<Admission, TradingError> {
        let admission = self.executor.admit(opportunity, Route::Scanned).await?;
        match &admission {
            Admission::ApprovalRequired(verdict) => {
                self.request_approval(opportunity.clone(), verdict.clone())?;
            }
            Admission::Executed(order) => {
                info!(order_id = %order.id, status = %order.status, "Opportunity executed");
            }
            Admission::Rejected(_) => {}
        }
        Ok(admission)
    }

    /// Open an approval request and start waiting for its resolution.
    pub fn request_approval(
        &self,
        opportunity: Opportunity,
        verdict: RiskVerdict,
    ) -> Result<ApprovalRequest, TradingError> {
        let request = self.gate.prepare(opportunity, verdict, Utc::now());
        let appended = self.audit.append(&AuditEvent::ApprovalRequested {
            request: request.clone(),
        });
        self.escalate(appended)?;

        let ticket = self.gate.open(request.clone());
        self.alerts.notify(
            Alert::new(
                AlertKind::ApprovalRequested {
                    approval_id: request.id.to_string(),
                },
                AlertSeverity::Warning,
                format!(
                    "Approval needed for {} {} {:.2} @ {} (approve {} / deny {})",
                    request.opportunity.market_id,
                    request.opportunity.direction,
                    request.opportunity.suggested_notional,
                    request.opportunity.entry_price,
                    request.id,
                    request.id
                ),
            )
            .for_market(&request.opportunity.market_id)
            .with_metric("notional", request.opportunity.suggested_notional)
            .with_metric("edge", request.opportunity.edge),
        );
        self.watch_approval(ticket);
        Ok(request)
    }

    /// Suspend on a ticket; a deadline reached first is recorded as expiry.
    fn watch_approval(&self, ticket: ApprovalTicket) {
        let gate = self.gate.clone();
        let audit = self.audit.clone();
        let alerts = self.alerts.clone();
        tokio::spawn(async move {
            match gate.wait(ticket).await {
                Ok(resolution) if resolution.changed => {
                    if let Err(e) = record_resolution(&audit, &alerts, &resolution.request) {
                        error!(error = %e, "Failed to record approval expiry");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Approval wait failed"),
            }
        });
    }

    /// Apply an operator decision. Approved trades are re-validated and submitted.
    pub async fn resolve_approval(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
        note: Option<String>,
    ) -> Result<ApprovalOutcome, TradingError> {
        let resolution = self.gate.resolve(id, decision, note, Utc::now())?;
        let request = resolution.request;
        if resolution.changed {
            let recorded = record_resolution(&self.audit, &self.alerts, &request);
            self.escalate(recorded)?;
        }

        match request.status {
            ApprovalStatus::Expired if resolution.changed => {
                Err(TradingError::ApprovalExpired(request.id))
            }
            ApprovalStatus::Approved if resolution.changed => {
                let admission = self
                    .executor
                    .admit(&request.opportunity, Route::Approved(&request))
                    .await?;
                Ok(ApprovalOutcome::Admitted(admission))
            }
            ApprovalStatus::Denied if resolution.changed => Ok(ApprovalOutcome::Denied),
            status => Ok(ApprovalOutcome::Unchanged(status)),
        }
    }

    /// Persist expiry of overdue requests. Returns how many expired.
    pub fn sweep_approvals(&self, now: DateTime<Utc>) -> Result<usize, TradingError> {
        let expired = self.gate.sweep(now);
        for request in &expired {
            let recorded = record_resolution(&self.audit, &self.alerts, request);
            self.escalate(recorded)?;
        }
        Ok(expired.len())
    }

    pub async fn sync_orders(&self) -> Result<usize, TradingError> {
        self.executor.sync_open_orders().await
    }

    pub async fn cancel_order(&self, order_id: &OrderId) -> Result<Order, TradingError> {
        self.executor.cancel(order_id).await
    }

    /// Stop new admissions. In-flight orders keep syncing.
    pub fn pause(&self) -> Result<bool, TradingError> {
        if !self.control.pause() {
            return Ok(false);
        }
        self.audit.append(&AuditEvent::TradingPaused { at: Utc::now() })?;
        self.alerts.notify(Alert::new(
            AlertKind::TradingPaused,
            AlertSeverity::Warning,
            "Trading paused by operator",
        ));
        Ok(true)
    }

    pub fn resume(&self) -> Result<bool, TradingError> {
        if !self.control.resume() {
            return Ok(false);
        }
        self.audit.append(&AuditEvent::TradingResumed { at: Utc::now() })?;
        self.alerts.notify(Alert::new(
            AlertKind::TradingResumed,
            AlertSeverity::Info,
            "Trading resumed by operator",
        ));
        Ok(true)
    }

    /// Lift a halt. The ledger is re-verified against the log first.
    pub async fn clear_halt(&self) -> Result<bool, TradingError> {
        if self.control.halt_reason().is_none() {
            return Ok(false);
        }
        self.audit.verify()?;
        let replayed = replay(&self.audit.records()?)?;
        let live = self.executor.state().lock().await.clone();
        if replayed.map(|r| r.state) != Some(live) {
            return Err(TradingError::LedgerInconsistency(
                "live state differs from audit replay".to_string(),
            ));
        }

        self.control.clear_halt();
        self.audit.append(&AuditEvent::HaltCleared { at: Utc::now() })?;
        Ok(true)
    }

    pub async fn status(&self) -> EngineStatus {
        let now = Utc::now();
        let (portfolio, open_orders) = {
            let state = self.executor.state();
            let state = state.lock().await;
            (
                state.ledger.snapshot(now),
                state.open_orders().cloned().collect(),
            )
        };
        EngineStatus {
            at: now,
            portfolio,
            paused: self.control.is_paused(),
            halted: self.control.halt_reason(),
            feed_degraded: self.feed.is_degraded(),
            cached_board_at: self.feed.fallback_board().map(|f| f.saved_at),
            pending_approvals: self.gate.pending(now),
            open_orders,
            audit_sequence: self.audit.last_sequence(),
        }
    }

    /// End-of-day alert with the portfolio numbers.
    pub async fn daily_summary(&self) {
        let now = Utc::now();
        let snapshot = self.executor.snapshot(now).await;
        let state = self.executor.state();
        let total_return = state.lock().await.ledger.total_return();
        self.alerts.notify(
            Alert::new(
                AlertKind::DailySummary { day: snapshot.day },
                AlertSeverity::Info,
                format!(
                    "Equity {:.2}, realized {:.2}, unrealized {:.2}",
                    snapshot.equity, snapshot.realized_pnl, snapshot.unrealized_pnl
                ),
            )
            .with_metric("equity", snapshot.equity)
            .with_metric("cash", snapshot.cash)
            .with_metric("realized_pnl", snapshot.realized_pnl)
            .with_metric("unrealized_pnl", snapshot.unrealized_pnl)
            .with_metric("total_return", total_return),
        );
    }

    /// Register the periodic tasks and start watching restored approvals.
    pub fn start(self: &Arc<Self>, scheduler: &mut Scheduler) {
        let restored: Vec<ApprovalTicket> = self.restored.lock().drain(..).collect();
        for ticket in restored {
            self.watch_approval(ticket);
        }

        let engine = self.clone();
        scheduler.dynamic("feed", Duration::ZERO, move || {
            let engine = engine.clone();
            async move {
                if let Err(e) = engine.poll_and_scan().await {
                    error!(error = %e, "Feed cycle failed");
                }
                engine.feed.next_delay()
            }
        });

        let engine = self.clone();
        scheduler.every("approval_sweep", self.intervals.approval_sweep, move || {
            let engine = engine.clone();
            async move {
                if let Err(e) = engine.sweep_approvals(Utc::now()) {
                    error!(error = %e, "Approval sweep failed");
                }
            }
        });

        let engine = self.clone();
        scheduler.every("order_sync", self.intervals.order_sync, move || {
            let engine = engine.clone();
            async move {
                if let Err(e) = engine.sync_orders().await {
                    error!(error = %e, "Order sync failed");
                }
            }
        });

        let engine = self.clone();
        scheduler.daily("daily_summary", move || {
            let engine = engine.clone();
            async move { engine.daily_summary().await }
        });
    }
}

/// Audit a settled approval request and alert on expiry.
fn record_resolution(
    audit: &AuditLog,
    alerts: &AlertDispatcher,
    request: &ApprovalRequest,
) -> Result<u64, TradingError> {
    let sequence = audit.append(&AuditEvent::ApprovalResolved {
        approval_id: request.id.clone(),
        status: request.status,
        at: request.resolved_at.unwrap_or_else(Utc::now),
        note: request.note.clone(),
    })?;
    if request.status == ApprovalStatus::Expired {
        info!(approval_id = %request.id, "Approval expired, opportunity abandoned");
        alerts.notify(
            Alert::new(
                AlertKind::ApprovalExpired {
                    approval_id: request.id.to_string(),
                },
                AlertSeverity::Warning,
                format!("Approval {} expired without a decision", request.id),
            )
            .for_market(&request.opportunity.market_id),
        );
    }
    Ok(sequence)
}
