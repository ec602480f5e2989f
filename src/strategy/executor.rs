//! Order execution and lifecycle tracking.
//!
//! Admission (risk evaluation, audit, reservation) runs inside one critical
//! section on the trading state. Venue calls happen after the state lock is
//! released but while the per-market lock is held, so two admissions for the
//! same market never interleave.

use super::order::{Authorization, Order, OrderStatus};
use super::scanner::Opportunity;
use super::state::TradingState;
use crate::alert::{Alert, AlertDispatcher, AlertKind, AlertSeverity};
use crate::audit::{AuditEvent, AuditLog};
use crate::config::ExecutionConfig;
use crate::engine::TradingControl;
use crate::error::{TradingError, VenueError};
use crate::exchange::{MarketId, OrderId, OrderVenue, VenueOrder, VenueOrderStatus};
use crate::portfolio::{Fill, PortfolioSnapshot};
use crate::risk::{ApprovalRequest, RejectReason, RiskManager, RiskVerdict, VerdictOutcome};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// How an opportunity reached the executor.
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    /// Straight from the scanner; full evaluation applies.
    Scanned,
    /// Operator approved; capacity and loss limits are re-checked.
    Approved(&'a ApprovalRequest),
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone)]
pub enum Admission {
    Rejected(RiskVerdict),
    ApprovalRequired(RiskVerdict),
    /// An order was submitted; its status reflects the venue outcome.
    Executed(Order),
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub max_submit_attempts: u32,
    pub retry_backoff: Duration,
}

impl From<&ExecutionConfig> for ExecutionSettings {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            max_submit_attempts: config.max_submit_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Turns admitted opportunities into venue orders and tracks them to a terminal state.
pub struct OrderExecutor {
    venue: Arc<dyn OrderVenue>,
    state: Arc<Mutex<TradingState>>,
    audit: Arc<AuditLog>,
    alerts: AlertDispatcher,
    risk: RiskManager,
    control: Arc<TradingControl>,
    settings: ExecutionSettings,
    market_locks: parking_lot::Mutex<HashMap<MarketId, Arc<Mutex<()>>>>,
}

impl OrderExecutor {
    pub fn new(
        venue: Arc<dyn OrderVenue>,
        state: Arc<Mutex<TradingState>>,
        audit: Arc<AuditLog>,
        alerts: AlertDispatcher,
        risk: RiskManager,
        control: Arc<TradingControl>,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            venue,
            state,
            audit,
            alerts,
            risk,
            control,
            settings,
            market_locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self) -> Arc<Mutex<TradingState>> {
        self.state.clone()
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> PortfolioSnapshot {
        self.state.lock().await.ledger.snapshot(now)
    }

    fn market_lock(&self, market_id: &MarketId) -> Arc<Mutex<()>> {
        self.market_locks
            .lock()
            .entry(market_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply an event to the state, then persist it.
    fn record(&self, state: &mut TradingState, event: AuditEvent) -> Result<u64, TradingError> {
        state.apply(&event)?;
        self.audit.append(&event)
    }

    /// Stop admissions, alert and audit. Only the first halt is recorded.
    pub fn halt(&self, reason: String) {
        if !self.control.halt(reason.clone()) {
            return;
        }
        self.alerts.notify(Alert::new(
            AlertKind::TradingHalted {
                reason: reason.clone(),
            },
            AlertSeverity::Critical,
            format!("Trading halted: {reason}"),
        ));
        if let Err(e) = self.audit.append(&AuditEvent::TradingHalted {
            reason,
            at: Utc::now(),
        }) {
            error!(error = %e, "Failed to audit trading halt");
        }
    }

    /// Halt on fatal errors, pass everything through.
    fn escalate<T>(&self, result: Result<T, TradingError>) -> Result<T, TradingError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                self.halt(e.to_string());
            }
        }
        result
    }

    /// Evaluate an opportunity and submit it if allowed.
    #[instrument(skip_all, fields(opportunity = %opportunity.id, market = %opportunity.market_id))]
    pub async fn admit(
        &self,
        opportunity: &Opportunity,
        route: Route<'_>,
    ) -> Result<Admission, TradingError> {
        let result = self.admit_inner(opportunity, route).await;
        self.escalate(result)
    }

    async fn admit_inner(
        &self,
        opportunity: &Opportunity,
        route: Route<'_>,
    ) -> Result<Admission, TradingError> {
        self.control.check()?;

        let lock = self.market_lock(&opportunity.market_id);
        let _serial = lock.lock().await;

        let order_id = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let snapshot = state.ledger.snapshot(now);
            let verdict = match route {
                Route::Scanned => self.risk.evaluate(opportunity, &snapshot, now),
                Route::Approved(_) => self.risk.revalidate(opportunity, &snapshot, now),
            };
            let sequence = self.audit.append(&AuditEvent::RiskEvaluated {
                opportunity: opportunity.clone(),
                verdict: verdict.clone(),
            })?;

            match verdict.outcome {
                VerdictOutcome::Reject(reason) => {
                    info!(%reason, notional = %verdict.notional, "Opportunity rejected");
                    self.alerts.notify(
                        Alert::new(
                            AlertKind::RiskRejected {
                                opportunity_id: opportunity.id.to_string(),
                                reason: reason.to_string(),
                            },
                            AlertSeverity::Warning,
                            format!("Risk rejected {}: {}", opportunity.id, reason),
                        )
                        .for_market(&opportunity.market_id)
                        .with_metric("notional", verdict.notional)
                        .with_metric("cap_amount", verdict.limits.cap_amount),
                    );
                    return Ok(Admission::Rejected(verdict));
                }
                VerdictOutcome::RequireApproval => {
                    debug!(notional = %verdict.notional, "Opportunity needs approval");
                    return Ok(Admission::ApprovalRequired(verdict));
                }
                VerdictOutcome::Admit => {}
            }

            let authorization = match route {
                Route::Scanned => Authorization::from_verdict(&verdict, sequence)?,
                Route::Approved(request) => {
                    Authorization::from_approval(request, &verdict, sequence)?
                }
            };
            let mut order = Order::from_opportunity(opportunity, authorization, now);
            if order.quantity <= Decimal::ZERO {
                return Err(TradingError::RiskViolation(RejectReason::InvalidOpportunity));
            }
            order.transition(OrderStatus::Submitted, now)?;
            let order_id = order.id.clone();
            self.record(&mut state, AuditEvent::OrderSubmitting { order })?;
            order_id
        };

        let order = self.transmit(&order_id).await?;
        Ok(Admission::Executed(order))
    }

    /// Send a Submitted order to the venue, reconciling before any retry.
    async fn transmit(&self, order_id: &OrderId) -> Result<Order, TradingError> {
        let request = self.state.lock().await.order(order_id)?.request();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.venue.submit(&request).await {
                Ok(venue_order) => {
                    let order = self.adopt(order_id, &venue_order).await?;
                    if order.status == OrderStatus::Rejected {
                        return Err(TradingError::VenueRejection {
                            order_id: order_id.clone(),
                            reason: order.close_reason.unwrap_or_default(),
                        });
                    }
                    return Ok(order);
                }
                Err(e) => e,
            };

            if !err.is_ambiguous() {
                return self.reject(order_id, err.to_string()).await;
            }

            warn!(%order_id, attempt, error = %err, "Submission outcome unknown, reconciling");
            match self.venue.find_by_client_id(&request.client_order_id).await {
                Ok(Some(venue_order)) => {
                    info!(%order_id, external_id = %venue_order.order_id, "Order found at venue");
                    return self.adopt(order_id, &venue_order).await;
                }
                Ok(None) if attempt < self.settings.max_submit_attempts => {
                    tokio::time::sleep(self.settings.retry_backoff * attempt).await;
                }
                Ok(None) => {
                    return self
                        .fail(
                            order_id,
                            format!("not acknowledged after {attempt} attempts: {err}"),
                        )
                        .await;
                }
                Err(lookup) => {
                    return self
                        .mark_ambiguous(order_id, format!("{err}; reconciliation failed: {lookup}"))
                        .await;
                }
            }
        }
    }

    async fn adopt(&self, order_id: &OrderId, venue_order: &VenueOrder) -> Result<Order, TradingError> {
        let mut state = self.state.lock().await;
        self.apply_venue_update(&mut state, order_id, venue_order)?;
        Ok(state.order(order_id)?.clone())
    }

    async fn reject(&self, order_id: &OrderId, reason: String) -> Result<Order, TradingError> {
        let mut state = self.state.lock().await;
        self.close(&mut state, order_id, OrderStatus::Rejected, Some(reason.clone()))?;
        Err(TradingError::VenueRejection {
            order_id: order_id.clone(),
            reason,
        })
    }

    async fn fail(&self, order_id: &OrderId, reason: String) -> Result<Order, TradingError> {
        let mut state = self.state.lock().await;
        self.close(&mut state, order_id, OrderStatus::Failed, Some(reason))?;
        Ok(state.order(order_id)?.clone())
    }

    async fn mark_ambiguous(&self, order_id: &OrderId, reason: String) -> Result<Order, TradingError> {
        let mut state = self.state.lock().await;
        self.record(
            &mut state,
            AuditEvent::OrderAmbiguous {
                order_id: order_id.clone(),
                reason: reason.clone(),
                at: Utc::now(),
            },
        )?;
        let order = state.order(order_id)?;
        error!(%order_id, %reason, "Submission ambiguous, reservation kept");
        self.alerts.notify(
            Alert::new(
                AlertKind::SubmissionAmbiguous {
                    order_id: order_id.to_string(),
                    reason: reason.clone(),
                },
                AlertSeverity::Critical,
                format!("Order {order_id} may or may not be live: {reason}"),
            )
            .for_market(&order.market_id)
            .with_metric("notional", order.notional),
        );
        Err(TradingError::SubmissionAmbiguous {
            order_id: order_id.clone(),
            reason,
        })
    }

    /// Close an order, releasing its reservation, and alert on the outcome.
    fn close(
        &self,
        state: &mut TradingState,
        order_id: &OrderId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<(), TradingError> {
        self.record(
            state,
            AuditEvent::OrderClosed {
                order_id: order_id.clone(),
                status,
                reason: reason.clone(),
                at: Utc::now(),
            },
        )?;

        let order = state.order(order_id)?;
        let reason = reason.unwrap_or_default();
        info!(%order_id, %status, filled = %order.filled_quantity, %reason, "Order closed");
        let alert = match status {
            OrderStatus::Filled => Some(Alert::new(
                AlertKind::OrderFilled {
                    order_id: order_id.to_string(),
                },
                AlertSeverity::Info,
                format!("Order {order_id} filled"),
            )),
            OrderStatus::Rejected => Some(Alert::new(
                AlertKind::OrderRejected {
                    order_id: order_id.to_string(),
                    reason: reason.clone(),
                },
                AlertSeverity::Warning,
                format!("Order {order_id} rejected: {reason}"),
            )),
            OrderStatus::Failed => Some(Alert::new(
                AlertKind::OrderRejected {
                    order_id: order_id.to_string(),
                    reason: reason.clone(),
                },
                AlertSeverity::Error,
                format!("Order {order_id} failed: {reason}"),
            )),
            _ => None,
        };
        if let Some(alert) = alert {
            self.alerts.notify(
                alert
                    .for_market(&order.market_id)
                    .with_metric("filled_quantity", order.filled_quantity)
                    .with_metric("notional", order.notional),
            );
        }
        Ok(())
    }

    /// Fold the venue's view of an order into local state.
    fn apply_venue_update(
        &self,
        state: &mut TradingState,
        order_id: &OrderId,
        venue_order: &VenueOrder,
    ) -> Result<(), TradingError> {
        let order = state.order(order_id)?;
        if order.status.is_terminal() && !order.ambiguous {
            debug!(%order_id, status = %order.status, "Ignoring venue update for closed order");
            return Ok(());
        }

        if order.external_id.as_deref() != Some(venue_order.order_id.as_str()) {
            self.record(
                state,
                AuditEvent::OrderAcknowledged {
                    order_id: order_id.clone(),
                    external_id: venue_order.order_id.clone(),
                    at: Utc::now(),
                },
            )?;
        }

        for venue_fill in &venue_order.fills {
            if state.ledger.has_applied(&venue_fill.fill_id) {
                continue;
            }
            let order = state.order(order_id)?;
            let fill = Fill {
                fill_id: venue_fill.fill_id.clone(),
                order_id: order.id.clone(),
                market_id: order.market_id.clone(),
                side: order.side,
                price: venue_fill.price,
                quantity: venue_fill.size,
                at: venue_fill.timestamp,
            };
            self.record(state, AuditEvent::FillApplied { fill })?;
        }

        let order = state.order(order_id)?;
        let closing = match venue_order.status {
            VenueOrderStatus::Open | VenueOrderStatus::PartiallyFilled => {
                order.is_fully_filled().then_some((OrderStatus::Filled, None))
            }
            VenueOrderStatus::Filled if order.is_fully_filled() => Some((OrderStatus::Filled, None)),
            // Closing now would release the reservation without touching the ledger.
            VenueOrderStatus::Filled => {
                warn!(
                    %order_id,
                    filled = %order.filled_quantity,
                    quantity = %order.quantity,
                    "Venue reports filled but fills are missing, keeping order open"
                );
                None
            }
            // A fill observed before the cancel wins.
            VenueOrderStatus::Cancelled if order.is_fully_filled() => {
                Some((OrderStatus::Filled, None))
            }
            VenueOrderStatus::Cancelled => Some((
                OrderStatus::Cancelled,
                Some(
                    venue_order
                        .reject_reason
                        .clone()
                        .unwrap_or_else(|| "cancelled at venue".to_string()),
                ),
            )),
            VenueOrderStatus::Rejected => {
                let reason = venue_order
                    .reject_reason
                    .clone()
                    .unwrap_or_else(|| "rejected by venue".to_string());
                if order.filled_quantity > Decimal::ZERO {
                    Some((OrderStatus::Cancelled, Some(reason)))
                } else {
                    Some((OrderStatus::Rejected, Some(reason)))
                }
            }
        };

        if let Some((status, reason)) = closing {
            self.close(state, order_id, status, reason)?;
        }
        Ok(())
    }

    /// Poll the venue for every order that is still open or ambiguous.
    /// Returns the number of orders checked.
    pub async fn sync_open_orders(&self) -> Result<usize, TradingError> {
        let open: Vec<(OrderId, MarketId)> = {
            let state = self.state.lock().await;
            state
                .open_orders()
                .map(|o| (o.id.clone(), o.market_id.clone()))
                .collect()
        };

        let mut checked = 0;
        for (order_id, market_id) in open {
            let lock = self.market_lock(&market_id);
            let _serial = lock.lock().await;

            let order = self.state.lock().await.order(&order_id)?.clone();
            if !order.needs_sync() {
                continue;
            }
            checked += 1;

            let result = self.sync_order(&order).await;
            match self.escalate(result) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(%order_id, error = %e, "Order sync failed"),
            }
        }
        Ok(checked)
    }

    async fn sync_order(&self, order: &Order) -> Result<(), TradingError> {
        let lookup = match &order.external_id {
            Some(external_id) if !order.ambiguous => {
                self.venue.query(external_id).await.map(Some)
            }
            _ => self.venue.find_by_client_id(&order.client_order_id).await,
        };

        let mut state = self.state.lock().await;
        match lookup {
            Ok(Some(venue_order)) => self.apply_venue_update(&mut state, &order.id, &venue_order),
            Ok(None) => {
                info!(order_id = %order.id, "Order never reached the venue");
                self.close(
                    &mut state,
                    &order.id,
                    OrderStatus::Failed,
                    Some("not found at venue".to_string()),
                )
            }
            Err(e) => {
                debug!(order_id = %order.id, error = %e, "Venue lookup failed, will retry");
                Ok(())
            }
        }
    }

    /// Cancel an open order. A fill that beat the cancel is applied and wins.
    #[instrument(skip(self))]
    pub async fn cancel(&self, order_id: &OrderId) -> Result<Order, TradingError> {
        let result = self.cancel_inner(order_id).await;
        self.escalate(result)
    }

    async fn cancel_inner(&self, order_id: &OrderId) -> Result<Order, TradingError> {
        let market_id = self.state.lock().await.order(order_id)?.market_id.clone();
        let lock = self.market_lock(&market_id);
        let _serial = lock.lock().await;

        let order = self.state.lock().await.order(order_id)?.clone();
        if !order.needs_sync() {
            return Err(TradingError::InvalidTransition {
                order_id: order_id.clone(),
                from: order.status.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            });
        }

        if order.status == OrderStatus::Created {
            let mut state = self.state.lock().await;
            self.close(&mut state, order_id, OrderStatus::Cancelled, Some("cancelled before submission".to_string()))?;
            return Ok(state.order(order_id)?.clone());
        }

        let external_id = match order.external_id.clone() {
            Some(id) if !order.ambiguous => id,
            _ => match self.venue.find_by_client_id(&order.client_order_id).await {
                Ok(Some(venue_order)) => venue_order.order_id,
                Ok(None) => {
                    let status = if order.ambiguous {
                        OrderStatus::Failed
                    } else {
                        OrderStatus::Cancelled
                    };
                    let mut state = self.state.lock().await;
                    self.close(&mut state, order_id, status, Some("cancelled, never reached venue".to_string()))?;
                    return Ok(state.order(order_id)?.clone());
                }
                Err(e) => {
                    return Err(TradingError::VenueRejection {
                        order_id: order_id.clone(),
                        reason: format!("cancel lookup failed: {e}"),
                    })
                }
            },
        };

        let update = match self.venue.cancel(&external_id).await {
            Ok(update) => update,
            Err(VenueError::AlreadyFilled(_)) => {
                info!(%order_id, "Cancel lost the race to a fill");
                self.venue.query(&external_id).await.map_err(|e| {
                    TradingError::VenueRejection {
                        order_id: order_id.clone(),
                        reason: format!("query after fill race failed: {e}"),
                    }
                })?
            }
            Err(e) => {
                return Err(TradingError::VenueRejection {
                    order_id: order_id.clone(),
                    reason: e.to_string(),
                })
            }
        };

        self.adopt(order_id, &update).await
    }

    /// Refresh mark prices of held positions. Returns whether anything changed.
    pub async fn update_marks(
        &self,
        marks: &BTreeMap<MarketId, Decimal>,
        now: DateTime<Utc>,
    ) -> Result<bool, TradingError> {
        let mut state = self.state.lock().await;
        let changed: BTreeMap<MarketId, Decimal> = marks
            .iter()
            .filter(|(market_id, price)| {
                state
                    .ledger
                    .position(market_id)
                    .is_some_and(|p| !p.is_flat() && p.mark_price != Some(**price))
            })
            .map(|(m, p)| (m.clone(), *p))
            .collect();
        if changed.is_empty() {
            return Ok(false);
        }

        let result = self
            .record(&mut state, AuditEvent::MarksUpdated { marks: changed, at: now })
            .map(|_| true);
        drop(state);
        self.escalate(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::replay;
    use crate::exchange::{ClientOrderId, FillId, MockOrderVenue, PaperVenue, Side, VenueFill};
    use crate::portfolio::PositionLedger;
    use crate::risk::{ApprovalDecision, ApprovalGate, RiskLimits};
    use crate::strategy::test_opportunity;
    use rust_decimal_macros::dec;

    struct Harness {
        executor: OrderExecutor,
        audit: Arc<AuditLog>,
        control: Arc<TradingControl>,
    }

    fn harness(venue: Arc<dyn OrderVenue>, capital: Decimal, limits: RiskLimits) -> Harness {
        let now = Utc::now();
        let audit = Arc::new(AuditLog::in_memory());
        audit
            .append(&AuditEvent::LedgerOpened {
                starting_cash: capital,
                at: now,
            })
            .unwrap();
        let state = Arc::new(Mutex::new(TradingState::new(PositionLedger::new(capital, now))));
        let (alerts, _rx) = AlertDispatcher::channel(64);
        let control = Arc::new(TradingControl::new());
        let executor = OrderExecutor::new(
            venue,
            state,
            audit.clone(),
            alerts,
            RiskManager::new(limits),
            control.clone(),
            ExecutionSettings {
                max_submit_attempts: 3,
                retry_backoff: Duration::from_millis(1),
            },
        );
        Harness {
            executor,
            audit,
            control,
        }
    }

    fn default_harness(venue: Arc<dyn OrderVenue>) -> Harness {
        harness(venue, dec!(1000), RiskLimits::default())
    }

    fn executed(admission: Admission) -> Order {
        match admission {
            Admission::Executed(order) => order,
            other => panic!("expected execution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_admitted_trade_fills_on_paper() {
        let h = default_harness(Arc::new(PaperVenue::new()));
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));

        let order = executed(h.executor.admit(&opp, Route::Scanned).await.unwrap());
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_quantity, dec!(100));
        assert_eq!(order.average_fill_price, Some(dec!(0.40)));

        let snapshot = h.executor.snapshot(Utc::now()).await;
        assert_eq!(snapshot.cash, dec!(960));
        assert_eq!(snapshot.reserved_notional, Decimal::ZERO);
        assert_eq!(snapshot.position(&"m1".into()).unwrap().quantity, dec!(100));

        // The authorizing verdict precedes the submission in the log.
        let records = h.audit.records().unwrap();
        let verdict_record = &records[order.authorization.audit_sequence() as usize - 1];
        assert_eq!(verdict_record.kind, "risk_evaluated");
        let kinds: Vec<&str> = records.iter().map(|r| r.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "ledger_opened",
                "risk_evaluated",
                "order_submitting",
                "order_acknowledged",
                "fill_applied",
                "order_closed"
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_trade_never_submitted() {
        let mut venue = MockOrderVenue::new();
        venue.expect_submit().never();
        let h = default_harness(Arc::new(venue));

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(60));
        match h.executor.admit(&opp, Route::Scanned).await.unwrap() {
            Admission::Rejected(verdict) => {
                assert_eq!(verdict.reject_reason(), Some(RejectReason::PositionTooLarge));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(h.executor.state().lock().await.orders.is_empty());
    }

    #[tokio::test]
    async fn test_large_trade_waits_for_approval() {
        let mut venue = MockOrderVenue::new();
        venue.expect_submit().never();
        let limits = RiskLimits {
            daily_loss_limit: dec!(500),
            ..RiskLimits::default()
        };
        let h = harness(Arc::new(venue), dec!(10000), limits);

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(150));
        let admission = h.executor.admit(&opp, Route::Scanned).await.unwrap();
        assert!(matches!(admission, Admission::ApprovalRequired(_)));

        let snapshot = h.executor.snapshot(Utc::now()).await;
        assert_eq!(snapshot.reserved_notional, Decimal::ZERO);
        assert!(h.executor.state().lock().await.orders.is_empty());
    }

    #[tokio::test]
    async fn test_approved_trade_is_revalidated_and_submitted() {
        let limits = RiskLimits {
            daily_loss_limit: dec!(500),
            ..RiskLimits::default()
        };
        let h = harness(Arc::new(PaperVenue::new()), dec!(10000), limits.clone());
        let now = Utc::now();
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(150));

        let gate = ApprovalGate::new(chrono::Duration::minutes(15));
        let verdict = RiskManager::new(limits).evaluate(&opp, &h.executor.snapshot(now).await, now);
        let request = gate.prepare(opp.clone(), verdict, now);
        gate.open(request.clone());

        // Pending requests do not authorize anything.
        let err = h
            .executor
            .admit(&opp, Route::Approved(&request))
            .await
            .unwrap_err();
        assert!(matches!(err, TradingError::Unauthorized(_)));

        let approved = gate
            .resolve(&request.id, ApprovalDecision::Approve, None, now)
            .unwrap()
            .request;
        let order = executed(h.executor.admit(&opp, Route::Approved(&approved)).await.unwrap());
        assert_eq!(order.status, OrderStatus::Filled);
        assert!(matches!(
            order.authorization.grant(),
            crate::strategy::Grant::Approval { approval_id } if *approval_id == request.id
        ));
    }

    #[tokio::test]
    async fn test_venue_rejection_releases_reservation() {
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit()
            .times(1)
            .returning(|_| Err(VenueError::Rejected("market closed".into())));
        venue.expect_find_by_client_id().never();
        let h = default_harness(Arc::new(venue));

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let err = h.executor.admit(&opp, Route::Scanned).await.unwrap_err();
        assert!(matches!(err, TradingError::VenueRejection { .. }));

        let state = h.executor.state();
        let state = state.lock().await;
        let order = state.orders.values().next().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert!(state.ledger.reservation(&order.id).is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_adopts_venue_order() {
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit()
            .times(1)
            .returning(|_| Err(VenueError::Transport("connection reset".into())));
        venue.expect_find_by_client_id().times(1).returning(|client| {
            Ok(Some(VenueOrder {
                order_id: "v-9".to_string(),
                client_order_id: client.clone(),
                status: VenueOrderStatus::Open,
                fills: Vec::new(),
                reject_reason: None,
            }))
        });
        let h = default_harness(Arc::new(venue));

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let order = executed(h.executor.admit(&opp, Route::Scanned).await.unwrap());
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.external_id.as_deref(), Some("v-9"));
    }

    #[tokio::test]
    async fn test_unacknowledged_order_fails_after_retries() {
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit()
            .times(3)
            .returning(|_| Err(VenueError::Transport("timeout".into())));
        venue
            .expect_find_by_client_id()
            .times(3)
            .returning(|_| Ok(None));
        let h = default_harness(Arc::new(venue));

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let order = executed(h.executor.admit(&opp, Route::Scanned).await.unwrap());
        assert_eq!(order.status, OrderStatus::Failed);
        assert!(h
            .executor
            .state()
            .lock()
            .await
            .ledger
            .reservation(&order.id)
            .is_none());
    }

    #[tokio::test]
    async fn test_ambiguous_submission_keeps_reservation_until_sync() {
        let mut venue = MockOrderVenue::new();
        venue
            .expect_submit()
            .times(1)
            .returning(|_| Err(VenueError::Transport("timeout".into())));
        let mut lookups = 0;
        venue.expect_find_by_client_id().times(2).returning(move |_| {
            lookups += 1;
            if lookups == 1 {
                Err(VenueError::Transport("venue unreachable".into()))
            } else {
                Ok(None)
            }
        });
        let h = default_harness(Arc::new(venue));

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let err = h.executor.admit(&opp, Route::Scanned).await.unwrap_err();
        assert!(matches!(err, TradingError::SubmissionAmbiguous { .. }));

        let order_id = {
            let state = h.executor.state();
            let state = state.lock().await;
            let order = state.orders.values().next().unwrap();
            assert!(order.ambiguous);
            assert!(state.ledger.reservation(&order.id).is_some());
            order.id.clone()
        };

        assert_eq!(h.executor.sync_open_orders().await.unwrap(), 1);
        let state = h.executor.state();
        let state = state.lock().await;
        assert_eq!(state.orders[&order_id].status, OrderStatus::Failed);
        assert!(!state.orders[&order_id].ambiguous);
        assert!(state.ledger.reservation(&order_id).is_none());
    }

    #[tokio::test]
    async fn test_partial_fills_then_cancel_race() {
        let venue = Arc::new(PaperVenue::with_auto_fill(false));
        let h = default_harness(venue.clone());

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let order = executed(h.executor.admit(&opp, Route::Scanned).await.unwrap());
        let external_id = order.external_id.clone().unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);

        venue.fill(&external_id, dec!(30)).await.unwrap();
        h.executor.sync_open_orders().await.unwrap();
        {
            let state = h.executor.state();
            let state = state.lock().await;
            assert_eq!(state.orders[&order.id].status, OrderStatus::PartiallyFilled);
            // 70 shares still reserved at 0.40
            assert_eq!(state.ledger.reservation(&order.id).unwrap().notional(), dec!(28));
        }

        // The rest fills before our cancel lands.
        venue.fill(&external_id, dec!(70)).await.unwrap();
        let closed = h.executor.cancel(&order.id).await.unwrap();
        assert_eq!(closed.status, OrderStatus::Filled);
        assert_eq!(closed.filled_quantity, dec!(100));

        let err = h.executor.cancel(&order.id).await.unwrap_err();
        assert!(matches!(err, TradingError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_filled_status_without_fills_keeps_order_open() {
        let mut venue = MockOrderVenue::new();
        venue.expect_submit().times(1).returning(|request| {
            Ok(VenueOrder {
                order_id: "v-7".to_string(),
                client_order_id: request.client_order_id.clone(),
                status: VenueOrderStatus::Filled,
                fills: Vec::new(),
                reject_reason: None,
            })
        });
        venue.expect_query().returning(|id| {
            Ok(VenueOrder {
                order_id: id.to_string(),
                client_order_id: ClientOrderId::from("unused"),
                status: VenueOrderStatus::Filled,
                fills: vec![VenueFill {
                    fill_id: FillId::from("f-7"),
                    price: dec!(0.40),
                    size: dec!(100),
                    timestamp: Utc::now(),
                }],
                reject_reason: None,
            })
        });
        let h = default_harness(Arc::new(venue));

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let order = executed(h.executor.admit(&opp, Route::Scanned).await.unwrap());
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.filled_quantity, Decimal::ZERO);

        let snapshot = h.executor.snapshot(Utc::now()).await;
        assert_eq!(snapshot.cash, dec!(1000));
        assert_eq!(snapshot.reserved_notional, dec!(40));
        assert!(h.control.halt_reason().is_none());

        assert_eq!(h.executor.sync_open_orders().await.unwrap(), 1);
        let state = h.executor.state();
        let state = state.lock().await;
        assert_eq!(state.order(&order.id).unwrap().status, OrderStatus::Filled);
        assert_eq!(state.ledger.cash(), dec!(960));
        assert!(state.ledger.reservation(&order.id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_resting_order() {
        let venue = Arc::new(PaperVenue::with_auto_fill(false));
        let h = default_harness(venue.clone());

        let opp = test_opportunity("m1", Side::Sell, dec!(0.60), dec!(30));
        let order = executed(h.executor.admit(&opp, Route::Scanned).await.unwrap());
        let closed = h.executor.cancel(&order.id).await.unwrap();

        assert_eq!(closed.status, OrderStatus::Cancelled);
        let snapshot = h.executor.snapshot(Utc::now()).await;
        assert_eq!(snapshot.reserved_notional, Decimal::ZERO);
        assert!(snapshot.positions.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_fill_delivery_applied_once() {
        let mut venue = MockOrderVenue::new();
        venue.expect_submit().returning(|request| {
            Ok(VenueOrder {
                order_id: "v-1".to_string(),
                client_order_id: request.client_order_id.clone(),
                status: VenueOrderStatus::PartiallyFilled,
                fills: vec![VenueFill {
                    fill_id: FillId::from("f-1"),
                    price: request.price,
                    size: dec!(50),
                    timestamp: Utc::now(),
                }],
                reject_reason: None,
            })
        });
        venue.expect_query().returning(move |id| {
            Ok(VenueOrder {
                order_id: id.to_string(),
                client_order_id: ClientOrderId::from("unused"),
                status: VenueOrderStatus::PartiallyFilled,
                fills: vec![VenueFill {
                    fill_id: FillId::from("f-1"),
                    price: dec!(0.40),
                    size: dec!(50),
                    timestamp: Utc::now(),
                }],
                reject_reason: None,
            })
        });
        let h = default_harness(Arc::new(venue));

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        executed(h.executor.admit(&opp, Route::Scanned).await.unwrap());
        h.executor.sync_open_orders().await.unwrap();
        h.executor.sync_open_orders().await.unwrap();

        let snapshot = h.executor.snapshot(Utc::now()).await;
        assert_eq!(snapshot.position(&"m1".into()).unwrap().quantity, dec!(50));
        assert_eq!(snapshot.cash, dec!(980));
        let fills = h
            .audit
            .records()
            .unwrap()
            .iter()
            .filter(|r| r.kind == "fill_applied")
            .count();
        assert_eq!(fills, 1);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_share_loss_budget() {
        let venue = Arc::new(PaperVenue::with_auto_fill(false));
        let h = default_harness(venue);

        // Each order risks 40 against a daily budget of 50.
        let a = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let b = test_opportunity("m2", Side::Buy, dec!(0.40), dec!(40));
        let (first, second) = tokio::join!(
            h.executor.admit(&a, Route::Scanned),
            h.executor.admit(&b, Route::Scanned)
        );

        let outcomes = [first.unwrap(), second.unwrap()];
        let executed = outcomes
            .iter()
            .filter(|o| matches!(o, Admission::Executed(_)))
            .count();
        let rejected = outcomes
            .iter()
            .filter(|o| {
                matches!(o, Admission::Rejected(v)
                    if v.reject_reason() == Some(RejectReason::DailyLossLimitExceeded))
            })
            .count();
        assert_eq!((executed, rejected), (1, 1));
    }

    #[tokio::test]
    async fn test_paused_executor_refuses_admission() {
        let mut venue = MockOrderVenue::new();
        venue.expect_submit().never();
        let h = default_harness(Arc::new(venue));
        h.control.pause();

        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let err = h.executor.admit(&opp, Route::Scanned).await.unwrap_err();
        assert!(matches!(err, TradingError::Halted(_)));
    }

    #[tokio::test]
    async fn test_replay_reproduces_live_state() {
        let venue = Arc::new(PaperVenue::with_auto_fill(false));
        let h = default_harness(venue.clone());

        let a = executed(
            h.executor
                .admit(&test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40)), Route::Scanned)
                .await
                .unwrap(),
        );
        venue.fill(a.external_id.as_deref().unwrap(), dec!(60)).await.unwrap();
        h.executor.sync_open_orders().await.unwrap();
        h.executor.cancel(&a.id).await.unwrap();

        let mut marks = BTreeMap::new();
        marks.insert(MarketId::from("m1"), dec!(0.35));
        assert!(h.executor.update_marks(&marks, Utc::now()).await.unwrap());
        assert!(!h.executor.update_marks(&marks, Utc::now()).await.unwrap());

        let replayed = replay(&h.audit.records().unwrap()).unwrap().unwrap();
        let live = h.executor.state().lock().await.clone();
        assert_eq!(replayed.state, live);
        assert_eq!(live.ledger.cash(), dec!(976));
    }

    #[tokio::test]
    async fn test_fatal_error_halts_trading() {
        let h = default_harness(Arc::new(PaperVenue::new()));
        let state = h.executor.state();
        let ghost = Fill {
            fill_id: FillId::from("f-ghost"),
            order_id: OrderId::from("ord-ghost"),
            market_id: "m1".into(),
            side: Side::Buy,
            price: dec!(0.5),
            quantity: dec!(1),
            at: Utc::now(),
        };
        let err = state.lock().await.ledger.apply_fill(&ghost).unwrap_err();
        let result: Result<(), TradingError> = h.executor.escalate(Err(err));

        assert!(result.is_err());
        assert!(h.control.halt_reason().is_some());
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        assert!(matches!(
            h.executor.admit(&opp, Route::Scanned).await,
            Err(TradingError::Halted(_))
        ));
        assert!(h
            .audit
            .records()
            .unwrap()
            .iter()
            .any(|r| r.kind == "trading_halted"));
    }
}
