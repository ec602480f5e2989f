//! Ledger and order book kept together under one lock.
//!
//! Every change is expressed as an [`AuditEvent`] and applied through
//! [`TradingState::apply`], both live and during replay, so the state rebuilt
//! from the log matches the state that wrote it.

use super::order::Order;
use crate::audit::AuditEvent;
use crate::error::TradingError;
use crate::exchange::OrderId;
use crate::portfolio::PositionLedger;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct TradingState {
    pub ledger: PositionLedger,
    pub orders: BTreeMap<OrderId, Order>,
}

impl TradingState {
    pub fn new(ledger: PositionLedger) -> Self {
        Self {
            ledger,
            orders: BTreeMap::new(),
        }
    }

    pub fn order(&self, order_id: &OrderId) -> Result<&Order, TradingError> {
        self.orders
            .get(order_id)
            .ok_or_else(|| TradingError::UnknownOrder(order_id.clone()))
    }

    fn order_mut(&mut self, order_id: &OrderId) -> Result<&mut Order, TradingError> {
        self.orders
            .get_mut(order_id)
            .ok_or_else(|| TradingError::UnknownOrder(order_id.clone()))
    }

    /// Orders that still need venue follow-up.
    pub fn open_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.needs_sync())
    }

    /// Apply a ledger or order event. Other events leave the state untouched.
    pub fn apply(&mut self, event: &AuditEvent) -> Result<(), TradingError> {
        match event {
            AuditEvent::OrderSubmitting { order } => {
                if self.orders.contains_key(&order.id) {
                    return Err(TradingError::LedgerInconsistency(format!(
                        "order {} submitted twice",
                        order.id
                    )));
                }
                self.ledger.reserve(order.reservation(), order.updated_at)?;
                self.orders.insert(order.id.clone(), order.clone());
            }
            AuditEvent::OrderAcknowledged {
                order_id,
                external_id,
                at,
            } => {
                self.order_mut(order_id)?.acknowledge(external_id.clone(), *at);
            }
            AuditEvent::FillApplied { fill } => {
                // Validate the order before the ledger moves.
                self.order(&fill.order_id)?;
                self.ledger.apply_fill(fill)?;
                self.order_mut(&fill.order_id)?.record_fill(fill)?;
            }
            AuditEvent::OrderClosed {
                order_id,
                status,
                reason,
                at,
            } => {
                self.order_mut(order_id)?.close(*status, reason.clone(), *at)?;
                self.ledger.release(order_id);
            }
            AuditEvent::OrderAmbiguous {
                order_id,
                reason,
                at,
            } => {
                self.order_mut(order_id)?
                    .mark_ambiguous(reason.clone(), *at)?;
            }
            AuditEvent::MarksUpdated { marks, at } => {
                for (market_id, price) in marks {
                    self.ledger.mark(market_id, *price, *at);
                }
            }
            AuditEvent::LedgerOpened { .. }
            | AuditEvent::RiskEvaluated { .. }
            | AuditEvent::ApprovalRequested { .. }
            | AuditEvent::ApprovalResolved { .. }
            | AuditEvent::TradingPaused { .. }
            | AuditEvent::TradingResumed { .. }
            | AuditEvent::TradingHalted { .. }
            | AuditEvent::HaltCleared { .. } => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FillId, Side};
    use crate::portfolio::Fill;
    use crate::risk::RiskManager;
    use crate::strategy::{test_opportunity, Authorization, OrderStatus};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn submitted(state: &TradingState) -> Order {
        let now = Utc::now();
        let opp = test_opportunity("m1", Side::Buy, dec!(0.50), dec!(40));
        let verdict = RiskManager::default().evaluate(&opp, &state.ledger.snapshot(now), now);
        let mut order = Order::from_opportunity(&opp, Authorization::from_verdict(&verdict, 1).unwrap(), now);
        order.transition(OrderStatus::Submitted, now).unwrap();
        order
    }

    #[test]
    fn test_fill_then_close_releases_reservation() {
        let mut state = TradingState::new(PositionLedger::new(dec!(1000), Utc::now()));
        let order = submitted(&state);
        state
            .apply(&AuditEvent::OrderSubmitting { order: order.clone() })
            .unwrap();
        assert!(state.ledger.reservation(&order.id).is_some());

        state
            .apply(&AuditEvent::FillApplied {
                fill: Fill {
                    fill_id: FillId::from("f1"),
                    order_id: order.id.clone(),
                    market_id: order.market_id.clone(),
                    side: Side::Buy,
                    price: dec!(0.50),
                    quantity: order.quantity,
                    at: Utc::now(),
                },
            })
            .unwrap();
        state
            .apply(&AuditEvent::OrderClosed {
                order_id: order.id.clone(),
                status: OrderStatus::Filled,
                reason: None,
                at: Utc::now(),
            })
            .unwrap();

        assert!(state.ledger.reservation(&order.id).is_none());
        assert_eq!(state.ledger.cash(), dec!(960));
        assert_eq!(state.order(&order.id).unwrap().status, OrderStatus::Filled);
        assert_eq!(state.open_orders().count(), 0);
    }

    #[test]
    fn test_fill_for_unknown_order_leaves_ledger_untouched() {
        let mut state = TradingState::new(PositionLedger::new(dec!(1000), Utc::now()));
        let err = state
            .apply(&AuditEvent::FillApplied {
                fill: Fill {
                    fill_id: FillId::from("f1"),
                    order_id: OrderId::from("ghost"),
                    market_id: "m1".into(),
                    side: Side::Buy,
                    price: dec!(0.50),
                    quantity: dec!(1),
                    at: Utc::now(),
                },
            })
            .unwrap_err();
        assert!(matches!(err, TradingError::UnknownOrder(_)));
        assert_eq!(state.ledger.cash(), dec!(1000));
    }

    #[test]
    fn test_resubmission_is_inconsistent() {
        let mut state = TradingState::new(PositionLedger::new(dec!(1000), Utc::now()));
        let order = submitted(&state);
        let event = AuditEvent::OrderSubmitting { order };
        state.apply(&event).unwrap();
        assert!(state.apply(&event).unwrap_err().is_fatal());
    }
}
