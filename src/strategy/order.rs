//! Order lifecycle.
//!
//! ```text
//! Created -> Submitted -> PartiallyFilled -> Filled
//!               |               |
//!               +--> Filled     +--> Cancelled
//!               +--> Rejected | Failed | Cancelled
//! Created -> Cancelled
//! ```

use super::scanner::Opportunity;
use crate::error::TradingError;
use crate::exchange::{
    ApprovalId, ClientOrderId, FillId, MarketId, OpportunityId, OrderId, OrderRequest, Side,
};
use crate::portfolio::{worst_case_loss, Fill, Reservation};
use crate::risk::{ApprovalRequest, ApprovalStatus, RiskVerdict};
use crate::utils::blend_price;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Failed
        )
    }

    fn can_become(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Created, Submitted)
                | (Created, Cancelled)
                | (Submitted, PartiallyFilled)
                | (Submitted, Filled)
                | (Submitted, Cancelled)
                | (Submitted, Rejected)
                | (Submitted, Failed)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What allowed this order to be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum Grant {
    Verdict { opportunity_id: OpportunityId },
    Approval { approval_id: ApprovalId },
}

/// Proof of an audited Admit verdict or an Approved request.
///
/// Only constructible through [`Authorization::from_verdict`] and
/// [`Authorization::from_approval`]; an [`Order`] cannot exist without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    grant: Grant,
    /// Sequence of the audit record holding the verdict
    audit_sequence: u64,
}

impl Authorization {
    pub fn from_verdict(verdict: &RiskVerdict, audit_sequence: u64) -> Result<Self, TradingError> {
        if let Some(reason) = verdict.reject_reason() {
            return Err(TradingError::RiskViolation(reason));
        }
        if !verdict.is_admit() {
            return Err(TradingError::Unauthorized(format!(
                "opportunity {} needs manual approval",
                verdict.opportunity_id
            )));
        }
        Ok(Self {
            grant: Grant::Verdict {
                opportunity_id: verdict.opportunity_id.clone(),
            },
            audit_sequence,
        })
    }

    /// Requires an Approved request whose trade still passes revalidation.
    pub fn from_approval(
        request: &ApprovalRequest,
        revalidated: &RiskVerdict,
        audit_sequence: u64,
    ) -> Result<Self, TradingError> {
        match request.status {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Expired => return Err(TradingError::ApprovalExpired(request.id.clone())),
            other => {
                return Err(TradingError::Unauthorized(format!(
                    "approval {} is {:?}",
                    request.id, other
                )))
            }
        }
        if let Some(reason) = revalidated.reject_reason() {
            return Err(TradingError::RiskViolation(reason));
        }
        Ok(Self {
            grant: Grant::Approval {
                approval_id: request.id.clone(),
            },
            audit_sequence,
        })
    }

    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    pub fn audit_sequence(&self) -> u64 {
        self.audit_sequence
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub client_order_id: ClientOrderId,
    pub opportunity_id: OpportunityId,
    pub market_id: MarketId,
    pub side: Side,
    pub limit_price: Decimal,
    pub quantity: Decimal,
    pub notional: Decimal,
    pub authorization: Authorization,
    pub status: OrderStatus,
    pub external_id: Option<String>,
    pub filled_quantity: Decimal,
    pub average_fill_price: Option<Decimal>,
    pub fill_ids: Vec<FillId>,
    /// Worst-case loss reserved at submission
    pub reserved_loss: Decimal,
    /// Submission outcome unknown; reservation is kept until reconciled
    pub ambiguous: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub close_reason: Option<String>,
}

impl Order {
    pub fn from_opportunity(
        opportunity: &Opportunity,
        authorization: Authorization,
        now: DateTime<Utc>,
    ) -> Self {
        let quantity = opportunity.quantity();
        Self {
            id: OrderId::generate(),
            client_order_id: ClientOrderId::generate(),
            opportunity_id: opportunity.id.clone(),
            market_id: opportunity.market_id.clone(),
            side: opportunity.direction,
            limit_price: opportunity.entry_price,
            quantity,
            notional: quantity * opportunity.entry_price,
            authorization,
            status: OrderStatus::Created,
            external_id: None,
            filled_quantity: Decimal::ZERO,
            average_fill_price: None,
            fill_ids: Vec::new(),
            reserved_loss: worst_case_loss(opportunity.direction, opportunity.entry_price, quantity),
            ambiguous: false,
            created_at: now,
            updated_at: now,
            close_reason: None,
        }
    }

    pub fn transition(&mut self, next: OrderStatus, at: DateTime<Utc>) -> Result<(), TradingError> {
        if !self.status.can_become(next) {
            return Err(TradingError::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Move to a terminal state. An ambiguous failure may be settled as
    /// `Failed` once the venue confirms it never saw the order.
    pub fn close(&mut self, status: OrderStatus, reason: Option<String>, at: DateTime<Utc>) -> Result<(), TradingError> {
        if self.ambiguous && self.status == OrderStatus::Failed && status == OrderStatus::Failed {
            self.updated_at = at;
        } else {
            self.transition(status, at)?;
        }
        self.ambiguous = false;
        self.close_reason = reason;
        Ok(())
    }

    /// Mark the submission outcome as unknown.
    pub fn mark_ambiguous(&mut self, reason: String, at: DateTime<Utc>) -> Result<(), TradingError> {
        self.transition(OrderStatus::Failed, at)?;
        self.ambiguous = true;
        self.close_reason = Some(reason);
        Ok(())
    }

    /// Record the venue id. An ambiguous order found at the venue resumes as Submitted.
    pub fn acknowledge(&mut self, external_id: String, at: DateTime<Utc>) {
        if self.ambiguous && self.status == OrderStatus::Failed {
            self.status = OrderStatus::Submitted;
            self.ambiguous = false;
            self.close_reason = None;
        }
        self.external_id = Some(external_id);
        self.updated_at = at;
    }

    /// Record a fill against this order. Returns false for a duplicate.
    pub fn record_fill(&mut self, fill: &Fill) -> Result<bool, TradingError> {
        if self.fill_ids.contains(&fill.fill_id) {
            return Ok(false);
        }
        if self.status == OrderStatus::Submitted {
            self.transition(OrderStatus::PartiallyFilled, fill.at)?;
        } else if self.status != OrderStatus::PartiallyFilled {
            return Err(TradingError::InvalidTransition {
                order_id: self.id.clone(),
                from: self.status.to_string(),
                to: "fill".to_string(),
            });
        }

        let previous = self.filled_quantity;
        self.average_fill_price = Some(blend_price(
            previous,
            self.average_fill_price.unwrap_or(Decimal::ZERO),
            fill.quantity,
            fill.price,
        ));
        self.filled_quantity = previous + fill.quantity;
        self.fill_ids.push(fill.fill_id.clone());
        self.updated_at = self.updated_at.max(fill.at);
        Ok(true)
    }

    pub fn is_fully_filled(&self) -> bool {
        self.filled_quantity >= self.quantity
    }

    pub fn remaining_quantity(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    /// Still needs venue follow-up: live, or failed with unknown outcome.
    pub fn needs_sync(&self) -> bool {
        !self.status.is_terminal() || self.ambiguous
    }

    pub fn request(&self) -> OrderRequest {
        OrderRequest {
            client_order_id: self.client_order_id.clone(),
            market_id: self.market_id.clone(),
            side: self.side,
            price: self.limit_price,
            size: self.quantity,
        }
    }

    pub fn reservation(&self) -> Reservation {
        Reservation {
            order_id: self.id.clone(),
            market_id: self.market_id.clone(),
            side: self.side,
            price: self.limit_price,
            quantity: self.quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::PositionLedger;
    use crate::risk::RiskManager;
    use crate::strategy::test_opportunity;
    use rust_decimal_macros::dec;

    fn admitted_order() -> Order {
        let now = Utc::now();
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));
        let verdict = RiskManager::default().evaluate(&opp, &PositionLedger::new(dec!(1000), now).snapshot(now), now);
        let auth = Authorization::from_verdict(&verdict, 3).unwrap();
        Order::from_opportunity(&opp, auth, now)
    }

    fn fill(id: &str, order: &Order, qty: Decimal) -> Fill {
        Fill {
            fill_id: FillId::from(id),
            order_id: order.id.clone(),
            market_id: order.market_id.clone(),
            side: order.side,
            price: order.limit_price,
            quantity: qty,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_authorization_requires_admit() {
        let now = Utc::now();
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(60));
        let verdict = RiskManager::default().evaluate(&opp, &PositionLedger::new(dec!(1000), now).snapshot(now), now);
        let err = Authorization::from_verdict(&verdict, 1).unwrap_err();
        assert!(matches!(err, TradingError::RiskViolation(_)));
    }

    #[test]
    fn test_order_sizing_from_opportunity() {
        let order = admitted_order();
        assert_eq!(order.quantity, dec!(100));
        assert_eq!(order.notional, dec!(40));
        assert_eq!(order.reserved_loss, dec!(40));
        assert_eq!(order.status, OrderStatus::Created);
        assert_eq!(order.authorization.audit_sequence(), 3);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let now = Utc::now();
        let mut order = admitted_order();
        assert!(order.transition(OrderStatus::Filled, now).is_err());

        order.transition(OrderStatus::Submitted, now).unwrap();
        assert!(order.record_fill(&fill("f1", &order, dec!(30))).unwrap());
        assert!(!order.record_fill(&fill("f1", &order, dec!(30))).unwrap());
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.filled_quantity, dec!(30));

        order.record_fill(&fill("f2", &order, dec!(70))).unwrap();
        assert!(order.is_fully_filled());
        order.close(OrderStatus::Filled, None, now).unwrap();
        assert!(order.transition(OrderStatus::Cancelled, now).is_err());
    }

    #[test]
    fn test_ambiguous_order_reopens_on_acknowledge() {
        let now = Utc::now();
        let mut order = admitted_order();
        order.transition(OrderStatus::Submitted, now).unwrap();
        order.mark_ambiguous("timeout".into(), now).unwrap();
        assert!(order.needs_sync());

        order.acknowledge("v-1".into(), now);
        assert_eq!(order.status, OrderStatus::Submitted);
        assert!(!order.ambiguous);
    }

    #[test]
    fn test_ambiguous_order_settles_as_failed() {
        let now = Utc::now();
        let mut order = admitted_order();
        order.transition(OrderStatus::Submitted, now).unwrap();
        order.mark_ambiguous("timeout".into(), now).unwrap();

        order.close(OrderStatus::Failed, Some("not found at venue".into()), now).unwrap();
        assert!(!order.needs_sync());
        assert_eq!(order.status, OrderStatus::Failed);
    }
}
