//! Pre-trade risk policy.
//!
//! Rules, evaluated in order:
//! 1. Market exposure plus the new notional must stay within
//!    `single_trade_cap_pct` of available capital.
//! 2. Daily loss plus reserved and new worst-case loss must stay within
//!    `daily_loss_limit`.
//! 3. Notional above `manual_approval_threshold` needs an operator.

use crate::config::RiskConfig;
use crate::exchange::{MarketId, OpportunityId};
use crate::portfolio::PortfolioSnapshot;
use crate::strategy::Opportunity;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Limits in force for an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub single_trade_cap_pct: Decimal,
    pub daily_loss_limit: Decimal,
    pub manual_approval_threshold: Decimal,
}

impl From<&RiskConfig> for RiskLimits {
    fn from(config: &RiskConfig) -> Self {
        Self {
            single_trade_cap_pct: config.single_trade_cap_pct,
            daily_loss_limit: config.daily_loss_limit,
            manual_approval_threshold: config.manual_approval_threshold,
        }
    }
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self::from(&RiskConfig::default())
    }
}

/// Why a trade was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PositionTooLarge,
    DailyLossLimitExceeded,
    InvalidOpportunity,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::PositionTooLarge => "position too large",
            RejectReason::DailyLossLimitExceeded => "daily loss limit exceeded",
            RejectReason::InvalidOpportunity => "invalid opportunity",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum VerdictOutcome {
    Admit,
    Reject(RejectReason),
    RequireApproval,
}

/// The numbers a verdict was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedLimits {
    pub cap_base: Decimal,
    pub cap_amount: Decimal,
    pub market_exposure: Decimal,
    pub committed_loss: Decimal,
    pub worst_case_loss: Decimal,
    pub daily_loss_limit: Decimal,
    pub approval_threshold: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskVerdict {
    pub opportunity_id: OpportunityId,
    pub market_id: MarketId,
    pub notional: Decimal,
    pub outcome: VerdictOutcome,
    pub limits: AppliedLimits,
    pub evaluated_at: DateTime<Utc>,
}

impl RiskVerdict {
    pub fn is_admit(&self) -> bool {
        self.outcome == VerdictOutcome::Admit
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self.outcome {
            VerdictOutcome::Reject(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Stateless evaluator of opportunities against a portfolio snapshot.
#[derive(Debug, Clone, Default)]
pub struct RiskManager {
    limits: RiskLimits,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Full evaluation: capacity, loss budget, then the approval threshold.
    pub fn evaluate(
        &self,
        opportunity: &Opportunity,
        snapshot: &PortfolioSnapshot,
        now: DateTime<Utc>,
    ) -> RiskVerdict {
        let verdict = self.check(opportunity, snapshot, now, true);
        debug!(
            opportunity = %opportunity.id,
            market = %opportunity.market_id,
            notional = %opportunity.suggested_notional,
            outcome = ?verdict.outcome,
            cap = %verdict.limits.cap_amount,
            committed_loss = %verdict.limits.committed_loss,
            "Risk evaluated"
        );
        verdict
    }

    /// Capacity and loss rules only, for a trade an operator already approved.
    pub fn revalidate(
        &self,
        opportunity: &Opportunity,
        snapshot: &PortfolioSnapshot,
        now: DateTime<Utc>,
    ) -> RiskVerdict {
        self.check(opportunity, snapshot, now, false)
    }

    fn check(
        &self,
        opportunity: &Opportunity,
        snapshot: &PortfolioSnapshot,
        now: DateTime<Utc>,
        gate_on_threshold: bool,
    ) -> RiskVerdict {
        let notional = opportunity.suggested_notional;
        let cap_base = snapshot.available_capital();
        let limits = AppliedLimits {
            cap_base,
            cap_amount: cap_base * self.limits.single_trade_cap_pct,
            market_exposure: snapshot.market_exposure(&opportunity.market_id),
            committed_loss: snapshot.committed_loss(),
            worst_case_loss: opportunity.worst_case_loss(),
            daily_loss_limit: self.limits.daily_loss_limit,
            approval_threshold: self.limits.manual_approval_threshold,
        };

        let outcome = if notional <= Decimal::ZERO
            || opportunity.entry_price <= Decimal::ZERO
            || opportunity.entry_price >= Decimal::ONE
        {
            VerdictOutcome::Reject(RejectReason::InvalidOpportunity)
        } else if limits.market_exposure + notional > limits.cap_amount {
            VerdictOutcome::Reject(RejectReason::PositionTooLarge)
        } else if limits.committed_loss + limits.worst_case_loss > limits.daily_loss_limit {
            VerdictOutcome::Reject(RejectReason::DailyLossLimitExceeded)
        } else if gate_on_threshold && notional > limits.approval_threshold {
            VerdictOutcome::RequireApproval
        } else {
            VerdictOutcome::Admit
        };

        RiskVerdict {
            opportunity_id: opportunity.id.clone(),
            market_id: opportunity.market_id.clone(),
            notional,
            outcome,
            limits,
            evaluated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{OrderId, Side};
    use crate::portfolio::{Fill, PositionLedger, Reservation};
    use crate::strategy::test_opportunity;
    use rust_decimal_macros::dec;

    fn limits(cap: Decimal, daily: Decimal, threshold: Decimal) -> RiskLimits {
        RiskLimits {
            single_trade_cap_pct: cap,
            daily_loss_limit: daily,
            manual_approval_threshold: threshold,
        }
    }

    fn snapshot(equity: Decimal) -> PortfolioSnapshot {
        PositionLedger::new(equity, Utc::now()).snapshot(Utc::now())
    }

    #[test]
    fn test_small_trade_admitted() {
        let manager = RiskManager::default();
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(40));

        let verdict = manager.evaluate(&opp, &snapshot(dec!(1000)), Utc::now());
        assert_eq!(verdict.outcome, VerdictOutcome::Admit);
        assert_eq!(verdict.limits.cap_amount, dec!(50));
    }

    #[test]
    fn test_oversized_trade_rejected() {
        let manager = RiskManager::default();
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(60));

        let verdict = manager.evaluate(&opp, &snapshot(dec!(1000)), Utc::now());
        assert_eq!(verdict.reject_reason(), Some(RejectReason::PositionTooLarge));
    }

    #[test]
    fn test_daily_loss_budget_enforced() {
        // Lose 45 today, then try a trade risking 10 more.
        let now = Utc::now();
        let mut ledger = PositionLedger::new(dec!(1000), now);
        ledger
            .reserve(
                Reservation {
                    order_id: OrderId::from("o1"),
                    market_id: MarketId::from("m0"),
                    side: Side::Buy,
                    price: dec!(0.50),
                    quantity: dec!(90),
                },
                now,
            )
            .unwrap();
        ledger
            .apply_fill(&Fill {
                fill_id: "f1".into(),
                order_id: OrderId::from("o1"),
                market_id: MarketId::from("m0"),
                side: Side::Buy,
                price: dec!(0.50),
                quantity: dec!(90),
                at: now,
            })
            .unwrap();
        ledger.release(&OrderId::from("o1"));
        ledger.mark(&MarketId::from("m0"), Decimal::ZERO, now);

        let snap = ledger.snapshot(now);
        assert_eq!(snap.daily_loss, dec!(45));

        let manager = RiskManager::new(limits(dec!(0.05), dec!(50), dec!(100)));
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(10));
        let verdict = manager.evaluate(&opp, &snap, now);
        assert_eq!(verdict.reject_reason(), Some(RejectReason::DailyLossLimitExceeded));
        assert_eq!(verdict.limits.committed_loss + verdict.limits.worst_case_loss, dec!(55));
    }

    #[test]
    fn test_large_trade_requires_approval() {
        let manager = RiskManager::new(limits(dec!(0.05), dec!(500), dec!(100)));
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(150));

        let verdict = manager.evaluate(&opp, &snapshot(dec!(10000)), Utc::now());
        assert_eq!(verdict.outcome, VerdictOutcome::RequireApproval);

        // Approved trades are only re-checked against capacity and loss.
        let recheck = manager.revalidate(&opp, &snapshot(dec!(10000)), Utc::now());
        assert_eq!(recheck.outcome, VerdictOutcome::Admit);
        let shrunk = manager.revalidate(&opp, &snapshot(dec!(2000)), Utc::now());
        assert_eq!(shrunk.reject_reason(), Some(RejectReason::PositionTooLarge));
    }

    #[test]
    fn test_reservations_count_against_cap() {
        let now = Utc::now();
        let mut ledger = PositionLedger::new(dec!(1000), now);
        ledger
            .reserve(
                Reservation {
                    order_id: OrderId::from("o1"),
                    market_id: MarketId::from("m1"),
                    side: Side::Buy,
                    price: dec!(0.40),
                    quantity: dec!(75),
                },
                now,
            )
            .unwrap();

        // 30 reserved; cap is 5% of 970 = 48.5
        let manager = RiskManager::default();
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(20));
        let verdict = manager.evaluate(&opp, &ledger.snapshot(now), now);
        assert_eq!(verdict.reject_reason(), Some(RejectReason::PositionTooLarge));

        let elsewhere = test_opportunity("m2", Side::Buy, dec!(0.40), dec!(10));
        assert!(manager.evaluate(&elsewhere, &ledger.snapshot(now), now).is_admit());
    }

    #[test]
    fn test_sell_worst_case_uses_complement() {
        let manager = RiskManager::new(limits(dec!(0.05), dec!(5), dec!(100)));
        // 40 notional at 0.80 -> 50 shares, worst case 50 x 0.20 = 10
        let opp = test_opportunity("m1", Side::Sell, dec!(0.80), dec!(40));
        let verdict = manager.evaluate(&opp, &snapshot(dec!(1000)), Utc::now());
        assert_eq!(verdict.limits.worst_case_loss, dec!(10));
        assert_eq!(verdict.reject_reason(), Some(RejectReason::DailyLossLimitExceeded));
    }

    #[test]
    fn test_invalid_opportunity_rejected() {
        let manager = RiskManager::default();
        let opp = test_opportunity("m1", Side::Buy, dec!(1.20), dec!(10));
        let verdict = manager.evaluate(&opp, &snapshot(dec!(1000)), Utc::now());
        assert_eq!(verdict.reject_reason(), Some(RejectReason::InvalidOpportunity));
    }
}
