//! Rebuild trading state from the audit log.

use super::{verify_chain, AuditEvent, AuditRecord};
use crate::error::TradingError;
use crate::exchange::ApprovalId;
use crate::portfolio::PositionLedger;
use crate::risk::ApprovalRequest;
use crate::strategy::TradingState;
use std::collections::BTreeMap;
use tracing::info;

/// Everything recoverable from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayState {
    pub state: TradingState,
    /// Approval requests in creation order
    pub approvals: Vec<ApprovalRequest>,
    pub paused: bool,
    pub halted: Option<String>,
    pub last_sequence: u64,
}

/// Replay `records` from empty state. `Ok(None)` for an empty log.
pub fn replay(records: &[AuditRecord]) -> Result<Option<ReplayState>, TradingError> {
    verify_chain(records)?;

    let mut state: Option<TradingState> = None;
    let mut approvals: BTreeMap<ApprovalId, ApprovalRequest> = BTreeMap::new();
    let mut paused = false;
    let mut halted = None;

    for record in records {
        let event = record.event()?;
        match &event {
            AuditEvent::LedgerOpened { starting_cash, at } => {
                if state.is_some() {
                    return Err(TradingError::LedgerInconsistency(format!(
                        "ledger reopened at record {}",
                        record.sequence
                    )));
                }
                state = Some(TradingState::new(PositionLedger::new(*starting_cash, *at)));
                continue;
            }
            AuditEvent::ApprovalRequested { request } => {
                approvals.insert(request.id.clone(), request.clone());
            }
            AuditEvent::ApprovalResolved {
                approval_id,
                status,
                at,
                note,
            } => {
                let request = approvals.get_mut(approval_id).ok_or_else(|| {
                    TradingError::LedgerInconsistency(format!(
                        "record {} resolves unknown approval {}",
                        record.sequence, approval_id
                    ))
                })?;
                request.status = *status;
                request.resolved_at = Some(*at);
                request.note = note.clone();
            }
            AuditEvent::TradingPaused { .. } => paused = true,
            AuditEvent::TradingResumed { .. } => paused = false,
            AuditEvent::TradingHalted { reason, .. } => halted = Some(reason.clone()),
            AuditEvent::HaltCleared { .. } => halted = None,
            _ => {}
        }

        let current = state.as_mut().ok_or_else(|| {
            TradingError::LedgerInconsistency(format!(
                "record {} precedes the ledger opening",
                record.sequence
            ))
        })?;
        current.apply(&event).map_err(|e| {
            TradingError::LedgerInconsistency(format!(
                "replay failed at record {}: {}",
                record.sequence, e
            ))
        })?;
    }

    let Some(state) = state else {
        return Ok(None);
    };

    let mut approvals: Vec<ApprovalRequest> = approvals.into_values().collect();
    approvals.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let last_sequence = records.last().map(|r| r.sequence).unwrap_or(0);
    info!(
        records = last_sequence,
        orders = state.orders.len(),
        approvals = approvals.len(),
        cash = %state.ledger.cash(),
        "Audit log replayed"
    );

    Ok(Some(ReplayState {
        state,
        approvals,
        paused,
        halted,
        last_sequence,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::risk::{ApprovalGate, ApprovalStatus, RiskManager};
    use crate::strategy::test_opportunity;
    use crate::exchange::Side;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    #[test]
    fn test_empty_log_replays_to_nothing() {
        assert!(replay(&[]).unwrap().is_none());
    }

    #[test]
    fn test_record_before_opening_is_inconsistent() {
        let log = AuditLog::in_memory();
        log.append(&AuditEvent::TradingPaused { at: Utc::now() }).unwrap();
        let err = replay(&log.records().unwrap()).unwrap_err();
        assert!(matches!(err, TradingError::LedgerInconsistency(_)));
    }

    #[test]
    fn test_approvals_and_control_flags() {
        let log = AuditLog::in_memory();
        let now = Utc::now();
        log.append(&AuditEvent::LedgerOpened {
            starting_cash: dec!(1000),
            at: now,
        })
        .unwrap();

        let gate = ApprovalGate::new(Duration::minutes(15));
        let opp = test_opportunity("m1", Side::Buy, dec!(0.40), dec!(150));
        let verdict = RiskManager::default().evaluate(
            &opp,
            &PositionLedger::new(dec!(1000), now).snapshot(now),
            now,
        );
        let request = gate.prepare(opp, verdict, now);
        log.append(&AuditEvent::ApprovalRequested {
            request: request.clone(),
        })
        .unwrap();
        log.append(&AuditEvent::ApprovalResolved {
            approval_id: request.id.clone(),
            status: ApprovalStatus::Denied,
            at: now,
            note: Some("too large".into()),
        })
        .unwrap();
        log.append(&AuditEvent::TradingPaused { at: now }).unwrap();
        log.append(&AuditEvent::TradingHalted {
            reason: "operator test".into(),
            at: now,
        })
        .unwrap();

        let replayed = replay(&log.records().unwrap()).unwrap().unwrap();
        assert_eq!(replayed.approvals.len(), 1);
        assert_eq!(replayed.approvals[0].status, ApprovalStatus::Denied);
        assert_eq!(replayed.approvals[0].note.as_deref(), Some("too large"));
        assert!(replayed.paused);
        assert_eq!(replayed.halted.as_deref(), Some("operator test"));
        assert_eq!(replayed.last_sequence, 5);
        assert_eq!(replayed.state.ledger.cash(), dec!(1000));
    }
}
