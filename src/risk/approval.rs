//! Manual approval gate for large trades.
//!
//! A request is `Pending` until an operator approves or denies it, or until
//! its deadline passes. Expiry is evaluated against the wall clock on every
//! access, and [`ApprovalGate::sweep`] persists it periodically. Each request
//! hands out an [`ApprovalTicket`] a task can wait on.

use super::manager::RiskVerdict;
use crate::error::TradingError;
use crate::exchange::ApprovalId;
use crate::strategy::Opportunity;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// Operator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    pub opportunity: Opportunity,
    pub verdict: RiskVerdict,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl ApprovalRequest {
    /// Status as of `now`, counting a passed deadline as expiry.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ApprovalStatus {
        if self.status == ApprovalStatus::Pending && now >= self.deadline {
            ApprovalStatus::Expired
        } else {
            self.status
        }
    }

    fn settle(&mut self, status: ApprovalStatus, at: DateTime<Utc>, note: Option<String>) {
        self.status = status;
        self.resolved_at = Some(at);
        self.note = note;
    }
}

/// Handle for a task suspended on a pending request.
#[derive(Debug)]
pub struct ApprovalTicket {
    pub id: ApprovalId,
    pub deadline: DateTime<Utc>,
    rx: watch::Receiver<ApprovalStatus>,
}

/// Outcome of a resolve, sweep or wait.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub request: ApprovalRequest,
    /// Whether this call moved the request out of `Pending`
    pub changed: bool,
}

struct Entry {
    request: ApprovalRequest,
    tx: watch::Sender<ApprovalStatus>,
}

impl Entry {
    fn new(request: ApprovalRequest) -> (Self, watch::Receiver<ApprovalStatus>) {
        let (tx, rx) = watch::channel(request.status);
        (Self { request, tx }, rx)
    }

    fn settle(&mut self, status: ApprovalStatus, at: DateTime<Utc>, note: Option<String>) {
        self.request.settle(status, at, note);
        // Receivers may have been dropped; the stored status is authoritative.
        let _ = self.tx.send(status);
    }

    fn expire_if_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.request.effective_status(now) == ApprovalStatus::Expired
            && self.request.status == ApprovalStatus::Pending
        {
            let deadline = self.request.deadline;
            self.settle(ApprovalStatus::Expired, deadline, Some("deadline passed".to_string()));
            true
        } else {
            false
        }
    }
}

/// Registry of approval requests.
pub struct ApprovalGate {
    timeout: Duration,
    entries: Mutex<HashMap<ApprovalId, Entry>>,
}

impl ApprovalGate {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Build a pending request without registering it.
    pub fn prepare(
        &self,
        opportunity: Opportunity,
        verdict: RiskVerdict,
        now: DateTime<Utc>,
    ) -> ApprovalRequest {
        ApprovalRequest {
            id: ApprovalId::generate(),
            opportunity,
            verdict,
            status: ApprovalStatus::Pending,
            created_at: now,
            deadline: now + self.timeout,
            resolved_at: None,
            note: None,
        }
    }

    /// Register a request and return a ticket for it.
    pub fn open(&self, request: ApprovalRequest) -> ApprovalTicket {
        let (entry, rx) = Entry::new(request.clone());
        info!(
            approval_id = %request.id,
            market = %request.opportunity.market_id,
            notional = %request.opportunity.suggested_notional,
            deadline = %request.deadline,
            "Approval requested"
        );
        self.entries.lock().insert(request.id.clone(), entry);
        ApprovalTicket {
            id: request.id,
            deadline: request.deadline,
            rx,
        }
    }

    /// Re-register a request reconstructed from the audit log.
    pub fn restore(&self, request: ApprovalRequest) -> Option<ApprovalTicket> {
        let (entry, rx) = Entry::new(request.clone());
        self.entries.lock().insert(request.id.clone(), entry);
        (request.status == ApprovalStatus::Pending).then(|| ApprovalTicket {
            id: request.id,
            deadline: request.deadline,
            rx,
        })
    }

    /// Apply an operator decision. Resolving a settled request returns it unchanged.
    pub fn resolve(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Resolution, TradingError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| TradingError::UnknownApproval(id.clone()))?;

        if entry.expire_if_due(now) {
            debug!(approval_id = %id, "Approval expired before decision");
            return Ok(Resolution {
                request: entry.request.clone(),
                changed: true,
            });
        }

        if entry.request.status.is_terminal() {
            return Ok(Resolution {
                request: entry.request.clone(),
                changed: false,
            });
        }

        let status = match decision {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Deny => ApprovalStatus::Denied,
        };
        entry.settle(status, now, note);
        info!(approval_id = %id, status = ?status, "Approval resolved");

        Ok(Resolution {
            request: entry.request.clone(),
            changed: true,
        })
    }

    /// Current view of a request with expiry applied.
    pub fn status(&self, id: &ApprovalId, now: DateTime<Utc>) -> Option<ApprovalRequest> {
        self.entries.lock().get(id).map(|entry| {
            let mut request = entry.request.clone();
            request.status = request.effective_status(now);
            request
        })
    }

    /// Persist expiry of every overdue request, returning the newly expired.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let mut entries = self.entries.lock();
        let mut expired: Vec<ApprovalRequest> = entries
            .values_mut()
            .filter_map(|entry| entry.expire_if_due(now).then(|| entry.request.clone()))
            .collect();
        expired.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        expired
    }

    /// Requests still awaiting a decision, oldest first.
    pub fn pending(&self, now: DateTime<Utc>) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .entries
            .lock()
            .values()
            .filter(|e| e.request.effective_status(now) == ApprovalStatus::Pending)
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Suspend until the request is decided or its deadline passes.
    pub async fn wait(&self, mut ticket: ApprovalTicket) -> Result<Resolution, TradingError> {
        let remaining = (ticket.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let decided = async {
            loop {
                if ticket.rx.borrow_and_update().is_terminal() {
                    break;
                }
                if ticket.rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let timed_out = tokio::time::timeout(remaining, decided).await.is_err();

        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&ticket.id)
            .ok_or_else(|| TradingError::UnknownApproval(ticket.id.clone()))?;
        // The timer fired at the deadline even if the wall clock lags slightly.
        let now = if timed_out {
            Utc::now().max(ticket.deadline)
        } else {
            Utc::now()
        };
        let changed = entry.expire_if_due(now);
        Ok(Resolution {
            request: entry.request.clone(),
            changed,
        })
    }
}
