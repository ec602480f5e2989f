//! Append-only, hash-chained audit log.
//!
//! Every decision the pipeline takes is written here before it has any
//! external effect. Records carry a contiguous sequence number and the
//! SHA-256 of their predecessor, so any edit or gap is detectable by
//! [`verify_chain`]. Replaying the log from empty state reproduces the ledger,
//! the orders and the approval requests (see [`replay`]).

mod replay;

pub use replay::{replay, ReplayState};

use crate::error::TradingError;
use crate::exchange::{ApprovalId, MarketId, OrderId};
use crate::persistence::{AuditStore, MemoryAuditStore};
use crate::portfolio::Fill;
use crate::risk::{ApprovalRequest, ApprovalStatus, RiskVerdict};
use crate::strategy::{Opportunity, Order, OrderStatus};
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// Previous-hash value of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Everything that is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    LedgerOpened {
        starting_cash: Decimal,
        at: DateTime<Utc>,
    },
    RiskEvaluated {
        opportunity: Opportunity,
        verdict: RiskVerdict,
    },
    ApprovalRequested {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        approval_id: ApprovalId,
        status: ApprovalStatus,
        at: DateTime<Utc>,
        note: Option<String>,
    },
    /// An order moved to Submitted and its capacity was reserved.
    OrderSubmitting {
        order: Order,
    },
    OrderAcknowledged {
        order_id: OrderId,
        external_id: String,
        at: DateTime<Utc>,
    },
    FillApplied {
        fill: Fill,
    },
    /// Terminal state; any remaining reservation is released.
    OrderClosed {
        order_id: OrderId,
        status: OrderStatus,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    /// Submission outcome unknown; the reservation is kept.
    OrderAmbiguous {
        order_id: OrderId,
        reason: String,
        at: DateTime<Utc>,
    },
    MarksUpdated {
        marks: BTreeMap<MarketId, Decimal>,
        at: DateTime<Utc>,
    },
    TradingPaused {
        at: DateTime<Utc>,
    },
    TradingResumed {
        at: DateTime<Utc>,
    },
    TradingHalted {
        reason: String,
        at: DateTime<Utc>,
    },
    HaltCleared {
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::LedgerOpened { .. } => "ledger_opened",
            AuditEvent::RiskEvaluated { .. } => "risk_evaluated",
            AuditEvent::ApprovalRequested { .. } => "approval_requested",
            AuditEvent::ApprovalResolved { .. } => "approval_resolved",
            AuditEvent::OrderSubmitting { .. } => "order_submitting",
            AuditEvent::OrderAcknowledged { .. } => "order_acknowledged",
            AuditEvent::FillApplied { .. } => "fill_applied",
            AuditEvent::OrderClosed { .. } => "order_closed",
            AuditEvent::OrderAmbiguous { .. } => "order_ambiguous",
            AuditEvent::MarksUpdated { .. } => "marks_updated",
            AuditEvent::TradingPaused { .. } => "trading_paused",
            AuditEvent::TradingResumed { .. } => "trading_resumed",
            AuditEvent::TradingHalted { .. } => "trading_halted",
            AuditEvent::HaltCleared { .. } => "halt_cleared",
        }
    }
}

/// One stored entry of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub kind: String,
    /// JSON encoding of the [`AuditEvent`]
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

impl AuditRecord {
    /// Build the record for `event` following a record whose hash is `prev_hash`.
    pub fn chain(
        sequence: u64,
        event: &AuditEvent,
        recorded_at: DateTime<Utc>,
        prev_hash: &str,
    ) -> anyhow::Result<Self> {
        let payload = serde_json::to_string(event)
            .with_context(|| format!("Failed to encode {} event", event.kind()))?;
        let kind = event.kind().to_string();
        let hash = record_hash(sequence, &kind, &payload, recorded_at, prev_hash);
        Ok(Self {
            sequence,
            kind,
            payload,
            recorded_at,
            prev_hash: prev_hash.to_string(),
            hash,
        })
    }

    /// Decode the payload.
    pub fn event(&self) -> anyhow::Result<AuditEvent> {
        serde_json::from_str(&self.payload)
            .with_context(|| format!("Failed to decode audit record {}", self.sequence))
    }

    fn expected_hash(&self) -> String {
        record_hash(
            self.sequence,
            &self.kind,
            &self.payload,
            self.recorded_at,
            &self.prev_hash,
        )
    }
}

fn record_hash(
    sequence: u64,
    kind: &str,
    payload: &str,
    recorded_at: DateTime<Utc>,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sequence.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.as_bytes());
    hasher.update(b"|");
    hasher.update(
        recorded_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update(b"|");
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check contiguity and the hash chain. Returns the number of records.
pub fn verify_chain(records: &[AuditRecord]) -> Result<u64, TradingError> {
    let mut prev_hash = GENESIS_HASH;
    for (index, record) in records.iter().enumerate() {
        let expected_sequence = index as u64 + 1;
        if record.sequence != expected_sequence {
            return Err(TradingError::LedgerInconsistency(format!(
                "audit sequence gap: expected {}, found {}",
                expected_sequence, record.sequence
            )));
        }
        if record.prev_hash != prev_hash {
            return Err(TradingError::LedgerInconsistency(format!(
                "audit record {} does not chain to its predecessor",
                record.sequence
            )));
        }
        if record.hash != record.expected_hash() {
            return Err(TradingError::LedgerInconsistency(format!(
                "audit record {} hash mismatch",
                record.sequence
            )));
        }
        prev_hash = record.hash.as_str();
    }
    Ok(records.len() as u64)
}

struct LogState {
    store: Box<dyn AuditStore>,
    next_sequence: u64,
    last_hash: String,
}

/// The audit log. Appends are serialized; each returns its sequence number.
pub struct AuditLog {
    state: Mutex<LogState>,
}

impl AuditLog {
    /// Open a log over `store`, refusing a store whose chain is broken.
    pub fn open(store: Box<dyn AuditStore>) -> Result<Self, TradingError> {
        let records = store.load_all()?;
        let count = verify_chain(&records).map_err(|e| {
            error!(error = %e, "Audit chain verification failed");
            e
        })?;
        let last_hash = records
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());

        info!(records = count, "Audit log opened");
        Ok(Self {
            state: Mutex::new(LogState {
                store,
                next_sequence: count + 1,
                last_hash,
            }),
        })
    }

    /// Volatile log, for paper sessions and tests.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LogState {
                store: Box::new(MemoryAuditStore::new()),
                next_sequence: 1,
                last_hash: GENESIS_HASH.to_string(),
            }),
        }
    }

    /// Persist `event` and return its sequence number.
    pub fn append(&self, event: &AuditEvent) -> Result<u64, TradingError> {
        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        let record = AuditRecord::chain(sequence, event, Utc::now(), &state.last_hash)?;
        state.store.append(&record)?;

        state.next_sequence = sequence + 1;
        state.last_hash = record.hash;
        debug!(sequence, kind = event.kind(), "Audit record appended");
        Ok(sequence)
    }

    /// Sequence of the most recent record, 0 when empty.
    pub fn last_sequence(&self) -> u64 {
        self.state.lock().next_sequence - 1
    }

    pub fn records(&self) -> anyhow::Result<Vec<AuditRecord>> {
        self.state.lock().store.load_all()
    }

    /// Re-read the store and check the whole chain.
    pub fn verify(&self) -> Result<u64, TradingError> {
        let records = self.records()?;
        verify_chain(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_log() -> AuditLog {
        let log = AuditLog::in_memory();
        let at = Utc::now();
        log.append(&AuditEvent::LedgerOpened {
            starting_cash: dec!(1000),
            at,
        })
        .unwrap();
        log.append(&AuditEvent::TradingPaused { at }).unwrap();
        log.append(&AuditEvent::TradingResumed { at }).unwrap();
        log
    }

    #[test]
    fn test_sequences_are_contiguous() {
        let log = sample_log();
        let records = log.records().unwrap();

        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(records[0].prev_hash, GENESIS_HASH);
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(records[1].kind, "trading_paused");
        assert_eq!(log.last_sequence(), 3);
        assert_eq!(log.verify().unwrap(), 3);
    }

    #[test]
    fn test_payload_round_trips() {
        let log = sample_log();
        let records = log.records().unwrap();
        assert!(matches!(
            records[0].event().unwrap(),
            AuditEvent::LedgerOpened { starting_cash, .. } if starting_cash == dec!(1000)
        ));
    }

    #[test]
    fn test_tampered_payload_detected() {
        let mut records = sample_log().records().unwrap();
        records[1].payload = records[1].payload.replace("trading_paused", "trading_resumed");

        let err = verify_chain(&records).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("record 2"));
    }

    #[test]
    fn test_gap_detected() {
        let mut records = sample_log().records().unwrap();
        records.remove(1);
        assert!(verify_chain(&records).is_err());
    }

    #[test]
    fn test_open_refuses_broken_chain() {
        let mut records = sample_log().records().unwrap();
        records[2].prev_hash = GENESIS_HASH.to_string();

        let mut store = MemoryAuditStore::new();
        for record in &records {
            store.append(record).unwrap();
        }
        let err = AuditLog::open(Box::new(store)).err().unwrap();
        assert!(matches!(err, TradingError::LedgerInconsistency(_)));
    }

    #[test]
    fn test_open_continues_existing_chain() {
        let records = sample_log().records().unwrap();
        let mut store = MemoryAuditStore::new();
        for record in &records {
            store.append(record).unwrap();
        }

        let log = AuditLog::open(Box::new(store)).unwrap();
        let seq = log.append(&AuditEvent::HaltCleared { at: Utc::now() }).unwrap();
        assert_eq!(seq, 4);
        assert_eq!(log.verify().unwrap(), 4);
    }
}
