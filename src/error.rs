//! Error taxonomy for the trading core.
//!
//! Adapter boundaries report [`FeedError`] and [`VenueError`]; everything the
//! pipeline surfaces to its callers is a [`TradingError`].

use crate::exchange::{ApprovalId, OrderId};
use crate::risk::RejectReason;
use thiserror::Error;

/// Failure fetching market data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode market data: {0}")]
    Decode(String),
}

impl FeedError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FeedError::Transport(_) => true,
            FeedError::Status { status, .. } => *status == 429 || *status >= 500,
            FeedError::Decode(_) => false,
        }
    }
}

/// Failure talking to the order venue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VenueError {
    /// The request may or may not have reached the venue.
    #[error("venue transport failure: {0}")]
    Transport(String),

    #[error("order rejected by venue: {0}")]
    Rejected(String),

    #[error("order not found: {0}")]
    NotFound(String),

    #[error("order already filled: {0}")]
    AlreadyFilled(String),

    #[error("unexpected venue response: {0}")]
    Protocol(String),
}

impl VenueError {
    /// Acknowledgment state unknown, reconciliation required before any retry.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, VenueError::Transport(_) | VenueError::Protocol(_))
    }
}

/// Errors surfaced by the trading pipeline.
#[derive(Error, Debug)]
pub enum TradingError {
    #[error("market data unavailable after {attempts} attempts: {source}")]
    TransientFeed {
        attempts: u32,
        #[source]
        source: FeedError,
    },

    #[error("venue rejected order {order_id}: {reason}")]
    VenueRejection { order_id: OrderId, reason: String },

    #[error("submission of order {order_id} is ambiguous: {reason}")]
    SubmissionAmbiguous { order_id: OrderId, reason: String },

    #[error("risk violation: {0}")]
    RiskViolation(RejectReason),

    #[error("approval {0} expired")]
    ApprovalExpired(ApprovalId),

    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("unknown approval request {0}")]
    UnknownApproval(ApprovalId),

    #[error("invalid order transition for {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: String,
        to: String,
    },

    #[error("order not authorized: {0}")]
    Unauthorized(String),

    #[error("trading halted: {0}")]
    Halted(String),

    #[error("audit log failure: {0:#}")]
    Audit(#[from] anyhow::Error),
}

impl TradingError {
    /// Whether this error must stop all further trading.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TradingError::LedgerInconsistency(_) | TradingError::Audit(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_error_transience() {
        assert!(FeedError::Transport("timeout".into()).is_transient());
        assert!(FeedError::Status { status: 503, body: String::new() }.is_transient());
        assert!(FeedError::Status { status: 429, body: String::new() }.is_transient());
        assert!(!FeedError::Status { status: 404, body: String::new() }.is_transient());
        assert!(!FeedError::Decode("bad json".into()).is_transient());
    }

    #[test]
    fn test_venue_error_ambiguity() {
        assert!(VenueError::Transport("reset".into()).is_ambiguous());
        assert!(VenueError::Protocol("truncated body".into()).is_ambiguous());
        assert!(!VenueError::Rejected("no liquidity".into()).is_ambiguous());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(TradingError::LedgerInconsistency("cash below zero".into()).is_fatal());
        assert!(!TradingError::RiskViolation(RejectReason::PositionTooLarge).is_fatal());
    }
}
