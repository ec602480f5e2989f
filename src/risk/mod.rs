//! Risk management for prediction-market trading.
//!
//! - `RiskManager`: stateless pre-trade policy (capacity, daily loss, approval threshold)
//! - `ApprovalGate`: manual approval requests with deadlines

mod approval;
mod manager;

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, ApprovalStatus, ApprovalTicket, Resolution,
};
pub use manager::{
    AppliedLimits, RejectReason, RiskLimits, RiskManager, RiskVerdict, VerdictOutcome,
};
