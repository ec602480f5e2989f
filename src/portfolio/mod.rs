//! Positions, cash, reservations and the daily loss counter.

mod ledger;

pub use ledger::{
    worst_case_loss, Fill, PortfolioSnapshot, Position, PositionLedger, Reservation,
};
