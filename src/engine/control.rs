//! Admission control: operator pause and fatal halt.
//!
//! Pausing stops new admissions while in-flight orders keep syncing. A halt
//! is raised on a fatal error and stays until an operator clears it.

use crate::error::TradingError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct TradingControl {
    paused: AtomicBool,
    halt_reason: Mutex<Option<String>>,
}

impl TradingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if already paused.
    pub fn pause(&self) -> bool {
        let changed = !self.paused.swap(true, Ordering::SeqCst);
        if changed {
            info!("Trading paused");
        }
        changed
    }

    /// Returns false if not paused.
    pub fn resume(&self) -> bool {
        let changed = self.paused.swap(false, Ordering::SeqCst);
        if changed {
            info!("Trading resumed");
        }
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Record a halt. The first reason is kept; returns false if already halted.
    pub fn halt(&self, reason: impl Into<String>) -> bool {
        let mut halt = self.halt_reason.lock();
        if halt.is_some() {
            return false;
        }
        let reason = reason.into();
        error!(%reason, "Trading halted");
        *halt = Some(reason);
        true
    }

    /// Returns the reason that was cleared.
    pub fn clear_halt(&self) -> Option<String> {
        let cleared = self.halt_reason.lock().take();
        if let Some(reason) = &cleared {
            warn!(%reason, "Halt cleared by operator");
        }
        cleared
    }

    pub fn halt_reason(&self) -> Option<String> {
        self.halt_reason.lock().clone()
    }

    pub fn admissions_open(&self) -> bool {
        !self.is_paused() && self.halt_reason.lock().is_none()
    }

    /// Fail unless new admissions are allowed.
    pub fn check(&self) -> Result<(), TradingError> {
        if let Some(reason) = self.halt_reason() {
            return Err(TradingError::Halted(reason));
        }
        if self.is_paused() {
            return Err(TradingError::Halted("paused by operator".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_and_resume() {
        let control = TradingControl::new();
        assert!(control.check().is_ok());
        assert!(control.pause());
        assert!(!control.pause());
        assert!(matches!(control.check(), Err(TradingError::Halted(_))));
        assert!(control.resume());
        assert!(control.admissions_open());
    }

    #[test]
    fn test_halt_keeps_first_reason() {
        let control = TradingControl::new();
        assert!(control.halt("ledger mismatch"));
        assert!(!control.halt("second failure"));
        assert_eq!(control.halt_reason().as_deref(), Some("ledger mismatch"));

        assert_eq!(control.clear_halt().as_deref(), Some("ledger mismatch"));
        assert!(control.clear_halt().is_none());
        assert!(control.admissions_open());
    }
}
