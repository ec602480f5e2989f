//! Cancellable periodic tasks.
//!
//! Every task watches the same shutdown channel and stops at its next await
//! point once shutdown is signalled.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// A receiver that flips to `true` on shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Run `task` every `period`, first tick immediately.
    pub fn every<F, Fut>(&mut self, name: &'static str, period: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => task().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(task = name, "Periodic task stopped");
        });
        info!(task = name, period_ms = period.as_millis() as u64, "Periodic task started");
        self.tasks.push((name, handle));
    }

    /// Run `task` after `initial`, then after whatever delay it returns.
    pub fn dynamic<F, Fut>(&mut self, name: &'static str, initial: Duration, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Duration> + Send,
    {
        let mut shutdown = self.shutdown_signal();
        let handle = tokio::spawn(async move {
            let mut delay = initial;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => delay = task().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(task = name, "Task stopped");
        });
        info!(task = name, "Task started");
        self.tasks.push((name, handle));
    }

    /// Run `task` at every UTC midnight.
    pub fn daily<F, Fut>(&mut self, name: &'static str, mut task: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.dynamic(name, until_next_midnight(Utc::now()), move || {
            let run = task();
            async move {
                run.await;
                until_next_midnight(Utc::now())
            }
        });
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "Task ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Time left until the next UTC day boundary.
pub fn until_next_midnight(now: DateTime<Utc>) -> Duration {
    let next = (now.date_naive() + ChronoDuration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now);
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
