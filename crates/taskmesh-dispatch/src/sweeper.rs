use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::dispatcher::TaskDispatcher;

/// Periodically expires overdue tasks until shutdown is signalled.
pub struct ExpirySweeper {
    dispatcher: Arc<TaskDispatcher>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl ExpirySweeper {
    pub fn new(dispatcher: Arc<TaskDispatcher>, shutdown_rx: watch::Receiver<bool>) -> Self {
        let interval = dispatcher.config().sweep_interval();
        Self {
            dispatcher,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.dispatcher.sweep_expired(Utc::now()).await;
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "expired overdue tasks");
                    }
                }
                Ok(()) = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        tracing::info!("Expiry sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
