//! Ack-wait supervision for long-running message handlers.
//!
//! While a handler works on a delivery, a background task keeps telling
//! the broker the delivery is still in progress, every
//! `ack_wait - ack_threshold`. The task is stopped the moment the handler
//! returns, whatever it returned. The handler's result is passed through
//! untouched: deciding between ack and nak stays with the caller.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::adapter::Acknowledgements;

/// Never refresh more often than this, whatever the configuration says.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
pub struct AckWaitSupervisor {
    ack_wait: Duration,
    ack_threshold: Duration,
}

impl Default for AckWaitSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(5))
    }
}

impl AckWaitSupervisor {
    pub fn new(ack_wait: Duration, ack_threshold: Duration) -> Self {
        Self {
            ack_wait,
            ack_threshold,
        }
    }

    /// Time between two in-progress signals.
    pub fn interval(&self) -> Duration {
        self.ack_wait
            .saturating_sub(self.ack_threshold)
            .max(MIN_INTERVAL)
    }

    /// Run `handler` while keeping the delivery behind `acks` alive.
    pub async fn process<F, T>(&self, acks: &Acknowledgements, handler: F) -> T
    where
        F: Future<Output = T>,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let extender = tokio::spawn(extend_loop(acks.clone(), self.interval(), stop_rx));

        let output = handler.await;

        let _ = stop_tx.send(true);
        if let Err(e) = extender.await {
            warn!(error = %e, "ack-wait extender task failed");
        }
        output
    }
}

async fn extend_loop(acks: Acknowledgements, interval: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match acks.in_progress().await {
                    Ok(()) => debug!(?interval, "ack-wait extended"),
                    // Keep going: the next tick may reach the broker again.
                    Err(e) => warn!(error = %e, "failed to extend ack-wait"),
                }
            }
            _ = stop.changed() => break,
        }
    }
}
