//! Stop coordination for periodic tasks.
//!
//! Workers, dispatchers, and the ledger sweeper each run a spawned loop; a
//! [`StopSignal`] tells that loop to finish its current tick and exit. Every
//! component owns its own signal so the coordinator can stop dispatchers
//! before workers during disconnect.

use tokio::sync::broadcast;
use tracing::debug;

/// A broadcast-based stop signal for one periodic task.
#[derive(Clone)]
pub struct StopSignal {
    sender: broadcast::Sender<()>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { sender }
    }

    /// Tell the task to stop after its current tick.
    pub fn trigger(&self) {
        debug!("stop signal triggered");
        let _ = self.sender.send(());
    }

    /// Subscribe to stop notifications. Must be called before the task's
    /// loop starts so a trigger between ticks is not missed.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_reaches_subscriber() {
        let signal = StopSignal::new();
        let mut receiver = signal.subscribe();

        let trigger = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.trigger();
        });

        let result = tokio::time::timeout(Duration::from_millis(100), receiver.recv()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_all_subscribers_notified() {
        let signal = StopSignal::new();
        let mut first = signal.subscribe();
        let mut second = signal.subscribe();

        signal.trigger();

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }
}
