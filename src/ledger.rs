//! Correlation ledger for outstanding requests.
//!
//! The ledger maps a request id to the mailbox its caller is blocked on. A
//! row is created just before the request is published and removed when the
//! send returns, so a reply arriving at any point in between finds its
//! caller. A background sweeper drops rows whose deadline has passed; it
//! never completes a mailbox itself — the caller's own bounded wait surfaces
//! the timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::entry::Entry;
use crate::error::SwitchboardError;
use crate::shutdown::StopSignal;

/// Value delivered into a caller's mailbox.
#[derive(Debug)]
pub enum Delivery {
    /// The reply entry read off the stream.
    Reply(Entry),

    /// The request failed locally before a reply arrived.
    Failed(SwitchboardError),
}

/// Receiving half of a ledger row's mailbox. Single-assignment: at most one
/// [`Delivery`] will ever arrive. A closed mailbox means the row expired;
/// callers treat that the same as their own timeout.
pub type Mailbox = oneshot::Receiver<Delivery>;

struct Row {
    expires_at: Instant,
    slot: Option<oneshot::Sender<Delivery>>,
}

/// Thread-safe map from request id to waiting mailbox.
pub struct Ledger {
    rows: Mutex<HashMap<String, Row>>,
    entry_timeout: Duration,
    cleanup_interval: Duration,
    stop: StopSignal,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Ledger {
    pub fn new(entry_timeout: Duration, cleanup_interval: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            entry_timeout,
            cleanup_interval,
            stop: StopSignal::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// The bounded-wait duration callers use for their mailbox.
    pub fn entry_timeout(&self) -> Duration {
        self.entry_timeout
    }

    /// Create a row for this entry and hand back the caller's mailbox.
    /// Fails if a request with the same id is already outstanding.
    pub fn store(&self, entry: &Entry) -> Result<Mailbox, SwitchboardError> {
        let mut rows = self.rows.lock().expect("ledger lock poisoned");
        if rows.contains_key(&entry.id) {
            return Err(SwitchboardError::DuplicateEntry(entry.id.clone()));
        }

        let (sender, receiver) = oneshot::channel();
        rows.insert(
            entry.id.clone(),
            Row {
                expires_at: Instant::now() + self.entry_timeout,
                slot: Some(sender),
            },
        );
        trace!(entry_id = %entry.id, "ledger row created");
        Ok(receiver)
    }

    /// True if a row exists for this id, expired or not.
    pub fn contains(&self, id: &str) -> bool {
        self.rows
            .lock()
            .expect("ledger lock poisoned")
            .contains_key(id)
    }

    /// True if no row exists or the row's deadline has passed.
    pub fn expired(&self, id: &str) -> bool {
        let rows = self.rows.lock().expect("ledger lock poisoned");
        match rows.get(id) {
            Some(row) => row.expires_at <= Instant::now(),
            None => true,
        }
    }

    /// Put a delivery in the mailbox for this id. Returns false when no row
    /// exists or the mailbox was already used; redundant replies land here
    /// and are dropped without touching any other state.
    pub fn deliver(&self, id: &str, delivery: Delivery) -> bool {
        let slot = {
            let mut rows = self.rows.lock().expect("ledger lock poisoned");
            rows.get_mut(id).and_then(|row| row.slot.take())
        };

        match slot {
            Some(sender) => {
                // A failed send means the caller already gave up waiting.
                let accepted = sender.send(delivery).is_ok();
                trace!(entry_id = %id, accepted, "delivered to mailbox");
                accepted
            }
            None => {
                trace!(entry_id = %id, "no open mailbox; delivery dropped");
                false
            }
        }
    }

    /// Remove the row for this id. Idempotent.
    pub fn delete(&self, id: &str) {
        self.rows.lock().expect("ledger lock poisoned").remove(id);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("ledger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the background sweeper. Expired rows are removed on each pass;
    /// their callers observe a closed mailbox, which send maps to a timeout.
    pub fn start_sweeper(self: &Arc<Self>) {
        let ledger = Arc::clone(self);
        let mut stop_rx = self.stop.subscribe();
        let interval = self.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => ledger.sweep(),
                }
            }
            debug!("ledger sweeper stopped");
        });

        *self.sweeper.lock().expect("sweeper lock poisoned") = Some(handle);
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop_sweeper(&self) {
        self.stop.trigger();
        let handle = self.sweeper.lock().expect("sweeper lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut rows = self.rows.lock().expect("ledger lock poisoned");
        let before = rows.len();
        rows.retain(|_, row| row.expires_at > now);
        let removed = before - rows.len();
        if removed > 0 {
            debug!(removed, "swept expired ledger rows");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ledger() -> Ledger {
        Ledger::new(Duration::from_millis(50), Duration::from_millis(10))
    }

    fn entry() -> Entry {
        Entry::request(json!("hi"), "a", "b", "inst01")
    }

    #[tokio::test]
    async fn test_store_and_deliver() {
        let ledger = ledger();
        let entry = entry();
        let mailbox = ledger.store(&entry).unwrap();

        assert!(ledger.contains(&entry.id));
        assert!(ledger.deliver(&entry.id, Delivery::Reply(entry.fulfilled(json!("ok")))));

        match mailbox.await.unwrap() {
            Delivery::Reply(reply) => assert_eq!(reply.id, entry.id),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_id() {
        let ledger = ledger();
        let entry = entry();
        let _mailbox = ledger.store(&entry).unwrap();

        match ledger.store(&entry) {
            Err(SwitchboardError::DuplicateEntry(id)) => assert_eq!(id, entry.id),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mailbox_is_single_assignment() {
        let ledger = ledger();
        let entry = entry();
        let _mailbox = ledger.store(&entry).unwrap();

        assert!(ledger.deliver(&entry.id, Delivery::Reply(entry.fulfilled(json!(1)))));
        // The redundant reply is dropped silently.
        assert!(!ledger.deliver(&entry.id, Delivery::Reply(entry.fulfilled(json!(2)))));
    }

    #[tokio::test]
    async fn test_deliver_unknown_id() {
        let ledger = ledger();
        assert!(!ledger.deliver("deadbeef", Delivery::Failed(SwitchboardError::NotConnected)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let ledger = ledger();
        let entry = entry();
        let _mailbox = ledger.store(&entry).unwrap();

        ledger.delete(&entry.id);
        ledger.delete(&entry.id);
        assert!(!ledger.contains(&entry.id));
    }

    #[tokio::test]
    async fn test_expired() {
        let ledger = Ledger::new(Duration::from_millis(5), Duration::from_secs(60));
        let entry = entry();
        let _mailbox = ledger.store(&entry).unwrap();

        assert!(!ledger.expired(&entry.id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(ledger.expired(&entry.id));
        assert!(ledger.expired("missing-id"));
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_rows() {
        let ledger = Arc::new(Ledger::new(
            Duration::from_millis(5),
            Duration::from_millis(5),
        ));
        let entry = entry();
        let _mailbox = ledger.store(&entry).unwrap();

        ledger.start_sweeper();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ledger.is_empty());

        ledger.stop_sweeper().await;
    }
}
