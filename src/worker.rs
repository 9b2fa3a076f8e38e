//! Worker: the consumer side of a group.
//!
//! Each worker owns one named consumer and a periodic task draining that
//! consumer's pending-entry list — the entries a dispatcher claimed over to
//! it. A tick reads at most one entry, classifies it, routes it to the
//! waiting caller's mailbox or to the user's request handler, and finalizes
//! it with ack plus delete. Handler failures are reported through the error
//! callback and answered with a rejected reply so the remote caller does not
//! have to wait out its timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commands::Commands;
use crate::entry::{Entry, Status};
use crate::error::SwitchboardError;
use crate::ledger::{Delivery, Ledger};
use crate::shutdown::StopSignal;
use crate::switchboard::Switchboard;

/// Lifecycle of a periodic task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// What a tick decided to do with an entry.
#[derive(Debug, PartialEq, Eq)]
enum Classification {
    /// Not addressed to this group; purge it.
    Invalid,

    /// A caller in this process is waiting on it.
    Reply,

    /// Unanswered request for this group's handler.
    Request,

    /// Terminal status but nobody waiting; a redundant or expired reply.
    Stale,
}

// Status is decisive before the ledger: a pending entry is always a request,
// even when the sender's ledger holds the id — a self-send within one group
// routes the request through the sender's own workers, and only the terminal
// reply belongs in the mailbox.
fn classify(entry: &Entry, group: &str, in_ledger: bool) -> Classification {
    if entry.destination_group != group {
        return Classification::Invalid;
    }
    if entry.status == Status::Pending {
        return Classification::Request;
    }
    if in_ledger {
        Classification::Reply
    } else {
        Classification::Stale
    }
}

pub struct Worker {
    name: String,
    group: String,
    instance_id: String,
    interval: Duration,
    commands: Arc<Commands>,
    ledger: Arc<Ledger>,
    stop: StopSignal,
    state: Mutex<TaskState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        instance_id: impl Into<String>,
        interval: Duration,
        commands: Arc<Commands>,
        ledger: Arc<Ledger>,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            instance_id: instance_id.into(),
            interval,
            commands,
            ledger,
            stop: StopSignal::new(),
            state: Mutex::new(TaskState::Idle),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().expect("worker state lock poisoned")
    }

    /// Register the consumer, join the instance's availability list, and
    /// start ticking.
    pub async fn listen(&self, board: Switchboard) -> Result<(), SwitchboardError> {
        {
            let state = self.state.lock().expect("worker state lock poisoned");
            if matches!(*state, TaskState::Running | TaskState::Stopping) {
                return Err(SwitchboardError::Configuration(format!(
                    "worker '{}' is already listening",
                    self.name
                )));
            }
        }

        self.commands.create_consumer(&self.name).await?;
        self.commands
            .make_consumer_available(&self.instance_id, &self.name)
            .await?;

        let mut stop_rx = self.stop.subscribe();
        let commands = Arc::clone(&self.commands);
        let ledger = Arc::clone(&self.ledger);
        let name = self.name.clone();
        let group = self.group.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        tick(&board, &commands, &ledger, &name, &group).await;
                    }
                }
            }
            debug!(worker = %name, "worker stopped");
        });

        *self.state.lock().expect("worker state lock poisoned") = TaskState::Running;
        *self.task.lock().expect("worker task lock poisoned") = Some(handle);
        debug!(worker = %self.name, "worker listening");
        Ok(())
    }

    /// Stop ticking and leave the availability list.
    pub async fn stop_listening(&self) -> Result<(), SwitchboardError> {
        {
            let mut state = self.state.lock().expect("worker state lock poisoned");
            if *state != TaskState::Running {
                return Ok(());
            }
            *state = TaskState::Stopping;
        }

        self.stop.trigger();
        let handle = self.task.lock().expect("worker task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.commands
            .make_consumer_unavailable(&self.instance_id, &self.name)
            .await?;

        *self.state.lock().expect("worker state lock poisoned") = TaskState::Stopped;
        Ok(())
    }
}

/// One iteration: read, classify, act, finalize. Errors never escape a tick;
/// they go to the error callback and the entry is purged so it cannot wedge
/// the pending list.
async fn tick(
    board: &Switchboard,
    commands: &Arc<Commands>,
    ledger: &Arc<Ledger>,
    name: &str,
    group: &str,
) {
    let entry = match commands.next_pending_entry(name).await {
        Ok(Some(entry)) => entry,
        Ok(None) => return,
        Err(e) => {
            board.notify_error(&e).await;
            return;
        }
    };

    if let Err(e) = process_entry(board, commands, ledger, group, &entry).await {
        board.notify_error(&e).await;
        if let Err(finalize_err) = finalize(commands, &entry).await {
            warn!(
                entry_id = %entry.id,
                error = %finalize_err,
                "failed to finalize entry after error"
            );
        }
    }
}

async fn process_entry(
    board: &Switchboard,
    commands: &Arc<Commands>,
    ledger: &Arc<Ledger>,
    group: &str,
    entry: &Entry,
) -> Result<(), SwitchboardError> {
    match classify(entry, group, ledger.contains(&entry.id)) {
        Classification::Invalid => {
            warn!(
                entry_id = %entry.id,
                destination = %entry.destination_group,
                "dropping entry not addressed to this group"
            );
            // Ack out of this PEL only; the entry stays in the stream for
            // its own group's consumers.
            return commands.acknowledge_entry(entry).await;
        }
        Classification::Reply => {
            ledger.deliver(&entry.id, Delivery::Reply(entry.clone()));
        }
        Classification::Request => {
            let handler = board.request_handler()?;
            if let Err(e) = handler.call(board, entry.clone()).await {
                board.notify_error(&e).await;
                // Answer anyway; the remote caller should see the failure
                // rather than wait out its timeout.
                board
                    .reject_request(entry, Value::String(e.to_string()))
                    .await?;
            }
        }
        Classification::Stale => {
            debug!(entry_id = %entry.id, "dropping reply nobody is waiting on");
        }
    }

    finalize(commands, entry).await
}

async fn finalize(commands: &Arc<Commands>, entry: &Entry) -> Result<(), SwitchboardError> {
    commands.acknowledge_entry(entry).await?;
    commands.delete_entry(entry).await
}
