//! Dispatcher: routes stream entries to workers.
//!
//! A dispatcher is a specialized consumer that never services entries
//! itself. Each tick it tries three reads in order — reclaimed entries idle
//! past the threshold, unread entries, then its own pending list — and hands
//! the first hit to the least-busy worker of the target instance by claiming
//! the entry into that worker's pending list. Requests target the
//! dispatcher's own instance; replies target the instance recorded in the
//! entry. Consumer-group semantics guarantee each unread entry reaches
//! exactly one dispatcher of the group.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::commands::{Commands, ConsumerStats};
use crate::entry::{Entry, Status};
use crate::error::SwitchboardError;
use crate::shutdown::StopSignal;
use crate::worker::TaskState;

pub struct Dispatcher {
    name: String,
    group: String,
    instance_id: String,
    interval: Duration,
    min_idle: Duration,
    commands: Arc<Commands>,
    stop: StopSignal,
    state: Mutex<TaskState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        name: impl Into<String>,
        group: impl Into<String>,
        instance_id: impl Into<String>,
        interval: Duration,
        min_idle: Duration,
        commands: Arc<Commands>,
    ) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            instance_id: instance_id.into(),
            interval,
            min_idle,
            commands,
            stop: StopSignal::new(),
            state: Mutex::new(TaskState::Idle),
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().expect("dispatcher state lock poisoned")
    }

    /// Register the consumer and start ticking. Refuses to start while the
    /// instance has no available workers: entries would be read off the
    /// stream with nowhere to go.
    pub async fn listen(&self) -> Result<(), SwitchboardError> {
        {
            let state = self.state.lock().expect("dispatcher state lock poisoned");
            if matches!(*state, TaskState::Running | TaskState::Stopping) {
                return Err(SwitchboardError::Configuration(format!(
                    "dispatcher '{}' is already listening",
                    self.name
                )));
            }
        }

        let available = self
            .commands
            .available_consumer_names(&self.instance_id)
            .await?;
        if available.is_empty() {
            return Err(SwitchboardError::Configuration(format!(
                "dispatcher '{}' cannot start: no workers are available in instance '{}'",
                self.name, self.instance_id
            )));
        }

        self.commands.create_consumer(&self.name).await?;

        let mut stop_rx = self.stop.subscribe();
        let commands = Arc::clone(&self.commands);
        let name = self.name.clone();
        let group = self.group.clone();
        let instance_id = self.instance_id.clone();
        let interval = self.interval;
        let min_idle = self.min_idle;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) =
                            tick(&commands, &name, &group, &instance_id, min_idle).await
                        {
                            warn!(dispatcher = %name, error = %e, "dispatch tick failed");
                        }
                    }
                }
            }
            debug!(dispatcher = %name, "dispatcher stopped");
        });

        *self.state.lock().expect("dispatcher state lock poisoned") = TaskState::Running;
        *self.task.lock().expect("dispatcher task lock poisoned") = Some(handle);
        debug!(dispatcher = %self.name, "dispatcher listening");
        Ok(())
    }

    pub async fn stop_listening(&self) -> Result<(), SwitchboardError> {
        {
            let mut state = self.state.lock().expect("dispatcher state lock poisoned");
            if *state != TaskState::Running {
                return Ok(());
            }
            *state = TaskState::Stopping;
        }

        self.stop.trigger();
        let handle = self
            .task
            .lock()
            .expect("dispatcher task lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        *self.state.lock().expect("dispatcher state lock poisoned") = TaskState::Stopped;
        Ok(())
    }
}

/// One iteration: reclaimed entries first (crashed-consumer failsafe), then
/// unread, then this dispatcher's own pending list (handed-to-self
/// failsafe).
async fn tick(
    commands: &Arc<Commands>,
    name: &str,
    group: &str,
    instance_id: &str,
    min_idle: Duration,
) -> Result<(), SwitchboardError> {
    let entry = match commands.next_reclaimed_entry(name, min_idle).await? {
        Some(entry) => Some(entry),
        None => match commands.next_unread_entry(name).await? {
            Some(entry) => Some(entry),
            None => commands.next_pending_entry(name).await?,
        },
    };

    match entry {
        Some(entry) => dispatch(commands, group, instance_id, entry).await,
        None => Ok(()),
    }
}

async fn dispatch(
    commands: &Arc<Commands>,
    group: &str,
    instance_id: &str,
    entry: Entry,
) -> Result<(), SwitchboardError> {
    if entry.destination_group != group {
        // Another group's dispatchers received the same broadcast; drop it
        // from this PEL only. If no group by that name exists the entry is
        // an orphan nobody will ever read, so purge it from the stream too.
        commands.acknowledge_entry(&entry).await?;
        if !commands.group_exists(&entry.destination_group).await? {
            warn!(
                entry_id = %entry.id,
                destination = %entry.destination_group,
                "purging entry addressed to a nonexistent group"
            );
            commands.delete_entry(&entry).await?;
        }
        return Ok(());
    }

    let target_instance = match entry.status {
        Status::Pending => instance_id.to_string(),
        _ => entry
            .instance_id
            .clone()
            .unwrap_or_else(|| instance_id.to_string()),
    };

    let available = commands.available_consumer_names(&target_instance).await?;
    if available.is_empty() {
        // DISPATCH_FAILURE: drop without requeue; the caller times out.
        warn!(
            entry_id = %entry.id,
            instance = %target_instance,
            "no workers available; dropping entry"
        );
        commands.acknowledge_entry(&entry).await?;
        return Ok(());
    }

    let stats = commands.consumer_info(Some(&available)).await?;
    let worker = least_busy(&available, &stats);
    debug!(entry_id = %entry.id, worker = %worker, "handing entry to worker");
    commands.claim_entry(worker, &entry).await
}

/// Total-order ranking key for worker selection. Lower sorts first:
/// absent from the snapshot, then fewer pending, then (when never inactive)
/// longest idle, then longest idle outright.
fn rank_key(stats: Option<&ConsumerStats>) -> (bool, u64, Reverse<u64>, Reverse<u64>) {
    match stats {
        None => (false, 0, Reverse(0), Reverse(0)),
        Some(stats) => {
            let idle_while_active = if stats.inactive == 0 { stats.idle } else { 0 };
            (
                true,
                stats.pending,
                Reverse(idle_while_active),
                Reverse(stats.idle),
            )
        }
    }
}

fn least_busy<'a>(names: &'a [String], stats: &HashMap<String, ConsumerStats>) -> &'a str {
    names
        .iter()
        .min_by_key(|name| rank_key(stats.get(name.as_str())))
        .map(String::as_str)
        .expect("candidate list checked non-empty")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pending: u64, idle: u64, inactive: i64) -> ConsumerStats {
        ConsumerStats {
            pending,
            idle,
            inactive,
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_absent_ranks_ahead_of_present() {
        let key_absent = rank_key(None);
        let key_present = rank_key(Some(&stats(0, 10_000, 0)));
        assert!(key_absent < key_present);
    }

    #[test]
    fn test_fewer_pending_ranks_ahead() {
        let light = stats(1, 50, 0);
        let heavy = stats(4, 50, 0);
        assert!(rank_key(Some(&light)) < rank_key(Some(&heavy)));
    }

    #[test]
    fn test_pending_tie_prefers_longer_idle_when_active() {
        let fresh = stats(2, 10, 0);
        let rested = stats(2, 900, 0);
        assert!(rank_key(Some(&rested)) < rank_key(Some(&fresh)));
    }

    #[test]
    fn test_active_consumer_beats_inactive_on_tie() {
        let active = stats(0, 500, 0);
        let inactive = stats(0, 400, 2_000);
        assert!(rank_key(Some(&active)) < rank_key(Some(&inactive)));
    }

    #[test]
    fn test_final_tiebreak_is_idle() {
        let short = stats(0, 100, 1_000);
        let long = stats(0, 700, 1_000);
        assert!(rank_key(Some(&long)) < rank_key(Some(&short)));
    }

    #[test]
    fn test_ranking_is_antisymmetric() {
        let samples = [
            None,
            Some(stats(0, 0, 0)),
            Some(stats(0, 100, 0)),
            Some(stats(1, 100, 0)),
            Some(stats(1, 100, 500)),
            Some(stats(3, 9_000, 0)),
        ];
        for a in &samples {
            for b in &samples {
                let (ka, kb) = (rank_key(a.as_ref()), rank_key(b.as_ref()));
                assert_eq!(ka < kb, kb > ka);
                assert_eq!(ka == kb, kb == ka);
            }
        }
    }

    #[test]
    fn test_least_busy_prefers_unseen_worker() {
        let candidates = names(&["w1", "w2", "w3"]);
        let mut snapshot = HashMap::new();
        snapshot.insert("w1".to_string(), stats(0, 100, 0));
        snapshot.insert("w3".to_string(), stats(0, 100, 0));

        assert_eq!(least_busy(&candidates, &snapshot), "w2");
    }

    #[test]
    fn test_least_busy_prefers_smallest_backlog() {
        let candidates = names(&["w1", "w2"]);
        let mut snapshot = HashMap::new();
        snapshot.insert("w1".to_string(), stats(5, 100, 0));
        snapshot.insert("w2".to_string(), stats(2, 100, 0));

        assert_eq!(least_busy(&candidates, &snapshot), "w2");
    }

    #[test]
    fn test_least_busy_spreads_over_idle_workers() {
        // Claims bump a worker's pending count, so repeated selection over a
        // live snapshot walks through every idle worker before doubling up.
        let candidates = names(&["w1", "w2", "w3"]);
        let mut snapshot: HashMap<String, ConsumerStats> = candidates
            .iter()
            .map(|name| (name.clone(), stats(0, 1_000, 0)))
            .collect();

        let mut chosen = Vec::new();
        for _ in 0..3 {
            let worker = least_busy(&candidates, &snapshot).to_string();
            snapshot.get_mut(&worker).unwrap().pending += 1;
            chosen.push(worker);
        }

        chosen.sort();
        assert_eq!(chosen, names(&["w1", "w2", "w3"]));
    }
}
