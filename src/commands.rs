//! Redis command facade.
//!
//! [`Commands`] is the single concurrency-safe surface over every stream
//! operation the core needs: publishing, consumer-group reads, claim and
//! autoclaim, acknowledgement and deletion, group/consumer administration,
//! and the per-instance availability list. Connections come from a bounded
//! pool and are checked out for the duration of a single command.
//!
//! Command errors that are expected in normal operation (BUSYGROUP when a
//! group already exists, missing keys on destroy, missing ids on ack or
//! delete) are suppressed here; transport errors propagate to callers.

use std::collections::HashMap;
use std::time::Duration;

use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, ErrorKind, RedisError, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime};
use tracing::{debug, trace, warn};

use crate::entry::Entry;
use crate::error::SwitchboardError;

/// Cursor selecting entries never delivered to any consumer of the group.
const CURSOR_UNREAD: &str = ">";

/// Cursor selecting the reading consumer's own pending-entry list.
const CURSOR_PENDING: &str = "0";

/// Seconds before an idle availability list disappears.
const AVAILABILITY_TTL_SECS: i64 = 86_400;

/// Per-consumer load snapshot used by dispatcher load balancing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Entries delivered to the consumer but not yet acknowledged.
    pub pending: u64,

    /// Milliseconds since the consumer last attempted an interaction.
    pub idle: u64,

    /// Milliseconds since the consumer last read an entry successfully.
    pub inactive: i64,
}

/// Concurrency-safe facade over one (stream, group) pair.
pub struct Commands {
    pool: Pool,
    stream: String,
    group: String,
}

impl Commands {
    /// Build the facade with a bounded connection pool.
    pub fn new(
        redis_url: &str,
        max_pool_size: usize,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<Self, SwitchboardError> {
        let mut config = Config::from_url(redis_url);
        config.pool = Some(PoolConfig::new(max_pool_size));
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SwitchboardError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            stream: stream.into(),
            group: group.into(),
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    async fn connection(&self) -> Result<Connection, SwitchboardError> {
        Ok(self.pool.get().await?)
    }

    /// Publish an entry and return it with the server-assigned stream id.
    pub async fn add_to_stream(&self, entry: &Entry) -> Result<Entry, SwitchboardError> {
        let mut conn = self.connection().await?;

        let mut command = cmd("XADD");
        command.arg(&self.stream).arg("*");
        for (key, value) in entry.to_fields()? {
            command.arg(key).arg(value);
        }

        let redis_id: String = command.query_async(&mut conn).await?;
        trace!(entry_id = %entry.id, redis_id = %redis_id, "entry published");

        let mut published = entry.clone();
        published.redis_id = Some(redis_id);
        Ok(published)
    }

    /// Read at most one entry for `consumer` via the consumer group.
    /// `cursor` is either `">"` (unread) or `"0"` (the consumer's own PEL).
    /// An unparseable entry is acknowledged, deleted, and reported as none.
    pub async fn read_from_stream(
        &self,
        consumer: &str,
        cursor: &str,
        block: Option<Duration>,
    ) -> Result<Option<Entry>, SwitchboardError> {
        let mut conn = self.connection().await?;

        let mut opts = StreamReadOptions::default()
            .group(&self.group, consumer)
            .count(1);
        if let Some(block) = block {
            opts = opts.block(block.as_millis() as usize);
        }

        let result: Result<StreamReadReply, RedisError> = conn
            .xread_options(&[&self.stream], &[cursor], &opts)
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) if is_empty_read(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for stream_key in reply.keys {
            for message in stream_key.ids {
                match Entry::from_fields(&message.id, &message.map) {
                    Ok(entry) => return Ok(Some(entry)),
                    Err(e) => {
                        warn!(
                            redis_id = %message.id,
                            error = %e,
                            "purging unparseable stream entry"
                        );
                        self.finalize_raw(&message.id).await?;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Next entry never delivered to any consumer of this group.
    pub async fn next_unread_entry(
        &self,
        consumer: &str,
    ) -> Result<Option<Entry>, SwitchboardError> {
        self.read_from_stream(consumer, CURSOR_UNREAD, None).await
    }

    /// Next entry already delivered to `consumer` but not acknowledged.
    /// Failsafe for entries claimed but not yet handed off.
    pub async fn next_pending_entry(
        &self,
        consumer: &str,
    ) -> Result<Option<Entry>, SwitchboardError> {
        self.read_from_stream(consumer, CURSOR_PENDING, None).await
    }

    /// Autoclaim one entry idle longer than `min_idle` into `consumer`.
    /// Failsafe for entries stranded in a crashed consumer's PEL.
    pub async fn next_reclaimed_entry(
        &self,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Entry>, SwitchboardError> {
        let mut conn = self.connection().await?;

        let value: RedisValue = cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some((redis_id, map)) = first_claimed_entry(&value) else {
            return Ok(None);
        };

        match Entry::from_fields(&redis_id, &map) {
            Ok(entry) => {
                debug!(entry_id = %entry.id, consumer = %consumer, "entry reclaimed");
                Ok(Some(entry))
            }
            Err(e) => {
                warn!(redis_id = %redis_id, error = %e, "purging unparseable reclaimed entry");
                self.finalize_raw(&redis_id).await?;
                Ok(None)
            }
        }
    }

    /// Move an entry into `consumer`'s PEL regardless of idle time.
    pub async fn claim_entry(&self, consumer: &str, entry: &Entry) -> Result<(), SwitchboardError> {
        let Some(redis_id) = &entry.redis_id else {
            return Ok(());
        };
        let mut conn = self.connection().await?;

        let _: RedisValue = cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(consumer)
            .arg(0)
            .arg(redis_id)
            .query_async(&mut conn)
            .await?;

        trace!(entry_id = %entry.id, consumer = %consumer, "entry claimed");
        Ok(())
    }

    /// Remove an entry from whichever PEL holds it. Idempotent.
    pub async fn acknowledge_entry(&self, entry: &Entry) -> Result<(), SwitchboardError> {
        let Some(redis_id) = &entry.redis_id else {
            return Ok(());
        };
        let mut conn = self.connection().await?;
        let _: i64 = conn.xack(&self.stream, &self.group, &[redis_id]).await?;
        Ok(())
    }

    /// Remove an entry from the stream itself. Idempotent.
    pub async fn delete_entry(&self, entry: &Entry) -> Result<(), SwitchboardError> {
        let Some(redis_id) = &entry.redis_id else {
            return Ok(());
        };
        self.finalize_raw(redis_id).await
    }

    async fn finalize_raw(&self, redis_id: &str) -> Result<(), SwitchboardError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.xack(&self.stream, &self.group, &[redis_id]).await?;
        let _: i64 = conn.xdel(&self.stream, &[redis_id]).await?;
        Ok(())
    }

    /// Create the consumer group, and the stream with it if needed.
    /// Starts at `$` so history published before connect is skipped.
    pub async fn create_group(&self) -> Result<(), SwitchboardError> {
        let mut conn = self.connection().await?;

        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                debug!(group = %self.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(group = %self.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Destroy the consumer group. Missing stream or group is not an error.
    pub async fn destroy_group(&self) -> Result<(), SwitchboardError> {
        let mut conn = self.connection().await?;

        let result: Result<i64, RedisError> = cmd("XGROUP")
            .arg("DESTROY")
            .arg(&self.stream)
            .arg(&self.group)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_missing_key(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the stream key outright.
    pub async fn delete_stream(&self) -> Result<(), SwitchboardError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.del(&self.stream).await?;
        Ok(())
    }

    /// Register a named consumer in the group.
    pub async fn create_consumer(&self, name: &str) -> Result<(), SwitchboardError> {
        let mut conn = self.connection().await?;
        let _: i64 = cmd("XGROUP")
            .arg("CREATECONSUMER")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(name)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Remove a named consumer from the group. Missing group is not an error.
    pub async fn delete_consumer(&self, name: &str) -> Result<(), SwitchboardError> {
        let mut conn = self.connection().await?;

        let result: Result<i64, RedisError> = cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(name)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_missing_key(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove consumers that have nothing pending and have sat idle longer
    /// than `min_idle`. Clears leftovers from crashed processes.
    pub async fn prune_consumers(&self, min_idle: Duration) -> Result<usize, SwitchboardError> {
        let stats = self.consumer_info(None).await?;
        let min_idle_ms = min_idle.as_millis() as u64;
        let mut pruned = 0;

        for (name, stats) in stats {
            if stats.pending == 0 && stats.idle > min_idle_ms {
                self.delete_consumer(&name).await?;
                pruned += 1;
            }
        }

        if pruned > 0 {
            debug!(pruned, "pruned idle consumers");
        }
        Ok(pruned)
    }

    /// One-shot load snapshot of the group's consumers, optionally filtered
    /// to the given names. A consumer Redis has never seen is absent.
    pub async fn consumer_info(
        &self,
        filter_for: Option<&[String]>,
    ) -> Result<HashMap<String, ConsumerStats>, SwitchboardError> {
        let mut conn = self.connection().await?;

        let result: Result<RedisValue, RedisError> = cmd("XINFO")
            .arg("CONSUMERS")
            .arg(&self.stream)
            .arg(&self.group)
            .query_async(&mut conn)
            .await;

        let value = match result {
            Ok(value) => value,
            Err(e) if is_missing_key(&e) => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut info = HashMap::new();
        if let RedisValue::Array(consumers) = value {
            for consumer in &consumers {
                let fields: HashMap<String, RedisValue> = kv_pairs(consumer).into_iter().collect();
                let Some(name) = fields.get("name").and_then(as_string) else {
                    continue;
                };
                if let Some(filter) = filter_for {
                    if !filter.iter().any(|candidate| candidate == &name) {
                        continue;
                    }
                }
                info.insert(
                    name,
                    ConsumerStats {
                        pending: fields.get("pending").and_then(as_int).unwrap_or(0).max(0) as u64,
                        idle: fields.get("idle").and_then(as_int).unwrap_or(0).max(0) as u64,
                        inactive: fields.get("inactive").and_then(as_int).unwrap_or(0),
                    },
                );
            }
        }

        Ok(info)
    }

    /// True if the named consumer group exists on this stream.
    pub async fn group_exists(&self, group: &str) -> Result<bool, SwitchboardError> {
        let mut conn = self.connection().await?;

        let result: Result<RedisValue, RedisError> = cmd("XINFO")
            .arg("GROUPS")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await;

        let value = match result {
            Ok(value) => value,
            Err(e) if is_missing_key(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if let RedisValue::Array(groups) = value {
            for entry in &groups {
                let fields: HashMap<String, RedisValue> = kv_pairs(entry).into_iter().collect();
                if fields.get("name").and_then(as_string).as_deref() == Some(group) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Number of entries currently in the stream.
    pub async fn stream_len(&self) -> Result<u64, SwitchboardError> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.stream).await?;
        Ok(len)
    }

    /// Names of workers currently listening in the given instance.
    pub async fn available_consumer_names(
        &self,
        instance_id: &str,
    ) -> Result<Vec<String>, SwitchboardError> {
        let mut conn = self.connection().await?;
        let names: Vec<String> = conn.lrange(self.availability_key(instance_id), 0, -1).await?;
        Ok(names)
    }

    /// Add a worker to its instance's availability list. Idempotent.
    pub async fn make_consumer_available(
        &self,
        instance_id: &str,
        consumer: &str,
    ) -> Result<(), SwitchboardError> {
        if self.consumer_available(instance_id, consumer).await? {
            return Ok(());
        }

        let key = self.availability_key(instance_id);
        let mut conn = self.connection().await?;
        let _: i64 = conn.rpush(&key, consumer).await?;
        let _: i64 = conn.expire(&key, AVAILABILITY_TTL_SECS).await?;
        Ok(())
    }

    /// Remove a worker from its instance's availability list. Idempotent.
    pub async fn make_consumer_unavailable(
        &self,
        instance_id: &str,
        consumer: &str,
    ) -> Result<(), SwitchboardError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn
            .lrem(self.availability_key(instance_id), 0, consumer)
            .await?;
        Ok(())
    }

    /// True if the worker is currently in its instance's availability list.
    pub async fn consumer_available(
        &self,
        instance_id: &str,
        consumer: &str,
    ) -> Result<bool, SwitchboardError> {
        let mut conn = self.connection().await?;
        let position: Option<i64> = cmd("LPOS")
            .arg(self.availability_key(instance_id))
            .arg(consumer)
            .query_async(&mut conn)
            .await?;
        Ok(position.is_some())
    }

    fn availability_key(&self, instance_id: &str) -> String {
        format!("{}:{}:{}:consumers", self.stream, self.group, instance_id)
    }
}

/// An empty consumer-group read comes back as a nil reply, which the typed
/// stream decoding reports as a type error rather than an empty set. Only
/// those shapes mean "no entry"; transport failures must propagate.
fn is_empty_read(err: &RedisError) -> bool {
    if err.kind() == ErrorKind::TypeError {
        return true;
    }
    err.to_string().to_lowercase().contains("response was nil")
}

fn is_missing_key(err: &RedisError) -> bool {
    let text = err.to_string();
    text.contains("NOGROUP")
        || text.contains("no such key")
        || text.contains("requires the key to exist")
}

/// Pull the first claimed entry out of a raw XAUTOCLAIM reply:
/// `[next-cursor, [[redis-id, [field, value, ...]], ...], (deleted-ids)]`.
fn first_claimed_entry(value: &RedisValue) -> Option<(String, HashMap<String, RedisValue>)> {
    let RedisValue::Array(reply) = value else {
        return None;
    };
    let RedisValue::Array(entries) = reply.get(1)? else {
        return None;
    };
    let RedisValue::Array(entry) = entries.first()? else {
        return None;
    };

    let redis_id = as_string(entry.first()?)?;
    let fields = kv_pairs(entry.get(1)?).into_iter().collect();
    Some((redis_id, fields))
}

/// Flatten a `[key, value, key, value, ...]` array or a RESP3 map into pairs.
fn kv_pairs(value: &RedisValue) -> Vec<(String, RedisValue)> {
    match value {
        RedisValue::Array(items) => items
            .chunks(2)
            .filter_map(|chunk| {
                let key = as_string(chunk.first()?)?;
                Some((key, chunk.get(1)?.clone()))
            })
            .collect(),
        RedisValue::Map(pairs) => pairs
            .iter()
            .filter_map(|(key, value)| Some((as_string(key)?, value.clone())))
            .collect(),
        _ => Vec::new(),
    }
}

fn as_string(value: &RedisValue) -> Option<String> {
    match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn as_int(value: &RedisValue) -> Option<i64> {
    match value {
        RedisValue::Int(n) => Some(*n),
        RedisValue::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_availability_key_shape() {
        let commands = Commands::new("redis://localhost:6379", 4, "events", "parent").unwrap();
        assert_eq!(
            commands.availability_key("inst01"),
            "events:parent:inst01:consumers"
        );
    }

    #[test]
    fn test_first_claimed_entry() {
        let reply = RedisValue::Array(vec![
            RedisValue::BulkString(b"0-0".to_vec()),
            RedisValue::Array(vec![RedisValue::Array(vec![
                RedisValue::BulkString(b"5-1".to_vec()),
                RedisValue::Array(vec![
                    RedisValue::BulkString(b"id".to_vec()),
                    RedisValue::BulkString(b"abc".to_vec()),
                ]),
            ])]),
            RedisValue::Array(vec![]),
        ]);

        let (redis_id, fields) = first_claimed_entry(&reply).unwrap();
        assert_eq!(redis_id, "5-1");
        assert_eq!(as_string(fields.get("id").unwrap()).unwrap(), "abc");
    }

    #[test]
    fn test_first_claimed_entry_empty() {
        let reply = RedisValue::Array(vec![
            RedisValue::BulkString(b"0-0".to_vec()),
            RedisValue::Array(vec![]),
        ]);
        assert!(first_claimed_entry(&reply).is_none());
        assert!(first_claimed_entry(&RedisValue::Nil).is_none());
    }

    #[test]
    fn test_kv_pairs_flat_array() {
        let value = RedisValue::Array(vec![
            RedisValue::BulkString(b"name".to_vec()),
            RedisValue::BulkString(b"worker-1".to_vec()),
            RedisValue::BulkString(b"pending".to_vec()),
            RedisValue::Int(3),
        ]);

        let fields: HashMap<String, RedisValue> = kv_pairs(&value).into_iter().collect();
        assert_eq!(as_string(fields.get("name").unwrap()).unwrap(), "worker-1");
        assert_eq!(as_int(fields.get("pending").unwrap()).unwrap(), 3);
    }

    #[test]
    fn test_kv_pairs_resp3_map() {
        let value = RedisValue::Map(vec![(
            RedisValue::BulkString(b"idle".to_vec()),
            RedisValue::Int(250),
        )]);

        let fields: HashMap<String, RedisValue> = kv_pairs(&value).into_iter().collect();
        assert_eq!(as_int(fields.get("idle").unwrap()).unwrap(), 250);
    }

    #[test]
    fn test_as_int_parses_bulk_strings() {
        assert_eq!(as_int(&RedisValue::BulkString(b"42".to_vec())), Some(42));
        assert_eq!(as_int(&RedisValue::BulkString(b"nope".to_vec())), None);
        assert_eq!(as_int(&RedisValue::Nil), None);
    }
}
