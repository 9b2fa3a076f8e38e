//! Stream entry value type.
//!
//! An [`Entry`] is one unit of communication on the stream: a request from
//! one group to another, or the reply traveling back. Entries are immutable;
//! the reply helpers [`Entry::fulfilled`] and [`Entry::rejected`] produce new
//! values with the source and destination groups swapped and the correlation
//! id preserved.

use std::collections::HashMap;
use std::fmt;

use deadpool_redis::redis::Value as RedisValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SwitchboardError;

/// Delivery status of an entry.
///
/// `Pending` marks an unanswered request; `Fulfilled` and `Rejected` are
/// terminal and mark replies. An entry never moves out of a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Fulfilled,
    Rejected,
}

impl Status {
    /// Parse a wire-format status string.
    pub fn parse(value: &str) -> Result<Self, SwitchboardError> {
        match value {
            "pending" => Ok(Self::Pending),
            "fulfilled" => Ok(Self::Fulfilled),
            "rejected" => Ok(Self::Rejected),
            other => Err(SwitchboardError::InvalidStatus(other.to_string())),
        }
    }

    /// Wire-format representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
        }
    }

    /// True for `Fulfilled` and `Rejected`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of communication on the stream.
///
/// # Fields
///
/// - `id`: 32-character hex correlation id, minted by the sender
/// - `redis_id`: the stream's native id, assigned on publish
/// - `status`: [`Status`] of this entry
/// - `content`: arbitrary JSON payload
/// - `source_group` / `destination_group`: publisher and intended recipient
/// - `instance_id`: the publisher's per-process token; carried on replies so
///   they route back to the right process when several share a group name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_id: Option<String>,

    pub status: Status,

    pub content: Value,

    pub source_group: String,

    pub destination_group: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl Entry {
    /// Build a fresh `pending` request with a newly minted id.
    pub fn request(
        content: Value,
        source_group: impl Into<String>,
        destination_group: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Self::fresh_id(),
            redis_id: None,
            status: Status::Pending,
            content,
            source_group: source_group.into(),
            destination_group: destination_group.into(),
            instance_id: Some(instance_id.into()),
        }
    }

    /// Mint a 32-character hex correlation id.
    pub fn fresh_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// The fulfilled reply to this entry. Source and destination swap, the
    /// id and instance token carry over, `redis_id` is cleared for republish.
    pub fn fulfilled(&self, content: Value) -> Self {
        self.reply(Status::Fulfilled, content)
    }

    /// The rejected reply to this entry.
    pub fn rejected(&self, content: Value) -> Self {
        self.reply(Status::Rejected, content)
    }

    fn reply(&self, status: Status, content: Value) -> Self {
        Self {
            id: self.id.clone(),
            redis_id: None,
            status,
            content,
            source_group: self.destination_group.clone(),
            destination_group: self.source_group.clone(),
            instance_id: self.instance_id.clone(),
        }
    }

    /// Serialize to the stream's field-value pairs. `redis_id` is never
    /// written; Redis assigns it on publish.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, SwitchboardError> {
        let mut fields = vec![
            ("id", self.id.clone()),
            ("status", self.status.as_str().to_string()),
            ("content", serde_json::to_string(&self.content)?),
            ("source_group", self.source_group.clone()),
            ("destination_group", self.destination_group.clone()),
        ];
        if let Some(instance_id) = &self.instance_id {
            fields.push(("instance_id", instance_id.clone()));
        }
        Ok(fields)
    }

    /// Reconstruct an entry from a stream read.
    pub fn from_fields(
        redis_id: &str,
        map: &HashMap<String, RedisValue>,
    ) -> Result<Self, SwitchboardError> {
        let id = required_field(map, "id")?;
        let status = Status::parse(&required_field(map, "status")?)?;
        let source_group = required_field(map, "source_group")?;
        let destination_group = required_field(map, "destination_group")?;

        let content = match optional_field(map, "content") {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Value::Null,
        };

        Ok(Self {
            id,
            redis_id: Some(redis_id.to_string()),
            status,
            content,
            source_group,
            destination_group,
            instance_id: optional_field(map, "instance_id"),
        })
    }
}

// Correlation id is the identity; redis_id and status vary over a round trip.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

fn required_field(
    map: &HashMap<String, RedisValue>,
    key: &str,
) -> Result<String, SwitchboardError> {
    optional_field(map, key)
        .ok_or_else(|| SwitchboardError::MalformedEntry(format!("missing field '{key}'")))
}

fn optional_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|value| match value {
        RedisValue::BulkString(bytes) => {
            let s = String::from_utf8_lossy(bytes).to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        RedisValue::SimpleString(s) => {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Entry {
        Entry::request(json!("ping"), "parent", "child", "inst01")
    }

    #[test]
    fn test_request_defaults() {
        let entry = request();
        assert_eq!(entry.id.len(), 32);
        assert!(entry.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(entry.status, Status::Pending);
        assert!(entry.redis_id.is_none());
        assert_eq!(entry.instance_id.as_deref(), Some("inst01"));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(Entry::fresh_id(), Entry::fresh_id());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(Status::parse("pending").unwrap(), Status::Pending);
        assert_eq!(Status::parse("fulfilled").unwrap(), Status::Fulfilled);
        assert_eq!(Status::parse("rejected").unwrap(), Status::Rejected);
        assert!(Status::parse("resolved").is_err());
        assert!(Status::parse("").is_err());
    }

    #[test]
    fn test_fulfilled_swaps_groups_and_keeps_id() {
        let entry = request();
        let reply = entry.fulfilled(json!("pong"));

        assert_eq!(reply.id, entry.id);
        assert_eq!(reply.status, Status::Fulfilled);
        assert_eq!(reply.source_group, "child");
        assert_eq!(reply.destination_group, "parent");
        assert_eq!(reply.instance_id, entry.instance_id);
        assert!(reply.redis_id.is_none());

        // The original is untouched.
        assert_eq!(entry.status, Status::Pending);
        assert_eq!(entry.source_group, "parent");
    }

    #[test]
    fn test_rejected_replaces_content() {
        let entry = request();
        let reply = entry.rejected(json!("no"));
        assert_eq!(reply.status, Status::Rejected);
        assert_eq!(reply.content, json!("no"));
    }

    #[test]
    fn test_wire_roundtrip() {
        let entry = request();
        let fields = entry.to_fields().unwrap();
        assert!(fields.iter().all(|(key, _)| *key != "redis_id"));

        let map: HashMap<String, RedisValue> = fields
            .into_iter()
            .map(|(key, value)| (key.to_string(), RedisValue::BulkString(value.into_bytes())))
            .collect();

        let parsed = Entry::from_fields("1-0", &map).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.redis_id.as_deref(), Some("1-0"));
        assert_eq!(parsed.content, json!("ping"));
        assert_eq!(parsed.source_group, "parent");
        assert_eq!(parsed.destination_group, "child");
    }

    #[test]
    fn test_from_fields_rejects_bad_status() {
        let mut map = HashMap::new();
        map.insert(
            "id".to_string(),
            RedisValue::BulkString(Entry::fresh_id().into_bytes()),
        );
        map.insert(
            "status".to_string(),
            RedisValue::BulkString(b"exploded".to_vec()),
        );
        map.insert(
            "source_group".to_string(),
            RedisValue::BulkString(b"a".to_vec()),
        );
        map.insert(
            "destination_group".to_string(),
            RedisValue::BulkString(b"b".to_vec()),
        );

        assert!(Entry::from_fields("1-0", &map).is_err());
    }

    #[test]
    fn test_equality_is_by_id() {
        let entry = request();
        let reply = entry.fulfilled(json!("pong"));
        assert_eq!(entry, reply);

        let other = request();
        assert_ne!(entry, other);
    }
}
