use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::Error;

/// Sentinel stored in `locked_by` while a record is unclaimed.
pub const OPEN_SENTINEL: &str = "ALL";

/// Priority assigned when the builder is not told otherwise; lower values
/// claim first.
pub const DEFAULT_PRIORITY: i32 = 1000;

/// Lifetime substituted for a zero ttl at send time.
pub const DEFAULT_TTL_MS: u64 = 30_000;

/// Document field names, shared with the engine's filters.
pub(crate) mod fields {
    pub const ID: &str = "_id";
    pub const SENDER: &str = "sender";
    pub const RECIPIENTS: &str = "recipients";
    pub const PRIORITY: &str = "priority";
    pub const TIMESTAMP: &str = "timestamp";
    pub const DELETE_AT: &str = "delete_at";
    pub const EXCLUSIVE: &str = "exclusive";
    pub const LOCKED_BY: &str = "locked_by";
    pub const LOCKED: &str = "locked";
    pub const PROCESSED_BY: &str = "processed_by";
    pub const IN_ANSWER_TO: &str = "in_answer_to";
    pub const NAME: &str = "name";
}

/// The persisted unit of work and communication.
///
/// Created by a producer, inserted once, mutated in place only by
/// claim/processed-mark updates, and removed by ttl expiry or explicit
/// delete. Exclusivity is fixed at creation and never changes.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    /// Globally unique id, immutable once assigned.
    #[serde(rename = "_id")]
    pub id: Uuid,

    /// Node id of the originator; stamped at send time.
    #[serde(default)]
    pub sender: String,

    /// Target node ids; empty means any node may consume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,

    /// Logical topic used for listener matching.
    pub name: String,

    /// Free-form text payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,

    /// Single payload value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Additional payload values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional: Vec<String>,

    /// Structured payload map.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub map_value: HashMap<String, Value>,

    /// Primary claim-ordering key; lower claims first.
    pub priority: i32,

    /// Creation time in epoch milliseconds; tie-breaks equal priorities.
    pub timestamp: i64,

    /// Lifetime in milliseconds.
    pub ttl: u64,

    /// Epoch milliseconds after which the record is expired.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_at: Option<i64>,

    /// Whether at most one node may consume this record.
    pub exclusive: bool,

    /// Current claim holder; `None` is persisted as the open sentinel.
    #[serde(default, with = "locked_by_sentinel")]
    pub locked_by: Option<String>,

    /// Claim timestamp in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked: Option<i64>,

    /// Node ids that already handled this record.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processed_by: Vec<String>,

    /// Id of the message this record answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_answer_to: Option<Uuid>,
}

mod locked_by_sentinel {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::OPEN_SENTINEL;

    pub fn serialize<S: Serializer>(
        value: &Option<String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.as_deref().unwrap_or(OPEN_SENTINEL))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.filter(|holder| holder != OPEN_SENTINEL && !holder.is_empty()))
    }
}

impl Message {
    /// Creates an unclaimed broadcast message on the given topic.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: String::new(),
            recipients: Vec::new(),
            name: name.into(),
            msg: None,
            value: None,
            additional: Vec::new(),
            map_value: HashMap::new(),
            priority: DEFAULT_PRIORITY,
            timestamp: 0,
            ttl: DEFAULT_TTL_MS,
            delete_at: None,
            exclusive: false,
            locked_by: None,
            locked: None,
            processed_by: Vec::new(),
            in_answer_to: None,
        }
    }

    /// Creates an answer to `original`: same topic, back-reference set,
    /// the original sender as sole recipient.
    #[must_use]
    pub fn answer_to(original: &Self) -> Self {
        let mut answer = Self::new(original.name.clone());
        answer.in_answer_to = Some(original.id);
        answer.recipients = vec![original.sender.clone()];
        answer
    }

    /// Marks the message as exclusive (consumed by exactly one node).
    #[must_use]
    pub const fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Adds a target node id.
    #[must_use]
    pub fn recipient(mut self, node_id: impl Into<String>) -> Self {
        self.recipients.push(node_id.into());
        self
    }

    /// Sets the claim-ordering priority.
    #[must_use]
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the lifetime in milliseconds.
    #[must_use]
    pub const fn ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = ttl_ms;
        self
    }

    /// Sets the text payload.
    #[must_use]
    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = Some(msg.into());
        self
    }

    /// Sets the single payload value.
    #[must_use]
    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Adds an entry to the structured payload map.
    #[must_use]
    pub fn map_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.map_value.insert(key.into(), value.into());
        self
    }

    /// Whether any node in scope may consume this record independently.
    #[must_use]
    pub const fn is_broadcast(&self) -> bool {
        !self.exclusive
    }

    /// Whether this record answers another message.
    #[must_use]
    pub const fn is_answer(&self) -> bool {
        self.in_answer_to.is_some()
    }

    /// Pre-store hook run by the engine before every insert.
    ///
    /// Stamps `timestamp` with `now` (overwriting any caller-supplied
    /// value), substitutes the default ttl for zero with a warning, and
    /// derives `delete_at` when absent.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] when `sender` or `name` is missing.
    pub fn prepare_for_send(&mut self, now: i64) -> Result<(), Error> {
        if self.sender.is_empty() {
            return Err(Error::Validation("sender must be set".into()));
        }
        if self.name.is_empty() {
            return Err(Error::Validation("name must be set".into()));
        }

        if self.ttl == 0 {
            warn!(
                message_id = %self.id,
                "ttl of 0 replaced with default of {}ms", DEFAULT_TTL_MS
            );
            self.ttl = DEFAULT_TTL_MS;
        }

        self.timestamp = now;
        if self.delete_at.is_none() {
            self.delete_at = Some(now.saturating_add_unsigned(self.ttl));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docbus_store::{DocumentMapper, JsonMapper};

    #[test]
    fn test_validation_requires_name_and_sender() {
        let mut message = Message::new("");
        message.sender = "node-1".into();
        assert!(matches!(
            message.prepare_for_send(1000),
            Err(Error::Validation(_))
        ));

        let mut message = Message::new("ping");
        assert!(matches!(
            message.prepare_for_send(1000),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_zero_ttl_gets_default_and_delete_at() {
        let mut message = Message::new("ping").ttl(0);
        message.sender = "node-1".into();
        message.prepare_for_send(1000).unwrap();

        assert_eq!(message.ttl, DEFAULT_TTL_MS);
        assert_eq!(message.timestamp, 1000);
        assert_eq!(message.delete_at, Some(1000 + DEFAULT_TTL_MS as i64));
    }

    #[test]
    fn test_caller_timestamp_is_overwritten() {
        let mut message = Message::new("ping");
        message.sender = "node-1".into();
        message.timestamp = 42;
        message.prepare_for_send(9000).unwrap();

        assert_eq!(message.timestamp, 9000);
    }

    #[test]
    fn test_answer_targets_original_sender() {
        let mut original = Message::new("ping").exclusive();
        original.sender = "node-a".into();

        let answer = Message::answer_to(&original);
        assert_eq!(answer.in_answer_to, Some(original.id));
        assert_eq!(answer.recipients, vec!["node-a".to_string()]);
        assert!(answer.is_answer());
        assert!(answer.is_broadcast());
    }

    #[test]
    fn test_document_form_uses_open_sentinel() {
        let mapper = JsonMapper::new();
        let mut message = Message::new("ping");
        message.sender = "node-1".into();
        message.prepare_for_send(1000).unwrap();

        let document = mapper.serialize(&message).unwrap();
        assert_eq!(document.get_str("locked_by"), Some(OPEN_SENTINEL));
        // Empty sets are normalized to absent.
        assert!(!document.contains_key("processed_by"));
        assert!(!document.contains_key("recipients"));
        assert!(!document.contains_key("in_answer_to"));

        let back: Message = mapper.deserialize(document).unwrap();
        assert_eq!(back, message);
        assert_eq!(back.locked_by, None);
    }

    #[test]
    fn test_claimed_record_round_trips_holder() {
        let mapper = JsonMapper::new();
        let mut message = Message::new("ping").exclusive();
        message.sender = "node-1".into();
        message.locked_by = Some("node-2".into());
        message.locked = Some(1234);
        message.prepare_for_send(1000).unwrap();

        let document = mapper.serialize(&message).unwrap();
        assert_eq!(document.get_str("locked_by"), Some("node-2"));

        let back: Message = mapper.deserialize(document).unwrap();
        assert_eq!(back.locked_by.as_deref(), Some("node-2"));
    }
}
