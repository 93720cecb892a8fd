//! Core data model.
//!
//! One queue record per distinct message identity. Identity is the content
//! digest of (message, topic); the owner token fences every mutation made
//! while a record is claimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Queue Record
// ---------------------------------------------------------------------------

/// A row of the queue table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRecord {
    /// Primary key. Digest over message and topic.
    pub hash: MessageHash,

    /// Opaque payload. The queue never interprets it.
    pub message: String,

    /// Filter tag. `None` matches every listener.
    pub topic: Option<String>,

    /// True while a listener holds the claim.
    pub is_processing: bool,

    /// Listener instance holding the claim, if any.
    pub owner: Option<OwnerToken>,

    /// Last time the owner confirmed liveness.
    pub heartbeat_date: DateTime<Utc>,

    /// Must be processed once more after the current claim ends.
    pub requeued: bool,
}

impl QueueRecord {
    /// Is this record claimed by `owner`?
    pub fn is_owned_by(&self, owner: &OwnerToken) -> bool {
        self.is_processing && self.owner.as_ref() == Some(owner)
    }
}

/// A record about to be inserted. Hash is derived, never supplied.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub(crate) hash: MessageHash,
    pub(crate) message: String,
    pub(crate) topic: Option<String>,
}

impl NewRecord {
    pub fn new(message: impl Into<String>, topic: Option<&str>) -> Self {
        let message = message.into();
        let topic = topic.filter(|t| !t.is_empty()).map(str::to_string);
        Self {
            hash: MessageHash::compute(&message, topic.as_deref()),
            message,
            topic,
        }
    }

    pub fn hash(&self) -> &MessageHash {
        &self.hash
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Hex SHA-256 digest identifying a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHash(String);

impl MessageHash {
    /// Digest of the message, followed by the topic when one is given.
    pub fn compute(message: &str, topic: Option<&str>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(message.as_bytes());
        if let Some(topic) = topic.filter(|t| !t.is_empty()) {
            hasher.update(topic.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already-computed digest (e.g. read back from the store).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one listener instance. Regenerated per process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Two v4 UUIDs (244 random bits), hex encoded.
    pub fn generate() -> Self {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        Self(format!("{}{}", a.simple(), b.simple()))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display, enough to tell listeners apart in logs
        let end = self.0.char_indices().nth(12).map_or(self.0.len(), |(i, _)| i);
        f.write_str(&self.0[..end])
    }
}

// ---------------------------------------------------------------------------
// Topic filter
// ---------------------------------------------------------------------------

/// Topics a listener accepts. Records without a topic always match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicFilter(Vec<String>);

impl TopicFilter {
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(topics.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, topic: Option<&str>) -> bool {
        match topic {
            None => true,
            Some(t) => self.0.iter().any(|accepted| accepted == t),
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_over_message_and_topic() {
        let a = MessageHash::compute("hello", Some("topicA"));
        let b = MessageHash::compute("hello", Some("topicA"));
        let c = MessageHash::compute("hello", Some("topicB"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn empty_topic_hashes_like_no_topic() {
        assert_eq!(
            MessageHash::compute("hello", Some("")),
            MessageHash::compute("hello", None)
        );
    }

    #[test]
    fn known_sha256_digest() {
        // sha256("abc")
        assert_eq!(
            MessageHash::compute("abc", None).as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn new_record_drops_empty_topic() {
        let record = NewRecord::new("payload", Some(""));
        assert_eq!(record.topic(), None);
        assert_eq!(record.hash(), &MessageHash::compute("payload", None));
    }

    #[test]
    fn owner_tokens_are_unique_per_instance() {
        let a = OwnerToken::generate();
        let b = OwnerToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn owner_display_shortens_on_char_boundaries() {
        assert_eq!(OwnerToken::from_raw("0123456789abcdef").to_string(), "0123456789ab");
        assert_eq!(OwnerToken::from_raw("short").to_string(), "short");
        let wide = OwnerToken::from_raw("é".repeat(15));
        assert_eq!(wide.to_string(), "é".repeat(12));
    }

    #[test]
    fn null_topic_matches_every_filter() {
        let filter = TopicFilter::new(["a", "b"]);
        assert!(filter.matches(None));
        assert!(filter.matches(Some("a")));
        assert!(!filter.matches(Some("c")));
        assert!(TopicFilter::default().matches(None));
        assert!(!TopicFilter::default().matches(Some("a")));
    }
}
