//! Typed configuration from environment variables and TOML files.
//!
//! Loads once at startup, fails fast if required values are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::model::TopicFilter;

/// Process-level settings: where the database lives and how to report.
#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Queue behaviour for one listener instance.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Target table. Plain identifier, optionally schema-qualified.
    pub table: String,

    /// Topics this listener accepts. A single string, a list, or null.
    #[serde(default, deserialize_with = "deserialize_topics")]
    pub topics: TopicFilter,

    /// Delay between claim attempts.
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,

    /// Delay between lease sweeps.
    #[serde(default = "default_heartbeat_cleanup_delay_ms")]
    pub heartbeat_cleanup_delay_ms: u64,

    /// A claim whose heartbeat is older than this is reclaimed.
    #[serde(default = "default_heartbeat_lifetime_seconds")]
    pub heartbeat_lifetime_seconds: u64,

    /// Insert attempts before `send` gives up.
    #[serde(default = "default_create_message_cycle_limit")]
    pub create_message_cycle_limit: u32,

    /// Consecutive lock conflicts tolerated before one is reported.
    #[serde(default = "default_deadlock_count_limit")]
    pub deadlock_count_limit: u32,

    /// Discrete connection parameters, used when no database URL is given.
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

/// Connection parameters passed through to the Postgres driver.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub database: Option<String>,
}

fn default_poll_delay_ms() -> u64 {
    500
}

fn default_heartbeat_cleanup_delay_ms() -> u64 {
    1000
}

fn default_heartbeat_lifetime_seconds() -> u64 {
    5
}

fn default_create_message_cycle_limit() -> u32 {
    10
}

fn default_deadlock_count_limit() -> u32 {
    2
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

impl QueueConfig {
    /// Defaults for everything but the table name.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            topics: TopicFilter::default(),
            poll_delay_ms: default_poll_delay_ms(),
            heartbeat_cleanup_delay_ms: default_heartbeat_cleanup_delay_ms(),
            heartbeat_lifetime_seconds: default_heartbeat_lifetime_seconds(),
            create_message_cycle_limit: default_create_message_cycle_limit(),
            deadlock_count_limit: default_deadlock_count_limit(),
            connection: None,
        }
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = TopicFilter::new(topics);
        self
    }

    /// Load from `DDQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(required_var("DDQ_TABLE")?);
        if let Ok(raw) = std::env::var("DDQ_TOPICS") {
            config.topics = TopicFilter::new(
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
        config.poll_delay_ms = parsed_var("DDQ_POLL_DELAY_MS", config.poll_delay_ms)?;
        config.heartbeat_cleanup_delay_ms = parsed_var(
            "DDQ_HEARTBEAT_CLEANUP_DELAY_MS",
            config.heartbeat_cleanup_delay_ms,
        )?;
        config.heartbeat_lifetime_seconds = parsed_var(
            "DDQ_HEARTBEAT_LIFETIME_SECONDS",
            config.heartbeat_lifetime_seconds,
        )?;
        config.create_message_cycle_limit = parsed_var(
            "DDQ_CREATE_MESSAGE_CYCLE_LIMIT",
            config.create_message_cycle_limit,
        )?;
        config.deadlock_count_limit =
            parsed_var("DDQ_DEADLOCK_COUNT_LIMIT", config.deadlock_count_limit)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid queue config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Reject configurations the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.table)?;
        if self.poll_delay_ms == 0 {
            return Err(Error::Config("poll_delay_ms must be positive".into()));
        }
        if self.heartbeat_cleanup_delay_ms == 0 {
            return Err(Error::Config(
                "heartbeat_cleanup_delay_ms must be positive".into(),
            ));
        }
        if self.heartbeat_lifetime_seconds == 0 {
            return Err(Error::Config(
                "heartbeat_lifetime_seconds must be positive".into(),
            ));
        }
        if self.topics.as_slice().iter().any(|t| t.is_empty()) {
            return Err(Error::Config("topics must not contain empty strings".into()));
        }
        Ok(())
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn heartbeat_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.heartbeat_cleanup_delay_ms)
    }

    pub fn heartbeat_lifetime(&self) -> Duration {
        Duration::from_secs(self.heartbeat_lifetime_seconds)
    }
}

/// Accepts `"a"`, `["a", null]`, or `null`. Null entries are dropped:
/// records without a topic match every listener anyway.
fn deserialize_topics<'de, D>(deserializer: D) -> std::result::Result<TopicFilter, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Topics {
        One(String),
        Many(Vec<Option<String>>),
    }

    Ok(match Option::<Topics>::deserialize(deserializer)? {
        None => TopicFilter::default(),
        Some(Topics::One(topic)) => TopicFilter::new([topic]),
        Some(Topics::Many(topics)) => TopicFilter::new(topics.into_iter().flatten()),
    })
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(table: &str) -> Result<()> {
    let parts: Vec<&str> = table.split('.').collect();
    let ok = !table.is_empty() && parts.len() <= 2 && parts.iter().all(|p| is_identifier(p));
    if ok {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid table name: {table:?}")))
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_identifiers() {
        assert!(validate_table_name("queue").is_ok());
        assert!(validate_table_name("ddq.queue_1").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("1queue").is_err());
        assert!(validate_table_name("queue; DROP TABLE x").is_err());
        assert!(validate_table_name("a.b.c").is_err());
    }

    #[test]
    fn zero_delays_are_rejected() {
        let mut config = QueueConfig::new("queue");
        config.poll_delay_ms = 0;
        assert!(config.validate().is_err());

        let mut config = QueueConfig::new("queue");
        config.heartbeat_lifetime_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retry_limits_are_allowed() {
        let mut config = QueueConfig::new("queue");
        config.create_message_cycle_limit = 0;
        config.deadlock_count_limit = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn topics_accept_string_list_or_null() {
        let one = QueueConfig::from_toml_str("table = \"q\"\ntopics = \"a\"").unwrap();
        assert_eq!(one.topics, TopicFilter::new(["a"]));

        let many =
            QueueConfig::from_toml_str("table = \"q\"\ntopics = [\"a\", \"b\"]").unwrap();
        assert_eq!(many.topics, TopicFilter::new(["a", "b"]));

        let none = QueueConfig::from_toml_str("table = \"q\"").unwrap();
        assert!(none.topics.is_empty());
        assert_eq!(none.poll_delay_ms, 500);
        assert_eq!(none.create_message_cycle_limit, 10);
    }

    #[test]
    fn null_topic_entries_are_dropped() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"table": "q", "topics": ["a", null]}"#).unwrap();
        assert_eq!(config.topics, TopicFilter::new(["a"]));

        let config: QueueConfig =
            serde_json::from_str(r#"{"table": "q", "topics": null}"#).unwrap();
        assert!(config.topics.is_empty());
    }

    #[test]
    fn toml_is_validated() {
        assert!(QueueConfig::from_toml_str("table = \"bad name\"").is_err());
        assert!(QueueConfig::from_toml_str("table = \"q\"\ntopics = [\"\"]").is_err());
        assert!(QueueConfig::from_toml_str("topics = \"a\"").is_err());
    }
}
