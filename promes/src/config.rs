//! Configuration types for the adapter components.
//!
//! Each component takes exactly one configuration value, validated when the
//! component is constructed. Defaults match the adapter's command-line
//! defaults so library users and the binary behave the same out of the box.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default write alias.
pub const DEFAULT_ALIAS: &str = "prom-metrics";

/// Suffix appended to the write alias to name the search alias.
const SEARCH_ALIAS_SUFFIX: &str = "-search";

/// Characters Elasticsearch refuses in index and alias names.
const FORBIDDEN_NAME_CHARS: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ' ', ',', '#', ':'];

/// Maximum length of an index name in bytes.
const MAX_NAME_BYTES: usize = 255;

/// Returns the search alias paired with a write alias.
///
/// Every index generation created from the template joins this alias, so
/// searches against it span active and rolled-over generations alike.
pub fn search_alias_for(alias: &str) -> String {
    format!("{alias}{SEARCH_ALIAS_SUFFIX}")
}

/// Configuration for the [`WriteBatcher`](crate::batcher::WriteBatcher).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteConfig {
    /// Write alias every document is addressed to.
    pub alias: String,

    /// Number of flush workers; bounds concurrent bulk requests.
    pub workers: usize,

    /// Flush a worker's batch once it holds this many documents.
    pub max_docs: usize,

    /// Flush a worker's batch once its estimated bulk body reaches this
    /// many bytes.
    pub max_bytes: usize,

    /// Flush a worker's batch once this long has passed since its last
    /// flush.
    #[serde(with = "duration_serde")]
    pub max_age: Duration,

    /// Capacity of the queue between producers and workers.
    ///
    /// Documents offered while the queue is full are rejected rather than
    /// blocking the producer.
    pub queue_capacity: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            alias: DEFAULT_ALIAS.to_string(),
            workers: 1,
            max_docs: 1000,
            max_bytes: 4096,
            max_age: Duration::from_secs(10),
            queue_capacity: 100_000,
        }
    }
}

impl WriteConfig {
    /// Creates a write configuration for `alias` with default thresholds.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..Self::default()
        }
    }

    /// Sets the number of flush workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the document-count flush threshold.
    #[must_use]
    pub fn with_max_docs(mut self, max_docs: usize) -> Self {
        self.max_docs = max_docs;
        self
    }

    /// Sets the byte-size flush threshold.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets the age flush threshold.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Sets the queue capacity.
    #[must_use]
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the alias is not a legal index name or any
    /// threshold is zero.
    pub fn validate(&self) -> Result<()> {
        validate_index_name(&self.alias)?;
        require_positive("workers", self.workers)?;
        require_positive("max_docs", self.max_docs)?;
        require_positive("max_bytes", self.max_bytes)?;
        require_positive("queue_capacity", self.queue_capacity)?;
        if self.max_age.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "max_age",
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Configuration for the [`QueryEngine`](crate::query::QueryEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Alias (or index pattern) spanning every index generation.
    pub search_alias: String,

    /// Maximum number of documents returned per query. Larger result sets
    /// are truncated.
    pub max_docs: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            search_alias: search_alias_for(DEFAULT_ALIAS),
            max_docs: 1000,
        }
    }
}

impl ReadConfig {
    /// Creates a read configuration searching the alias paired with the
    /// write alias `alias`.
    pub fn for_alias(alias: &str) -> Self {
        Self {
            search_alias: search_alias_for(alias),
            ..Self::default()
        }
    }

    /// Sets the per-query document cap.
    #[must_use]
    pub fn with_max_docs(mut self, max_docs: usize) -> Self {
        self.max_docs = max_docs;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the search alias is empty or `max_docs`
    /// is zero.
    pub fn validate(&self) -> Result<()> {
        if self.search_alias.trim().is_empty() {
            return Err(ConfigError::InvalidIndexName {
                name: self.search_alias.clone(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        require_positive("max_docs", self.max_docs)
    }
}

/// Conditions under which the active index generation is rolled over.
///
/// Any subset may be disabled. With every condition disabled the rollover
/// task never rolls the index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverConditions {
    /// Roll over once the active index is this old.
    #[serde(default, with = "option_duration_serde")]
    pub max_age: Option<Duration>,

    /// Roll over once the active index holds this many documents.
    #[serde(default)]
    pub max_docs: Option<u64>,

    /// Roll over once the active index's primary storage reaches this many
    /// bytes.
    #[serde(default)]
    pub max_size: Option<u64>,
}

impl RolloverConditions {
    /// Returns `true` if no condition is enabled.
    pub fn is_empty(&self) -> bool {
        self.max_age.is_none() && self.max_docs.is_none() && self.max_size.is_none()
    }
}

/// Configuration for the
/// [`IndexLifecycleManager`](crate::lifecycle::IndexLifecycleManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Write alias; generations are named `<alias>-NNNNNN`.
    pub alias: String,

    /// Alias every generation joins for reads.
    pub search_alias: String,

    /// Primary shards per generation.
    pub shards: u32,

    /// Replicas per primary shard.
    pub replicas: u32,

    /// Rollover thresholds.
    pub rollover: RolloverConditions,

    /// How often rollover conditions are evaluated.
    #[serde(with = "duration_serde")]
    pub check_interval: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ALIAS)
    }
}

impl IndexConfig {
    /// Creates an index configuration for `alias` with default settings:
    /// 5 shards, 1 replica, roll over at 7 days or 1M documents, checked
    /// every 5 minutes.
    pub fn new(alias: impl Into<String>) -> Self {
        let alias = alias.into();
        Self {
            search_alias: search_alias_for(&alias),
            alias,
            shards: 5,
            replicas: 1,
            rollover: RolloverConditions {
                max_age: Some(Duration::from_secs(7 * 86_400)),
                max_docs: Some(1_000_000),
                max_size: None,
            },
            check_interval: Duration::from_secs(300),
        }
    }

    /// Sets shard and replica counts.
    #[must_use]
    pub fn with_shards(mut self, shards: u32, replicas: u32) -> Self {
        self.shards = shards;
        self.replicas = replicas;
        self
    }

    /// Replaces the rollover conditions.
    #[must_use]
    pub fn with_rollover(mut self, rollover: RolloverConditions) -> Self {
        self.rollover = rollover;
        self
    }

    /// Sets the rollover check interval.
    #[must_use]
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if either alias is illegal, the aliases
    /// collide, there are no shards, a rollover threshold is zero, or the
    /// check interval is zero.
    pub fn validate(&self) -> Result<()> {
        validate_index_name(&self.alias)?;
        validate_index_name(&self.search_alias)?;
        if self.alias == self.search_alias {
            return Err(ConfigError::InvalidValue {
                field: "search_alias",
                reason: "must differ from the write alias".to_string(),
            }
            .into());
        }
        if self.shards == 0 {
            return Err(ConfigError::InvalidValue {
                field: "shards",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.rollover.max_age.is_some_and(|d| d.is_zero())
            || self.rollover.max_docs == Some(0)
            || self.rollover.max_size == Some(0)
        {
            return Err(ConfigError::InvalidValue {
                field: "rollover",
                reason: "thresholds must be greater than zero when enabled".to_string(),
            }
            .into());
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "check_interval",
                reason: "must be greater than zero".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Checks that `name` is usable as an Elasticsearch index or alias name.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidIndexName`] describing the first rule the
/// name breaks.
pub fn validate_index_name(name: &str) -> Result<()> {
    let reject = |reason: &str| -> Result<()> {
        Err(ConfigError::InvalidIndexName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
        .into())
    };

    if name.is_empty() {
        return reject("must not be empty");
    }
    if name.len() > MAX_NAME_BYTES {
        return reject("must be at most 255 bytes");
    }
    if name == "." || name == ".." {
        return reject("must not be '.' or '..'");
    }
    if name.starts_with(['-', '_', '+']) {
        return reject("must not start with '-', '_' or '+'");
    }
    if name.chars().any(char::is_uppercase) {
        return reject("must be lowercase");
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return reject(&format!("must not contain '{c}'"));
    }
    Ok(())
}

fn require_positive(field: &'static str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than zero".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Parses a human-readable duration such as `"500ms"`, `"10s"`, `"5m"`,
/// `"12h"` or `"7d"`. A bare number is read as seconds.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidDuration`] for empty input, a non-numeric
/// amount, an unknown unit, or an overflowing value.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim();
    if s.is_empty() {
        return Err(invalid("empty duration").into());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| invalid("expected a whole number followed by a unit"))?;

    let millis_per_unit: u64 = match unit {
        "ms" => 1,
        "" | "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return Err(invalid("unknown unit, use ms, s, m, h or d").into()),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid("value too large").into())
}

/// Parses a byte size such as `"4096"`, `"512kb"`, `"10mb"` or `"5gb"`.
/// Units are binary multiples, matching Elasticsearch's byte-size values.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidByteSize`] for empty input, a non-numeric
/// amount, an unknown unit, or an overflowing value.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let invalid = |reason: &str| ConfigError::InvalidByteSize {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(invalid("empty size").into());
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| invalid("expected a whole number followed by a unit"))?;

    let multiplier: u64 = match unit {
        "" | "b" => 1,
        "kb" => 1 << 10,
        "mb" => 1 << 20,
        "gb" => 1 << 30,
        "tb" => 1 << 40,
        _ => return Err(invalid("unknown unit, use b, kb, mb, gb or tb").into()),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| invalid("value too large").into())
}

/// Formats a duration in the largest whole Elasticsearch time unit.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0ms".to_string();
    }
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if millis % size == 0 {
            return format!("{}{unit}", millis / size);
        }
    }
    format!("{millis}ms")
}

/// Formats a byte count in the largest whole Elasticsearch byte unit.
pub fn format_byte_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0b".to_string();
    }
    for (unit, shift) in [("tb", 40), ("gb", 30), ("mb", 20), ("kb", 10)] {
        let size = 1u64 << shift;
        if bytes % size == 0 {
            return format!("{}{unit}", bytes / size);
        }
    }
    format!("{bytes}b")
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in JSON configuration files.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
    }
}

/// Same as `duration_serde`, for optional durations.
mod option_duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(deserializer)?
            .map(|seconds| Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_config_validation() {
        assert!(WriteConfig::default().validate().is_ok());
        assert!(WriteConfig::new("").validate().is_err());
        assert!(WriteConfig::new("Prom").validate().is_err());
        assert!(WriteConfig::default().with_workers(0).validate().is_err());
        assert!(WriteConfig::default().with_max_docs(0).validate().is_err());
        assert!(WriteConfig::default().with_max_bytes(0).validate().is_err());
        assert!(WriteConfig::default().with_queue_capacity(0).validate().is_err());
        assert!(
            WriteConfig::default()
                .with_max_age(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_read_config_validation() {
        assert!(ReadConfig::for_alias("metrics").validate().is_ok());
        assert_eq!(ReadConfig::for_alias("metrics").search_alias, "metrics-search");
        assert!(ReadConfig::default().with_max_docs(0).validate().is_err());

        let empty = ReadConfig {
            search_alias: "  ".to_string(),
            max_docs: 10,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_index_config_validation() {
        assert!(IndexConfig::default().validate().is_ok());
        assert!(IndexConfig::new("a b").validate().is_err());
        assert!(IndexConfig::new("ok").with_shards(0, 1).validate().is_err());
        assert!(
            IndexConfig::new("ok")
                .with_check_interval(Duration::ZERO)
                .validate()
                .is_err()
        );

        let zero_docs = RolloverConditions {
            max_docs: Some(0),
            ..RolloverConditions::default()
        };
        assert!(IndexConfig::new("ok").with_rollover(zero_docs).validate().is_err());

        let mut same = IndexConfig::new("ok");
        same.search_alias = "ok".to_string();
        assert!(same.validate().is_err());
    }

    #[test]
    fn test_index_name_rules() {
        assert!(validate_index_name("prom-metrics").is_ok());
        assert!(validate_index_name("-prom").is_err());
        assert!(validate_index_name("_prom").is_err());
        assert!(validate_index_name("prom*").is_err());
        assert!(validate_index_name("..").is_err());
        assert!(validate_index_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_rollover_conditions_empty() {
        assert!(RolloverConditions::default().is_empty());
        assert!(!IndexConfig::default().rollover.is_empty());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration(" 2h ").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("d").is_err());
        assert!(parse_duration("3w").is_err());
        assert!(parse_duration("1.5h").is_err());
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("512b").unwrap(), 512);
        assert_eq!(parse_byte_size("2kb").unwrap(), 2048);
        assert_eq!(parse_byte_size("5GB").unwrap(), 5 << 30);
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("5pb").is_err());
    }

    #[test]
    fn test_format_roundtrips_through_parse() {
        for input in ["7d", "12h", "5m", "30s", "250ms"] {
            let parsed = parse_duration(input).unwrap();
            assert_eq!(format_duration(parsed), input);
        }
        assert_eq!(format_byte_size(5 << 30), "5gb");
        assert_eq!(format_byte_size(1500), "1500b");
    }

    #[test]
    fn test_config_serde() {
        let config = IndexConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: IndexConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
