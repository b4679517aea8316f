//! Document store abstraction and the request/response types it speaks.
//!
//! The adapter only needs a narrow slice of an Elasticsearch-compatible
//! REST API: index templates, index and alias existence, index creation,
//! conditional rollover, bulk indexing, search and cluster health. That
//! slice is captured by the [`DocumentStore`] trait so the write, read and
//! lifecycle components can run against either a real cluster
//! ([`ElasticClient`]) or an in-process store ([`MemoryStore`]).
//!
//! Request types serialize to the JSON bodies Elasticsearch expects and
//! response types deserialize from its replies, so [`ElasticClient`] is a
//! thin transport and [`MemoryStore`] interprets the same typed values.

pub mod elastic;
pub mod memory;

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::{IndexConfig, RolloverConditions, format_byte_size, format_duration};
use crate::error::BackendError;
use crate::series::SampleDocument;

pub use elastic::{ElasticClient, ElasticConfig};
pub use memory::MemoryStore;

/// Result type for backend calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Document field holding the sample timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Document field holding the sample value.
pub const VALUE_FIELD: &str = "value";

/// Document object holding the label set.
pub const LABEL_FIELD: &str = "label";

/// Date format accepted for the timestamp field.
pub const TIMESTAMP_FORMAT: &str = "strict_date_optional_time||epoch_millis";

/// Returns the document path of label `name`, e.g. `label.job`.
pub fn label_path(name: &str) -> String {
    format!("{LABEL_FIELD}.{name}")
}

/// Operations the adapter performs against the document store.
///
/// Implementations must be safe to share across the write workers, the
/// read path and the rollover task.
pub trait DocumentStore: Send + Sync {
    /// Registers (or overwrites) the index template `name`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store rejects the template or is
    /// unreachable.
    fn put_template(&self, name: &str, template: &IndexTemplate) -> BackendResult<()>;

    /// Returns `true` if an index or alias named `name` exists.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store is unreachable.
    fn exists(&self, name: &str) -> BackendResult<bool>;

    /// Creates the concrete index `index`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the index already exists or the store is
    /// unreachable.
    fn create_index(&self, index: &str, request: &CreateIndex) -> BackendResult<()>;

    /// Rolls `alias` over to a new index if any of the request's conditions
    /// holds for the current write index.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the alias has no write index or the store
    /// is unreachable.
    fn rollover(&self, alias: &str, request: &RolloverRequest) -> BackendResult<RolloverResponse>;

    /// Submits a batch of index operations in one request.
    ///
    /// Per-document failures are reported in the returned items, not as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the request as a whole fails.
    fn bulk(&self, operations: &[BulkOperation]) -> BackendResult<BulkResponse>;

    /// Runs a search against an index, alias or pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the target does not exist, the query is
    /// malformed, or the store is unreachable.
    fn search(&self, index: &str, request: &SearchRequest) -> BackendResult<SearchResponse>;

    /// Returns the cluster health status.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the store is unreachable.
    fn cluster_health(&self) -> BackendResult<ClusterHealth>;
}

/// Options attached to an alias on an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasOptions {
    /// Marks the index as the one writes to the alias go to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_write_index: Option<bool>,
}

impl AliasOptions {
    /// Options for the write index of an alias.
    pub fn write_index() -> Self {
        Self {
            is_write_index: Some(true),
        }
    }
}

/// Shard layout of an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    /// Primary shard count.
    pub number_of_shards: u32,
    /// Replicas per primary.
    pub number_of_replicas: u32,
}

/// Legacy index template body (`PUT /_template/{name}`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexTemplate {
    /// Index name patterns the template applies to.
    pub index_patterns: Vec<String>,
    /// Shard layout.
    pub settings: IndexSettings,
    /// Field mappings.
    pub mappings: serde_json::Value,
    /// Aliases every matching index joins on creation.
    pub aliases: BTreeMap<String, AliasOptions>,
}

impl IndexTemplate {
    /// Builds the sample-document template for an index configuration.
    ///
    /// Timestamps map to `date`, values to `double`, and every string under
    /// `label.` to `keyword` so label matchers hit exact terms.
    pub fn for_config(config: &IndexConfig) -> Self {
        let mappings = serde_json::json!({
            "dynamic_templates": [{
                "labels": {
                    "path_match": format!("{LABEL_FIELD}.*"),
                    "match_mapping_type": "string",
                    "mapping": { "type": "keyword" },
                },
            }],
            "properties": {
                TIMESTAMP_FIELD: { "type": "date", "format": TIMESTAMP_FORMAT },
                VALUE_FIELD: { "type": "double" },
            },
        });

        Self {
            index_patterns: vec![format!("{}-*", config.alias)],
            settings: IndexSettings {
                number_of_shards: config.shards,
                number_of_replicas: config.replicas,
            },
            mappings,
            aliases: BTreeMap::from([(config.search_alias.clone(), AliasOptions::default())]),
        }
    }

    /// Returns `true` if `index` matches one of the template's patterns.
    ///
    /// Patterns support a single trailing or embedded `*` wildcard.
    pub fn matches(&self, index: &str) -> bool {
        self.index_patterns.iter().any(|p| wildcard_match(p, index))
    }
}

/// Body for `PUT /{index}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateIndex {
    /// Aliases to attach to the new index.
    pub aliases: BTreeMap<String, AliasOptions>,
}

impl CreateIndex {
    /// Creates an index that is the write index of `alias`.
    pub fn with_write_alias(alias: impl Into<String>) -> Self {
        Self {
            aliases: BTreeMap::from([(alias.into(), AliasOptions::write_index())]),
        }
    }
}

/// Body for `POST /{alias}/_rollover`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloverRequest {
    /// Conditions evaluated against the current write index.
    pub conditions: RolloverConditions,
}

impl Serialize for RolloverRequest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Conditions<'a>(&'a RolloverConditions);

        impl Serialize for Conditions<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(None)?;
                if let Some(age) = self.0.max_age {
                    map.serialize_entry("max_age", &format_duration(age))?;
                }
                if let Some(docs) = self.0.max_docs {
                    map.serialize_entry("max_docs", &docs)?;
                }
                if let Some(size) = self.0.max_size {
                    map.serialize_entry("max_size", &format_byte_size(size))?;
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("conditions", &Conditions(&self.conditions))?;
        map.end()
    }
}

/// Reply to a rollover request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverResponse {
    /// The write index before the call.
    pub old_index: String,
    /// The index that is (or would have been) created.
    pub new_index: String,
    /// Whether the alias now points at `new_index`.
    pub rolled_over: bool,
    /// Per-condition evaluation results, keyed like `[max_docs: 1000]`.
    #[serde(default)]
    pub conditions: BTreeMap<String, bool>,
}

/// One `index` action of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOperation {
    /// Target index or alias.
    pub index: String,
    /// Serialized document.
    pub source: Vec<u8>,
}

/// Fixed part of the bulk action line: `{"index":{"_index":""}}`.
const ACTION_LINE_OVERHEAD: usize = 23;

impl BulkOperation {
    /// Serializes `doc` into an index operation against `index`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Serde`] if the document cannot be serialized.
    pub fn new(index: impl Into<String>, doc: &SampleDocument) -> BackendResult<Self> {
        let source = serde_json::to_vec(doc).map_err(|e| BackendError::Serde {
            operation: "bulk",
            source: e,
        })?;
        Ok(Self {
            index: index.into(),
            source,
        })
    }

    /// Size this operation adds to an NDJSON bulk body: the action line,
    /// the source and two newlines.
    pub fn estimated_size(&self) -> usize {
        ACTION_LINE_OVERHEAD + self.index.len() + self.source.len() + 2
    }

    /// Appends the action and source lines to an NDJSON body.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Serde`] if the action line cannot be written.
    pub fn write_ndjson(&self, body: &mut Vec<u8>) -> BackendResult<()> {
        let action = serde_json::json!({ "index": { "_index": self.index } });
        serde_json::to_writer(&mut *body, &action).map_err(|e| BackendError::Serde {
            operation: "bulk",
            source: e,
        })?;
        body.push(b'\n');
        body.extend_from_slice(&self.source);
        body.push(b'\n');
        Ok(())
    }
}

/// Outcome recorded for a bulk item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkResult {
    /// A new document was written.
    Created,
    /// An existing document was replaced.
    Updated,
    /// A document was removed.
    Deleted,
    /// Nothing changed.
    Noop,
    /// The target document was missing.
    NotFound,
    /// Any result this adapter does not track.
    #[serde(other)]
    Other,
}

/// Per-document entry of a bulk reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    /// Concrete index the document went to.
    #[serde(rename = "_index", default)]
    pub index: String,
    /// Assigned document id.
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    /// HTTP-style status of this item.
    pub status: u16,
    /// Outcome, present on success.
    #[serde(default)]
    pub result: Option<BulkResult>,
    /// Error detail, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
}

impl BulkItem {
    /// Returns `true` for a 2xx item status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Reply to a bulk request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkResponse {
    /// Milliseconds the store spent on the request.
    #[serde(default)]
    pub took: u64,
    /// `true` if any item failed.
    #[serde(default)]
    pub errors: bool,
    /// One entry per operation, in request order.
    #[serde(deserialize_with = "deserialize_bulk_items", default)]
    pub items: Vec<BulkItem>,
}

/// Bulk items arrive wrapped in their action name: `{"index": {...}}`.
fn deserialize_bulk_items<'de, D>(deserializer: D) -> Result<Vec<BulkItem>, D::Error>
where
    D: Deserializer<'de>,
{
    let wrapped = Vec::<BTreeMap<String, BulkItem>>::deserialize(deserializer)?;
    Ok(wrapped
        .into_iter()
        .filter_map(|action| action.into_values().next())
        .collect())
}

/// Search query clauses.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// All `filter` clauses must match and no `must_not` clause may match.
    Bool {
        /// Required clauses.
        filter: Vec<Query>,
        /// Excluded clauses.
        must_not: Vec<Query>,
    },
    /// Exact value match on a keyword field.
    Term {
        /// Field path.
        field: String,
        /// Exact value.
        value: String,
    },
    /// Whole-value regular expression match on a keyword field.
    Regexp {
        /// Field path.
        field: String,
        /// Pattern, implicitly anchored at both ends.
        value: String,
    },
    /// Inclusive numeric range.
    Range {
        /// Field path.
        field: String,
        /// Lower bound, inclusive.
        gte: i64,
        /// Upper bound, inclusive.
        lte: i64,
    },
}

/// Serializes as a single-entry object `{key: value}`.
struct Single<'a, V: ?Sized>(&'a str, &'a V);

impl<V: Serialize + ?Sized> Serialize for Single<'_, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.0, self.1)?;
        map.end()
    }
}

#[derive(Serialize)]
struct Bounds {
    gte: i64,
    lte: i64,
}

impl Serialize for Query {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Self::Bool { filter, must_not } => {
                #[derive(Serialize)]
                struct BoolBody<'a> {
                    #[serde(skip_serializing_if = "Vec::is_empty")]
                    filter: &'a Vec<Query>,
                    #[serde(skip_serializing_if = "Vec::is_empty")]
                    must_not: &'a Vec<Query>,
                }
                map.serialize_entry("bool", &BoolBody { filter, must_not })?;
            }
            Self::Term { field, value } => {
                map.serialize_entry("term", &Single(field, value))?;
            }
            Self::Regexp { field, value } => {
                map.serialize_entry("regexp", &Single(field, value))?;
            }
            Self::Range { field, gte, lte } => {
                let bounds = Bounds {
                    gte: *gte,
                    lte: *lte,
                };
                map.serialize_entry("range", &Single(field, &bounds))?;
            }
        }
        map.end()
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// One sort key of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    /// Field path.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

impl Serialize for SortField {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Single(&self.field, &Single("order", &self.order)).serialize(serializer)
    }
}

/// Body for `POST /{index}/_search`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    /// The query.
    pub query: Query,
    /// Maximum number of hits returned.
    pub size: usize,
    /// Sort keys, most significant first.
    pub sort: Vec<SortField>,
}

/// Total hit count, reported as a bare number by older servers and as an
/// object by newer ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HitsTotal {
    /// `"total": 42`
    Count(u64),
    /// `"total": {"value": 42, "relation": "eq"}`
    Object {
        /// The count.
        value: u64,
    },
}

impl HitsTotal {
    /// Returns the count.
    pub fn value(self) -> u64 {
        match self {
            Self::Count(value) | Self::Object { value } => value,
        }
    }
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Index holding the document.
    #[serde(rename = "_index", default)]
    pub index: String,
    /// Document id.
    #[serde(rename = "_id", default)]
    pub id: String,
    /// The stored document.
    #[serde(rename = "_source")]
    pub source: serde_json::Value,
}

/// The `hits` section of a search reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHits {
    /// Matches before the size cap.
    pub total: HitsTotal,
    /// Returned hits.
    #[serde(default)]
    pub hits: Vec<SearchHit>,
}

/// Reply to a search request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Milliseconds the store spent on the search.
    #[serde(default)]
    pub took: u64,
    /// Matches.
    pub hits: SearchHits,
}

impl SearchResponse {
    /// Number of documents matching the query, including ones not returned.
    pub fn total_hits(&self) -> u64 {
        self.hits.total.value()
    }
}

/// Cluster health colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All shards allocated.
    Green,
    /// All primaries allocated, some replicas missing.
    Yellow,
    /// Some primaries unallocated.
    Red,
}

/// Reply to `GET /_cluster/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    /// Cluster name, if reported.
    #[serde(default)]
    pub cluster_name: Option<String>,
    /// Health colour.
    pub status: HealthStatus,
}

impl ClusterHealth {
    /// Returns `true` if the cluster can serve reads and writes
    /// (green or yellow).
    pub fn is_serviceable(&self) -> bool {
        matches!(self.status, HealthStatus::Green | HealthStatus::Yellow)
    }
}

/// Matches `name` against a pattern with at most one `*` wildcard.
pub(crate) fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => pattern == name,
    }
}
