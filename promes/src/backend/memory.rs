//! In-process document store.
//!
//! [`MemoryStore`] implements the [`DocumentStore`] contract with the
//! semantics the adapter relies on: templates applied at index creation,
//! alias indirection with a single write index, atomic conditional
//! rollover, per-item bulk statuses, and bool/term/regexp/range search.
//! It backs the test suites and benches, and `--in-memory` runs of the
//! adapter.
//!
//! Test hooks ([`set_unavailable`](MemoryStore::set_unavailable),
//! [`set_health`](MemoryStore::set_health),
//! [`bulk_calls`](MemoryStore::bulk_calls) and friends) let callers
//! simulate outages and observe what reached the store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;

use super::{
    AliasOptions, BackendResult, BulkItem, BulkOperation, BulkResponse, BulkResult,
    ClusterHealth, CreateIndex, DocumentStore, HealthStatus, HitsTotal, IndexTemplate, Query,
    RolloverRequest, RolloverResponse, SearchHit, SearchHits, SearchRequest, SearchResponse,
    SortOrder, wildcard_match,
};
use crate::config::format_duration;
use crate::error::BackendError;
use crate::series::SampleDocument;

/// Width of the numeric generation suffix when none can be inferred.
const GENERATION_DIGITS: usize = 6;

#[derive(Debug)]
struct StoredDoc {
    id: String,
    source: Value,
}

#[derive(Debug)]
struct MemoryIndex {
    created: Instant,
    aliases: BTreeMap<String, AliasOptions>,
    docs: Vec<StoredDoc>,
    size_bytes: u64,
}

impl MemoryIndex {
    fn new(aliases: BTreeMap<String, AliasOptions>) -> Self {
        Self {
            created: Instant::now(),
            aliases,
            docs: Vec::new(),
            size_bytes: 0,
        }
    }

    fn is_write_index_of(&self, alias: &str) -> bool {
        self.aliases
            .get(alias)
            .is_some_and(|opts| opts.is_write_index == Some(true))
    }
}

#[derive(Debug, Default)]
struct State {
    templates: BTreeMap<String, IndexTemplate>,
    indices: BTreeMap<String, MemoryIndex>,
    next_id: u64,
}

impl State {
    fn alias_exists(&self, alias: &str) -> bool {
        self.indices.values().any(|idx| idx.aliases.contains_key(alias))
    }

    /// Resolves an index name, alias or wildcard pattern to concrete
    /// indices.
    fn resolve_read(&self, target: &str) -> Vec<String> {
        if self.indices.contains_key(target) {
            return vec![target.to_string()];
        }
        self.indices
            .iter()
            .filter(|(name, idx)| {
                idx.aliases.contains_key(target) || (target.contains('*') && wildcard_match(target, name))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resolves the index a write addressed to `target` lands in.
    fn resolve_write(&self, target: &str) -> Option<String> {
        if self.indices.contains_key(target) {
            return Some(target.to_string());
        }
        let members: Vec<_> = self
            .indices
            .iter()
            .filter(|(_, idx)| idx.aliases.contains_key(target))
            .collect();
        if let [(name, _)] = members.as_slice() {
            return Some((*name).clone());
        }
        members
            .into_iter()
            .find(|(_, idx)| idx.is_write_index_of(target))
            .map(|(name, _)| name.clone())
    }

    fn create(&mut self, name: &str, explicit: &BTreeMap<String, AliasOptions>) {
        let mut aliases = BTreeMap::new();
        for template in self.templates.values().filter(|t| t.matches(name)) {
            aliases.extend(template.aliases.clone());
        }
        aliases.extend(explicit.clone());
        self.indices.insert(name.to_string(), MemoryIndex::new(aliases));
    }
}

/// Thread-safe in-memory [`DocumentStore`].
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
    health: RwLock<HealthStatus>,
    bulk_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty, healthy store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            unavailable: AtomicBool::new(false),
            health: RwLock::new(HealthStatus::Green),
            bulk_calls: AtomicUsize::new(0),
        }
    }

    /// Makes every subsequent call fail with [`BackendError::Unavailable`]
    /// until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sets the status reported by `cluster_health`.
    pub fn set_health(&self, status: HealthStatus) {
        *self.health.write() = status;
    }

    /// Names of all concrete indices, sorted.
    pub fn index_names(&self) -> Vec<String> {
        self.state.read().indices.keys().cloned().collect()
    }

    /// The index writes to `alias` currently land in.
    pub fn write_index(&self, alias: &str) -> Option<String> {
        self.state.read().resolve_write(alias)
    }

    /// Number of documents in an index, or across all indices behind an
    /// alias.
    pub fn doc_count(&self, target: &str) -> usize {
        let state = self.state.read();
        state
            .resolve_read(target)
            .iter()
            .filter_map(|name| state.indices.get(name))
            .map(|idx| idx.docs.len())
            .sum()
    }

    /// Number of bulk requests received, including empty ones.
    pub fn bulk_calls(&self) -> usize {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable {
                reason: "memory store marked unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl DocumentStore for MemoryStore {
    fn put_template(&self, name: &str, template: &IndexTemplate) -> BackendResult<()> {
        self.check_available()?;
        self.state
            .write()
            .templates
            .insert(name.to_string(), template.clone());
        Ok(())
    }

    fn exists(&self, name: &str) -> BackendResult<bool> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state.indices.contains_key(name) || state.alias_exists(name))
    }

    fn create_index(&self, index: &str, request: &CreateIndex) -> BackendResult<()> {
        self.check_available()?;
        let mut state = self.state.write();
        if state.indices.contains_key(index) || state.alias_exists(index) {
            return Err(BackendError::Status {
                operation: "create_index",
                status: 400,
                body: format!("resource_already_exists_exception: index [{index}] already exists"),
            });
        }
        state.create(index, &request.aliases);
        Ok(())
    }

    fn rollover(&self, alias: &str, request: &RolloverRequest) -> BackendResult<RolloverResponse> {
        self.check_available()?;
        let mut state = self.state.write();

        let old_index = state
            .resolve_write(alias)
            .filter(|name| !state.indices.contains_key(alias) && name != alias)
            .ok_or_else(|| BackendError::IndexNotFound {
                name: alias.to_string(),
            })?;
        let new_index = next_generation(&old_index);

        let mut conditions = BTreeMap::new();
        if let Some(current) = state.indices.get(&old_index) {
            let cond = &request.conditions;
            if let Some(max_age) = cond.max_age {
                conditions.insert(
                    format!("[max_age: {}]", format_duration(max_age)),
                    current.created.elapsed() >= max_age,
                );
            }
            if let Some(max_docs) = cond.max_docs {
                conditions.insert(
                    format!("[max_docs: {max_docs}]"),
                    current.docs.len() as u64 >= max_docs,
                );
            }
            if let Some(max_size) = cond.max_size {
                conditions.insert(
                    format!("[max_size: {max_size}b]"),
                    current.size_bytes >= max_size,
                );
            }
        }

        let rolled_over = conditions.is_empty() || conditions.values().any(|met| *met);
        if rolled_over {
            if state.indices.contains_key(&new_index) {
                return Err(BackendError::Status {
                    operation: "rollover",
                    status: 400,
                    body: format!("resource_already_exists_exception: index [{new_index}] already exists"),
                });
            }
            if let Some(current) = state.indices.get_mut(&old_index) {
                current.aliases.insert(
                    alias.to_string(),
                    AliasOptions {
                        is_write_index: Some(false),
                    },
                );
            }
            let aliases = BTreeMap::from([(alias.to_string(), AliasOptions::write_index())]);
            state.create(&new_index, &aliases);
        }

        Ok(RolloverResponse {
            old_index,
            new_index,
            rolled_over,
            conditions,
        })
    }

    fn bulk(&self, operations: &[BulkOperation]) -> BackendResult<BulkResponse> {
        self.check_available()?;
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        let mut state = self.state.write();
        let mut items = Vec::with_capacity(operations.len());

        for op in operations {
            let Some(target) = state.resolve_write(&op.index) else {
                items.push(failed_item(
                    &op.index,
                    404,
                    "index_not_found_exception",
                    format!("no such index [{}]", op.index),
                ));
                continue;
            };

            let parsed = serde_json::from_slice::<SampleDocument>(&op.source)
                .map_err(|e| e.to_string())
                .and_then(|doc| serde_json::to_value(doc).map_err(|e| e.to_string()));
            let source = match parsed {
                Ok(source) => source,
                Err(reason) => {
                    items.push(failed_item(&target, 400, "mapper_parsing_exception", reason));
                    continue;
                }
            };

            state.next_id += 1;
            let id = format!("{:x}", state.next_id);
            let size = op.source.len() as u64;
            if let Some(index) = state.indices.get_mut(&target) {
                index.size_bytes += size;
                index.docs.push(StoredDoc {
                    id: id.clone(),
                    source,
                });
            }
            items.push(BulkItem {
                index: target,
                id: Some(id),
                status: 201,
                result: Some(BulkResult::Created),
                error: None,
            });
        }

        Ok(BulkResponse {
            took: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            errors: items.iter().any(|item| !item.is_success()),
            items,
        })
    }

    fn search(&self, index: &str, request: &SearchRequest) -> BackendResult<SearchResponse> {
        self.check_available()?;
        let started = Instant::now();
        let matcher = Matcher::compile(&request.query)?;

        let state = self.state.read();
        let targets = state.resolve_read(index);
        if targets.is_empty() {
            return Err(BackendError::IndexNotFound {
                name: index.to_string(),
            });
        }

        let mut matched: Vec<(&str, &StoredDoc)> = targets
            .iter()
            .filter_map(|name| state.indices.get_key_value(name))
            .flat_map(|(name, idx)| idx.docs.iter().map(move |doc| (name.as_str(), doc)))
            .filter(|(_, doc)| matcher.matches(&doc.source))
            .collect();

        matched.sort_by(|(_, a), (_, b)| {
            request
                .sort
                .iter()
                .map(|key| {
                    let ordering = compare_values(
                        lookup(&a.source, &key.field),
                        lookup(&b.source, &key.field),
                    );
                    match key.order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                })
                .find(|o| o.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let total = matched.len() as u64;
        let hits = matched
            .into_iter()
            .take(request.size)
            .map(|(name, doc)| SearchHit {
                index: name.to_string(),
                id: doc.id.clone(),
                source: doc.source.clone(),
            })
            .collect();

        Ok(SearchResponse {
            took: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            hits: SearchHits {
                total: HitsTotal::Object { value: total },
                hits,
            },
        })
    }

    fn cluster_health(&self) -> BackendResult<ClusterHealth> {
        self.check_available()?;
        Ok(ClusterHealth {
            cluster_name: Some("memory".to_string()),
            status: *self.health.read(),
        })
    }
}

fn failed_item(index: &str, status: u16, kind: &str, reason: String) -> BulkItem {
    BulkItem {
        index: index.to_string(),
        id: None,
        status,
        result: None,
        error: Some(serde_json::json!({ "type": kind, "reason": reason })),
    }
}

/// Returns the name of the generation after `index`: the trailing number
/// is incremented keeping its width, or `-000001` is appended.
fn next_generation(index: &str) -> String {
    let digits = index.len() - index.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (prefix, number) = index.split_at(index.len() - digits);
    match number.parse::<u64>() {
        Ok(n) => format!("{prefix}{:0width$}", n + 1, width = digits),
        Err(_) => format!("{index}-{:0width$}", 1, width = GENERATION_DIGITS),
    }
}

/// Looks up a dotted field path in a document.
fn lookup<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(source, |value, key| value.get(key))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        _ => std::cmp::Ordering::Equal,
    }
}

/// A [`Query`] with its regular expressions compiled.
enum Matcher {
    Bool {
        filter: Vec<Matcher>,
        must_not: Vec<Matcher>,
    },
    Term {
        field: String,
        value: String,
    },
    Regexp {
        field: String,
        regex: Regex,
    },
    Range {
        field: String,
        gte: i64,
        lte: i64,
    },
}

impl Matcher {
    fn compile(query: &Query) -> BackendResult<Self> {
        Ok(match query {
            Query::Bool { filter, must_not } => Self::Bool {
                filter: filter.iter().map(Self::compile).collect::<BackendResult<_>>()?,
                must_not: must_not
                    .iter()
                    .map(Self::compile)
                    .collect::<BackendResult<_>>()?,
            },
            Query::Term { field, value } => Self::Term {
                field: field.clone(),
                value: value.clone(),
            },
            Query::Regexp { field, value } => Self::Regexp {
                field: field.clone(),
                regex: Regex::new(&format!("^(?:{value})$")).map_err(|e| {
                    BackendError::InvalidQuery {
                        reason: format!("invalid regexp on {field}: {e}"),
                    }
                })?,
            },
            Query::Range { field, gte, lte } => Self::Range {
                field: field.clone(),
                gte: *gte,
                lte: *lte,
            },
        })
    }

    fn matches(&self, doc: &Value) -> bool {
        match self {
            Self::Bool { filter, must_not } => {
                filter.iter().all(|m| m.matches(doc)) && !must_not.iter().any(|m| m.matches(doc))
            }
            Self::Term { field, value } => match lookup(doc, field) {
                Some(Value::String(s)) => s == value,
                Some(Value::Number(n)) => n.to_string() == *value,
                Some(Value::Bool(b)) => b.to_string() == *value,
                _ => false,
            },
            Self::Regexp { field, regex } => {
                matches!(lookup(doc, field), Some(Value::String(s)) if regex.is_match(s))
            }
            Self::Range { field, gte, lte } => lookup(doc, field)
                .and_then(Value::as_i64)
                .is_some_and(|v| (*gte..=*lte).contains(&v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SortField, TIMESTAMP_FIELD, label_path};
    use crate::config::{IndexConfig, RolloverConditions};
    use crate::series::Labels;

    fn op(index: &str, job: &str, ts: i64) -> BulkOperation {
        let doc = SampleDocument {
            label: Labels::from_pairs([("__name__", "up"), ("job", job)]),
            value: 1.0,
            timestamp: ts,
        };
        BulkOperation::new(index, &doc).unwrap()
    }

    fn bootstrapped(alias: &str) -> MemoryStore {
        let store = MemoryStore::new();
        let config = IndexConfig::new(alias);
        store
            .put_template(alias, &IndexTemplate::for_config(&config))
            .unwrap();
        store
            .create_index(&format!("{alias}-000001"), &CreateIndex::with_write_alias(alias))
            .unwrap();
        store
    }

    fn search_all(size: usize) -> SearchRequest {
        SearchRequest {
            query: Query::Bool {
                filter: vec![],
                must_not: vec![],
            },
            size,
            sort: vec![SortField {
                field: TIMESTAMP_FIELD.to_string(),
                order: SortOrder::Asc,
            }],
        }
    }

    #[test]
    fn test_template_alias_applied() {
        let store = bootstrapped("m");
        assert!(store.exists("m").unwrap());
        assert!(store.exists("m-search").unwrap());
        assert!(store.exists("m-000001").unwrap());
        assert!(!store.exists("other").unwrap());
        assert_eq!(store.write_index("m").as_deref(), Some("m-000001"));
    }

    #[test]
    fn test_create_existing_index_fails() {
        let store = bootstrapped("m");
        let err = store
            .create_index("m-000001", &CreateIndex::with_write_alias("m"))
            .unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 400, .. }));
    }

    #[test]
    fn test_bulk_item_statuses() {
        let store = bootstrapped("m");
        let bad = BulkOperation {
            index: "m".to_string(),
            source: br#"{"not":"a sample"}"#.to_vec(),
        };
        let response = store
            .bulk(&[op("m", "a", 1), bad, op("missing", "a", 2)])
            .unwrap();

        assert!(response.errors);
        assert_eq!(response.items[0].status, 201);
        assert_eq!(response.items[0].index, "m-000001");
        assert_eq!(response.items[1].status, 400);
        assert_eq!(response.items[2].status, 404);
        assert_eq!(store.doc_count("m"), 1);
        assert_eq!(store.bulk_calls(), 1);
    }

    #[test]
    fn test_rollover_by_docs() {
        let store = bootstrapped("m");
        let request = RolloverRequest {
            conditions: RolloverConditions {
                max_docs: Some(2),
                ..RolloverConditions::default()
            },
        };

        store.bulk(&[op("m", "a", 1)]).unwrap();
        let response = store.rollover("m", &request).unwrap();
        assert!(!response.rolled_over);
        assert_eq!(response.new_index, "m-000002");
        assert_eq!(response.conditions.get("[max_docs: 2]"), Some(&false));

        store.bulk(&[op("m", "a", 2)]).unwrap();
        let response = store.rollover("m", &request).unwrap();
        assert!(response.rolled_over);
        assert_eq!(store.write_index("m").as_deref(), Some("m-000002"));

        store.bulk(&[op("m", "a", 3)]).unwrap();
        assert_eq!(store.doc_count("m-000001"), 2);
        assert_eq!(store.doc_count("m-000002"), 1);
        assert_eq!(store.doc_count("m-search"), 3);
    }

    #[test]
    fn test_rollover_unknown_alias() {
        let store = MemoryStore::new();
        let request = RolloverRequest {
            conditions: RolloverConditions::default(),
        };
        assert!(matches!(
            store.rollover("m", &request),
            Err(BackendError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn test_search_filters_and_sorts() {
        let store = bootstrapped("m");
        store
            .bulk(&[op("m", "b", 30), op("m", "a", 20), op("m", "a", 10), op("m", "c", 40)])
            .unwrap();

        let request = SearchRequest {
            query: Query::Bool {
                filter: vec![
                    Query::Regexp {
                        field: label_path("job"),
                        value: "a|b".to_string(),
                    },
                    Query::Range {
                        field: TIMESTAMP_FIELD.to_string(),
                        gte: 10,
                        lte: 30,
                    },
                ],
                must_not: vec![Query::Term {
                    field: label_path("job"),
                    value: "b".to_string(),
                }],
            },
            ..search_all(10)
        };

        let response = store.search("m-search", &request).unwrap();
        let timestamps: Vec<_> = response
            .hits
            .hits
            .iter()
            .map(|h| h.source["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![10, 20]);
        assert_eq!(response.total_hits(), 2);
    }

    #[test]
    fn test_search_regexp_is_anchored() {
        let store = bootstrapped("m");
        store.bulk(&[op("m", "node", 1), op("m", "nodes", 2)]).unwrap();

        let request = SearchRequest {
            query: Query::Regexp {
                field: label_path("job"),
                value: "node".to_string(),
            },
            ..search_all(10)
        };
        assert_eq!(store.search("m", &request).unwrap().total_hits(), 1);
    }

    #[test]
    fn test_search_size_truncates() {
        let store = bootstrapped("m");
        store
            .bulk(&[op("m", "a", 3), op("m", "a", 1), op("m", "a", 2)])
            .unwrap();

        let response = store.search("m", &search_all(2)).unwrap();
        assert_eq!(response.total_hits(), 3);
        assert_eq!(response.hits.hits.len(), 2);
        assert_eq!(response.hits.hits[0].source["timestamp"], 1);
    }

    #[test]
    fn test_search_missing_index() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.search("nope", &search_all(1)),
            Err(BackendError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_regexp_rejected() {
        let store = bootstrapped("m");
        let request = SearchRequest {
            query: Query::Regexp {
                field: label_path("job"),
                value: "(".to_string(),
            },
            ..search_all(1)
        };
        assert!(matches!(
            store.search("m", &request),
            Err(BackendError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn test_unavailable_and_health() {
        let store = MemoryStore::new();
        assert!(store.cluster_health().unwrap().is_serviceable());

        store.set_health(HealthStatus::Red);
        assert!(!store.cluster_health().unwrap().is_serviceable());

        store.set_unavailable(true);
        assert!(matches!(
            store.bulk(&[]),
            Err(BackendError::Unavailable { .. })
        ));
        assert_eq!(store.bulk_calls(), 0);
        store.set_unavailable(false);
        assert!(store.bulk(&[]).is_ok());
    }

    #[test]
    fn test_next_generation() {
        assert_eq!(next_generation("m-000001"), "m-000002");
        assert_eq!(next_generation("m-000999"), "m-001000");
        assert_eq!(next_generation("m-1"), "m-2");
        assert_eq!(next_generation("m"), "m-000001");
    }
}
