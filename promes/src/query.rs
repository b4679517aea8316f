//! Read path: label matchers to searches, hits back to time series.
//!
//! Each [`Query`] becomes one search against the search alias. Every
//! matcher turns into a filter or exclusion clause on `label.<name>` and a
//! timestamp range over the query window is always added. Hits are
//! regrouped by label-set [`Fingerprint`](crate::series::Fingerprint), so
//! documents written in different batches, or living in different index
//! generations, come back as one series.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{Span, debug, info_span};

use crate::backend::{
    self, DocumentStore, SearchHit, SearchRequest, SortField, SortOrder, TIMESTAMP_FIELD,
    label_path,
};
use crate::config::ReadConfig;
use crate::error::{QueryError, Result};
use crate::series::{SampleDocument, TimeSeries};

/// How a matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Value equals.
    Equal,
    /// Value does not equal. Also matches series without the label.
    NotEqual,
    /// Value matches an anchored regular expression.
    RegexMatch,
    /// Value does not match an anchored regular expression.
    RegexNoMatch,
    /// A matcher type code this adapter does not know.
    Unknown(i32),
}

impl MatchKind {
    /// Maps a remote-read matcher type code.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Equal,
            1 => Self::NotEqual,
            2 => Self::RegexMatch,
            3 => Self::RegexNoMatch,
            other => Self::Unknown(other),
        }
    }

    /// Returns the remote-read matcher type code.
    pub fn code(self) -> i32 {
        match self {
            Self::Equal => 0,
            Self::NotEqual => 1,
            Self::RegexMatch => 2,
            Self::RegexNoMatch => 3,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => f.write_str("="),
            Self::NotEqual => f.write_str("!="),
            Self::RegexMatch => f.write_str("=~"),
            Self::RegexNoMatch => f.write_str("!~"),
            Self::Unknown(code) => write!(f, "<{code}>"),
        }
    }
}

/// A predicate on one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    /// Comparison.
    pub kind: MatchKind,
    /// Label name.
    pub name: String,
    /// Value or pattern.
    pub value: String,
}

impl LabelMatcher {
    /// Creates a matcher.
    pub fn new(kind: MatchKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A read query: all matchers must hold, within an inclusive time range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Predicates, combined with AND.
    pub matchers: Vec<LabelMatcher>,
    /// Inclusive start, milliseconds since epoch.
    pub start_ms: i64,
    /// Inclusive end, milliseconds since epoch.
    pub end_ms: i64,
}

impl Query {
    /// Creates a query.
    pub fn new(matchers: Vec<LabelMatcher>, start_ms: i64, end_ms: i64) -> Self {
        Self {
            matchers,
            start_ms,
            end_ms,
        }
    }
}

/// The series matching one [`Query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Matching series, ordered by label set.
    pub timeseries: Vec<TimeSeries>,
}

/// Translates queries into searches and reassembles the results.
pub struct QueryEngine {
    store: Arc<dyn DocumentStore>,
    config: ReadConfig,
    span: Span,
}

impl fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryEngine {
    /// Creates a query engine over `store`.
    ///
    /// # Errors
    ///
    /// Returns a config error if `config` is invalid.
    pub fn new(store: Arc<dyn DocumentStore>, config: ReadConfig) -> Result<Self> {
        config.validate()?;
        let span = info_span!("query_engine", search_alias = %config.search_alias);
        Ok(Self {
            store,
            config,
            span,
        })
    }

    /// Returns the engine's configuration.
    pub fn config(&self) -> &ReadConfig {
        &self.config
    }

    /// Builds the search for one query.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::UnknownMatcher`] for a matcher type this
    /// adapter does not know, and [`QueryError::InvalidTimeRange`] if the
    /// range is inverted.
    pub fn build_search(&self, query: &Query) -> Result<SearchRequest> {
        if query.start_ms > query.end_ms {
            return Err(QueryError::InvalidTimeRange {
                start: query.start_ms,
                end: query.end_ms,
            }
            .into());
        }

        let mut filter = Vec::with_capacity(query.matchers.len() + 1);
        let mut must_not = Vec::new();

        for matcher in &query.matchers {
            let field = label_path(&matcher.name);
            let value = matcher.value.clone();
            match matcher.kind {
                MatchKind::Equal => filter.push(backend::Query::Term { field, value }),
                MatchKind::NotEqual => must_not.push(backend::Query::Term { field, value }),
                MatchKind::RegexMatch => filter.push(backend::Query::Regexp { field, value }),
                MatchKind::RegexNoMatch => must_not.push(backend::Query::Regexp { field, value }),
                MatchKind::Unknown(code) => {
                    return Err(QueryError::UnknownMatcher {
                        code,
                        name: matcher.name.clone(),
                    }
                    .into());
                }
            }
        }

        filter.push(backend::Query::Range {
            field: TIMESTAMP_FIELD.to_string(),
            gte: query.start_ms,
            lte: query.end_ms,
        });

        Ok(SearchRequest {
            query: backend::Query::Bool { filter, must_not },
            size: self.config.max_docs,
            sort: vec![SortField {
                field: TIMESTAMP_FIELD.to_string(),
                order: SortOrder::Asc,
            }],
        })
    }

    /// Runs queries in order, one search each.
    ///
    /// # Errors
    ///
    /// Returns the first query or backend error. Earlier results are
    /// discarded.
    pub fn read(&self, queries: &[Query]) -> Result<Vec<QueryResult>> {
        let _enter = self.span.enter();
        let mut results = Vec::with_capacity(queries.len());

        for query in queries {
            let request = self.build_search(query)?;
            let response = self.store.search(&self.config.search_alias, &request)?;

            let total = response.total_hits();
            let returned = response.hits.hits.len();
            if total > returned as u64 {
                debug!(
                    total,
                    returned,
                    start_ms = query.start_ms,
                    end_ms = query.end_ms,
                    "query result truncated"
                );
            }

            let timeseries = group_hits(response.hits.hits)?;
            debug!(series = timeseries.len(), documents = returned, "query answered");
            results.push(QueryResult { timeseries });
        }

        Ok(results)
    }
}

/// Groups search hits into series by label-set fingerprint.
///
/// Samples of each series are sorted by timestamp (stable, so duplicates
/// keep hit order) and series are ordered by label set.
///
/// # Errors
///
/// Returns [`QueryError::MalformedHit`] if a hit is not a sample document.
pub fn group_hits(hits: Vec<SearchHit>) -> Result<Vec<TimeSeries>> {
    let mut groups: HashMap<_, TimeSeries> = HashMap::new();

    for hit in hits {
        let doc: SampleDocument =
            serde_json::from_value(hit.source).map_err(|e| QueryError::MalformedHit {
                id: hit.id,
                source: e,
            })?;
        let sample = doc.sample();
        groups
            .entry(doc.label.fingerprint())
            .or_insert_with(|| TimeSeries::new(doc.label, Vec::new()))
            .samples
            .push(sample);
    }

    let mut series: Vec<_> = groups.into_values().collect();
    for ts in &mut series {
        ts.samples.sort_by_key(|s| s.timestamp);
    }
    series.sort_by(|a, b| a.labels.cmp(&b.labels));
    Ok(series)
}
