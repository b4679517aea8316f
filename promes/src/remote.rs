//! Prometheus remote-write and remote-read wire format.
//!
//! Request and response bodies are protobuf messages compressed with raw
//! (unframed) snappy. This module converts between those bodies and the
//! crate's own [`TimeSeries`] and [`Query`] types.
//!
//! # Example
//!
//! ```rust
//! use promes::remote::{decode_write_request, encode_write_request};
//! use promes::series::{Labels, Sample, TimeSeries};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let series = vec![TimeSeries::new(
//!     Labels::from_pairs([("__name__", "up")]),
//!     vec![Sample::new(1.0, 1_700_000_000_000)],
//! )];
//!
//! let body = encode_write_request(&series)?;
//! assert_eq!(decode_write_request(&body)?, series);
//! # Ok(())
//! # }
//! ```

use prost::Message;

use crate::error::{ProtocolError, Result};
use crate::query::{LabelMatcher, MatchKind, Query, QueryResult};
use crate::series::{Labels, Sample, TimeSeries};

/// Prometheus remote storage protobuf types.
///
/// Hand-written types matching `prometheus/prompb/remote.proto` and
/// `types.proto`. Using prost derives avoids the need for protoc and proto
/// file management.
pub mod proto {
    /// A write request containing one or more time series.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        /// The time series to write.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    /// A single time series with labels and samples.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Metric labels identifying the series.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        /// Data samples for this series.
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    /// A key-value label pair.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        /// Label name.
        #[prost(string, tag = "1")]
        pub name: String,
        /// Label value.
        #[prost(string, tag = "2")]
        pub value: String,
    }

    /// A single data sample (value + timestamp).
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        /// The sample value.
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Timestamp in milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }

    /// A read request with one or more queries.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReadRequest {
        /// Queries, answered in order.
        #[prost(message, repeated, tag = "1")]
        pub queries: Vec<Query>,
    }

    /// A single read query.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Query {
        /// Inclusive start, milliseconds since epoch.
        #[prost(int64, tag = "1")]
        pub start_timestamp_ms: i64,
        /// Inclusive end, milliseconds since epoch.
        #[prost(int64, tag = "2")]
        pub end_timestamp_ms: i64,
        /// Matchers, combined with AND.
        #[prost(message, repeated, tag = "3")]
        pub matchers: Vec<LabelMatcher>,
    }

    /// A label predicate.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct LabelMatcher {
        /// Matcher type: 0 = EQ, 1 = NEQ, 2 = RE, 3 = NRE.
        #[prost(int32, tag = "1")]
        pub r#type: i32,
        /// Label name.
        #[prost(string, tag = "2")]
        pub name: String,
        /// Value or pattern.
        #[prost(string, tag = "3")]
        pub value: String,
    }

    /// A read response with one result per query.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ReadResponse {
        /// Results, in query order.
        #[prost(message, repeated, tag = "1")]
        pub results: Vec<QueryResult>,
    }

    /// The series matching one query.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct QueryResult {
        /// Matching series.
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }
}

/// Decodes a snappy-compressed `WriteRequest` body.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the body is not valid snappy or not a valid
/// `WriteRequest`.
pub fn decode_write_request(body: &[u8]) -> Result<Vec<TimeSeries>> {
    let bytes = decompress_snappy(body)?;
    let request =
        proto::WriteRequest::decode(bytes.as_slice()).map_err(|e| ProtocolError::Decode {
            message: "WriteRequest",
            source: e,
        })?;
    Ok(request.timeseries.into_iter().map(from_proto_series).collect())
}

/// Encodes time series as a snappy-compressed `WriteRequest` body.
///
/// # Errors
///
/// Returns [`ProtocolError`] if serialization or compression fails.
pub fn encode_write_request(series: &[TimeSeries]) -> Result<Vec<u8>> {
    let request = proto::WriteRequest {
        timeseries: series.iter().map(to_proto_series).collect(),
    };
    let bytes = encode_message("WriteRequest", &request)?;
    compress_snappy(&bytes)
}

/// Decodes a snappy-compressed `ReadRequest` body.
///
/// Matcher types outside the known set are kept as
/// [`MatchKind::Unknown`] for the query engine to reject.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the body is not valid snappy or not a valid
/// `ReadRequest`.
pub fn decode_read_request(body: &[u8]) -> Result<Vec<Query>> {
    let bytes = decompress_snappy(body)?;
    let request =
        proto::ReadRequest::decode(bytes.as_slice()).map_err(|e| ProtocolError::Decode {
            message: "ReadRequest",
            source: e,
        })?;

    Ok(request
        .queries
        .into_iter()
        .map(|q| Query {
            matchers: q
                .matchers
                .into_iter()
                .map(|m| LabelMatcher {
                    kind: MatchKind::from_code(m.r#type),
                    name: m.name,
                    value: m.value,
                })
                .collect(),
            start_ms: q.start_timestamp_ms,
            end_ms: q.end_timestamp_ms,
        })
        .collect())
}

/// Encodes queries as a snappy-compressed `ReadRequest` body.
///
/// # Errors
///
/// Returns [`ProtocolError`] if serialization or compression fails.
pub fn encode_read_request(queries: &[Query]) -> Result<Vec<u8>> {
    let request = proto::ReadRequest {
        queries: queries
            .iter()
            .map(|q| proto::Query {
                start_timestamp_ms: q.start_ms,
                end_timestamp_ms: q.end_ms,
                matchers: q
                    .matchers
                    .iter()
                    .map(|m| proto::LabelMatcher {
                        r#type: m.kind.code(),
                        name: m.name.clone(),
                        value: m.value.clone(),
                    })
                    .collect(),
            })
            .collect(),
    };
    let bytes = encode_message("ReadRequest", &request)?;
    compress_snappy(&bytes)
}

/// Encodes query results as a snappy-compressed `ReadResponse` body.
///
/// # Errors
///
/// Returns [`ProtocolError`] if serialization or compression fails.
pub fn encode_read_response(results: &[QueryResult]) -> Result<Vec<u8>> {
    let response = proto::ReadResponse {
        results: results
            .iter()
            .map(|r| proto::QueryResult {
                timeseries: r.timeseries.iter().map(to_proto_series).collect(),
            })
            .collect(),
    };
    let bytes = encode_message("ReadResponse", &response)?;
    compress_snappy(&bytes)
}

/// Decodes a snappy-compressed `ReadResponse` body.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the body is not valid snappy or not a valid
/// `ReadResponse`.
pub fn decode_read_response(body: &[u8]) -> Result<Vec<QueryResult>> {
    let bytes = decompress_snappy(body)?;
    let response =
        proto::ReadResponse::decode(bytes.as_slice()).map_err(|e| ProtocolError::Decode {
            message: "ReadResponse",
            source: e,
        })?;
    Ok(response
        .results
        .into_iter()
        .map(|r| QueryResult {
            timeseries: r.timeseries.into_iter().map(from_proto_series).collect(),
        })
        .collect())
}

fn from_proto_series(ts: proto::TimeSeries) -> TimeSeries {
    TimeSeries {
        labels: ts.labels.into_iter().map(|l| (l.name, l.value)).collect(),
        samples: ts
            .samples
            .into_iter()
            .map(|s| Sample::new(s.value, s.timestamp))
            .collect(),
    }
}

/// Labels come out sorted by name, as Prometheus requires.
fn to_proto_series(ts: &TimeSeries) -> proto::TimeSeries {
    proto::TimeSeries {
        labels: to_proto_labels(&ts.labels),
        samples: ts
            .samples
            .iter()
            .map(|s| proto::Sample {
                value: s.value,
                timestamp: s.timestamp,
            })
            .collect(),
    }
}

fn to_proto_labels(labels: &Labels) -> Vec<proto::Label> {
    labels
        .iter()
        .map(|(name, value)| proto::Label {
            name: name.to_string(),
            value: value.to_string(),
        })
        .collect()
}

fn encode_message<M: Message>(message: &'static str, value: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(value.encoded_len());
    value
        .encode(&mut buf)
        .map_err(|e| ProtocolError::Encode { message, source: e })?;
    Ok(buf)
}

/// Compresses bytes using raw snappy, as the remote protocols require.
fn compress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    encoder
        .compress_vec(data)
        .map_err(|e| ProtocolError::Compression { source: e })
        .map_err(Into::into)
}

fn decompress_snappy(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = snap::raw::Decoder::new();
    decoder
        .decompress_vec(data)
        .map_err(|e| ProtocolError::Decompression { source: e })
        .map_err(Into::into)
}
