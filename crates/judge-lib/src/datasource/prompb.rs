//! Prometheus remote-write protobuf messages
//!
//! Hand-written prost definitions matching `prometheus/prompb/types.proto`
//! and `remote.proto`. Only the fields the remote-write sender fills are
//! declared; receivers ignore the absent metadata field.

use prost::Message;

use crate::error::{JudgeError, Result};

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
    /// Sorted by name
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<Label>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Eq, Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    /// Milliseconds since epoch
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

impl TimeSeries {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }
}

/// Protobuf-encode and Snappy-compress a batch (block format, as remote write expects)
pub fn encode_write_request(timeseries: Vec<TimeSeries>) -> Result<Vec<u8>> {
    let request = WriteRequest { timeseries };
    let raw = request.encode_to_vec();
    snap::raw::Encoder::new()
        .compress_vec(&raw)
        .map_err(|e| JudgeError::InvalidSample(format!("snappy compression failed: {}", e)))
}

/// Inverse of [`encode_write_request`]
pub fn decode_write_request(body: &[u8]) -> Result<WriteRequest> {
    let raw = snap::raw::Decoder::new()
        .decompress_vec(body)
        .map_err(|e| JudgeError::InvalidSample(format!("snappy decompression failed: {}", e)))?;
    WriteRequest::decode(raw.as_slice())
        .map_err(|e| JudgeError::InvalidSample(format!("protobuf decode failed: {}", e)))
}
