//! Transport envelope exchanged between pipeline stages
//!
//! Wraps an opaque message body with the headers the broker carries alongside it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

/// Header carrying the number of failed processing attempts
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Content type of every body produced by this crate
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header values understood by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Raw message body, usually JSON
    pub body: Vec<u8>,

    /// Application headers (retry count and anything upstream attached)
    pub headers: BTreeMap<String, HeaderValue>,

    /// MIME type of the body, if the producer set one
    pub content_type: Option<String>,
}

impl Envelope {
    /// Create an envelope around a raw body with no headers
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
            content_type: None,
        }
    }

    /// Serialize a message into a JSON envelope
    pub fn json<T: Serialize + ?Sized>(message: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(message)?;
        Ok(Self {
            body,
            headers: BTreeMap::new(),
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
        })
    }

    /// Deserialize the body as JSON
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Number of failed attempts recorded on this envelope.
    ///
    /// A missing, negative or non-integer header reads as 0.
    pub fn retry_count(&self) -> u32 {
        match self.headers.get(RETRY_COUNT_HEADER) {
            Some(HeaderValue::Int(n)) => u32::try_from(*n).unwrap_or(0),
            _ => 0,
        }
    }

    /// Copy of this envelope carrying the given retry count
    pub fn with_retry_count(&self, retry_count: u32) -> Self {
        let mut next = self.clone();
        next.headers.insert(
            RETRY_COUNT_HEADER.to_string(),
            HeaderValue::Int(i64::from(retry_count)),
        );
        next
    }

    /// Copy of this envelope with every header dropped; body and content type are kept as-is
    pub fn without_retry_metadata(&self) -> Self {
        Self {
            body: self.body.clone(),
            headers: BTreeMap::new(),
            content_type: self.content_type.clone(),
        }
    }
}
