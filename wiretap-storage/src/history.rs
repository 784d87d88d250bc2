use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordedHeader {
    pub name: String,
    pub value: String,
}

impl RecordedHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub headers: Vec<RecordedHeader>,
    pub content_length: Option<u64>,
    pub host: String,
    pub remote_addr: String,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub body_size: u64,
    pub body_truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub reason: String,
    pub proto: String,
    pub headers: Vec<RecordedHeader>,
    pub content_length: Option<u64>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
    pub body_size: u64,
    pub body_truncated: bool,
}

/// One forwarded exchange. `response` is `None` when the upstream closed
/// before answering or the exchange failed after the request was sent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRecord {
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub time_start: DateTime<Utc>,
    pub time_req_finish: Option<DateTime<Utc>>,
    pub time_resp_finish: Option<DateTime<Utc>>,
    pub is_https: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BodyLimits {
    pub request_max_bytes: usize,
    pub response_max_bytes: usize,
}

impl Default for BodyLimits {
    fn default() -> Self {
        Self {
            request_max_bytes: 5 * 1024 * 1024,
            response_max_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Tee sink for a streamed body: keeps a copy of the first `limit` bytes and
/// counts the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyCapture {
    bytes: Vec<u8>,
    limit: usize,
    total: u64,
    truncated: bool,
}

impl BodyCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            total: 0,
            truncated: false,
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.bytes.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        let take = chunk.len().min(room);
        self.bytes.extend_from_slice(&chunk[..take]);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_parts(self) -> (Vec<u8>, u64, bool) {
        (self.bytes, self.total, self.truncated)
    }
}

pub trait HistoryStore: Send + Sync {
    fn append(&self, record: HistoryRecord) -> Result<(), StorageError>;
    fn snapshot(&self) -> Result<Vec<HistoryRecord>, StorageError>;
    /// Empties the log and returns how many records it held.
    fn clear(&self) -> Result<usize, StorageError>;
    fn len(&self) -> Result<usize, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

/// Process-lifetime log kept in memory. Records are ordered by lock arrival.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    pub(crate) records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistory {
    fn append(&self, record: HistoryRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .push(record);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<HistoryRecord>, StorageError> {
        Ok(self
            .records
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone())
    }

    fn clear(&self) -> Result<usize, StorageError> {
        let mut records = self.records.lock().map_err(|_| StorageError::LockPoisoned)?;
        let removed = records.len();
        records.clear();
        Ok(removed)
    }

    fn len(&self) -> Result<usize, StorageError> {
        Ok(self
            .records
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .len())
    }
}

#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn HistoryStore>,
    limits: BodyLimits,
}

impl Recorder {
    pub fn new(store: Arc<dyn HistoryStore>, limits: BodyLimits) -> Self {
        Self { store, limits }
    }

    pub fn in_memory(limits: BodyLimits) -> Self {
        Self::new(Arc::new(MemoryHistory::new()), limits)
    }

    pub fn limits(&self) -> BodyLimits {
        self.limits
    }

    pub fn request_capture(&self) -> BodyCapture {
        BodyCapture::new(self.limits.request_max_bytes)
    }

    pub fn response_capture(&self) -> BodyCapture {
        BodyCapture::new(self.limits.response_max_bytes)
    }

    pub fn add(&self, record: HistoryRecord) -> Result<(), StorageError> {
        self.store.append(record)
    }

    pub fn snapshot(&self) -> Result<Vec<HistoryRecord>, StorageError> {
        self.store.snapshot()
    }

    pub fn clear(&self) -> Result<usize, StorageError> {
        self.store.clear()
    }

    pub fn len(&self) -> Result<usize, StorageError> {
        self.store.len()
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        self.store.is_empty()
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
