mod error;
mod history;
#[cfg(test)]
mod history_test;

pub use error::StorageError;
pub use history::{
    BodyCapture, BodyLimits, HistoryRecord, HistoryStore, MemoryHistory, RecordedHeader, Recorder,
    RequestSnapshot, ResponseSnapshot,
};
