use std::sync::Arc;
use std::thread;

use assert_matches::assert_matches;
use chrono::Utc;

use crate::error::StorageError;
use crate::history::{
    BodyCapture, BodyLimits, HistoryRecord, HistoryStore, MemoryHistory, RecordedHeader, Recorder,
    RequestSnapshot, ResponseSnapshot,
};

fn request(path: &str) -> RequestSnapshot {
    RequestSnapshot {
        method: "GET".to_string(),
        url: format!("https://example.com{path}"),
        proto: "HTTP/1.1".to_string(),
        headers: vec![RecordedHeader::new("Host", "example.com")],
        content_length: None,
        host: "example.com".to_string(),
        remote_addr: "127.0.0.1:50000".to_string(),
        body: Vec::new(),
        body_size: 0,
        body_truncated: false,
    }
}

fn record(path: &str) -> HistoryRecord {
    HistoryRecord {
        request: request(path),
        response: None,
        time_start: Utc::now(),
        time_req_finish: None,
        time_resp_finish: None,
        is_https: true,
    }
}

struct FailingStore;

impl HistoryStore for FailingStore {
    fn append(&self, _record: HistoryRecord) -> Result<(), StorageError> {
        Err(StorageError::LockPoisoned)
    }

    fn snapshot(&self) -> Result<Vec<HistoryRecord>, StorageError> {
        Err(StorageError::LockPoisoned)
    }

    fn clear(&self) -> Result<usize, StorageError> {
        Err(StorageError::LockPoisoned)
    }

    fn len(&self) -> Result<usize, StorageError> {
        Err(StorageError::LockPoisoned)
    }
}

#[test]
fn body_limits_default() {
    let limits = BodyLimits::default();
    assert_eq!(limits.request_max_bytes, 5 * 1024 * 1024);
    assert_eq!(limits.response_max_bytes, 20 * 1024 * 1024);
}

#[test]
fn capture_truncates_past_limit() {
    let mut capture = BodyCapture::new(4);
    capture.write(b"ab");
    capture.write(b"cdef");
    capture.write(b"gh");

    assert_eq!(capture.bytes(), b"abcd");
    assert_eq!(capture.total(), 8);
    assert!(capture.is_truncated());
}

#[test]
fn capture_within_limit_is_complete() {
    let mut capture = BodyCapture::new(16);
    capture.write(b"hello");
    let (bytes, total, truncated) = capture.into_parts();
    assert_eq!(bytes, b"hello");
    assert_eq!(total, 5);
    assert!(!truncated);
}

#[test]
fn recorder_keeps_insertion_order() {
    let recorder = Recorder::in_memory(BodyLimits::default());
    recorder.add(record("/one")).unwrap();
    recorder.add(record("/two")).unwrap();

    let snapshot = recorder.snapshot().unwrap();
    let urls: Vec<&str> = snapshot.iter().map(|r| r.request.url.as_str()).collect();
    assert_eq!(urls, vec!["https://example.com/one", "https://example.com/two"]);
}

#[test]
fn concurrent_adds_are_all_kept() {
    let recorder = Recorder::in_memory(BodyLimits::default());
    let handles: Vec<_> = (0..64)
        .map(|index| {
            let recorder = recorder.clone();
            thread::spawn(move || recorder.add(record(&format!("/{index}"))).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(recorder.len().unwrap(), 64);
    let mut urls: Vec<String> = recorder
        .snapshot()
        .unwrap()
        .into_iter()
        .map(|record| record.request.url)
        .collect();
    urls.sort();
    urls.dedup();
    assert_eq!(urls.len(), 64);
}

#[test]
fn clear_empties_the_log() {
    let store = Arc::new(MemoryHistory::new());
    let recorder = Recorder::new(store.clone(), BodyLimits::default());
    recorder.add(record("/")).unwrap();
    recorder.add(record("/again")).unwrap();
    assert_eq!(recorder.clear().unwrap(), 2);
    assert!(recorder.is_empty().unwrap());
    assert_eq!(store.len().unwrap(), 0);
    assert_eq!(recorder.clear().unwrap(), 0);
}

#[test]
fn clears_racing_adds_count_every_removed_record() {
    let recorder = Recorder::in_memory(BodyLimits::default());
    let writers: Vec<_> = (0..8)
        .map(|writer| {
            let recorder = recorder.clone();
            thread::spawn(move || {
                for index in 0..50 {
                    recorder.add(record(&format!("/{writer}/{index}"))).unwrap();
                }
            })
        })
        .collect();

    let mut cleared = 0;
    while writers.iter().any(|writer| !writer.is_finished()) {
        cleared += recorder.clear().unwrap();
        thread::yield_now();
    }
    for writer in writers {
        writer.join().unwrap();
    }
    cleared += recorder.clear().unwrap();
    assert_eq!(cleared, 400);
}

#[test]
fn store_errors_surface_through_recorder() {
    let recorder = Recorder::new(Arc::new(FailingStore), BodyLimits::default());
    assert_matches!(recorder.add(record("/")), Err(StorageError::LockPoisoned));
}

#[test]
fn poisoned_lock_is_reported() {
    let store = Arc::new(MemoryHistory::new());
    let cloned = store.clone();
    let _ = thread::spawn(move || {
        let _guard = cloned.records.lock().unwrap();
        panic!("poison the history lock");
    })
    .join();

    assert_matches!(store.len(), Err(StorageError::LockPoisoned));
    assert_matches!(store.append(record("/")), Err(StorageError::LockPoisoned));
}

#[test]
fn bodies_serialize_as_base64() {
    let mut record = record("/upload");
    record.request.body = b"hello".to_vec();
    record.response = Some(ResponseSnapshot {
        status: 200,
        reason: "OK".to_string(),
        proto: "HTTP/1.1".to_string(),
        headers: Vec::new(),
        content_length: Some(2),
        body: b"ok".to_vec(),
        body_size: 2,
        body_truncated: false,
    });

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["request"]["body"], "aGVsbG8=");
    assert_eq!(json["response"]["body"], "b2s=");

    let decoded: HistoryRecord = serde_json::from_value(json).unwrap();
    assert_eq!(decoded, record);
}
