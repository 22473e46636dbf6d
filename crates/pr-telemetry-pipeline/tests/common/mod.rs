#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use pr_telemetry_blob_fs::FsBlobStore;
use pr_telemetry_domain::{
    BlobRef, ChunkSubmission, ConsentSettings, DateTimeUtc, NewTrace, RepoInfo, TaskInfo,
    TraceId,
};
use pr_telemetry_hash_chain::HashChain;
use pr_telemetry_pipeline::{
    ChunkDeduplicator, Clock, Finalizer, FixedClock, IngestionCoordinator, PipelineConfig,
};
use pr_telemetry_qa::{DispatchReceipt, QaDispatchError, QaDispatcher};
use pr_telemetry_store_core::{BlobNamespace, BlobStore, StoreError};
use pr_telemetry_store_sqlite::SqliteTraceStore;
use serde_json::{json, Value};
use time::macros::datetime;
use ulid::Ulid;

pub const HMAC_KEY: &[u8] = b"integration-test-hmac-key-0123456789";

pub fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

/// Dispatcher that records every call and can be switched into failure.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    failing: AtomicBool,
    calls: Mutex<Vec<TraceId>>,
}

impl RecordingDispatcher {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TraceId> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl QaDispatcher for RecordingDispatcher {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn dispatch_for_review(&self, trace_id: TraceId) -> Result<DispatchReceipt, QaDispatchError> {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        calls.push(trace_id);
        if self.failing.load(Ordering::SeqCst) {
            return Err(QaDispatchError::Transport("work queue unavailable".to_string()));
        }
        Ok(DispatchReceipt {
            job_id: format!("job-{}", calls.len()),
        })
    }
}

/// Filesystem blobs with injectable failures for one namespace.
#[derive(Debug)]
pub struct FlakyBlobStore {
    inner: FsBlobStore,
    fail_namespace: Mutex<Option<BlobNamespace>>,
    fail_remaining: AtomicUsize,
}

impl FlakyBlobStore {
    pub fn fail_next(&self, namespace: BlobNamespace, count: usize) {
        *self
            .fail_namespace
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(namespace);
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    pub fn root(&self) -> &Path {
        self.inner.root()
    }
}

impl BlobStore for FlakyBlobStore {
    fn put(&self, namespace: BlobNamespace, bytes: &[u8]) -> Result<BlobRef, StoreError> {
        let targeted = *self
            .fail_namespace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(namespace);
        if targeted
            && self
                .fail_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Unavailable("injected blob failure".to_string()));
        }
        self.inner.put(namespace, bytes)
    }

    fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, StoreError> {
        self.inner.get(blob)
    }
}

pub struct Harness {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub store: SqliteTraceStore,
    pub blobs: FlakyBlobStore,
    pub chain: HashChain,
    pub clock: FixedClock,
    pub config: PipelineConfig,
    pub dispatcher: RecordingDispatcher,
}

impl Harness {
    pub fn new(name: &str) -> Self {
        let root = std::env::temp_dir().join(format!("prt-pipeline-{name}-{}", Ulid::new()));
        must(std::fs::create_dir_all(&root));
        let db_path = root.join("traces.sqlite");
        let store = must(SqliteTraceStore::open_migrated(&db_path));
        let blobs = FlakyBlobStore {
            inner: must(FsBlobStore::open(&root.join("blobs"))),
            fail_namespace: Mutex::new(None),
            fail_remaining: AtomicUsize::new(0),
        };
        Self {
            root,
            db_path,
            store,
            blobs,
            chain: must(HashChain::new(HMAC_KEY)),
            clock: FixedClock::new(datetime!(2026-03-01 09:00:00 UTC)),
            config: PipelineConfig {
                reservation_lease_ms: 2_000,
                reservation_poll_ms: 5,
                ..PipelineConfig::default()
            },
            dispatcher: RecordingDispatcher::default(),
        }
    }

    pub fn coordinator(&self) -> IngestionCoordinator<'_> {
        IngestionCoordinator::new(&self.store, &self.blobs, &self.chain, &self.clock, &self.config)
    }

    pub fn finalizer(&self) -> Finalizer<'_> {
        Finalizer::new(
            &self.store,
            &self.blobs,
            &self.chain,
            &self.clock,
            &self.config,
            &self.dispatcher,
        )
    }

    pub fn dedup(&self) -> ChunkDeduplicator<'_> {
        ChunkDeduplicator::new(&self.store, &self.clock, &self.config)
    }

    /// A second connection to the same database, as another worker would hold.
    pub fn open_worker_store(&self) -> SqliteTraceStore {
        must(SqliteTraceStore::open(&self.db_path))
    }

    pub fn create_trace(&self) -> TraceId {
        must(self.coordinator().create_trace(new_trace())).trace_id
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn now(&self) -> DateTimeUtc {
        self.clock.now()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

pub fn new_trace() -> NewTrace {
    NewTrace {
        participant_id: "developer-001".to_string(),
        task: TaskInfo {
            id: "ISSUE-123".to_string(),
            title: "Fix off-by-one in add".to_string(),
            description: Some("add(2, 2) returns 5".to_string()),
            known_failing_tests: Some(vec!["tests/test_math.py::test_add".to_string()]),
        },
        repo: RepoInfo {
            origin: "https://example.invalid/calc.git".to_string(),
            start_commit: "abc123def456".to_string(),
            branch: Some("main".to_string()),
        },
        consent: ConsentSettings::default(),
    }
}

pub fn chunk(chunk_id: &str, events: Vec<Value>) -> ChunkSubmission {
    ChunkSubmission {
        chunk_id: chunk_id.to_string(),
        chunk_seq: 0,
        events,
        artifacts: std::collections::BTreeMap::new(),
    }
}

pub fn file_edit(id: &str, seq: u64, path: &str) -> Value {
    json!({
        "id": id,
        "seq": seq,
        "ts_client_s": 1_772_355_600.25,
        "type": "file_edit",
        "file_path": path,
        "language": "python",
        "diff_unified": "--- a/calc.py\n+++ b/calc.py\n-    return a + b + 1\n+    return a + b\n",
        "buffer_hash_after": "sha256:after"
    })
}

pub fn test_run(id: &str, seq: u64, passed: u32, failed: u32) -> Value {
    json!({
        "id": id,
        "seq": seq,
        "ts_client_s": 1_772_355_610.5,
        "type": "test_run",
        "framework": "pytest",
        "num_passed": passed,
        "num_failed": failed
    })
}

pub fn cmd_run(id: &str, seq: u64, exit_code: i32) -> Value {
    json!({
        "id": id,
        "seq": seq,
        "ts_client_s": 1_772_355_605.0,
        "type": "cmd_run",
        "cmd": "pytest -x",
        "cwd": "/workspace",
        "exit_code": exit_code
    })
}

pub fn commit(id: &str, seq: u64, diff: &str) -> Value {
    json!({
        "id": id,
        "seq": seq,
        "ts_client_s": 1_772_355_620.0,
        "type": "commit",
        "sha": "def789",
        "parent_sha": "abc123def456",
        "message": "Fix add",
        "diff_unified": diff
    })
}

pub fn rationale(id: &str, seq: u64) -> Value {
    json!({
        "id": id,
        "seq": seq,
        "ts_client_s": 1_772_355_601.0,
        "type": "rationale_note",
        "structured": {
            "hypothesis": "the +1 in add is wrong",
            "next_step": "remove it and rerun the tests"
        }
    })
}
