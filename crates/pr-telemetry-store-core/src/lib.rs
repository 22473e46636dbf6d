#![forbid(unsafe_code)]

use std::time::Duration;

use pr_telemetry_domain::{
    AppendResult, ArtifactRecord, BlobRef, ChunkIngestResult, ChunkRecord, DateTimeUtc,
    FinalizedTraceDocument, HandoffRecord, HandoffState, PipelineError, QaResults, StoredEvent,
    TraceEvent, TraceId, TraceRecord, TraceStatus,
};
use pr_telemetry_hash_chain::HashChain;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("trace not found: {0}")]
    TraceNotFound(TraceId),
    #[error("trace {trace_id} is {actual}; operation requires {required}")]
    InvalidState {
        trace_id: TraceId,
        actual: TraceStatus,
        required: TraceStatus,
    },
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::StorageUnavailable(reason),
            StoreError::TraceNotFound(trace_id) => Self::TraceNotFound(trace_id),
            StoreError::InvalidState {
                trace_id,
                actual,
                required,
            } => Self::InvalidState {
                trace_id,
                actual,
                required,
            },
            StoreError::Corrupt(reason) => Self::Storage(format!("corrupt data: {reason}")),
            StoreError::Backend(err) => Self::Storage(format!("{err:#}")),
        }
    }
}

/// Outcome of reserving an idempotency key for one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyReservation {
    /// The caller owns the key; `token` must accompany a release.
    Fresh { token: String },
    Duplicate(ChunkIngestResult),
    /// Another submission holds an unexpired lease on the key.
    InFlight { lease_expires_at: DateTimeUtc },
}

/// Result of `append_chunk`. `replayed` is set when the key was already
/// committed by another submission and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedChunk {
    pub result: ChunkIngestResult,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizationClaim {
    Claimed(TraceRecord),
    AlreadyFinalized(Box<FinalizedTraceDocument>),
}

/// Everything one chunk writes, applied in a single atomic unit.
#[derive(Debug, Clone)]
pub struct ChunkWrite<'a> {
    pub trace_id: TraceId,
    pub chunk_id: &'a str,
    pub chunk_seq: u64,
    pub idempotency_key: &'a str,
    pub events: &'a [TraceEvent],
    pub artifacts: &'a [ArtifactRecord],
    pub raw_chunk: &'a BlobRef,
    pub received_at: DateTimeUtc,
    pub key_expires_at: DateTimeUtc,
}

pub trait TraceStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<(), StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_trace(&self, record: &TraceRecord) -> Result<(), StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_trace(&self, trace_id: TraceId) -> Result<Option<TraceRecord>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_traces(&self) -> Result<Vec<TraceRecord>, StoreError>;

    /// Move an `ingesting` trace to the terminal `failed` status.
    #[allow(clippy::missing_errors_doc)]
    fn mark_failed(
        &self,
        trace_id: TraceId,
        reason: &str,
        now: DateTimeUtc,
    ) -> Result<TraceRecord, StoreError>;

    /// Atomic check-then-insert on `(trace_id, key)`. Committed results past
    /// their expiry and reservations past their lease are treated as absent.
    #[allow(clippy::missing_errors_doc)]
    fn reserve_chunk_key(
        &self,
        trace_id: TraceId,
        key: &str,
        now: DateTimeUtc,
        lease: Duration,
    ) -> Result<KeyReservation, StoreError>;

    /// Standalone commit of a reserved key. The ingestion path commits inside
    /// `append_chunk` instead.
    #[allow(clippy::missing_errors_doc)]
    fn commit_chunk_key(
        &self,
        trace_id: TraceId,
        key: &str,
        result: &ChunkIngestResult,
        now: DateTimeUtc,
        expires_at: DateTimeUtc,
    ) -> Result<(), StoreError>;

    /// Drop a reservation, but only while `token` still owns it; a
    /// reservation taken over by another worker is left alone.
    #[allow(clippy::missing_errors_doc)]
    fn release_chunk_key(
        &self,
        trace_id: TraceId,
        key: &str,
        token: &str,
    ) -> Result<(), StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn purge_expired_chunk_keys(&self, now: DateTimeUtc) -> Result<u64, StoreError>;

    /// Insert events not yet stored for the trace; existing ids are skipped.
    /// Fails without writing anything unless the trace is `ingesting`.
    /// Standalone event append; chunk ingestion goes through `append_chunk`.
    #[allow(clippy::missing_errors_doc)]
    fn append_events(
        &self,
        trace_id: TraceId,
        chunk_id: &str,
        events: &[TraceEvent],
        chain: &HashChain,
        now: DateTimeUtc,
    ) -> Result<AppendResult, StoreError>;

    /// Append events, record artifacts and the chunk, and commit the
    /// idempotency key in one transaction. Artifacts are recorded only for
    /// events inserted by this call.
    #[allow(clippy::missing_errors_doc)]
    fn append_chunk(
        &self,
        write: &ChunkWrite<'_>,
        chain: &HashChain,
    ) -> Result<AppliedChunk, StoreError>;

    /// Events by ascending `seq`, ties broken by insertion order.
    #[allow(clippy::missing_errors_doc)]
    fn list_events_ordered(&self, trace_id: TraceId) -> Result<Vec<StoredEvent>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn count_events(&self, trace_id: TraceId) -> Result<u64, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_chunks(&self, trace_id: TraceId) -> Result<Vec<ChunkRecord>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn list_artifacts(&self, trace_id: TraceId) -> Result<Vec<ArtifactRecord>, StoreError>;

    /// Atomic `ingesting -> finalizing` transition. A `finalizing` claim older
    /// than `lease` may be taken over.
    #[allow(clippy::missing_errors_doc)]
    fn begin_finalization(
        &self,
        trace_id: TraceId,
        now: DateTimeUtc,
        lease: Duration,
    ) -> Result<FinalizationClaim, StoreError>;

    /// Store the document and flip `finalizing -> finalized` together.
    #[allow(clippy::missing_errors_doc)]
    fn complete_finalization(
        &self,
        document: &FinalizedTraceDocument,
        blob: &BlobRef,
    ) -> Result<(), StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn abort_finalization(&self, trace_id: TraceId, now: DateTimeUtc) -> Result<(), StoreError>;

    /// The stored document with any attached QA results merged in.
    #[allow(clippy::missing_errors_doc)]
    fn get_finalized_document(
        &self,
        trace_id: TraceId,
    ) -> Result<Option<FinalizedTraceDocument>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn attach_qa_results(
        &self,
        trace_id: TraceId,
        patch: &QaResults,
        now: DateTimeUtc,
    ) -> Result<QaResults, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn record_handoff(
        &self,
        trace_id: TraceId,
        state: HandoffState,
        job_id: Option<&str>,
        error: Option<&str>,
        now: DateTimeUtc,
    ) -> Result<HandoffRecord, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn get_handoff(&self, trace_id: TraceId) -> Result<Option<HandoffRecord>, StoreError>;

    /// Finalized traces without QA results whose handoff failed or never ran;
    /// `include_dispatched` adds those dispatched but still unscored.
    #[allow(clippy::missing_errors_doc)]
    fn list_finalized_awaiting_qa(
        &self,
        include_dispatched: bool,
    ) -> Result<Vec<TraceId>, StoreError>;

    #[allow(clippy::missing_errors_doc)]
    fn require_trace(&self, trace_id: TraceId) -> Result<TraceRecord, StoreError> {
        self.get_trace(trace_id)?
            .ok_or(StoreError::TraceNotFound(trace_id))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BlobNamespace {
    Chunks,
    Artifacts,
    Traces,
}

impl BlobNamespace {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chunks => "chunks",
            Self::Artifacts => "artifacts",
            Self::Traces => "traces",
        }
    }
}

/// Content-addressed blob persistence.
pub trait BlobStore {
    #[allow(clippy::missing_errors_doc)]
    fn put(&self, namespace: BlobNamespace, bytes: &[u8]) -> Result<BlobRef, StoreError>;

    /// Read a blob back, failing if its content no longer matches the digest.
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, blob: &BlobRef) -> Result<Vec<u8>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_pipeline_taxonomy() {
        let trace_id = TraceId::new();
        let unavailable: PipelineError = StoreError::Unavailable("database is locked".into()).into();
        assert!(unavailable.is_retryable());

        let missing: PipelineError = StoreError::TraceNotFound(trace_id).into();
        assert_eq!(missing, PipelineError::TraceNotFound(trace_id));

        let state: PipelineError = StoreError::InvalidState {
            trace_id,
            actual: TraceStatus::Finalized,
            required: TraceStatus::Ingesting,
        }
        .into();
        assert_eq!(state.code(), "invalid_state");

        let backend: PipelineError = StoreError::Backend(anyhow::anyhow!("disk full")).into();
        assert_eq!(backend, PipelineError::Storage("disk full".to_string()));
    }

    #[test]
    fn namespaces_have_stable_names() {
        assert_eq!(BlobNamespace::Chunks.as_str(), "chunks");
        assert_eq!(BlobNamespace::Artifacts.as_str(), "artifacts");
        assert_eq!(BlobNamespace::Traces.as_str(), "traces");
    }
}
