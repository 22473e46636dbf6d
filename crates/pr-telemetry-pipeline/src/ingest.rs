use pr_telemetry_domain::{
    ensure_non_empty, unix_seconds, validate_chunk, ArtifactKind, ArtifactRecord, BlobRef,
    ChunkIngestResult, ChunkSubmission, DateTimeUtc, EventBody, NewTrace, PipelineError,
    TraceEvent, TraceId, TraceRecord, TraceStatus,
};
use pr_telemetry_hash_chain::HashChain;
use pr_telemetry_store_core::{AppliedChunk, BlobNamespace, BlobStore, ChunkWrite, TraceStore};
use serde::Serialize;
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::PipelineConfig;
use crate::dedup::{ChunkDeduplicator, Reservation};

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct IngestReceipt {
    #[serde(flatten)]
    pub result: ChunkIngestResult,
    /// True when the result was replayed for a duplicate idempotency key.
    pub replayed: bool,
}

/// Entry point for trace creation and chunk submission.
pub struct IngestionCoordinator<'a> {
    store: &'a dyn TraceStore,
    blobs: &'a dyn BlobStore,
    chain: &'a HashChain,
    clock: &'a dyn Clock,
    config: &'a PipelineConfig,
    dedup: ChunkDeduplicator<'a>,
}

impl<'a> IngestionCoordinator<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn TraceStore,
        blobs: &'a dyn BlobStore,
        chain: &'a HashChain,
        clock: &'a dyn Clock,
        config: &'a PipelineConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            chain,
            clock,
            config,
            dedup: ChunkDeduplicator::new(store, clock, config),
        }
    }

    /// # Errors
    /// Returns a validation error for blank identifiers, or a storage error.
    pub fn create_trace(&self, new_trace: NewTrace) -> Result<TraceRecord, PipelineError> {
        new_trace.validate()?;
        let record = TraceRecord::from_new(TraceId::new(), new_trace, self.clock.now());
        self.store.insert_trace(&record)?;
        tracing::info!(
            trace_id = %record.trace_id,
            participant_id = %record.participant_id,
            task_id = %record.task.id,
            "trace created"
        );
        Ok(record)
    }

    /// Apply one chunk at most once per idempotency key.
    ///
    /// # Errors
    /// `TraceNotFound`/`InvalidState` when the trace cannot accept events,
    /// `Validation` when any event or artifact is malformed (nothing is
    /// applied), `StorageUnavailable` for transient store failures.
    pub fn ingest(
        &self,
        trace_id: TraceId,
        chunk: &ChunkSubmission,
        idempotency_key: &str,
    ) -> Result<IngestReceipt, PipelineError> {
        ensure_non_empty("idempotency_key", idempotency_key)
            .map_err(PipelineError::chunk_invalid)?;
        let trace = self
            .store
            .get_trace(trace_id)?
            .ok_or(PipelineError::TraceNotFound(trace_id))?;
        trace.require_status(TraceStatus::Ingesting)?;

        let token = match self.dedup.check_and_reserve(trace_id, idempotency_key)? {
            Reservation::Fresh { token } => token,
            Reservation::Duplicate(result) => {
                tracing::debug!(
                    trace_id = %trace_id,
                    chunk_id = %result.chunk_id,
                    idempotency_key,
                    "duplicate chunk; replaying stored result"
                );
                return Ok(IngestReceipt {
                    result,
                    replayed: true,
                });
            }
        };

        match self.apply(trace_id, chunk, idempotency_key) {
            Ok(AppliedChunk {
                result,
                replayed: true,
            }) => {
                tracing::debug!(
                    trace_id = %trace_id,
                    chunk_id = %result.chunk_id,
                    idempotency_key,
                    "chunk committed by an earlier holder of the key; replaying its result"
                );
                Ok(IngestReceipt {
                    result,
                    replayed: true,
                })
            }
            Ok(AppliedChunk { result, .. }) => {
                tracing::info!(
                    trace_id = %trace_id,
                    chunk_id = %result.chunk_id,
                    events_added = result.events_added,
                    events_skipped = result.events_skipped,
                    artifacts_added = result.artifacts_added,
                    total_events = result.total_events,
                    "chunk ingested"
                );
                Ok(IngestReceipt {
                    result,
                    replayed: false,
                })
            }
            Err(err) => {
                if let Err(release_err) = self.dedup.release(trace_id, idempotency_key, &token) {
                    tracing::warn!(
                        trace_id = %trace_id,
                        idempotency_key,
                        error = %release_err,
                        "failed to release chunk reservation; it will lapse with its lease"
                    );
                }
                tracing::warn!(
                    trace_id = %trace_id,
                    chunk_id = %chunk.chunk_id,
                    code = err.code(),
                    error = %err,
                    "chunk rejected"
                );
                Err(err)
            }
        }
    }

    /// Move an `ingesting` trace to the terminal `failed` status.
    ///
    /// # Errors
    /// `InvalidState` unless the trace is `ingesting`.
    pub fn abandon(&self, trace_id: TraceId, reason: &str) -> Result<TraceRecord, PipelineError> {
        ensure_non_empty("reason", reason).map_err(PipelineError::chunk_invalid)?;
        let record = self.store.mark_failed(trace_id, reason, self.clock.now())?;
        tracing::info!(trace_id = %trace_id, reason, "trace abandoned");
        Ok(record)
    }

    fn apply(
        &self,
        trace_id: TraceId,
        chunk: &ChunkSubmission,
        idempotency_key: &str,
    ) -> Result<AppliedChunk, PipelineError> {
        let mut events = validate_chunk(chunk, self.config.max_events_per_chunk)?;
        let received_at = self.clock.now();
        let ts_server_s = unix_seconds(received_at);
        for event in &mut events {
            event.ts_server_s = ts_server_s;
        }

        let raw = serde_json::to_vec(chunk)
            .map_err(|err| PipelineError::chunk_invalid(format!("chunk is not encodable: {err}")))?;
        let raw_chunk = self.blobs.put(BlobNamespace::Chunks, &raw)?;
        let artifacts = self.store_artifacts(trace_id, chunk, &mut events, received_at)?;

        let write = ChunkWrite {
            trace_id,
            chunk_id: &chunk.chunk_id,
            chunk_seq: chunk.chunk_seq,
            idempotency_key,
            events: &events,
            artifacts: &artifacts,
            raw_chunk: &raw_chunk,
            received_at,
            key_expires_at: self.dedup.expiry_from(received_at),
        };
        self.store
            .append_chunk(&write, self.chain)
            .map_err(PipelineError::from)
    }

    /// Runs before the event transaction; a failed transaction leaves at
    /// most an unreferenced content-addressed blob.
    fn store_artifacts(
        &self,
        trace_id: TraceId,
        chunk: &ChunkSubmission,
        events: &mut [TraceEvent],
        created_at: DateTimeUtc,
    ) -> Result<Vec<ArtifactRecord>, PipelineError> {
        let mut records = Vec::new();
        for (event_id, uploads) in &chunk.artifacts {
            for upload in uploads {
                let bytes = upload.to_bytes().map_err(|err| PipelineError::Validation {
                    event_index: None,
                    event_id: Some(event_id.clone()),
                    reason: format!("artifact is not encodable: {err}"),
                })?;
                if u64::try_from(bytes.len()).unwrap_or(u64::MAX) > self.config.max_artifact_bytes
                {
                    return Err(PipelineError::Validation {
                        event_index: None,
                        event_id: Some(event_id.clone()),
                        reason: format!(
                            "{} artifact exceeds {} bytes",
                            upload.kind.as_str(),
                            self.config.max_artifact_bytes
                        ),
                    });
                }

                let blob = self.blobs.put(BlobNamespace::Artifacts, &bytes)?;
                if let Some(event) = events.iter_mut().find(|event| &event.id == event_id) {
                    attach_ref(event, upload.kind, &blob);
                }
                records.push(ArtifactRecord {
                    artifact_id: Ulid::new(),
                    trace_id,
                    chunk_id: chunk.chunk_id.clone(),
                    event_id: event_id.clone(),
                    kind: upload.kind,
                    blob,
                    created_at,
                });
            }
        }
        Ok(records)
    }
}

fn attach_ref(event: &mut TraceEvent, kind: ArtifactKind, blob: &BlobRef) {
    match (&mut event.body, kind) {
        (EventBody::CmdRun(run), ArtifactKind::Stdout) => run.stdout_ref = Some(blob.clone()),
        (EventBody::CmdRun(run), ArtifactKind::Stderr) => run.stderr_ref = Some(blob.clone()),
        (EventBody::TestRun(run), ArtifactKind::TestReport) => {
            run.report_ref = Some(blob.clone());
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use pr_telemetry_domain::{CmdRun, TestRun};

    use super::*;

    fn blob() -> BlobRef {
        BlobRef {
            uri: "file:///blobs/x".to_string(),
            sha256: "a".repeat(64),
            size_bytes: 3,
        }
    }

    #[test]
    fn artifact_refs_land_on_matching_event_fields() {
        let mut cmd = TraceEvent {
            id: "e0".to_string(),
            seq: 0,
            ts_client_s: 1.0,
            ts_server_s: 0.0,
            body: EventBody::CmdRun(CmdRun {
                cmd: "pytest".to_string(),
                cwd: None,
                env_redacted: false,
                exit_code: 1,
                stdout_ref: None,
                stderr_ref: None,
            }),
        };
        attach_ref(&mut cmd, ArtifactKind::Stdout, &blob());
        attach_ref(&mut cmd, ArtifactKind::WorkspaceSnapshot, &blob());
        match &cmd.body {
            EventBody::CmdRun(run) => {
                assert_eq!(run.stdout_ref, Some(blob()));
                assert!(run.stderr_ref.is_none());
            }
            other => panic!("unexpected body {other:?}"),
        }

        let mut test = TraceEvent {
            id: "e1".to_string(),
            seq: 1,
            ts_client_s: 1.0,
            ts_server_s: 0.0,
            body: EventBody::TestRun(TestRun {
                framework: "pytest".to_string(),
                selection: None,
                num_passed: 1,
                num_failed: 0,
                failed_tests: None,
                report_ref: None,
            }),
        };
        attach_ref(&mut test, ArtifactKind::TestReport, &blob());
        match &test.body {
            EventBody::TestRun(run) => assert_eq!(run.report_ref, Some(blob())),
            other => panic!("unexpected body {other:?}"),
        }
    }
}
