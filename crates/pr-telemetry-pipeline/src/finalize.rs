use std::collections::BTreeMap;

use pr_telemetry_domain::{
    inspect_sequence, schema_hash, ArtifactKind, ArtifactRef, BlobRef, DocumentArtifacts,
    EventBody, FinalizedLookup, FinalizedTraceDocument, HandoffRecord, HandoffState, Integrity,
    ParticipantRole, PipelineError, QaResults, SequenceReport, SessionInfo, TraceEvent, TraceId,
    TraceMetrics, TraceRecord, TraceStatus, CHAIN_ALGORITHM, TRACE_VERSION,
};
use pr_telemetry_hash_chain::HashChain;
use pr_telemetry_qa::QaDispatcher;
use pr_telemetry_store_core::{BlobNamespace, BlobStore, FinalizationClaim, TraceStore};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::PipelineConfig;

/// Integrity check of a trace's stored events against its digests.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditReport {
    pub trace_id: TraceId,
    pub status: TraceStatus,
    pub num_events: u64,
    pub num_chunks: u64,
    pub num_artifacts: u64,
    pub recomputed_digest: Option<String>,
    pub running_digest: Option<String>,
    /// Whether the arrival-order digest kept during ingestion agrees.
    pub running_digest_matches: bool,
    pub document_digest: Option<String>,
    /// `None` until the trace is finalized.
    pub document_verified: Option<bool>,
    pub sequence: SequenceReport,
}

pub struct Finalizer<'a> {
    store: &'a dyn TraceStore,
    blobs: &'a dyn BlobStore,
    chain: &'a HashChain,
    clock: &'a dyn Clock,
    config: &'a PipelineConfig,
    dispatcher: &'a dyn QaDispatcher,
}

impl<'a> Finalizer<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn TraceStore,
        blobs: &'a dyn BlobStore,
        chain: &'a HashChain,
        clock: &'a dyn Clock,
        config: &'a PipelineConfig,
        dispatcher: &'a dyn QaDispatcher,
    ) -> Self {
        Self {
            store,
            blobs,
            chain,
            clock,
            config,
            dispatcher,
        }
    }

    /// Produce the trace's immutable document and hand it off for QA.
    /// Calling again after completion returns the stored document.
    ///
    /// # Errors
    /// `InvalidState` when the trace is failed or another finalizer holds a
    /// live claim; `Finalization` when assembly fails, in which case the trace
    /// is back in `ingesting`.
    pub fn finalize(&self, trace_id: TraceId) -> Result<FinalizedTraceDocument, PipelineError> {
        let claim = self.store.begin_finalization(
            trace_id,
            self.clock.now(),
            self.config.finalization_lease(),
        )?;
        let record = match claim {
            FinalizationClaim::AlreadyFinalized(document) => {
                tracing::info!(trace_id = %trace_id, "trace already finalized; returning stored document");
                return Ok(*document);
            }
            FinalizationClaim::Claimed(record) => record,
        };

        let document = match self.assemble_and_complete(&record) {
            Ok(document) => document,
            Err(err) => {
                tracing::warn!(
                    trace_id = %trace_id,
                    error = %err,
                    "finalization aborted; trace returns to ingesting"
                );
                if let Err(abort_err) = self.store.abort_finalization(trace_id, self.clock.now()) {
                    tracing::error!(
                        trace_id = %trace_id,
                        error = %abort_err,
                        "failed to release finalization claim; it will lapse with its lease"
                    );
                }
                return Err(match err {
                    PipelineError::Finalization { .. } => err,
                    other => PipelineError::Finalization {
                        trace_id,
                        reason: other.to_string(),
                    },
                });
            }
        };

        tracing::info!(
            trace_id = %trace_id,
            num_events = document.metrics.num_events,
            event_hash_chain = document.integrity.event_hash_chain.as_deref().unwrap_or(""),
            "trace finalized"
        );

        if let Err(err) = self.dispatch(trace_id) {
            tracing::error!(trace_id = %trace_id, error = %err, "failed to record qa handoff");
        }
        Ok(document)
    }

    /// # Errors
    /// `TraceNotFound` for unknown traces, or a storage error.
    pub fn get_finalized(&self, trace_id: TraceId) -> Result<FinalizedLookup, PipelineError> {
        if let Some(document) = self.store.get_finalized_document(trace_id)? {
            return Ok(FinalizedLookup::Finalized(Box::new(document)));
        }
        let record = self.store.require_trace(trace_id)?;
        Ok(FinalizedLookup::NotYetFinalized {
            status: record.status,
            num_events: record.num_events,
        })
    }

    /// Patch QA results onto a finalized trace; sections absent from the
    /// patch keep their stored value.
    ///
    /// # Errors
    /// `Validation` for empty or out-of-range reports, `InvalidState` unless
    /// the trace is finalized.
    pub fn attach_qa(
        &self,
        trace_id: TraceId,
        patch: &QaResults,
    ) -> Result<QaResults, PipelineError> {
        patch.check()?;
        let merged = self
            .store
            .attach_qa_results(trace_id, patch, self.clock.now())?;
        tracing::info!(
            trace_id = %trace_id,
            has_validation = merged.validation.is_some(),
            has_judge = merged.judge.is_some(),
            "qa results attached"
        );
        Ok(merged)
    }

    /// Re-dispatch one finalized trace.
    ///
    /// # Errors
    /// `InvalidState` unless the trace is finalized; `Handoff` when the
    /// collaborator refuses, after the failed attempt has been recorded.
    pub fn redispatch(&self, trace_id: TraceId) -> Result<HandoffRecord, PipelineError> {
        self.store
            .require_trace(trace_id)?
            .require_status(TraceStatus::Finalized)?;
        let record = self.dispatch(trace_id)?;
        match record.state {
            HandoffState::Dispatched => Ok(record),
            HandoffState::Failed => Err(PipelineError::Handoff {
                trace_id,
                reason: record.last_error.unwrap_or_default(),
            }),
        }
    }

    /// Repair pass over finalized traces still lacking QA results.
    ///
    /// # Errors
    /// Returns a storage error if the backlog cannot be listed or an attempt
    /// cannot be recorded.
    pub fn redispatch_pending(
        &self,
        include_dispatched: bool,
    ) -> Result<Vec<HandoffRecord>, PipelineError> {
        let pending = self.store.list_finalized_awaiting_qa(include_dispatched)?;
        let mut outcomes = Vec::with_capacity(pending.len());
        for trace_id in pending {
            outcomes.push(self.dispatch(trace_id)?);
        }
        let failed = outcomes
            .iter()
            .filter(|record| record.state == HandoffState::Failed)
            .count();
        tracing::info!(
            attempted = outcomes.len(),
            failed,
            "qa redispatch pass complete"
        );
        Ok(outcomes)
    }

    /// # Errors
    /// `TraceNotFound`, or a storage error while reading the trace.
    pub fn audit(&self, trace_id: TraceId) -> Result<AuditReport, PipelineError> {
        let record = self.store.require_trace(trace_id)?;
        let events = self.ordered_events(trace_id)?;
        let recomputed_digest = self.digest(trace_id, &events)?;

        let document = self.store.get_finalized_document(trace_id)?;
        let document_digest = document
            .as_ref()
            .and_then(|doc| doc.integrity.event_hash_chain.clone());
        let document_verified = document.as_ref().map(|_| match &document_digest {
            Some(expected) => self.chain.verify(&events, expected),
            None => events.is_empty(),
        });

        Ok(AuditReport {
            trace_id,
            status: record.status,
            num_events: u64::try_from(events.len()).unwrap_or(u64::MAX),
            num_chunks: u64::try_from(self.store.list_chunks(trace_id)?.len()).unwrap_or(u64::MAX),
            num_artifacts: u64::try_from(self.store.list_artifacts(trace_id)?.len())
                .unwrap_or(u64::MAX),
            running_digest_matches: record.running_digest == recomputed_digest,
            running_digest: record.running_digest,
            recomputed_digest,
            document_digest,
            document_verified,
            sequence: inspect_sequence(&events),
        })
    }

    fn assemble_and_complete(
        &self,
        record: &TraceRecord,
    ) -> Result<FinalizedTraceDocument, PipelineError> {
        let trace_id = record.trace_id;
        let events = self.ordered_events(trace_id)?;

        let sequence = inspect_sequence(&events);
        if let Some(first) = sequence.gaps.first() {
            tracing::warn!(
                trace_id = %trace_id,
                gaps = sequence.gaps.len(),
                first_expected = first.expected,
                first_found = first.found,
                "event sequence has gaps"
            );
        }
        if !sequence.repeated.is_empty() {
            tracing::info!(
                trace_id = %trace_id,
                repeated = sequence.repeated.len(),
                "distinct events share seq values; insertion order kept"
            );
        }

        let digest = self.digest(trace_id, &events)?;
        if digest != record.running_digest {
            tracing::warn!(
                trace_id = %trace_id,
                running_digest = record.running_digest.as_deref().unwrap_or(""),
                authoritative_digest = digest.as_deref().unwrap_or(""),
                "running digest differs from authoritative chain; chunks arrived out of seq order"
            );
        }

        let metrics = TraceMetrics::from_events(&events);
        let artifacts = self.document_artifacts(trace_id, &events)?;
        let document = FinalizedTraceDocument {
            trace_version: TRACE_VERSION.to_string(),
            trace_id,
            session: SessionInfo {
                participant_id: record.participant_id.clone(),
                role: ParticipantRole::HumanDev,
                consent: record.consent,
            },
            task: record.task.clone(),
            repo: record.repo.clone(),
            events,
            artifacts,
            metrics,
            integrity: Integrity {
                event_hash_chain: digest,
                chain_algorithm: CHAIN_ALGORITHM.to_string(),
                schema_hash: schema_hash(),
            },
            qa: QaResults::default(),
            created_at: record.created_at,
            completed_at: self.clock.now(),
        };

        let bytes = serde_json::to_vec(&document).map_err(|err| PipelineError::Finalization {
            trace_id,
            reason: format!("document is not encodable: {err}"),
        })?;
        let blob = self.blobs.put(BlobNamespace::Traces, &bytes)?;
        self.store.complete_finalization(&document, &blob)?;
        Ok(document)
    }

    fn document_artifacts(
        &self,
        trace_id: TraceId,
        events: &[TraceEvent],
    ) -> Result<DocumentArtifacts, PipelineError> {
        let position: BTreeMap<&str, usize> = events
            .iter()
            .enumerate()
            .map(|(index, event)| (event.id.as_str(), index))
            .collect();

        let mut items = Vec::new();
        let mut snapshot: Option<(usize, BlobRef)> = None;
        for artifact in self.store.list_artifacts(trace_id)? {
            if artifact.kind == ArtifactKind::WorkspaceSnapshot {
                let at = position.get(artifact.event_id.as_str()).copied().unwrap_or(0);
                let later = match &snapshot {
                    Some((best, _)) => at >= *best,
                    None => true,
                };
                if later {
                    snapshot = Some((at, artifact.blob.clone()));
                }
            }
            items.push(ArtifactRef {
                event_id: artifact.event_id,
                kind: artifact.kind,
                blob: artifact.blob,
            });
        }

        let final_patch_unified = events.iter().rev().find_map(|event| match &event.body {
            EventBody::Commit(commit) => commit.diff_unified.clone(),
            _ => None,
        });

        Ok(DocumentArtifacts {
            final_workspace_snapshot: snapshot.map(|(_, blob)| blob),
            final_patch_unified,
            items,
        })
    }

    fn ordered_events(&self, trace_id: TraceId) -> Result<Vec<TraceEvent>, PipelineError> {
        Ok(self
            .store
            .list_events_ordered(trace_id)?
            .into_iter()
            .map(|stored| stored.event)
            .collect())
    }

    fn digest(
        &self,
        trace_id: TraceId,
        events: &[TraceEvent],
    ) -> Result<Option<String>, PipelineError> {
        self.chain
            .digest_of(events)
            .map_err(|err| PipelineError::Finalization {
                trace_id,
                reason: err.to_string(),
            })
    }

    /// One dispatch attempt; the outcome is recorded whichever way it goes.
    fn dispatch(&self, trace_id: TraceId) -> Result<HandoffRecord, PipelineError> {
        let now = self.clock.now();
        let record = match self.dispatcher.dispatch_for_review(trace_id) {
            Ok(receipt) => {
                let record = self.store.record_handoff(
                    trace_id,
                    HandoffState::Dispatched,
                    Some(&receipt.job_id),
                    None,
                    now,
                )?;
                tracing::info!(
                    trace_id = %trace_id,
                    dispatcher = self.dispatcher.name(),
                    job_id = %receipt.job_id,
                    attempts = record.attempts,
                    "trace dispatched for qa"
                );
                record
            }
            Err(err) => {
                let reason = err.to_string();
                let record = self.store.record_handoff(
                    trace_id,
                    HandoffState::Failed,
                    None,
                    Some(&reason),
                    now,
                )?;
                tracing::error!(
                    trace_id = %trace_id,
                    dispatcher = self.dispatcher.name(),
                    attempts = record.attempts,
                    error = %reason,
                    "qa handoff failed; trace stays finalized but unscored"
                );
                record
            }
        };
        Ok(record)
    }
}
