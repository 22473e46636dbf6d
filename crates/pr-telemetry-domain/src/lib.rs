#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

pub const TRACE_VERSION: &str = "1.0";
pub const TRACE_SCHEMA_ID: &str = "pr-telemetry.trace.v1";
pub const CHAIN_ALGORITHM: &str = "hmac-sha256";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TraceId(pub Ulid);

impl TraceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TraceId {
    type Err = ulid::DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value).map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Ingesting,
    Finalizing,
    Finalized,
    Failed,
}

impl TraceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingesting => "ingesting",
            Self::Finalizing => "finalizing",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ingesting" => Some(Self::Ingesting),
            "finalizing" => Some(Self::Finalizing),
            "finalized" => Some(Self::Finalized),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy surfaced by every pipeline operation.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("trace not found: {0}")]
    TraceNotFound(TraceId),
    #[error("trace {trace_id} is {actual}; operation requires {required}")]
    InvalidState {
        trace_id: TraceId,
        actual: TraceStatus,
        required: TraceStatus,
    },
    #[error("validation error{}: {reason}", location_suffix(.event_index, .event_id))]
    Validation {
        event_index: Option<usize>,
        event_id: Option<String>,
        reason: String,
    },
    #[error("finalization of trace {trace_id} failed: {reason}")]
    Finalization { trace_id: TraceId, reason: String },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("qa handoff for trace {trace_id} failed: {reason}")]
    Handoff { trace_id: TraceId, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::TraceNotFound(_) => "trace_not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Validation { .. } => "validation_error",
            Self::Finalization { .. } => "finalization_error",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Handoff { .. } => "handoff_failure",
            Self::Storage(_) => "storage_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Only transient backing-store failures are worth a retry with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }

    #[must_use]
    pub fn chunk_invalid(reason: impl Into<String>) -> Self {
        Self::Validation {
            event_index: None,
            event_id: None,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn event_invalid(index: usize, event_id: Option<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            event_index: Some(index),
            event_id,
            reason: reason.into(),
        }
    }
}

#[allow(clippy::ref_option)]
fn location_suffix(index: &Option<usize>, event_id: &Option<String>) -> String {
    match (index, event_id) {
        (Some(index), Some(id)) => format!(" at event #{index} (id={id})"),
        (Some(index), None) => format!(" at event #{index}"),
        (None, Some(id)) => format!(" for event id={id}"),
        (None, None) => String::new(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConsentSettings {
    pub rationales: bool,
    pub commands: bool,
    pub snapshots: bool,
}

impl Default for ConsentSettings {
    fn default() -> Self {
        Self {
            rationales: true,
            commands: true,
            snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskInfo {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_failing_tests: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RepoInfo {
    pub origin: String,
    pub start_commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewTrace {
    pub participant_id: String,
    pub task: TaskInfo,
    pub repo: RepoInfo,
    #[serde(default)]
    pub consent: ConsentSettings,
}

impl NewTrace {
    /// # Errors
    /// Returns a validation error when a required identifier is blank.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (field, value) in [
            ("participant_id", self.participant_id.as_str()),
            ("task.id", self.task.id.as_str()),
            ("task.title", self.task.title.as_str()),
        ] {
            ensure_non_empty(field, value).map_err(PipelineError::chunk_invalid)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub participant_id: String,
    pub consent: ConsentSettings,
    pub task: TaskInfo,
    pub repo: RepoInfo,
    pub status: TraceStatus,
    pub num_events: u64,
    pub last_seq: Option<u64>,
    /// Optimistic digest folded in arrival order during ingestion.
    pub running_digest: Option<String>,
    pub chain_version: u64,
    pub failure_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finalizing_since: Option<DateTimeUtc>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finalized_at: Option<DateTimeUtc>,
}

impl TraceRecord {
    #[must_use]
    pub fn from_new(trace_id: TraceId, new_trace: NewTrace, now: DateTimeUtc) -> Self {
        Self {
            trace_id,
            participant_id: new_trace.participant_id,
            consent: new_trace.consent,
            task: new_trace.task,
            repo: new_trace.repo,
            status: TraceStatus::Ingesting,
            num_events: 0,
            last_seq: None,
            running_digest: None,
            chain_version: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            finalizing_since: None,
            finalized_at: None,
        }
    }

    /// # Errors
    /// Returns `InvalidState` when the trace is not in `required`.
    pub fn require_status(&self, required: TraceStatus) -> Result<(), PipelineError> {
        if self.status == required {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                trace_id: self.trace_id,
                actual: self.status,
                required,
            })
        }
    }
}

/// Content-addressed reference to an externally stored blob.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct BlobRef {
    pub uri: String,
    pub sha256: String,
    pub size_bytes: u64,
}

impl BlobRef {
    fn check(&self, field: &str) -> Result<(), String> {
        ensure_non_empty(&format!("{field}.uri"), &self.uri)?;
        if !is_sha256_hex(&self.sha256) {
            return Err(format!("{field}.sha256 MUST be 64 lowercase hex characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FileEdit,
    CmdRun,
    TestRun,
    Commit,
    RationaleNote,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileEdit => "file_edit",
            Self::CmdRun => "cmd_run",
            Self::TestRun => "test_run",
            Self::Commit => "commit",
            Self::RationaleNote => "rationale_note",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "file_edit" => Some(Self::FileEdit),
            "cmd_run" => Some(Self::CmdRun),
            "test_run" => Some(Self::TestRun),
            "commit" => Some(Self::Commit),
            "rationale_note" => Some(Self::RationaleNote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    pub id: String,
    pub seq: u64,
    pub ts_client_s: f64,
    /// Stamped by the ingesting server; inbound values are overwritten.
    #[serde(default)]
    pub ts_server_s: f64,
    #[serde(flatten)]
    pub body: EventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    FileEdit(FileEdit),
    CmdRun(CmdRun),
    TestRun(TestRun),
    Commit(CommitInfo),
    RationaleNote(RationaleNote),
}

impl EventBody {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::FileEdit(_) => EventKind::FileEdit,
            Self::CmdRun(_) => EventKind::CmdRun,
            Self::TestRun(_) => EventKind::TestRun,
            Self::Commit(_) => EventKind::Commit,
            Self::RationaleNote(_) => EventKind::RationaleNote,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEdit {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub diff_unified: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_hash_before: Option<String>,
    pub buffer_hash_after: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CmdRun {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env_redacted: bool,
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_ref: Option<BlobRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_ref: Option<BlobRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestRun {
    pub framework: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    pub num_passed: u32,
    pub num_failed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_tests: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_ref: Option<BlobRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_sha: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_unified: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StructuredRationale {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hypothesis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RationaleNote {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<StructuredRationale>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freeform: Option<String>,
}

impl TraceEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    /// Semantic checks that the serde shape alone cannot express.
    ///
    /// # Errors
    /// Returns a human-readable reason for the first violated rule.
    pub fn check(&self) -> Result<(), String> {
        ensure_non_empty("id", &self.id)?;
        if i64::try_from(self.seq).is_err() {
            return Err(format!("seq MUST not exceed {}", i64::MAX));
        }
        if !self.ts_client_s.is_finite() || self.ts_client_s < 0.0 {
            return Err("ts_client_s MUST be a finite, non-negative number".to_string());
        }
        match &self.body {
            EventBody::FileEdit(edit) => {
                ensure_non_empty("file_path", &edit.file_path)?;
                ensure_non_empty("buffer_hash_after", &edit.buffer_hash_after)
            }
            EventBody::CmdRun(run) => {
                ensure_non_empty("cmd", &run.cmd)?;
                if let Some(blob) = &run.stdout_ref {
                    blob.check("stdout_ref")?;
                }
                if let Some(blob) = &run.stderr_ref {
                    blob.check("stderr_ref")?;
                }
                Ok(())
            }
            EventBody::TestRun(run) => {
                ensure_non_empty("framework", &run.framework)?;
                if let Some(blob) = &run.report_ref {
                    blob.check("report_ref")?;
                }
                Ok(())
            }
            EventBody::Commit(commit) => ensure_non_empty("sha", &commit.sha),
            EventBody::RationaleNote(note) => {
                if note.structured.is_none() && note.freeform.is_none() {
                    return Err(
                        "rationale_note MUST carry structured or freeform content".to_string()
                    );
                }
                Ok(())
            }
        }
    }
}

/// Validate one raw event from a chunk against its discriminated schema.
///
/// # Errors
/// Returns `PipelineError::Validation` naming the event index and, when
/// readable, its identifier.
pub fn validate_event(index: usize, raw: &Value) -> Result<TraceEvent, PipelineError> {
    let Some(object) = raw.as_object() else {
        return Err(PipelineError::event_invalid(
            index,
            None,
            "event MUST be a JSON object",
        ));
    };
    let event_id = object.get("id").and_then(Value::as_str).map(str::to_string);
    let reject = |reason: String| PipelineError::event_invalid(index, event_id.clone(), reason);

    match object.get("seq") {
        None => return Err(reject("missing field `seq`".to_string())),
        Some(seq) if seq.as_i64().is_some_and(|value| value < 0) => {
            return Err(reject("seq MUST be non-negative".to_string()));
        }
        Some(seq) if seq.as_u64().is_none() => {
            return Err(reject("seq MUST be an integer".to_string()));
        }
        Some(_) => {}
    }
    match object.get("type").and_then(Value::as_str) {
        None => return Err(reject("missing event `type`".to_string())),
        Some(kind) if EventKind::parse(kind).is_none() => {
            return Err(reject(format!("unknown event type `{kind}`")));
        }
        Some(_) => {}
    }

    let event: TraceEvent =
        serde_json::from_value(raw.clone()).map_err(|err| reject(err.to_string()))?;
    event.check().map_err(reject)?;
    Ok(event)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Stdout,
    Stderr,
    TestReport,
    WorkspaceSnapshot,
    Other,
}

impl ArtifactKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::TestReport => "test_report",
            Self::WorkspaceSnapshot => "workspace_snapshot",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "test_report" => Some(Self::TestReport),
            "workspace_snapshot" => Some(Self::WorkspaceSnapshot),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    #[must_use]
    pub fn attaches_to(self, event: EventKind) -> bool {
        match self {
            Self::Stdout | Self::Stderr => event == EventKind::CmdRun,
            Self::TestReport => event == EventKind::TestRun,
            Self::WorkspaceSnapshot | Self::Other => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactUpload {
    pub kind: ArtifactKind,
    pub content: Value,
}

impl ArtifactUpload {
    /// Strings are stored as UTF-8, anything else as its JSON encoding.
    ///
    /// # Errors
    /// Returns an error if the JSON content cannot be serialized.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match &self.content {
            Value::String(text) => Ok(text.as_bytes().to_vec()),
            other => serde_json::to_vec(other),
        }
    }
}

/// A client-delivered batch of events, validated by the ingestion coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkSubmission {
    pub chunk_id: String,
    #[serde(default)]
    pub chunk_seq: u64,
    #[serde(default)]
    pub events: Vec<Value>,
    /// Artifact blobs keyed by the identifier of an event in this chunk.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Vec<ArtifactUpload>>,
}

/// Validate a chunk as a whole; any malformed event or artifact rejects it.
///
/// # Errors
/// Returns `PipelineError::Validation` for the first offending item.
pub fn validate_chunk(
    chunk: &ChunkSubmission,
    max_events: usize,
) -> Result<Vec<TraceEvent>, PipelineError> {
    ensure_non_empty("chunk_id", &chunk.chunk_id).map_err(PipelineError::chunk_invalid)?;
    if chunk.events.len() > max_events {
        return Err(PipelineError::chunk_invalid(format!(
            "chunk carries {} events; limit is {max_events}",
            chunk.events.len()
        )));
    }

    let events = chunk
        .events
        .iter()
        .enumerate()
        .map(|(index, raw)| validate_event(index, raw))
        .collect::<Result<Vec<_>, _>>()?;

    for (event_id, uploads) in &chunk.artifacts {
        let Some(event) = events.iter().find(|event| &event.id == event_id) else {
            return Err(PipelineError::Validation {
                event_index: None,
                event_id: Some(event_id.clone()),
                reason: "artifact references an event not present in this chunk".to_string(),
            });
        };
        let mut seen = BTreeSet::new();
        for upload in uploads {
            if !upload.kind.attaches_to(event.kind()) {
                return Err(PipelineError::Validation {
                    event_index: None,
                    event_id: Some(event_id.clone()),
                    reason: format!(
                        "artifact kind {} cannot attach to a {} event",
                        upload.kind.as_str(),
                        event.kind().as_str()
                    ),
                });
            }
            if upload.kind != ArtifactKind::Other && !seen.insert(upload.kind) {
                return Err(PipelineError::Validation {
                    event_index: None,
                    event_id: Some(event_id.clone()),
                    reason: format!("duplicate {} artifact", upload.kind.as_str()),
                });
            }
        }
    }

    Ok(events)
}

/// An event as held by the event store, with its insertion position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub append_seq: i64,
    pub chunk_id: String,
    pub event: TraceEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactRef {
    pub event_id: String,
    pub kind: ArtifactKind,
    pub blob: BlobRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactRecord {
    pub artifact_id: Ulid,
    pub trace_id: TraceId,
    pub chunk_id: String,
    pub event_id: String,
    pub kind: ArtifactKind,
    pub blob: BlobRef,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChunkRecord {
    pub trace_id: TraceId,
    pub chunk_id: String,
    pub chunk_seq: u64,
    pub idempotency_key: String,
    pub num_events: u64,
    pub events_added: u64,
    pub raw: BlobRef,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: DateTimeUtc,
}

/// Result of applying a chunk; stored verbatim for duplicate submissions.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChunkIngestResult {
    pub chunk_id: String,
    pub events_added: u64,
    pub events_skipped: u64,
    pub artifacts_added: u64,
    pub total_events: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AppendResult {
    pub inserted: u64,
    pub skipped: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SeqGap {
    pub expected: u64,
    pub found: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SequenceReport {
    pub gaps: Vec<SeqGap>,
    /// `seq` values shared by distinct events; preserved, not rejected.
    pub repeated: Vec<u64>,
}

impl SequenceReport {
    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.gaps.is_empty() && self.repeated.is_empty()
    }
}

/// Inspect an ascending-`seq` event list for gaps and repeated values.
#[must_use]
pub fn inspect_sequence(events: &[TraceEvent]) -> SequenceReport {
    let mut report = SequenceReport::default();
    let mut expected = 0_u64;
    let mut previous: Option<u64> = None;
    for event in events {
        if previous == Some(event.seq) {
            if report.repeated.last() != Some(&event.seq) {
                report.repeated.push(event.seq);
            }
            continue;
        }
        if event.seq > expected {
            report.gaps.push(SeqGap {
                expected,
                found: event.seq,
            });
        }
        expected = event.seq.saturating_add(1);
        previous = Some(event.seq);
    }
    report
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TraceMetrics {
    pub duration_s: f64,
    pub num_events: u64,
    pub num_edits: u64,
    pub num_cmds: u64,
    pub num_test_runs: u64,
    pub num_commits: u64,
    pub num_rationale_notes: u64,
    pub files_touched: u64,
    pub edit_churn_lines: u64,
}

impl TraceMetrics {
    #[must_use]
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let mut metrics = Self {
            num_events: count_u64(events.len()),
            ..Self::default()
        };
        let mut files = BTreeSet::new();
        let mut earliest = f64::INFINITY;
        let mut latest = f64::NEG_INFINITY;

        for event in events {
            earliest = earliest.min(event.ts_server_s);
            latest = latest.max(event.ts_server_s);
            match &event.body {
                EventBody::FileEdit(edit) => {
                    metrics.num_edits += 1;
                    metrics.edit_churn_lines += diff_churn_lines(&edit.diff_unified);
                    files.insert(edit.file_path.as_str());
                }
                EventBody::CmdRun(_) => metrics.num_cmds += 1,
                EventBody::TestRun(_) => metrics.num_test_runs += 1,
                EventBody::Commit(_) => metrics.num_commits += 1,
                EventBody::RationaleNote(_) => metrics.num_rationale_notes += 1,
            }
        }

        metrics.files_touched = count_u64(files.len());
        if latest >= earliest {
            metrics.duration_s = latest - earliest;
        }
        metrics
    }
}

/// Added plus removed lines of a unified diff, excluding file headers.
#[must_use]
pub fn diff_churn_lines(diff: &str) -> u64 {
    let changed = diff
        .lines()
        .filter(|line| {
            (line.starts_with('+') && !line.starts_with("+++"))
                || (line.starts_with('-') && !line.starts_with("---"))
        })
        .count();
    count_u64(changed)
}

fn count_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    HumanDev,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionInfo {
    pub participant_id: String,
    pub role: ParticipantRole,
    pub consent: ConsentSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DocumentArtifacts {
    pub final_workspace_snapshot: Option<BlobRef>,
    pub final_patch_unified: Option<String>,
    pub items: Vec<ArtifactRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Integrity {
    /// Authoritative digest, folded in ascending `seq` order at finalization.
    pub event_hash_chain: Option<String>,
    pub chain_algorithm: String,
    pub schema_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub tests_passed: Option<bool>,
    pub framework: Option<String>,
    pub num_passed: Option<u64>,
    pub num_failed: Option<u64>,
    pub runtime_s: Option<f64>,
    pub container_image: Option<String>,
    pub log: Option<BlobRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JudgeScores {
    pub problem_understanding: Option<f64>,
    pub causal_linking: Option<f64>,
    pub experiment_design: Option<f64>,
    pub efficiency: Option<f64>,
    pub reproducibility: Option<f64>,
    pub safety_hygiene: Option<f64>,
    pub overall: Option<f64>,
}

impl JudgeScores {
    fn named(&self) -> [(&'static str, Option<f64>); 7] {
        [
            ("problem_understanding", self.problem_understanding),
            ("causal_linking", self.causal_linking),
            ("experiment_design", self.experiment_design),
            ("efficiency", self.efficiency),
            ("reproducibility", self.reproducibility),
            ("safety_hygiene", self.safety_hygiene),
            ("overall", self.overall),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JudgeResult {
    pub model: Option<String>,
    pub model_version: Option<String>,
    pub rubric_version: Option<String>,
    pub scores: Option<JudgeScores>,
    pub feedback_summary: Option<String>,
}

/// QA section of a finalized trace; also the shape of a write-back patch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QaResults {
    #[serde(default)]
    pub validation: Option<ValidationResult>,
    #[serde(default)]
    pub judge: Option<JudgeResult>,
}

impl QaResults {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.validation.is_none() && self.judge.is_none()
    }

    /// Sections present in `patch` replace the stored ones; absent sections stay.
    pub fn merge(&mut self, patch: QaResults) {
        if patch.validation.is_some() {
            self.validation = patch.validation;
        }
        if patch.judge.is_some() {
            self.judge = patch.judge;
        }
    }

    /// # Errors
    /// Returns a validation error for out-of-range scores or runtimes.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_empty() {
            return Err(PipelineError::chunk_invalid(
                "qa report MUST carry validation or judge results",
            ));
        }
        if let Some(runtime) = self.validation.as_ref().and_then(|v| v.runtime_s) {
            if !runtime.is_finite() || runtime < 0.0 {
                return Err(PipelineError::chunk_invalid(
                    "validation.runtime_s MUST be a finite, non-negative number",
                ));
            }
        }
        if let Some(scores) = self.judge.as_ref().and_then(|j| j.scores.as_ref()) {
            for (name, score) in scores.named() {
                if let Some(score) = score {
                    if !(0.0..=5.0).contains(&score) {
                        return Err(PipelineError::chunk_invalid(format!(
                            "judge score {name} MUST lie within [0, 5], got {score}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// The immutable aggregate produced once per trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalizedTraceDocument {
    pub trace_version: String,
    pub trace_id: TraceId,
    pub session: SessionInfo,
    pub task: TaskInfo,
    pub repo: RepoInfo,
    pub events: Vec<TraceEvent>,
    pub artifacts: DocumentArtifacts,
    pub metrics: TraceMetrics,
    pub integrity: Integrity,
    #[serde(default)]
    pub qa: QaResults,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: DateTimeUtc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizedLookup {
    Finalized(Box<FinalizedTraceDocument>),
    NotYetFinalized {
        status: TraceStatus,
        num_events: u64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HandoffState {
    Dispatched,
    Failed,
}

impl HandoffState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dispatched" => Some(Self::Dispatched),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct HandoffRecord {
    pub trace_id: TraceId,
    pub state: HandoffState,
    pub job_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Seconds since the Unix epoch with sub-second precision.
#[must_use]
pub fn unix_seconds(at: DateTimeUtc) -> f64 {
    let nanos = at.unix_timestamp_nanos();
    #[allow(clippy::cast_precision_loss)]
    let seconds = nanos as f64 / 1_000_000_000.0;
    seconds
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn schema_hash() -> String {
    hash_bytes(TRACE_SCHEMA_ID.as_bytes())
}

#[must_use]
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns a reason string when the value is empty or whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn file_edit(id: &str, seq: u64) -> Value {
        json!({
            "id": id,
            "seq": seq,
            "ts_client_s": 1_700_000_000.25,
            "type": "file_edit",
            "file_path": "src/calculator.py",
            "diff_unified": "--- a/src/calculator.py\n+++ b/src/calculator.py\n-    return a - b\n+    return a + b\n",
            "buffer_hash_after": "after"
        })
    }

    fn validation_reason(result: Result<TraceEvent, PipelineError>) -> (Option<usize>, Option<String>, String) {
        match result {
            Err(PipelineError::Validation {
                event_index,
                event_id,
                reason,
            }) => (event_index, event_id, reason),
            Err(other) => panic!("expected validation error, got {other}"),
            Ok(event) => panic!("expected rejection, accepted {}", event.id),
        }
    }

    #[test]
    fn parses_each_event_variant() {
        let raw = [
            file_edit("e0", 0),
            json!({"id": "e1", "seq": 1, "ts_client_s": 1.0, "type": "cmd_run", "cmd": "pytest", "exit_code": 1}),
            json!({"id": "e2", "seq": 2, "ts_client_s": 2.0, "type": "test_run", "framework": "pytest", "num_passed": 5, "num_failed": 0}),
            json!({"id": "e3", "seq": 3, "ts_client_s": 3.0, "type": "commit", "sha": "abc123", "message": "fix add"}),
            json!({"id": "e4", "seq": 4, "ts_client_s": 4.0, "type": "rationale_note", "structured": {"hypothesis": "wrong operator"}}),
        ];
        let kinds = raw
            .iter()
            .enumerate()
            .map(|(index, value)| match validate_event(index, value) {
                Ok(event) => event.kind(),
                Err(err) => panic!("event {index} rejected: {err}"),
            })
            .collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                EventKind::FileEdit,
                EventKind::CmdRun,
                EventKind::TestRun,
                EventKind::Commit,
                EventKind::RationaleNote
            ]
        );
    }

    #[test]
    fn rejects_negative_seq_with_event_name() {
        let mut raw = file_edit("e7", 0);
        raw["seq"] = json!(-3);
        let (index, id, reason) = validation_reason(validate_event(4, &raw));
        assert_eq!(index, Some(4));
        assert_eq!(id.as_deref(), Some("e7"));
        assert!(reason.contains("non-negative"));
    }

    #[test]
    fn rejects_unknown_type_and_missing_fields() {
        let unknown = json!({"id": "x", "seq": 0, "ts_client_s": 0.0, "type": "keystroke"});
        let (_, _, reason) = validation_reason(validate_event(0, &unknown));
        assert!(reason.contains("keystroke"));

        let missing = json!({"id": "y", "seq": 0, "ts_client_s": 0.0, "type": "test_run", "framework": "pytest"});
        let (_, id, reason) = validation_reason(validate_event(1, &missing));
        assert_eq!(id.as_deref(), Some("y"));
        assert!(reason.contains("num_passed"));

        let empty_note = json!({"id": "z", "seq": 0, "ts_client_s": 0.0, "type": "rationale_note"});
        let (_, _, reason) = validation_reason(validate_event(2, &empty_note));
        assert!(reason.contains("rationale_note"));
    }

    #[test]
    fn validation_error_display_names_the_event() {
        let err = PipelineError::event_invalid(2, Some("e2".to_string()), "bad");
        assert_eq!(err.to_string(), "validation error at event #2 (id=e2): bad");
        assert_eq!(err.code(), "validation_error");
        assert!(!err.is_retryable());
        assert!(PipelineError::StorageUnavailable("busy".to_string()).is_retryable());
    }

    #[test]
    fn chunk_rejects_artifact_for_foreign_event_or_wrong_kind() {
        let mut chunk = ChunkSubmission {
            chunk_id: "c1".to_string(),
            chunk_seq: 0,
            events: vec![file_edit("e0", 0)],
            artifacts: BTreeMap::new(),
        };
        chunk.artifacts.insert(
            "missing".to_string(),
            vec![ArtifactUpload {
                kind: ArtifactKind::Other,
                content: json!("x"),
            }],
        );
        assert!(matches!(
            validate_chunk(&chunk, 100),
            Err(PipelineError::Validation { event_id: Some(ref id), .. }) if id == "missing"
        ));

        chunk.artifacts.clear();
        chunk.artifacts.insert(
            "e0".to_string(),
            vec![ArtifactUpload {
                kind: ArtifactKind::Stdout,
                content: json!("out"),
            }],
        );
        assert!(validate_chunk(&chunk, 100).is_err());

        chunk.artifacts.clear();
        chunk.artifacts.insert(
            "e0".to_string(),
            vec![ArtifactUpload {
                kind: ArtifactKind::WorkspaceSnapshot,
                content: json!({"files": 3}),
            }],
        );
        assert!(validate_chunk(&chunk, 100).is_ok());
        assert!(validate_chunk(&chunk, 0).is_err());
    }

    #[test]
    fn one_bad_event_rejects_the_chunk() {
        let chunk = ChunkSubmission {
            chunk_id: "c1".to_string(),
            chunk_seq: 0,
            events: vec![file_edit("e0", 0), json!({"id": "e1", "seq": 1})],
            artifacts: BTreeMap::new(),
        };
        assert!(matches!(
            validate_chunk(&chunk, 100),
            Err(PipelineError::Validation { event_index: Some(1), .. })
        ));
    }

    #[test]
    fn metrics_count_types_files_and_churn() {
        let mut events = [file_edit("e0", 0), file_edit("e1", 1)]
            .iter()
            .enumerate()
            .map(|(index, raw)| validate_event(index, raw).unwrap_or_else(|_| unreachable!()))
            .collect::<Vec<_>>();
        let test_run = json!({"id": "e2", "seq": 2, "ts_client_s": 2.0, "type": "test_run", "framework": "pytest", "num_passed": 5, "num_failed": 0});
        events.push(validate_event(2, &test_run).unwrap_or_else(|_| unreachable!()));
        for (event, ts) in events.iter_mut().zip([100.0, 130.5, 110.0]) {
            event.ts_server_s = ts;
        }

        let metrics = TraceMetrics::from_events(&events);
        assert_eq!(metrics.num_events, 3);
        assert_eq!(metrics.num_edits, 2);
        assert_eq!(metrics.num_test_runs, 1);
        assert_eq!(metrics.files_touched, 1);
        assert_eq!(metrics.edit_churn_lines, 4);
        assert!((metrics.duration_s - 30.5).abs() < f64::EPSILON);
        assert!(TraceMetrics::from_events(&[]).duration_s.abs() < f64::EPSILON);
    }

    #[test]
    fn sequence_report_flags_gaps_and_repeats() {
        let events = [0_u64, 1, 1, 4, 5]
            .iter()
            .enumerate()
            .map(|(index, seq)| {
                validate_event(index, &file_edit(&format!("e{index}"), *seq))
                    .unwrap_or_else(|_| unreachable!())
            })
            .collect::<Vec<_>>();
        let report = inspect_sequence(&events);
        assert_eq!(report.gaps, vec![SeqGap { expected: 2, found: 4 }]);
        assert_eq!(report.repeated, vec![1]);
        assert!(!report.is_contiguous());
    }

    #[test]
    fn qa_patch_merges_and_checks_bounds() {
        let mut stored = QaResults {
            validation: Some(ValidationResult {
                tests_passed: Some(true),
                ..ValidationResult::default()
            }),
            judge: None,
        };
        let patch = QaResults {
            validation: None,
            judge: Some(JudgeResult {
                scores: Some(JudgeScores {
                    overall: Some(4.5),
                    ..JudgeScores::default()
                }),
                ..JudgeResult::default()
            }),
        };
        assert!(patch.check().is_ok());
        stored.merge(patch);
        assert!(stored.validation.is_some());
        assert!(stored.judge.is_some());

        let out_of_range = QaResults {
            validation: None,
            judge: Some(JudgeResult {
                scores: Some(JudgeScores {
                    efficiency: Some(7.0),
                    ..JudgeScores::default()
                }),
                ..JudgeResult::default()
            }),
        };
        assert!(out_of_range.check().is_err());
        assert!(QaResults::default().check().is_err());
    }

    #[test]
    fn trace_id_round_trips_through_display() {
        let id = TraceId::new();
        let parsed = id.to_string().parse::<TraceId>();
        assert_eq!(parsed.ok(), Some(id));
        assert!(is_sha256_hex(&schema_hash()));
    }
}
