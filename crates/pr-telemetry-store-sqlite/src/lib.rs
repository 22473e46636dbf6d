#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context};
use pr_telemetry_domain::{
    now_utc, AppendResult, ArtifactKind, ArtifactRecord, BlobRef, ChunkIngestResult, ChunkRecord,
    ConsentSettings, DateTimeUtc, FinalizedTraceDocument, HandoffRecord, HandoffState, QaResults,
    RepoInfo, StoredEvent, TaskInfo, TraceEvent, TraceId, TraceRecord, TraceStatus,
};
use pr_telemetry_hash_chain::HashChain;
use pr_telemetry_store_core::{
    AppliedChunk, ChunkWrite, FinalizationClaim, KeyReservation, StoreError, TraceStore,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;
use ulid::Ulid;

const TRACE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS traces (
  trace_id TEXT PRIMARY KEY,
  participant_id TEXT NOT NULL,
  consent_json TEXT NOT NULL,
  task_json TEXT NOT NULL,
  repo_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('ingesting', 'finalizing', 'finalized', 'failed')),
  num_events INTEGER NOT NULL DEFAULT 0 CHECK (num_events >= 0),
  last_seq INTEGER,
  running_digest TEXT,
  chain_version INTEGER NOT NULL DEFAULT 0,
  failure_reason TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  finalizing_since TEXT,
  finalized_at TEXT
);

CREATE TABLE IF NOT EXISTS trace_events (
  append_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  trace_id TEXT NOT NULL,
  event_id TEXT NOT NULL,
  seq INTEGER NOT NULL CHECK (seq >= 0),
  event_type TEXT NOT NULL,
  chunk_id TEXT NOT NULL,
  event_json TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  UNIQUE (trace_id, event_id),
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS trace_chunks (
  chunk_row INTEGER PRIMARY KEY AUTOINCREMENT,
  trace_id TEXT NOT NULL,
  chunk_id TEXT NOT NULL,
  chunk_seq INTEGER NOT NULL,
  idempotency_key TEXT NOT NULL,
  num_events INTEGER NOT NULL,
  events_added INTEGER NOT NULL,
  blob_uri TEXT NOT NULL,
  blob_sha256 TEXT NOT NULL,
  blob_size_bytes INTEGER NOT NULL,
  received_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS chunk_keys (
  trace_id TEXT NOT NULL,
  idempotency_key TEXT NOT NULL,
  state TEXT NOT NULL CHECK (state IN ('reserved', 'committed')),
  result_json TEXT,
  reservation_token TEXT,
  reserved_at TEXT NOT NULL,
  lease_expires_at TEXT NOT NULL,
  committed_at TEXT,
  expires_at TEXT,
  PRIMARY KEY (trace_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS trace_artifacts (
  artifact_id TEXT PRIMARY KEY,
  trace_id TEXT NOT NULL,
  chunk_id TEXT NOT NULL,
  event_id TEXT NOT NULL,
  kind TEXT NOT NULL,
  blob_uri TEXT NOT NULL,
  blob_sha256 TEXT NOT NULL,
  blob_size_bytes INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS finalized_documents (
  trace_id TEXT PRIMARY KEY,
  document_json TEXT NOT NULL,
  event_hash_chain TEXT,
  blob_uri TEXT NOT NULL,
  blob_sha256 TEXT NOT NULL,
  blob_size_bytes INTEGER NOT NULL,
  finalized_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS qa_results (
  trace_id TEXT PRIMARY KEY,
  validation_json TEXT,
  judge_json TEXT,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE TABLE IF NOT EXISTS qa_handoffs (
  trace_id TEXT PRIMARY KEY,
  state TEXT NOT NULL CHECK (state IN ('dispatched', 'failed')),
  job_id TEXT,
  attempts INTEGER NOT NULL DEFAULT 0,
  last_error TEXT,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (trace_id) REFERENCES traces(trace_id)
);

CREATE INDEX IF NOT EXISTS idx_trace_events_order ON trace_events(trace_id, seq, append_seq);
CREATE INDEX IF NOT EXISTS idx_trace_chunks_trace ON trace_chunks(trace_id, chunk_seq, chunk_row);
CREATE INDEX IF NOT EXISTS idx_trace_artifacts_trace ON trace_artifacts(trace_id, created_at);
CREATE INDEX IF NOT EXISTS idx_traces_status ON traces(status);

CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_update
BEFORE UPDATE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_trace_events_no_delete
BEFORE DELETE ON trace_events
BEGIN
  SELECT RAISE(FAIL, 'trace_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_trace_artifacts_no_update
BEFORE UPDATE ON trace_artifacts
BEGIN
  SELECT RAISE(FAIL, 'trace_artifacts is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_trace_artifacts_no_delete
BEFORE DELETE ON trace_artifacts
BEGIN
  SELECT RAISE(FAIL, 'trace_artifacts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_finalized_documents_no_update
BEFORE UPDATE ON finalized_documents
BEGIN
  SELECT RAISE(FAIL, 'finalized_documents is immutable');
END;
CREATE TRIGGER IF NOT EXISTS trg_finalized_documents_no_delete
BEFORE DELETE ON finalized_documents
BEGIN
  SELECT RAISE(FAIL, 'finalized_documents is immutable');
END;
";

const TRACE_COLUMNS: &str = "trace_id, participant_id, consent_json, task_json, repo_json, \
     status, num_events, last_seq, running_digest, chain_version, failure_reason, \
     created_at, updated_at, finalizing_since, finalized_at";

/// `SQLite` backing store. Every mutation runs in a `BEGIN IMMEDIATE`
/// transaction, so writers sharing one database file are serialized by the
/// database lock rather than by in-process state.
pub struct SqliteTraceStore {
    conn: Mutex<Connection>,
}

impl SqliteTraceStore {
    /// Open or create a `SQLite` trace database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a store and apply the schema in one step.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_migrated(path: &Path) -> anyhow::Result<Self> {
        let store = Self::open(path)?;
        store
            .migrate()
            .map_err(|err| anyhow!("failed to migrate trace store: {err}"))?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TraceStore for SqliteTraceStore {
    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute_batch(SCHEMA_V1)
            .sql_context("failed to apply trace schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![TRACE_SCHEMA_VERSION, rfc3339(now_utc())?],
        )
        .sql_context("failed to record trace migration")?;
        Ok(())
    }

    fn insert_trace(&self, record: &TraceRecord) -> Result<(), StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO traces(
                trace_id, participant_id, consent_json, task_json, repo_json, status,
                num_events, last_seq, running_digest, chain_version, failure_reason,
                created_at, updated_at, finalizing_since, finalized_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.trace_id.to_string(),
                record.participant_id,
                to_json(&record.consent)?,
                to_json(&record.task)?,
                to_json(&record.repo)?,
                record.status.as_str(),
                to_sql_int(record.num_events)?,
                record.last_seq.map(to_sql_int).transpose()?,
                record.running_digest,
                to_sql_int(record.chain_version)?,
                record.failure_reason,
                rfc3339(record.created_at)?,
                rfc3339(record.updated_at)?,
                record.finalizing_since.map(rfc3339).transpose()?,
                record.finalized_at.map(rfc3339).transpose()?,
            ],
        )
        .sql_context("failed to insert trace")?;
        Ok(())
    }

    fn get_trace(&self, trace_id: TraceId) -> Result<Option<TraceRecord>, StoreError> {
        load_trace(&self.conn(), trace_id)
    }

    fn list_traces(&self) -> Result<Vec<TraceRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TRACE_COLUMNS} FROM traces ORDER BY created_at ASC, trace_id ASC"
            ))
            .sql_context("failed to prepare trace listing")?;
        let rows = stmt
            .query_map([], TraceRow::read)
            .sql_context("failed to list traces")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.sql_context("failed to read trace row")?.into_record()?);
        }
        Ok(out)
    }

    fn mark_failed(
        &self,
        trace_id: TraceId,
        reason: &str,
        now: DateTimeUtc,
    ) -> Result<TraceRecord, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        let record = require_status(&tx, trace_id, TraceStatus::Ingesting)?;
        tx.execute(
            "UPDATE traces SET status = 'failed', failure_reason = ?2, updated_at = ?3
             WHERE trace_id = ?1",
            params![trace_id.to_string(), reason, rfc3339(now)?],
        )
        .sql_context("failed to mark trace failed")?;
        tx.commit().sql_context("failed to commit trace failure")?;
        Ok(TraceRecord {
            status: TraceStatus::Failed,
            failure_reason: Some(reason.to_string()),
            updated_at: now,
            ..record
        })
    }

    fn reserve_chunk_key(
        &self,
        trace_id: TraceId,
        key: &str,
        now: DateTimeUtc,
        lease: Duration,
    ) -> Result<KeyReservation, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;

        if let Some(row) = load_key(&tx, trace_id, key)? {
            match row.state.as_str() {
                "committed" if row.expires_at.is_some_and(|at| at > now) => {
                    let result = row.result.ok_or_else(|| {
                        StoreError::Corrupt(format!("committed key {key} has no result"))
                    })?;
                    return Ok(KeyReservation::Duplicate(result));
                }
                "reserved" if row.lease_expires_at > now => {
                    return Ok(KeyReservation::InFlight {
                        lease_expires_at: row.lease_expires_at,
                    });
                }
                "reserved" => {
                    tracing::warn!(
                        trace_id = %trace_id,
                        idempotency_key = key,
                        "taking over chunk reservation after lease expiry"
                    );
                }
                _ => {}
            }
        }

        let token = Ulid::new().to_string();
        tx.execute(
            "INSERT INTO chunk_keys(
                trace_id, idempotency_key, state, result_json, reservation_token,
                reserved_at, lease_expires_at, committed_at, expires_at
            ) VALUES (?1, ?2, 'reserved', NULL, ?5, ?3, ?4, NULL, NULL)
            ON CONFLICT(trace_id, idempotency_key) DO UPDATE SET
                state = 'reserved',
                result_json = NULL,
                reservation_token = excluded.reservation_token,
                reserved_at = excluded.reserved_at,
                lease_expires_at = excluded.lease_expires_at,
                committed_at = NULL,
                expires_at = NULL",
            params![
                trace_id.to_string(),
                key,
                rfc3339(now)?,
                rfc3339(now + lease)?,
                token,
            ],
        )
        .sql_context("failed to reserve chunk key")?;
        tx.commit().sql_context("failed to commit chunk reservation")?;
        Ok(KeyReservation::Fresh { token })
    }

    fn commit_chunk_key(
        &self,
        trace_id: TraceId,
        key: &str,
        result: &ChunkIngestResult,
        now: DateTimeUtc,
        expires_at: DateTimeUtc,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        commit_key(&tx, trace_id, key, result, now, expires_at)?;
        tx.commit().sql_context("failed to commit chunk key")?;
        Ok(())
    }

    fn release_chunk_key(
        &self,
        trace_id: TraceId,
        key: &str,
        token: &str,
    ) -> Result<(), StoreError> {
        let released = self
            .conn()
            .execute(
                "DELETE FROM chunk_keys
                 WHERE trace_id = ?1 AND idempotency_key = ?2 AND state = 'reserved'
                   AND reservation_token = ?3",
                params![trace_id.to_string(), key, token],
            )
            .sql_context("failed to release chunk key")?;
        if released == 0 {
            tracing::debug!(
                trace_id = %trace_id,
                idempotency_key = key,
                "chunk reservation no longer owned; nothing released"
            );
        }
        Ok(())
    }

    fn purge_expired_chunk_keys(&self, now: DateTimeUtc) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        let rows = {
            let mut stmt = tx
                .prepare(
                    "SELECT trace_id, idempotency_key, state, lease_expires_at, expires_at
                     FROM chunk_keys",
                )
                .sql_context("failed to prepare chunk key scan")?;
            let mapped = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })
                .sql_context("failed to scan chunk keys")?;
            collect_rows(mapped, "failed to read chunk key row")?
        };

        let mut purged = 0_u64;
        for (trace_id, key, state, lease_expires_at, expires_at) in rows {
            let expired = match state.as_str() {
                "committed" => match expires_at {
                    Some(at) => parse_rfc3339(&at)? <= now,
                    None => false,
                },
                _ => parse_rfc3339(&lease_expires_at)? <= now,
            };
            if expired {
                tx.execute(
                    "DELETE FROM chunk_keys WHERE trace_id = ?1 AND idempotency_key = ?2",
                    params![trace_id, key],
                )
                .sql_context("failed to purge chunk key")?;
                purged += 1;
            }
        }
        tx.commit().sql_context("failed to commit chunk key purge")?;
        Ok(purged)
    }

    fn append_events(
        &self,
        trace_id: TraceId,
        chunk_id: &str,
        events: &[TraceEvent],
        chain: &HashChain,
        now: DateTimeUtc,
    ) -> Result<AppendResult, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        let appended = append_events_tx(&tx, trace_id, chunk_id, events, chain, now)?;
        tx.commit().sql_context("failed to commit event append")?;
        Ok(appended.result)
    }

    fn append_chunk(
        &self,
        write: &ChunkWrite<'_>,
        chain: &HashChain,
    ) -> Result<AppliedChunk, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;

        // A reservation taken over after lease expiry may already be committed.
        if let Some(row) = load_key(&tx, write.trace_id, write.idempotency_key)? {
            if row.state == "committed" && row.expires_at.is_some_and(|at| at > write.received_at)
            {
                if let Some(result) = row.result {
                    return Ok(AppliedChunk {
                        result,
                        replayed: true,
                    });
                }
            }
        }

        let appended = append_events_tx(
            &tx,
            write.trace_id,
            write.chunk_id,
            write.events,
            chain,
            write.received_at,
        )?;

        let mut artifacts_added = 0_u64;
        // Artifacts of skipped duplicate events belong to a payload that was ignored.
        for artifact in write
            .artifacts
            .iter()
            .filter(|artifact| appended.inserted_ids.contains(&artifact.event_id))
        {
            artifacts_added += 1;
            tx.execute(
                "INSERT INTO trace_artifacts(
                    artifact_id, trace_id, chunk_id, event_id, kind,
                    blob_uri, blob_sha256, blob_size_bytes, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    artifact.artifact_id.to_string(),
                    artifact.trace_id.to_string(),
                    artifact.chunk_id,
                    artifact.event_id,
                    artifact.kind.as_str(),
                    artifact.blob.uri,
                    artifact.blob.sha256,
                    to_sql_int(artifact.blob.size_bytes)?,
                    rfc3339(artifact.created_at)?,
                ],
            )
            .sql_context("failed to insert artifact")?;
        }

        tx.execute(
            "INSERT INTO trace_chunks(
                trace_id, chunk_id, chunk_seq, idempotency_key, num_events, events_added,
                blob_uri, blob_sha256, blob_size_bytes, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                write.trace_id.to_string(),
                write.chunk_id,
                to_sql_int(write.chunk_seq)?,
                write.idempotency_key,
                to_sql_int(count_u64(write.events.len()))?,
                to_sql_int(appended.result.inserted)?,
                write.raw_chunk.uri,
                write.raw_chunk.sha256,
                to_sql_int(write.raw_chunk.size_bytes)?,
                rfc3339(write.received_at)?,
            ],
        )
        .sql_context("failed to insert chunk record")?;

        let result = ChunkIngestResult {
            chunk_id: write.chunk_id.to_string(),
            events_added: appended.result.inserted,
            events_skipped: appended.result.skipped,
            artifacts_added,
            total_events: appended.result.total,
        };
        commit_key(
            &tx,
            write.trace_id,
            write.idempotency_key,
            &result,
            write.received_at,
            write.key_expires_at,
        )?;
        tx.commit().sql_context("failed to commit chunk")?;
        Ok(AppliedChunk {
            result,
            replayed: false,
        })
    }

    fn list_events_ordered(&self, trace_id: TraceId) -> Result<Vec<StoredEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT append_seq, chunk_id, event_json
                 FROM trace_events
                 WHERE trace_id = ?1
                 ORDER BY seq ASC, append_seq ASC",
            )
            .sql_context("failed to prepare ordered event listing")?;
        let rows = stmt
            .query_map(params![trace_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .sql_context("failed to list events")?;

        let mut out = Vec::new();
        for (append_seq, chunk_id, event_json) in collect_rows(rows, "failed to read event row")? {
            out.push(StoredEvent {
                append_seq,
                chunk_id,
                event: from_json(&event_json, "event_json")?,
            });
        }
        Ok(out)
    }

    fn count_events(&self, trace_id: TraceId) -> Result<u64, StoreError> {
        let conn = self.conn();
        if load_trace(&conn, trace_id)?.is_none() {
            return Err(StoreError::TraceNotFound(trace_id));
        }
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trace_events WHERE trace_id = ?1",
                params![trace_id.to_string()],
                |row| row.get(0),
            )
            .sql_context("failed to count events")?;
        from_sql_int(count, "event count")
    }

    fn list_chunks(&self, trace_id: TraceId) -> Result<Vec<ChunkRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT chunk_id, chunk_seq, idempotency_key, num_events, events_added,
                        blob_uri, blob_sha256, blob_size_bytes, received_at
                 FROM trace_chunks
                 WHERE trace_id = ?1
                 ORDER BY chunk_seq ASC, chunk_row ASC",
            )
            .sql_context("failed to prepare chunk listing")?;
        let rows = stmt
            .query_map(params![trace_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .sql_context("failed to list chunks")?;

        let mut out = Vec::new();
        for (chunk_id, chunk_seq, key, num_events, events_added, uri, sha256, size, received_at) in
            collect_rows(rows, "failed to read chunk row")?
        {
            out.push(ChunkRecord {
                trace_id,
                chunk_id,
                chunk_seq: from_sql_int(chunk_seq, "chunk_seq")?,
                idempotency_key: key,
                num_events: from_sql_int(num_events, "num_events")?,
                events_added: from_sql_int(events_added, "events_added")?,
                raw: BlobRef {
                    uri,
                    sha256,
                    size_bytes: from_sql_int(size, "blob_size_bytes")?,
                },
                received_at: parse_rfc3339(&received_at)?,
            });
        }
        Ok(out)
    }

    fn list_artifacts(&self, trace_id: TraceId) -> Result<Vec<ArtifactRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT artifact_id, chunk_id, event_id, kind,
                        blob_uri, blob_sha256, blob_size_bytes, created_at
                 FROM trace_artifacts
                 WHERE trace_id = ?1
                 ORDER BY created_at ASC, artifact_id ASC",
            )
            .sql_context("failed to prepare artifact listing")?;
        let rows = stmt
            .query_map(params![trace_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .sql_context("failed to list artifacts")?;

        let mut out = Vec::new();
        for (artifact_id, chunk_id, event_id, kind, uri, sha256, size, created_at) in
            collect_rows(rows, "failed to read artifact row")?
        {
            out.push(ArtifactRecord {
                artifact_id: Ulid::from_str(&artifact_id)
                    .map_err(|err| StoreError::Corrupt(format!("invalid artifact_id: {err}")))?,
                trace_id,
                chunk_id,
                event_id,
                kind: ArtifactKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown artifact kind: {kind}")))?,
                blob: BlobRef {
                    uri,
                    sha256,
                    size_bytes: from_sql_int(size, "blob_size_bytes")?,
                },
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(out)
    }

    fn begin_finalization(
        &self,
        trace_id: TraceId,
        now: DateTimeUtc,
        lease: Duration,
    ) -> Result<FinalizationClaim, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        let record = load_trace(&tx, trace_id)?.ok_or(StoreError::TraceNotFound(trace_id))?;

        match record.status {
            TraceStatus::Finalized => {
                let document = load_document(&tx, trace_id)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("finalized trace {trace_id} has no document"))
                })?;
                return Ok(FinalizationClaim::AlreadyFinalized(Box::new(document)));
            }
            TraceStatus::Ingesting => {}
            TraceStatus::Finalizing
                if record
                    .finalizing_since
                    .is_some_and(|since| since + lease <= now) =>
            {
                tracing::warn!(
                    trace_id = %trace_id,
                    "taking over finalization claim after lease expiry"
                );
            }
            TraceStatus::Finalizing | TraceStatus::Failed => {
                return Err(StoreError::InvalidState {
                    trace_id,
                    actual: record.status,
                    required: TraceStatus::Ingesting,
                });
            }
        }

        tx.execute(
            "UPDATE traces SET status = 'finalizing', finalizing_since = ?2, updated_at = ?2
             WHERE trace_id = ?1",
            params![trace_id.to_string(), rfc3339(now)?],
        )
        .sql_context("failed to claim trace for finalization")?;
        tx.commit().sql_context("failed to commit finalization claim")?;

        Ok(FinalizationClaim::Claimed(TraceRecord {
            status: TraceStatus::Finalizing,
            finalizing_since: Some(now),
            updated_at: now,
            ..record
        }))
    }

    fn complete_finalization(
        &self,
        document: &FinalizedTraceDocument,
        blob: &BlobRef,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        require_status(&tx, document.trace_id, TraceStatus::Finalizing)?;

        let stored = FinalizedTraceDocument {
            qa: QaResults::default(),
            ..document.clone()
        };
        let completed_at = rfc3339(document.completed_at)?;
        tx.execute(
            "INSERT INTO finalized_documents(
                trace_id, document_json, event_hash_chain,
                blob_uri, blob_sha256, blob_size_bytes, finalized_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                document.trace_id.to_string(),
                to_json(&stored)?,
                document.integrity.event_hash_chain,
                blob.uri,
                blob.sha256,
                to_sql_int(blob.size_bytes)?,
                completed_at,
            ],
        )
        .sql_context("failed to insert finalized document")?;
        tx.execute(
            "UPDATE traces SET status = 'finalized', finalized_at = ?2, finalizing_since = NULL,
                               updated_at = ?2
             WHERE trace_id = ?1",
            params![document.trace_id.to_string(), completed_at],
        )
        .sql_context("failed to mark trace finalized")?;
        tx.commit().sql_context("failed to commit finalization")?;
        Ok(())
    }

    fn abort_finalization(&self, trace_id: TraceId, now: DateTimeUtc) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE traces SET status = 'ingesting', finalizing_since = NULL, updated_at = ?2
                 WHERE trace_id = ?1 AND status = 'finalizing'",
                params![trace_id.to_string(), rfc3339(now)?],
            )
            .sql_context("failed to abort finalization")?;
        Ok(())
    }

    fn get_finalized_document(
        &self,
        trace_id: TraceId,
    ) -> Result<Option<FinalizedTraceDocument>, StoreError> {
        load_document(&self.conn(), trace_id)
    }

    fn attach_qa_results(
        &self,
        trace_id: TraceId,
        patch: &QaResults,
        now: DateTimeUtc,
    ) -> Result<QaResults, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        require_status(&tx, trace_id, TraceStatus::Finalized)?;

        let mut merged = load_qa(&tx, trace_id)?.unwrap_or_default();
        merged.merge(patch.clone());
        tx.execute(
            "INSERT INTO qa_results(trace_id, validation_json, judge_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(trace_id) DO UPDATE SET
                validation_json = excluded.validation_json,
                judge_json = excluded.judge_json,
                updated_at = excluded.updated_at",
            params![
                trace_id.to_string(),
                merged.validation.as_ref().map(to_json).transpose()?,
                merged.judge.as_ref().map(to_json).transpose()?,
                rfc3339(now)?,
            ],
        )
        .sql_context("failed to upsert qa results")?;
        tx.commit().sql_context("failed to commit qa results")?;
        Ok(merged)
    }

    fn record_handoff(
        &self,
        trace_id: TraceId,
        state: HandoffState,
        job_id: Option<&str>,
        error: Option<&str>,
        now: DateTimeUtc,
    ) -> Result<HandoffRecord, StoreError> {
        let mut conn = self.conn();
        let tx = immediate(&mut conn)?;
        tx.execute(
            "INSERT INTO qa_handoffs(trace_id, state, job_id, attempts, last_error, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(trace_id) DO UPDATE SET
                state = excluded.state,
                job_id = COALESCE(excluded.job_id, qa_handoffs.job_id),
                attempts = qa_handoffs.attempts + 1,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
            params![
                trace_id.to_string(),
                state.as_str(),
                job_id,
                error,
                rfc3339(now)?
            ],
        )
        .sql_context("failed to record qa handoff")?;
        let record = load_handoff(&tx, trace_id)?
            .ok_or_else(|| StoreError::Corrupt(format!("handoff for {trace_id} vanished")))?;
        tx.commit().sql_context("failed to commit qa handoff")?;
        Ok(record)
    }

    fn get_handoff(&self, trace_id: TraceId) -> Result<Option<HandoffRecord>, StoreError> {
        load_handoff(&self.conn(), trace_id)
    }

    fn list_finalized_awaiting_qa(
        &self,
        include_dispatched: bool,
    ) -> Result<Vec<TraceId>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT t.trace_id
                 FROM traces t
                 LEFT JOIN qa_results q ON q.trace_id = t.trace_id
                 LEFT JOIN qa_handoffs h ON h.trace_id = t.trace_id
                 WHERE t.status = 'finalized'
                   AND q.trace_id IS NULL
                   AND (h.trace_id IS NULL OR h.state = 'failed' OR ?1 = 1)
                 ORDER BY t.trace_id ASC",
            )
            .sql_context("failed to prepare qa backlog query")?;
        let rows = stmt
            .query_map(params![i64::from(include_dispatched)], |row| {
                row.get::<_, String>(0)
            })
            .sql_context("failed to list qa backlog")?;
        let raw_ids = collect_rows(rows, "failed to read qa backlog row")?;
        raw_ids.iter().map(String::as_str).map(parse_trace_id).collect()
    }
}

struct TraceRow {
    trace_id: String,
    participant_id: String,
    consent_json: String,
    task_json: String,
    repo_json: String,
    status: String,
    num_events: i64,
    last_seq: Option<i64>,
    running_digest: Option<String>,
    chain_version: i64,
    failure_reason: Option<String>,
    created_at: String,
    updated_at: String,
    finalizing_since: Option<String>,
    finalized_at: Option<String>,
}

impl TraceRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            trace_id: row.get(0)?,
            participant_id: row.get(1)?,
            consent_json: row.get(2)?,
            task_json: row.get(3)?,
            repo_json: row.get(4)?,
            status: row.get(5)?,
            num_events: row.get(6)?,
            last_seq: row.get(7)?,
            running_digest: row.get(8)?,
            chain_version: row.get(9)?,
            failure_reason: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
            finalizing_since: row.get(13)?,
            finalized_at: row.get(14)?,
        })
    }

    fn into_record(self) -> Result<TraceRecord, StoreError> {
        Ok(TraceRecord {
            trace_id: parse_trace_id(&self.trace_id)?,
            participant_id: self.participant_id,
            consent: from_json::<ConsentSettings>(&self.consent_json, "consent_json")?,
            task: from_json::<TaskInfo>(&self.task_json, "task_json")?,
            repo: from_json::<RepoInfo>(&self.repo_json, "repo_json")?,
            status: TraceStatus::parse(&self.status).ok_or_else(|| {
                StoreError::Corrupt(format!("unknown trace status: {}", self.status))
            })?,
            num_events: from_sql_int(self.num_events, "num_events")?,
            last_seq: self
                .last_seq
                .map(|seq| from_sql_int(seq, "last_seq"))
                .transpose()?,
            running_digest: self.running_digest,
            chain_version: from_sql_int(self.chain_version, "chain_version")?,
            failure_reason: self.failure_reason,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
            finalizing_since: self
                .finalizing_since
                .as_deref()
                .map(parse_rfc3339)
                .transpose()?,
            finalized_at: self.finalized_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

struct KeyRow {
    state: String,
    result: Option<ChunkIngestResult>,
    lease_expires_at: DateTimeUtc,
    expires_at: Option<DateTimeUtc>,
}

fn load_trace(conn: &Connection, trace_id: TraceId) -> Result<Option<TraceRecord>, StoreError> {
    conn.query_row(
        &format!("SELECT {TRACE_COLUMNS} FROM traces WHERE trace_id = ?1"),
        params![trace_id.to_string()],
        TraceRow::read,
    )
    .optional()
    .sql_context("failed to load trace")?
    .map(TraceRow::into_record)
    .transpose()
}

fn require_status(
    conn: &Connection,
    trace_id: TraceId,
    required: TraceStatus,
) -> Result<TraceRecord, StoreError> {
    let record = load_trace(conn, trace_id)?.ok_or(StoreError::TraceNotFound(trace_id))?;
    if record.status != required {
        return Err(StoreError::InvalidState {
            trace_id,
            actual: record.status,
            required,
        });
    }
    Ok(record)
}

struct AppendOutcome {
    result: AppendResult,
    inserted_ids: HashSet<String>,
}

fn append_events_tx(
    tx: &Transaction<'_>,
    trace_id: TraceId,
    chunk_id: &str,
    events: &[TraceEvent],
    chain: &HashChain,
    now: DateTimeUtc,
) -> Result<AppendOutcome, StoreError> {
    let record = require_status(tx, trace_id, TraceStatus::Ingesting)?;
    let recorded_at = rfc3339(now)?;
    let trace_key = trace_id.to_string();

    let mut digest = record.running_digest.clone();
    let mut last_seq = record.last_seq;
    let mut inserted = 0_u64;
    let mut skipped = 0_u64;
    let mut inserted_ids = HashSet::new();
    {
        let mut stmt = tx
            .prepare_cached(
                "INSERT INTO trace_events(
                    trace_id, event_id, seq, event_type, chunk_id, event_json, recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(trace_id, event_id) DO NOTHING",
            )
            .sql_context("failed to prepare event insert")?;
        for event in events {
            let changed = stmt
                .execute(params![
                    trace_key,
                    event.id,
                    to_sql_int(event.seq)?,
                    event.kind().as_str(),
                    chunk_id,
                    to_json(event)?,
                    recorded_at,
                ])
                .sql_context("failed to insert event")?;
            if changed == 0 {
                skipped += 1;
                continue;
            }
            inserted += 1;
            inserted_ids.insert(event.id.clone());
            digest = Some(
                chain
                    .fold(digest.as_deref(), event)
                    .map_err(|err| StoreError::Backend(anyhow::Error::new(err)))?,
            );
            last_seq = Some(last_seq.map_or(event.seq, |seen| seen.max(event.seq)));
        }
    }

    let total = record.num_events + inserted;
    if inserted > 0 {
        let updated = tx
            .execute(
                "UPDATE traces SET num_events = ?2, last_seq = ?3, running_digest = ?4,
                                   chain_version = chain_version + 1, updated_at = ?5
                 WHERE trace_id = ?1 AND chain_version = ?6",
                params![
                    trace_key,
                    to_sql_int(total)?,
                    last_seq.map(to_sql_int).transpose()?,
                    digest,
                    recorded_at,
                    to_sql_int(record.chain_version)?,
                ],
            )
            .sql_context("failed to advance trace chain state")?;
        if updated != 1 {
            return Err(StoreError::Corrupt(format!(
                "chain state of trace {trace_id} changed during append"
            )));
        }
    }

    Ok(AppendOutcome {
        result: AppendResult {
            inserted,
            skipped,
            total,
        },
        inserted_ids,
    })
}

fn load_key(conn: &Connection, trace_id: TraceId, key: &str) -> Result<Option<KeyRow>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT state, result_json, lease_expires_at, expires_at
             FROM chunk_keys WHERE trace_id = ?1 AND idempotency_key = ?2",
            params![trace_id.to_string(), key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
        .sql_context("failed to load chunk key")?;

    raw.map(|(state, result_json, lease_expires_at, expires_at)| {
        Ok(KeyRow {
            state,
            result: result_json
                .as_deref()
                .map(|json| from_json(json, "result_json"))
                .transpose()?,
            lease_expires_at: parse_rfc3339(&lease_expires_at)?,
            expires_at: expires_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    })
    .transpose()
}

fn commit_key(
    conn: &Connection,
    trace_id: TraceId,
    key: &str,
    result: &ChunkIngestResult,
    now: DateTimeUtc,
    expires_at: DateTimeUtc,
) -> Result<(), StoreError> {
    let now = rfc3339(now)?;
    conn.execute(
        "INSERT INTO chunk_keys(
            trace_id, idempotency_key, state, result_json,
            reserved_at, lease_expires_at, committed_at, expires_at
        ) VALUES (?1, ?2, 'committed', ?3, ?4, ?4, ?4, ?5)
        ON CONFLICT(trace_id, idempotency_key) DO UPDATE SET
            state = 'committed',
            result_json = excluded.result_json,
            committed_at = excluded.committed_at,
            expires_at = excluded.expires_at",
        params![
            trace_id.to_string(),
            key,
            to_json(result)?,
            now,
            rfc3339(expires_at)?
        ],
    )
    .sql_context("failed to commit chunk key")?;
    Ok(())
}

fn load_document(
    conn: &Connection,
    trace_id: TraceId,
) -> Result<Option<FinalizedTraceDocument>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT document_json FROM finalized_documents WHERE trace_id = ?1",
            params![trace_id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .sql_context("failed to load finalized document")?;
    let Some(raw) = raw else {
        return Ok(None);
    };

    let mut document: FinalizedTraceDocument = from_json(&raw, "document_json")?;
    if let Some(qa) = load_qa(conn, trace_id)? {
        document.qa = qa;
    }
    Ok(Some(document))
}

fn load_qa(conn: &Connection, trace_id: TraceId) -> Result<Option<QaResults>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT validation_json, judge_json FROM qa_results WHERE trace_id = ?1",
            params![trace_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                ))
            },
        )
        .optional()
        .sql_context("failed to load qa results")?;

    raw.map(|(validation, judge)| {
        Ok(QaResults {
            validation: validation
                .as_deref()
                .map(|json| from_json(json, "validation_json"))
                .transpose()?,
            judge: judge
                .as_deref()
                .map(|json| from_json(json, "judge_json"))
                .transpose()?,
        })
    })
    .transpose()
}

fn load_handoff(conn: &Connection, trace_id: TraceId) -> Result<Option<HandoffRecord>, StoreError> {
    let raw = conn
        .query_row(
            "SELECT state, job_id, attempts, last_error, updated_at
             FROM qa_handoffs WHERE trace_id = ?1",
            params![trace_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .sql_context("failed to load qa handoff")?;

    raw.map(|(state, job_id, attempts, last_error, updated_at)| {
        Ok(HandoffRecord {
            trace_id,
            state: HandoffState::parse(&state)
                .ok_or_else(|| StoreError::Corrupt(format!("unknown handoff state: {state}")))?,
            job_id,
            attempts: u32::try_from(attempts)
                .map_err(|_| StoreError::Corrupt(format!("invalid attempts: {attempts}")))?,
            last_error,
            updated_at: parse_rfc3339(&updated_at)?,
        })
    })
    .transpose()
}

fn immediate(conn: &mut Connection) -> Result<Transaction<'_>, StoreError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .sql_context("failed to begin immediate transaction")
}

fn collect_rows<T, I>(rows: I, context: &'static str) -> Result<Vec<T>, StoreError>
where
    I: Iterator<Item = rusqlite::Result<T>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(row.sql_context(context)?);
    }
    Ok(out)
}

trait SqlContext<T> {
    fn sql_context(self, context: &'static str) -> Result<T, StoreError>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn sql_context(self, context: &'static str) -> Result<T, StoreError> {
        self.map_err(|err| classify(err, context))
    }
}

/// Busy, locked and I/O failures are transient; everything else is a backend fault.
fn classify(err: rusqlite::Error, context: &'static str) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
        ) {
            return StoreError::Unavailable(format!("{context}: {err}"));
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(context))
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::Backend(anyhow::Error::new(err).context("failed to encode json")))
}

fn from_json<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Corrupt(format!("invalid {column}: {err}")))
}

fn parse_trace_id(value: &str) -> Result<TraceId, StoreError> {
    TraceId::from_str(value)
        .map_err(|err| StoreError::Corrupt(format!("invalid trace_id ULID: {err}")))
}

fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend(anyhow!("value {value} exceeds i64")))
}

fn from_sql_int(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {column}: {value}")))
}

fn count_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn rfc3339(value: OffsetDateTime) -> Result<String, StoreError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Backend(anyhow!("invalid datetime format: {err}")))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Corrupt(format!("invalid RFC3339 datetime: {err}")))
}
