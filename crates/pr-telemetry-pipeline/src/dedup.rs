use std::time::Instant;

use pr_telemetry_domain::{ChunkIngestResult, DateTimeUtc, PipelineError, TraceId};
use pr_telemetry_store_core::{KeyReservation, TraceStore};

use crate::clock::Clock;
use crate::config::PipelineConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller owns the key until it commits or releases with `token`.
    Fresh { token: String },
    Duplicate(ChunkIngestResult),
}

/// At-most-once application of chunks keyed by `(trace_id, idempotency_key)`.
pub struct ChunkDeduplicator<'a> {
    store: &'a dyn TraceStore,
    clock: &'a dyn Clock,
    config: &'a PipelineConfig,
}

impl<'a> ChunkDeduplicator<'a> {
    #[must_use]
    pub fn new(store: &'a dyn TraceStore, clock: &'a dyn Clock, config: &'a PipelineConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Reserve `key`, or return the result stored for it. A key held by a
    /// concurrent submission is polled until that submission commits, releases,
    /// or its lease lapses.
    ///
    /// # Errors
    /// Returns `StorageUnavailable` when the key stays in flight past one lease.
    pub fn check_and_reserve(
        &self,
        trace_id: TraceId,
        key: &str,
    ) -> Result<Reservation, PipelineError> {
        let lease = self.config.reservation_lease();
        let deadline = Instant::now() + lease + self.config.reservation_poll();
        loop {
            match self
                .store
                .reserve_chunk_key(trace_id, key, self.clock.now(), lease)?
            {
                KeyReservation::Fresh { token } => return Ok(Reservation::Fresh { token }),
                KeyReservation::Duplicate(result) => return Ok(Reservation::Duplicate(result)),
                KeyReservation::InFlight { lease_expires_at } => {
                    if Instant::now() >= deadline {
                        return Err(PipelineError::StorageUnavailable(format!(
                            "idempotency key {key} is held by another submission until {lease_expires_at}"
                        )));
                    }
                    tracing::debug!(
                        trace_id = %trace_id,
                        idempotency_key = key,
                        "chunk key in flight; waiting"
                    );
                    std::thread::sleep(self.config.reservation_poll());
                }
            }
        }
    }

    /// Store the result for a reserved key so later duplicates replay it.
    /// `IngestionCoordinator` does not call this; it commits the key in the
    /// same transaction as the chunk's events.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn commit(
        &self,
        trace_id: TraceId,
        key: &str,
        result: &ChunkIngestResult,
    ) -> Result<(), PipelineError> {
        let now = self.clock.now();
        self.store
            .commit_chunk_key(trace_id, key, result, now, self.expiry_from(now))?;
        Ok(())
    }

    /// Give up a reservation this caller still owns.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn release(&self, trace_id: TraceId, key: &str, token: &str) -> Result<(), PipelineError> {
        self.store.release_chunk_key(trace_id, key, token)?;
        Ok(())
    }

    /// Best-effort eviction of keys past their retention window.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn purge_expired(&self) -> Result<u64, PipelineError> {
        let purged = self.store.purge_expired_chunk_keys(self.clock.now())?;
        if purged > 0 {
            tracing::info!(purged, "purged expired idempotency keys");
        }
        Ok(purged)
    }

    #[must_use]
    pub fn expiry_from(&self, now: DateTimeUtc) -> DateTimeUtc {
        now + self.config.idempotency_retention()
    }
}
