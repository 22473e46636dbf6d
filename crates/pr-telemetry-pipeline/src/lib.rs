#![forbid(unsafe_code)]
//! Trace ingestion and integrity pipeline: chunk deduplication, ordered
//! event ingestion, finalization into an immutable document, and the QA
//! handoff with its repair path.

mod clock;
mod config;
mod dedup;
mod finalize;
mod ingest;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::PipelineConfig;
pub use dedup::{ChunkDeduplicator, Reservation};
pub use finalize::{AuditReport, Finalizer};
pub use ingest::{IngestReceipt, IngestionCoordinator};
