//! Operator command surface for the trace pipeline.
//!
//! Every command prints one JSON document on stdout. Failures print an
//! envelope `{"error": {"code", "message", "retryable"}}` built by
//! [`error_envelope`], where `code` is the stable pipeline error code.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pr_telemetry_blob_fs::FsBlobStore;
use pr_telemetry_domain::{
    ChunkSubmission, ConsentSettings, FinalizedLookup, NewTrace, PipelineError, QaResults,
    RepoInfo, TaskInfo, TraceId,
};
use pr_telemetry_pipeline::{ChunkDeduplicator, Finalizer, IngestionCoordinator, SystemClock};
use pr_telemetry_qa::QaDispatcher;
use pr_telemetry_store_core::TraceStore;
use pr_telemetry_store_sqlite::SqliteTraceStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};

mod config;
mod logging;

pub use config::{
    CliConfig, ResolvedConfig, DEFAULT_BLOB_ROOT, DEFAULT_DB_PATH, DEFAULT_HMAC_KEY_ENV,
};
pub use logging::{init_logging, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "prt")]
#[command(about = "PR telemetry trace pipeline CLI")]
pub struct Cli {
    /// YAML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(long, global = true)]
    blob_root: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Trace {
        #[command(subcommand)]
        command: Box<TraceCommand>,
    },
    Qa {
        #[command(subcommand)]
        command: QaCommand,
    },
    Maintenance {
        #[command(subcommand)]
        command: MaintenanceCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum TraceCommand {
    Create(CreateArgs),
    Ingest(IngestArgs),
    Finalize(TraceArgs),
    Show(TraceArgs),
    List,
    Events(EventsArgs),
    Audit(TraceArgs),
    Abandon(AbandonArgs),
}

#[derive(Debug, Args)]
pub struct CreateArgs {
    #[arg(long)]
    participant_id: String,
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    task_title: String,
    #[arg(long)]
    task_description: Option<String>,
    #[arg(long = "known-failing-test")]
    known_failing_tests: Vec<String>,
    #[arg(long)]
    repo_origin: String,
    #[arg(long)]
    start_commit: String,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long)]
    no_rationales: bool,
    #[arg(long)]
    no_commands: bool,
    #[arg(long)]
    no_snapshots: bool,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    trace_id: String,
    /// JSON file holding one chunk submission.
    #[arg(long)]
    chunk: PathBuf,
    /// Defaults to the chunk's `chunk_id`.
    #[arg(long)]
    idempotency_key: Option<String>,
}

#[derive(Debug, Args)]
pub struct TraceArgs {
    #[arg(long)]
    trace_id: String,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[arg(long)]
    trace_id: String,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct AbandonArgs {
    #[arg(long)]
    trace_id: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Subcommand)]
pub enum QaCommand {
    Attach(AttachArgs),
    Redispatch(RedispatchArgs),
}

#[derive(Debug, Args)]
pub struct AttachArgs {
    #[arg(long)]
    trace_id: String,
    /// JSON file with `validation` and/or `judge` sections.
    #[arg(long)]
    report: PathBuf,
}

#[derive(Debug, Args)]
pub struct RedispatchArgs {
    /// Re-dispatch one trace; without it, sweep the whole backlog.
    #[arg(long)]
    trace_id: Option<String>,
    #[arg(long)]
    include_dispatched: bool,
}

#[derive(Debug, Subcommand)]
pub enum MaintenanceCommand {
    PurgeKeys,
}

struct Runtime {
    config: ResolvedConfig,
    store: SqliteTraceStore,
    clock: SystemClock,
}

impl Runtime {
    fn open(config: ResolvedConfig) -> Result<Self> {
        let store = SqliteTraceStore::open(&config.database)?;
        store
            .migrate()
            .map_err(PipelineError::from)
            .context("failed to migrate trace store")?;
        Ok(Self {
            config,
            store,
            clock: SystemClock,
        })
    }

    fn blobs(&self) -> Result<FsBlobStore> {
        FsBlobStore::open(&self.config.blob_root)
    }

    fn dispatcher(&self) -> Result<Box<dyn QaDispatcher>> {
        let dispatcher = self
            .config
            .qa
            .build()
            .map_err(|err| PipelineError::Config(err.to_string()))?;
        Ok(dispatcher)
    }

    fn with_coordinator<T>(
        &self,
        run: impl FnOnce(&IngestionCoordinator<'_>) -> Result<T, PipelineError>,
    ) -> Result<T> {
        let chain = self.config.hash_chain()?;
        let blobs = self.blobs()?;
        let coordinator = IngestionCoordinator::new(
            &self.store,
            &blobs,
            &chain,
            &self.clock,
            &self.config.pipeline,
        );
        run(&coordinator).map_err(Into::into)
    }

    fn with_finalizer<T>(
        &self,
        run: impl FnOnce(&Finalizer<'_>) -> Result<T, PipelineError>,
    ) -> Result<T> {
        let chain = self.config.hash_chain()?;
        let blobs = self.blobs()?;
        let dispatcher = self.dispatcher()?;
        let finalizer = Finalizer::new(
            &self.store,
            &blobs,
            &chain,
            &self.clock,
            &self.config.pipeline,
            dispatcher.as_ref(),
        );
        run(&finalizer).map_err(Into::into)
    }
}

/// Executes the parsed command and returns the JSON document to print.
///
/// # Errors
/// Returns an error when configuration, storage, or the command itself fails;
/// pipeline failures keep their `PipelineError` for [`error_envelope`].
pub fn run_cli(cli: Cli) -> Result<Value> {
    let file_config = match &cli.config {
        Some(path) => CliConfig::load(path)?,
        None => CliConfig::default(),
    };
    let runtime = Runtime::open(file_config.resolve(cli.db, cli.blob_root))?;

    match cli.command {
        Command::Db {
            command: DbCommand::Migrate,
        } => Ok(json!({
            "migrated": true,
            "database": runtime.config.database.display().to_string(),
        })),
        Command::Trace { command } => run_trace(*command, &runtime),
        Command::Qa { command } => run_qa(command, &runtime),
        Command::Maintenance {
            command: MaintenanceCommand::PurgeKeys,
        } => {
            let dedup =
                ChunkDeduplicator::new(&runtime.store, &runtime.clock, &runtime.config.pipeline);
            let purged = dedup.purge_expired()?;
            Ok(json!({ "purged": purged }))
        }
    }
}

fn run_trace(command: TraceCommand, runtime: &Runtime) -> Result<Value> {
    match command {
        TraceCommand::Create(args) => {
            let new_trace = NewTrace {
                participant_id: args.participant_id,
                task: TaskInfo {
                    id: args.task_id,
                    title: args.task_title,
                    description: args.task_description,
                    known_failing_tests: if args.known_failing_tests.is_empty() {
                        None
                    } else {
                        Some(args.known_failing_tests)
                    },
                },
                repo: RepoInfo {
                    origin: args.repo_origin,
                    start_commit: args.start_commit,
                    branch: args.branch,
                },
                consent: ConsentSettings {
                    rationales: !args.no_rationales,
                    commands: !args.no_commands,
                    snapshots: !args.no_snapshots,
                },
            };
            let record = runtime.with_coordinator(|coordinator| coordinator.create_trace(new_trace))?;
            to_value(&record)
        }
        TraceCommand::Ingest(args) => {
            let trace_id = parse_trace_id(&args.trace_id)?;
            let chunk: ChunkSubmission = read_json_file(&args.chunk)?;
            let key = args
                .idempotency_key
                .unwrap_or_else(|| chunk.chunk_id.clone());
            let receipt =
                runtime.with_coordinator(|coordinator| coordinator.ingest(trace_id, &chunk, &key))?;
            to_value(&receipt)
        }
        TraceCommand::Finalize(args) => {
            let trace_id = parse_trace_id(&args.trace_id)?;
            let document = runtime.with_finalizer(|finalizer| finalizer.finalize(trace_id))?;
            to_value(&document)
        }
        TraceCommand::Show(args) => {
            let trace_id = parse_trace_id(&args.trace_id)?;
            let lookup = runtime.with_finalizer(|finalizer| finalizer.get_finalized(trace_id))?;
            let mut out = Map::new();
            match lookup {
                FinalizedLookup::Finalized(document) => {
                    out.insert("status".to_string(), json!("finalized"));
                    out.insert("document".to_string(), to_value(&document)?);
                }
                FinalizedLookup::NotYetFinalized { status, num_events } => {
                    out.insert("status".to_string(), json!(status.as_str()));
                    out.insert("num_events".to_string(), json!(num_events));
                }
            }
            Ok(Value::Object(out))
        }
        TraceCommand::List => {
            let traces = runtime.store.list_traces().map_err(PipelineError::from)?;
            to_value(&traces)
        }
        TraceCommand::Events(args) => {
            let trace_id = parse_trace_id(&args.trace_id)?;
            runtime
                .store
                .require_trace(trace_id)
                .map_err(PipelineError::from)?;
            let mut events = runtime
                .store
                .list_events_ordered(trace_id)
                .map_err(PipelineError::from)?;
            if let Some(limit) = args.limit {
                events.truncate(limit);
            }
            to_value(&events)
        }
        TraceCommand::Audit(args) => {
            let trace_id = parse_trace_id(&args.trace_id)?;
            let report = runtime.with_finalizer(|finalizer| finalizer.audit(trace_id))?;
            if report.document_verified == Some(false) {
                tracing::error!(trace_id = %trace_id, "finalized document fails verification");
            }
            to_value(&report)
        }
        TraceCommand::Abandon(args) => {
            let trace_id = parse_trace_id(&args.trace_id)?;
            let record =
                runtime.with_coordinator(|coordinator| coordinator.abandon(trace_id, &args.reason))?;
            to_value(&record)
        }
    }
}

fn run_qa(command: QaCommand, runtime: &Runtime) -> Result<Value> {
    match command {
        QaCommand::Attach(args) => {
            let trace_id = parse_trace_id(&args.trace_id)?;
            let report: QaResults = read_json_file(&args.report)?;
            let merged = runtime.with_finalizer(|finalizer| finalizer.attach_qa(trace_id, &report))?;
            to_value(&merged)
        }
        QaCommand::Redispatch(args) => match args.trace_id {
            Some(raw) => {
                let trace_id = parse_trace_id(&raw)?;
                let record = runtime.with_finalizer(|finalizer| finalizer.redispatch(trace_id))?;
                to_value(&record)
            }
            None => {
                let outcomes = runtime.with_finalizer(|finalizer| {
                    finalizer.redispatch_pending(args.include_dispatched)
                })?;
                to_value(&outcomes)
            }
        },
    }
}

/// JSON error document for a failed command.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> Value {
    let pipeline = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>());
    let mut error = Map::new();
    error.insert(
        "code".to_string(),
        json!(pipeline.map_or("internal_error", PipelineError::code)),
    );
    error.insert("message".to_string(), json!(format!("{err:#}")));
    error.insert(
        "retryable".to_string(),
        json!(pipeline.is_some_and(PipelineError::is_retryable)),
    );
    if let Some(PipelineError::Validation {
        event_index,
        event_id,
        ..
    }) = pipeline
    {
        error.insert("event_index".to_string(), json!(event_index));
        error.insert("event_id".to_string(), json!(event_id));
    }
    json!({ "error": Value::Object(error) })
}

fn parse_trace_id(raw: &str) -> Result<TraceId> {
    let trace_id = raw
        .parse::<TraceId>()
        .map_err(|err| PipelineError::chunk_invalid(format!("invalid trace id {raw}: {err}")))?;
    Ok(trace_id)
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_slice(&raw).map_err(|err| {
        PipelineError::chunk_invalid(format!("{} is not valid input: {err}", path.display()))
    })?;
    Ok(value)
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("failed to encode command output")
}
