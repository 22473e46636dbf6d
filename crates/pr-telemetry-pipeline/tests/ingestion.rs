mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{chunk, cmd_run, file_edit, must, rationale, test_run, Harness};
use pr_telemetry_domain::{
    hash_bytes, unix_seconds, ArtifactKind, ArtifactUpload, EventBody, PipelineError, TraceId,
    TraceStatus,
};
use pr_telemetry_pipeline::{IngestionCoordinator, Reservation};
use pr_telemetry_store_core::{BlobNamespace, BlobStore, TraceStore};
use serde_json::json;

#[test]
fn resubmitting_a_chunk_applies_it_once() {
    let harness = Harness::new("idempotent");
    let trace_id = harness.create_trace();
    let coordinator = harness.coordinator();
    let submission = chunk("c1", vec![file_edit("e0", 0, "calc.py"), test_run("e1", 1, 5, 0)]);

    let first = must(coordinator.ingest(trace_id, &submission, "K1"));
    assert!(!first.replayed);
    assert_eq!(first.result.events_added, 2);
    assert_eq!(first.result.total_events, 2);

    for _ in 0..3 {
        let again = must(coordinator.ingest(trace_id, &submission, "K1"));
        assert!(again.replayed);
        assert_eq!(again.result, first.result);
    }

    assert_eq!(must(harness.store.count_events(trace_id)), 2);
    assert_eq!(must(harness.store.list_chunks(trace_id)).len(), 1);
    assert_eq!(must(harness.store.require_trace(trace_id)).num_events, 2);
}

#[test]
fn duplicate_event_ids_across_chunks_keep_the_first_payload() {
    let harness = Harness::new("first-write-wins");
    let trace_id = harness.create_trace();
    let coordinator = harness.coordinator();

    must(coordinator.ingest(trace_id, &chunk("c1", vec![file_edit("E1", 0, "first.py")]), "K1"));
    let second = must(coordinator.ingest(
        trace_id,
        &chunk("c2", vec![file_edit("E1", 0, "second.py")]),
        "K2",
    ));
    assert_eq!(second.result.events_added, 0);
    assert_eq!(second.result.events_skipped, 1);
    assert_eq!(second.result.total_events, 1);

    let stored = must(harness.store.list_events_ordered(trace_id));
    assert_eq!(stored.len(), 1);
    match &stored[0].event.body {
        EventBody::FileEdit(edit) => assert_eq!(edit.file_path, "first.py"),
        other => panic!("unexpected body {other:?}"),
    }
}

#[test]
fn one_malformed_event_rejects_the_whole_chunk() {
    let harness = Harness::new("malformed");
    let trace_id = harness.create_trace();
    let coordinator = harness.coordinator();

    let mut broken = test_run("e1", 1, 5, 0);
    if let Some(object) = broken.as_object_mut() {
        object.remove("framework");
    }
    let rejected = coordinator.ingest(
        trace_id,
        &chunk("c1", vec![file_edit("e0", 0, "calc.py"), broken]),
        "K1",
    );
    match rejected {
        Err(PipelineError::Validation {
            event_index,
            event_id,
            ..
        }) => {
            assert_eq!(event_index, Some(1));
            assert_eq!(event_id.as_deref(), Some("e1"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(must(harness.store.count_events(trace_id)), 0);

    let fixed = chunk("c1", vec![file_edit("e0", 0, "calc.py"), test_run("e1", 1, 5, 0)]);
    let retried = must(coordinator.ingest(trace_id, &fixed, "K1"));
    assert!(!retried.replayed);
    assert_eq!(retried.result.events_added, 2);
}

#[test]
fn unknown_event_type_and_negative_seq_are_rejected() {
    let harness = Harness::new("schema");
    let trace_id = harness.create_trace();
    let coordinator = harness.coordinator();

    let unknown = json!({"id": "x", "seq": 0, "ts_client_s": 1.0, "type": "mouse_move"});
    assert!(matches!(
        coordinator.ingest(trace_id, &chunk("c1", vec![unknown]), "K1"),
        Err(PipelineError::Validation { event_index: Some(0), .. })
    ));

    let mut negative = file_edit("e0", 0, "calc.py");
    negative["seq"] = json!(-1);
    let err = match coordinator.ingest(trace_id, &chunk("c2", vec![negative]), "K2") {
        Err(err) => err,
        Ok(receipt) => panic!("negative seq accepted: {receipt:?}"),
    };
    assert_eq!(err.code(), "validation_error");
    assert!(err.to_string().contains("non-negative"));
}

#[test]
fn retry_after_a_failure_before_commit_applies_once() {
    let harness = Harness::new("crash-retry");
    let trace_id = harness.create_trace();
    let coordinator = harness.coordinator();
    let submission = chunk("c1", vec![file_edit("e0", 0, "calc.py"), test_run("e1", 1, 5, 0)]);

    harness.blobs.fail_next(BlobNamespace::Chunks, 1);
    let failed = coordinator.ingest(trace_id, &submission, "K1");
    assert!(matches!(failed, Err(ref err) if err.is_retryable()));
    assert_eq!(must(harness.store.count_events(trace_id)), 0);

    let retried = must(coordinator.ingest(trace_id, &submission, "K1"));
    assert!(!retried.replayed);
    assert_eq!(retried.result.events_added, 2);
    assert_eq!(must(harness.store.count_events(trace_id)), 2);
}

#[test]
fn reservation_left_by_a_crashed_worker_is_taken_over_after_its_lease() {
    let harness = Harness::new("lease-takeover");
    let trace_id = harness.create_trace();

    // A worker reserved the key and died before applying the chunk.
    assert!(matches!(
        must(harness.dedup().check_and_reserve(trace_id, "K1")),
        Reservation::Fresh { .. }
    ));

    harness.advance(harness.config.reservation_lease() + Duration::from_millis(1));
    let receipt = must(harness.coordinator().ingest(
        trace_id,
        &chunk("c1", vec![file_edit("e0", 0, "calc.py")]),
        "K1",
    ));
    assert!(!receipt.replayed);
    assert_eq!(receipt.result.events_added, 1);
}

#[test]
fn ingest_requires_an_existing_ingesting_trace() {
    let harness = Harness::new("status-gate");
    let coordinator = harness.coordinator();
    let submission = chunk("c1", vec![file_edit("e0", 0, "calc.py")]);

    let missing = TraceId::new();
    assert_eq!(
        coordinator.ingest(missing, &submission, "K1"),
        Err(PipelineError::TraceNotFound(missing))
    );

    let abandoned = harness.create_trace();
    let record = must(coordinator.abandon(abandoned, "participant withdrew"));
    assert_eq!(record.status, TraceStatus::Failed);
    assert!(matches!(
        coordinator.ingest(abandoned, &submission, "K1"),
        Err(PipelineError::InvalidState {
            actual: TraceStatus::Failed,
            ..
        })
    ));
    assert!(coordinator.abandon(abandoned, "again").is_err());

    let finalized = harness.create_trace();
    must(coordinator.ingest(finalized, &submission, "K1"));
    must(harness.finalizer().finalize(finalized));
    assert!(matches!(
        coordinator.ingest(finalized, &chunk("c2", vec![file_edit("e1", 1, "calc.py")]), "K2"),
        Err(PipelineError::InvalidState {
            actual: TraceStatus::Finalized,
            required: TraceStatus::Ingesting,
            ..
        })
    ));
    assert_eq!(must(harness.store.count_events(finalized)), 1);
}

#[test]
fn server_timestamps_come_from_the_pipeline_clock() {
    let harness = Harness::new("server-ts");
    let trace_id = harness.create_trace();

    let mut forged = rationale("e0", 0);
    forged["ts_server_s"] = json!(1.0);
    must(harness.coordinator().ingest(trace_id, &chunk("c1", vec![forged]), "K1"));

    let stored = must(harness.store.list_events_ordered(trace_id));
    let expected = unix_seconds(harness.now());
    assert!((stored[0].event.ts_server_s - expected).abs() < 1e-6);
    assert!((stored[0].event.ts_client_s - 1_772_355_601.0).abs() < 1e-6);
}

#[test]
fn artifacts_are_stored_by_content_and_linked_to_their_event() {
    let harness = Harness::new("artifacts");
    let trace_id = harness.create_trace();
    let mut submission = chunk("c1", vec![cmd_run("e0", 0, 1), file_edit("e1", 1, "calc.py")]);
    submission.artifacts = BTreeMap::from([
        (
            "e0".to_string(),
            vec![
                ArtifactUpload {
                    kind: ArtifactKind::Stdout,
                    content: json!("1 failed, 4 passed"),
                },
                ArtifactUpload {
                    kind: ArtifactKind::Stderr,
                    content: json!(""),
                },
            ],
        ),
        (
            "e1".to_string(),
            vec![ArtifactUpload {
                kind: ArtifactKind::WorkspaceSnapshot,
                content: json!({"calc.py": "def add(a, b):\n    return a + b\n"}),
            }],
        ),
    ]);

    let receipt = must(harness.coordinator().ingest(trace_id, &submission, "K1"));
    assert_eq!(receipt.result.artifacts_added, 3);

    let artifacts = must(harness.store.list_artifacts(trace_id));
    assert_eq!(artifacts.len(), 3);
    let stdout = artifacts
        .iter()
        .find(|artifact| artifact.kind == ArtifactKind::Stdout)
        .map(|artifact| artifact.blob.clone());
    let Some(stdout) = stdout else {
        panic!("stdout artifact missing");
    };
    assert_eq!(stdout.sha256, hash_bytes(b"1 failed, 4 passed"));
    assert_eq!(must(harness.blobs.get(&stdout)), b"1 failed, 4 passed");

    let stored = must(harness.store.list_events_ordered(trace_id));
    match &stored[0].event.body {
        EventBody::CmdRun(run) => {
            assert_eq!(run.stdout_ref.as_ref(), Some(&stdout));
            assert!(run.stderr_ref.is_some());
        }
        other => panic!("unexpected body {other:?}"),
    }

    let chunks = must(harness.store.list_chunks(trace_id));
    assert_eq!(chunks[0].idempotency_key, "K1");
    assert!(must(harness.blobs.get(&chunks[0].raw)).starts_with(b"{"));
}

#[test]
fn artifacts_of_an_ignored_duplicate_event_are_not_recorded() {
    let harness = Harness::new("duplicate-event-artifacts");
    let trace_id = harness.create_trace();
    let coordinator = harness.coordinator();
    let with_output = |chunk_id: &str, stdout: &str, snapshot: &str| {
        let mut submission = chunk(chunk_id, vec![cmd_run("E1", 0, 0)]);
        submission.artifacts = BTreeMap::from([(
            "E1".to_string(),
            vec![
                ArtifactUpload {
                    kind: ArtifactKind::Stdout,
                    content: json!(stdout),
                },
                ArtifactUpload {
                    kind: ArtifactKind::WorkspaceSnapshot,
                    content: json!(snapshot),
                },
            ],
        )]);
        submission
    };

    let first = must(coordinator.ingest(trace_id, &with_output("c1", "first output", "snap-1"), "K1"));
    assert_eq!(first.result.artifacts_added, 2);

    let second = must(coordinator.ingest(
        trace_id,
        &with_output("c2", "second output", "snap-2"),
        "K2",
    ));
    assert!(!second.replayed);
    assert_eq!(second.result.events_added, 0);
    assert_eq!(second.result.events_skipped, 1);
    assert_eq!(second.result.artifacts_added, 0);
    assert_eq!(must(harness.store.list_artifacts(trace_id)).len(), 2);

    let document = must(harness.finalizer().finalize(trace_id));
    assert_eq!(document.artifacts.items.len(), 2);
    assert!(document
        .artifacts
        .items
        .iter()
        .all(|item| item.blob.sha256 != hash_bytes(b"second output")
            && item.blob.sha256 != hash_bytes(b"snap-2")));
    match &document.events[0].body {
        EventBody::CmdRun(run) => assert_eq!(
            run.stdout_ref.as_ref().map(|blob| blob.sha256.clone()),
            Some(hash_bytes(b"first output"))
        ),
        other => panic!("unexpected body {other:?}"),
    }
    assert_eq!(
        document
            .artifacts
            .final_workspace_snapshot
            .as_ref()
            .map(|blob| blob.sha256.clone()),
        Some(hash_bytes(b"snap-1"))
    );
}

#[test]
fn artifacts_must_reference_events_of_the_same_chunk() {
    let harness = Harness::new("orphan-artifact");
    let trace_id = harness.create_trace();
    let mut submission = chunk("c1", vec![file_edit("e0", 0, "calc.py")]);
    submission.artifacts = BTreeMap::from([(
        "elsewhere".to_string(),
        vec![ArtifactUpload {
            kind: ArtifactKind::Other,
            content: json!("x"),
        }],
    )]);
    assert!(matches!(
        harness.coordinator().ingest(trace_id, &submission, "K1"),
        Err(PipelineError::Validation { .. })
    ));

    let mut mismatched = chunk("c1", vec![file_edit("e0", 0, "calc.py")]);
    mismatched.artifacts = BTreeMap::from([(
        "e0".to_string(),
        vec![ArtifactUpload {
            kind: ArtifactKind::TestReport,
            content: json!({"passed": 5}),
        }],
    )]);
    assert!(matches!(
        harness.coordinator().ingest(trace_id, &mismatched, "K1"),
        Err(PipelineError::Validation { .. })
    ));
    assert_eq!(must(harness.store.count_events(trace_id)), 0);
}

#[test]
fn concurrent_duplicate_submissions_apply_exactly_once() {
    let harness = Harness::new("concurrent-dupes");
    let trace_id = harness.create_trace();
    let submission = chunk(
        "c1",
        vec![
            file_edit("e0", 0, "calc.py"),
            cmd_run("e1", 1, 0),
            test_run("e2", 2, 5, 0),
        ],
    );

    let receipts = std::thread::scope(|scope| {
        let handles = (0..6)
            .map(|_| {
                scope.spawn(|| {
                    let store = harness.open_worker_store();
                    let coordinator = IngestionCoordinator::new(
                        &store,
                        &harness.blobs,
                        &harness.chain,
                        &harness.clock,
                        &harness.config,
                    );
                    coordinator.ingest(trace_id, &submission, "K-race")
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => must(result),
                Err(err) => panic!("worker panicked: {err:?}"),
            })
            .collect::<Vec<_>>()
    });

    assert_eq!(receipts.iter().filter(|receipt| !receipt.replayed).count(), 1);
    assert!(receipts
        .iter()
        .all(|receipt| receipt.result == receipts[0].result));
    assert_eq!(receipts[0].result.events_added, 3);
    assert_eq!(must(harness.store.count_events(trace_id)), 3);
}

#[test]
fn concurrent_chunks_for_one_trace_keep_count_and_chain_consistent() {
    let harness = Harness::new("concurrent-chunks");
    let trace_id = harness.create_trace();

    std::thread::scope(|scope| {
        for worker in 0..4_u64 {
            let harness = &harness;
            scope.spawn(move || {
                let store = harness.open_worker_store();
                let coordinator = IngestionCoordinator::new(
                    &store,
                    &harness.blobs,
                    &harness.chain,
                    &harness.clock,
                    &harness.config,
                );
                let events = (0..5_u64)
                    .map(|offset| {
                        let seq = worker * 5 + offset;
                        file_edit(&format!("e{seq}"), seq, "calc.py")
                    })
                    .collect();
                must(coordinator.ingest(
                    trace_id,
                    &chunk(&format!("c{worker}"), events),
                    &format!("K{worker}"),
                ));
            });
        }
    });

    let trace = must(harness.store.require_trace(trace_id));
    assert_eq!(trace.num_events, 20);
    assert_eq!(trace.chain_version, 4);
    assert_eq!(trace.last_seq, Some(19));

    let report = must(harness.finalizer().audit(trace_id));
    assert_eq!(report.num_events, 20);
    assert_eq!(report.num_chunks, 4);
    assert!(report.sequence.is_contiguous());
}

#[test]
fn chunks_over_the_event_limit_are_rejected() {
    let mut harness = Harness::new("limits");
    harness.config.max_events_per_chunk = 2;
    let trace_id = harness.create_trace();
    let submission = chunk(
        "c1",
        vec![
            file_edit("e0", 0, "a.py"),
            file_edit("e1", 1, "b.py"),
            file_edit("e2", 2, "c.py"),
        ],
    );
    assert!(matches!(
        harness.coordinator().ingest(trace_id, &submission, "K1"),
        Err(PipelineError::Validation { event_index: None, .. })
    ));
    assert!(matches!(
        harness.coordinator().ingest(trace_id, &chunk("c2", Vec::new()), " "),
        Err(PipelineError::Validation { .. })
    ));
}
