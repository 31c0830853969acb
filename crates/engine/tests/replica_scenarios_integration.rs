use std::sync::Arc;
use std::time::Duration;

use replica_common::{Component, ConflictReason, DocKey, UpdateOrigin};
use replica_engine::config::EngineConfig;
use replica_engine::{
    EngineError, MemoryEventSink, MemoryStorage, OpenOutcome, RemoteOutcome, Storage, Workspace,
    YDoc,
};

fn key(name: &str) -> DocKey {
    DocKey::new(name).expect("valid doc key")
}

fn config(compact_threshold: u64) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.persistence.compact_threshold = compact_threshold;
    config
}

/// Append `count` single-character edits from an outside writer.
async fn seed_log(storage: &MemoryStorage, doc_key: &DocKey, count: usize) -> String {
    let writer = YDoc::with_client_id(9_000);
    for index in 0..count {
        let before = writer.encode_state_vector();
        let ch = char::from(b'a' + (index % 26) as u8).to_string();
        writer.insert_text_with_origin("content", index as u32, &ch, UpdateOrigin::Local);
        let diff = writer.encode_diff(&before).expect("diff should encode");
        storage.persist(doc_key, &diff).await.expect("seed record should persist");
    }
    writer.get_text_string("content")
}

fn count_actions(sink: &MemoryEventSink, component: Component, action: &str) -> usize {
    sink.actions().into_iter().filter(|(c, a)| *c == component && a == action).count()
}

#[tokio::test]
async fn note_1_compacts_once_and_reload_reads_snapshot() {
    let storage = Arc::new(MemoryStorage::new());
    let doc_key = key("note-1");
    let expected = seed_log(&storage, &doc_key, 60).await;

    let sink = Arc::new(MemoryEventSink::new());
    let first = Workspace::new(&config(50), storage.clone(), sink.clone());
    let OpenOutcome::Loaded { report, .. } = first.open_document(&doc_key).await.expect("open")
    else {
        panic!("first open must load");
    };
    assert_eq!(report.replayed, 60);
    assert!(!report.from_snapshot);
    assert!(first.wait_for_compaction(&doc_key).await);
    assert_eq!(count_actions(&sink, Component::Persistence, "compaction_scheduled"), 1);
    assert_eq!(first.load_state(&doc_key).expect("registered").updates_since_compaction, 0);

    let snapshot = storage.load_snapshot(&doc_key).await.expect("snapshot read").expect("snapshot");
    assert_eq!(snapshot.sequence, 60);
    assert!(storage.get_all_updates(&doc_key).await.expect("log read").is_empty());

    let second_sink = Arc::new(MemoryEventSink::new());
    let second = Workspace::new(&config(50), storage.clone(), second_sink.clone());
    let OpenOutcome::Loaded { report, .. } = second.open_document(&doc_key).await.expect("reopen")
    else {
        panic!("second workspace must load");
    };
    assert!(report.from_snapshot);
    assert_eq!(report.snapshot_sequence, 60);
    assert_eq!(report.replayed, 0);
    assert_eq!(second.document_text(&doc_key, "content").expect("open"), expected);
    assert_eq!(count_actions(&second_sink, Component::Persistence, "compaction_scheduled"), 0);
}

#[tokio::test]
async fn records_written_after_compaction_are_replayed_on_top_of_snapshot() {
    let storage = Arc::new(MemoryStorage::new());
    let doc_key = key("note-2");
    seed_log(&storage, &doc_key, 3).await;
    storage.compact(&doc_key).await.expect("compact");

    let ws = Workspace::new(&config(50), storage.clone(), Arc::new(MemoryEventSink::new()));
    ws.open_document(&doc_key).await.expect("open");
    ws.insert_text(&doc_key, "content", 3, "!").expect("edit");
    assert!(ws.flush(&doc_key).await);
    assert!(ws.close_document(&doc_key));

    let OpenOutcome::Loaded { report, .. } = ws.open_document(&doc_key).await.expect("reopen")
    else {
        panic!("reopen must load");
    };
    assert_eq!((report.snapshot_sequence, report.replayed, report.head), (3, 1, 4));
    assert_eq!(ws.document_text(&doc_key, "content").expect("open"), "abc!");
}

#[tokio::test]
async fn idle_replica_applies_newer_remote_version() {
    let storage = Arc::new(MemoryStorage::new());
    let doc_key = key("note-1");
    seed_log(&storage, &doc_key, 5).await;

    let replica_a = Workspace::new(&config(500), storage.clone(), Arc::new(MemoryEventSink::new()));
    let replica_b = Workspace::new(&config(500), storage.clone(), Arc::new(MemoryEventSink::new()));
    replica_a.open_document(&doc_key).await.expect("open a");
    replica_b.open_document(&doc_key).await.expect("open b");
    assert_eq!(replica_a.cached_version(&doc_key), Some(5));
    assert_eq!(replica_b.cached_version(&doc_key), Some(5));

    replica_a.insert_text(&doc_key, "content", 5, " from A").expect("edit");
    assert!(replica_a.flush(&doc_key).await);
    assert_eq!(replica_a.cached_version(&doc_key), Some(6));

    let mut conflicts = replica_b.subscribe_conflicts();
    let outcome = replica_b.on_remote_version(&doc_key, 6).await.expect("notice");
    assert_eq!(outcome, RemoteOutcome::Apply { version: 6 });
    assert_eq!(replica_b.cached_version(&doc_key), Some(6));
    assert_eq!(
        replica_b.document_text(&doc_key, "content").expect("open"),
        replica_a.document_text(&doc_key, "content").expect("open"),
    );
    assert!(conflicts.try_recv().is_err());
    // Catch-up is replayed state and is never written back.
    assert_eq!(storage.persist_calls(), 6);

    // Same notice again: idempotent.
    assert_eq!(replica_b.on_remote_version(&doc_key, 6).await.expect("notice"), RemoteOutcome::Ignored);
}

#[tokio::test(start_paused = true)]
async fn editing_replica_blocks_remote_version_until_guard_expires() {
    let storage = Arc::new(MemoryStorage::new());
    let doc_key = key("note-1");
    seed_log(&storage, &doc_key, 5).await;

    let replica_a = Workspace::new(&config(500), storage.clone(), Arc::new(MemoryEventSink::new()));
    let sink_b = Arc::new(MemoryEventSink::new());
    let replica_b = Workspace::new(&config(500), storage.clone(), sink_b.clone());
    replica_a.open_document(&doc_key).await.expect("open a");
    replica_b.open_document(&doc_key).await.expect("open b");
    let mut conflicts = replica_b.subscribe_conflicts();

    replica_a.insert_text(&doc_key, "content", 0, "A:").expect("edit a");
    assert!(replica_a.flush(&doc_key).await);
    replica_b.insert_text(&doc_key, "content", 5, ":B").expect("edit b");

    let outcome = replica_b.on_remote_version(&doc_key, 6).await.expect("notice");
    let RemoteOutcome::Blocked(event) = outcome else {
        panic!("expected a blocked remote version, got {outcome:?}");
    };
    assert_eq!(event.version, 6);
    assert_eq!(event.reason, ConflictReason::LocalEditsPending);
    assert_eq!(replica_b.cached_version(&doc_key), Some(5));
    assert_eq!(conflicts.try_recv().expect("conflict surfaced"), event);
    assert_eq!(count_actions(&sink_b, Component::ConflictDetector, "remote_update_blocked"), 1);

    // After the guard window the same rule applies the newer state.
    assert!(replica_b.flush(&doc_key).await);
    tokio::time::sleep(EngineConfig::default().conflict.guard_window() + Duration::from_millis(10))
        .await;
    let outcomes = replica_b.on_visibility_regained().await;
    assert_eq!(outcomes, vec![(doc_key.clone(), RemoteOutcome::Apply { version: 7 })]);
    assert_eq!(replica_b.cached_version(&doc_key), Some(7));
    let text = replica_b.document_text(&doc_key, "content").expect("open");
    assert!(text.contains("A:") && text.contains(":B"), "merged text was {text:?}");
}

#[tokio::test]
async fn visibility_regained_without_changes_raises_nothing() {
    let storage = Arc::new(MemoryStorage::new());
    let doc_key = key("note-1");
    seed_log(&storage, &doc_key, 2).await;

    let sink = Arc::new(MemoryEventSink::new());
    let ws = Workspace::new(&config(500), storage, sink.clone());
    ws.open_document(&doc_key).await.expect("open");
    ws.insert_text(&doc_key, "content", 0, "x").expect("edit");
    assert!(ws.flush(&doc_key).await);

    let outcomes = ws.on_visibility_regained().await;
    assert_eq!(outcomes, vec![(doc_key.clone(), RemoteOutcome::Ignored)]);
    assert_eq!(count_actions(&sink, Component::ConflictDetector, "remote_update_blocked"), 0);
}

#[tokio::test]
async fn eviction_deregisters_before_release_and_reopen_reloads() {
    let storage = Arc::new(MemoryStorage::new());
    let sink = Arc::new(MemoryEventSink::new());
    let mut config = config(500);
    config.cache.capacity = 2;
    let ws = Workspace::new(&config, storage.clone(), sink.clone());

    ws.open_document(&key("a")).await.expect("open a");
    ws.insert_text(&key("a"), "content", 0, "kept").expect("edit a");
    assert!(ws.flush(&key("a")).await);
    ws.open_document(&key("b")).await.expect("open b");
    ws.pin(&key("b"));

    let OpenOutcome::Loaded { evicted, .. } = ws.open_document(&key("c")).await.expect("open c")
    else {
        panic!("c must load");
    };
    assert_eq!(evicted, Some(key("a")));

    let events = sink.events();
    let position = |component: Component, action: &str| {
        events
            .iter()
            .position(|event| {
                event.component == component
                    && event.action == action
                    && event.metadata["doc_key"] == "a"
            })
            .unwrap_or_else(|| panic!("missing {component}/{action}"))
    };
    assert!(
        position(Component::UpdateGate, "handler_deregistered")
            < position(Component::EvictionCache, "document_released")
    );

    ws.unpin(&key("b"));
    let OpenOutcome::Loaded { report, .. } = ws.open_document(&key("a")).await.expect("reopen a")
    else {
        panic!("evicted document must reload");
    };
    assert_eq!(report.replayed, 1);
    assert_eq!(ws.document_text(&key("a"), "content").expect("open"), "kept");
}

#[tokio::test]
async fn all_pinned_cache_blocks_admission_without_counting_failures() {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = config(500);
    config.cache.capacity = 1;
    let ws = Workspace::new(&config, storage, Arc::new(MemoryEventSink::new()));

    ws.open_document(&key("a")).await.expect("open a");
    ws.pin(&key("a"));
    let error = ws.open_document(&key("b")).await.expect_err("cache is full");
    assert!(matches!(error, EngineError::CapacityExhausted { capacity: 1 }));
    assert_eq!(ws.failure_counter().consecutive_failures, 0);
    assert!(!ws.is_degraded());
}

#[tokio::test]
async fn repeated_persist_failures_enter_degraded_mode_and_block_opens() {
    let storage = Arc::new(MemoryStorage::new());
    let sink = Arc::new(MemoryEventSink::new());
    let ws = Workspace::new(&config(500), storage.clone(), sink.clone());
    let doc_key = key("note-1");
    ws.open_document(&doc_key).await.expect("open");

    storage.fail_next(3);
    for (index, chunk) in ["x", "y", "z"].into_iter().enumerate() {
        ws.insert_text(&doc_key, "content", index as u32, chunk).expect("edit");
    }
    assert!(ws.flush(&doc_key).await);
    assert!(ws.is_degraded());
    assert_eq!(ws.failure_counter().consecutive_failures, 3);

    let error = ws.open_document(&key("note-2")).await.expect_err("degraded");
    assert!(matches!(error, EngineError::Degraded { operation: "open_document", .. }));
    // Already-open documents stay readable.
    assert_eq!(ws.document_text(&doc_key, "content").expect("open"), "xyz");

    storage.set_offline(true);
    assert!(matches!(ws.reset_degraded_mode().await, Err(EngineError::ProbeFailed(_))));
    assert!(ws.is_degraded());
    assert_eq!(ws.failure_counter().consecutive_failures, 4);

    storage.set_offline(false);
    ws.reset_degraded_mode().await.expect("probe succeeds");
    assert!(!ws.is_degraded());
    assert_eq!(ws.failure_counter().consecutive_failures, 0);
    ws.open_document(&key("note-2")).await.expect("open after reset");
    assert_eq!(count_actions(&sink, Component::DegradedMode, "entered_degraded"), 1);
    assert_eq!(count_actions(&sink, Component::DegradedMode, "reset_succeeded"), 1);
}

#[tokio::test]
async fn failed_load_marks_document_loaded_by_default() {
    let storage = Arc::new(MemoryStorage::new());
    let doc_key = key("note-1");
    seed_log(&storage, &doc_key, 2).await;
    let ws = Workspace::new(&config(500), storage.clone(), Arc::new(MemoryEventSink::new()));

    storage.fail_next(1);
    let OpenOutcome::Loaded { report, .. } = ws.open_document(&doc_key).await.expect("open")
    else {
        panic!("document must load");
    };
    assert!(report.failure.is_some());
    assert!(ws.load_state(&doc_key).expect("registered").initial_load_complete);
    assert_eq!(ws.failure_counter().consecutive_failures, 1);

    ws.insert_text(&doc_key, "content", 0, "new").expect("edit");
    assert!(ws.flush(&doc_key).await);
    assert_eq!(storage.persist_calls(), 3);
}
