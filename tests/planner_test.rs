mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use common::{harness, harness_with_sink, item, log_entry, noon, FakeMonday};
use monday_replicator::clock::Clock;
use monday_replicator::config::Config;
use monday_replicator::daemon::{DaemonConfig, SyncDaemon};
use monday_replicator::differ::RETENTION_EXCEEDED;
use monday_replicator::planner::RunPhase;
use monday_replicator::remote::HttpReply;
use monday_replicator::sink::MemorySink;
use monday_replicator::watermark::{SyncMode, Watermark, WatermarkStore};
use monday_replicator::{ObjectOptions, ObjectType, RunStatus};
use serde_json::json;

fn watermark_at(at: chrono::DateTime<chrono::Utc>) -> Watermark {
    Watermark {
        last_sync_timestamp: at,
        mode_used: SyncMode::FullSnapshot,
        cursor_metadata: None,
    }
}

fn two_boards_of_items() -> FakeMonday {
    FakeMonday::new()
        .with_boards(&["1", "2"])
        .with_items(vec![item(5, "1"), item(6, "1"), item(7, "2")])
}

#[tokio::test]
async fn test_first_run_takes_full_snapshot() {
    let h = harness(two_boards_of_items());

    for object in [ObjectType::Boards, ObjectType::Items] {
        let summary = h.planner.run(object, &ObjectOptions::default()).await;
        assert_eq!(summary.status, RunStatus::Committed, "{:?}", summary.error);
        assert_eq!(summary.mode_used, Some(SyncMode::FullSnapshot));
        assert_eq!(summary.fallback_reason, None);
        assert_eq!(
            summary.phases,
            vec![RunPhase::NoPriorWatermark, RunPhase::FullSnapshot, RunPhase::Committed]
        );

        let stored = h.store.get(object.as_str()).await.unwrap().unwrap();
        assert_eq!(stored.mode_used, SyncMode::FullSnapshot);
    }

    let records = h.sink.records();
    let items: Vec<_> = records
        .iter()
        .filter(|r| r.object_type == ObjectType::Items)
        .collect();
    assert_eq!(items.len(), 3);
    assert!(h.fake.requests_matching("activity_logs").is_empty());
}

#[tokio::test]
async fn test_items_without_board_ids_discover_boards_first() {
    let h = harness(two_boards_of_items());
    h.planner.run(ObjectType::Items, &ObjectOptions::default()).await;

    let requests = h.fake.requests.lock().unwrap();
    assert!(requests[0].0.contains("state: active"));
    assert!(requests[1..].iter().all(|(q, _)| q.contains("items_page")));
}

#[tokio::test]
async fn test_configured_board_ids_scope_the_watermark() {
    let h = harness(two_boards_of_items());
    let options = ObjectOptions {
        board_ids: Some(vec!["2".into(), "1".into()]),
        ..Default::default()
    };

    let summary = h.planner.run(ObjectType::Items, &options).await;
    assert_eq!(summary.watermark_key, "items:boards=1,2");
    assert!(h.store.get("items:boards=1,2").await.unwrap().is_some());
    assert!(h.store.get("items").await.unwrap().is_none());
    assert!(h.fake.requests_matching("state: active").is_empty());
}

#[tokio::test]
async fn test_incremental_watermark_is_run_start_time() {
    let fake = two_boards_of_items().with_log(
        "1",
        vec![log_entry("board", "update_board_name", json!({}), noon() - chrono::Duration::minutes(10))],
    );
    let h = harness(fake);
    *h.fake.clock.lock().unwrap() = Some(h.clock.clone());
    h.store
        .put("boards", watermark_at(noon() - chrono::Duration::hours(1)))
        .await
        .unwrap();

    let summary = h.planner.run(ObjectType::Boards, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Committed, "{:?}", summary.error);
    assert_eq!(summary.mode_used, Some(SyncMode::Incremental));
    assert_eq!(summary.records_emitted, 1);

    // Every request moved the clock forward; the watermark must not follow it
    let stored = h.store.get("boards").await.unwrap().unwrap();
    assert_eq!(stored.last_sync_timestamp, noon());
    assert!(h.clock.now() > noon());
    assert_eq!(stored.mode_used, SyncMode::Incremental);
}

#[tokio::test]
async fn test_archived_board_refetched_incrementally() {
    let at = noon() - chrono::Duration::minutes(20);
    let fake = two_boards_of_items()
        .with_log("2", vec![log_entry("board", "archive_board", json!({}), at)])
        .archive_board("2");
    let h = harness(fake);
    h.store
        .put("boards", watermark_at(noon() - chrono::Duration::hours(1)))
        .await
        .unwrap();

    let summary = h.planner.run(ObjectType::Boards, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Committed, "{:?}", summary.error);
    assert_eq!(summary.mode_used, Some(SyncMode::Incremental));
    assert_eq!(summary.records_emitted, 1);
    assert_eq!(summary.ids_not_found, 0);

    let listings = h.fake.requests_matching("boards(limit");
    assert_eq!(listings[0]["state"], "all");
    let fetches = h.fake.requests_matching("boards(ids: $boardIds, limit");
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0]["boardIds"], json!(["2"]));
    assert_eq!(fetches[0]["state"], "all");

    let records = h.sink.records();
    assert_eq!(records[0].id, "2");
    assert_eq!(records[0].row["state"], "archived");
}

#[tokio::test]
async fn test_diff_deduplicates_before_fetch() {
    let at = noon() - chrono::Duration::minutes(30);
    let fake = two_boards_of_items().with_log(
        "1",
        vec![
            log_entry("pulse", "update_column_value", json!({"pulse_id": 5}), at),
            log_entry("pulse", "update_column_value", json!({"pulse_id": 5}), at),
            log_entry("pulse", "create_pulse", json!({"pulse_id": 7}), at),
        ],
    );
    let h = harness(fake);
    h.store
        .put("items", watermark_at(noon() - chrono::Duration::hours(1)))
        .await
        .unwrap();

    let summary = h.planner.run(ObjectType::Items, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Committed, "{:?}", summary.error);
    assert_eq!(summary.mode_used, Some(SyncMode::Incremental));

    let fetches = h.fake.requests_matching("items(ids");
    assert_eq!(fetches.len(), 1);
    assert_eq!(fetches[0]["itemIds"], json!(["5", "7"]));

    let mut ids: Vec<String> = h.sink.records().into_iter().map(|r| r.id).collect();
    ids.sort();
    assert_eq!(ids, vec!["5", "7"]);
}

#[tokio::test]
async fn test_log_read_starts_at_watermark_minus_lookback() {
    let h = harness(two_boards_of_items());
    h.store
        .put(
            "items",
            watermark_at(chrono::Utc.with_ymd_and_hms(2024, 6, 3, 11, 0, 0).unwrap()),
        )
        .await
        .unwrap();

    h.planner.run(ObjectType::Items, &ObjectOptions::default()).await;

    let log_requests = h.fake.requests_matching("activity_logs(from");
    assert_eq!(log_requests.len(), 2);
    for vars in log_requests {
        assert_eq!(vars["from"], "2024-06-03T10:59:00Z");
    }
}

#[tokio::test]
async fn test_empty_diff_still_commits() {
    let h = harness(two_boards_of_items());
    h.store
        .put("items", watermark_at(noon() - chrono::Duration::hours(2)))
        .await
        .unwrap();

    let summary = h.planner.run(ObjectType::Items, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Committed);
    assert_eq!(summary.mode_used, Some(SyncMode::Incremental));
    assert_eq!(summary.records_emitted, 0);
    assert_eq!(summary.fallback_reason, None);

    let stored = h.store.get("items").await.unwrap().unwrap();
    assert_eq!(stored.last_sync_timestamp, noon());
    assert!(h.fake.requests_matching("items(ids").is_empty());
    assert_eq!(h.sink.flushes(), vec![ObjectType::Items]);
}

#[tokio::test]
async fn test_expired_history_falls_back_to_snapshot() {
    let h = harness(two_boards_of_items());
    h.store
        .put("items", watermark_at(noon() - chrono::Duration::days(10)))
        .await
        .unwrap();

    let summary = h.planner.run(ObjectType::Items, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Committed);
    assert_eq!(summary.mode_used, Some(SyncMode::FullSnapshot));
    assert_eq!(summary.fallback_reason.as_deref(), Some(RETENTION_EXCEEDED));
    assert_eq!(summary.records_emitted, 3);
    assert!(h.fake.requests_matching("activity_logs(from").is_empty());
}

#[tokio::test]
async fn test_users_always_snapshot() {
    let h = harness(FakeMonday::new().with_users(3));
    h.store
        .put("users", watermark_at(noon() - chrono::Duration::minutes(5)))
        .await
        .unwrap();

    let summary = h.planner.run(ObjectType::Users, &ObjectOptions::default()).await;
    assert_eq!(summary.mode_used, Some(SyncMode::FullSnapshot));
    assert_eq!(summary.records_emitted, 3);
    assert!(h.fake.requests_matching("activity_logs").is_empty());
}

#[tokio::test]
async fn test_failed_emit_keeps_watermark_and_replans_same_mode() {
    let at = noon() - chrono::Duration::minutes(30);
    let fake = two_boards_of_items().with_log(
        "2",
        vec![log_entry("pulse", "create_pulse", json!({"pulse_id": "7"}), at)],
    );
    let h = harness_with_sink(fake, MemorySink::failing_after(0));
    let previous = watermark_at(noon() - chrono::Duration::hours(1));
    h.store.put("items", previous.clone()).await.unwrap();

    let summary = h.planner.run(ObjectType::Items, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.mode_used, Some(SyncMode::Incremental));
    assert!(summary.error.as_deref().unwrap().starts_with("emit_failed"));
    assert_eq!(
        summary.phases,
        vec![
            RunPhase::HasWatermark,
            RunPhase::DiffAttempt,
            RunPhase::Incremental,
            RunPhase::Failed
        ]
    );
    assert_eq!(h.store.get("items").await.unwrap(), Some(previous.clone()));

    let boards = vec!["1".to_string(), "2".to_string()];
    for _ in 0..2 {
        let plan = h
            .planner
            .plan(ObjectType::Items, &boards, Some(&previous))
            .await
            .unwrap();
        assert_eq!(plan.mode, SyncMode::Incremental);
        assert_eq!(plan.target_ids, Some(vec!["7".to_string()]));
    }
}

#[tokio::test]
async fn test_fatal_error_fails_run_without_watermark() {
    let h = harness(FakeMonday::new().with_users(2));
    h.fake.script(HttpReply::with_status(401, r#"{"error_message": "Not Authenticated"}"#));

    let summary = h.planner.run(ObjectType::Users, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.as_deref().unwrap().starts_with("fatal_error"));
    assert!(h.store.get("users").await.unwrap().is_none());
    assert_eq!(h.fake.requests.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_waits_for_hint_then_succeeds() {
    let h = harness(FakeMonday::new().with_users(2));
    h.fake.script(HttpReply::ok(
        json!({"errors": [{"message": "Complexity budget exhausted", "extensions": {"code": "COMPLEXITY_BUDGET_EXHAUSTED", "retry_in_seconds": 30}}]})
            .to_string(),
    ));

    let start = tokio::time::Instant::now();
    let summary = h.planner.run(ObjectType::Users, &ObjectOptions::default()).await;

    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(summary.status, RunStatus::Committed);
    assert_eq!(summary.error, None);
    assert_eq!(summary.records_emitted, 2);
    assert_eq!(h.fake.requests.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_cursor_expiry_restarts_sequence_once() {
    let h = harness(
        FakeMonday::new()
            .with_boards(&["1"])
            .with_items(vec![item(1, "1"), item(2, "1"), item(3, "1")]),
    );
    h.fake.expire_cursors.store(1, Ordering::SeqCst);
    let options = ObjectOptions {
        page_size: Some(2),
        ..Default::default()
    };

    let summary = h.planner.run(ObjectType::Items, &options).await;
    assert_eq!(summary.status, RunStatus::Committed, "{:?}", summary.error);
    // The first page is emitted again by the restarted sequence
    assert_eq!(summary.records_emitted, 5);

    let mut ids: Vec<String> = h.sink.records().into_iter().map(|r| r.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids, vec!["1", "2", "3"]);
}

#[tokio::test]
async fn test_second_cursor_expiry_fails_run() {
    let h = harness(
        FakeMonday::new()
            .with_boards(&["1"])
            .with_items(vec![item(1, "1"), item(2, "1"), item(3, "1")]),
    );
    h.fake.expire_cursors.store(2, Ordering::SeqCst);
    let options = ObjectOptions {
        page_size: Some(2),
        ..Default::default()
    };

    let summary = h.planner.run(ObjectType::Items, &options).await;
    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.error.as_deref().unwrap().starts_with("cursor_expired"));
    assert!(h.store.get("items").await.unwrap().is_none());
}

#[tokio::test]
async fn test_deleted_items_counted_as_not_found() {
    let at = noon() - chrono::Duration::minutes(30);
    let fake = two_boards_of_items().with_log(
        "1",
        vec![
            log_entry("pulse", "update_name", json!({"pulse_id": 5}), at),
            log_entry("pulse", "delete_pulse", json!({"pulse_id": 99}), at),
        ],
    );
    let h = harness(fake);
    h.store
        .put("items", watermark_at(noon() - chrono::Duration::hours(1)))
        .await
        .unwrap();

    let summary = h.planner.run(ObjectType::Items, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Committed);
    assert_eq!(summary.records_emitted, 1);
    assert_eq!(summary.ids_not_found, 1);
}

#[tokio::test]
async fn test_daemon_cycle_runs_each_object_once() {
    let h = harness(FakeMonday::new().with_users(2).with_boards(&["1"]));
    let daemon = SyncDaemon::new(
        h.planner.clone(),
        Arc::new(Config::default()),
        DaemonConfig {
            objects: vec![ObjectType::Users, ObjectType::Teams, ObjectType::Boards],
            sync_interval: Duration::from_secs(60),
        },
    );

    let stats = daemon.run_cycle().await;
    assert!(stats.is_success());
    assert_eq!(stats.runs.len(), 3);
    assert_eq!(stats.records_emitted(), 2 + 1 + 1);
    assert!(!daemon.in_flight().is_held("users"));

    let keys: Vec<String> = h
        .store
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec!["boards", "teams", "users"]);
}

#[tokio::test]
async fn test_daemon_skips_key_already_in_flight() {
    let h = harness(FakeMonday::new().with_users(1));
    let daemon = SyncDaemon::new(
        h.planner.clone(),
        Arc::new(Config::default()),
        DaemonConfig {
            objects: vec![ObjectType::Users],
            sync_interval: Duration::from_secs(60),
        },
    );

    let _held = daemon.in_flight().try_acquire("users").unwrap();
    let stats = daemon.run_cycle().await;
    assert!(stats.runs.is_empty());
    assert_eq!(stats.skipped, vec!["users".to_string()]);
    assert!(h.fake.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_records_without_id_are_skipped() {
    let fake = FakeMonday::new();
    *fake.users.lock().unwrap() = vec![
        json!({"id": "1", "name": "Ada"}),
        json!({"id": "not-a-number", "name": "Ghost"}),
        json!({"name": "Nobody"}),
    ];
    let h = harness(fake);

    let summary = h.planner.run(ObjectType::Users, &ObjectOptions::default()).await;
    assert_eq!(summary.status, RunStatus::Committed, "{:?}", summary.error);
    assert_eq!(summary.records_emitted, 1);
    assert_eq!(summary.records_skipped, 2);

    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "1");
    assert!(summary.to_string().contains("2 without id skipped"));
}

#[tokio::test]
async fn test_shutdown_between_pages_commits_nothing() {
    let fake = FakeMonday::new().with_users(5);
    // Page 1 answers, page 2 never does
    fake.stall_at.store(2, Ordering::SeqCst);
    let h = harness(fake);
    let previous = watermark_at(noon() - chrono::Duration::hours(1));
    h.store.put("users", previous.clone()).await.unwrap();

    let mut config = Config::default();
    config.options_mut(ObjectType::Users).page_size = Some(2);
    let daemon = SyncDaemon::new(
        h.planner.clone(),
        Arc::new(config),
        DaemonConfig {
            objects: vec![ObjectType::Users],
            sync_interval: Duration::from_secs(60),
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let fake = h.fake.clone();
    let signal = tokio::spawn(async move {
        fake.stalled.notified().await;
        let _ = shutdown_tx.send(());
    });

    let outcome = daemon.run_once(shutdown_rx).await;
    signal.await.unwrap();

    assert!(outcome.is_none());
    assert_eq!(h.sink.records().len(), 2);
    assert!(h.sink.flushes().is_empty());
    assert_eq!(h.store.get("users").await.unwrap(), Some(previous));
    assert!(!daemon.in_flight().is_held("users"));
}
