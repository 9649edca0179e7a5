//! Backend-agnostic behavior checks shared by every `ExecutionStore` test module.

use chrono::{Duration, Utc};
use std::future::Future;
use std::sync::Arc;

use crate::execution_store::mutation;
use crate::{ExecutionRecord, ExecutionStatus, ExecutionStore, StateStoreError};

fn pending(id: &str) -> ExecutionRecord {
    ExecutionRecord::new(id.to_string(), "InventoryService", "reserve")
        .with_arguments(r#"[{"sku":"A-1","qty":2}]"#.to_string())
}

/// Runs every check against a fresh store from `factory`.
pub(crate) async fn run_all<S, F, Fut>(factory: F)
where
    S: ExecutionStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    save_and_find(&factory().await).await;
    find_unknown_is_not_found(&factory().await).await;
    save_is_upsert(&factory().await).await;
    full_lifecycle(&factory().await).await;
    stale_state_leaves_record_untouched(&factory().await).await;
    illegal_edges_rejected(&factory().await).await;
    unknown_id_transition_not_found(&factory().await).await;
    terminal_is_final(&factory().await).await;
    list_and_count(&factory().await).await;
    retention_only_removes_old_terminal(&factory().await).await;
}

async fn save_and_find<S: ExecutionStore>(store: &S) {
    let mut record = pending("exec-save");
    record.metadata.insert("tenant".to_string(), "acme".to_string());
    store.save(&record).await.unwrap();

    let found = store.find_by_id("exec-save").await.unwrap();
    assert_eq!(found.execution_id, "exec-save");
    assert_eq!(found.status, ExecutionStatus::Pending);
    assert_eq!(found.arguments_encoded, record.arguments_encoded);
    assert_eq!(found.metadata.get("tenant").map(String::as_str), Some("acme"));
    assert_eq!(
        found.create_time.timestamp_micros(),
        record.create_time.timestamp_micros()
    );
    assert!(found.finish_time.is_none());
}

async fn find_unknown_is_not_found<S: ExecutionStore>(store: &S) {
    let err = store.find_by_id("nonexistent-id").await.unwrap_err();
    assert!(matches!(err, StateStoreError::NotFound(ref id) if id == "nonexistent-id"));
}

async fn save_is_upsert<S: ExecutionStore>(store: &S) {
    let record = pending("exec-upsert");
    store.save(&record).await.unwrap();
    store.save(&record).await.unwrap();

    let mut tagged = record.clone();
    tagged.metadata.insert("retry".to_string(), "1".to_string());
    store.save(&tagged).await.unwrap();

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.total, 1);
    let found = store.find_by_id("exec-upsert").await.unwrap();
    assert_eq!(found.metadata.get("retry").map(String::as_str), Some("1"));
}

async fn full_lifecycle<S: ExecutionStore>(store: &S) {
    store.save(&pending("exec-life")).await.unwrap();

    let running = store
        .compare_and_transition(
            "exec-life",
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            mutation::none(),
        )
        .await
        .unwrap();
    assert_eq!(running.status, ExecutionStatus::Running);
    assert!(running.start_time.is_some());
    assert!(running.finish_time.is_none());

    let done = store
        .compare_and_transition(
            "exec-life",
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            Box::new(|r| r.result_encoded = Some("\"OK\"".to_string())),
        )
        .await
        .unwrap();
    assert_eq!(done.status, ExecutionStatus::Success);

    let found = store.find_by_id("exec-life").await.unwrap();
    assert_eq!(found.status, ExecutionStatus::Success);
    assert_eq!(found.result_encoded.as_deref(), Some("\"OK\""));
    let start = found.start_time.unwrap();
    let finish = found.finish_time.unwrap();
    assert!(found.create_time <= start);
    assert!(start <= finish);
}

async fn stale_state_leaves_record_untouched<S: ExecutionStore>(store: &S) {
    store.save(&pending("exec-stale")).await.unwrap();

    let err = store
        .compare_and_transition(
            "exec-stale",
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            Box::new(|r| r.result_encoded = Some("\"late\"".to_string())),
        )
        .await
        .unwrap_err();
    match err {
        StateStoreError::StaleState { id, expected, actual } => {
            assert_eq!(id, "exec-stale");
            assert_eq!(expected, ExecutionStatus::Running);
            assert_eq!(actual, ExecutionStatus::Pending);
        }
        other => panic!("expected StaleState, got {other:?}"),
    }

    let found = store.find_by_id("exec-stale").await.unwrap();
    assert_eq!(found.status, ExecutionStatus::Pending);
    assert!(found.result_encoded.is_none());
}

async fn illegal_edges_rejected<S: ExecutionStore>(store: &S) {
    store.save(&pending("exec-illegal")).await.unwrap();

    let err = store
        .compare_and_transition(
            "exec-illegal",
            ExecutionStatus::Pending,
            ExecutionStatus::Success,
            mutation::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StateStoreError::IllegalTransition { .. }));

    let err = store
        .compare_and_transition(
            "exec-illegal",
            ExecutionStatus::Success,
            ExecutionStatus::Running,
            mutation::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StateStoreError::IllegalTransition { .. }));

    let found = store.find_by_id("exec-illegal").await.unwrap();
    assert_eq!(found.status, ExecutionStatus::Pending);
}

async fn unknown_id_transition_not_found<S: ExecutionStore>(store: &S) {
    let err = store
        .compare_and_transition(
            "ghost",
            ExecutionStatus::Pending,
            ExecutionStatus::Cancelled,
            mutation::none(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StateStoreError::NotFound(_)));
}

async fn terminal_is_final<S: ExecutionStore>(store: &S) {
    store.save(&pending("exec-final")).await.unwrap();
    store
        .compare_and_transition(
            "exec-final",
            ExecutionStatus::Pending,
            ExecutionStatus::Cancelled,
            mutation::none(),
        )
        .await
        .unwrap();

    for (expected, next) in [
        (ExecutionStatus::Pending, ExecutionStatus::Running),
        (ExecutionStatus::Pending, ExecutionStatus::Cancelled),
        (ExecutionStatus::Running, ExecutionStatus::Success),
        (ExecutionStatus::Running, ExecutionStatus::Failed),
        (ExecutionStatus::Running, ExecutionStatus::Timeout),
    ] {
        let err = store
            .compare_and_transition("exec-final", expected, next, mutation::none())
            .await
            .unwrap_err();
        assert!(
            matches!(err, StateStoreError::StaleState { actual: ExecutionStatus::Cancelled, .. }),
            "{expected} -> {next}: {err:?}"
        );
    }

    let found = store.find_by_id("exec-final").await.unwrap();
    assert_eq!(found.status, ExecutionStatus::Cancelled);
    assert!(found.finish_time.is_some());
    assert!(found.start_time.is_none());
}

async fn list_and_count<S: ExecutionStore>(store: &S) {
    for i in 0..4 {
        let mut record = pending(&format!("exec-list-{i}"));
        record.create_time = Utc::now() - Duration::seconds(10 - i);
        store.save(&record).await.unwrap();
    }
    store
        .compare_and_transition(
            "exec-list-0",
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            mutation::none(),
        )
        .await
        .unwrap();

    let pending_records = store
        .list_by_status(ExecutionStatus::Pending, 0)
        .await
        .unwrap();
    let ids: Vec<_> = pending_records.iter().map(|r| r.execution_id.as_str()).collect();
    assert_eq!(ids, vec!["exec-list-1", "exec-list-2", "exec-list-3"]);

    let limited = store
        .list_by_status(ExecutionStatus::Pending, 2)
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].execution_id, "exec-list-1");

    let counts = store.count_by_status().await.unwrap();
    assert_eq!(counts.total, 4);
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.running, 1);
}

async fn retention_only_removes_old_terminal<S: ExecutionStore>(store: &S) {
    let now = Utc::now();

    let mut old_done = pending("exec-old-done");
    old_done.status = ExecutionStatus::Success;
    old_done.create_time = now - Duration::days(10);
    old_done.start_time = Some(now - Duration::days(10));
    old_done.finish_time = Some(now - Duration::days(9));
    store.save(&old_done).await.unwrap();

    let mut recent_done = pending("exec-recent-done");
    recent_done.status = ExecutionStatus::Failed;
    recent_done.create_time = now - Duration::hours(2);
    recent_done.start_time = Some(now - Duration::hours(1));
    recent_done.finish_time = Some(now - Duration::minutes(30));
    store.save(&recent_done).await.unwrap();

    let mut old_pending = pending("exec-old-pending");
    old_pending.create_time = now - Duration::days(30);
    store.save(&old_pending).await.unwrap();

    let deleted = store
        .delete_finished_before(now - Duration::days(7))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert!(matches!(
        store.find_by_id("exec-old-done").await,
        Err(StateStoreError::NotFound(_))
    ));
    assert!(store.find_by_id("exec-recent-done").await.is_ok());
    assert!(store.find_by_id("exec-old-pending").await.is_ok());
}

/// Many cancel/start pairs racing on the same records: exactly one side wins each.
pub(crate) async fn concurrent_cancel_vs_start<S: ExecutionStore + 'static>(store: Arc<S>) {
    const N: usize = 50;

    for i in 0..N {
        store.save(&pending(&format!("exec-race-{i}"))).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..N {
        let id = format!("exec-race-{i}");
        let canceller = store.clone();
        let cancel_id = id.clone();
        let cancel = tokio::spawn(async move {
            canceller
                .compare_and_transition(
                    &cancel_id,
                    ExecutionStatus::Pending,
                    ExecutionStatus::Cancelled,
                    mutation::none(),
                )
                .await
                .is_ok()
        });
        let starter = store.clone();
        let start = tokio::spawn(async move {
            starter
                .compare_and_transition(
                    &id,
                    ExecutionStatus::Pending,
                    ExecutionStatus::Running,
                    mutation::none(),
                )
                .await
                .is_ok()
        });
        handles.push((i, cancel, start));
    }

    for (i, cancel, start) in handles {
        let cancelled = cancel.await.unwrap();
        let started = start.await.unwrap();
        assert!(cancelled ^ started, "exec-race-{i}: cancelled={cancelled} started={started}");

        let record = store.find_by_id(&format!("exec-race-{i}")).await.unwrap();
        if cancelled {
            assert_eq!(record.status, ExecutionStatus::Cancelled);
        } else {
            assert_eq!(record.status, ExecutionStatus::Running);
        }
    }
}
