//! Coordinator tests: lease, schedule, history and notifications.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use helios_reindexing::{
    ActionState, ConcurrentReindex, Coordinator, CoordinatorOutcome, ExclusiveLease,
    MemoryHistory, MemoryLease, REINDEX_LEASE_KEY, ReindexError, ReindexHistory,
    ReindexingConfig, ScheduleConfig,
};

const INDEX: &str = "index_users_on_email";

struct Fixture {
    catalog: Arc<FakeCatalog>,
    lease: Arc<MemoryLease>,
    history: Arc<MemoryHistory>,
    notifier: Arc<RecordingNotifier>,
    coordinator: Coordinator,
}

fn fixture(config: ReindexingConfig) -> Fixture {
    let catalog = FakeCatalog::with_indexes(vec![index(16384, INDEX)]);
    let lease = Arc::new(MemoryLease::new());
    let history = Arc::new(MemoryHistory::new());
    let notifier = RecordingNotifier::new();
    let strategy = Arc::new(
        ConcurrentReindex::new(catalog.clone(), &config)
            .with_lock_retries(quick_swap_retries(), quick_removal_retries()),
    );
    let coordinator = Coordinator::new(
        catalog.clone(),
        strategy,
        lease.clone(),
        history.clone(),
        notifier.clone(),
        &config,
    )
    .with_removal_retries(quick_removal_retries());

    Fixture {
        catalog,
        lease,
        history,
        notifier,
        coordinator,
    }
}

// ============================================================================
// Perform Tests
// ============================================================================

/// Test that a rebuild is recorded, announced and releases the lease
#[tokio::test]
async fn test_perform_records_finished_action() {
    let f = fixture(test_config());

    let outcome = f.coordinator.perform(&index(16384, INDEX)).await.unwrap();

    let CoordinatorOutcome::Performed(action) = outcome else {
        panic!("expected a rebuild, got {outcome:?}");
    };
    assert_eq!(action.state, ActionState::Finished);
    assert_eq!(action.index_identifier, "public.index_users_on_email");
    assert_eq!(action.ondisk_size_bytes_start, 4 * GIB);
    assert_eq!(action.ondisk_size_bytes_end, Some(GIB));
    assert_eq!(action.bloat_estimate_bytes_start, Some(GIB));
    assert!(action.action_end.is_some());

    assert_eq!(f.history.all(), vec![action]);
    assert!(!f.lease.is_held(REINDEX_LEASE_KEY));
    assert_eq!(
        f.notifier.received(),
        vec![
            Notification {
                event: "start",
                index: "public.index_users_on_email".to_string(),
                state: ActionState::Started,
            },
            Notification {
                event: "end",
                index: "public.index_users_on_email".to_string(),
                state: ActionState::Finished,
            },
        ]
    );
}

/// Test that a failed rebuild is still finalized and the lease released
#[tokio::test]
async fn test_perform_failure_finalizes_action() {
    let f = fixture(test_config());
    f.catalog.leave_invalid_builds();

    let err = f.coordinator.perform(&index(16384, INDEX)).await.unwrap_err();

    assert!(matches!(err, ReindexError::ReplacementInvalid { .. }));
    let actions = f.history.all();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].state, ActionState::Failed);
    assert!(actions[0].action_end.is_some());
    assert_eq!(actions[0].ondisk_size_bytes_end, Some(4 * GIB));
    assert!(!f.lease.is_held(REINDEX_LEASE_KEY));
    assert_eq!(f.notifier.received()[1].state, ActionState::Failed);
}

/// Test that nothing happens while another process holds the lease
#[tokio::test]
async fn test_perform_skips_when_lease_taken() {
    let f = fixture(test_config());
    let held = f
        .lease
        .try_obtain(REINDEX_LEASE_KEY, Duration::from_secs(3600))
        .await
        .unwrap();
    assert!(held.is_some());

    let outcome = f.coordinator.perform(&index(16384, INDEX)).await.unwrap();

    assert_eq!(outcome, CoordinatorOutcome::LeaseTaken);
    assert_eq!(f.catalog.connections(), 0);
    assert!(f.history.all().is_empty());
    assert!(f.notifier.received().is_empty());
    assert!(f.lease.is_held(REINDEX_LEASE_KEY));
}

/// Test that nothing happens outside the scheduled days
#[tokio::test]
async fn test_perform_skips_outside_schedule() {
    let f = fixture(ReindexingConfig {
        schedule: ScheduleConfig { days: Vec::new() },
        ..Default::default()
    });

    let outcome = f.coordinator.perform(&index(16384, INDEX)).await.unwrap();

    assert_eq!(outcome, CoordinatorOutcome::OutsideSchedule);
    assert_eq!(f.catalog.connections(), 0);
    assert!(!f.lease.is_held(REINDEX_LEASE_KEY));
}

/// Test that an unreachable history stops the rebuild before it starts
#[tokio::test]
async fn test_perform_aborts_when_history_unavailable() {
    let config = test_config();
    let catalog = FakeCatalog::with_indexes(vec![index(16384, INDEX)]);
    let lease = Arc::new(MemoryLease::new());
    let strategy = Arc::new(ConcurrentReindex::new(catalog.clone(), &config));
    let coordinator = Coordinator::new(
        catalog.clone(),
        strategy,
        lease.clone(),
        Arc::new(FailingHistory),
        RecordingNotifier::new(),
        &config,
    );

    let err = coordinator.perform(&index(16384, INDEX)).await.unwrap_err();

    assert!(matches!(err, ReindexError::History { .. }));
    assert_eq!(catalog.connections(), 0);
    assert!(!lease.is_held(REINDEX_LEASE_KEY));
}

/// Test that the history keeps one row per attempt
#[tokio::test]
async fn test_perform_history_per_attempt() {
    let f = fixture(test_config());

    f.coordinator.perform(&index(16384, INDEX)).await.unwrap();
    let current = f.catalog.get(INDEX).unwrap();
    f.coordinator.perform(&current).await.unwrap();

    let now = chrono::Utc::now();
    let actions = f
        .history
        .actions_for(
            "public.index_users_on_email",
            now - chrono::Duration::hours(1),
            now + chrono::Duration::seconds(1),
        )
        .await
        .unwrap();
    assert_eq!(actions.len(), 2);
    assert!(actions.iter().all(|a| a.state == ActionState::Finished));
}

// ============================================================================
// Drop Tests
// ============================================================================

/// Test that a leftover is dropped under the lease
#[tokio::test]
async fn test_drop_removes_index() {
    let f = fixture(test_config());
    let leftover = index(16390, "index_users_on_email_ccnew");
    f.catalog.add(leftover.clone());

    let outcome = f.coordinator.drop(&leftover).await.unwrap();

    assert_eq!(outcome, CoordinatorOutcome::Dropped);
    assert_eq!(f.catalog.names(), vec![INDEX]);
    assert!(!f.lease.is_held(REINDEX_LEASE_KEY));
    assert!(f.history.all().is_empty());
}

/// Test that a drop is skipped while the lease is held elsewhere
#[tokio::test]
async fn test_drop_skips_when_lease_taken() {
    let f = fixture(test_config());
    let leftover = index(16390, "index_users_on_email_ccnew");
    f.catalog.add(leftover.clone());
    f.lease
        .try_obtain(REINDEX_LEASE_KEY, Duration::from_secs(3600))
        .await
        .unwrap();

    let outcome = f.coordinator.drop(&leftover).await.unwrap();

    assert_eq!(outcome, CoordinatorOutcome::LeaseTaken);
    assert_eq!(f.catalog.names(), vec![INDEX, "index_users_on_email_ccnew"]);
}

/// Test that drops ignore the schedule
#[tokio::test]
async fn test_drop_runs_outside_schedule() {
    let f = fixture(ReindexingConfig {
        schedule: ScheduleConfig { days: Vec::new() },
        ..Default::default()
    });
    let leftover = index(16390, "index_users_on_email_ccnew");
    f.catalog.add(leftover.clone());

    let outcome = f.coordinator.drop(&leftover).await.unwrap();

    assert_eq!(outcome, CoordinatorOutcome::Dropped);
    assert_eq!(f.catalog.names(), vec![INDEX]);
}
