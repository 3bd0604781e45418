// Integration tests for crash handling and the restart bound

mod common;

use common::setup;
use tenantd::notify::Notice;
use tenantd::process::{TickOutcome, SLEEP_RESTART_LIMIT};
use tenantd::store::{EventLevel, TenantStatus, TenantStore, UsageUpdate};

#[tokio::test]
async fn test_double_crash_with_two_restarts_allowed() {
    let mut env = setup(|config| config.restart.max_restarts = 2);
    let id = env.add_tenant(1, "exit 1", 3600).await;
    env.supervisor.start_tenant(id).await.unwrap();

    env.wait_for_exit(id).await;
    assert_eq!(env.supervisor.tick(id).await.unwrap(), TickOutcome::Restarted);
    let record = env.record(id).await;
    assert_eq!(record.restart_count, 1);
    assert_eq!(record.remaining_quota_seconds, 3300);

    env.wait_for_exit(id).await;
    assert_eq!(env.supervisor.tick(id).await.unwrap(), TickOutcome::Restarted);
    let record = env.record(id).await;
    assert_eq!(record.restart_count, 2);
    assert_eq!(record.remaining_quota_seconds, 3000);

    env.wait_for_exit(id).await;
    assert_eq!(env.supervisor.tick(id).await.unwrap(), TickOutcome::GaveUp);

    let record = env.record(id).await;
    assert_eq!(record.status, TenantStatus::Sleeping);
    assert_eq!(record.sleep_reason.as_deref(), Some(SLEEP_RESTART_LIMIT));
    assert_eq!(record.restart_count, 2);
    assert_eq!(record.total_restarts, 2);
    assert_eq!(record.remaining_quota_seconds, 3000);
    assert_eq!(record.pid, None);

    // No further spawn attempts
    assert!(env.supervisor.list_running().await.is_empty());
    assert_eq!(env.supervisor.tick(id).await.unwrap(), TickOutcome::Cancelled);
    assert_eq!(env.stdout_log(id).matches("--- started").count(), 3);

    let notices = env.drain_notices();
    assert!(matches!(
        notices.as_slice(),
        [
            Notice::Restarted {
                restart_count: 1,
                max_restarts: 2,
                ..
            },
            Notice::Restarted {
                restart_count: 2,
                max_restarts: 2,
                ..
            },
            Notice::RestartLimitExceeded { .. },
        ]
    ));

    let events = env.store.recent_events(id, 1).await.unwrap();
    assert_eq!(events[0].level, EventLevel::Critical);
}

#[tokio::test]
async fn test_wake_after_restart_limit_resets_counter() {
    let env = setup(|config| config.restart.max_restarts = 0);
    let id = env.add_tenant(1, "exit 1", 3600).await;
    env.supervisor.start_tenant(id).await.unwrap();

    env.wait_for_exit(id).await;
    assert_eq!(env.supervisor.tick(id).await.unwrap(), TickOutcome::GaveUp);
    assert_eq!(env.record(id).await.status, TenantStatus::Sleeping);

    // Replace the crashing entry point before waking
    std::fs::write(env.dir.path().join("tenant-1/main.sh"), "sleep 30").unwrap();
    let pid = env.supervisor.wake_tenant(id).await.unwrap();

    let record = env.record(id).await;
    assert_eq!(record.status, TenantStatus::Running);
    assert_eq!(record.pid, Some(pid));
    assert_eq!(record.restart_count, 0);
    assert_eq!(record.sleep_reason, None);

    env.supervisor.stop_all().await;
    assert_eq!(env.record(id).await.status, TenantStatus::Stopped);
}

#[tokio::test]
async fn test_explicit_restart_resets_counter() {
    let env = setup(|_| {});
    let id = env.add_tenant(1, "sleep 30", 3600).await;
    let first = env.supervisor.start_tenant(id).await.unwrap();

    env.store
        .update_usage(
            id,
            UsageUpdate {
                restart_count: Some(3),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let second = env.supervisor.restart_tenant(id).await.unwrap();
    assert_ne!(first, second);

    let record = env.record(id).await;
    assert_eq!(record.status, TenantStatus::Running);
    assert_eq!(record.pid, Some(second));
    assert_eq!(record.restart_count, 0);
    assert_eq!(env.supervisor.list_running().await, vec![id]);

    env.supervisor.stop_all().await;
}

#[tokio::test]
async fn test_monitor_task_restarts_on_its_own() {
    let mut env = setup(|config| {
        config.supervisor.poll_interval_secs = 1;
        config.restart.max_restarts = 1;
    });
    let id = env.add_tenant(1, "exit 1", 3600).await;
    env.supervisor.start_tenant(id).await.unwrap();

    // One automatic restart, then the limit puts the tenant to sleep
    for _ in 0..100 {
        if env.record(id).await.status == TenantStatus::Sleeping {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    let record = env.record(id).await;
    assert_eq!(record.status, TenantStatus::Sleeping);
    assert_eq!(record.total_restarts, 1);
    assert!(matches!(
        env.drain_notices().as_slice(),
        [Notice::Restarted { .. }, Notice::RestartLimitExceeded { .. }]
    ));
}
