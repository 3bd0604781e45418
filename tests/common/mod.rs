// Shared harness for supervisor integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tenantd::clock::ManualClock;
use tenantd::config::Config;
use tenantd::notify::{ChannelNotifier, Notice};
use tenantd::process::{OwnerId, Supervisor, TenantId};
use tenantd::store::{JsonStore, TenantRecord, TenantStore};
use tokio::sync::mpsc::UnboundedReceiver;

pub const OWNER: OwnerId = OwnerId(7);
pub const START: i64 = 1_700_000_000;

pub struct TestEnv {
    pub supervisor: Arc<Supervisor>,
    pub store: Arc<JsonStore>,
    pub clock: ManualClock,
    pub notices: UnboundedReceiver<(OwnerId, Notice)>,
    pub dir: TempDir,
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.supervisor.poll_interval_secs = 3600;
    config.supervisor.stop_timeout_secs = 2;
    config.supervisor.restart_delay_secs = 0;
    config.restart.backoff_secs = 0;
    config.runtime.tenants_dir = dir.to_path_buf();
    config.runtime.interpreter = Some(PathBuf::from("/bin/sh"));
    config
}

pub fn setup(configure: impl FnOnce(&mut Config)) -> TestEnv {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonStore::in_memory());
    setup_with_store(dir, store, configure)
}

pub fn setup_with_store(
    dir: TempDir,
    store: Arc<JsonStore>,
    configure: impl FnOnce(&mut Config),
) -> TestEnv {
    let mut config = test_config(dir.path());
    configure(&mut config);

    let clock = ManualClock::new(START);
    let (notifier, notices) = ChannelNotifier::new();
    let supervisor = Supervisor::with_clock(
        config,
        store.clone(),
        Arc::new(notifier),
        Arc::new(clock.clone()),
    );

    TestEnv {
        supervisor,
        store,
        clock,
        notices,
        dir,
    }
}

impl TestEnv {
    pub async fn add_tenant(&self, id: u64, script: &str, quota: u64) -> TenantId {
        let tenant = TenantId::new(id);
        let workdir = format!("tenant-{}", id);
        let path = self.dir.path().join(&workdir);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("main.sh"), script).unwrap();

        let record = TenantRecord::new(
            tenant,
            OWNER,
            format!("bot-{}", id),
            workdir,
            "main.sh",
            quota,
        );
        self.store.put_tenant(record).await.unwrap();
        tenant
    }

    pub async fn record(&self, id: TenantId) -> TenantRecord {
        self.store.get_tenant(id).await.unwrap().unwrap()
    }

    pub async fn wait_for_exit(&self, id: TenantId) {
        for _ in 0..50 {
            if !self.supervisor.is_running(id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("tenant {} did not exit", id);
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok((owner, notice)) = self.notices.try_recv() {
            assert_eq!(owner, OWNER);
            notices.push(notice);
        }
        notices
    }

    pub fn stdout_log(&self, id: TenantId) -> String {
        let path = self
            .dir
            .path()
            .join(format!("tenant-{}", id))
            .join("logs")
            .join("stdout.log");
        fs::read_to_string(path).unwrap_or_default()
    }
}
