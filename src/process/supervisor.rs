use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Result, TenantError};
use crate::logs::TenantLogs;
use crate::notify::{Notice, Notifier};
use crate::process::monitor::ResourceSample;
use crate::process::quota::QuotaAccountant;
use crate::process::restart::{RestartDecision, RestartPolicy};
use crate::process::spawner::{self, LaunchSpec};
use crate::process::types::{RuntimeHandle, StartCause, TenantId, TickOutcome};
use crate::process::OwnerId;
use crate::store::{EventLevel, TenantRecord, TenantStatus, TenantStore, UsageUpdate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod recovery;


/// Sleep reason written when the quota runs out
pub const SLEEP_QUOTA_EXHAUSTED: &str = "quota exhausted";

/// Sleep reason written when a tenant keeps crashing
pub const SLEEP_RESTART_LIMIT: &str = "restart limit exceeded";

/// Runs tenant children, accounts their quota and restarts them on crashes.
///
/// Control operations on one tenant are serialized by a per-tenant lock; a
/// monitoring task per running tenant takes the same lock for its transitions.
/// Live children exist only in memory; everything else goes through the store.
pub struct Supervisor {
    config: Config,
    store: Arc<dyn TenantStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    accountant: QuotaAccountant,
    policy: RestartPolicy,
    runtimes: Mutex<HashMap<TenantId, RuntimeHandle>>,
    /// Tenants waiting out the backoff before an automatic restart
    restarting: Mutex<HashMap<TenantId, CancellationToken>>,
    locks: Mutex<HashMap<TenantId, Arc<Mutex<()>>>>,
    next_run: AtomicU64,
}

impl Supervisor {
    /// Create a supervisor using the system clock
    pub fn new(
        config: Config,
        store: Arc<dyn TenantStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Self::with_clock(config, store, notifier, Arc::new(SystemClock))
    }

    /// Create a supervisor with an explicit clock
    pub fn with_clock(
        config: Config,
        store: Arc<dyn TenantStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let accountant = QuotaAccountant::new(&config.quota);
        let policy = RestartPolicy::from_settings(&config.restart);

        Arc::new(Self {
            config,
            store,
            notifier,
            clock,
            accountant,
            policy,
            runtimes: Mutex::new(HashMap::new()),
            restarting: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(1),
        })
    }

    async fn tenant_lock(&self, id: TenantId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(id).or_default())
    }

    /// Drop the lock entry of an id the store does not know, unless someone holds it
    async fn forget_lock(&self, id: TenantId) {
        let mut locks = self.locks.lock().await;
        if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&id);
        }
    }

    async fn forget_if_unknown<T: Sync>(&self, id: TenantId, result: &Result<T>) {
        if matches!(result, Err(TenantError::TenantNotFound(_))) {
            self.forget_lock(id).await;
        }
    }

    /// Start a stopped tenant
    ///
    /// # Arguments
    /// * `id` - Tenant to start
    ///
    /// # Returns
    /// * `Ok(pid)` - The child is running and being monitored
    /// * `Err(TenantError)` - Refused or failed; refusals leave the record untouched
    pub async fn start_tenant(self: &Arc<Self>, id: TenantId) -> Result<u32> {
        let result = {
            let lock = self.tenant_lock(id).await;
            let _guard = lock.lock().await;
            self.start_locked(id, StartCause::Explicit).await
        };
        self.forget_if_unknown(id, &result).await;
        result
    }

    /// Stop a tenant. Stopping a tenant that is not running is a no-op.
    pub async fn stop_tenant(self: &Arc<Self>, id: TenantId) {
        let known = {
            let lock = self.tenant_lock(id).await;
            let _guard = lock.lock().await;
            self.stop_locked(id).await
        };
        if !known {
            self.forget_lock(id).await;
        }
    }

    /// Stop, wait for the configured delay, then start again
    pub async fn restart_tenant(self: &Arc<Self>, id: TenantId) -> Result<u32> {
        let result = {
            let lock = self.tenant_lock(id).await;
            let _guard = lock.lock().await;

            info!(tenant = %id, "Restarting tenant");
            self.stop_locked(id).await;
            tokio::time::sleep(self.config.supervisor.restart_delay()).await;
            self.start_locked(id, StartCause::Explicit).await
        };
        self.forget_if_unknown(id, &result).await;
        result
    }

    /// Leave the sleeping state and start the tenant
    pub async fn wake_tenant(self: &Arc<Self>, id: TenantId) -> Result<u32> {
        let result = {
            let lock = self.tenant_lock(id).await;
            let _guard = lock.lock().await;
            self.wake_locked(id).await
        };
        self.forget_if_unknown(id, &result).await;
        result
    }

    async fn wake_locked(self: &Arc<Self>, id: TenantId) -> Result<u32> {
        let record = self
            .store
            .get_tenant(id)
            .await?
            .ok_or(TenantError::TenantNotFound(id))?;

        if record.is_sleeping() {
            self.store.clear_sleep(id).await?;
            info!(tenant = %id, "Woke sleeping tenant");
            self.event(id, EventLevel::Info, "Woken from sleep").await;
        }

        self.start_locked(id, StartCause::Explicit).await
    }

    /// Whether a live child exists for the tenant
    pub async fn is_running(&self, id: TenantId) -> bool {
        let mut runtimes = self.runtimes.lock().await;
        match runtimes.get_mut(&id) {
            Some(handle) => handle.exit_status().is_none(),
            None => false,
        }
    }

    /// Whether the tenant is waiting out the backoff before an automatic restart
    pub async fn is_restarting(&self, id: TenantId) -> bool {
        self.restarting.lock().await.contains_key(&id)
    }

    /// Tenants with a runtime handle, in id order
    pub async fn list_running(&self) -> Vec<TenantId> {
        let mut ids: Vec<TenantId> = self.runtimes.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stop every supervised tenant
    pub async fn stop_all(self: &Arc<Self>) {
        let mut ids = self.list_running().await;
        ids.extend(self.restarting.lock().await.keys().copied());
        ids.sort();
        ids.dedup();

        info!("Stopping {} tenant(s)", ids.len());
        for id in ids {
            self.stop_tenant(id).await;
        }
    }

    /// Bring back tenants that were running before a shutdown, plus those
    /// marked for auto-start. Returns the tenants started.
    pub async fn restore(self: &Arc<Self>) -> Result<Vec<TenantId>> {
        let records = self.store.list_tenants().await?;
        let mut started = Vec::new();

        for record in records {
            let wanted = record.status == TenantStatus::Running
                || (record.auto_start && record.status == TenantStatus::Stopped);
            if !wanted {
                continue;
            }

            match self.start_tenant(record.id).await {
                Ok(pid) => {
                    info!(tenant = %record.id, pid, "Restored tenant '{}'", record.name);
                    started.push(record.id);
                }
                Err(e) => {
                    if e.is_refusal() {
                        info!(tenant = %record.id, "Not restoring tenant '{}': {}", record.name, e);
                    } else {
                        warn!(tenant = %record.id, "Failed to restore tenant '{}': {}", record.name, e);
                    }
                    if record.status == TenantStatus::Running {
                        self.mark_stopped(record.id, Some(e.to_string())).await;
                    }
                }
            }
        }

        Ok(started)
    }

    /// Run one monitoring iteration for the tenant's current run
    pub async fn tick(self: &Arc<Self>, id: TenantId) -> Result<TickOutcome> {
        let current = {
            let runtimes = self.runtimes.lock().await;
            runtimes
                .get(&id)
                .map(|handle| (handle.run_id, handle.cancel.clone()))
        };

        match current {
            Some((run_id, cancel)) => self.tick_run(id, run_id, &cancel).await,
            None => Ok(TickOutcome::Cancelled),
        }
    }

    async fn start_locked(self: &Arc<Self>, id: TenantId, cause: StartCause) -> Result<u32> {
        let record = self
            .store
            .get_tenant(id)
            .await?
            .ok_or(TenantError::TenantNotFound(id))?;

        if self.runtimes.lock().await.contains_key(&id) {
            return Err(TenantError::AlreadyRunning(id));
        }

        if cause == StartCause::Explicit {
            if self.restarting.lock().await.contains_key(&id) {
                return Err(TenantError::AlreadyRunning(id));
            }

            if record.is_sleeping() {
                self.event(id, EventLevel::Warning, "Start refused: tenant is sleeping")
                    .await;
                return Err(TenantError::AlreadySleeping(id));
            }
        }

        if record.remaining_quota_seconds == 0 {
            self.event(id, EventLevel::Warning, "Start refused: no quota left")
                .await;
            return Err(TenantError::QuotaExhausted(id));
        }

        let workdir = self.config.resolve_workdir(&record.workdir);
        let spec = LaunchSpec::new(
            id,
            workdir,
            record.entrypoint.clone(),
            record.secret.as_deref(),
            &self.config.runtime,
        );

        if let Err(e) = spec.check_layout() {
            error!(tenant = %id, "{}", e);
            self.event(id, EventLevel::Error, &e.to_string()).await;
            return Err(e);
        }

        if cause == StartCause::Explicit {
            if let Some(pid) = record.pid {
                spawner::kill_stale(pid);
            }
        }

        match spawner::install_dependencies(&spec.workdir, &self.config.dependencies).await {
            Ok(true) => {
                info!(tenant = %id, "Dependencies installed");
                self.event(id, EventLevel::Info, "Dependencies installed")
                    .await;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(tenant = %id, "{}", e);
                self.event(id, EventLevel::Warning, &e.to_string()).await;
            }
        }

        let mut logs = match TenantLogs::open(&spec.workdir) {
            Ok(logs) => logs,
            Err(e) => {
                error!(tenant = %id, "{}", e);
                self.event(id, EventLevel::Error, &e.to_string()).await;
                return Err(e);
            }
        };

        let (mut child, pid) = match spawner::spawn_tenant(&spec, &logs) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(tenant = %id, "{}", e);
                self.event(id, EventLevel::Critical, &e.to_string()).await;
                return Err(e);
            }
        };

        if let Err(e) = logs.mark(&format!("--- started (pid {}) ---", pid)) {
            warn!(tenant = %id, "{}", e);
        }

        let now = self.clock.now();
        let mut update = UsageUpdate {
            started_at_timestamp: Some(Some(now)),
            last_accounted_at: Some(now),
            uptime_seconds: Some(0),
            cpu_percent: Some(0.0),
            memory_mb: Some(0.0),
            last_error: Some(None),
            ..Default::default()
        };
        if cause == StartCause::Explicit {
            update.restart_count = Some(0);
        }

        let persisted = match self
            .store
            .update_status(id, TenantStatus::Running, Some(pid))
            .await
        {
            Ok(()) => self.store.update_usage(id, update).await,
            Err(e) => Err(e),
        };
        if let Err(e) = persisted {
            error!(tenant = %id, "Failed to persist start, killing child: {}", e);
            spawner::terminate(&mut child, pid, self.config.supervisor.stop_timeout()).await;
            return Err(e);
        }

        let run_id = self.next_run.fetch_add(1, Ordering::SeqCst);
        let mut handle = RuntimeHandle::new(child, pid, run_id, logs);
        handle.monitor = Some(self.spawn_monitor(id, run_id, handle.cancel.clone()));
        self.runtimes.lock().await.insert(id, handle);

        info!(tenant = %id, pid, "Started tenant '{}'", record.name);
        self.event(id, EventLevel::Info, &format!("Started (pid {})", pid))
            .await;

        Ok(pid)
    }

    /// Returns whether the store knows the tenant
    async fn stop_locked(&self, id: TenantId) -> bool {
        if let Some(token) = self.restarting.lock().await.remove(&id) {
            debug!(tenant = %id, "Cancelling pending restart");
            token.cancel();
        }

        let handle = self.runtimes.lock().await.remove(&id);
        let had_runtime = handle.is_some();

        if let Some(mut handle) = handle {
            handle.cancel.cancel();
            info!(tenant = %id, pid = handle.pid, "Stopping tenant");
            spawner::terminate(
                &mut handle.child,
                handle.pid,
                self.config.supervisor.stop_timeout(),
            )
            .await;
            if let Err(e) = handle.logs.mark("--- stopped ---") {
                debug!(tenant = %id, "{}", e);
            }
        }

        let record = match self.store.get_tenant(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                warn!(tenant = %id, "Failed to read tenant while stopping: {}", e);
                return true;
            }
        };

        if record.status == TenantStatus::Running {
            self.mark_stopped(id, None).await;
            self.event(id, EventLevel::Info, "Stopped").await;
        } else if had_runtime {
            debug!(tenant = %id, status = %record.status, "Stopped child of non-running tenant");
        }
        true
    }

    async fn mark_stopped(&self, id: TenantId, last_error: Option<String>) {
        if let Err(e) = self
            .store
            .update_status(id, TenantStatus::Stopped, None)
            .await
        {
            warn!(tenant = %id, "Failed to persist stop: {}", e);
            return;
        }

        let update = UsageUpdate {
            started_at_timestamp: Some(None),
            last_error: last_error.map(Some),
            ..Default::default()
        };
        if let Err(e) = self.store.update_usage(id, update).await {
            warn!(tenant = %id, "Failed to clear run start: {}", e);
        }
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        id: TenantId,
        run_id: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run_monitor(id, run_id, cancel).await })
    }

    async fn run_monitor(self: Arc<Self>, id: TenantId, run_id: u64, cancel: CancellationToken) {
        let interval = self.config.supervisor.poll_interval();
        debug!(tenant = %id, run_id, "Monitor started (interval: {:?})", interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.tick_run(id, run_id, &cancel).await {
                Ok(TickOutcome::Continue) => {}
                Ok(outcome) => {
                    debug!(tenant = %id, run_id, ?outcome, "Monitor finished");
                    break;
                }
                Err(e) => error!(tenant = %id, "Monitoring tick failed: {}", e),
            }
        }

        debug!(tenant = %id, run_id, "Monitor exited");
    }

    async fn tick_run(
        self: &Arc<Self>,
        id: TenantId,
        run_id: u64,
        cancel: &CancellationToken,
    ) -> Result<TickOutcome> {
        let lock = self.tenant_lock(id).await;
        let guard = lock.lock_owned().await;

        if cancel.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }

        let record = match self.store.get_tenant(id).await? {
            Some(record) => record,
            None => {
                warn!(tenant = %id, "Tenant record vanished, stopping child");
                self.stop_locked(id).await;
                return Ok(TickOutcome::Gone);
            }
        };

        let (exit, pid, sample, last_warn_at) = {
            let mut runtimes = self.runtimes.lock().await;
            let handle = match runtimes.get_mut(&id) {
                Some(handle) if handle.run_id == run_id => handle,
                _ => return Ok(TickOutcome::Cancelled),
            };

            let exit = handle.exit_status();
            let pid = handle.pid;
            let sample = match exit {
                Some(_) => ResourceSample::default(),
                None => handle.resources.sample_or_zero(pid),
            };
            (exit, pid, sample, handle.last_warn_at)
        };

        if let Some(status) = exit {
            return self
                .handle_exit(id, record, pid, status, cancel, guard)
                .await;
        }

        let now = self.clock.now();
        let eval = self.accountant.evaluate(&record, now);

        self.store
            .update_usage(
                id,
                UsageUpdate {
                    remaining_quota_seconds: Some(eval.remaining),
                    cpu_percent: Some(sample.cpu_percent),
                    memory_mb: Some(sample.memory_mb),
                    uptime_seconds: Some(eval.uptime),
                    last_accounted_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;

        debug!(
            tenant = %id,
            remaining = eval.remaining,
            uptime = eval.uptime,
            cpu = sample.cpu_percent,
            memory_mb = sample.memory_mb,
            "Accounted tenant usage"
        );

        if self
            .accountant
            .should_warn(eval.remaining, last_warn_at, now)
        {
            let notice = Notice::LowQuota {
                tenant: id,
                name: record.name.clone(),
                remaining_secs: eval.remaining,
            };
            if self.notify(record.owner_id, notice).await {
                if let Some(handle) = self.runtimes.lock().await.get_mut(&id) {
                    handle.last_warn_at = Some(now);
                }
            }
        }

        if eval.should_sleep {
            info!(tenant = %id, "Quota exhausted, putting tenant to sleep");
            self.store.set_sleep(id, SLEEP_QUOTA_EXHAUSTED).await?;
            self.event(id, EventLevel::Warning, "Quota exhausted, tenant is sleeping")
                .await;
            self.stop_locked(id).await;
            self.notify(
                record.owner_id,
                Notice::QuotaExhausted {
                    tenant: id,
                    name: record.name.clone(),
                },
            )
            .await;
            return Ok(TickOutcome::Slept);
        }

        Ok(TickOutcome::Continue)
    }

    async fn handle_exit(
        self: &Arc<Self>,
        id: TenantId,
        record: TenantRecord,
        pid: u32,
        status: std::process::ExitStatus,
        cancel: &CancellationToken,
        guard: tokio::sync::OwnedMutexGuard<()>,
    ) -> Result<TickOutcome> {
        warn!(
            tenant = %id,
            pid,
            "Tenant '{}' exited unexpectedly with {} (restart count: {})",
            record.name,
            status,
            record.restart_count
        );
        self.event(
            id,
            EventLevel::Warning,
            &format!("Process exited unexpectedly ({})", status),
        )
        .await;

        if let Some(mut handle) = self.runtimes.lock().await.remove(&id) {
            if let Err(e) = handle.logs.mark(&format!("--- exited ({}) ---", status)) {
                debug!(tenant = %id, "{}", e);
            }
        }
        spawner::kill_leftovers(pid);

        if self.policy.decide(record.restart_count) == RestartDecision::GiveUp {
            warn!(
                tenant = %id,
                "Tenant '{}' has exceeded restart limit, not restarting",
                record.name
            );
            self.store.set_sleep(id, SLEEP_RESTART_LIMIT).await?;
            self.event(
                id,
                EventLevel::Critical,
                &format!(
                    "Restart limit of {} exceeded, tenant is sleeping",
                    self.policy.max_restarts
                ),
            )
            .await;
            self.notify(
                record.owner_id,
                Notice::RestartLimitExceeded {
                    tenant: id,
                    name: record.name.clone(),
                },
            )
            .await;
            cancel.cancel();
            return Ok(TickOutcome::GaveUp);
        }

        let now = self.clock.now();
        let restart_count = record.restart_count + 1;
        let remaining = self
            .policy
            .charge(self.accountant.evaluate(&record, now).remaining);

        self.store
            .update_usage(
                id,
                UsageUpdate {
                    remaining_quota_seconds: Some(remaining),
                    restart_count: Some(restart_count),
                    total_restarts: Some(record.total_restarts + 1),
                    last_restart_at: Some(now),
                    started_at_timestamp: Some(None),
                    last_accounted_at: Some(now),
                    uptime_seconds: Some(0),
                    ..Default::default()
                },
            )
            .await?;

        self.restarting.lock().await.insert(id, cancel.clone());
        drop(guard);

        let backoff = self.policy.backoff();
        info!(
            tenant = %id,
            "Restarting tenant '{}' in {:?} (attempt {}/{})",
            record.name,
            backoff,
            restart_count,
            self.policy.max_restarts
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(tenant = %id, "Automatic restart cancelled during backoff");
                return Ok(TickOutcome::Cancelled);
            }
            _ = tokio::time::sleep(backoff) => {}
        }

        let lock = self.tenant_lock(id).await;
        let _guard = lock.lock().await;

        if self.restarting.lock().await.remove(&id).is_none() || cancel.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }
        cancel.cancel();

        match self.start_locked(id, StartCause::AutoRestart).await {
            Ok(new_pid) => {
                info!(tenant = %id, pid = new_pid, "Automatic restart succeeded");
                self.event(
                    id,
                    EventLevel::Info,
                    &format!("Automatic restart #{} (pid {})", restart_count, new_pid),
                )
                .await;
                self.notify(
                    record.owner_id,
                    Notice::Restarted {
                        tenant: id,
                        name: record.name.clone(),
                        restart_count,
                        max_restarts: self.policy.max_restarts,
                    },
                )
                .await;
                Ok(TickOutcome::Restarted)
            }
            Err(TenantError::QuotaExhausted(_)) => {
                info!(tenant = %id, "Restart penalty used up the quota, putting tenant to sleep");
                self.store.set_sleep(id, SLEEP_QUOTA_EXHAUSTED).await?;
                self.notify(
                    record.owner_id,
                    Notice::QuotaExhausted {
                        tenant: id,
                        name: record.name.clone(),
                    },
                )
                .await;
                Ok(TickOutcome::Slept)
            }
            Err(e) => {
                error!(tenant = %id, "Automatic restart failed: {}", e);
                self.mark_stopped(id, Some(e.to_string())).await;
                self.event(
                    id,
                    EventLevel::Error,
                    &format!("Automatic restart failed: {}", e),
                )
                .await;
                self.notify(
                    record.owner_id,
                    Notice::RestartFailed {
                        tenant: id,
                        name: record.name.clone(),
                        reason: e.to_string(),
                    },
                )
                .await;
                Ok(TickOutcome::RestartFailed)
            }
        }
    }

    /// Append an audit event; failures are only logged
    async fn event(&self, id: TenantId, level: EventLevel, message: &str) {
        let timestamp = DateTime::from_timestamp(self.clock.now(), 0).unwrap_or_else(Utc::now);
        if let Err(e) = self.store.append_event(id, level, message, timestamp).await {
            warn!(tenant = %id, "Failed to record event: {}", e);
        }
    }

    /// Deliver a notice within the notify timeout; returns whether delivery succeeded
    async fn notify(&self, owner: OwnerId, notice: Notice) -> bool {
        let timeout = self.config.supervisor.notify_timeout();
        match tokio::time::timeout(timeout, self.notifier.notify(owner, &notice)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(owner = %owner, tenant = %notice.tenant(), "Failed to notify owner: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    owner = %owner,
                    tenant = %notice.tenant(),
                    "Notifying owner timed out after {:?}",
                    timeout
                );
                false
            }
        }
    }
}
