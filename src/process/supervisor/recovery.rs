use super::Supervisor;
use crate::error::{Result, TenantError};
use crate::process::types::{StartCause, TenantId};
use crate::store::{EventLevel, UsageUpdate};
use chrono::{DateTime, NaiveDate};
use std::sync::Arc;
use tracing::info;

impl Supervisor {
    /// UTC calendar day of the supervisor clock
    pub fn today(&self) -> NaiveDate {
        DateTime::from_timestamp(self.clock.now(), 0)
            .map(|dt| dt.date_naive())
            .unwrap_or(NaiveDate::MIN)
    }

    /// Grant the owner's once-per-day recovery to a tenant.
    ///
    /// Resets the tenant's quota to the recovery grant, wakes it and starts it
    /// unless it is already running. Returns the pid of the running child.
    pub async fn recover_tenant(self: &Arc<Self>, id: TenantId) -> Result<u32> {
        let result = {
            let lock = self.tenant_lock(id).await;
            let _guard = lock.lock().await;
            self.recover_locked(id).await
        };
        self.forget_if_unknown(id, &result).await;
        result
    }

    async fn recover_locked(self: &Arc<Self>, id: TenantId) -> Result<u32> {
        let record = self
            .store
            .get_tenant(id)
            .await?
            .ok_or(TenantError::TenantNotFound(id))?;

        let today = self.today();
        if let Some(last) = self.store.last_recovery_date(record.owner_id).await? {
            if last >= today {
                return Err(TenantError::RecoveryUnavailable(record.owner_id.as_i64()));
            }
        }

        let grant = self.config.quota.recovery_grant_secs;
        self.store.record_recovery(record.owner_id, today).await?;
        self.store
            .update_usage(
                id,
                UsageUpdate {
                    total_quota_seconds: Some(grant),
                    remaining_quota_seconds: Some(grant),
                    last_accounted_at: Some(self.clock.now()),
                    ..Default::default()
                },
            )
            .await?;

        if record.is_sleeping() {
            self.store.clear_sleep(id).await?;
        }

        info!(tenant = %id, owner = %record.owner_id, grant, "Daily recovery granted");
        self.event(
            id,
            EventLevel::Info,
            &format!("Daily recovery granted ({}s)", grant),
        )
        .await;

        let running_pid = self.runtimes.lock().await.get(&id).map(|handle| handle.pid);
        match running_pid {
            Some(pid) => Ok(pid),
            None => self.start_locked(id, StartCause::Explicit).await,
        }
    }
}
