// Store module - Durable tenant records consumed by the supervisor

mod json;

pub use json::JsonStore;

use crate::error::Result;
use crate::process::{OwnerId, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Persisted lifecycle state of a tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Stopped,
    Running,
    Sleeping,
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantStatus::Stopped => write!(f, "stopped"),
            TenantStatus::Running => write!(f, "running"),
            TenantStatus::Sleeping => write!(f, "sleeping"),
        }
    }
}

/// Durable record of a hosted tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub owner_id: OwnerId,
    pub name: String,
    pub workdir: PathBuf,
    /// Entry point, relative to `workdir`
    pub entrypoint: PathBuf,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub status: TenantStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub total_quota_seconds: u64,
    #[serde(default)]
    pub remaining_quota_seconds: u64,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub total_restarts: u32,
    #[serde(default)]
    pub last_restart_at: Option<i64>,
    #[serde(default)]
    pub sleep_reason: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at_timestamp: Option<i64>,
    #[serde(default)]
    pub last_accounted_at: Option<i64>,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_mb: f64,
    #[serde(default)]
    pub uptime_seconds: u64,
    #[serde(default)]
    pub auto_start: bool,
}

impl TenantRecord {
    /// A stopped tenant with `quota_seconds` of both total and remaining quota
    pub fn new(
        id: TenantId,
        owner_id: OwnerId,
        name: impl Into<String>,
        workdir: impl Into<PathBuf>,
        entrypoint: impl Into<PathBuf>,
        quota_seconds: u64,
    ) -> Self {
        Self {
            id,
            owner_id,
            name: name.into(),
            workdir: workdir.into(),
            entrypoint: entrypoint.into(),
            secret: None,
            status: TenantStatus::Stopped,
            pid: None,
            total_quota_seconds: quota_seconds,
            remaining_quota_seconds: quota_seconds,
            restart_count: 0,
            total_restarts: 0,
            last_restart_at: None,
            sleep_reason: None,
            last_error: None,
            started_at_timestamp: None,
            last_accounted_at: None,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            uptime_seconds: 0,
            auto_start: false,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn is_sleeping(&self) -> bool {
        self.status == TenantStatus::Sleeping
    }
}

/// Partial update of usage and quota fields; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageUpdate {
    pub total_quota_seconds: Option<u64>,
    pub remaining_quota_seconds: Option<u64>,
    pub restart_count: Option<u32>,
    pub total_restarts: Option<u32>,
    pub last_restart_at: Option<i64>,
    /// `Some(None)` clears the run start
    pub started_at_timestamp: Option<Option<i64>>,
    pub last_accounted_at: Option<i64>,
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<f64>,
    pub uptime_seconds: Option<u64>,
    /// `Some(None)` clears the last error
    pub last_error: Option<Option<String>>,
}

impl UsageUpdate {
    pub(crate) fn apply(self, record: &mut TenantRecord) {
        if let Some(v) = self.total_quota_seconds {
            record.total_quota_seconds = v;
        }
        if let Some(v) = self.remaining_quota_seconds {
            record.remaining_quota_seconds = v;
        }
        if let Some(v) = self.restart_count {
            record.restart_count = v;
        }
        if let Some(v) = self.total_restarts {
            record.total_restarts = v;
        }
        if let Some(v) = self.last_restart_at {
            record.last_restart_at = Some(v);
        }
        if let Some(v) = self.started_at_timestamp {
            record.started_at_timestamp = v;
        }
        if let Some(v) = self.last_accounted_at {
            record.last_accounted_at = Some(v);
        }
        if let Some(v) = self.cpu_percent {
            record.cpu_percent = v;
        }
        if let Some(v) = self.memory_mb {
            record.memory_mb = v;
        }
        if let Some(v) = self.uptime_seconds {
            record.uptime_seconds = v;
        }
        if let Some(v) = self.last_error {
            record.last_error = v;
        }
    }
}

/// Severity of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventLevel::Info => write!(f, "INFO"),
            EventLevel::Warning => write!(f, "WARNING"),
            EventLevel::Error => write!(f, "ERROR"),
            EventLevel::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Audit log entry attached to a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEvent {
    pub tenant_id: TenantId,
    pub level: EventLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Persistent store consumed by the supervisor.
///
/// Implementations are expected to serialize updates to a single record.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn get_tenant(&self, id: TenantId) -> Result<Option<TenantRecord>>;

    async fn list_tenants(&self) -> Result<Vec<TenantRecord>>;

    /// Insert or replace a tenant record
    async fn put_tenant(&self, record: TenantRecord) -> Result<()>;

    async fn update_status(&self, id: TenantId, status: TenantStatus, pid: Option<u32>)
        -> Result<()>;

    async fn update_usage(&self, id: TenantId, update: UsageUpdate) -> Result<()>;

    /// Mark the tenant sleeping with a reason and clear its pid
    async fn set_sleep(&self, id: TenantId, reason: &str) -> Result<()>;

    /// Leave the sleeping state; the tenant ends up stopped
    async fn clear_sleep(&self, id: TenantId) -> Result<()>;

    /// Record an event stamped with the caller's clock
    async fn append_event(
        &self,
        id: TenantId,
        level: EventLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()>;

    /// Most recent events first
    async fn recent_events(&self, id: TenantId, limit: usize) -> Result<Vec<TenantEvent>>;

    async fn last_recovery_date(&self, owner: OwnerId) -> Result<Option<NaiveDate>>;

    async fn record_recovery(&self, owner: OwnerId, date: NaiveDate) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_update_leaves_unset_fields() {
        let mut record = TenantRecord::new(
            TenantId::new(1),
            OwnerId::new(10),
            "bot",
            "/tmp/bot",
            "main.py",
            3600,
        );
        record.started_at_timestamp = Some(100);
        record.last_error = Some("boom".to_string());

        UsageUpdate {
            remaining_quota_seconds: Some(1200),
            cpu_percent: Some(12.5),
            ..Default::default()
        }
        .apply(&mut record);

        assert_eq!(record.remaining_quota_seconds, 1200);
        assert_eq!(record.total_quota_seconds, 3600);
        assert_eq!(record.cpu_percent, 12.5);
        assert_eq!(record.started_at_timestamp, Some(100));
        assert_eq!(record.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_usage_update_clears_optional_fields() {
        let mut record = TenantRecord::new(
            TenantId::new(1),
            OwnerId::new(10),
            "bot",
            "/tmp/bot",
            "main.py",
            3600,
        );
        record.started_at_timestamp = Some(100);
        record.last_error = Some("boom".to_string());

        UsageUpdate {
            started_at_timestamp: Some(None),
            last_error: Some(None),
            ..Default::default()
        }
        .apply(&mut record);

        assert_eq!(record.started_at_timestamp, None);
        assert_eq!(record.last_error, None);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TenantStatus::Sleeping).unwrap();
        assert_eq!(json, "\"sleeping\"");
    }
}
