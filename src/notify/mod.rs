// Notify module - Owner alerts emitted by the supervisor

use crate::error::{Result, TenantError};
use crate::process::{OwnerId, TenantId};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Something an owner should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    LowQuota {
        tenant: TenantId,
        name: String,
        remaining_secs: u64,
    },
    QuotaExhausted {
        tenant: TenantId,
        name: String,
    },
    Restarted {
        tenant: TenantId,
        name: String,
        restart_count: u32,
        max_restarts: u32,
    },
    RestartLimitExceeded {
        tenant: TenantId,
        name: String,
    },
    RestartFailed {
        tenant: TenantId,
        name: String,
        reason: String,
    },
}

impl Notice {
    pub fn tenant(&self) -> TenantId {
        match self {
            Notice::LowQuota { tenant, .. }
            | Notice::QuotaExhausted { tenant, .. }
            | Notice::Restarted { tenant, .. }
            | Notice::RestartLimitExceeded { tenant, .. }
            | Notice::RestartFailed { tenant, .. } => *tenant,
        }
    }
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notice::LowQuota {
                name,
                remaining_secs,
                ..
            } => write!(
                f,
                "Tenant '{}' has {} of hosting time left; add time to keep it running",
                name,
                format_duration(*remaining_secs)
            ),
            Notice::QuotaExhausted { name, .. } => write!(
                f,
                "Tenant '{}' ran out of hosting time and is now sleeping",
                name
            ),
            Notice::Restarted {
                name,
                restart_count,
                max_restarts,
                ..
            } => write!(
                f,
                "Tenant '{}' stopped unexpectedly and was restarted ({}/{})",
                name, restart_count, max_restarts
            ),
            Notice::RestartLimitExceeded { name, .. } => write!(
                f,
                "Tenant '{}' kept crashing and is now sleeping; check its logs",
                name
            ),
            Notice::RestartFailed { name, reason, .. } => {
                write!(f, "Tenant '{}' could not be restarted: {}", name, reason)
            }
        }
    }
}

/// Render seconds as `1h 5m 3s`
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Fire-and-forget channel to tenant owners
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner: OwnerId, notice: &Notice) -> Result<()>;
}

/// Notifier that only writes to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, owner: OwnerId, notice: &Notice) -> Result<()> {
        tracing::info!(owner = %owner, tenant = %notice.tenant(), "{}", notice);
        Ok(())
    }
}

/// Notifier forwarding every notice to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<(OwnerId, Notice)>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(OwnerId, Notice)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, owner: OwnerId, notice: &Notice) -> Result<()> {
        self.tx
            .send((owner, notice.clone()))
            .map_err(|_| TenantError::NotifyFailure("receiver dropped".to_string()))
    }
}
