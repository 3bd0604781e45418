use crate::logs::TenantLogs;
use crate::process::monitor::ResourceMonitor;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub u64);

impl TenantId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Account that owns one or more tenants; notifications are routed to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(pub i64);

impl OwnerId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a child is being spawned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCause {
    /// Caller-initiated start; resets the restart counter
    Explicit,
    /// Restart after an unexpected exit; keeps the restart counter
    AutoRestart,
}

/// What one monitoring iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Still running, keep polling
    Continue,
    /// The run this monitor belongs to is over (stopped or replaced)
    Cancelled,
    /// The tenant record disappeared from the store
    Gone,
    /// Quota ran out and the tenant is now sleeping
    Slept,
    /// Crashed and was restarted under a new monitor
    Restarted,
    /// Crashed past the restart limit and is now sleeping
    GaveUp,
    /// Crashed and the restart attempt failed
    RestartFailed,
}

/// In-memory state of one live tenant run. Never persisted.
pub struct RuntimeHandle {
    pub child: Child,
    pub pid: u32,
    /// Distinguishes successive runs of the same tenant
    pub run_id: u64,
    pub logs: TenantLogs,
    pub cancel: CancellationToken,
    pub monitor: Option<JoinHandle<()>>,
    pub resources: ResourceMonitor,
    /// Epoch seconds of the last low-quota warning in this run
    pub last_warn_at: Option<i64>,
}

impl RuntimeHandle {
    pub fn new(child: Child, pid: u32, run_id: u64, logs: TenantLogs) -> Self {
        Self {
            child,
            pid,
            run_id,
            logs,
            cancel: CancellationToken::new(),
            monitor: None,
            resources: ResourceMonitor::new(),
            last_warn_at: None,
        }
    }

    /// Exit status once the child has exited; reaps it
    pub fn exit_status(&mut self) -> Option<std::process::ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(pid = self.pid, "try_wait failed: {}", e);
                None
            }
        }
    }
}
