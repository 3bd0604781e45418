use crate::process::TenantId;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the tenant supervisor
#[derive(Debug, Error)]
pub enum TenantError {
    // Refusals surfaced to the caller of start/restart, no state change
    #[error("Tenant not found: {0}")]
    TenantNotFound(TenantId),

    #[error("Tenant {0} is already running")]
    AlreadyRunning(TenantId),

    #[error("Tenant {0} is sleeping; wake it before starting")]
    AlreadySleeping(TenantId),

    #[error("Tenant {0} has no remaining quota")]
    QuotaExhausted(TenantId),

    #[error("Missing working directory or entry point: {}", .0.display())]
    MissingWorkdirOrEntrypoint(PathBuf),

    #[error("Failed to spawn tenant {0}: {1}")]
    SpawnFailure(TenantId, #[source] std::io::Error),

    #[error("Daily recovery already used today by owner {0}")]
    RecoveryUnavailable(i64),

    // Degraded paths, logged and never propagated out of the supervisor
    #[error("Dependency install timed out after {0}s")]
    DependencyInstallTimeout(u64),

    #[error("Dependency install failed: {0}")]
    DependencyInstallFailure(String),

    #[error("Resource sample failed for pid {0}: {1}")]
    ResourceSampleFailure(u32, String),

    #[error("Notification failed: {0}")]
    NotifyFailure(String),

    // Adapter errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Failed to load store: {0}")]
    StoreLoad(String),

    #[error("Failed to save store: {0}")]
    StoreSave(String),

    #[error("Store corruption detected: {0}")]
    StoreCorruption(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Log sink error: {0}")]
    LogSink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TenantError {
    /// Whether this error refuses a start without touching persisted state
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            TenantError::TenantNotFound(_)
                | TenantError::AlreadyRunning(_)
                | TenantError::AlreadySleeping(_)
                | TenantError::QuotaExhausted(_)
                | TenantError::MissingWorkdirOrEntrypoint(_)
        )
    }
}

/// Result type alias for supervisor operations
pub type Result<T> = std::result::Result<T, TenantError>;
