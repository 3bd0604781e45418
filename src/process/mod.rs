// Process module - Tenant child lifecycle, quota accounting and supervision

pub mod monitor;
pub mod quota;
pub mod restart;
pub mod spawner;
mod supervisor;
mod types;

pub use monitor::{ResourceMonitor, ResourceSample};
pub use quota::{QuotaAccountant, QuotaEvaluation};
pub use restart::{RestartDecision, RestartPolicy};
pub use spawner::LaunchSpec;
pub use supervisor::{Supervisor, SLEEP_QUOTA_EXHAUSTED, SLEEP_RESTART_LIMIT};
pub use types::{OwnerId, RuntimeHandle, StartCause, TenantId, TickOutcome};
