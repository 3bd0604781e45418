use crate::config::{QuotaMode, QuotaSettings};
use crate::store::TenantRecord;

/// Result of accounting one monitoring tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEvaluation {
    pub remaining: u64,
    pub uptime: u64,
    pub should_sleep: bool,
}

/// Converts elapsed running time into quota consumption
#[derive(Debug, Clone)]
pub struct QuotaAccountant {
    mode: QuotaMode,
    warn_threshold_secs: u64,
    warn_cooldown_secs: u64,
}

impl QuotaAccountant {
    pub fn new(settings: &QuotaSettings) -> Self {
        Self {
            mode: settings.mode,
            warn_threshold_secs: settings.warn_threshold_secs,
            warn_cooldown_secs: settings.warn_cooldown_secs,
        }
    }

    /// Remaining quota of a running tenant at `now` (epoch seconds).
    ///
    /// A record without a run start has no uptime; the decrementing model then
    /// charges nothing.
    pub fn evaluate(&self, record: &TenantRecord, now: i64) -> QuotaEvaluation {
        let uptime = record
            .started_at_timestamp
            .map(|started| elapsed(started, now))
            .unwrap_or(0);

        let remaining = match self.mode {
            QuotaMode::FromTotal => record.total_quota_seconds.saturating_sub(uptime),
            QuotaMode::Decrementing => {
                let since = record.last_accounted_at.or(record.started_at_timestamp);
                let consumed = since.map(|t| elapsed(t, now)).unwrap_or(0);
                record.remaining_quota_seconds.saturating_sub(consumed)
            }
        };

        QuotaEvaluation {
            remaining,
            uptime,
            should_sleep: remaining == 0,
        }
    }

    /// Whether the owner should get a low-quota warning now
    pub fn should_warn(&self, remaining: u64, last_warn_at: Option<i64>, now: i64) -> bool {
        if remaining == 0 || remaining > self.warn_threshold_secs {
            return false;
        }

        match last_warn_at {
            None => true,
            Some(last) => elapsed(last, now) >= self.warn_cooldown_secs,
        }
    }
}

/// Whole seconds from `from` to `to`; a clock that went backwards counts as zero
fn elapsed(from: i64, to: i64) -> u64 {
    u64::try_from(to.saturating_sub(from)).unwrap_or(0)
}
