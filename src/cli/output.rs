// Output formatting and display for CLI

use crate::notify::format_duration;
use crate::process::TenantId;
use crate::store::{EventLevel, TenantEvent, TenantRecord, TenantStatus};
use chrono::Local;
use colored::*;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print a success message
pub fn print_success_msg(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print a formatted table of tenants
pub fn print_tenant_table(tenants: &[TenantRecord]) {
    if tenants.is_empty() {
        println!("{}", "No tenants are registered".yellow());
        return;
    }

    #[derive(Tabled)]
    struct TenantRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Owner")]
        owner: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Quota left")]
        remaining: String,
        #[tabled(rename = "CPU")]
        cpu: String,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Restarts")]
        restarts: String,
    }

    let rows: Vec<TenantRow> = tenants
        .iter()
        .map(|t| TenantRow {
            id: t.id.to_string(),
            owner: t.owner_id.to_string(),
            name: truncate(&t.name, 20),
            status: format_status(t),
            pid: t
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            remaining: format!(
                "{} / {}",
                format_duration(t.remaining_quota_seconds),
                format_duration(t.total_quota_seconds)
            ),
            cpu: format!("{:.1}%", t.cpu_percent),
            memory: format!("{:.1}MB", t.memory_mb),
            restarts: format!("{} ({} total)", t.restart_count, t.total_restarts),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} tenant(s)", tenants.len()).dimmed().italic()
    );
}

/// Print the event log of one tenant, newest first
pub fn print_events(id: TenantId, events: &[TenantEvent]) {
    if events.is_empty() {
        println!("{}", format!("No events recorded for tenant {}", id).yellow());
        return;
    }

    println!("\n{}", format!("Events of tenant {}", id).bold().underline());
    println!();

    for event in events {
        let when = event.timestamp.with_timezone(&Local);
        println!(
            "{} {:<8} {}",
            format!("[{}]", when.format("%Y-%m-%d %H:%M:%S")).dimmed(),
            format_level(event.level),
            event.message
        );
    }

    println!();
}

fn format_status(tenant: &TenantRecord) -> String {
    match tenant.status {
        TenantStatus::Running => tenant.status.to_string().green().to_string(),
        TenantStatus::Stopped => tenant.status.to_string().bright_black().to_string(),
        TenantStatus::Sleeping => match tenant.sleep_reason {
            Some(ref reason) => format!("{} ({})", tenant.status, reason).yellow().to_string(),
            None => tenant.status.to_string().yellow().to_string(),
        },
    }
}

fn format_level(level: EventLevel) -> String {
    match level {
        EventLevel::Info => level.to_string().blue().to_string(),
        EventLevel::Warning => level.to_string().yellow().to_string(),
        EventLevel::Error => level.to_string().red().to_string(),
        EventLevel::Critical => level.to_string().red().bold().to_string(),
    }
}

/// Truncate a string to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
