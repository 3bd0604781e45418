use crate::error::{Result, TenantError};
use chrono::{DateTime, Local};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Directory, relative to the tenant working directory, holding the log streams
pub const LOG_DIR: &str = "logs";

/// Append-only stdout/stderr sinks of one tenant run
#[derive(Debug)]
pub struct TenantLogs {
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    stdout_file: File,
    stderr_file: File,
}

impl TenantLogs {
    /// Open `<workdir>/logs/stdout.log` and `<workdir>/logs/stderr.log` in append mode
    pub fn open(workdir: &Path) -> Result<Self> {
        let log_dir = workdir.join(LOG_DIR);
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| TenantError::LogSink(format!("Failed to create log directory: {}", e)))?;

        let stdout_path = log_dir.join("stdout.log");
        let stderr_path = log_dir.join("stderr.log");

        let stdout_file = Self::open_append(&stdout_path)?;
        let stderr_file = Self::open_append(&stderr_path)?;

        Ok(Self {
            stdout_path,
            stderr_path,
            stdout_file,
            stderr_file,
        })
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                TenantError::LogSink(format!("Failed to open {}: {}", path.display(), e))
            })
    }

    /// Write a timestamped marker line to both streams
    pub fn mark(&mut self, message: &str) -> Result<()> {
        let entry = format_log_entry(&Local::now(), message.as_bytes());

        for file in [&mut self.stdout_file, &mut self.stderr_file] {
            file.write_all(&entry)
                .and_then(|_| file.flush())
                .map_err(|e| TenantError::LogSink(format!("Failed to write marker: {}", e)))?;
        }

        Ok(())
    }

    /// Handles for the child's stdout and stderr sharing the open sinks
    pub fn stdio(&self) -> Result<(Stdio, Stdio)> {
        let stdout = self.stdout_file.try_clone()?;
        let stderr = self.stderr_file.try_clone()?;
        Ok((Stdio::from(stdout), Stdio::from(stderr)))
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }
}

/// Format: [YYYY-MM-DD HH:MM:SS.mmm] <data>
fn format_log_entry(timestamp: &DateTime<Local>, data: &[u8]) -> Vec<u8> {
    let timestamp_str = timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    let mut entry = Vec::with_capacity(timestamp_str.len() + 4 + data.len());

    entry.extend_from_slice(b"[");
    entry.extend_from_slice(timestamp_str.as_bytes());
    entry.extend_from_slice(b"] ");
    entry.extend_from_slice(data);

    if !data.ends_with(b"\n") {
        entry.push(b'\n');
    }

    entry
}
