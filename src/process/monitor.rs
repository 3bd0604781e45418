use crate::error::{Result, TenantError};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// One resource usage reading of a child process
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// Samples CPU and memory of tenant processes.
///
/// CPU usage is computed between two refreshes of the same pid, so the first
/// sample of a process reports zero CPU.
pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    fn refresh(&mut self, pid: Pid) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
    }

    /// Sample a process, failing when it cannot be observed
    pub fn sample(&mut self, pid: u32) -> Result<ResourceSample> {
        let sys_pid = Pid::from_u32(pid);
        self.refresh(sys_pid);

        let process = self.system.process(sys_pid).ok_or_else(|| {
            TenantError::ResourceSampleFailure(pid, "process not visible".to_string())
        })?;

        Ok(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_mb: process.memory() as f64 / BYTES_PER_MB,
        })
    }

    /// Sample a process, reporting zero usage on any failure
    pub fn sample_or_zero(&mut self, pid: u32) -> ResourceSample {
        self.sample(pid).unwrap_or_else(|e| {
            tracing::debug!("{}", e);
            ResourceSample::default()
        })
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_sample_running_process() {
        let mut monitor = ResourceMonitor::new();

        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        let sample = monitor.sample(pid).unwrap();
        assert!(sample.memory_mb > 0.0);
        assert!(sample.cpu_percent >= 0.0);

        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_sample_vanished_process_is_zero() {
        let mut monitor = ResourceMonitor::new();

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");
        let _ = child.wait().await;
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        assert!(matches!(
            monitor.sample(pid),
            Err(TenantError::ResourceSampleFailure(_, _))
        ));
        assert_eq!(monitor.sample_or_zero(pid), ResourceSample::default());
    }
}
