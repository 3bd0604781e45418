use crate::config::{DependencySettings, RuntimeSettings};
use crate::error::{Result, TenantError};
use crate::logs::TenantLogs;
use crate::process::TenantId;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Everything needed to launch one tenant child
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub tenant: TenantId,
    pub workdir: PathBuf,
    /// Entry point relative to `workdir`
    pub entrypoint: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Build the launch spec; the child environment holds only the
    /// pass-through variables and the secret
    pub fn new(
        tenant: TenantId,
        workdir: PathBuf,
        entrypoint: PathBuf,
        secret: Option<&str>,
        runtime: &RuntimeSettings,
    ) -> Self {
        let mut env: Vec<(String, String)> = runtime
            .passthrough_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();

        if let Some(secret) = secret {
            env.push((runtime.secret_env.clone(), secret.to_string()));
        }

        Self {
            tenant,
            workdir,
            entrypoint,
            interpreter: runtime.interpreter.clone(),
            env,
        }
    }

    pub fn entrypoint_path(&self) -> PathBuf {
        self.workdir.join(&self.entrypoint)
    }

    /// Fail unless both the working directory and the entry point exist
    pub fn check_layout(&self) -> Result<()> {
        if !self.workdir.is_dir() {
            return Err(TenantError::MissingWorkdirOrEntrypoint(self.workdir.clone()));
        }

        let entrypoint = self.entrypoint_path();
        if !entrypoint.is_file() {
            return Err(TenantError::MissingWorkdirOrEntrypoint(entrypoint));
        }

        Ok(())
    }
}

/// Spawn the tenant in its own process group with output going to its log sinks
pub fn spawn_tenant(spec: &LaunchSpec, logs: &TenantLogs) -> Result<(Child, u32)> {
    let mut command = match spec.interpreter {
        Some(ref interpreter) => {
            let mut command = std::process::Command::new(interpreter);
            command.arg(&spec.entrypoint);
            command
        }
        // The child's cwd changes before exec, so the program path must not be relative
        None => {
            let program = spec.entrypoint_path();
            std::process::Command::new(std::path::absolute(&program).unwrap_or(program))
        }
    };

    command.current_dir(&spec.workdir);
    command.env_clear();
    command.envs(spec.env.iter().map(|(k, v)| (k, v)));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let (stdout, stderr) = logs.stdio()?;
    command.stdin(Stdio::null());
    command.stdout(stdout);
    command.stderr(stderr);

    let child = Command::from(command)
        .spawn()
        .map_err(|e| TenantError::SpawnFailure(spec.tenant, e))?;

    let pid = child.id().ok_or_else(|| {
        TenantError::SpawnFailure(
            spec.tenant,
            std::io::Error::new(std::io::ErrorKind::Other, "child exited before reporting a pid"),
        )
    })?;

    Ok((child, pid))
}

/// Run the dependency installer when the manifest exists.
///
/// Returns `Ok(false)` when there is nothing to install.
pub async fn install_dependencies(workdir: &Path, settings: &DependencySettings) -> Result<bool> {
    if !workdir.join(&settings.manifest).is_file() {
        return Ok(false);
    }

    let (program, args) = settings.install_command.split_first().ok_or_else(|| {
        TenantError::DependencyInstallFailure("empty install command".to_string())
    })?;

    let mut child = Command::new(program)
        .args(args)
        .arg(&settings.manifest)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TenantError::DependencyInstallFailure(e.to_string()))?;

    match tokio::time::timeout(settings.timeout(), child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(true),
        Ok(Ok(status)) => Err(TenantError::DependencyInstallFailure(format!(
            "installer exited with {}",
            status
        ))),
        Ok(Err(e)) => Err(TenantError::DependencyInstallFailure(e.to_string())),
        Err(_) => {
            let _ = child.kill().await;
            Err(TenantError::DependencyInstallTimeout(settings.timeout_secs))
        }
    }
}

/// Gracefully stop a child: SIGTERM to its group, SIGKILL after `timeout`
pub async fn terminate(child: &mut Child, pid: u32, timeout: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::debug!(pid, "Process already exited with {}", status);
        return;
    }

    if let Err(e) = signal_group(pid, false) {
        tracing::warn!(pid, "Failed to send SIGTERM: {}", e);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(pid, "Process exited gracefully with {}", status);
        }
        Ok(Err(e)) => {
            tracing::warn!(pid, "Wait failed: {}", e);
        }
        Err(_) => {
            tracing::warn!(
                pid,
                "Process did not exit within {:?}, sending SIGKILL",
                timeout
            );
            if let Err(e) = signal_group(pid, true) {
                tracing::warn!(pid, "Failed to send SIGKILL: {}", e);
            }
            let _ = child.kill().await;
        }
    }
}

/// Kill a process group left behind by a previous supervisor instance.
///
/// Only acts when `pid` still leads its own group, which is how tenants are
/// spawned.
#[cfg(unix)]
pub fn kill_stale(pid: u32) {
    use nix::unistd::{getpgid, getpgrp, Pid};

    let nix_pid = Pid::from_raw(pid as i32);
    match getpgid(Some(nix_pid)) {
        Ok(pgid) if pgid == nix_pid && pgid != getpgrp() => {
            match signal_group(pid, true) {
                Ok(()) => tracing::info!(pid, "Killed stale process group"),
                Err(e) => tracing::warn!(pid, "Failed to kill stale process group: {}", e),
            }
        }
        Ok(_) => tracing::debug!(pid, "Stale pid no longer leads a process group"),
        Err(_) => tracing::debug!(pid, "Stale pid is gone"),
    }
}

#[cfg(not(unix))]
pub fn kill_stale(pid: u32) {
    tracing::debug!(pid, "Stale process cleanup is not supported on this platform");
}

/// SIGKILL whatever is left of the group led by an already reaped child
pub fn kill_leftovers(pid: u32) {
    match signal_group(pid, true) {
        Ok(()) => tracing::debug!(pid, "Killed leftover group members"),
        Err(e) => tracing::debug!(pid, "No leftover group members: {}", e),
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, force: bool) -> std::result::Result<(), String> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    killpg(Pid::from_raw(pid as i32), signal).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _force: bool) -> std::result::Result<(), String> {
    Err("process groups are not supported on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), format!("#!/bin/sh\n{}\n", body)).unwrap();
    }

    fn create_test_spec(dir: &Path, entrypoint: &str) -> LaunchSpec {
        let runtime = RuntimeSettings {
            tenants_dir: dir.to_path_buf(),
            interpreter: Some(PathBuf::from("/bin/sh")),
            secret_env: "BOT_TOKEN".to_string(),
            passthrough_env: vec!["PATH".to_string()],
        };
        LaunchSpec::new(
            TenantId::new(1),
            dir.to_path_buf(),
            PathBuf::from(entrypoint),
            Some("s3cret"),
            &runtime,
        )
    }

    #[test]
    fn test_launch_spec_env() {
        let temp_dir = TempDir::new().unwrap();
        let spec = create_test_spec(temp_dir.path(), "main.sh");

        assert!(spec
            .env
            .contains(&("BOT_TOKEN".to_string(), "s3cret".to_string())));
        assert!(spec.env.iter().all(|(k, _)| k == "PATH" || k == "BOT_TOKEN"));
    }

    #[test]
    fn test_check_layout() {
        let temp_dir = TempDir::new().unwrap();
        let spec = create_test_spec(temp_dir.path(), "main.sh");

        assert!(matches!(
            spec.check_layout(),
            Err(TenantError::MissingWorkdirOrEntrypoint(_))
        ));

        write_script(temp_dir.path(), "main.sh", "exit 0");
        assert!(spec.check_layout().is_ok());

        let missing = create_test_spec(&temp_dir.path().join("nope"), "main.sh");
        assert!(matches!(
            missing.check_layout(),
            Err(TenantError::MissingWorkdirOrEntrypoint(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_injects_secret_and_writes_logs() {
        let temp_dir = TempDir::new().unwrap();
        write_script(
            temp_dir.path(),
            "main.sh",
            "echo \"token=$BOT_TOKEN\"\necho \"home=$HOME\"\necho oops >&2",
        );
        let spec = create_test_spec(temp_dir.path(), "main.sh");
        let logs = TenantLogs::open(temp_dir.path()).unwrap();

        let (mut child, pid) = spawn_tenant(&spec, &logs).unwrap();
        assert!(pid > 0);
        assert!(child.wait().await.unwrap().success());

        let stdout = fs::read_to_string(logs.stdout_path()).unwrap();
        let stderr = fs::read_to_string(logs.stderr_path()).unwrap();
        assert!(stdout.contains("token=s3cret"));
        // Nothing but the pass-through list and the secret reaches the child
        assert!(stdout.contains("home=\n"));
        assert!(stderr.contains("oops"));
    }

    #[tokio::test]
    async fn test_spawn_missing_interpreter() {
        let temp_dir = TempDir::new().unwrap();
        write_script(temp_dir.path(), "main.sh", "exit 0");
        let mut spec = create_test_spec(temp_dir.path(), "main.sh");
        spec.interpreter = Some(PathBuf::from("/nonexistent/interpreter"));
        let logs = TenantLogs::open(temp_dir.path()).unwrap();

        let result = spawn_tenant(&spec, &logs);
        assert!(matches!(result, Err(TenantError::SpawnFailure(_, _))));
    }

    #[tokio::test]
    async fn test_terminate_running_child() {
        let temp_dir = TempDir::new().unwrap();
        write_script(temp_dir.path(), "main.sh", "sleep 30");
        let spec = create_test_spec(temp_dir.path(), "main.sh");
        let logs = TenantLogs::open(temp_dir.path()).unwrap();

        let (mut child, pid) = spawn_tenant(&spec, &logs).unwrap();
        terminate(&mut child, pid, Duration::from_secs(5)).await;

        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let temp_dir = TempDir::new().unwrap();
        write_script(temp_dir.path(), "main.sh", "trap '' TERM\nsleep 30");
        let spec = create_test_spec(temp_dir.path(), "main.sh");
        let logs = TenantLogs::open(temp_dir.path()).unwrap();

        let (mut child, pid) = spawn_tenant(&spec, &logs).unwrap();
        // Let the shell install its trap
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate(&mut child, pid, Duration::from_millis(300)).await;

        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_install_without_manifest() {
        let temp_dir = TempDir::new().unwrap();
        let installed = install_dependencies(temp_dir.path(), &DependencySettings::default())
            .await
            .unwrap();
        assert!(!installed);
    }

    #[tokio::test]
    async fn test_install_runs_with_manifest_argument() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("requirements.txt"), "requests\n").unwrap();
        let settings = DependencySettings {
            manifest: "requirements.txt".to_string(),
            install_command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "cp \"$1\" installed.txt".to_string(),
                "installer".to_string(),
            ],
            timeout_secs: 10,
        };

        let installed = install_dependencies(temp_dir.path(), &settings).await.unwrap();
        assert!(installed);
        assert_eq!(
            fs::read_to_string(temp_dir.path().join("installed.txt")).unwrap(),
            "requests\n"
        );
    }

    #[tokio::test]
    async fn test_relative_workdir() {
        let temp_dir = tempfile::Builder::new().tempdir_in(".").unwrap();
        let workdir = PathBuf::from(".").join(temp_dir.path().file_name().unwrap());
        assert!(workdir.is_relative());

        write_script(&workdir, "main.sh", "cp installed.txt copied.txt");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(workdir.join("main.sh"), fs::Permissions::from_mode(0o755))
                .unwrap();
        }
        fs::write(workdir.join("requirements.txt"), "requests\n").unwrap();

        let settings = DependencySettings {
            manifest: "requirements.txt".to_string(),
            install_command: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "cp \"$1\" installed.txt".to_string(),
                "installer".to_string(),
            ],
            timeout_secs: 10,
        };
        assert!(install_dependencies(&workdir, &settings).await.unwrap());

        let mut spec = create_test_spec(&workdir, "main.sh");
        spec.interpreter = None;
        spec.check_layout().unwrap();
        let logs = TenantLogs::open(&workdir).unwrap();

        let (mut child, _) = spawn_tenant(&spec, &logs).unwrap();
        assert!(child.wait().await.unwrap().success());
        assert_eq!(
            fs::read_to_string(workdir.join("copied.txt")).unwrap(),
            "requests\n"
        );
    }

    #[tokio::test]
    async fn test_install_failure_and_timeout() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("requirements.txt"), "").unwrap();

        let failing = DependencySettings {
            manifest: "requirements.txt".to_string(),
            install_command: vec!["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            timeout_secs: 10,
        };
        assert!(matches!(
            install_dependencies(temp_dir.path(), &failing).await,
            Err(TenantError::DependencyInstallFailure(_))
        ));

        let slow = DependencySettings {
            manifest: "requirements.txt".to_string(),
            install_command: vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()],
            timeout_secs: 1,
        };
        assert!(matches!(
            install_dependencies(temp_dir.path(), &slow).await,
            Err(TenantError::DependencyInstallTimeout(1))
        ));
    }

    #[tokio::test]
    async fn test_kill_stale_group() {
        let temp_dir = TempDir::new().unwrap();
        write_script(temp_dir.path(), "main.sh", "sleep 30");
        let spec = create_test_spec(temp_dir.path(), "main.sh");
        let logs = TenantLogs::open(temp_dir.path()).unwrap();

        let (mut child, pid) = spawn_tenant(&spec, &logs).unwrap();
        kill_stale(pid);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("stale child was not killed")
            .unwrap();
        assert!(!status.success());
    }
}
