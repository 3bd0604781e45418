use crate::error::{Result, TenantError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub supervisor: SupervisorSettings,
    pub quota: QuotaSettings,
    pub restart: RestartSettings,
    pub runtime: RuntimeSettings,
    pub dependencies: DependencySettings,

    /// Path of the JSON tenant store
    pub store_path: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    pub log_level: Option<String>,
}

/// Monitoring loop and lifecycle timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Seconds between two monitoring ticks
    pub poll_interval_secs: u64,

    /// Seconds to wait after SIGTERM before SIGKILL
    pub stop_timeout_secs: u64,

    /// Pause between the stop and start halves of an explicit restart
    pub restart_delay_secs: u64,

    /// Upper bound on one owner notification; a slower notifier counts as failed
    pub notify_timeout_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            stop_timeout_secs: 10,
            restart_delay_secs: 2,
            notify_timeout_secs: 10,
        }
    }
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

/// How remaining quota is derived on every tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMode {
    /// Subtract the time elapsed since the last accounting tick
    #[default]
    Decrementing,
    /// Recompute `total - uptime` of the current run
    FromTotal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub mode: QuotaMode,

    /// Warn the owner once remaining quota drops to this many seconds
    pub warn_threshold_secs: u64,

    /// Minimum seconds between two low-quota warnings
    pub warn_cooldown_secs: u64,

    /// Seconds granted by the daily recovery
    pub recovery_grant_secs: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            mode: QuotaMode::default(),
            warn_threshold_secs: 600,
            warn_cooldown_secs: 300,
            recovery_grant_secs: 7200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    /// Automatic restarts allowed before the tenant is put to sleep
    pub max_restarts: u32,

    /// Quota seconds charged for each automatic restart
    pub penalty_secs: u64,

    /// Delay before an automatic restart
    pub backoff_secs: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            penalty_secs: 300,
            backoff_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Base directory for relative tenant working directories
    pub tenants_dir: PathBuf,

    /// Program used to run the entry point; the entry point is executed directly when unset
    pub interpreter: Option<PathBuf>,

    /// Environment variable carrying the tenant secret
    pub secret_env: String,

    /// Variables copied from the supervisor environment into the child
    pub passthrough_env: Vec<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            tenants_dir: PathBuf::from("tenants"),
            interpreter: Some(PathBuf::from("python3")),
            secret_env: "BOT_TOKEN".to_string(),
            passthrough_env: vec!["PATH".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySettings {
    /// Manifest file looked up in the tenant working directory
    pub manifest: String,

    /// Install command, run in the working directory with the manifest name appended
    pub install_command: Vec<String>,

    pub timeout_secs: u64,
}

impl Default for DependencySettings {
    fn default() -> Self {
        Self {
            manifest: "requirements.txt".to_string(),
            install_command: ["python3", "-m", "pip", "install", "-q", "-r"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 120,
        }
    }
}

impl DependencySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Load configuration from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TenantError::Config(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(TenantError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    fn parse_toml(contents: &str) -> Result<Config> {
        toml::from_str(contents)
            .map_err(|e| TenantError::InvalidConfig(format!("Failed to parse TOML: {}", e)))
    }

    fn parse_json(contents: &str) -> Result<Config> {
        serde_json::from_str(contents)
            .map_err(|e| TenantError::InvalidConfig(format!("Failed to parse JSON: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.supervisor.poll_interval_secs == 0 {
            return Err(TenantError::ConfigValidation(
                "supervisor.poll_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.supervisor.notify_timeout_secs == 0 {
            return Err(TenantError::ConfigValidation(
                "supervisor.notify_timeout_secs must be at least 1".to_string(),
            ));
        }

        if self.quota.warn_threshold_secs > 0 && self.quota.warn_cooldown_secs == 0 {
            return Err(TenantError::ConfigValidation(
                "quota.warn_cooldown_secs must be at least 1 when warnings are enabled"
                    .to_string(),
            ));
        }

        if self.quota.recovery_grant_secs == 0 {
            return Err(TenantError::ConfigValidation(
                "quota.recovery_grant_secs must be at least 1".to_string(),
            ));
        }

        if self.runtime.secret_env.is_empty() {
            return Err(TenantError::ConfigValidation(
                "runtime.secret_env cannot be empty".to_string(),
            ));
        }

        if self.runtime.secret_env.contains('=') {
            return Err(TenantError::ConfigValidation(format!(
                "Invalid runtime.secret_env: {}",
                self.runtime.secret_env
            )));
        }

        if self.dependencies.install_command.is_empty() {
            return Err(TenantError::ConfigValidation(
                "dependencies.install_command cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve a tenant working directory against `runtime.tenants_dir`.
    ///
    /// The result is absolute: children run with the workdir as their cwd,
    /// so a relative path would be resolved twice.
    pub fn resolve_workdir(&self, workdir: &Path) -> PathBuf {
        let resolved = if workdir.is_absolute() {
            workdir.to_path_buf()
        } else {
            self.runtime.tenants_dir.join(workdir)
        };

        std::path::absolute(&resolved).unwrap_or(resolved)
    }

    fn expand_env_vars(&mut self) {
        self.runtime.tenants_dir = Self::expand_env_in_path(&self.runtime.tenants_dir);

        if let Some(ref interpreter) = self.runtime.interpreter {
            self.runtime.interpreter = Some(Self::expand_env_in_path(interpreter));
        }

        if let Some(ref store_path) = self.store_path {
            self.store_path = Some(Self::expand_env_in_path(store_path));
        }

        self.dependencies.install_command = self
            .dependencies
            .install_command
            .iter()
            .map(|arg| Self::expand_env_in_string(arg))
            .collect();
    }

    /// Expand `$VAR` and `${VAR}` references
    fn expand_env_in_string(s: &str) -> String {
        let mut result = s.to_string();

        // Longest names first so $HOME_DIR is not clobbered by $HOME
        let mut vars: Vec<(String, String)> = std::env::vars().collect();
        vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        for (key, value) in vars {
            result = result.replace(&format!("${{{}}}", key), &value);
            result = result.replace(&format!("${}", key), &value);
        }

        result
    }

    fn expand_env_in_path(path: &Path) -> PathBuf {
        let path_str = path.to_string_lossy();
        PathBuf::from(Self::expand_env_in_string(&path_str))
    }
}
