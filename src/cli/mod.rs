// CLI module - Service entry point and store inspection commands

mod output;

use crate::config::Config;
use crate::error::{Result, TenantError};
use crate::notify::LogNotifier;
use crate::process::{OwnerId, Supervisor, TenantId};
use crate::store::{JsonStore, TenantRecord, TenantStore};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const DEFAULT_STORE_PATH: &str = "tenants.json";
const DEFAULT_LOG_LEVEL: &str = "info";

/// tenantd - Supervisor for quota-limited tenant processes
#[derive(Parser)]
#[command(name = "tenantd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Tenant store file, overrides `store_path` from the configuration
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor until interrupted
    Serve,

    /// List registered tenants
    List,

    /// Show the recent event log of a tenant
    Events {
        /// Tenant ID
        id: u64,

        /// Number of events to display
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Register a tenant in the store
    Add {
        /// Tenant ID
        id: u64,

        /// Owner receiving notifications for this tenant
        #[arg(long)]
        owner: i64,

        /// Display name
        #[arg(long)]
        name: String,

        /// Working directory, relative to the tenants directory unless absolute
        #[arg(long)]
        workdir: PathBuf,

        /// Entry point relative to the working directory
        #[arg(long, default_value = "main.py")]
        entrypoint: PathBuf,

        /// Initial quota in seconds
        #[arg(long, default_value = "3600")]
        quota: u64,

        /// Secret injected into the child environment
        #[arg(long)]
        secret: Option<String>,

        /// Start this tenant whenever the service starts
        #[arg(long)]
        auto_start: bool,
    },
}

impl Cli {
    /// Parse arguments and run the selected command
    pub async fn run() -> Result<()> {
        let cli = Cli::parse();
        cli.execute().await
    }

    async fn execute(self) -> Result<()> {
        let config = match self.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };

        let store_path = self
            .store
            .clone()
            .or_else(|| config.store_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));

        match self.command {
            Commands::Serve => serve(config, store_path).await,

            Commands::List => {
                let store = JsonStore::open(&store_path)?;
                let tenants = store.list_tenants().await?;
                output::print_tenant_table(&tenants);
                Ok(())
            }

            Commands::Events { id, limit } => {
                let store = JsonStore::open(&store_path)?;
                let id = TenantId::new(id);
                if store.get_tenant(id).await?.is_none() {
                    return Err(TenantError::TenantNotFound(id));
                }
                let events = store.recent_events(id, limit).await?;
                output::print_events(id, &events);
                Ok(())
            }

            Commands::Add {
                id,
                owner,
                name,
                workdir,
                entrypoint,
                quota,
                secret,
                auto_start,
            } => {
                let store = JsonStore::open(&store_path)?;
                let id = TenantId::new(id);
                if store.get_tenant(id).await?.is_some() {
                    return Err(TenantError::Store(format!("Tenant {} already exists", id)));
                }

                let mut record =
                    TenantRecord::new(id, OwnerId::new(owner), name, workdir, entrypoint, quota);
                record.secret = secret;
                record.auto_start = auto_start;
                store.put_tenant(record).await?;

                output::print_success_msg(&format!("Tenant {} registered", id));
                Ok(())
            }
        }
    }
}

/// Install the tracing subscriber; `RUST_LOG` wins over the configured level
pub fn init_tracing(config: &Config) {
    let level = config.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn serve(config: Config, store_path: PathBuf) -> Result<()> {
    init_tracing(&config);

    let store = Arc::new(JsonStore::open(&store_path)?);
    tracing::info!("Using tenant store {}", store_path.display());

    let supervisor = Supervisor::new(config, store, Arc::new(LogNotifier));
    let restored = supervisor.restore().await?;
    tracing::info!("Supervisor ready, {} tenant(s) running", restored.len());

    shutdown_signal().await;

    tracing::info!("Shutting down supervisor...");
    supervisor.stop_all().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to wait for ctrl-c: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_add_defaults() {
        let cli = Cli::try_parse_from([
            "tenantd", "add", "7", "--owner", "42", "--name", "echo", "--workdir", "echo",
        ])
        .unwrap();

        match cli.command {
            Commands::Add {
                id,
                owner,
                entrypoint,
                quota,
                secret,
                auto_start,
                ..
            } => {
                assert_eq!(id, 7);
                assert_eq!(owner, 42);
                assert_eq!(entrypoint, PathBuf::from("main.py"));
                assert_eq!(quota, 3600);
                assert_eq!(secret, None);
                assert!(!auto_start);
            }
            _ => panic!("expected add command"),
        }
    }

    #[test]
    fn test_global_store_flag() {
        let cli = Cli::try_parse_from(["tenantd", "list", "--store", "/tmp/t.json"]).unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/t.json")));
        assert!(matches!(cli.command, Commands::List));
    }

    #[tokio::test]
    async fn test_add_then_list_store() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store_path = temp_dir.path().join("tenants.json");
        let store_arg = store_path.to_str().unwrap();

        let add = Cli::try_parse_from([
            "tenantd", "--store", store_arg, "add", "1", "--owner", "9", "--name", "bot",
            "--workdir", "bot", "--auto-start",
        ])
        .unwrap();
        add.execute().await.unwrap();

        let again = Cli::try_parse_from([
            "tenantd", "--store", store_arg, "add", "1", "--owner", "9", "--name", "bot",
            "--workdir", "bot",
        ])
        .unwrap();
        assert!(matches!(again.execute().await, Err(TenantError::Store(_))));

        let store = JsonStore::open(&store_path).unwrap();
        let record = store.get_tenant(TenantId::new(1)).await.unwrap().unwrap();
        assert_eq!(record.owner_id, OwnerId::new(9));
        assert!(record.auto_start);

        let events = Cli::try_parse_from(["tenantd", "--store", store_arg, "events", "2"]).unwrap();
        assert!(matches!(
            events.execute().await,
            Err(TenantError::TenantNotFound(_))
        ));
    }
}
