use super::{EventLevel, TenantEvent, TenantRecord, TenantStatus, TenantStore, UsageUpdate};
use crate::error::{Result, TenantError};
use crate::process::{OwnerId, TenantId};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Version of the store file format
const STORE_VERSION: &str = "1.0.0";

/// Longest event message kept, in characters
const MAX_EVENT_MESSAGE_CHARS: usize = 1000;

/// Events retained per tenant
const MAX_EVENTS_PER_TENANT: usize = 500;

/// Complete store contents that get persisted to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    version: String,
    tenants: BTreeMap<TenantId, TenantRecord>,
    #[serde(default)]
    events: HashMap<TenantId, VecDeque<TenantEvent>>,
    #[serde(default)]
    recoveries: HashMap<OwnerId, NaiveDate>,
}

impl StoreState {
    fn new() -> Self {
        Self {
            version: STORE_VERSION.to_string(),
            tenants: BTreeMap::new(),
            events: HashMap::new(),
            recoveries: HashMap::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.version != STORE_VERSION {
            return Err(TenantError::StoreCorruption(format!(
                "Incompatible store version: expected {}, found {}",
                STORE_VERSION, self.version
            )));
        }

        for (key, record) in &self.tenants {
            if *key != record.id {
                return Err(TenantError::StoreCorruption(format!(
                    "Tenant stored under {} carries id {}",
                    key, record.id
                )));
            }
        }

        let mut seen_pids = HashSet::new();
        for record in self.tenants.values() {
            if record.status == TenantStatus::Running {
                if let Some(pid) = record.pid {
                    if !seen_pids.insert(pid) {
                        return Err(TenantError::StoreCorruption(format!(
                            "Duplicate pid {} across running tenants",
                            pid
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn tenant_mut(&mut self, id: TenantId) -> Result<&mut TenantRecord> {
        self.tenants
            .get_mut(&id)
            .ok_or(TenantError::TenantNotFound(id))
    }
}

/// Tenant store held in memory and optionally mirrored to a JSON file
pub struct JsonStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonStore {
    /// Store that never touches the disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::new()),
        }
    }

    /// Open (or create) a store file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = Self::load(&path)?;

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    fn load(path: &Path) -> Result<StoreState> {
        if !path.exists() {
            return Ok(StoreState::new());
        }

        let file = File::open(path)
            .map_err(|e| TenantError::StoreLoad(format!("Failed to open store file: {}", e)))?;

        let state: StoreState = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| TenantError::StoreLoad(format!("Failed to parse store file: {}", e)))?;

        state.validate()?;

        Ok(state)
    }

    /// Write to a temporary file then rename over the real one
    fn save(&self, state: &StoreState) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    TenantError::StoreSave(format!("Failed to create store directory: {}", e))
                })?;
            }
        }

        let temp_path = path.with_extension("tmp");

        {
            let file = File::create(&temp_path).map_err(|e| {
                TenantError::StoreSave(format!("Failed to create temp store file: {}", e))
            })?;

            let mut writer = BufWriter::new(file);

            serde_json::to_writer_pretty(&mut writer, state)
                .map_err(|e| TenantError::StoreSave(format!("Failed to serialize store: {}", e)))?;

            writer
                .flush()
                .map_err(|e| TenantError::StoreSave(format!("Failed to flush store file: {}", e)))?;
        }

        fs::rename(&temp_path, path).map_err(|e| {
            TenantError::StoreSave(format!("Failed to rename temp store file: {}", e))
        })?;

        Ok(())
    }

    /// Apply a mutation under the lock and persist the result
    async fn mutate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut StoreState) -> Result<()>,
    {
        let mut state = self.state.lock().await;
        f(&mut state)?;
        self.save(&state)
    }
}

#[async_trait]
impl TenantStore for JsonStore {
    async fn get_tenant(&self, id: TenantId) -> Result<Option<TenantRecord>> {
        Ok(self.state.lock().await.tenants.get(&id).cloned())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantRecord>> {
        Ok(self.state.lock().await.tenants.values().cloned().collect())
    }

    async fn put_tenant(&self, record: TenantRecord) -> Result<()> {
        self.mutate(|state| {
            state.tenants.insert(record.id, record);
            Ok(())
        })
        .await
    }

    async fn update_status(
        &self,
        id: TenantId,
        status: TenantStatus,
        pid: Option<u32>,
    ) -> Result<()> {
        self.mutate(|state| {
            let record = state.tenant_mut(id)?;
            record.status = status;
            record.pid = pid;
            Ok(())
        })
        .await
    }

    async fn update_usage(&self, id: TenantId, update: UsageUpdate) -> Result<()> {
        self.mutate(|state| {
            update.apply(state.tenant_mut(id)?);
            Ok(())
        })
        .await
    }

    async fn set_sleep(&self, id: TenantId, reason: &str) -> Result<()> {
        self.mutate(|state| {
            let record = state.tenant_mut(id)?;
            record.status = TenantStatus::Sleeping;
            record.sleep_reason = Some(reason.to_string());
            record.pid = None;
            record.started_at_timestamp = None;
            Ok(())
        })
        .await
    }

    async fn clear_sleep(&self, id: TenantId) -> Result<()> {
        self.mutate(|state| {
            let record = state.tenant_mut(id)?;
            if record.status == TenantStatus::Sleeping {
                record.status = TenantStatus::Stopped;
            }
            record.sleep_reason = None;
            Ok(())
        })
        .await
    }

    async fn append_event(
        &self,
        id: TenantId,
        level: EventLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let message: String = message.chars().take(MAX_EVENT_MESSAGE_CHARS).collect();

        self.mutate(|state| {
            let events = state.events.entry(id).or_default();
            events.push_back(TenantEvent {
                tenant_id: id,
                level,
                message,
                timestamp,
            });
            while events.len() > MAX_EVENTS_PER_TENANT {
                events.pop_front();
            }
            Ok(())
        })
        .await
    }

    async fn recent_events(&self, id: TenantId, limit: usize) -> Result<Vec<TenantEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .get(&id)
            .map(|events| events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn last_recovery_date(&self, owner: OwnerId) -> Result<Option<NaiveDate>> {
        Ok(self.state.lock().await.recoveries.get(&owner).copied())
    }

    async fn record_recovery(&self, owner: OwnerId, date: NaiveDate) -> Result<()> {
        self.mutate(|state| {
            state.recoveries.insert(owner, date);
            Ok(())
        })
        .await
    }
}
