//! Evidence store: append-only log of incidents and delivery attempts.
//!
//! Every state change of an incident is appended as a full snapshot, so the
//! latest entry for an id is its current state and the history stays intact.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::models::{DeliveryAttempt, Incident, IncidentRecord, IncidentState};

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn record(&self, incident: &Incident) -> anyhow::Result<()>;

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> anyhow::Result<()>;

    /// The incident that holds, or last held, the active slot: the most
    /// recent incident that was not suppressed, in its latest state.
    async fn latest_for_active_incident(&self) -> anyhow::Result<Option<Incident>>;

    async fn incident(&self, id: Uuid) -> anyhow::Result<Option<IncidentRecord>>;

    /// All incidents in confirmation order.
    async fn incidents(&self) -> anyhow::Result<Vec<IncidentRecord>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogEntry {
    Incident(Incident),
    Attempt(DeliveryAttempt),
}

fn latest_active(entries: &[LogEntry]) -> Option<Incident> {
    entries.iter().rev().find_map(|entry| match entry {
        LogEntry::Incident(incident) if incident.state != IncidentState::Suppressed => {
            Some(incident.clone())
        }
        _ => None,
    })
}

fn fold_records(entries: &[LogEntry]) -> Vec<IncidentRecord> {
    let mut records: Vec<IncidentRecord> = Vec::new();
    for entry in entries {
        match entry {
            LogEntry::Incident(incident) => {
                match records.iter_mut().find(|r| r.incident.id == incident.id) {
                    Some(record) => record.incident = incident.clone(),
                    None => records.push(IncidentRecord {
                        incident: incident.clone(),
                        attempts: Vec::new(),
                    }),
                }
            }
            LogEntry::Attempt(attempt) => {
                if let Some(record) = records
                    .iter_mut()
                    .find(|r| r.incident.id == attempt.incident_id)
                {
                    record.attempts.push(attempt.clone());
                }
            }
        }
    }
    records
}

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<Vec<LogEntry>>,
}

impl MemoryStore {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries(entries: Vec<LogEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    async fn push(&self, entry: LogEntry) {
        self.entries.write().await.push(entry);
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl EvidenceStore for MemoryStore {
    async fn record(&self, incident: &Incident) -> anyhow::Result<()> {
        self.push(LogEntry::Incident(incident.clone())).await;
        Ok(())
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> anyhow::Result<()> {
        self.push(LogEntry::Attempt(attempt.clone())).await;
        Ok(())
    }

    async fn latest_for_active_incident(&self) -> anyhow::Result<Option<Incident>> {
        Ok(latest_active(&self.entries.read().await))
    }

    async fn incident(&self, id: Uuid) -> anyhow::Result<Option<IncidentRecord>> {
        let entries = self.entries.read().await;
        Ok(fold_records(&entries)
            .into_iter()
            .find(|r| r.incident.id == id))
    }

    async fn incidents(&self) -> anyhow::Result<Vec<IncidentRecord>> {
        Ok(fold_records(&self.entries.read().await))
    }
}

/// JSON-lines file store; one entry per line, reloaded on open.
pub struct JsonlStore {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    index: MemoryStore,
}

impl JsonlStore {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let mut entries = Vec::new();
        if tokio::fs::try_exists(path).await? {
            let contents = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read evidence log {}", path.display()))?;
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: LogEntry = serde_json::from_str(line).with_context(|| {
                    format!("corrupt evidence log {} at line {}", path.display(), line_no + 1)
                })?;
                entries.push(entry);
            }
        } else if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open evidence log {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            index: MemoryStore::with_entries(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: LogEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        {
            let mut file = self.file.lock().await;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
        }
        self.index.push(entry).await;
        Ok(())
    }
}

#[async_trait]
impl EvidenceStore for JsonlStore {
    async fn record(&self, incident: &Incident) -> anyhow::Result<()> {
        self.append(LogEntry::Incident(incident.clone())).await
    }

    async fn append_attempt(&self, attempt: &DeliveryAttempt) -> anyhow::Result<()> {
        self.append(LogEntry::Attempt(attempt.clone())).await
    }

    async fn latest_for_active_incident(&self) -> anyhow::Result<Option<Incident>> {
        self.index.latest_for_active_incident().await
    }

    async fn incident(&self, id: Uuid) -> anyhow::Result<Option<IncidentRecord>> {
        self.index.incident(id).await
    }

    async fn incidents(&self) -> anyhow::Result<Vec<IncidentRecord>> {
        self.index.incidents().await
    }
}
