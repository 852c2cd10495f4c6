//! Task-record backups and retention.
//!
//! A backup is one JSON file, `backup_<timestamp>.json`, holding every task
//! record. Only the newest `max_count` files are kept. The maintenance loop
//! also prunes terminal tasks past the retention window.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::BackupConfig;
use crate::error::DatabaseError;
use crate::queue::task::Task;
use crate::store::TaskStore;

const BACKUP_PREFIX: &str = "backup_";
const BACKUP_SUFFIX: &str = ".json";

/// How often the maintenance loop runs.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// On-disk backup document.
#[derive(Debug, Serialize, Deserialize)]
pub struct BackupFile {
    pub created_at: DateTime<Utc>,
    pub version: String,
    pub tasks: Vec<Task>,
}

pub struct BackupManager {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, config: BackupConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Write a backup of every task and drop the oldest files beyond the limit.
    pub async fn create_backup(&self) -> Result<PathBuf, DatabaseError> {
        let now = self.clock.now();
        let tasks = self.store.all_tasks().await?;
        let count = tasks.len();
        let file = BackupFile {
            created_at: now,
            version: env!("CARGO_PKG_VERSION").to_string(),
            tasks,
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| DatabaseError::Serialization(format!("backup: {e}")))?;

        tokio::fs::create_dir_all(&self.config.dir).await?;
        let name = format!(
            "{BACKUP_PREFIX}{}{BACKUP_SUFFIX}",
            now.format("%Y%m%d_%H%M%S_%3f")
        );
        let path = self.config.dir.join(name);
        // Renamed into place once complete.
        let partial = path.with_extension("json.partial");
        tokio::fs::write(&partial, &json).await?;
        tokio::fs::rename(&partial, &path).await?;
        tracing::info!(path = %path.display(), tasks = count, "Backup written");

        let removed = self.prune_backups().await?;
        if removed > 0 {
            tracing::debug!(removed, "Old backups removed");
        }
        Ok(path)
    }

    /// Backup files, oldest first.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>, DatabaseError> {
        let mut entries = match tokio::fs::read_dir(&self.config.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX) {
                files.push(entry.path());
            }
        }
        // Timestamped names sort chronologically.
        files.sort();
        Ok(files)
    }

    pub async fn load(path: &Path) -> Result<BackupFile, DatabaseError> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| DatabaseError::Serialization(format!("backup {}: {e}", path.display())))
    }

    /// Delete terminal tasks older than the retention window.
    pub async fn cleanup(&self) -> Result<u64, DatabaseError> {
        let retention = chrono::Duration::from_std(self.config.task_retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self.clock.now() - retention;
        let pruned = self.store.prune_terminal(cutoff).await?;
        if pruned > 0 {
            tracing::info!(pruned, cutoff = %cutoff, "Old tasks pruned");
        }
        Ok(pruned)
    }

    /// Back up (when enabled) and clean up on a fixed interval.
    pub fn spawn_maintenance(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            // The first tick fires immediately.
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if self.config.enabled {
                            if let Err(e) = self.create_backup().await {
                                tracing::error!(error = %e, "Scheduled backup failed");
                            }
                        }
                        if let Err(e) = self.cleanup().await {
                            tracing::warn!(error = %e, "Task cleanup failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn prune_backups(&self) -> Result<usize, DatabaseError> {
        let files = self.list_backups().await?;
        let excess = files.len().saturating_sub(self.config.max_count);
        for path in &files[..excess] {
            tokio::fs::remove_file(path).await?;
        }
        Ok(excess)
    }
}
