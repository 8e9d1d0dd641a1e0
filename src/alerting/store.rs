/// Alert persistence - bounded in-memory log or append-only JSON lines file
use std::collections::VecDeque;
use std::path::PathBuf;

use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::types::Alert;

pub trait AlertStore: Send + Sync {
    fn insert_alert(&self, alert: Alert) -> BoxFuture<'_, Result<()>>;

    /// Up to `limit` alerts, most recent first
    fn get_recent_alerts(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Alert>>>;
}

pub struct InMemoryAlertStore {
    alerts: RwLock<VecDeque<Alert>>,
    capacity: usize,
}

impl InMemoryAlertStore {
    pub fn new(capacity: usize) -> Self {
        InMemoryAlertStore {
            alerts: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl AlertStore for InMemoryAlertStore {
    fn insert_alert(&self, alert: Alert) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut alerts = self.alerts.write().await;
            alerts.push_back(alert);
            while alerts.len() > self.capacity {
                alerts.pop_front();
            }
            Ok(())
        })
    }

    fn get_recent_alerts(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Alert>>> {
        Box::pin(async move {
            let alerts = self.alerts.read().await;
            Ok(alerts.iter().rev().take(limit).cloned().collect())
        })
    }
}

/// One JSON object per line, synced after every write
pub struct JsonlAlertStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlAlertStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonlAlertStore {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl AlertStore for JsonlAlertStore {
    fn insert_alert(&self, alert: Alert) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            use tokio::fs::OpenOptions;
            use tokio::io::AsyncWriteExt;

            let json_line = serde_json::to_string(&alert)
                .map_err(|e| FlowError::Persistence(format!("Alert serialization failed: {}", e)))?;

            let _guard = self.write_lock.lock().await;

            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;

            file.write_all(format!("{}\n", json_line).as_bytes()).await?;
            file.sync_all().await?;

            Ok(())
        })
    }

    fn get_recent_alerts(&self, limit: usize) -> BoxFuture<'_, Result<Vec<Alert>>> {
        Box::pin(async move {
            use tokio::fs::File;
            use tokio::io::{AsyncBufReadExt, BufReader};

            let file = match File::open(&self.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };

            let mut lines = BufReader::new(file).lines();
            let mut window = VecDeque::with_capacity(limit.min(1_024));

            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Alert>(&line) {
                    Ok(alert) => {
                        window.push_back(alert);
                        if window.len() > limit {
                            window.pop_front();
                        }
                    }
                    Err(e) => debug!("Skipping unreadable alert line: {}", e),
                }
            }

            Ok(window.into_iter().rev().collect())
        })
    }
}
