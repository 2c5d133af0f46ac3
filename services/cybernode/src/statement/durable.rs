use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::ServiceStatementManager;
use crate::model::{ServiceElement, ServiceStatement};
use crate::scheduler::{TaskScheduler, Ticket};

/// How often expired statements are swept.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const STATEMENT_EXTENSION: &str = "json";
const MAX_PREFIX_LEN: usize = 48;

/// Writers to any statement directory in this process are serialized.
static STATEMENT_LOCK: RwLock<()> = RwLock::const_new(());

/// File name for the statement of `(opstring_name, name)`.
///
/// A readable prefix for operators, followed by a digest so names that
/// sanitize to the same prefix never collide.
pub fn statement_file_name(opstring_name: &str, name: &str) -> String {
    let prefix: String = format!("{opstring_name}-{name}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_PREFIX_LEN)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(opstring_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    let digest = hex::encode(&hasher.finalize()[..12]);

    format!("{prefix}.{digest}.{STATEMENT_EXTENSION}")
}

/// Statement manager backed by one JSON file per element.
pub struct DurableStatementManager {
    dir: PathBuf,
    retention: Option<Duration>,
}

impl DurableStatementManager {
    /// Open (creating if needed) a statement directory.
    ///
    /// `retention` of `None` keeps statements forever.
    pub async fn open(dir: impl Into<PathBuf>, retention: Option<Duration>) -> io::Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!(
            dir = %dir.display(),
            retention_secs = retention.map(|r| r.as_secs()),
            "Opened durable statement store"
        );
        Ok(Self { dir, retention })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, element: &ServiceElement) -> PathBuf {
        self.dir
            .join(statement_file_name(&element.opstring_name, &element.name))
    }

    /// Delete statements older than the retention window that hold no active
    /// records. Returns the number of files removed.
    pub async fn sweep(&self) -> usize {
        let Some(retention) = self.retention else {
            debug!("Statement retention disabled, skipping sweep");
            return 0;
        };

        let _guard = STATEMENT_LOCK.write().await;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list statements");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read statement directory entry");
                    break;
                }
            };
            let path = entry.path();
            if !is_statement_file(&path) {
                continue;
            }

            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to stat statement");
                    continue;
                }
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= retention {
                continue;
            }

            match read_statement(&path).await {
                Ok(Some(statement)) if statement.has_active_service_records() => {
                    debug!(path = %path.display(), "Expired statement still active, keeping");
                }
                Ok(_) => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!(path = %path.display(), age_secs = age.as_secs(), "Removed expired statement");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove statement"),
                },
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable statement"),
            }
        }

        if removed > 0 {
            info!(removed, "Swept expired service statements");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every [`SWEEP_INTERVAL`].
    pub fn start_sweeper(self: &Arc<Self>, scheduler: &TaskScheduler) -> Ticket {
        let manager = Arc::clone(self);
        scheduler.schedule_repeating(SWEEP_INTERVAL, move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.sweep().await;
            }
        })
    }
}

fn is_statement_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(STATEMENT_EXTENSION)
}

async fn read_statement(path: &Path) -> io::Result<Option<ServiceStatement>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[async_trait]
impl ServiceStatementManager for DurableStatementManager {
    async fn get_all(&self) -> Vec<ServiceStatement> {
        let _guard = STATEMENT_LOCK.read().await;
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "Failed to list statements");
                return Vec::new();
            }
        };

        let mut statements = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !is_statement_file(&path) {
                continue;
            }
            match read_statement(&path).await {
                Ok(Some(statement)) => statements.push(statement),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable statement"),
            }
        }
        statements
    }

    async fn get(&self, element: &ServiceElement) -> Option<ServiceStatement> {
        let path = self.path_for(element);
        let _guard = STATEMENT_LOCK.read().await;
        match read_statement(&path).await {
            Ok(statement) => statement,
            Err(e) => {
                warn!(element = %element, path = %path.display(), error = %e, "Failed to read statement");
                None
            }
        }
    }

    async fn record(&self, statement: &ServiceStatement) {
        let path = self.path_for(&statement.element);
        let bytes = match serde_json::to_vec_pretty(statement) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(element = %statement.element, error = %e, "Failed to serialize statement");
                return;
            }
        };

        let _guard = STATEMENT_LOCK.write().await;
        let tmp = path.with_extension("tmp");
        let result = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        match result {
            Ok(()) => debug!(
                element = %statement.element,
                records = statement.service_records().len(),
                "Recorded service statement"
            ),
            Err(e) => {
                warn!(element = %statement.element, path = %path.display(), error = %e, "Failed to write statement");
                let _ = tokio::fs::remove_file(&tmp).await;
            }
        }
    }

    async fn terminate(&self) {
        debug!(dir = %self.dir.display(), "Durable statement store closed");
    }
}
