//! History ledger
//!
//! Append-only CSV record of every lease transition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Ledger file name inside the save folder
pub const HISTORY_FILE_NAME: &str = "history.csv";

const HEADER: &str = "Time,World,Overseer,Event\n";

/// Shared handle to the ledger file
#[derive(Clone)]
pub struct HistoryLedger {
    inner: Arc<HistoryLedgerInner>,
}

struct HistoryLedgerInner {
    path: PathBuf,
    /// Serializes appends so rows never interleave
    write_lock: Mutex<()>,
}

fn quote(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

impl HistoryLedger {
    /// Open the ledger at `path`, writing the header if the file is new
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if !tokio::fs::try_exists(&path).await? {
            tokio::fs::write(&path, HEADER).await?;
        }
        Ok(Self {
            inner: Arc::new(HistoryLedgerInner {
                path,
                write_lock: Mutex::new(()),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Append one row
    pub async fn append(
        &self,
        at: DateTime<Utc>,
        world: &str,
        overseer: &str,
        event: &str,
    ) -> std::io::Result<()> {
        let line = format!(
            "{},{},{},{}\n",
            at.to_rfc3339(),
            quote(world),
            quote(overseer),
            quote(event)
        );

        let _guard = self.inner.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.inner.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Append one row, logging instead of failing
    pub async fn record(&self, world: &str, overseer: &str, event: &str) {
        if let Err(e) = self.append(Utc::now(), world, overseer, event).await {
            tracing::warn!(
                world = %world,
                error = %e,
                path = %self.inner.path.display(),
                "Failed to write history line"
            );
        }
    }
}
