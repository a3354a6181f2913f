//! Token persistence
//!
//! Each world's lock token is mirrored to a `<world>.dftk` JSON record that
//! sits next to the world's archive.

use std::path::{Path, PathBuf};

use super::token::LockToken;

/// File suffix of persisted token records
pub const TOKEN_RECORD_SUFFIX: &str = "dftk";

/// Token persistence errors
#[derive(Debug, thiserror::Error)]
pub enum TokenStoreError {
    #[error("Token record I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Token record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Store Trait
// ============================================================================

/// Durable sink for lock tokens
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    /// Persist the token for `world`, replacing any previous record
    async fn save(&self, world: &str, token: &LockToken) -> Result<(), TokenStoreError>;
}

// ============================================================================
// File Store
// ============================================================================

/// Writes one pretty-printed JSON record per world
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_path(&self, world: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", world, TOKEN_RECORD_SUFFIX))
    }
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn save(&self, world: &str, token: &LockToken) -> Result<(), TokenStoreError> {
        let path = self.record_path(world);
        let json = serde_json::to_vec_pretty(token)?;

        // Write-then-rename so a crash never leaves a half-written record
        let tmp = path.with_extension(format!("{}.tmp", TOKEN_RECORD_SUFFIX));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(world = %world, status = %token.status, "Persisted lock token");
        Ok(())
    }
}

/// Read a token record from disk
pub async fn read_record(path: &Path) -> Result<LockToken, TokenStoreError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ============================================================================
// Tests
// ============================================================================
