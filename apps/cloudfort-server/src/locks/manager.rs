//! Lock Manager
//!
//! Authoritative map of world name to lock token. Every read and write goes
//! through one mutex, and `set` flushes the new token to the token store
//! before the mutex is released.
//!
//! `set` hands back the token it replaced. Callers use that to detect
//! whether the state they observed before writing still held (checkout's
//! test-and-set) and to undo their write if it did not.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::store::{TokenStore, TokenStoreError};
use super::token::LockToken;

/// The in-memory token changed but the durable write failed.
///
/// Memory and disk now disagree for `world` until a later `set` succeeds.
#[derive(Debug, thiserror::Error)]
#[error("Lock token for world {world} was updated in memory but not persisted: {source}")]
pub struct PersistError {
    pub world: String,
    /// Token that was replaced, so test-and-set still works on this path
    pub previous: Option<LockToken>,
    #[source]
    pub source: TokenStoreError,
}

impl PersistError {
    pub fn into_previous(self) -> Option<LockToken> {
        self.previous
    }
}

// ============================================================================
// Lock Manager
// ============================================================================

/// Shared handle to the lock table
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
}

struct LockManagerInner {
    state: Mutex<LockTable>,
    store: Box<dyn TokenStore>,
}

struct LockTable {
    tokens: HashMap<String, LockToken>,

    /// Worlds whose last durable write failed
    diverged: HashSet<String>,
}

impl LockManager {
    /// Create a manager seeded with tokens reconciled from disk
    pub fn new(store: impl TokenStore + 'static, tokens: HashMap<String, LockToken>) -> Self {
        Self {
            inner: Arc::new(LockManagerInner {
                state: Mutex::new(LockTable {
                    tokens,
                    diverged: HashSet::new(),
                }),
                store: Box::new(store),
            }),
        }
    }

    /// Point lookup
    pub async fn get(&self, world: &str) -> Option<LockToken> {
        let table = self.inner.state.lock().await;
        table.tokens.get(world).cloned()
    }

    /// Replace the token for `world` and persist it.
    ///
    /// Returns the replaced token. On a persistence failure the in-memory
    /// value has still changed; the error carries the replaced token.
    pub async fn set(
        &self,
        world: &str,
        token: LockToken,
    ) -> Result<Option<LockToken>, PersistError> {
        let mut table = self.inner.state.lock().await;
        let previous = table.tokens.insert(world.to_string(), token.clone());

        match self.inner.store.save(world, &token).await {
            Ok(()) => {
                table.diverged.remove(world);
                Ok(previous)
            }
            Err(source) => {
                table.diverged.insert(world.to_string());
                tracing::error!(
                    world = %world,
                    error = %source,
                    "Lock token diverged from its persisted record"
                );
                Err(PersistError {
                    world: world.to_string(),
                    previous,
                    source,
                })
            }
        }
    }

    /// Copy of every entry. Secrets are blanked unless `reveal_secret`.
    pub async fn snapshot(&self, reveal_secret: bool) -> BTreeMap<String, LockToken> {
        let table = self.inner.state.lock().await;
        table
            .tokens
            .iter()
            .map(|(world, token)| {
                let token = if reveal_secret {
                    token.clone()
                } else {
                    token.redacted()
                };
                (world.clone(), token)
            })
            .collect()
    }

    /// Worlds whose in-memory token is not reflected on disk
    pub async fn diverged_worlds(&self) -> Vec<String> {
        let table = self.inner.state.lock().await;
        let mut worlds: Vec<String> = table.diverged.iter().cloned().collect();
        worlds.sort();
        worlds
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::store::FileTokenStore;
    use crate::locks::token::{LockStatus, SENTINEL_AUTH_TOKEN};
    use chrono::{Duration, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    /// Store whose writes can be switched off
    struct FlakyStore {
        failing: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl TokenStore for FlakyStore {
        async fn save(&self, _world: &str, _token: &LockToken) -> Result<(), TokenStoreError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(TokenStoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )))
            } else {
                Ok(())
            }
        }
    }

    fn seeded(dir: &TempDir) -> LockManager {
        let mut tokens = HashMap::new();
        tokens.insert("embark1".to_string(), LockToken::available("<Server>", Utc::now()));
        LockManager::new(FileTokenStore::new(dir.path()), tokens)
    }

    #[tokio::test]
    async fn test_get_known_and_unknown() {
        let temp_dir = TempDir::new().unwrap();
        let manager = seeded(&temp_dir);

        assert!(manager.get("embark1").await.is_some());
        assert!(manager.get("nowhere").await.is_none());
    }

    #[tokio::test]
    async fn test_set_returns_previous_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let manager = seeded(&temp_dir);
        let claim = LockToken::downloading("urist", Utc::now(), Duration::minutes(30));

        let previous = manager.set("embark1", claim.clone()).await.unwrap();
        assert_eq!(previous.unwrap().status, LockStatus::Available);
        assert_eq!(manager.get("embark1").await.unwrap(), claim);

        let on_disk =
            crate::locks::store::read_record(&temp_dir.path().join("embark1.dftk"))
                .await
                .unwrap();
        assert_eq!(on_disk, claim);
    }

    #[tokio::test]
    async fn test_snapshot_redacts_secret() {
        let temp_dir = TempDir::new().unwrap();
        let manager = seeded(&temp_dir);
        let claim = LockToken::downloading("urist", Utc::now(), Duration::minutes(30));
        manager.set("embark1", claim.clone()).await.unwrap();

        let public = manager.snapshot(false).await;
        assert_eq!(public["embark1"].auth_token, "");
        assert_eq!(public["embark1"].status, LockStatus::Downloading);

        let private = manager.snapshot(true).await;
        assert_eq!(private["embark1"].auth_token, claim.auth_token);
    }

    #[tokio::test]
    async fn test_racing_sets_see_each_other() {
        let temp_dir = TempDir::new().unwrap();
        let manager = seeded(&temp_dir);
        let now = Utc::now();

        let first = manager
            .set("embark1", LockToken::downloading("a", now, Duration::minutes(1)))
            .await
            .unwrap();
        let second = manager
            .set("embark1", LockToken::downloading("b", now, Duration::minutes(1)))
            .await
            .unwrap();

        // Only the first writer observed "available"
        assert!(first.unwrap().is_available());
        assert!(!second.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_memory_diverged() {
        let failing = Arc::new(AtomicBool::new(true));
        let mut tokens = HashMap::new();
        tokens.insert("embark1".to_string(), LockToken::available("<Server>", Utc::now()));
        let manager = LockManager::new(FlakyStore { failing: failing.clone() }, tokens);

        let claim = LockToken::downloading("urist", Utc::now(), Duration::minutes(30));
        let err = manager.set("embark1", claim.clone()).await.unwrap_err();

        // The write is visible in memory even though disk rejected it
        assert_eq!(err.world, "embark1");
        assert_eq!(err.into_previous().unwrap().auth_token, SENTINEL_AUTH_TOKEN);
        assert_eq!(manager.get("embark1").await.unwrap(), claim);
        assert_eq!(manager.diverged_worlds().await, vec!["embark1".to_string()]);

        // A later successful write clears the mark
        failing.store(false, Ordering::SeqCst);
        manager
            .set("embark1", LockToken::available("<Server>", Utc::now()))
            .await
            .unwrap();
        assert!(manager.diverged_worlds().await.is_empty());
    }
}
