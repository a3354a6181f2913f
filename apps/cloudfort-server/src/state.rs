//! Application state management

use std::sync::Arc;

use chrono::Utc;

use crate::audit::HistoryLedger;
use crate::config::Config;
use crate::locks::{LockManager, LockToken, PersistError};
use crate::world::WorldStore;

/// Shared server state, cloned into every connection task and the monitor
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    locks: LockManager,
    worlds: WorldStore,
    history: HistoryLedger,
}

impl AppState {
    pub fn new(config: Config, locks: LockManager, worlds: WorldStore, history: HistoryLedger) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                locks,
                worlds,
                history,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the lock table
    pub fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Get the world store
    pub fn worlds(&self) -> &WorldStore {
        &self.inner.worlds
    }

    /// Get the history ledger
    pub fn history(&self) -> &HistoryLedger {
        &self.inner.history
    }

    /// Return a world to the available state if `held_auth` still holds it.
    ///
    /// Shared by checkin, release, failed downloads and lease expiry. If the
    /// lease changed hands since the caller looked, the newer lease is put
    /// back and `Ok(false)` is returned. History is written only for
    /// transitions that stuck.
    pub async fn release_if_held(
        &self,
        world: &str,
        held_auth: &str,
        overseer: &str,
        event: &str,
    ) -> Result<bool, PersistError> {
        let token = LockToken::available(overseer, Utc::now());

        let (previous, persist_err) = match self.inner.locks.set(world, token).await {
            Ok(previous) => (previous, None),
            Err(e) => (e.previous.clone(), Some(e)),
        };

        if let Some(newer) = previous.filter(|p| p.auth_token != held_auth) {
            tracing::warn!(
                world = %world,
                holder = %newer.current_overseer,
                "Lease changed hands, leaving it with its new holder"
            );
            if let Err(e) = self.inner.locks.set(world, newer).await {
                tracing::error!(world = %world, error = %e, "Failed to restore lease");
            }
            return Ok(false);
        }

        match persist_err {
            None => {
                self.inner.history.record(world, overseer, event).await;
                tracing::info!(world = %world, overseer = %overseer, "World is available");
                Ok(true)
            }
            Some(e) => {
                self.inner
                    .history
                    .record(world, overseer, &format!("World state could not be saved: {}", e))
                    .await;
                Err(e)
            }
        }
    }
}
