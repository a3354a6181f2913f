//! Lease expiry monitor
//!
//! Periodically returns worlds whose lease has run out (or whose expiry
//! cannot be read) to the available state.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::state::AppState;

/// Background task that reclaims expired leases
pub struct LeaseExpiryMonitor {
    state: AppState,
    period: Duration,
}

impl LeaseExpiryMonitor {
    pub fn new(state: AppState) -> Self {
        let period = state.config().expiry_check_interval();
        Self { state, period }
    }

    /// Start sweeping. The task runs until it is aborted.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.sweep(Utc::now()).await;
            }
        })
    }

    /// Reclaim every lease that expired before `now`. Returns the worlds
    /// that were returned to the available state.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let server = self.state.config().server_overseer_name.clone();
        let mut reclaimed = Vec::new();

        for (world, token) in self.state.locks().snapshot(true).await {
            if token.is_available() {
                continue;
            }

            let event = match token.expires_at() {
                Ok(expires) if now <= expires => continue,
                Ok(_) => format!(
                    "Lease for {} expired ({})",
                    token.current_overseer, token.status
                ),
                Err(e) => format!(
                    "Lease for {} had an unreadable expiry '{}': {}",
                    token.current_overseer, token.expires, e
                ),
            };

            tracing::info!(world = %world, overseer = %token.current_overseer, "Reclaiming lease");
            match self
                .state
                .release_if_held(&world, &token.auth_token, &server, &event)
                .await
            {
                Ok(true) => reclaimed.push(world),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(world = %world, error = %e, "Reclaimed lease was not persisted");
                    reclaimed.push(world);
                }
            }
        }

        let diverged = self.state.locks().diverged_worlds().await;
        if !diverged.is_empty() {
            tracing::warn!(worlds = ?diverged, "Lock tokens differ from their persisted records");
        }

        reclaimed
    }
}
