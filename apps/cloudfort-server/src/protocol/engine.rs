//! Protocol Engine
//!
//! Runs one connection: reads the command line, dispatches it, writes the
//! reply and closes. Every failure is logged and reported to the peer as a
//! single `error: ...` line.
//!
//! Lease transitions that depend on state observed earlier (checkout's
//! claim, finalizing a download, reverting one) are test-and-set writes on
//! the lock table: the replaced token is inspected and put back if it was
//! not the one the handler expected.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use super::command::{error_line, Command, RESP_DOWNLOAD, RESP_PING, RESP_SUCCESS, RESP_UPLOAD};
use crate::error::{LeaseError, Result};
use crate::locks::LockToken;
use crate::state::AppState;
use crate::transfer::{read_frame_header, recv_payload, send_framed};

/// Longest command or hash line accepted from a peer
pub const MAX_LINE_LEN: u64 = 4096;

/// Await `fut`, failing with `LeaseError::Timeout` once `limit` passes
async fn deadline<T, E, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    LeaseError: From<E>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(LeaseError::from),
        Err(_) => Err(LeaseError::Timeout(limit.as_secs())),
    }
}

/// Read one newline-terminated line. `None` means the peer sent nothing.
async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader).take(MAX_LINE_LEN).read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

// ============================================================================
// Engine
// ============================================================================

/// Per-connection command handler
#[derive(Clone)]
pub struct ProtocolEngine {
    state: AppState,
}

impl ProtocolEngine {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve one connection to completion
    pub async fn handle_connection<S>(&self, stream: S, peer: &str)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let line = match deadline(self.state.config().io_timeout(), read_line(&mut reader)).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(peer = %peer, "Peer closed without sending a command");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "Failed to read command");
                let _ = writer.write_all(error_line(&e).as_bytes()).await;
                return;
            }
        };

        let result = match Command::parse(&line) {
            Ok(command) => {
                tracing::debug!(peer = %peer, command = command.verb(), "Received command");
                self.dispatch(command, &mut reader, &mut writer).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::warn!(peer = %peer, kind = ?e.kind(), error = %e, "Command failed");
            if let Err(write_err) = writer.write_all(error_line(&e).as_bytes()).await {
                tracing::debug!(peer = %peer, error = %write_err, "Could not report error to peer");
            }
        }

        let _ = writer.shutdown().await;
    }

    async fn dispatch<R, W>(&self, command: Command, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match command {
            Command::Ping => {
                writer.write_all(format!("{}\n", RESP_PING).as_bytes()).await?;
                Ok(())
            }
            Command::Status => self.status(writer).await,
            Command::Checkout { overseer, world } => self.checkout(writer, &overseer, &world).await,
            Command::Checkin {
                overseer,
                world,
                auth_token,
            } => {
                self.checkin(reader, writer, &overseer, &world, &auth_token)
                    .await
            }
            Command::Release {
                overseer,
                world,
                auth_token,
            } => self.release(writer, &overseer, &world, &auth_token).await,
        }
    }

    // ========================================================================
    // Status
    // ========================================================================

    async fn status<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let snapshot = self.state.locks().snapshot(false).await;
        let json = serde_json::to_string(&snapshot)?;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    // ========================================================================
    // Checkout
    // ========================================================================

    async fn checkout<W>(&self, writer: &mut W, overseer: &str, world: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let config = self.state.config();
        let current = self
            .state
            .locks()
            .get(world)
            .await
            .ok_or_else(|| LeaseError::NotFound(world.to_string()))?;

        let archive = self.state.worlds().archive_path(world);
        if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
            return Err(LeaseError::ArchiveMissing {
                world: world.to_string(),
                path: archive.display().to_string(),
            });
        }
        if !current.is_available() {
            return Err(LeaseError::Unavailable {
                world: world.to_string(),
                status: current.status,
            });
        }

        let (hash, size) = self.state.worlds().archive_digest(world).await?;
        let mut file = tokio::fs::File::open(&archive).await?;

        let now = Utc::now();
        let claim = LockToken::downloading(overseer, now, config.download_time_limit());
        let handed_out = claim.promote_to_checked_out(now, config.check_out_time_limit());
        let token_json = serde_json::to_string(&handed_out)?;

        self.try_claim(world, claim.clone()).await?;
        tracing::info!(world = %world, overseer = %overseer, size = size, "Sending world");

        let streamed = async {
            writer
                .write_all(format!("{}\n{}\n{}\n", RESP_DOWNLOAD, token_json, hash).as_bytes())
                .await?;
            send_framed(&mut file, writer, size).await
        };
        if let Err(e) = deadline(config.transfer_timeout(), streamed).await {
            self.revert_claim(world, overseer, &claim).await;
            return Err(e);
        }

        self.finalize_checkout(world, &claim, handed_out).await?;
        self.state
            .history()
            .record(world, overseer, "World checked out")
            .await;
        tracing::info!(world = %world, overseer = %overseer, "World checked out");

        writer.write_all(format!("{}\n", RESP_SUCCESS).as_bytes()).await?;
        Ok(())
    }

    /// Move `world` from available to `claim`.
    ///
    /// Fails with `Unavailable` if the world was no longer available at the
    /// moment of the write, in which case the previous token is restored.
    pub async fn try_claim(&self, world: &str, claim: LockToken) -> Result<()> {
        let locks = self.state.locks();
        let previous = match locks.set(world, claim).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(world = %world, error = %e, "Claim not persisted, continuing");
                e.into_previous()
            }
        };

        match previous {
            Some(previous) if !previous.is_available() => {
                let status = previous.status;
                if let Err(e) = locks.set(world, previous).await {
                    tracing::error!(world = %world, error = %e, "Failed to restore lease after lost claim");
                }
                Err(LeaseError::Unavailable {
                    world: world.to_string(),
                    status,
                })
            }
            _ => Ok(()),
        }
    }

    /// Swap the download claim for the long-lived lease, if the claim is
    /// still the current token
    async fn finalize_checkout(
        &self,
        world: &str,
        claim: &LockToken,
        handed_out: LockToken,
    ) -> Result<()> {
        let locks = self.state.locks();
        let previous = match locks.set(world, handed_out).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(world = %world, error = %e, "Lease not persisted, continuing");
                e.into_previous()
            }
        };

        match previous {
            Some(previous) if previous.auth_token != claim.auth_token => {
                tracing::warn!(world = %world, "Download claim was reclaimed during the transfer");
                if let Err(e) = locks.set(world, previous).await {
                    tracing::error!(world = %world, error = %e, "Failed to restore lease");
                }
                Err(LeaseError::LeaseLost {
                    world: world.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    async fn revert_claim(&self, world: &str, overseer: &str, claim: &LockToken) {
        let event = format!("Download to {} failed, world returned", overseer);
        let server = &self.state.config().server_overseer_name;
        if let Err(e) = self
            .state
            .release_if_held(world, &claim.auth_token, server, &event)
            .await
        {
            tracing::error!(world = %world, error = %e, "Failed to persist reverted claim");
        }
    }

    // ========================================================================
    // Checkin / Release
    // ========================================================================

    /// Check that `auth_token` holds the lease on `world`
    async fn authorize(&self, world: &str, overseer: &str, auth_token: &str) -> Result<LockToken> {
        let current = self
            .state
            .locks()
            .get(world)
            .await
            .ok_or_else(|| LeaseError::NotFound(world.to_string()))?;

        if current.is_available() {
            return Err(LeaseError::NotCheckedOut(world.to_string()));
        }
        if !current.authorizes(auth_token) {
            return Err(LeaseError::Unauthorized {
                overseer: overseer.to_string(),
                world: world.to_string(),
            });
        }
        Ok(current)
    }

    async fn checkin<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        overseer: &str,
        world: &str,
        auth_token: &str,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        self.authorize(world, overseer, auth_token).await?;

        writer.write_all(format!("{}\n", RESP_UPLOAD).as_bytes()).await?;
        writer.flush().await?;

        let declared = deadline(self.state.config().io_timeout(), read_line(reader))
            .await?
            .map(|line| line.trim().to_string())
            .unwrap_or_default();
        if declared.is_empty() {
            return Err(LeaseError::Protocol("Missing archive hash".to_string()));
        }

        let upload = self.state.worlds().upload_staging_path(world);
        let result = self
            .install_upload(reader, world, overseer, auth_token, &declared, &upload)
            .await;
        if let Err(e) = tokio::fs::remove_file(&upload).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %upload.display(), error = %e, "Could not remove upload");
            }
        }
        result?;

        writer.write_all(format!("{}\n", RESP_SUCCESS).as_bytes()).await?;
        Ok(())
    }

    async fn install_upload<R>(
        &self,
        reader: &mut R,
        world: &str,
        overseer: &str,
        auth_token: &str,
        declared: &str,
        upload: &Path,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let config = self.state.config();
        let worlds = self.state.worlds();

        let len = deadline(config.io_timeout(), read_frame_header(reader)).await?;
        let max = config.world_size_limit_bytes();
        if len > max {
            return Err(LeaseError::TooLarge { size: len, max });
        }

        let mut file = tokio::fs::File::create(upload).await?;
        deadline(config.transfer_timeout(), recv_payload(reader, &mut file, len)).await?;
        drop(file);

        let (actual, _) = worlds.file_digest(upload).await?;
        if actual != declared {
            return Err(LeaseError::HashMismatch {
                declared: declared.to_string(),
                actual,
            });
        }

        let staged = worlds.normalize_upload(world, upload).await?;

        // The lease may have expired while the upload was in flight
        if let Err(e) = self.authorize(world, overseer, auth_token).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(e);
        }

        self.commit_checkin(world, overseer, auth_token, &staged)
            .await
    }

    /// Install `staged` and return the world to available in one step.
    ///
    /// The lease check is the test-and-set in `finish_lease`, made after the
    /// swap. If the lease is gone by then the previous archive is put back,
    /// so the archive on disk always matches the reply.
    pub async fn commit_checkin(
        &self,
        world: &str,
        overseer: &str,
        auth_token: &str,
        staged: &Path,
    ) -> Result<()> {
        let swap = match self.state.worlds().install_archive(world, staged).await {
            Ok(swap) => swap,
            Err(e) => {
                let _ = tokio::fs::remove_file(staged).await;
                return Err(e.into());
            }
        };

        match self
            .finish_lease(world, overseer, auth_token, "World checked in")
            .await
        {
            Err(e @ LeaseError::LeaseLost { .. }) => {
                if let Err(rollback_err) = swap.rollback().await {
                    tracing::error!(world = %world, error = %rollback_err, "Failed to roll back archive");
                }
                Err(e)
            }
            result => {
                swap.commit().await;
                result
            }
        }
    }

    async fn release<W>(
        &self,
        writer: &mut W,
        overseer: &str,
        world: &str,
        auth_token: &str,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.authorize(world, overseer, auth_token).await?;
        self.finish_lease(world, overseer, auth_token, "World released without changes")
            .await?;
        writer.write_all(format!("{}\n", RESP_SUCCESS).as_bytes()).await?;
        Ok(())
    }

    async fn finish_lease(
        &self,
        world: &str,
        overseer: &str,
        auth_token: &str,
        event: &str,
    ) -> Result<()> {
        if self
            .state
            .release_if_held(world, auth_token, overseer, event)
            .await?
        {
            Ok(())
        } else {
            Err(LeaseError::LeaseLost {
                world: world.to_string(),
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
