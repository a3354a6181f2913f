//! Client library
//!
//! Speaks the CloudFort protocol from the overseer's side: lists worlds,
//! downloads a world into a working copy, uploads it back, or gives the
//! lease up. A checked-out working copy carries a `token.dftk` sidecar so
//! a client that crashed can find its leases again with
//! [`pending_checkouts`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::locks::{read_record, LockToken, TokenStoreError};
use crate::protocol::{
    Command, MAX_LINE_LEN, RESP_DOWNLOAD, RESP_ERROR, RESP_PING, RESP_SUCCESS, RESP_UPLOAD,
};
use crate::transfer::{recv_framed, send_framed};
use crate::world::{extract_subset, find_archive_root, hash_file, pack_subset, SaveFilter, StoreError};

/// Characters an overseer name may not contain
const FORBIDDEN_NAME_CHARS: [char; 7] = [':', ';', '/', '\\', '\n', '\t', '%'];

/// Default deadline for connecting and for single reply lines
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Sidecar file name inside a checked-out working copy
pub const CHECKOUT_TOKEN_FILE: &str = "token.dftk";

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed reply: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected reply from server: '{0}'")]
    UnexpectedReply(String),

    #[error("Downloaded archive is corrupt: expected hash {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    #[error("Archive error: {0}")]
    Store(#[from] StoreError),

    #[error("Token record error: {0}")]
    TokenRecord(#[from] TokenStoreError),

    #[error("Cannot check out into {0}: folder already exists")]
    WorkingCopyExists(PathBuf),

    #[error("Overseer name '{0}' is not acceptable")]
    InvalidName(String),
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(e: tokio::task::JoinError) -> Self {
        ClientError::Store(StoreError::from(e))
    }
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Reject names that are empty or would break the command line format
pub fn validate_overseer_name(name: &str) -> ClientResult<()> {
    if name.is_empty() || name.contains(&FORBIDDEN_NAME_CHARS[..]) {
        return Err(ClientError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ============================================================================
// Working Copies
// ============================================================================

/// A world downloaded into a local folder
#[derive(Debug, Clone)]
pub struct CheckedOutWorld {
    pub world: String,
    pub dir: PathBuf,
    pub token: LockToken,
}

/// A working copy left behind by an earlier session
pub type PendingCheckout = CheckedOutWorld;

/// Find working copies under `save_dir` that still carry a lease sidecar
pub async fn pending_checkouts(save_dir: &Path) -> ClientResult<Vec<PendingCheckout>> {
    let mut pending = Vec::new();
    let mut entries = tokio::fs::read_dir(save_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let dir = entry.path();
        let sidecar = dir.join(CHECKOUT_TOKEN_FILE);
        if !tokio::fs::try_exists(&sidecar).await? {
            continue;
        }
        let token = read_record(&sidecar).await?;
        pending.push(CheckedOutWorld {
            world: entry.file_name().to_string_lossy().into_owned(),
            dir,
            token,
        });
    }

    pending.sort_by(|a, b| a.world.cmp(&b.world));
    Ok(pending)
}

// ============================================================================
// Connection
// ============================================================================

/// One request/reply exchange
struct Connection {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
    timeout: Duration,
}

impl Connection {
    async fn open(addr: &str, timeout: Duration, command: &Command) -> ClientResult<Self> {
        let stream = within(timeout, TcpStream::connect(addr)).await?;
        let (read_half, writer) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read_half),
            writer,
            timeout,
        };
        conn.send_line(&command.to_line()).await?;
        Ok(conn)
    }

    async fn send_line(&mut self, line: &str) -> ClientResult<()> {
        self.writer.write_all(format!("{}\n", line).as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Read one reply line, turning `error: ...` into `ClientError::Server`
    async fn read_reply(&mut self) -> ClientResult<String> {
        let mut line = String::new();
        let reader = &mut self.reader;
        let n = within(self.timeout, async {
            reader.take(MAX_LINE_LEN).read_line(&mut line).await
        })
        .await?;
        if n == 0 {
            return Err(ClientError::UnexpectedReply(String::new()));
        }

        let line = line.trim_end().to_string();
        if let Some(message) = line.strip_prefix(&format!("{}:", RESP_ERROR)) {
            return Err(ClientError::Server(message.trim().to_string()));
        }
        Ok(line)
    }

    /// Read everything up to the server closing the connection. The status
    /// snapshot grows with the world count, so it gets no line limit.
    async fn read_to_close(&mut self) -> ClientResult<String> {
        let mut body = String::new();
        within(self.timeout, self.reader.read_to_string(&mut body)).await?;

        let body = body.trim_end().to_string();
        if body.is_empty() {
            return Err(ClientError::UnexpectedReply(body));
        }
        if let Some(message) = body.strip_prefix(&format!("{}:", RESP_ERROR)) {
            return Err(ClientError::Server(message.trim().to_string()));
        }
        Ok(body)
    }

    async fn expect_reply(&mut self, expected: &str) -> ClientResult<()> {
        let reply = self.read_reply().await?;
        if reply != expected {
            return Err(ClientError::UnexpectedReply(reply));
        }
        Ok(())
    }
}

async fn within<T, F>(limit: Duration, fut: F) -> ClientResult<T>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(ClientError::Timeout(limit.as_secs())),
    }
}

// ============================================================================
// Client
// ============================================================================

/// Connection settings for one overseer
#[derive(Clone)]
pub struct Client {
    addr: String,
    overseer: String,
    filter: Arc<dyn SaveFilter>,
    timeout: Duration,
    transfer_timeout: Duration,
}

impl Client {
    pub fn new(
        addr: impl Into<String>,
        overseer: impl Into<String>,
        filter: Arc<dyn SaveFilter>,
    ) -> ClientResult<Self> {
        let overseer = overseer.into();
        validate_overseer_name(&overseer)?;
        Ok(Self {
            addr: addr.into(),
            overseer,
            filter,
            timeout: DEFAULT_CLIENT_TIMEOUT,
            transfer_timeout: Duration::from_secs(30 * 60),
        })
    }

    /// Override the connect/reply deadline and the transfer deadline
    pub fn with_timeouts(mut self, timeout: Duration, transfer_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.transfer_timeout = transfer_timeout;
        self
    }

    pub fn overseer(&self) -> &str {
        &self.overseer
    }

    async fn connect(&self, command: &Command) -> ClientResult<Connection> {
        Connection::open(&self.addr, self.timeout, command).await
    }

    /// Check that a CloudFort server is listening
    pub async fn ping(&self) -> ClientResult<()> {
        let mut conn = self.connect(&Command::Ping).await?;
        conn.expect_reply(RESP_PING).await
    }

    /// Every world and its (redacted) lease
    pub async fn status(&self) -> ClientResult<BTreeMap<String, LockToken>> {
        let mut conn = self.connect(&Command::Status).await?;
        let reply = conn.read_to_close().await?;
        Ok(serde_json::from_str(&reply)?)
    }

    /// Give up a lease without uploading anything
    pub async fn release(&self, world: &str, auth_token: &str) -> ClientResult<()> {
        let command = Command::Release {
            overseer: self.overseer.clone(),
            world: world.to_string(),
            auth_token: auth_token.to_string(),
        };
        let mut conn = self.connect(&command).await?;
        conn.expect_reply(RESP_SUCCESS).await?;
        tracing::info!(world = %world, "Released world");
        Ok(())
    }

    /// Download `world` into `save_dir/<world>`.
    ///
    /// Once the server has granted the lease, any later failure releases
    /// it again before the error is returned.
    pub async fn checkout(&self, world: &str, save_dir: &Path) -> ClientResult<CheckedOutWorld> {
        let dir = save_dir.join(world);
        if tokio::fs::try_exists(&dir).await? {
            return Err(ClientError::WorkingCopyExists(dir));
        }

        let command = Command::Checkout {
            overseer: self.overseer.clone(),
            world: world.to_string(),
        };
        let mut conn = self.connect(&command).await?;
        conn.expect_reply(RESP_DOWNLOAD).await?;
        let token: LockToken = serde_json::from_str(&conn.read_reply().await?)?;
        let expected_hash = conn.read_reply().await?;

        match self
            .receive_world(&mut conn, &expected_hash, &token, &dir)
            .await
        {
            Ok(()) => {
                tracing::info!(world = %world, dir = %dir.display(), "Checked out world");
                Ok(CheckedOutWorld {
                    world: world.to_string(),
                    dir,
                    token,
                })
            }
            Err(e) => {
                tracing::warn!(world = %world, error = %e, "Checkout failed, releasing world");
                if let Err(release_err) = self.release(world, &token.auth_token).await {
                    tracing::warn!(world = %world, error = %release_err, "Release after failed checkout failed");
                }
                if let Err(cleanup_err) = tokio::fs::remove_dir_all(&dir).await {
                    if cleanup_err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(dir = %dir.display(), error = %cleanup_err, "Could not remove partial working copy");
                    }
                }
                Err(e)
            }
        }
    }

    async fn receive_world(
        &self,
        conn: &mut Connection,
        expected_hash: &str,
        token: &LockToken,
        dir: &Path,
    ) -> ClientResult<()> {
        let download = tempfile::Builder::new()
            .prefix("cloudfort-download.")
            .suffix(".temp")
            .tempfile()?;
        let mut file = tokio::fs::File::from_std(download.reopen()?);
        within(self.transfer_timeout, recv_framed(&mut conn.reader, &mut file)).await?;
        drop(file);

        conn.expect_reply(RESP_SUCCESS).await?;

        let path = download.path().to_path_buf();
        let (actual, _) = tokio::task::spawn_blocking(move || hash_file(&path)).await??;
        if actual != expected_hash {
            return Err(ClientError::HashMismatch {
                expected: expected_hash.to_string(),
                actual,
            });
        }

        let path = download.path().to_path_buf();
        let dest = dir.to_path_buf();
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            std::fs::create_dir_all(&dest)?;
            let root = find_archive_root(&path)?;
            extract_subset(&path, &root, &dest, filter.as_ref())
        })
        .await??;

        let sidecar = serde_json::to_string_pretty(token)?;
        tokio::fs::write(dir.join(CHECKOUT_TOKEN_FILE), sidecar).await?;
        Ok(())
    }

    /// Upload a working copy and, on success, delete it
    pub async fn checkin(&self, checked_out: &CheckedOutWorld) -> ClientResult<()> {
        let upload = tempfile::Builder::new()
            .prefix("cloudfort-upload.")
            .suffix(".temp")
            .tempfile()?;

        let path = upload.path().to_path_buf();
        let source = checked_out.dir.clone();
        let filter = self.filter.clone();
        let (hash, size) = tokio::task::spawn_blocking(move || -> Result<(String, u64), StoreError> {
            pack_subset(&source, filter.as_ref(), &path)?;
            Ok(hash_file(&path)?)
        })
        .await??;

        let command = Command::Checkin {
            overseer: self.overseer.clone(),
            world: checked_out.world.clone(),
            auth_token: checked_out.token.auth_token.clone(),
        };
        let mut conn = self.connect(&command).await?;
        conn.expect_reply(RESP_UPLOAD).await?;
        conn.send_line(&hash).await?;

        let mut file = tokio::fs::File::open(upload.path()).await?;
        within(self.transfer_timeout, send_framed(&mut file, &mut conn.writer, size)).await?;
        conn.expect_reply(RESP_SUCCESS).await?;

        tokio::fs::remove_dir_all(&checked_out.dir).await?;
        tracing::info!(world = %checked_out.world, "Checked in world");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    #[test]
    fn test_validate_overseer_name() {
        assert!(validate_overseer_name("Urist McMiner").is_ok());
        for bad in ["", "a:b", "a;b", "a/b", "a\\b", "a\nb", "a\tb", "100%"] {
            assert!(validate_overseer_name(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_client_rejects_bad_name() {
        let filter: Arc<dyn SaveFilter> = Arc::new(crate::world::RegexSaveFilter::dwarf_fortress());
        assert!(matches!(
            Client::new("127.0.0.1:1", "bad:name", filter),
            Err(ClientError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_checkouts_finds_sidecars() {
        let temp_dir = TempDir::new().unwrap();
        let leased = temp_dir.path().join("embark1");
        let plain = temp_dir.path().join("region2");
        std::fs::create_dir_all(&leased).unwrap();
        std::fs::create_dir_all(&plain).unwrap();

        let token = LockToken::downloading("urist", Utc::now(), chrono::Duration::minutes(5));
        std::fs::write(
            leased.join(CHECKOUT_TOKEN_FILE),
            serde_json::to_string(&token).unwrap(),
        )
        .unwrap();

        let pending = pending_checkouts(temp_dir.path()).await.unwrap();

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].world, "embark1");
        assert_eq!(pending[0].token, token);
    }
}
