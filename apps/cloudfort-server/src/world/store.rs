//! World Store
//!
//! Owns the save folder layout:
//!
//! ```text
//! save/
//!   <world>.zip          authoritative archive
//!   <world>.dftk         persisted lock token
//!   <world>.zip.backup   previous archive, only during a swap
//!   <world>.zip.<id>.incoming  normalized upload, only during a swap
//!   history.csv          audit ledger
//! temp/
//!   upload-<world>-<uuid>.temp   raw upload as received
//!   unpack-<world>-<uuid>/       scratch folder for normalization
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::archive::{extract_subset, find_archive_root, hash_file, pack_subset};
use super::error::{StoreError, StoreResult};
use super::filter::SaveFilter;
use crate::locks::{read_record, LockToken, TokenStore, TOKEN_RECORD_SUFFIX};

const ARCHIVE_SUFFIX: &str = "zip";

/// What startup reconciliation found
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Tokens to seed the lock manager with
    pub tokens: HashMap<String, LockToken>,
    /// Archives that had no token record and were registered as available
    pub initialized: Vec<String>,
    /// Token records with no archive, skipped
    pub orphaned: Vec<String>,
    /// Token records that could not be parsed and were reset
    pub reset: Vec<String>,
    /// Archives restored from a backup left by an interrupted check-in
    pub restored: Vec<String>,
}

/// An installed archive whose predecessor is still kept as a backup
#[must_use = "an archive swap must be committed or rolled back"]
#[derive(Debug)]
pub struct ArchiveSwap {
    world: String,
    archive: PathBuf,
    backup: PathBuf,
}

impl ArchiveSwap {
    /// Keep the new archive and delete the backup
    pub async fn commit(self) {
        if let Err(e) = tokio::fs::remove_file(&self.backup).await {
            tracing::warn!(world = %self.world, error = %e, "Could not remove archive backup");
        }
        tracing::info!(world = %self.world, "Replaced world archive");
    }

    /// Put the previous archive back
    pub async fn rollback(self) -> StoreResult<()> {
        tokio::fs::rename(&self.backup, &self.archive).await?;
        tracing::warn!(world = %self.world, "Rolled back world archive");
        Ok(())
    }
}

/// Save folder access
#[derive(Clone)]
pub struct WorldStore {
    inner: Arc<WorldStoreInner>,
}

struct WorldStoreInner {
    save_dir: PathBuf,
    temp_dir: PathBuf,
    filter: Arc<dyn SaveFilter>,
}

/// World name derived from an archive or record file name
pub fn world_name(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

impl WorldStore {
    pub fn new(
        save_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        filter: Arc<dyn SaveFilter>,
    ) -> Self {
        Self {
            inner: Arc::new(WorldStoreInner {
                save_dir: save_dir.into(),
                temp_dir: temp_dir.into(),
                filter,
            }),
        }
    }

    pub fn save_dir(&self) -> &Path {
        &self.inner.save_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.inner.temp_dir
    }

    pub fn filter(&self) -> Arc<dyn SaveFilter> {
        self.inner.filter.clone()
    }

    // ========================================================================
    // Paths
    // ========================================================================

    pub fn archive_path(&self, world: &str) -> PathBuf {
        self.inner.save_dir.join(format!("{}.{}", world, ARCHIVE_SUFFIX))
    }

    pub fn backup_path(&self, world: &str) -> PathBuf {
        self.inner.save_dir.join(format!("{}.{}.backup", world, ARCHIVE_SUFFIX))
    }

    fn incoming_path(&self, world: &str) -> PathBuf {
        self.inner.save_dir.join(format!(
            "{}.{}.{}.incoming",
            world,
            ARCHIVE_SUFFIX,
            Uuid::new_v4().simple()
        ))
    }

    /// Fresh path in the temp folder to receive a raw upload into
    pub fn upload_staging_path(&self, world: &str) -> PathBuf {
        self.inner
            .temp_dir
            .join(format!("upload-{}-{}.temp", world, Uuid::new_v4()))
    }

    // ========================================================================
    // Archive Operations
    // ========================================================================

    /// SHA-256 and size of a world's archive
    pub async fn archive_digest(&self, world: &str) -> StoreResult<(String, u64)> {
        let path = self.archive_path(world);
        let digest = tokio::task::spawn_blocking(move || hash_file(&path)).await??;
        Ok(digest)
    }

    /// SHA-256 and size of any file
    pub async fn file_digest(&self, path: &Path) -> StoreResult<(String, u64)> {
        let path = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || hash_file(&path)).await??;
        Ok(digest)
    }

    /// Re-pack an uploaded archive so that it holds only save-relevant files
    /// at its root. Returns the path of the normalized archive, which lives
    /// in the save folder so the following swap is a same-volume rename.
    pub async fn normalize_upload(&self, world: &str, upload: &Path) -> StoreResult<PathBuf> {
        let upload = upload.to_path_buf();
        let scratch = self
            .inner
            .temp_dir
            .join(format!("unpack-{}-{}", world, Uuid::new_v4()));
        let incoming = self.incoming_path(world);
        let filter = self.inner.filter.clone();

        let result = {
            let scratch = scratch.clone();
            let incoming = incoming.clone();
            tokio::task::spawn_blocking(move || -> StoreResult<usize> {
                std::fs::create_dir_all(&scratch)?;
                let root = find_archive_root(&upload)?;
                extract_subset(&upload, &root, &scratch, filter.as_ref())?;
                pack_subset(&scratch, filter.as_ref(), &incoming)
            })
            .await
        };

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::debug!(path = %scratch.display(), error = %e, "Could not remove scratch folder");
        }

        match result? {
            Ok(files) => {
                tracing::debug!(world = %world, files = files, "Normalized uploaded archive");
                Ok(incoming)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&incoming).await;
                Err(e)
            }
        }
    }

    /// Move `staged` into place as the world's archive, keeping the previous
    /// archive at the backup path until the swap is committed or rolled back.
    ///
    /// If moving the staged file into place fails, the backup is renamed
    /// back before the error is returned.
    pub async fn install_archive(&self, world: &str, staged: &Path) -> StoreResult<ArchiveSwap> {
        let archive = self.archive_path(world);
        let backup = self.backup_path(world);

        tokio::fs::rename(&archive, &backup).await?;

        if let Err(e) = tokio::fs::rename(staged, &archive).await {
            tracing::warn!(world = %world, error = %e, "Archive swap failed, restoring backup");
            if let Err(restore_err) = tokio::fs::rename(&backup, &archive).await {
                tracing::warn!(
                    world = %world,
                    error = %restore_err,
                    "Failed to restore archive backup"
                );
            }
            return Err(e.into());
        }

        Ok(ArchiveSwap {
            world: world.to_string(),
            archive,
            backup,
        })
    }

    /// Swap `staged` in as the world's archive and drop the backup
    pub async fn replace_archive(&self, world: &str, staged: &Path) -> StoreResult<()> {
        self.install_archive(world, staged).await?.commit().await;
        Ok(())
    }

    // ========================================================================
    // Startup Reconciliation
    // ========================================================================

    /// Pair archives with token records.
    ///
    /// - a backup with no archive is restored (interrupted swap)
    /// - an archive with no record gets an available token, persisted
    /// - a record with no archive is skipped with a warning
    /// - an unreadable record is reset to available
    pub async fn reconcile_on_startup(
        &self,
        store: &dyn TokenStore,
        server_overseer: &str,
    ) -> StoreResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let mut archives = Vec::new();
        let mut records = Vec::new();
        let mut backups = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.inner.save_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(&format!(".{}.backup", ARCHIVE_SUFFIX)) {
                backups.push(path);
            } else if name.ends_with(".incoming") {
                tracing::info!(path = %path.display(), "Removing unfinished normalized upload");
                tokio::fs::remove_file(&path).await?;
            } else if path.extension().is_some_and(|e| e == ARCHIVE_SUFFIX) {
                archives.push(path);
            } else if path.extension().is_some_and(|e| e == TOKEN_RECORD_SUFFIX) {
                records.push(path);
            }
        }

        for backup in backups {
            let Some(world) = backup
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(&format!(".{}.backup", ARCHIVE_SUFFIX)))
                .map(str::to_string)
            else {
                continue;
            };
            let archive = self.archive_path(&world);
            if archive.exists() {
                tracing::info!(world = %world, "Removing leftover archive backup");
                tokio::fs::remove_file(&backup).await?;
            } else {
                tracing::warn!(world = %world, "Restoring archive from interrupted check-in");
                tokio::fs::rename(&backup, &archive).await?;
                archives.push(archive);
                report.restored.push(world);
            }
        }

        let now = Utc::now();
        for archive in &archives {
            let Some(world) = world_name(archive) else { continue };
            if !self.record_path(&world).exists() {
                let token = LockToken::available(server_overseer, now);
                if let Err(e) = store.save(&world, &token).await {
                    tracing::warn!(world = %world, error = %e, "Failed to persist initial token");
                }
                tracing::info!(world = %world, "Registered untracked world as available");
                report.initialized.push(world.clone());
                report.tokens.insert(world, token);
            }
        }

        for record in records {
            let Some(world) = world_name(&record) else { continue };
            if !self.archive_path(&world).exists() {
                tracing::warn!(
                    record = %record.display(),
                    "Token record found, but its archive does not exist. Skipping."
                );
                report.orphaned.push(world);
                continue;
            }
            match read_record(&record).await {
                Ok(token) => {
                    report.tokens.insert(world, token);
                }
                Err(e) => {
                    tracing::warn!(world = %world, error = %e, "Unreadable token record, resetting to available");
                    let token = LockToken::available(server_overseer, now);
                    if let Err(e) = store.save(&world, &token).await {
                        tracing::warn!(world = %world, error = %e, "Failed to persist reset token");
                    }
                    report.reset.push(world.clone());
                    report.tokens.insert(world, token);
                }
            }
        }

        tracing::info!(
            worlds = report.tokens.len(),
            initialized = report.initialized.len(),
            orphaned = report.orphaned.len(),
            restored = report.restored.len(),
            "Reconciled save folder"
        );
        Ok(report)
    }

    fn record_path(&self, world: &str) -> PathBuf {
        self.inner
            .save_dir
            .join(format!("{}.{}", world, TOKEN_RECORD_SUFFIX))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{FileTokenStore, LockStatus};
    use crate::world::filter::RegexSaveFilter;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn world_store(dir: &TempDir) -> WorldStore {
        let save = dir.path().join("save");
        let temp = dir.path().join("temp");
        std::fs::create_dir_all(&save).unwrap();
        std::fs::create_dir_all(&temp).unwrap();
        WorldStore::new(save, temp, Arc::new(RegexSaveFilter::dwarf_fortress()))
    }

    fn zip_with(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(std::fs::File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_registers_untracked_and_skips_orphans() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        let tokens = FileTokenStore::new(worlds.save_dir());

        zip_with(&worlds.archive_path("fresh"), &[("world.sav", b"w")]);
        zip_with(&worlds.archive_path("held"), &[("world.sav", b"w")]);
        let mut held = LockToken::available("urist", Utc::now());
        held.status = LockStatus::CheckedOut;
        held.auth_token = "secret".to_string();
        tokens.save("held", &held).await.unwrap();
        tokens
            .save("ghost", &LockToken::available("urist", Utc::now()))
            .await
            .unwrap();

        let report = worlds.reconcile_on_startup(&tokens, "<Server>").await.unwrap();

        assert_eq!(report.initialized, vec!["fresh".to_string()]);
        assert_eq!(report.orphaned, vec!["ghost".to_string()]);
        assert_eq!(report.tokens.len(), 2);
        assert!(report.tokens["fresh"].is_available());
        assert_eq!(report.tokens["held"], held);
        assert!(worlds.save_dir().join("fresh.dftk").exists());
    }

    #[tokio::test]
    async fn test_reconcile_resets_garbage_record() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        let tokens = FileTokenStore::new(worlds.save_dir());

        zip_with(&worlds.archive_path("embark1"), &[("world.sav", b"w")]);
        std::fs::write(worlds.save_dir().join("embark1.dftk"), b"garbage").unwrap();

        let report = worlds.reconcile_on_startup(&tokens, "<Server>").await.unwrap();

        assert_eq!(report.reset, vec!["embark1".to_string()]);
        assert!(report.tokens["embark1"].is_available());
    }

    #[tokio::test]
    async fn test_reconcile_restores_interrupted_swap() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        let tokens = FileTokenStore::new(worlds.save_dir());

        zip_with(&worlds.backup_path("embark1"), &[("world.sav", b"old")]);

        let report = worlds.reconcile_on_startup(&tokens, "<Server>").await.unwrap();

        assert_eq!(report.restored, vec!["embark1".to_string()]);
        assert!(worlds.archive_path("embark1").exists());
        assert!(!worlds.backup_path("embark1").exists());
        assert!(report.tokens.contains_key("embark1"));
    }

    #[tokio::test]
    async fn test_replace_archive_swaps_and_cleans_backup() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        std::fs::write(worlds.archive_path("embark1"), b"old").unwrap();
        let staged = worlds.save_dir().join("staged.zip.incoming");
        std::fs::write(&staged, b"new").unwrap();

        worlds.replace_archive("embark1", &staged).await.unwrap();

        assert_eq!(std::fs::read(worlds.archive_path("embark1")).unwrap(), b"new");
        assert!(!worlds.backup_path("embark1").exists());
    }

    #[tokio::test]
    async fn test_installed_archive_can_be_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        std::fs::write(worlds.archive_path("embark1"), b"old").unwrap();
        let staged = worlds.save_dir().join("staged.zip.incoming");
        std::fs::write(&staged, b"new").unwrap();

        let swap = worlds.install_archive("embark1", &staged).await.unwrap();
        assert_eq!(std::fs::read(worlds.archive_path("embark1")).unwrap(), b"new");
        assert!(worlds.backup_path("embark1").exists());

        swap.rollback().await.unwrap();

        assert_eq!(std::fs::read(worlds.archive_path("embark1")).unwrap(), b"old");
        assert!(!worlds.backup_path("embark1").exists());
    }

    #[tokio::test]
    async fn test_replace_archive_restores_backup_on_failure() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        std::fs::write(worlds.archive_path("embark1"), b"old").unwrap();
        let missing = worlds.save_dir().join("never-written.zip");

        let result = worlds.replace_archive("embark1", &missing).await;

        assert!(result.is_err());
        assert_eq!(std::fs::read(worlds.archive_path("embark1")).unwrap(), b"old");
        assert!(!worlds.backup_path("embark1").exists());
    }

    #[tokio::test]
    async fn test_normalize_upload_flattens_and_filters() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        let upload = worlds.upload_staging_path("embark1");
        zip_with(
            &upload,
            &[
                ("region1/world.sav", b"w"),
                ("region1/gamelog.txt", b"log"),
                ("region1/unit-3.dat", b"u"),
            ],
        );

        let incoming = worlds.normalize_upload("embark1", &upload).await.unwrap();

        assert_eq!(find_archive_root(&incoming).unwrap(), "");
        let mut zip = zip::ZipArchive::new(std::fs::File::open(&incoming).unwrap()).unwrap();
        let mut names: Vec<String> = (0..zip.len())
            .map(|i| zip.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["unit-3.dat".to_string(), "world.sav".to_string()]);

        // Scratch folders are cleaned up
        let leftovers: Vec<_> = std::fs::read_dir(worlds.temp_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_normalize_rejects_archive_without_root() {
        let temp_dir = TempDir::new().unwrap();
        let worlds = world_store(&temp_dir);
        let upload = worlds.upload_staging_path("embark1");
        zip_with(&upload, &[("notes.txt", b"hi")]);

        let result = worlds.normalize_upload("embark1", &upload).await;

        assert!(matches!(result, Err(StoreError::RootNotFound(_))));
        let incoming = std::fs::read_dir(worlds.save_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".incoming"))
            .count();
        assert_eq!(incoming, 0);
    }
}
