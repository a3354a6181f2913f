//! Archive packing and unpacking
//!
//! Blocking helpers over the `zip` crate. Async callers run them through
//! `tokio::task::spawn_blocking`.
//!
//! A world archive may hold its save files at the zip root or nested one
//! folder down (users zip either the folder or its contents), so every
//! extraction first locates the folder holding `world.dat` or `world.sav`.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::error::{StoreError, StoreResult};
use super::filter::SaveFilter;

/// File names that mark the root of a save
pub const ROOT_MARKERS: [&str; 2] = ["world.dat", "world.sav"];

/// Zip entry names may come from Windows tools
fn normalize_entry_name(name: &str) -> String {
    name.replace('\\', "/")
}

/// Path of `entry` relative to `root`, or `None` if it lies outside it
fn relative_to_root<'a>(entry: &'a str, root: &str) -> Option<&'a str> {
    if root.is_empty() {
        return Some(entry);
    }
    entry
        .strip_prefix(root)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// Only plain, downward path components are allowed on extraction
fn is_contained(relative: &str) -> bool {
    !relative.is_empty()
        && Path::new(relative)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

// ============================================================================
// Root Detection
// ============================================================================

/// Return the directory inside `archive` that contains a root marker.
///
/// The empty string means the zip root itself.
pub fn find_archive_root(archive: &Path) -> StoreResult<String> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;

    for i in 0..zip.len() {
        let entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = normalize_entry_name(entry.name());
        let (parent, base) = match name.rsplit_once('/') {
            Some((parent, base)) => (parent, base),
            None => ("", name.as_str()),
        };
        if ROOT_MARKERS.contains(&base) {
            return Ok(parent.to_string());
        }
    }

    Err(StoreError::RootNotFound(archive.display().to_string()))
}

// ============================================================================
// Extract / Pack
// ============================================================================

/// Extract entries under `root` that pass `filter` into `dest_dir`,
/// keeping their paths relative to `root`. Returns the number of files.
pub fn extract_subset(
    archive: &Path,
    root: &str,
    dest_dir: &Path,
    filter: &dyn SaveFilter,
) -> StoreResult<usize> {
    let mut zip = ZipArchive::new(BufReader::new(File::open(archive)?))?;
    let mut extracted = 0;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = normalize_entry_name(entry.name());
        let Some(relative) = relative_to_root(&name, root) else {
            continue;
        };
        if !filter.is_save_file(relative) {
            continue;
        }
        if !is_contained(relative) {
            tracing::warn!(entry = %name, "Skipping archive entry that escapes the save root");
            continue;
        }

        let out_path = dest_dir.join(relative);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&out_path)?);
        io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }

    tracing::debug!(
        archive = %archive.display(),
        root = %root,
        dest = %dest_dir.display(),
        files = extracted,
        "Extracted save subset"
    );
    Ok(extracted)
}

/// Pack every file under `root_dir` that passes `filter` into a new zip at
/// `dest_archive`. Returns the number of files written.
pub fn pack_subset(
    root_dir: &Path,
    filter: &dyn SaveFilter,
    dest_archive: &Path,
) -> StoreResult<usize> {
    let mut zip = ZipWriter::new(BufWriter::new(File::create(dest_archive)?));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut packed = 0;

    for entry in WalkDir::new(root_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root_dir) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !filter.is_save_file(&relative) {
            continue;
        }

        zip.start_file(relative.as_str(), options)?;
        let mut source = BufReader::new(File::open(entry.path())?);
        io::copy(&mut source, &mut zip)?;
        packed += 1;
    }

    zip.finish()?;
    tracing::debug!(
        root = %root_dir.display(),
        archive = %dest_archive.display(),
        files = packed,
        "Packed save subset"
    );
    Ok(packed)
}

// ============================================================================
// Hashing
// ============================================================================

/// SHA-256 (lowercase hex) and byte length of a file
pub fn hash_file(path: &Path) -> io::Result<(String, u64)> {
    let mut file = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

// ============================================================================
// Tests
// ============================================================================
