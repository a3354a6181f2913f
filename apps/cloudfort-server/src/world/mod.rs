//! World archives on disk
//!
//! - `filter`: which paths belong to a save
//! - `archive`: zip root detection, subset extract/pack, hashing
//! - `store`: save folder layout, atomic archive swap, startup reconciliation

pub mod archive;
mod error;
mod filter;
mod store;

pub use archive::{extract_subset, find_archive_root, hash_file, pack_subset, ROOT_MARKERS};
pub use error::{StoreError, StoreResult};
pub use filter::{RegexSaveFilter, SaveFilter};
pub use store::{world_name, ArchiveSwap, ReconcileReport, WorldStore};
