//! World lock table
//!
//! - `token`: the per-world lease record
//! - `store`: durable `.dftk` token records
//! - `manager`: the single point of mutation (get/set/snapshot)

mod manager;
mod store;
mod token;

pub use manager::{LockManager, PersistError};
pub use store::{read_record, FileTokenStore, TokenStore, TokenStoreError, TOKEN_RECORD_SUFFIX};
pub use token::{mint_auth_token, LockStatus, LockToken, SENTINEL_AUTH_TOKEN};
