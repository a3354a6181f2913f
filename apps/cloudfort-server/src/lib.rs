//! CloudFort Server Library
//!
//! Lease-based check-out/check-in of shared world saves. One client at a
//! time may hold a world; abandoned leases expire; check-ins replace the
//! authoritative archive only after their hash has been verified.
//!
//! # Modules
//!
//! - `locks`: lease tokens, their durable records and the lock table
//! - `world`: world archives on disk (filtering, packing, swapping)
//! - `protocol`: the line-oriented wire protocol and its handler
//! - `server`: TCP accept loop
//! - `expiry`: background reclaim of expired leases
//! - `client`: the overseer side of the protocol

pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod expiry;
pub mod locks;
pub mod protocol;
pub mod server;
pub mod state;
pub mod transfer;
pub mod world;
