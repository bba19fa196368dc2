//! # lectern-store
//!
//! SQLite persistence for the Lectern licensing engine. The crate exposes a
//! synchronous `Database` handle that wraps a `rusqlite::Connection` and
//! provides typed helpers for every entity: devices, material keys, device
//! CEKs, encryption jobs, rate-limit counters and the audit log.
//!
//! All cross-request invariants live here as SQL: unique and partial unique
//! indexes, single-statement compare-and-set transitions, and `BEGIN
//! IMMEDIATE` read-modify-write.

pub mod audit;
pub mod database;
pub mod devices;
pub mod jobs;
pub mod keys;
pub mod migrations;
pub mod models;
pub mod rate_limits;

mod codec;
mod error;

pub use database::Database;
pub use devices::{RegisterOutcome, RevokeOutcome};
pub use error::{Result, StoreError};
pub use jobs::{EnqueueOutcome, CLAIM_EXPIRED};
pub use keys::{new_cek, CekInsert};
pub use models::*;
