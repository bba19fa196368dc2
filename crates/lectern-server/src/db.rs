//! Shared handle to the licensing database.
//!
//! One connection per process, serialised by a mutex. Cross-process
//! exclusivity comes from SQLite itself (immediate transactions and
//! conditional updates in `lectern-store`), never from this lock.
//!
//! Every call blocks: on the lock, and on SQLite's busy timeout when another
//! process holds the write lock. On a multi-threaded runtime the call runs
//! under `block_in_place`, so the worker thread hands its other tasks off
//! instead of stalling them.

use std::sync::{Arc, Mutex};

use lectern_store::Database;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::error;

use crate::error::OfflineError;

#[derive(Clone)]
pub struct Db(Arc<Mutex<Database>>);

impl Db {
    pub fn new(db: Database) -> Self {
        Self(Arc::new(Mutex::new(db)))
    }

    /// Run `f` against the connection. Store errors become
    /// [`OfflineError::PersistenceUnavailable`].
    pub fn call<T>(
        &self,
        f: impl FnOnce(&mut Database) -> lectern_store::Result<T>,
    ) -> Result<T, OfflineError> {
        Ok(self.raw(f)??)
    }

    /// Like [`call`](Self::call) but hands the store result back untouched,
    /// for callers that branch on a specific [`lectern_store::StoreError`].
    pub fn raw<T>(
        &self,
        f: impl FnOnce(&mut Database) -> lectern_store::Result<T>,
    ) -> Result<lectern_store::Result<T>, OfflineError> {
        let run = || -> Result<lectern_store::Result<T>, OfflineError> {
            let mut guard = self.0.lock().map_err(|_| {
                error!("database mutex poisoned");
                OfflineError::PersistenceUnavailable
            })?;
            Ok(f(&mut guard))
        };
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(run)
            }
            _ => run(),
        }
    }
}
