mod db;
mod models;

pub use self::db::Database;
pub use self::models::{Job, JobOutcome, JobStats, JobStatus, User};
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A database connection shared between the HTTP workers
/// The lock is only ever held for a single query or transaction, never while a script is running.
#[derive(Clone)]
pub struct SharedDatabase {
    db: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(url: &str) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open(url)?)),
        })
    }

    /// Lock the connection, recovering it if a previous holder panicked
    pub fn lock(&self) -> MutexGuard<Database> {
        self.db.lock().unwrap_or_else(|err| {
            self.db.clear_poison();
            PoisonError::into_inner(err)
        })
    }
}
