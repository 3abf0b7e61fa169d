//! Database handle: connection pool plus the process-wide entry cache.
//!
//! The cache is deliberately owned by the handle rather than a global so
//! that independent databases (and tests) get independent caches.

use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Mutex;

use crate::ledger::account::{AccountFrame, LedgerKey};
use crate::ledger::cache::EntryCache;

pub struct Database {
    pool: PgPool,
    cache: Mutex<EntryCache>,
}

impl Database {
    /// Create a database connection pool
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .wrap_err("Failed to connect to database")?;
        Ok(Database {
            pool,
            cache: Mutex::new(EntryCache::new()),
        })
    }

    /// Wrap an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Database {
            pool,
            cache: Mutex::new(EntryCache::new()),
        }
    }

    /// Run pending migrations (uses the migration files in migrations/)
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .wrap_err("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn cached_entry_exists(&self, key: &LedgerKey) -> bool {
        self.cache.lock().expect("entry cache poisoned").entry_exists(key)
    }

    pub fn get_cached_entry(&self, key: &LedgerKey) -> Option<Option<AccountFrame>> {
        self.cache.lock().expect("entry cache poisoned").get_entry(key)
    }

    pub fn put_cached_entry(&self, key: LedgerKey, value: Option<AccountFrame>) {
        self.cache
            .lock()
            .expect("entry cache poisoned")
            .put_entry(key, value);
    }

    pub fn flush_cached_entry(&self, key: &LedgerKey) {
        self.cache
            .lock()
            .expect("entry cache poisoned")
            .flush_entry(key);
    }
}
