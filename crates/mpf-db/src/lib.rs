//! SQLite store for mastopoof.
//!
//! One database file, two pools: a single-connection writer pool (write
//! transactions are explicit `BEGIN IMMEDIATE`) and a reader pool sized to
//! the CPU count. Every data-access function in this workspace takes
//! `&mut SqliteConnection`, so it runs unchanged against a reader
//! connection, a writer connection, or an open transaction.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use mpf_schemas::{Error, Result};
use rand::Rng;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection};
use tracing::{debug, warn};

pub mod entities;
pub mod schema;
pub mod sessions;

pub use entities::*;
pub use schema::migrate;
pub use sessions::*;

pub const ENV_DB: &str = "MASTOPOOF_DB";

/// ~1 GiB page cache (negative value = KiB, per SQLite convention).
const CACHE_SIZE_KIB: i64 = -1_048_576;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    rw: SqlitePool,
    ro: SqlitePool,
}

impl Store {
    /// Open (creating if missing) a file-backed database with WAL, NORMAL
    /// synchronous mode, foreign keys on, and a 5 s busy timeout.
    pub async fn open(path: &str) -> Result<Self> {
        let uri = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}")
        };
        let opts = SqliteConnectOptions::from_str(&uri)
            .map_err(|e| Error::InvalidArgument(format!("bad database uri '{path}': {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .pragma("cache_size", CACHE_SIZE_KIB.to_string());

        let rw = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts.clone())
            .await?;

        let readers = num_cpus::get().max(4) as u32;
        let ro = SqlitePoolOptions::new()
            .max_connections(readers)
            .connect_with(opts)
            .await?;

        Ok(Self { rw, ro })
    }

    /// In-memory database for tests: a single shared connection serves both
    /// roles so the database survives as long as the pool does.
    pub async fn open_in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Internal(format!("memory uri: {e}")))?
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Ok(Self {
            rw: pool.clone(),
            ro: pool,
        })
    }

    /// A connection from the reader pool. Queries on it see a consistent
    /// snapshot for the duration of each implicit transaction.
    pub async fn read(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.ro.acquire().await?)
    }

    /// Start a write transaction (`BEGIN IMMEDIATE`) on the single writer
    /// connection. Contending writers serialize here.
    pub async fn begin(&self) -> Result<RwTxn> {
        let mut conn = self.rw.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE")
            .execute(conn.as_mut())
            .await?;
        Ok(RwTxn { conn: Some(conn) })
    }

    /// Run `f` inside a write transaction. Commits on success, rolls back on
    /// error. The `CleanAbort` sentinel rolls back without propagating and
    /// yields `Ok(None)`; any other error rolls back and propagates.
    pub async fn with_rw<T, F>(&self, f: F) -> Result<Option<T>>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut txn = self.begin().await?;
        match f(txn.conn()).await {
            Ok(v) => {
                txn.commit().await?;
                Ok(Some(v))
            }
            Err(Error::CleanAbort) => {
                txn.rollback().await?;
                Ok(None)
            }
            Err(e) => {
                txn.rollback().await?;
                Err(e)
            }
        }
    }

    /// Writer pool handle, used by the migrator for pragma toggles that must
    /// happen outside any transaction.
    pub(crate) async fn writer(&self) -> Result<PoolConnection<Sqlite>> {
        Ok(self.rw.acquire().await?)
    }

    pub async fn close(&self) {
        self.rw.close().await;
        self.ro.close().await;
    }
}

// ---------------------------------------------------------------------------
// RwTxn
// ---------------------------------------------------------------------------

/// An open `BEGIN IMMEDIATE` transaction on the writer connection.
///
/// Must be finished with [`RwTxn::commit`] or [`RwTxn::rollback`]. If it is
/// dropped instead, the connection is discarded, which makes SQLite roll the
/// transaction back on close; the writer pool reopens lazily.
pub struct RwTxn {
    conn: Option<PoolConnection<Sqlite>>,
}

impl RwTxn {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn
            .as_mut()
            .expect("transaction already finished")
            .as_mut()
    }

    pub async fn commit(mut self) -> Result<()> {
        let mut conn = self.conn.take().expect("transaction already finished");
        sqlx::query("COMMIT").execute(conn.as_mut()).await?;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        let mut conn = self.conn.take().expect("transaction already finished");
        sqlx::query("ROLLBACK").execute(conn.as_mut()).await?;
        Ok(())
    }
}

impl Drop for RwTxn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("write transaction dropped without commit; discarding connection");
            drop(conn.detach());
        }
    }
}

// ---------------------------------------------------------------------------
// Periodic optimize
// ---------------------------------------------------------------------------

const OPTIMIZE_INTERVAL: Duration = Duration::from_secs(3600);

/// Run `PRAGMA optimize` roughly every hour, with small jitter so several
/// processes against the same file do not line up.
pub fn spawn_optimize(store: Arc<Store>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let jitter = Duration::from_secs(rand::thread_rng().gen_range(0..120));
            tokio::time::sleep(OPTIMIZE_INTERVAL + jitter).await;
            match store.writer().await {
                Ok(mut conn) => {
                    if let Err(e) = sqlx::query("PRAGMA optimize").execute(conn.as_mut()).await {
                        warn!(error = %e, "optimize pass failed");
                    } else {
                        debug!("optimize pass done");
                    }
                }
                Err(e) => warn!(error = %e, "optimize: no writer connection"),
            }
        }
    })
}
