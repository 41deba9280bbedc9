//! SQLite storage layer.
//!
//! One file-backed database per workspace, WAL mode, foreign keys enforced.
//! The index is a rebuildable cache: if the file turns out to be corrupted on
//! open, it is deleted together with its WAL/SHM companions and recreated
//! once.
//!
//! Transactions are synchronous. [`Store::transaction`] hands the closure a
//! [`TxScope`]; nested scopes become `SAVEPOINT sp_<depth>` so a failing
//! inner unit rolls back without tearing down the outer transaction. Nothing
//! may await while a scope is alive.

pub mod migrations;

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{LedgerError, Result};

const BUSY_TIMEOUT_MS: u32 = 5_000;

pub struct Store {
    inner: Mutex<StoreInner>,
    db_path: Option<PathBuf>,
}

struct StoreInner {
    conn: Option<Connection>,
    tx_depth: Cell<u32>,
}

impl Store {
    /// Opens (or creates) the database at `path` and brings the schema up to
    /// date. A corrupted database is deleted and recreated exactly once.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = match open_and_migrate(path) {
            Ok(conn) => conn,
            Err(err) if is_corruption(&err) => {
                warn!(path = %path.display(), error = %err, "index database corrupted, rebuilding");
                remove_database_files(path)?;
                open_and_migrate(path)?
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn: Some(conn),
                tx_depth: Cell::new(0),
            }),
            db_path: Some(path.to_path_buf()),
        })
    }

    /// Opens an existing database without migrating it. Query-only callers
    /// (the CLI) use this: a missing or generation-mismatched database is an
    /// error, never silently created.
    pub fn open_existing(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(LedgerError::Usage(format!(
                "no index database at {}; open the workspace once to build it",
                path.display()
            )));
        }
        let conn = Connection::open(path)?;
        configure_pragmas(&conn)?;
        migrations::verify_schema_compatibility(&conn)?;
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn: Some(conn),
                tx_depth: Cell::new(0),
            }),
            db_path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure_pragmas(&conn)?;
        migrations::run_migrations(&conn)?;
        migrations::ensure_fts(&conn)?;
        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn: Some(conn),
                tx_depth: Cell::new(0),
            }),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Closes the connection. Later operations fail with a usage error;
    /// closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(conn) = inner.conn.take() {
            drop(conn);
            if let Some(path) = &self.db_path {
                info!(path = %path.display(), "index database closed");
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>> {
        self.inner
            .lock()
            .map_err(|e| LedgerError::Lifecycle(format!("store mutex poisoned: {e}")))
    }

    /// Runs `f` with the live connection outside any transaction.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let inner = self.lock()?;
        let conn = inner
            .conn
            .as_ref()
            .ok_or_else(|| LedgerError::Usage("store is closed".into()))?;
        f(conn)
    }

    /// Runs `f` under a deferred top-level transaction (or a savepoint when
    /// already inside one).
    pub fn transaction<T>(&self, f: impl FnOnce(&TxScope<'_>) -> Result<T>) -> Result<T> {
        self.transaction_with(false, f)
    }

    /// Runs `f` under `BEGIN IMMEDIATE`, taking the write lock up front.
    /// This is what serializes cross-process ownership acquisition.
    pub fn immediate_transaction<T>(&self, f: impl FnOnce(&TxScope<'_>) -> Result<T>) -> Result<T> {
        self.transaction_with(true, f)
    }

    fn transaction_with<T>(
        &self,
        immediate: bool,
        f: impl FnOnce(&TxScope<'_>) -> Result<T>,
    ) -> Result<T> {
        let inner = self.lock()?;
        let conn = inner
            .conn
            .as_ref()
            .ok_or_else(|| LedgerError::Usage("store is closed".into()))?;
        run_in_tx(conn, &inner.tx_depth, immediate, f)
    }

    /// First column of the first row of an arbitrary query, as text.
    pub fn raw_query_scalar(&self, sql: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query([])?;
            match rows.next()? {
                Some(row) => Ok(row.get::<_, Option<String>>(0)?),
                None => Ok(None),
            }
        })
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }
}

/// Connection plus savepoint depth, alive for the duration of a transaction
/// body.
pub struct TxScope<'a> {
    conn: &'a Connection,
    depth: &'a Cell<u32>,
}

impl TxScope<'_> {
    pub fn conn(&self) -> &Connection {
        self.conn
    }

    /// Opens a savepoint inside the current transaction.
    pub fn nested<T>(&self, f: impl FnOnce(&TxScope<'_>) -> Result<T>) -> Result<T> {
        run_in_tx(self.conn, self.depth, false, f)
    }
}

fn run_in_tx<T>(
    conn: &Connection,
    depth: &Cell<u32>,
    immediate: bool,
    f: impl FnOnce(&TxScope<'_>) -> Result<T>,
) -> Result<T> {
    let level = depth.get();
    if level == 0 {
        conn.execute_batch(if immediate { "BEGIN IMMEDIATE" } else { "BEGIN" })?;
    } else {
        conn.execute_batch(&format!("SAVEPOINT sp_{level}"))?;
    }
    depth.set(level + 1);

    let scope = TxScope { conn, depth };
    let result = f(&scope);
    // Depth must unwind on every path before commit/rollback runs.
    depth.set(level);

    match result {
        Ok(value) => {
            if level == 0 {
                conn.execute_batch("COMMIT")?;
            } else {
                conn.execute_batch(&format!("RELEASE sp_{level}"))?;
            }
            Ok(value)
        }
        Err(err) => {
            let rollback = if level == 0 {
                conn.execute_batch("ROLLBACK")
            } else {
                conn.execute_batch(&format!("ROLLBACK TO sp_{level}; RELEASE sp_{level}"))
            };
            if let Err(rb) = rollback {
                warn!(error = %rb, "rollback failed after transaction error");
            }
            Err(err)
        }
    }
}

fn open_and_migrate(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure_pragmas(&conn)?;
    migrations::run_migrations(&conn)?;
    migrations::ensure_fts(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};\n\
         PRAGMA synchronous = NORMAL;"
    ))?;
    Ok(())
}

fn is_corruption(err: &LedgerError) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("malformed")
        || message.contains("corrupt")
        || message.contains("not a database")
}

fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut companion = path.as_os_str().to_owned();
        companion.push(suffix);
        let companion = PathBuf::from(companion);
        match std::fs::remove_file(&companion) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
