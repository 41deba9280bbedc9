//! Cross-process watcher ownership.
//!
//! Exactly one process per workspace runs the file watcher. Election happens
//! through the single-row `watcher_owner` table: `acquire` runs under an
//! immediate-write transaction, so two processes racing for the row serialize
//! on the database write lock and cannot both win. Liveness combines a
//! heartbeat timestamp with an OS signal-zero probe, letting a survivor take
//! over from a crashed owner without lock files or sockets.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{unix_millis, Store};

/// Role handed out by [`OwnershipManager::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherRole {
    /// Runs the watcher, heartbeats, and all index writes.
    Owner,
    /// Queries only; probes periodically for promotion.
    Reader,
}

#[derive(Debug, Clone)]
struct OwnerRow {
    pid: u32,
    heartbeat_at: i64,
}

#[derive(Clone)]
pub struct OwnershipManager {
    store: Arc<Store>,
    staleness: Duration,
}

impl OwnershipManager {
    pub fn new(store: Arc<Store>, staleness: Duration) -> Self {
        Self { store, staleness }
    }

    /// Attempts to become the watcher owner.
    ///
    /// Under `BEGIN IMMEDIATE`: a missing row is claimed outright; a row held
    /// by a live, recently-heartbeating process yields `Reader`; a dead or
    /// stale owner is overwritten. Re-acquiring with our own pid refreshes
    /// the heartbeat and stays `Owner`.
    pub fn acquire(&self, pid: u32) -> Result<WatcherRole> {
        let stale_after_ms = self.staleness.as_millis() as i64;

        self.store.immediate_transaction(|tx| {
            let conn = tx.conn();
            let now = unix_millis();

            let existing = conn
                .query_row(
                    "SELECT pid, heartbeat_at FROM watcher_owner WHERE id = 1",
                    [],
                    |row| {
                        Ok(OwnerRow {
                            pid: row.get::<_, i64>(0)? as u32,
                            heartbeat_at: row.get(1)?,
                        })
                    },
                )
                .optional()?;

            match existing {
                None => {
                    conn.execute(
                        "INSERT INTO watcher_owner (id, pid, started_at, heartbeat_at)
                         VALUES (1, ?1, ?2, ?2)",
                        params![pid as i64, now],
                    )?;
                    info!(pid, "acquired watcher ownership");
                    Ok(WatcherRole::Owner)
                }
                Some(row) if row.pid == pid => {
                    conn.execute(
                        "UPDATE watcher_owner SET heartbeat_at = ?1 WHERE id = 1",
                        params![now],
                    )?;
                    Ok(WatcherRole::Owner)
                }
                Some(row) => {
                    let fresh = now - row.heartbeat_at <= stale_after_ms;
                    if fresh && is_process_alive(row.pid) {
                        debug!(owner_pid = row.pid, "watcher owned by live process");
                        return Ok(WatcherRole::Reader);
                    }
                    info!(
                        previous = row.pid,
                        pid, "taking over stale watcher ownership"
                    );
                    conn.execute(
                        "INSERT OR REPLACE INTO watcher_owner (id, pid, started_at, heartbeat_at)
                         VALUES (1, ?1, ?2, ?2)",
                        params![pid as i64, now],
                    )?;
                    Ok(WatcherRole::Owner)
                }
            }
        })
    }

    /// Refreshes the heartbeat. A no-op when this process no longer owns the
    /// row.
    pub fn heartbeat(&self, pid: u32) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE watcher_owner SET heartbeat_at = ?1 WHERE id = 1 AND pid = ?2",
                params![unix_millis(), pid as i64],
            )?;
            Ok(())
        })
    }

    /// Drops ownership. A no-op when another process already took over.
    pub fn release(&self, pid: u32) -> Result<()> {
        self.store.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM watcher_owner WHERE id = 1 AND pid = ?1",
                params![pid as i64],
            )?;
            if deleted > 0 {
                info!(pid, "released watcher ownership");
            }
            Ok(())
        })
    }

    /// The currently registered owner row, if any. Exposed for status
    /// introspection; no liveness judgement is applied.
    pub fn current_owner(&self) -> Result<Option<(u32, i64, i64)>> {
        self.store.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT pid, started_at, heartbeat_at FROM watcher_owner WHERE id = 1",
                    [],
                    |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            Ok(row)
        })
    }
}

/// Signal-zero probe: "no such process" means dead, "permission denied"
/// means alive under a different user.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    // Without a cheap probe, lean on heartbeat staleness alone.
    true
}
