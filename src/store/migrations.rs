//! Versioned schema migrations.
//!
//! Tracked through the `meta` table under the `schema_version` key; each
//! migration runs exactly once. The FTS virtual table and its triggers are
//! created after migrations by [`ensure_fts`] so they can be rebuilt
//! independently of the versioned schema.

use rusqlite::Connection;

use crate::error::{LedgerError, Result};

/// Current schema version. Increment when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

type MigrationFn = fn(&Connection) -> Result<()>;

/// All migrations in order. Index + 1 = version number.
const MIGRATIONS: &[MigrationFn] = &[migration_v1_core_tables, migration_v2_watcher_owner];

/// Runs all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as u32;
        if version > current {
            migration(conn)?;
            set_schema_version(conn, version)?;
        }
    }
    Ok(())
}

/// Creates the full-text index over symbols and its three sync triggers if
/// missing. Idempotent.
pub fn ensure_fts(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS symbols_fts USING fts5(
            name,
            file_path,
            kind,
            content='symbols',
            content_rowid='id'
        );

        CREATE TRIGGER IF NOT EXISTS symbols_fts_ai AFTER INSERT ON symbols BEGIN
            INSERT INTO symbols_fts(rowid, name, file_path, kind)
            VALUES (new.id, new.name, new.file_path, new.kind);
        END;

        CREATE TRIGGER IF NOT EXISTS symbols_fts_ad AFTER DELETE ON symbols BEGIN
            INSERT INTO symbols_fts(symbols_fts, rowid, name, file_path, kind)
            VALUES ('delete', old.id, old.name, old.file_path, old.kind);
        END;

        CREATE TRIGGER IF NOT EXISTS symbols_fts_au AFTER UPDATE ON symbols BEGIN
            INSERT INTO symbols_fts(symbols_fts, rowid, name, file_path, kind)
            VALUES ('delete', old.id, old.name, old.file_path, old.kind);
            INSERT INTO symbols_fts(rowid, name, file_path, kind)
            VALUES (new.id, new.name, new.file_path, new.kind);
        END;
        "#,
    )?;
    Ok(())
}

/// Fails fast when the database is missing or built by a different binary
/// generation. Used by read-only query paths, which never migrate.
pub fn verify_schema_compatibility(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;

    if current == 0 {
        return Err(LedgerError::Usage(
            "index database is not initialized; open the workspace once to build it".into(),
        ));
    }
    if current > CURRENT_SCHEMA_VERSION {
        return Err(LedgerError::Usage(format!(
            "index schema version {current} is newer than this binary ({CURRENT_SCHEMA_VERSION}); upgrade code-ledger"
        )));
    }
    if current < CURRENT_SCHEMA_VERSION {
        return Err(LedgerError::Usage(format!(
            "index schema version {current} is outdated (expected {CURRENT_SCHEMA_VERSION}); reopen the workspace to migrate"
        )));
    }
    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();

    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}

// ============================================================================
// Migrations
// ============================================================================

/// V1: files, symbols, relations with cascading foreign keys.
fn migration_v1_core_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Indexed source files, keyed per project within the workspace
        CREATE TABLE IF NOT EXISTS files (
            project TEXT NOT NULL,
            path TEXT NOT NULL,
            mtime_ms INTEGER NOT NULL,
            size INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (project, path)
        );

        -- Symbols extracted from a file; rewritten wholesale on reindex
        CREATE TABLE IF NOT EXISTS symbols (
            id INTEGER PRIMARY KEY,
            project TEXT NOT NULL,
            file_path TEXT NOT NULL,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            start_column INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            end_column INTEGER NOT NULL,
            is_exported INTEGER NOT NULL DEFAULT 0,
            signature TEXT,
            fingerprint TEXT,
            detail_json TEXT,
            content_hash TEXT NOT NULL,
            indexed_at INTEGER NOT NULL,
            FOREIGN KEY (project, file_path)
                REFERENCES files(project, path) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_symbols_file ON symbols(project, file_path);
        CREATE INDEX IF NOT EXISTS idx_symbols_kind ON symbols(project, kind);
        CREATE INDEX IF NOT EXISTS idx_symbols_name ON symbols(project, name);
        CREATE INDEX IF NOT EXISTS idx_symbols_fingerprint ON symbols(project, fingerprint);

        -- Directed file/symbol edges; source side cascades with its file
        CREATE TABLE IF NOT EXISTS relations (
            id INTEGER PRIMARY KEY,
            project TEXT NOT NULL,
            type TEXT NOT NULL,
            src_file_path TEXT NOT NULL,
            src_symbol_name TEXT,
            dst_file_path TEXT NOT NULL,
            dst_symbol_name TEXT,
            meta_json TEXT,
            FOREIGN KEY (project, src_file_path)
                REFERENCES files(project, path) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_relations_src ON relations(project, src_file_path);
        CREATE INDEX IF NOT EXISTS idx_relations_dst ON relations(project, dst_file_path);
        CREATE INDEX IF NOT EXISTS idx_relations_type ON relations(project, type);
        "#,
    )?;
    Ok(())
}

/// V2: single-row watcher ownership for cross-process leader election.
fn migration_v2_watcher_owner(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS watcher_owner (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            pid INTEGER NOT NULL,
            started_at INTEGER NOT NULL,
            heartbeat_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        conn
    }

    #[test]
    fn fresh_database_reaches_current_version() {
        let conn = fresh_conn();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = fresh_conn();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn fts_triggers_track_symbol_rows() {
        let conn = fresh_conn();
        run_migrations(&conn).unwrap();
        ensure_fts(&conn).unwrap();

        conn.execute(
            "INSERT INTO files (project, path, mtime_ms, size, content_hash, updated_at)
             VALUES ('p', 'src/a.ts', 1, 10, 'h1', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO symbols (project, file_path, kind, name, start_line, start_column,
                                  end_line, end_column, is_exported, content_hash, indexed_at)
             VALUES ('p', 'src/a.ts', 'function', 'loadUser', 1, 0, 5, 1, 1, 'h1', 1)",
            [],
        )
        .unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM symbols_fts WHERE symbols_fts MATCH 'loadUser'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        // Cascade delete of the file must also clear the FTS row via trigger.
        conn.execute("DELETE FROM files WHERE path = 'src/a.ts'", [])
            .unwrap();
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM symbols_fts WHERE symbols_fts MATCH 'loadUser'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 0);
    }

    #[test]
    fn watcher_owner_enforces_singleton_id() {
        let conn = fresh_conn();
        run_migrations(&conn).unwrap();

        conn.execute(
            "INSERT INTO watcher_owner (id, pid, started_at, heartbeat_at) VALUES (1, 10, 0, 0)",
            [],
        )
        .unwrap();
        let err = conn.execute(
            "INSERT INTO watcher_owner (id, pid, started_at, heartbeat_at) VALUES (2, 11, 0, 0)",
            [],
        );
        assert!(err.is_err());
    }

    #[test]
    fn compatibility_guard() {
        let conn = fresh_conn();
        assert!(verify_schema_compatibility(&conn).is_err());

        run_migrations(&conn).unwrap();
        verify_schema_compatibility(&conn).unwrap();

        conn.execute(
            "UPDATE meta SET value = '99' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        assert!(verify_schema_compatibility(&conn).is_err());
    }
}
