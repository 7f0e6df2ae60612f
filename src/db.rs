use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

const SCHEMA: &str = include_str!("schema.sql");

/// Open or create the archive database at `path`.
///
/// Creates parent directories on demand, applies PRAGMAs, and runs the
/// migration policy: a pre-branch-index schema is detected by table shape and
/// destroyed (the log files are the source of truth; a bulk import rebuilds
/// everything), then the schema is applied idempotently.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let conn = open_raw(path)?;

    if has_legacy_schema(&conn)? {
        tracing::info!("legacy schema detected, rebuilding {}", path.display());
        drop(conn);
        std::fs::remove_file(path)
            .with_context(|| format!("failed to delete legacy database {}", path.display()))?;
        // WAL siblings of the deleted file must not survive into the rebuild.
        for suffix in ["-wal", "-shm"] {
            let _ = std::fs::remove_file(sibling(path, suffix));
        }
        let conn = open_raw(path)?;
        apply_schema(&conn)?;
        return Ok(conn);
    }

    apply_schema(&conn)?;
    migrate_columns(&conn)?;
    Ok(conn)
}

/// Returns the default database path: `~/.claude-memory/conversations.db`.
pub fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-memory")
        .join("conversations.db")
}

fn open_raw(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;",
    )
    .context("failed to set database PRAGMAs")?;

    Ok(conn)
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA).context("failed to apply schema")
}

/// An old archive predates the branch index: it has `sessions` but no
/// `branches`. A fresh file has neither and needs no migration.
fn has_legacy_schema(conn: &Connection) -> Result<bool> {
    Ok(!table_exists(conn, "branches")? && table_exists(conn, "sessions")?)
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Add columns introduced after the v3 schema landed. Guarded by table_info
/// so re-opening an up-to-date database is a no-op.
fn migrate_columns(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "messages", "tool_summary")? {
        tracing::info!("adding messages.tool_summary column");
        conn.execute("ALTER TABLE messages ADD COLUMN tool_summary TEXT", [])
            .context("failed to add tool_summary column")?;
    }
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
