use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

use crate::models::LogRecord;

use super::branches::{self, DetectedBranch};
use super::parser;
use super::projects;

/// Import one session log file.
///
/// Returns `None` when the file is unchanged since the last import (hash
/// match) or carries nothing importable; otherwise `(branches_written,
/// new_messages)`. All store writes happen in a single transaction so
/// readers never observe a half-rebuilt session.
pub fn import_session(
    conn: &Connection,
    path: &Path,
    project_id: i64,
    parent_session_id: Option<i64>,
) -> Result<Option<(usize, usize)>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let file_hash = blake3::hash(&bytes).to_hex().to_string();
    let path_str = path.to_string_lossy();

    // Unchanged file: nothing to do.
    let stored_hash: Option<Option<String>> = conn
        .query_row(
            "SELECT file_hash FROM import_log WHERE file_path = ?1",
            params![path_str.as_ref()],
            |row| row.get(0),
        )
        .optional()?;
    if stored_hash.flatten().as_deref() == Some(file_hash.as_str()) {
        return Ok(None);
    }

    let records = parser::parse_log_bytes(&bytes);
    let graph = parser::graph_records(&records);
    if graph.is_empty() {
        return Ok(None);
    }

    let detected = branches::detect_branches(&graph);
    if detected.is_empty() {
        return Ok(None);
    }

    let messages = parser::message_records(&records);
    if messages.is_empty() {
        return Ok(None);
    }

    let Some(session_uuid) = projects::session_uuid_for_file(path) else {
        return Ok(None);
    };

    // First non-null git branch / cwd across the whole graph.
    let git_branch = graph.iter().find_map(|r| r.git_branch.as_deref());
    let cwd = graph.iter().find_map(|r| r.cwd.as_deref());

    let tx = conn
        .unchecked_transaction()
        .context("failed to begin import transaction")?;

    let session_id: i64 = tx
        .query_row(
            "INSERT INTO sessions (uuid, project_id, parent_session_id, git_branch, cwd)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(uuid) DO UPDATE SET
                 git_branch = COALESCE(excluded.git_branch, sessions.git_branch),
                 cwd = COALESCE(excluded.cwd, sessions.cwd),
                 parent_session_id = COALESCE(excluded.parent_session_id, sessions.parent_session_id)
             RETURNING id",
            params![session_uuid, project_id, parent_session_id, git_branch, cwd],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to upsert session {session_uuid}"))?;

    let new_messages = insert_messages(&tx, session_id, &messages)
        .with_context(|| format!("failed to insert messages for session {session_uuid}"))?;

    // UUID -> row id for branch membership.
    let mut uuid_to_msg_id: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt = tx.prepare_cached(
            "SELECT id, uuid FROM messages WHERE session_id = ?1 AND uuid IS NOT NULL",
        )?;
        let mut rows = stmt.query(params![session_id])?;
        while let Some(row) = rows.next()? {
            uuid_to_msg_id.insert(row.get(1)?, row.get(0)?);
        }
    }

    rebuild_branches(&tx, session_id, &detected, &messages, &uuid_to_msg_id)
        .with_context(|| format!("failed to rebuild branches for session {session_uuid}"))?;

    // Messages no longer on any branch lost their last reference in this
    // rebuild; collect them now, inside the same transaction.
    tx.execute(
        "DELETE FROM messages
         WHERE session_id = ?1 AND id NOT IN (
             SELECT DISTINCT bm.message_id FROM branch_messages bm
             JOIN branches b ON bm.branch_id = b.id
             WHERE b.session_id = ?1
         )",
        params![session_id],
    )
    .context("failed to delete orphaned messages")?;

    tx.execute(
        "INSERT INTO import_log (file_path, file_hash, messages_imported)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(file_path) DO UPDATE SET
             file_hash = excluded.file_hash,
             imported_at = CURRENT_TIMESTAMP,
             messages_imported = excluded.messages_imported",
        params![path_str.as_ref(), file_hash, new_messages as i64],
    )
    .context("failed to update import log")?;

    tx.commit().context("failed to commit import")?;

    tracing::debug!(
        "imported {}: {} branches, {} new messages",
        path.display(),
        detected.len(),
        new_messages
    );

    Ok(Some((detected.len(), new_messages)))
}

/// Insert every storable message once, keyed by `(session_id, uuid)`.
/// Tool-result user records and empty-text messages are not stored.
fn insert_messages(
    tx: &rusqlite::Transaction<'_>,
    session_id: i64,
    messages: &[&LogRecord],
) -> Result<usize> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO messages (session_id, uuid, parent_uuid, timestamp, role, content,
                               tool_summary, has_tool_use, has_thinking)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(session_id, uuid) DO NOTHING",
    )?;

    let mut inserted = 0;
    for record in messages {
        let content = record.message.as_ref().and_then(|m| m.content.as_ref());

        if record.is_user() && parser::is_tool_result(content) {
            continue;
        }

        let extracted = parser::extract_content(content);
        if extracted.text.is_empty() {
            continue;
        }

        let role = if record.is_user() { "user" } else { "assistant" };
        let changes = stmt.execute(params![
            session_id,
            record.uuid,
            record.parent_uuid,
            record.timestamp,
            role,
            extracted.text,
            extracted.tool_summary,
            extracted.has_tool_use as i64,
            extracted.has_thinking as i64,
        ])?;
        inserted += changes;
    }

    Ok(inserted)
}

/// Upsert the detected branches, rebuild their membership rows, and drop
/// branches whose leaf no longer exists in the detection output.
fn rebuild_branches(
    tx: &rusqlite::Transaction<'_>,
    session_id: i64,
    detected: &[DetectedBranch],
    messages: &[&LogRecord],
    uuid_to_msg_id: &HashMap<String, i64>,
) -> Result<()> {
    let mut existing: HashMap<String, i64> = HashMap::new();
    {
        let mut stmt =
            tx.prepare_cached("SELECT id, leaf_uuid FROM branches WHERE session_id = ?1")?;
        let mut rows = stmt.query(params![session_id])?;
        while let Some(row) = rows.next()? {
            existing.insert(row.get(1)?, row.get(0)?);
        }
    }

    for branch in detected {
        // This branch's messages, in timestamp order.
        let mut branch_msgs: Vec<&LogRecord> = messages
            .iter()
            .copied()
            .filter(|r| r.uuid.as_deref().is_some_and(|u| branch.uuids.contains(u)))
            .collect();
        branch_msgs.sort_by(|a, b| a.timestamp_key().cmp(b.timestamp_key()));

        let stats = branches::branch_stats(&branch_msgs);
        let files_json = if stats.files_modified.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&stats.files_modified)?)
        };
        let commits_json = if stats.commits.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&stats.commits)?)
        };

        let branch_id: i64 = match existing.get(&branch.leaf_uuid) {
            Some(&id) => {
                tx.execute(
                    "UPDATE branches SET
                         is_active = ?2,
                         fork_point_uuid = ?3,
                         started_at = ?4,
                         ended_at = ?5,
                         exchange_count = ?6,
                         files_modified = ?7,
                         commits = ?8
                     WHERE id = ?1",
                    params![
                        id,
                        branch.is_active as i64,
                        branch.fork_point_uuid,
                        stats.started_at,
                        stats.ended_at,
                        stats.exchange_count,
                        files_json,
                        commits_json,
                    ],
                )?;
                id
            }
            None => tx.query_row(
                "INSERT INTO branches (session_id, leaf_uuid, fork_point_uuid, is_active,
                                       started_at, ended_at, exchange_count, files_modified, commits)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 RETURNING id",
                params![
                    session_id,
                    branch.leaf_uuid,
                    branch.fork_point_uuid,
                    branch.is_active as i64,
                    stats.started_at,
                    stats.ended_at,
                    stats.exchange_count,
                    files_json,
                    commits_json,
                ],
                |row| row.get(0),
            )?,
        };

        // Exactly one active branch per session.
        if branch.is_active {
            tx.execute(
                "UPDATE branches SET is_active = 0
                 WHERE session_id = ?1 AND id != ?2 AND is_active = 1",
                params![session_id, branch_id],
            )?;
        }

        tx.execute(
            "DELETE FROM branch_messages WHERE branch_id = ?1",
            params![branch_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO branch_messages (branch_id, message_id) VALUES (?1, ?2)",
            )?;
            for uuid in &branch.uuids {
                if let Some(msg_id) = uuid_to_msg_id.get(uuid) {
                    stmt.execute(params![branch_id, msg_id])?;
                }
            }
        }
    }

    // Stale branches: leaves that vanished from the detection output.
    let current: std::collections::HashSet<&str> =
        detected.iter().map(|b| b.leaf_uuid.as_str()).collect();
    for (leaf, branch_id) in &existing {
        if !current.contains(leaf.as_str()) {
            tx.execute(
                "DELETE FROM branch_messages WHERE branch_id = ?1",
                params![branch_id],
            )?;
            tx.execute("DELETE FROM branches WHERE id = ?1", params![branch_id])?;
        }
    }

    Ok(())
}
