use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rusqlite::{params, params_from_iter, Connection};
use std::fmt::Write as _;
use std::path::Path;

const SEPARATOR: &str = "------------------------------------------------------------";

/// One full-text search hit.
#[derive(Debug)]
pub struct SearchHit {
    pub timestamp: Option<String>,
    pub role: String,
    pub snippet: String,
    pub session_uuid: String,
    pub project_name: Option<String>,
}

/// Build the FTS query: each whitespace-separated term quoted, OR-joined,
/// so punctuation in user input cannot break the match syntax.
pub fn fts_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Run a full-text search over message bodies, best matches first.
pub fn search(
    conn: &Connection,
    query: &str,
    project: Option<&str>,
    limit: u32,
) -> Result<Vec<SearchHit>> {
    let fts = fts_query(query);
    if fts.is_empty() {
        return Ok(Vec::new());
    }

    let mut sql = String::from(
        "SELECT m.timestamp, m.role,
                snippet(messages_fts, 0, '>>>', '<<<', '...', 32) AS snippet,
                s.uuid AS session_uuid, p.name AS project_name,
                bm25(messages_fts) AS rank
         FROM messages_fts
         JOIN messages m ON messages_fts.rowid = m.id
         JOIN sessions s ON m.session_id = s.id
         JOIN projects p ON s.project_id = p.id
         WHERE messages_fts MATCH ?1",
    );
    let mut params: Vec<String> = vec![fts];

    if let Some(project) = project {
        sql.push_str(" AND p.name LIKE ?2");
        params.push(format!("%{project}%"));
    }

    write!(sql, " ORDER BY rank LIMIT {limit}").unwrap();

    let mut stmt = conn.prepare(&sql).context("failed to prepare search query")?;
    let hits = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            Ok(SearchHit {
                timestamp: row.get(0)?,
                role: row.get(1)?,
                snippet: row.get(2)?,
                session_uuid: row.get(3)?,
                project_name: row.get(4)?,
            })
        })
        .context("search failed (check query syntax)")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("search failed")?;

    Ok(hits)
}

/// Render search hits for the terminal.
pub fn render_search_results(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results found.\n".to_string();
    }

    let mut out = String::new();
    for hit in hits {
        let session_prefix: String = hit.session_uuid.chars().take(8).collect();
        let _ = writeln!(out, "\n{SEPARATOR}");
        let _ = writeln!(
            out,
            "{} / {} - {} - {}",
            hit.project_name.as_deref().unwrap_or("unknown"),
            session_prefix,
            hit.timestamp.as_deref().unwrap_or("?"),
            hit.role
        );
        let _ = writeln!(out, "{}", hit.snippet);
    }
    let _ = writeln!(out, "\n{SEPARATOR}");
    let _ = writeln!(out, "Found {} results", hits.len());
    out
}

/// One recent conversation: the active branch of a session plus its
/// messages.
#[derive(Debug)]
pub struct RecentSession {
    pub uuid: String,
    pub project: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub git_branch: Option<String>,
    /// (role, content) pairs in timestamp order.
    pub messages: Vec<(String, String)>,
}

/// The most recent active-branch conversations, newest first, optionally
/// filtered to one project name.
pub fn recent_sessions(
    conn: &Connection,
    limit: u32,
    project: Option<&str>,
) -> Result<Vec<RecentSession>> {
    let limit = limit.clamp(1, 20);

    let mut sql = String::from(
        "SELECT s.uuid, p.name, b.started_at, b.ended_at, s.git_branch, b.id
         FROM sessions s
         JOIN branches b ON b.session_id = s.id AND b.is_active = 1
         JOIN projects p ON s.project_id = p.id",
    );
    let mut params: Vec<String> = Vec::new();
    if let Some(project) = project {
        sql.push_str(" WHERE p.name LIKE ?1");
        params.push(format!("%{project}%"));
    }
    write!(sql, " ORDER BY b.ended_at DESC LIMIT {limit}").unwrap();

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, Option<String>, Option<String>, Option<String>, Option<String>, i64)> =
        stmt.query_map(params_from_iter(params.iter()), |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })?
        .collect::<std::result::Result<_, _>>()?;

    let mut sessions = Vec::new();
    for (uuid, project, started_at, ended_at, git_branch, branch_id) in rows {
        let mut stmt = conn.prepare_cached(
            "SELECT m.role, m.content
             FROM branch_messages bm
             JOIN messages m ON bm.message_id = m.id
             WHERE bm.branch_id = ?1
             ORDER BY m.timestamp ASC",
        )?;
        let messages = stmt
            .query_map(params![branch_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        sessions.push(RecentSession {
            uuid,
            project,
            started_at,
            ended_at,
            git_branch,
            messages,
        });
    }

    Ok(sessions)
}

/// Render recent conversations as Markdown.
pub fn render_recent(sessions: &[RecentSession]) -> String {
    if sessions.is_empty() {
        return "No sessions found.\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "# Recent Conversations ({} sessions)\n", sessions.len());

    for session in sessions {
        let project = session.project.as_deref().unwrap_or("Unknown");
        let started = format_time_full(session.started_at.as_deref());
        let _ = writeln!(out, "## {project} | {started}");
        let prefix: String = session.uuid.chars().take(8).collect();
        let _ = writeln!(out, "Session: {prefix}");
        if let Some(branch) = &session.git_branch {
            let _ = writeln!(out, "Branch: {branch}");
        }
        let _ = writeln!(out, "\n### Conversation\n");
        for (role, content) in &session.messages {
            let role = if role == "user" { "User" } else { "Assistant" };
            let _ = writeln!(out, "**{role}:** {content}\n");
        }
        let _ = writeln!(out, "---\n");
    }

    out
}

/// Local-timezone `YYYY-MM-DD HH:MM`; a raw prefix when the stamp will not
/// parse.
fn format_time_full(ts: Option<&str>) -> String {
    let Some(ts) = ts else {
        return "??".into();
    };
    match DateTime::parse_from_rfc3339(ts) {
        Ok(dt) => dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
        Err(_) => ts.chars().take(16).collect(),
    }
}

/// Archive-wide counts for `--stats`.
pub fn render_stats(conn: &Connection, db_path: &Path) -> Result<String> {
    let count = |sql: &str| -> Result<i64> {
        conn.query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("stats query failed: {sql}"))
    };

    let projects = count("SELECT COUNT(*) FROM projects")?;
    let sessions = count("SELECT COUNT(*) FROM sessions")?;
    let messages = count("SELECT COUNT(*) FROM messages")?;
    let branches = count("SELECT COUNT(*) FROM branches")?;
    let active = count("SELECT COUNT(*) FROM branches WHERE is_active = 1")?;
    let abandoned = count("SELECT COUNT(*) FROM branches WHERE is_active = 0")?;
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "Database: {}", db_path.display());
    let _ = writeln!(out, "Size: {:.2} MB", db_size as f64 / 1_048_576.0);
    let _ = writeln!(out, "Projects: {projects}");
    let _ = writeln!(out, "Sessions: {sessions}");
    let _ = writeln!(out, "Branches: {branches} ({active} active, {abandoned} abandoned)");
    let _ = writeln!(out, "Messages: {messages}");
    Ok(out)
}
