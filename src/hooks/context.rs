use anyhow::Result;
use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::path::Path;

use crate::config::Settings;
use crate::importer::projects;
use crate::models::HookInput;

/// SessionStart hook driver: pick prior sessions for the current project and
/// render them as a Markdown context blob. Emits `{}` for any reason not to
/// inject (wrong source, disabled, no archive, no qualifying sessions, any
/// error).
pub fn run(settings: &Settings, db_path: &Path, input: HookInput) -> Value {
    let source = input.source.as_deref().unwrap_or("startup");
    if source != "startup" && source != "clear" {
        return json!({});
    }

    if !settings.auto_inject_context {
        tracing::debug!("context injection disabled by settings");
        return json!({});
    }

    let (Some(cwd), Some(session_id)) = (input.cwd, input.session_id) else {
        return json!({});
    };

    if !db_path.exists() {
        return json!({});
    }

    match build_for_project(settings, db_path, &cwd, &session_id) {
        Ok(Some(markdown)) => json!({
            "hookSpecificOutput": {
                "hookEventName": "SessionStart",
                "additionalContext": markdown,
            }
        }),
        Ok(None) => json!({}),
        Err(e) => {
            tracing::error!("context injection error: {e:#}");
            json!({})
        }
    }
}

fn build_for_project(
    settings: &Settings,
    db_path: &Path,
    cwd: &str,
    current_session: &str,
) -> Result<Option<String>> {
    let conn = Connection::open(db_path)?;
    let project_key = projects::key_for_cwd(cwd);

    let sessions = select_sessions(
        &conn,
        &project_key,
        current_session,
        settings.max_context_sessions,
    )?;
    if sessions.is_empty() {
        return Ok(None);
    }

    tracing::info!(
        "injecting context from {} session(s) for project {project_key}",
        sessions.len()
    );

    let body = render_context(&sessions, settings.context_truncation_limit);
    if body.is_empty() {
        return Ok(None);
    }

    Ok(Some(format!("## Previous Session Context\n\n{body}")))
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

pub(crate) struct SessionContext {
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub files_modified: Vec<String>,
    pub commits: Vec<String>,
    pub messages: Vec<ContextMessage>,
}

pub(crate) struct ContextMessage {
    pub role: String,
    pub content: String,
    pub timestamp: Option<String>,
}

/// Apply the exchange-count rule over the project's most recent active
/// branches (newest first, current session and sub-agents excluded):
/// one exchange is noise and is skipped; two is a thin session, taken while
/// scanning continues up to `max_sessions`; more than two is substantial
/// context, taken and the scan stops.
pub(crate) fn select_sessions(
    conn: &Connection,
    project_key: &str,
    current_session: &str,
    max_sessions: usize,
) -> Result<Vec<SessionContext>> {
    let project_id: Option<i64> = conn
        .query_row(
            "SELECT id FROM projects WHERE key = ?1",
            params![project_key],
            |row| row.get(0),
        )
        .optional()?;
    let Some(project_id) = project_id else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(
        "SELECT b.id, b.started_at, b.ended_at, b.exchange_count, b.files_modified, b.commits
         FROM sessions s
         JOIN branches b ON b.session_id = s.id AND b.is_active = 1
         WHERE s.project_id = ?1
           AND s.uuid != ?2
           AND s.parent_session_id IS NULL
         ORDER BY b.ended_at DESC
         LIMIT 20",
    )?;
    let candidates: Vec<(i64, Option<String>, Option<String>, i64, Option<String>, Option<String>)> =
        stmt.query_map(params![project_id, current_session], |row| {
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

    let mut selected = Vec::new();

    for (branch_id, started_at, ended_at, exchange_count, files_json, commits_json) in candidates {
        if exchange_count <= 1 {
            continue;
        }

        let messages = branch_messages(conn, branch_id)?;
        selected.push(SessionContext {
            started_at,
            ended_at,
            files_modified: parse_json_list(files_json.as_deref()),
            commits: parse_json_list(commits_json.as_deref()),
            messages,
        });

        if exchange_count == 2 {
            if selected.len() >= max_sessions {
                break;
            }
            continue;
        }
        break;
    }

    Ok(selected)
}

fn branch_messages(conn: &Connection, branch_id: i64) -> Result<Vec<ContextMessage>> {
    let mut stmt = conn.prepare(
        "SELECT m.role, m.content, m.timestamp
         FROM branch_messages bm
         JOIN messages m ON bm.message_id = m.id
         WHERE bm.branch_id = ?1
         ORDER BY m.timestamp ASC",
    )?;
    let messages = stmt
        .query_map(params![branch_id], |row| {
            Ok(ContextMessage {
                role: row.get(0)?,
                content: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<_, _>>()?;
    Ok(messages)
}

fn parse_json_list(json: Option<&str>) -> Vec<String> {
    json.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

struct Exchange {
    user: String,
    assistant: String,
    /// Timestamp of the user message that closed this exchange; the final
    /// exchange has none.
    ts: Option<String>,
}

/// Render the selected sessions as Markdown: timeline header, files and
/// commits, the opening goal, a bulleted middle, and the last three
/// exchanges verbatim (truncated per side).
pub(crate) fn render_context(sessions: &[SessionContext], truncation_limit: usize) -> String {
    let mut lines: Vec<String> = Vec::new();

    for (i, session) in sessions.iter().enumerate() {
        if i > 0 {
            lines.push("\n---\n".into());
        }

        lines.push(format!(
            "### Session: {} -> {}\n",
            format_time(session.started_at.as_deref()),
            format_time(session.ended_at.as_deref())
        ));

        let files = &session.files_modified;
        if !files.is_empty() {
            lines.push("### Files Modified".into());
            for f in &files[files.len().saturating_sub(10)..] {
                lines.push(format!("- `{f}`"));
            }
            if files.len() > 10 {
                lines.push(format!("- ...and {} more", files.len() - 10));
            }
            lines.push(String::new());
        }

        if !session.commits.is_empty() {
            lines.push("### Git Commits".into());
            for c in &session.commits {
                lines.push(format!("- {c}"));
            }
            lines.push(String::new());
        }

        let user_msgs: Vec<&ContextMessage> = session
            .messages
            .iter()
            .filter(|m| m.role == "user")
            .collect();
        let total = user_msgs.len();
        if total == 0 {
            continue;
        }
        let last3_start = total.saturating_sub(3);

        // The opening request, unless it is already inside the final window.
        if total > 3 {
            lines.push("### Session Goal".into());
            lines.push(truncate_chars(&user_msgs[0].content, 1000));
            lines.push(String::new());
        }

        // Everything strictly between the goal and the final window.
        if total > 4 {
            lines.push("### Other Requests".into());
            for m in &user_msgs[1..last3_start] {
                if m.content.chars().count() > 300 {
                    lines.push(format!("- {}...", truncate_chars(&m.content, 300)));
                } else {
                    lines.push(format!("- {}", m.content));
                }
            }
            lines.push(String::new());
        }

        lines.push("### Where We Left Off\n".into());

        let exchanges = pair_exchanges(&session.messages);
        for ex in exchanges.iter().rev().take(3).rev() {
            let t = format_time(ex.ts.as_deref());
            lines.push(format!("**[{t}] User:**"));
            lines.push(truncate_chars(&ex.user, truncation_limit));
            lines.push(String::new());
            if !ex.assistant.is_empty() {
                lines.push(format!("**[{t}] Assistant:**"));
                lines.push(truncate_chars(&ex.assistant, truncation_limit));
                lines.push(String::new());
            }
        }
    }

    lines.join("\n")
}

/// Group a branch's messages into user/assistant exchanges: each user
/// message plus every assistant message before the next user message.
fn pair_exchanges(messages: &[ContextMessage]) -> Vec<Exchange> {
    let mut exchanges = Vec::new();
    let mut current_user: Option<String> = None;
    let mut current_asst: Vec<&str> = Vec::new();

    for m in messages {
        if m.role == "user" {
            if let Some(user) = current_user.take() {
                exchanges.push(Exchange {
                    user,
                    assistant: current_asst.join("\n\n"),
                    ts: m.timestamp.clone(),
                });
                current_asst.clear();
            }
            current_user = Some(m.content.clone());
        } else if m.role == "assistant" && current_user.is_some() {
            current_asst.push(&m.content);
        }
    }

    if let Some(user) = current_user {
        exchanges.push(Exchange {
            user,
            assistant: current_asst.join("\n\n"),
            ts: None,
        });
    }

    exchanges
}

/// Local-timezone HH:MM for an ISO timestamp; a raw prefix when it will not
/// parse; `??:??` when absent.
fn format_time(ts: Option<&str>) -> String {
    let Some(ts) = ts else {
        return "??:??".into();
    };
    match DateTime::parse_from_rfc3339(ts) {
        Ok(dt) => dt.with_timezone(&Local).format("%H:%M").to_string(),
        Err(_) => ts.chars().take(16).collect(),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}
