use anyhow::Result;
use serde_json::{json, Value};
use std::path::Path;

use crate::config::Settings;
use crate::importer::{projects, session, upsert_project};
use crate::models::HookInput;

/// Stop-hook driver: incrementally sync the session that just finished a
/// turn. Always returns a non-blocking payload; every failure mode degrades
/// to `{"continue": true}` so the hook can never wedge the host.
pub fn run(settings: &Settings, db_path: &Path, projects_dir: &Path, input: HookInput) -> Value {
    if !settings.sync_on_stop {
        tracing::debug!("sync disabled by settings");
        return json!({"continue": true});
    }

    let Some(session_id) = input.session_id else {
        return json!({"continue": true});
    };

    let Some(session_file) = projects::find_session_file(projects_dir, &session_id) else {
        return json!({"continue": true});
    };

    match sync_file(db_path, &session_file) {
        Ok(new_messages) => {
            if new_messages > 0 {
                let prefix: String = session_id.chars().take(8).collect();
                tracing::info!("synced {new_messages} new message(s) from session {prefix}");
                json!({"continue": true, "suppressOutput": true})
            } else {
                json!({"continue": true})
            }
        }
        Err(e) => {
            tracing::error!("sync error for session {session_id}: {e:#}");
            json!({"continue": true})
        }
    }
}

/// Open the store and import one session file. Returns the count of newly
/// written messages.
fn sync_file(db_path: &Path, session_file: &Path) -> Result<usize> {
    let conn = crate::db::open(db_path)?;

    let project_dir = projects::project_dir_for_file(session_file)
        .ok_or_else(|| anyhow::anyhow!("no project directory for {}", session_file.display()))?;
    let key = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let project_id = upsert_project(&conn, &key)?;

    let result = session::import_session(&conn, session_file, project_id, None)?;
    Ok(result.map(|(_, messages)| messages).unwrap_or(0))
}
