use std::path::{Path, PathBuf};

/// Encode a working directory as a project key: `/` and `.` become `-`.
/// This is how the host names per-project log directories.
pub fn key_for_cwd(cwd: &str) -> String {
    cwd.replace('/', "-").replace('.', "-")
}

/// Decode a project directory key back to a filesystem path. Each `-`
/// denotes a `/`; the leading `/` swallowed by the encoding is restored.
/// The round trip is lossy for paths that contain literal `-` characters;
/// the key column keeps the original spelling for those.
pub fn decode_project_key(key: &str) -> String {
    format!("/{}", key.replace('-', "/").trim_start_matches('/'))
}

/// Short project name: the last path segment.
pub fn project_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Session UUID for a log file: the file stem, minus the `agent-` prefix
/// sub-agent logs carry.
pub fn session_uuid_for_file(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    Some(stem.strip_prefix("agent-").unwrap_or(&stem).to_string())
}

/// Locate the log file for a session id anywhere under the projects root,
/// checking the per-project top level first and sub-agent directories after.
pub fn find_session_file(projects_dir: &Path, session_id: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(projects_dir).ok()?;

    for entry in entries.flatten() {
        let project_dir = entry.path();
        if !project_dir.is_dir() {
            continue;
        }

        let candidate = project_dir.join(format!("{session_id}.jsonl"));
        if candidate.exists() {
            return Some(candidate);
        }

        let Ok(subdirs) = std::fs::read_dir(&project_dir) else {
            continue;
        };
        for sub in subdirs.flatten() {
            let subagents = sub.path().join("subagents");
            if !subagents.is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(&subagents) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().is_some_and(|e| e == "jsonl")
                    && session_uuid_for_file(&path).as_deref() == Some(session_id)
                {
                    return Some(path);
                }
            }
        }
    }

    None
}

/// The project directory that owns a session file. Sub-agent files live at
/// `<project>/<uuid>/subagents/<file>`, two levels below the project.
pub fn project_dir_for_file(file: &Path) -> Option<PathBuf> {
    let parent = file.parent()?;
    if parent.file_name().is_some_and(|n| n == "subagents") {
        parent.parent()?.parent().map(|p| p.to_path_buf())
    } else {
        Some(parent.to_path_buf())
    }
}
