pub mod branches;
pub mod parser;
pub mod projects;
pub mod session;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Configuration for a bulk import run.
pub struct ImportConfig {
    pub db_path: PathBuf,
    pub projects_dir: PathBuf,
    /// Limit the run to one project subdirectory.
    pub project: Option<String>,
    /// Project short names to skip entirely.
    pub exclude_projects: Vec<String>,
}

/// Totals for one imported project directory.
#[derive(Debug)]
pub struct ProjectTotals {
    pub name: String,
    pub branches_written: usize,
    pub messages_written: usize,
    pub sessions_skipped: usize,
}

/// Report produced after a bulk import completes.
#[derive(Debug, Default)]
pub struct ImportReport {
    pub projects: Vec<ProjectTotals>,
    pub branches_written: usize,
    pub messages_written: usize,
    pub sessions_skipped: usize,
    pub db_size_bytes: u64,
    pub elapsed_secs: f64,
}

impl std::fmt::Display for ImportReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for p in &self.projects {
            if p.branches_written > 0 || p.messages_written > 0 {
                writeln!(
                    f,
                    "Imported {}: {} branches, {} messages",
                    p.name, p.branches_written, p.messages_written
                )?;
            }
        }
        writeln!(
            f,
            "\nTotal: {} branches, {} messages imported ({} unchanged)",
            self.branches_written, self.messages_written, self.sessions_skipped
        )?;
        if self.db_size_bytes > 0 {
            writeln!(
                f,
                "Database size: {:.2} MB",
                self.db_size_bytes as f64 / 1_048_576.0
            )?;
        }
        Ok(())
    }
}

/// Walk the projects root and import every session log, skipping unchanged
/// files via the import log.
pub fn run_import(config: ImportConfig) -> Result<ImportReport> {
    let start = Instant::now();
    let conn = crate::db::open(&config.db_path).context("failed to open database")?;

    tracing::info!(
        "importing {} -> {}",
        config.projects_dir.display(),
        config.db_path.display()
    );

    let mut report = ImportReport::default();

    let project_dirs: Vec<PathBuf> = match &config.project {
        Some(name) => {
            let dir = config.projects_dir.join(name);
            if !dir.is_dir() {
                anyhow::bail!("project not found: {}", dir.display());
            }
            vec![dir]
        }
        None => {
            let mut dirs = Vec::new();
            let entries = std::fs::read_dir(&config.projects_dir).with_context(|| {
                format!("failed to read {}", config.projects_dir.display())
            })?;
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name();
                if path.is_dir() && !name.to_string_lossy().starts_with('.') {
                    dirs.push(path);
                }
            }
            dirs.sort();
            dirs
        }
    };

    for dir in project_dirs {
        let totals = import_project(&conn, &dir, &config.exclude_projects)?;
        report.branches_written += totals.branches_written;
        report.messages_written += totals.messages_written;
        report.sessions_skipped += totals.sessions_skipped;
        report.projects.push(totals);
    }

    report.elapsed_secs = start.elapsed().as_secs_f64();
    report.db_size_bytes = std::fs::metadata(&config.db_path).map(|m| m.len()).unwrap_or(0);

    tracing::info!(
        "import complete: {} branches, {} messages in {:.1}s",
        report.branches_written,
        report.messages_written,
        report.elapsed_secs
    );

    Ok(report)
}

/// Upsert a project row for a log directory key. Shared with the stop hook.
pub fn upsert_project(conn: &Connection, key: &str) -> Result<i64> {
    let path = projects::decode_project_key(key);
    let name = projects::project_name(&path);
    let id = conn
        .query_row(
            "INSERT INTO projects (path, key, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(path) DO UPDATE SET key = excluded.key
             RETURNING id",
            params![path, key, name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to upsert project {key}"))?;
    Ok(id)
}

/// Import all session logs under one project directory: the `*.jsonl` files
/// at the top level, then each session's `subagents/` files.
pub fn import_project(
    conn: &Connection,
    project_dir: &Path,
    exclude_projects: &[String],
) -> Result<ProjectTotals> {
    let key = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let path = projects::decode_project_key(&key);
    let name = projects::project_name(&path);

    let mut totals = ProjectTotals {
        name: name.clone(),
        branches_written: 0,
        messages_written: 0,
        sessions_skipped: 0,
    };

    if exclude_projects.iter().any(|e| e == &name) {
        tracing::debug!("skipping excluded project {name}");
        return Ok(totals);
    }

    let project_id = upsert_project(conn, &key)?;

    let mut session_files: Vec<PathBuf> = Vec::new();
    let entries = std::fs::read_dir(project_dir)
        .with_context(|| format!("failed to read {}", project_dir.display()))?;
    for entry in entries.flatten() {
        let file_path = entry.path();
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_path.is_file() && file_name.ends_with(".jsonl") && !file_name.starts_with('.') {
            session_files.push(file_path);
        }
    }
    session_files.sort();

    for file in &session_files {
        import_one(conn, file, project_id, None, &mut totals)?;

        // Sub-agent logs live under <session-uuid>/subagents/. The parent
        // row id resolves only if the parent session has been imported; a
        // missing parent leaves the reference NULL.
        let Some(stem) = file.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        let subagents_dir = project_dir.join(&stem).join("subagents");
        if !subagents_dir.is_dir() {
            continue;
        }

        let parent_sid: Option<i64> = conn
            .query_row(
                "SELECT id FROM sessions WHERE uuid = ?1 LIMIT 1",
                params![stem],
                |row| row.get(0),
            )
            .ok();

        let mut subagent_files: Vec<PathBuf> = std::fs::read_dir(&subagents_dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|e| e == "jsonl"))
            .collect();
        subagent_files.sort();

        for sub_file in &subagent_files {
            import_one(conn, sub_file, project_id, parent_sid, &mut totals)?;
        }
    }

    Ok(totals)
}

/// Import a single file into the running totals. Unreadable files are
/// logged and skipped; store errors abort the run.
fn import_one(
    conn: &Connection,
    file: &Path,
    project_id: i64,
    parent_session_id: Option<i64>,
    totals: &mut ProjectTotals,
) -> Result<()> {
    match session::import_session(conn, file, project_id, parent_session_id) {
        Ok(Some((branch_count, msg_count))) => {
            totals.branches_written += branch_count;
            totals.messages_written += msg_count;
        }
        Ok(None) => totals.sessions_skipped += 1,
        Err(e) if e.downcast_ref::<std::io::Error>().is_some() => {
            tracing::warn!("skipping unreadable {}: {e:#}", file.display());
        }
        Err(e) => return Err(e),
    }
    Ok(())
}
