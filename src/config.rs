use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Runtime settings, loaded from the optional settings file.
///
/// The settings file is Markdown whose opening YAML front-matter block
/// (between `---` lines) carries the keys. A missing file or any parse
/// failure silently yields the defaults so the hooks can never be wedged by
/// a bad edit.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the SQLite database (supports `~` expansion).
    pub db_path: String,
    /// Inject prior-session context on SessionStart.
    pub auto_inject_context: bool,
    /// Upper bound on sessions included in injected context.
    pub max_context_sessions: usize,
    /// Project short names excluded from bulk import.
    pub exclude_projects: Vec<String>,
    /// Per-message character cap in the "Where We Left Off" section.
    pub context_truncation_limit: usize,
    /// Write hook diagnostics to the log file.
    pub logging_enabled: bool,
    /// Run the incremental sync from the Stop hook.
    pub sync_on_stop: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: "~/.claude-memory/conversations.db".to_string(),
            auto_inject_context: true,
            max_context_sessions: 2,
            exclude_projects: Vec::new(),
            context_truncation_limit: 2000,
            logging_enabled: false,
            sync_on_stop: true,
        }
    }
}

/// Front-matter overlay: every key optional so partial files work.
#[derive(Debug, Default, Deserialize)]
struct SettingsOverlay {
    db_path: Option<String>,
    auto_inject_context: Option<bool>,
    max_context_sessions: Option<usize>,
    exclude_projects: Option<Vec<String>>,
    context_truncation_limit: Option<usize>,
    logging_enabled: Option<bool>,
    sync_on_stop: Option<bool>,
}

impl Settings {
    /// Resolve the database path, expanding `~`.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.db_path)
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Returns the default settings file path: `~/.claude-memory/settings.local.md`.
pub fn default_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-memory")
        .join("settings.local.md")
}

/// Returns the default projects root: `~/.claude/projects`.
pub fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("projects")
}

/// Returns the hook log file path: `~/.claude-memory/memory.log`.
pub fn default_log_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-memory")
        .join("memory.log")
}

/// Load settings from the given path, or the default path when `None`.
pub fn load_settings(path: Option<&Path>) -> Settings {
    let settings_path = match path {
        Some(p) => p.to_path_buf(),
        None => default_settings_path(),
    };

    let contents = match std::fs::read_to_string(&settings_path) {
        Ok(c) => c,
        Err(_) => return Settings::default(),
    };

    parse_settings(&contents)
}

/// Parse the YAML front matter out of a settings document. Anything that is
/// not a well-formed front-matter block yields the defaults.
pub fn parse_settings(contents: &str) -> Settings {
    let mut settings = Settings::default();

    let Some(front_matter) = front_matter_block(contents) else {
        return settings;
    };

    let overlay: SettingsOverlay = match serde_saphyr::from_str(front_matter) {
        Ok(o) => o,
        Err(e) => {
            tracing::debug!("settings front matter ignored: {e}");
            return settings;
        }
    };

    if let Some(v) = overlay.db_path {
        settings.db_path = v;
    }
    if let Some(v) = overlay.auto_inject_context {
        settings.auto_inject_context = v;
    }
    if let Some(v) = overlay.max_context_sessions {
        settings.max_context_sessions = v;
    }
    if let Some(v) = overlay.exclude_projects {
        settings.exclude_projects = v;
    }
    if let Some(v) = overlay.context_truncation_limit {
        settings.context_truncation_limit = v;
    }
    if let Some(v) = overlay.logging_enabled {
        settings.logging_enabled = v;
    }
    if let Some(v) = overlay.sync_on_stop {
        settings.sync_on_stop = v;
    }

    settings
}

/// Extract the text between the opening `---` line and the next `---` line.
fn front_matter_block(contents: &str) -> Option<&str> {
    let rest = contents.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.max_context_sessions, 2);
        assert_eq!(s.context_truncation_limit, 2000);
        assert!(s.auto_inject_context);
        assert!(s.sync_on_stop);
        assert!(!s.logging_enabled);
        assert!(s.exclude_projects.is_empty());
    }

    #[test]
    fn test_parse_front_matter() {
        let doc = "---\ndb_path: /tmp/test.db\nmax_context_sessions: 5\nexclude_projects:\n  - scratch\n  - tmp\n---\n\n# Notes\n\nFree-form text below the front matter is ignored.\n";
        let s = parse_settings(doc);
        assert_eq!(s.db_path, "/tmp/test.db");
        assert_eq!(s.max_context_sessions, 5);
        assert_eq!(s.exclude_projects, vec!["scratch", "tmp"]);
        // Untouched keys keep defaults
        assert_eq!(s.context_truncation_limit, 2000);
    }

    #[test]
    fn test_parse_bool_overrides() {
        let doc = "---\nauto_inject_context: false\nsync_on_stop: false\nlogging_enabled: true\n---\n";
        let s = parse_settings(doc);
        assert!(!s.auto_inject_context);
        assert!(!s.sync_on_stop);
        assert!(s.logging_enabled);
    }

    #[test]
    fn test_no_front_matter_yields_defaults() {
        let s = parse_settings("# Just a markdown file\n\ndb_path: /should/not/apply\n");
        assert_eq!(s.db_path, Settings::default().db_path);
    }

    #[test]
    fn test_malformed_front_matter_yields_defaults() {
        let s = parse_settings("---\nmax_context_sessions: [not an int\n---\n");
        assert_eq!(s.max_context_sessions, 2);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let s = load_settings(Some(Path::new("/nonexistent/settings.local.md")));
        assert_eq!(s.db_path, Settings::default().db_path);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/foo/bar");
        assert!(expanded.to_string_lossy().ends_with("foo/bar"));
        assert!(!expanded.to_string_lossy().starts_with('~'));

        let plain = expand_tilde("/absolute/path");
        assert_eq!(plain, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_default_paths() {
        assert!(default_settings_path()
            .to_string_lossy()
            .ends_with(".claude-memory/settings.local.md"));
        assert!(default_projects_dir()
            .to_string_lossy()
            .ends_with(".claude/projects"));
    }
}
