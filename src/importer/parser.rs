use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::models::{ContentItem, ContentValue, KnownItem, LogRecord, NOISE_TYPES};

/// Spans injected by the host around slash-command traffic. Stripped from
/// user text before storage so searches hit what the user actually typed.
fn envelope_regexes() -> &'static [Regex; 4] {
    static RES: OnceLock<[Regex; 4]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?s)<command-name>.*?</command-name>").unwrap(),
            Regex::new(r"(?s)<command-message>.*?</command-message>").unwrap(),
            Regex::new(r"(?s)<command-args>.*?</command-args>").unwrap(),
            Regex::new(r"(?s)<local-command-stdout>.*?</local-command-stdout>").unwrap(),
        ]
    })
}

fn commit_subject_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"-m\s+["']([^"']+)["']"#).unwrap())
}

/// Parse a session log's bytes into its surviving records.
///
/// One JSON object per line, UTF-8 with replacement for invalid bytes.
/// Unparseable lines are dropped silently; noise record types and meta
/// records never make it out.
pub fn parse_log_bytes(bytes: &[u8]) -> Vec<LogRecord> {
    let mut records = Vec::new();

    for raw_line in bytes.split(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(raw_line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: LogRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(_) => continue,
        };

        if record.is_meta {
            continue;
        }
        if let Some(t) = record.record_type.as_deref() {
            if NOISE_TYPES.contains(&t) {
                continue;
            }
        }

        records.push(record);
    }

    records
}

/// Graph view: every surviving record that carries a UUID, regardless of
/// type. Non-message records can be intermediate nodes of the parent-pointer
/// tree.
pub fn graph_records(records: &[LogRecord]) -> Vec<&LogRecord> {
    records.iter().filter(|r| r.uuid.is_some()).collect()
}

/// Message view: user and assistant records only.
pub fn message_records(records: &[LogRecord]) -> Vec<&LogRecord> {
    records.iter().filter(|r| r.is_message()).collect()
}

/// The storable projection of one message's content.
#[derive(Debug, Default, PartialEq)]
pub struct ExtractedContent {
    pub text: String,
    pub has_tool_use: bool,
    pub has_thinking: bool,
    /// JSON object mapping tool name to invocation count, or None when the
    /// message used no tools.
    pub tool_summary: Option<String>,
}

/// Extract searchable text and tool/thinking markers from message content.
///
/// String content has command-envelope spans stripped. List content joins
/// text items with newlines; tool_use items are counted into the summary but
/// never materialized into the text body; tool_result items are dropped.
pub fn extract_content(content: Option<&ContentValue>) -> ExtractedContent {
    match content {
        None => ExtractedContent::default(),
        Some(ContentValue::Text(text)) => {
            let mut cleaned = text.clone();
            for re in envelope_regexes() {
                cleaned = re.replace_all(&cleaned, "").into_owned();
            }
            ExtractedContent {
                text: cleaned.trim().to_string(),
                ..Default::default()
            }
        }
        Some(ContentValue::Items(items)) => {
            let mut texts: Vec<&str> = Vec::new();
            let mut has_tool_use = false;
            let mut has_thinking = false;
            let mut tool_counts: BTreeMap<&str, u32> = BTreeMap::new();

            for item in items {
                match item {
                    ContentItem::Known(KnownItem::Text { text }) => texts.push(text),
                    ContentItem::Known(KnownItem::ToolUse { name, .. }) => {
                        has_tool_use = true;
                        if !name.is_empty() {
                            *tool_counts.entry(name).or_insert(0) += 1;
                        }
                    }
                    ContentItem::Known(KnownItem::Thinking {}) => has_thinking = true,
                    ContentItem::Known(KnownItem::ToolResult {}) => {}
                    ContentItem::Other(_) => {}
                }
            }

            let tool_summary = if tool_counts.is_empty() {
                None
            } else {
                serde_json::to_string(&tool_counts).ok()
            };

            ExtractedContent {
                text: texts.join("\n").trim().to_string(),
                has_tool_use,
                has_thinking,
                tool_summary,
            }
        }
    }
}

/// A user record whose content list opens with a tool_result is the harness
/// feeding tool output back, not the user speaking.
pub fn is_tool_result(content: Option<&ContentValue>) -> bool {
    if let Some(ContentValue::Items(items)) = content {
        matches!(
            items.first(),
            Some(ContentItem::Known(KnownItem::ToolResult {}))
        )
    } else {
        false
    }
}

/// File paths touched by Edit/Write/MultiEdit tool uses, in order.
pub fn files_modified(content: Option<&ContentValue>) -> Vec<String> {
    let mut files = Vec::new();
    if let Some(ContentValue::Items(items)) = content {
        for item in items {
            if let ContentItem::Known(KnownItem::ToolUse { name, input }) = item {
                if matches!(name.as_str(), "Edit" | "Write" | "MultiEdit") {
                    if let Some(fp) = input.get("file_path").and_then(|v| v.as_str()) {
                        files.push(fp.to_string());
                    }
                }
            }
        }
    }
    files
}

/// Commit subjects from `git commit` invocations inside Bash tool uses:
/// the first quoted `-m` argument, capped at 100 characters.
pub fn commit_subjects(content: Option<&ContentValue>) -> Vec<String> {
    let mut commits = Vec::new();
    if let Some(ContentValue::Items(items)) = content {
        for item in items {
            if let ContentItem::Known(KnownItem::ToolUse { name, input }) = item {
                if name == "Bash" {
                    let cmd = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
                    if cmd.contains("git commit") {
                        if let Some(caps) = commit_subject_regex().captures(cmd) {
                            commits.push(caps[1].chars().take(100).collect());
                        }
                    }
                }
            }
        }
    }
    commits
}
