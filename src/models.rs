use serde::Deserialize;

// ---------------------------------------------------------------------------
// JSONL log records
// ---------------------------------------------------------------------------

/// Record types that never carry conversation content and are dropped before
/// either parser view is built.
pub const NOISE_TYPES: &[&str] = &["progress", "file-history-snapshot", "queue-operation"];

/// One line of a session log file.
///
/// The wire format carries many more fields than we consume; everything not
/// listed here is ignored. Unknown `type` values are kept as graph nodes but
/// never yielded as messages.
#[derive(Debug, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "type")]
    pub record_type: Option<String>,
    pub uuid: Option<String>,
    #[serde(rename = "parentUuid")]
    pub parent_uuid: Option<String>,
    pub timestamp: Option<String>,
    pub cwd: Option<String>,
    #[serde(rename = "gitBranch")]
    pub git_branch: Option<String>,
    #[serde(rename = "isMeta", default)]
    pub is_meta: bool,
    pub message: Option<MessageBody>,
}

impl LogRecord {
    pub fn is_user(&self) -> bool {
        self.record_type.as_deref() == Some("user")
    }

    pub fn is_assistant(&self) -> bool {
        self.record_type.as_deref() == Some("assistant")
    }

    /// True for records that participate in the message stream.
    pub fn is_message(&self) -> bool {
        self.is_user() || self.is_assistant()
    }

    /// Timestamp as a sortable string. Missing timestamps sort lowest.
    pub fn timestamp_key(&self) -> &str {
        self.timestamp.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    pub content: Option<ContentValue>,
}

/// `message.content` is either a plain string or an ordered list of items.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContentValue {
    Text(String),
    Items(Vec<ContentItem>),
}

/// One element of a content list. The `Other` arm absorbs item shapes we do
/// not consume (unknown types, malformed known types) so a single odd item
/// never sinks the whole record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContentItem {
    Known(KnownItem),
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum KnownItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename = "thinking")]
    Thinking {},
    #[serde(rename = "tool_result")]
    ToolResult {},
}

// ---------------------------------------------------------------------------
// Hook envelopes
// ---------------------------------------------------------------------------

/// Input delivered on stdin to both hook entry points. The SessionStart hook
/// uses all three fields; the Stop hook only needs `session_id`.
#[derive(Debug, Default, Deserialize)]
pub struct HookInput {
    pub cwd: Option<String>,
    pub session_id: Option<String>,
    pub source: Option<String>,
}
