//! Shared dashboard entities mirrored locally by the synchronizer.
//!
//! Everything here is plain data: safe to clone, serialize, and hand to UI
//! consumers.  Mutation rules live in [`crate::sync`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Items ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Note,
    Todo,
    Terminal,
    Browser,
    Link,
    Recipe,
    Integration,
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ItemType::Note => "note",
            ItemType::Todo => "todo",
            ItemType::Terminal => "terminal",
            ItemType::Browser => "browser",
            ItemType::Link => "link",
            ItemType::Recipe => "recipe",
            ItemType::Integration => "integration",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Default for Size {
    fn default() -> Self {
        Self {
            width: 320.0,
            height: 240.0,
        }
    }
}

/// A block on the canvas.  `content` is the raw per-type state; decode it
/// with [`crate::item_content::ItemContent::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub size: Size,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Fields a local edit may change.  `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl ItemPatch {
    pub fn apply_to(&self, item: &mut DashboardItem) {
        if let Some(content) = &self.content {
            item.content = content.clone();
        }
        if let Some(position) = self.position {
            item.position = position;
        }
        if let Some(size) = self.size {
            item.size = size;
        }
        if let Some(metadata) = &self.metadata {
            item.metadata = metadata.clone();
        }
    }

    /// Patch that restores every patchable field of `item`.
    pub fn snapshot_of(item: &DashboardItem) -> Self {
        Self {
            content: Some(item.content.clone()),
            position: Some(item.position),
            size: Some(item.size),
            metadata: Some(item.metadata.clone()),
        }
    }
}

// ── Edges ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardEdge {
    pub id: String,
    pub source_item_id: String,
    pub target_item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl DashboardEdge {
    pub fn touches(&self, item_id: &str) -> bool {
        self.source_item_id == item_id || self.target_item_id == item_id
    }
}

// ── Sessions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Active,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub dashboard_id: String,
    pub item_id: String,
    pub owner_user_id: String,
    #[serde(default)]
    pub sandbox_session_id: String,
    #[serde(default)]
    pub pty_id: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
}

// ── Presence ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub cursor: Option<Cursor>,
    #[serde(default)]
    pub selected_item_id: Option<String>,
    #[serde(default)]
    pub connected_at: u64,
}

// ── Tasks & memories ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Completed and cancelled tasks are hidden by status-filtered views.
    pub fn is_closed(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTask {
    pub id: String,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default, rename = "sessionId", alias = "session_id")]
    pub session_id: Option<String>,
}

/// Memories have no id of their own: `(key, session_id)` identifies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryKey {
    pub key: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMemory {
    pub key: String,
    #[serde(default, rename = "sessionId", alias = "session_id")]
    pub session_id: Option<String>,
    pub value: Value,
    #[serde(default)]
    pub updated_at: String,
}

impl AgentMemory {
    pub fn composite_key(&self) -> MemoryKey {
        MemoryKey {
            key: self.key.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

/// Free-form message pushed to the dashboard (agent notes, integrations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub received_at: String,
}

// ── Identity ──────────────────────────────────────────────────────────────

/// The local user, as seen by the presence/identity source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
        }
    }

    /// Whether this user is the owner recorded on a session.
    pub fn owns(&self, owner_user_id: &str) -> bool {
        !self.user_id.is_empty() && owner_user_id == self.user_id
    }
}

pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
