//! Wire frames for the dashboard-wide channel and the per-terminal channel.
//!
//! Every frame is a JSON object with a `type` discriminator.  Inbound frames
//! are decoded with [`DashboardFrame::parse`] / [`TerminalFrame::parse`],
//! which tell a malformed frame apart from one of an unknown type so the
//! caller can log the right thing and carry on.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::model::{
    AgentMemory, AgentTask, Cursor, DashboardEdge, DashboardItem, InboundMessage, ItemPatch,
    PresenceInfo, Session,
};
use crate::turn_taking::AgentState;

// ── Dashboard channel ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardFrame {
    Join {
        user: PresenceInfo,
    },
    Leave {
        user_id: String,
    },
    Cursor {
        user_id: String,
        #[serde(default)]
        cursor: Option<Cursor>,
    },
    Select {
        user_id: String,
        #[serde(default)]
        item_id: Option<String>,
    },
    Presence {
        users: Vec<PresenceInfo>,
    },
    ItemCreate {
        item: DashboardItem,
        /// Echo of the client's temporary id when this acknowledges an optimistic create.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    ItemUpdate {
        item: DashboardItem,
    },
    ItemDelete {
        item_id: String,
    },
    SessionUpdate {
        session: Session,
    },
    EdgeCreate {
        edge: DashboardEdge,
    },
    EdgeDelete {
        edge_id: String,
    },
    TaskCreate {
        task: AgentTask,
    },
    TaskUpdate {
        task: AgentTask,
    },
    TaskDelete {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    InboundMessage {
        message: InboundMessage,
    },
    MemoryUpdate {
        key: String,
        #[serde(default, rename = "sessionId")]
        session_id: Option<String>,
        /// `None` (JSON `null`) removes the memory.
        #[serde(default)]
        memory: Option<AgentMemory>,
    },
    Error {
        message: String,
    },
}

const DASHBOARD_FRAME_TYPES: &[&str] = &[
    "join",
    "leave",
    "cursor",
    "select",
    "presence",
    "item_create",
    "item_update",
    "item_delete",
    "session_update",
    "edge_create",
    "edge_delete",
    "task_create",
    "task_update",
    "task_delete",
    "inbound_message",
    "memory_update",
    "error",
];

/// Frame types that change the presence roster.
pub const PRESENCE_FRAME_TYPES: &[&str] = &["join", "leave", "cursor", "select", "presence"];

impl DashboardFrame {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        decode_frame(raw, DASHBOARD_FRAME_TYPES)
    }
}

/// Commands the local user sends on the dashboard channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardCommand {
    Cursor {
        x: f64,
        y: f64,
    },
    Select {
        item_id: Option<String>,
    },
    ItemCreate {
        item: DashboardItem,
        temp_id: String,
    },
    ItemUpdate {
        item_id: String,
        changes: ItemPatch,
    },
    ItemDelete {
        item_id: String,
    },
    EdgeCreate {
        edge: DashboardEdge,
    },
    EdgeDelete {
        edge_id: String,
    },
}

// ── Terminal channel ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalFrame {
    Output {
        data: String,
    },
    TurnTaking {
        #[serde(default)]
        controller: String,
        #[serde(default)]
        controller_name: String,
        #[serde(default)]
        pending_requests: Vec<String>,
    },
    AgentState {
        #[serde(default)]
        state: Option<AgentState>,
    },
    PtyClosed {
        #[serde(default)]
        exit_code: Option<i32>,
    },
    AgentComplete {
        text: String,
    },
    Error {
        message: String,
    },
}

const TERMINAL_FRAME_TYPES: &[&str] = &[
    "output",
    "turn_taking",
    "agent_state",
    "pty_closed",
    "agent_complete",
    "error",
];

impl TerminalFrame {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        decode_frame(raw, TERMINAL_FRAME_TYPES)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TerminalCommand {
    Input { data: String },
    /// Base64-encoded bytes.
    RawInput { data: String },
    Resize { cols: u16, rows: u16 },
    TakeControl,
    RequestControl,
    GrantControl { to_user_id: String },
    RevokeControl,
}

impl TerminalCommand {
    pub fn raw_input(bytes: &[u8]) -> Self {
        use base64::{Engine as _, engine::general_purpose};
        TerminalCommand::RawInput {
            data: general_purpose::STANDARD.encode(bytes),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Read the `type` discriminator of a frame without decoding the rest.
pub fn frame_type(value: &Value) -> Option<&str> {
    value.get("type").and_then(|t| t.as_str())
}

fn decode_frame<T: DeserializeOwned>(raw: &str, known: &[&str]) -> Result<T, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let kind = frame_type(&value).ok_or(ProtocolError::MissingType)?;
    if !known.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }
    Ok(serde_json::from_value(value)?)
}
