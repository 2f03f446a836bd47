//! Turn-taking for one terminal session.
//!
//! The server is the authority on who controls a terminal; this engine only
//! mirrors its broadcasts and decides whether local input may go out.  The
//! gating result is derived on every call, never cached.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{Identity, Session};
use crate::protocol::TerminalCommand;
use crate::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Why local input is currently refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBlockReason {
    None,
    Disconnected,
    AgentRunning,
    NotController,
}

impl std::fmt::Display for InputBlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            InputBlockReason::None => "input allowed",
            InputBlockReason::Disconnected => "terminal is not connected",
            InputBlockReason::AgentRunning => "an agent is running",
            InputBlockReason::NotController => "you do not control this terminal",
        };
        f.write_str(text)
    }
}

/// Published view of turn-taking for UI consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnTakingState {
    pub controller: String,
    pub controller_name: String,
    pub is_controller: bool,
    pub has_pending_request: bool,
    pub pending_requests: Vec<String>,
    pub input_blocked: bool,
    pub input_block_reason: InputBlockReason,
}

#[derive(Debug, Clone)]
pub struct TurnTaking {
    identity: Identity,
    owner_user_id: Option<String>,
    connection: ConnectionState,
    controller: String,
    controller_name: String,
    // Server order, kept verbatim.
    pending_requests: Vec<String>,
    agent_state: Option<AgentState>,
    // Set once auto-control fired for the current connection.
    auto_control_latched: bool,
}

impl TurnTaking {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            owner_user_id: None,
            connection: ConnectionState::Disconnected,
            controller: String::new(),
            controller_name: String::new(),
            pending_requests: Vec::new(),
            agent_state: None,
            auto_control_latched: false,
        }
    }

    /// Bind to a (new) session.  Control state from the previous session is dropped.
    pub fn bind_session(&mut self, session: Option<&Session>) {
        self.owner_user_id = session.map(|s| s.owner_user_id.clone());
        self.controller.clear();
        self.controller_name.clear();
        self.pending_requests.clear();
        self.agent_state = None;
        self.auto_control_latched = false;
    }

    // ── Inputs ────────────────────────────────────────────────────────────

    /// Returns `take_control` when auto-control fires on this transition.
    pub fn on_connection(&mut self, to: ConnectionState) -> Option<TerminalCommand> {
        self.connection = to;
        if to != ConnectionState::Connected {
            if self.auto_control_latched {
                debug!(state = %to, "connection dropped, auto-control latch reset");
            }
            self.auto_control_latched = false;
            return None;
        }
        self.maybe_auto_control()
    }

    pub fn on_turn_taking(
        &mut self,
        controller: String,
        controller_name: String,
        pending_requests: Vec<String>,
    ) -> Option<TerminalCommand> {
        self.controller = controller;
        self.controller_name = controller_name;
        self.pending_requests = pending_requests;
        self.maybe_auto_control()
    }

    pub fn on_agent_state(&mut self, state: Option<AgentState>) -> Option<TerminalCommand> {
        self.agent_state = state;
        self.maybe_auto_control()
    }

    fn maybe_auto_control(&mut self) -> Option<TerminalCommand> {
        if self.auto_control_latched
            || self.connection != ConnectionState::Connected
            || !self.is_owner()
            || !self.controller.is_empty()
            || self.agent_running()
        {
            return None;
        }
        self.auto_control_latched = true;
        info!(user_id = %self.identity.user_id, "requesting control automatically");
        Some(TerminalCommand::TakeControl)
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn is_owner(&self) -> bool {
        self.owner_user_id
            .as_deref()
            .is_some_and(|owner| self.identity.owns(owner))
    }

    pub fn is_controller(&self) -> bool {
        !self.identity.user_id.is_empty() && self.controller == self.identity.user_id
    }

    pub fn agent_running(&self) -> bool {
        self.agent_state == Some(AgentState::Running)
    }

    pub fn agent_state(&self) -> Option<AgentState> {
        self.agent_state
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn auto_control_latched(&self) -> bool {
        self.auto_control_latched
    }

    /// First failing condition, in priority order.
    pub fn block_reason(&self) -> InputBlockReason {
        if self.connection != ConnectionState::Connected {
            InputBlockReason::Disconnected
        } else if self.agent_running() {
            InputBlockReason::AgentRunning
        } else if !self.is_owner() || !self.is_controller() {
            InputBlockReason::NotController
        } else {
            InputBlockReason::None
        }
    }

    pub fn can_type(&self) -> bool {
        self.block_reason() == InputBlockReason::None
    }

    pub fn state(&self) -> TurnTakingState {
        let reason = self.block_reason();
        TurnTakingState {
            controller: self.controller.clone(),
            controller_name: self.controller_name.clone(),
            is_controller: self.is_controller(),
            has_pending_request: self.pending_requests.contains(&self.identity.user_id),
            pending_requests: self.pending_requests.clone(),
            input_blocked: reason != InputBlockReason::None,
            input_block_reason: reason,
        }
    }
}
