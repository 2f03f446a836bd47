//! Presence roster tracked by the dashboard transport.
//!
//! The transport feeds every inbound presence frame through [`Roster::observe`]
//! before fanning the frame out, so a subscriber that re-pulls the roster
//! after a presence frame always sees that frame's effect.

use serde_json::Value;
use tracing::debug;

use crate::model::{PresenceInfo, current_timestamp_ms};
use crate::protocol::{DashboardFrame, PRESENCE_FRAME_TYPES, frame_type};

#[derive(Debug, Clone, Default)]
pub struct Roster {
    // Join order is preserved.
    members: Vec<PresenceInfo>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a raw frame if it affects presence.  Returns `true` when it did.
    pub fn observe(&mut self, value: &Value) -> bool {
        let Some(kind) = frame_type(value) else {
            return false;
        };
        if !PRESENCE_FRAME_TYPES.contains(&kind) {
            return false;
        }
        let frame: DashboardFrame = match serde_json::from_value(value.clone()) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(kind, error = %e, "ignoring malformed presence frame");
                return false;
            }
        };
        self.apply(frame);
        true
    }

    pub fn apply(&mut self, frame: DashboardFrame) {
        match frame {
            DashboardFrame::Join { mut user } => {
                if user.connected_at == 0 {
                    user.connected_at = current_timestamp_ms();
                }
                match self.members.iter_mut().find(|m| m.user_id == user.user_id) {
                    Some(existing) => *existing = user,
                    None => self.members.push(user),
                }
            }
            DashboardFrame::Leave { user_id } => {
                self.members.retain(|m| m.user_id != user_id);
            }
            DashboardFrame::Cursor { user_id, cursor } => {
                if let Some(member) = self.member_mut(&user_id) {
                    member.cursor = cursor;
                }
            }
            DashboardFrame::Select { user_id, item_id } => {
                if let Some(member) = self.member_mut(&user_id) {
                    member.selected_item_id = item_id;
                }
            }
            DashboardFrame::Presence { users } => {
                self.members = users;
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> Vec<PresenceInfo> {
        self.members.clone()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    fn member_mut(&mut self, user_id: &str) -> Option<&mut PresenceInfo> {
        self.members.iter_mut().find(|m| m.user_id == user_id)
    }
}
