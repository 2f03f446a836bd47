//! Collaboration synchronizer: the dashboard reducer.
//!
//! [`DashboardState`] is a pure state machine.  Feed it inbound frames with
//! [`DashboardState::apply`] strictly in arrival order; feed it local edits
//! through the action methods, which update state optimistically and return
//! the command to put on the wire.  Reconciliation is last-writer-wins per
//! entity.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::error::SyncError;
use crate::history::{Change, History};
use crate::item_content::ItemContent;
use crate::model::{
    AgentMemory, AgentTask, DashboardEdge, DashboardItem, InboundMessage, ItemPatch, ItemType,
    MemoryKey, PresenceInfo, Position, Session, Size,
};
use crate::protocol::{DashboardCommand, DashboardFrame};

const INBOX_LIMIT: usize = 200;
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Which tasks a consumer wants mirrored locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskView {
    /// `None` shows every task; `Some(id)` shows dashboard-wide tasks plus that session's.
    pub session_id: Option<String>,
    pub include_completed: bool,
}

impl TaskView {
    pub fn admits(&self, task: &AgentTask) -> bool {
        let scoped_in = match (&self.session_id, &task.session_id) {
            (None, _) | (Some(_), None) => true,
            (Some(view), Some(own)) => view == own,
        };
        scoped_in && (self.include_completed || !task.status.is_closed())
    }
}

/// What a frame did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ignored,
    Changed,
    /// Presence frame: re-pull the roster from the transport.
    PresenceChanged,
}

/// Full state seeded from an out-of-band fetch.
#[derive(Debug, Clone, Default)]
pub struct Hydration {
    pub items: Vec<DashboardItem>,
    pub edges: Vec<DashboardEdge>,
    pub sessions: Vec<Session>,
    pub tasks: Vec<AgentTask>,
    pub memories: Vec<AgentMemory>,
}

#[derive(Debug, Clone, Default)]
pub struct DashboardState {
    items: Vec<DashboardItem>,
    edges: Vec<DashboardEdge>,
    sessions: Vec<Session>,
    presence: Vec<PresenceInfo>,
    tasks: Vec<AgentTask>,
    memories: Vec<AgentMemory>,
    inbox: VecDeque<InboundMessage>,
    task_view: TaskView,
    // Items removed by item_delete; a late session_update for one of them is stale.
    deleted_items: HashSet<String>,
    // Temporary ids of optimistic creates not yet acknowledged.
    pending_creates: HashSet<String>,
    history: History,
    // Commands the reducer itself needs sent (drained by the runner).
    outbox: Vec<DashboardCommand>,
    last_error: Option<SyncError>,
    contents: HashMap<String, DecodedContent>,
}

#[derive(Debug, Clone)]
struct DecodedContent {
    item_type: ItemType,
    raw: String,
    content: ItemContent,
}

impl DashboardState {
    pub fn new(task_view: TaskView) -> Self {
        Self {
            task_view,
            ..Default::default()
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn items(&self) -> &[DashboardItem] {
        &self.items
    }

    pub fn item(&self, id: &str) -> Option<&DashboardItem> {
        self.items.iter().find(|i| i.id == id)
    }

    #[cfg(test)]
    fn content(&self, item_id: &str) -> Option<&ItemContent> {
        self.contents.get(item_id).map(|d| &d.content)
    }

    /// Decoded content per item id.  Decoding happens once per content change.
    pub fn contents(&self) -> impl Iterator<Item = (&str, &ItemContent)> {
        self.contents.iter().map(|(id, d)| (id.as_str(), &d.content))
    }

    pub fn edges(&self) -> &[DashboardEdge] {
        &self.edges
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// The session a terminal block for `item_id` should bind to.
    pub fn session_for_item(&self, item_id: &str) -> Option<&Session> {
        self.sessions.iter().rev().find(|s| s.item_id == item_id)
    }

    pub fn presence(&self) -> &[PresenceInfo] {
        &self.presence
    }

    pub fn tasks(&self) -> &[AgentTask] {
        &self.tasks
    }

    pub fn memories(&self) -> &[AgentMemory] {
        &self.memories
    }

    pub fn memory(&self, key: &MemoryKey) -> Option<&AgentMemory> {
        self.memories.iter().find(|m| &m.composite_key() == key)
    }

    pub fn inbox(&self) -> impl Iterator<Item = &InboundMessage> {
        self.inbox.iter()
    }

    pub fn task_view(&self) -> &TaskView {
        &self.task_view
    }

    pub fn last_error(&self) -> Option<&SyncError> {
        self.last_error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<SyncError>) {
        self.last_error = error;
    }

    pub fn is_pending(&self, temp_id: &str) -> bool {
        self.pending_creates.contains(temp_id)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn take_outbox(&mut self) -> Vec<DashboardCommand> {
        std::mem::take(&mut self.outbox)
    }

    // ── Seeding ───────────────────────────────────────────────────────────

    pub fn hydrate(&mut self, seed: Hydration) {
        let known: HashSet<&str> = seed.items.iter().map(|i| i.id.as_str()).collect();
        self.edges = seed
            .edges
            .into_iter()
            .filter(|e| known.contains(e.source_item_id.as_str()) && known.contains(e.target_item_id.as_str()))
            .collect();
        self.items = seed.items;
        self.sessions = Vec::new();
        for session in seed.sessions {
            self.upsert_session(session);
        }
        let view = self.task_view.clone();
        self.tasks = seed.tasks.into_iter().filter(|t| view.admits(t)).collect();
        self.memories = Vec::new();
        for memory in seed.memories {
            let key = memory.composite_key();
            self.put_memory(key, memory);
        }
        self.pending_creates.clear();
        self.history.clear();
        self.refresh_contents();
    }

    pub fn set_task_view(&mut self, view: TaskView) {
        self.tasks.retain(|t| view.admits(t));
        self.task_view = view;
    }

    pub fn set_presence(&mut self, roster: Vec<PresenceInfo>) {
        self.presence = roster;
    }

    // ── Inbound frames ────────────────────────────────────────────────────

    pub fn apply(&mut self, frame: DashboardFrame) -> Outcome {
        let outcome = self.apply_frame(frame);
        if outcome == Outcome::Changed {
            self.refresh_contents();
        }
        outcome
    }

    fn apply_frame(&mut self, frame: DashboardFrame) -> Outcome {
        match frame {
            DashboardFrame::ItemCreate { item, temp_id } => self.on_item_create(item, temp_id),
            DashboardFrame::ItemUpdate { item } => {
                match self.items.iter_mut().find(|i| i.id == item.id) {
                    Some(existing) => {
                        *existing = item;
                        Outcome::Changed
                    }
                    None => {
                        debug!(item_id = %item.id, "item_update for unknown item ignored");
                        Outcome::Ignored
                    }
                }
            }
            DashboardFrame::ItemDelete { item_id } => {
                if self.remove_item(&item_id).is_some() {
                    Outcome::Changed
                } else {
                    Outcome::Ignored
                }
            }
            DashboardFrame::SessionUpdate { session } => {
                if self.deleted_items.contains(&session.item_id) {
                    debug!(session_id = %session.id, item_id = %session.item_id, "stale session_update for deleted item dropped");
                    return Outcome::Ignored;
                }
                self.upsert_session(session);
                Outcome::Changed
            }
            DashboardFrame::EdgeCreate { edge } => {
                if self.insert_edge(edge) {
                    Outcome::Changed
                } else {
                    Outcome::Ignored
                }
            }
            DashboardFrame::EdgeDelete { edge_id } => {
                let before = self.edges.len();
                self.edges.retain(|e| e.id != edge_id);
                if self.edges.len() == before {
                    debug!(%edge_id, "edge_delete for unknown edge ignored");
                    Outcome::Ignored
                } else {
                    Outcome::Changed
                }
            }
            DashboardFrame::TaskCreate { task } | DashboardFrame::TaskUpdate { task } => {
                self.on_task(task)
            }
            DashboardFrame::TaskDelete { task_id } => {
                let before = self.tasks.len();
                self.tasks.retain(|t| t.id != task_id);
                if self.tasks.len() == before {
                    Outcome::Ignored
                } else {
                    Outcome::Changed
                }
            }
            DashboardFrame::InboundMessage { message } => {
                self.inbox.push_back(message);
                while self.inbox.len() > INBOX_LIMIT {
                    self.inbox.pop_front();
                }
                Outcome::Changed
            }
            DashboardFrame::MemoryUpdate {
                key,
                session_id,
                memory,
            } => {
                let composite = MemoryKey { key, session_id };
                match memory {
                    Some(mut memory) => {
                        memory.key = composite.key.clone();
                        memory.session_id = composite.session_id.clone();
                        self.put_memory(composite, memory);
                        Outcome::Changed
                    }
                    None => {
                        let before = self.memories.len();
                        self.memories.retain(|m| m.composite_key() != composite);
                        if self.memories.len() == before {
                            Outcome::Ignored
                        } else {
                            Outcome::Changed
                        }
                    }
                }
            }
            DashboardFrame::Error { message } => {
                warn!(%message, "dashboard server reported an error");
                self.last_error = Some(SyncError::Server(message));
                Outcome::Changed
            }
            DashboardFrame::Join { .. }
            | DashboardFrame::Leave { .. }
            | DashboardFrame::Cursor { .. }
            | DashboardFrame::Select { .. }
            | DashboardFrame::Presence { .. } => Outcome::PresenceChanged,
        }
    }

    fn on_item_create(&mut self, item: DashboardItem, temp_id: Option<String>) -> Outcome {
        if let Some(temp_id) = temp_id.filter(|t| self.pending_creates.remove(t)) {
            if self.deleted_items.contains(&temp_id) {
                // Deleted locally before the server acknowledged it.
                debug!(%temp_id, item_id = %item.id, "acknowledged item was already deleted locally");
                self.outbox.push(DashboardCommand::ItemDelete { item_id: item.id });
                return Outcome::Ignored;
            }
            if self.item(&item.id).is_some() {
                // The server's own item_create already arrived; fold the temp item into it.
                self.items.retain(|i| i.id != temp_id);
            }
            self.remap(&temp_id, &item.id);
            if let Some(existing) = self.items.iter_mut().find(|i| i.id == item.id) {
                *existing = item;
            }
            return Outcome::Changed;
        }

        if self.item(&item.id).is_some() {
            debug!(item_id = %item.id, "duplicate item_create dropped");
            return Outcome::Ignored;
        }
        self.deleted_items.remove(&item.id);
        self.items.push(item);
        Outcome::Changed
    }

    fn on_task(&mut self, task: AgentTask) -> Outcome {
        let visible = self.task_view.admits(&task);
        let position = self.tasks.iter().position(|t| t.id == task.id);
        match (position, visible) {
            (Some(i), true) => {
                self.tasks[i] = task;
                Outcome::Changed
            }
            (Some(i), false) => {
                self.tasks.remove(i);
                Outcome::Changed
            }
            (None, true) => {
                self.tasks.push(task);
                Outcome::Changed
            }
            (None, false) => Outcome::Ignored,
        }
    }

    // ── Local actions ─────────────────────────────────────────────────────

    /// Insert an item under a temporary id and return the create command.
    pub fn create_item(
        &mut self,
        item_type: ItemType,
        content: String,
        position: Position,
        size: Size,
    ) -> (String, DashboardCommand) {
        let temp_id = format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4());
        let item = DashboardItem {
            id: temp_id.clone(),
            item_type,
            content,
            position,
            size,
            metadata: Default::default(),
        };
        self.items.push(item.clone());
        self.pending_creates.insert(temp_id.clone());
        self.history.record(Change::Created { item: item.clone() });
        self.refresh_contents();
        (
            temp_id.clone(),
            DashboardCommand::ItemCreate { item, temp_id },
        )
    }

    pub fn update_item(&mut self, item_id: &str, patch: ItemPatch) -> Option<DashboardCommand> {
        let item = self.items.iter_mut().find(|i| i.id == item_id)?;
        let before = restore_patch(item, &patch);
        patch.apply_to(item);
        self.history.record(Change::Updated {
            item_id: item_id.to_string(),
            before,
            after: patch.clone(),
        });
        self.refresh_contents();
        Some(DashboardCommand::ItemUpdate {
            item_id: item_id.to_string(),
            changes: patch,
        })
    }

    pub fn delete_item(&mut self, item_id: &str) -> Option<DashboardCommand> {
        let item = self.item(item_id)?.clone();
        let edges: Vec<DashboardEdge> = self
            .edges
            .iter()
            .filter(|e| e.touches(item_id))
            .cloned()
            .collect();
        self.remove_item(item_id);
        self.history.record(Change::Deleted { item, edges });
        self.refresh_contents();
        Some(DashboardCommand::ItemDelete {
            item_id: item_id.to_string(),
        })
    }

    /// Link two known items.  Returns `None` if either endpoint is unknown.
    pub fn connect_items(
        &mut self,
        source_item_id: &str,
        target_item_id: &str,
        source_handle: Option<String>,
        target_handle: Option<String>,
    ) -> Option<DashboardCommand> {
        let edge = DashboardEdge {
            id: format!("edge-{}", uuid::Uuid::new_v4()),
            source_item_id: source_item_id.to_string(),
            target_item_id: target_item_id.to_string(),
            source_handle,
            target_handle,
        };
        if !self.insert_edge(edge.clone()) {
            return None;
        }
        Some(DashboardCommand::EdgeCreate { edge })
    }

    pub fn disconnect_edge(&mut self, edge_id: &str) -> Option<DashboardCommand> {
        let before = self.edges.len();
        self.edges.retain(|e| e.id != edge_id);
        (self.edges.len() != before).then(|| DashboardCommand::EdgeDelete {
            edge_id: edge_id.to_string(),
        })
    }

    /// Revert the latest local change.  Returns the commands that carry the
    /// reversal to the server (empty when there is nothing to undo).
    pub fn undo(&mut self) -> Vec<DashboardCommand> {
        let Some(change) = self.history.take_undo() else {
            return Vec::new();
        };
        let commands = self.revert(&change);
        self.history.push_redo(change);
        self.refresh_contents();
        commands
    }

    pub fn redo(&mut self) -> Vec<DashboardCommand> {
        let Some(change) = self.history.take_redo() else {
            return Vec::new();
        };
        let commands = self.replay(&change);
        self.history.push_undo(change);
        self.refresh_contents();
        commands
    }

    fn revert(&mut self, change: &Change) -> Vec<DashboardCommand> {
        match change {
            Change::Created { item } => {
                self.remove_item(&item.id);
                vec![DashboardCommand::ItemDelete {
                    item_id: item.id.clone(),
                }]
            }
            Change::Updated { item_id, before, .. } => self.patch_quietly(item_id, before),
            Change::Deleted { item, edges } => self.restore(item, edges),
        }
    }

    fn replay(&mut self, change: &Change) -> Vec<DashboardCommand> {
        match change {
            Change::Created { item } => self.restore(item, &[]),
            Change::Updated { item_id, after, .. } => self.patch_quietly(item_id, after),
            Change::Deleted { item, .. } => {
                self.remove_item(&item.id);
                vec![DashboardCommand::ItemDelete {
                    item_id: item.id.clone(),
                }]
            }
        }
    }

    fn patch_quietly(&mut self, item_id: &str, patch: &ItemPatch) -> Vec<DashboardCommand> {
        match self.items.iter_mut().find(|i| i.id == item_id) {
            Some(item) => {
                patch.apply_to(item);
                vec![DashboardCommand::ItemUpdate {
                    item_id: item_id.to_string(),
                    changes: patch.clone(),
                }]
            }
            None => {
                debug!(%item_id, "undo/redo target no longer exists");
                Vec::new()
            }
        }
    }

    /// Re-create a removed item (and its edges) under its old id as a pending create.
    fn restore(&mut self, item: &DashboardItem, edges: &[DashboardEdge]) -> Vec<DashboardCommand> {
        if self.item(&item.id).is_some() {
            return Vec::new();
        }
        self.deleted_items.remove(&item.id);
        self.items.push(item.clone());
        self.pending_creates.insert(item.id.clone());
        let mut commands = vec![DashboardCommand::ItemCreate {
            item: item.clone(),
            temp_id: item.id.clone(),
        }];
        for edge in edges {
            if self.insert_edge(edge.clone()) {
                commands.push(DashboardCommand::EdgeCreate { edge: edge.clone() });
            }
        }
        commands
    }

    // ── Internals ─────────────────────────────────────────────────────────

    /// Rewrite a temporary id to the server id everywhere it is referenced.
    fn remap(&mut self, from: &str, to: &str) {
        debug!(%from, %to, "remapping optimistic item id");
        for item in &mut self.items {
            if item.id == from {
                item.id = to.to_string();
            }
        }
        for edge in &mut self.edges {
            if edge.source_item_id == from {
                edge.source_item_id = to.to_string();
            }
            if edge.target_item_id == from {
                edge.target_item_id = to.to_string();
            }
        }
        for session in &mut self.sessions {
            if session.item_id == from {
                session.item_id = to.to_string();
            }
        }
        for member in &mut self.presence {
            if member.selected_item_id.as_deref() == Some(from) {
                member.selected_item_id = Some(to.to_string());
            }
        }
        self.history.remap(from, to);
    }

    /// Remove an item and cascade to its sessions and edges.  Records a tombstone.
    fn remove_item(&mut self, item_id: &str) -> Option<DashboardItem> {
        self.deleted_items.insert(item_id.to_string());
        self.sessions.retain(|s| s.item_id != item_id);
        self.edges.retain(|e| !e.touches(item_id));
        for member in &mut self.presence {
            if member.selected_item_id.as_deref() == Some(item_id) {
                member.selected_item_id = None;
            }
        }
        let position = self.items.iter().position(|i| i.id == item_id);
        match position {
            Some(i) => Some(self.items.remove(i)),
            None => {
                debug!(%item_id, "item_delete for unknown item, cascade applied");
                None
            }
        }
    }

    fn insert_edge(&mut self, edge: DashboardEdge) -> bool {
        if self.edges.iter().any(|e| e.id == edge.id) {
            debug!(edge_id = %edge.id, "duplicate edge_create dropped");
            return false;
        }
        if self.item(&edge.source_item_id).is_none() || self.item(&edge.target_item_id).is_none() {
            warn!(edge_id = %edge.id, "edge references an unknown item, dropped");
            return false;
        }
        self.edges.push(edge);
        true
    }

    fn upsert_session(&mut self, session: Session) {
        if let Some(existing) = self.sessions.iter_mut().find(|s| s.id == session.id) {
            *existing = session;
            return;
        }
        // A new session for an item supersedes the previous record for it.
        self.sessions.retain(|s| s.item_id != session.item_id);
        self.sessions.push(session);
    }

    /// Decode content for items that are new or whose content changed, and
    /// drop entries for items that are gone.
    fn refresh_contents(&mut self) {
        let live: HashSet<&str> = self.items.iter().map(|i| i.id.as_str()).collect();
        self.contents.retain(|id, _| live.contains(id.as_str()));
        for item in &self.items {
            let fresh = self
                .contents
                .get(&item.id)
                .is_some_and(|d| d.item_type == item.item_type && d.raw == item.content);
            if !fresh {
                self.contents.insert(
                    item.id.clone(),
                    DecodedContent {
                        item_type: item.item_type,
                        raw: item.content.clone(),
                        content: ItemContent::decode(item.item_type, &item.content),
                    },
                );
            }
        }
    }

    fn put_memory(&mut self, key: MemoryKey, memory: AgentMemory) {
        match self.memories.iter_mut().find(|m| m.composite_key() == key) {
            Some(existing) => *existing = memory,
            None => self.memories.push(memory),
        }
    }
}

/// Patch restoring the fields `patch` is about to overwrite.
fn restore_patch(item: &DashboardItem, patch: &ItemPatch) -> ItemPatch {
    let full = ItemPatch::snapshot_of(item);
    ItemPatch {
        content: patch.content.as_ref().and(full.content),
        position: patch.position.and(full.position),
        size: patch.size.and(full.size),
        metadata: patch.metadata.as_ref().and(full.metadata),
    }
}
