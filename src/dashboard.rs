//! Dashboard-wide channel runner.
//!
//! Owns the dashboard transport and a [`DashboardState`] reducer.  A single
//! task applies inbound frames strictly in arrival order and publishes a
//! fresh [`DashboardSnapshot`] after each one; local actions update the same
//! state optimistically and put the matching command on the wire.  Commands
//! produced while the link is down are queued and flushed, in order, once it
//! comes back.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dataflow::DataFlowBus;
use crate::error::SyncError;
use crate::item_content::ItemContent;
use crate::model::{
    AgentMemory, AgentTask, DashboardEdge, DashboardItem, Identity, InboundMessage, ItemPatch,
    ItemType, Position, PresenceInfo, Session, Size,
};
use crate::protocol::{DashboardCommand, DashboardFrame};
use crate::sync::{DashboardState, Hydration, Outcome, TaskView};
use crate::transport::{
    ChannelEvent, ConnectionState, Connector, ReconnectPolicy, Subscription, Transport,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSnapshot {
    pub connection: ConnectionState,
    pub presence: Vec<PresenceInfo>,
    pub items: Vec<DashboardItem>,
    /// Decoded content of each item, keyed by item id.
    pub contents: HashMap<String, ItemContent>,
    pub edges: Vec<DashboardEdge>,
    pub sessions: Vec<Session>,
    pub tasks: Vec<AgentTask>,
    pub memories: Vec<AgentMemory>,
    pub inbox: Vec<InboundMessage>,
    pub error: Option<SyncError>,
    pub can_undo: bool,
    pub can_redo: bool,
    /// Local edits waiting for the link to come back.
    pub queued_commands: usize,
}

#[derive(Debug, Clone)]
pub struct DashboardOptions {
    pub server_url: String,
    pub dashboard_id: String,
    pub identity: Identity,
    pub policy: ReconnectPolicy,
    pub task_view: TaskView,
}

pub fn dashboard_url(server_url: &str, dashboard_id: &str, identity: &Identity) -> String {
    format!(
        "{}/dashboards/{}/ws?user_id={}&user_name={}",
        server_url.trim_end_matches('/'),
        urlencoding::encode(dashboard_id),
        urlencoding::encode(&identity.user_id),
        urlencoding::encode(&identity.user_name),
    )
}

struct Shared {
    state: DashboardState,
    connection: ConnectionState,
    queued: VecDeque<DashboardCommand>,
}

impl Shared {
    /// Send now, or queue behind earlier unsent commands.
    fn deliver(&mut self, transport: &Transport, command: DashboardCommand) {
        if self.queued.is_empty() && transport.send(&command) {
            return;
        }
        debug!(?command, queued = self.queued.len() + 1, "dashboard offline, command queued");
        self.queued.push_back(command);
    }

    fn flush_queued(&mut self, transport: &Transport) {
        let before = self.queued.len();
        while let Some(command) = self.queued.front() {
            if !transport.send(command) {
                break;
            }
            self.queued.pop_front();
        }
        if before > 0 {
            info!(sent = before - self.queued.len(), left = self.queued.len(), "flushed queued dashboard commands");
        }
    }

    fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            connection: self.connection,
            presence: self.state.presence().to_vec(),
            items: self.state.items().to_vec(),
            contents: self
                .state
                .contents()
                .map(|(id, content)| (id.to_string(), content.clone()))
                .collect(),
            edges: self.state.edges().to_vec(),
            sessions: self.state.sessions().to_vec(),
            tasks: self.state.tasks().to_vec(),
            memories: self.state.memories().to_vec(),
            inbox: self.state.inbox().cloned().collect(),
            error: self.state.last_error().cloned(),
            can_undo: self.state.can_undo(),
            can_redo: self.state.can_redo(),
            queued_commands: self.queued.len(),
        }
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct DashboardSync {
    transport: Transport,
    shared: Arc<Mutex<Shared>>,
    publisher: Arc<watch::Sender<DashboardSnapshot>>,
    snapshot: watch::Receiver<DashboardSnapshot>,
    bus: DataFlowBus,
    alive: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl DashboardSync {
    /// Start the dashboard channel.  Must be called inside a tokio runtime.
    pub fn start(options: DashboardOptions, connector: Arc<dyn Connector>, bus: DataFlowBus) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            state: DashboardState::new(options.task_view.clone()),
            connection: ConnectionState::Disconnected,
            queued: VecDeque::new(),
        }));
        let (tx, rx) = watch::channel(lock(&shared).snapshot());
        let publisher = Arc::new(tx);

        let transport = Transport::new(
            format!("dashboard:{}", options.dashboard_id),
            dashboard_url(&options.server_url, &options.dashboard_id, &options.identity),
            connector,
            options.policy.clone(),
        );
        let (subscription, events) = transport.subscribe();
        let alive = Arc::new(AtomicBool::new(true));

        let runner = Runner {
            transport: transport.clone(),
            shared: Arc::clone(&shared),
            publisher: Arc::clone(&publisher),
            bus: bus.clone(),
            alive: Arc::clone(&alive),
        };
        let task = tokio::spawn(runner.run(subscription, events));
        info!(dashboard_id = %options.dashboard_id, "starting dashboard sync");
        transport.connect();

        Self {
            transport,
            shared,
            publisher,
            snapshot: rx,
            bus,
            alive,
            task: Some(task),
        }
    }

    pub fn watch(&self) -> watch::Receiver<DashboardSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn bus(&self) -> &DataFlowBus {
        &self.bus
    }

    /// Seed state fetched out of band.
    pub fn hydrate(&self, seed: Hydration) {
        self.mutate(|state| {
            state.hydrate(seed);
            Vec::new()
        });
    }

    pub fn set_task_view(&self, view: TaskView) {
        self.mutate(|state| {
            state.set_task_view(view);
            Vec::new()
        });
    }

    pub fn send_cursor(&self, x: f64, y: f64) -> bool {
        self.transport.send(&DashboardCommand::Cursor { x, y })
    }

    pub fn select_item(&self, item_id: Option<&str>) -> bool {
        self.transport.send(&DashboardCommand::Select {
            item_id: item_id.map(str::to_string),
        })
    }

    /// Returns the temporary id of the new item.
    pub fn create_item(&self, item_type: ItemType, content: String, position: Position, size: Size) -> String {
        let mut temp_id = String::new();
        self.mutate(|state| {
            let (id, command) = state.create_item(item_type, content, position, size);
            temp_id = id;
            vec![command]
        });
        temp_id
    }

    pub fn update_item(&self, item_id: &str, patch: ItemPatch) -> bool {
        self.mutate(|state| state.update_item(item_id, patch).into_iter().collect())
    }

    pub fn delete_item(&self, item_id: &str) -> bool {
        self.mutate(|state| state.delete_item(item_id).into_iter().collect())
    }

    pub fn connect_items(
        &self,
        source_item_id: &str,
        target_item_id: &str,
        source_handle: Option<String>,
        target_handle: Option<String>,
    ) -> bool {
        self.mutate(|state| {
            state
                .connect_items(source_item_id, target_item_id, source_handle, target_handle)
                .into_iter()
                .collect()
        })
    }

    pub fn disconnect_edge(&self, edge_id: &str) -> bool {
        self.mutate(|state| state.disconnect_edge(edge_id).into_iter().collect())
    }

    pub fn undo(&self) -> bool {
        self.mutate(|state| state.undo())
    }

    pub fn redo(&self) -> bool {
        self.mutate(|state| state.redo())
    }

    pub fn reconnect(&self) {
        self.transport.reconnect();
    }

    /// Stop processing immediately and close the channel.
    pub fn shutdown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.transport.disconnect();
    }

    /// Apply a local edit and send (or queue) what it produced.  Returns
    /// whether the edit changed anything.
    fn mutate(&self, edit: impl FnOnce(&mut DashboardState) -> Vec<DashboardCommand>) -> bool {
        let (changed, snapshot) = {
            let mut shared = lock(&self.shared);
            let mut commands = edit(&mut shared.state);
            commands.extend(shared.state.take_outbox());
            self.bus.set_routes(shared.state.edges());
            let changed = !commands.is_empty();
            for command in commands {
                shared.deliver(&self.transport, command);
            }
            (changed, shared.snapshot())
        };
        self.publisher.send_replace(snapshot);
        changed
    }
}

impl Drop for DashboardSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Runner {
    transport: Transport,
    shared: Arc<Mutex<Shared>>,
    publisher: Arc<watch::Sender<DashboardSnapshot>>,
    bus: DataFlowBus,
    alive: Arc<AtomicBool>,
}

impl Runner {
    async fn run(self, mut subscription: Subscription, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            if !self.alive.load(Ordering::SeqCst) {
                break;
            }
            let snapshot = {
                let mut shared = lock(&self.shared);
                if !self.handle(&mut shared, event) {
                    continue;
                }
                for command in shared.state.take_outbox() {
                    shared.deliver(&self.transport, command);
                }
                self.bus.set_routes(shared.state.edges());
                shared.snapshot()
            };
            self.publisher.send_replace(snapshot);
        }
        subscription.unsubscribe();
        debug!(channel = %self.transport.name(), "dashboard runner stopped");
    }

    /// Returns whether anything visible changed.
    fn handle(&self, shared: &mut Shared, event: ChannelEvent) -> bool {
        match event {
            ChannelEvent::State { to, error, .. } => {
                shared.connection = to;
                match (to, error) {
                    (ConnectionState::Failed, Some(e)) => shared.state.set_error(Some(e.into())),
                    (ConnectionState::Connected, _) => {
                        if matches!(shared.state.last_error(), Some(SyncError::Transport(_))) {
                            shared.state.set_error(None);
                        }
                        shared.flush_queued(&self.transport);
                    }
                    _ => {}
                }
                // Peers seen on a dead link are stale until the server re-announces them.
                if matches!(
                    to,
                    ConnectionState::Reconnecting | ConnectionState::Disconnected | ConnectionState::Failed
                ) {
                    shared.state.set_presence(Vec::new());
                }
                true
            }
            ChannelEvent::Frame(text) => {
                let frame = match DashboardFrame::parse(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(channel = %self.transport.name(), error = %e, "ignoring dashboard frame");
                        return false;
                    }
                };
                match shared.state.apply(frame) {
                    Outcome::Ignored => false,
                    Outcome::Changed => true,
                    Outcome::PresenceChanged => {
                        shared.state.set_presence(self.transport.roster());
                        true
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::{FlowPayload, PORT_AGENT_OUTPUT};
    use crate::transport::testing::{FakeConnector, FakeServerEnd, fast_policy};
    use serde_json::json;
    use std::time::Duration;

    fn options() -> DashboardOptions {
        DashboardOptions {
            server_url: "ws://fake".into(),
            dashboard_id: "dash1".into(),
            identity: Identity::new("me", "Me Myself"),
            policy: fast_policy(3),
            task_view: TaskView::default(),
        }
    }

    async fn wait_until(
        rx: &mut watch::Receiver<DashboardSnapshot>,
        pred: impl Fn(&DashboardSnapshot) -> bool,
    ) -> DashboardSnapshot {
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| pred(s)))
            .await
            .expect("timed out waiting for dashboard snapshot")
            .expect("dashboard runner stopped")
            .clone()
    }

    async fn started() -> (DashboardSync, FakeServerEnd, watch::Receiver<DashboardSnapshot>) {
        let (connector, mut servers) = FakeConnector::new();
        let sync = DashboardSync::start(options(), connector, DataFlowBus::new());
        let server = servers.recv().await.unwrap();
        let mut rx = sync.watch();
        wait_until(&mut rx, |s| s.connection == ConnectionState::Connected).await;
        (sync, server, rx)
    }

    fn item(id: &str) -> serde_json::Value {
        json!({"id": id, "type": "terminal", "content": ""})
    }

    #[test]
    fn url_carries_identity() {
        assert_eq!(
            dashboard_url("ws://h/", "d 1", &Identity::new("u1", "Ada L")),
            "ws://h/dashboards/d%201/ws?user_id=u1&user_name=Ada%20L"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn presence_is_pulled_from_transport_roster() {
        let (_sync, server, mut rx) = started().await;
        server.push(json!({"type": "join", "user": {"user_id": "u2", "user_name": "Bob"}}));
        server.push(json!({"type": "item_create", "item": item("i1")}));
        let snap = wait_until(&mut rx, |s| !s.items.is_empty()).await;
        assert_eq!(snap.presence.len(), 1);
        assert_eq!(snap.presence[0].user_name, "Bob");

        server.push(json!({"type": "leave", "user_id": "u2"}));
        wait_until(&mut rx, |s| s.presence.is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_do_not_stop_processing() {
        let (_sync, server, mut rx) = started().await;
        let _ = server.to_client.send("{{{".to_string());
        server.push(json!({"type": "item_delete"}));
        server.push(json!({"type": "item_create", "item": item("i1")}));
        let snap = wait_until(&mut rx, |s| !s.items.is_empty()).await;
        assert_eq!(snap.items[0].id, "i1");
    }

    #[tokio::test(start_paused = true)]
    async fn delete_cascades_through_runner() {
        let (_sync, server, mut rx) = started().await;
        server.push(json!({"type": "item_create", "item": item("a")}));
        server.push(json!({"type": "item_create", "item": item("b")}));
        server.push(json!({"type": "edge_create", "edge": {"id": "e1", "source_item_id": "a", "target_item_id": "b"}}));
        server.push(json!({"type": "session_update", "session": {
            "id": "s1", "dashboard_id": "dash1", "item_id": "a", "owner_user_id": "me", "status": "active"
        }}));
        wait_until(&mut rx, |s| s.sessions.len() == 1 && s.edges.len() == 1).await;

        server.push(json!({"type": "item_delete", "item_id": "a"}));
        let snap = wait_until(&mut rx, |s| s.items.len() == 1).await;
        assert!(snap.sessions.is_empty());
        assert!(snap.edges.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn optimistic_create_round_trip() {
        let (sync, mut server, mut rx) = started().await;
        let temp_id = sync.create_item(ItemType::Note, "{}".into(), Position::default(), Size::default());
        assert!(temp_id.starts_with("tmp-"));
        assert!(sync.snapshot().can_undo);

        let sent: serde_json::Value = serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(sent["type"], "item_create");
        assert_eq!(sent["temp_id"], temp_id.as_str());

        let mut ack = sent["item"].clone();
        ack["id"] = json!("srv-1");
        server.push(json!({"type": "item_create", "item": ack, "temp_id": temp_id}));
        let snap = wait_until(&mut rx, |s| s.items.iter().any(|i| i.id == "srv-1")).await;
        assert_eq!(snap.items.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edges_drive_dataflow_routes() {
        let (sync, server, mut rx) = started().await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _reg = sync.bus().register_input_handler("note1", "input", move |p: FlowPayload| {
            sink.lock().unwrap().push(p.text);
        });
        server.push(json!({"type": "item_create", "item": item("term1")}));
        server.push(json!({"type": "item_create", "item": item("note1")}));
        server.push(json!({"type": "edge_create", "edge": {"id": "e1", "source_item_id": "term1", "target_item_id": "note1", "source_handle": PORT_AGENT_OUTPUT}}));
        wait_until(&mut rx, |s| s.edges.len() == 1).await;

        assert_eq!(sync.bus().fire_output("term1", PORT_AGENT_OUTPUT, FlowPayload::text("done")), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["done".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_edits_are_flushed_in_order_on_connect() {
        let (connector, mut servers) = FakeConnector::new();
        connector.fail_next(1);
        let sync = DashboardSync::start(options(), connector, DataFlowBus::new());
        let id = sync.create_item(ItemType::Todo, String::new(), Position::default(), Size::default());
        let patch = ItemPatch {
            content: Some(r#"{"title":"groceries"}"#.into()),
            ..Default::default()
        };
        assert!(sync.update_item(&id, patch));
        let snap = sync.snapshot();
        assert!(snap.items.iter().any(|i| i.id == id));
        assert_eq!(snap.queued_commands, 2);
        assert!(!sync.send_cursor(1.0, 2.0));

        let mut server = servers.recv().await.unwrap();
        let first: serde_json::Value = serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "item_create");
        assert_eq!(first["temp_id"], id.as_str());
        let second: serde_json::Value = serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "item_update");
        assert_eq!(second["item_id"], id.as_str());

        let mut rx = sync.watch();
        wait_until(&mut rx, |s| s.connection == ConnectionState::Connected && s.queued_commands == 0).await;
    }

    #[tokio::test(start_paused = true)]
    async fn presence_is_dropped_when_link_is_lost() {
        let (_sync, server, mut rx) = started().await;
        server.push(json!({"type": "join", "user": {"user_id": "ghost", "user_name": "Gus"}}));
        wait_until(&mut rx, |s| s.presence.len() == 1).await;

        drop(server);
        let snap = wait_until(&mut rx, |s| s.connection == ConnectionState::Reconnecting).await;
        assert!(snap.presence.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_carries_decoded_contents() {
        let (_sync, server, mut rx) = started().await;
        server.push(json!({"type": "item_create", "item": {
            "id": "t1", "type": "todo", "content": r#"{"title":"ship","items":[{"text":"a","done":"no"}]}"#
        }}));
        let snap = wait_until(&mut rx, |s| s.contents.contains_key("t1")).await;
        match &snap.contents["t1"] {
            ItemContent::Todo(todo) => {
                assert_eq!(todo.title, "ship");
                assert_eq!(todo.items.len(), 1);
                assert!(!todo.items[0].done);
            }
            other => panic!("unexpected content {other:?}"),
        }

        server.push(json!({"type": "item_delete", "item_id": "t1"}));
        wait_until(&mut rx, |s| s.contents.is_empty()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_applying_frames() {
        let (mut sync, server, _rx) = started().await;
        sync.shutdown();
        server.push(json!({"type": "item_create", "item": item("late")}));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sync.snapshot().items.is_empty());
    }
}
