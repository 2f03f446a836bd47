//! One terminal block: its channel, turn-taking, watchdog and output parser.
//!
//! [`TerminalCore`] is the synchronous part.  It turns channel events into
//! [`Effect`]s without touching the network, which keeps every rule testable
//! without a runtime.  [`TerminalChannel`] owns the async side: a single task
//! that feeds the core in arrival order, carries out its effects, runs the
//! liveness timer and the reopen sequence, and publishes snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dataflow::{DataFlowBus, FlowPayload, PORT_AGENT_OUTPUT, PORT_BROWSER, PORT_SIDE_CHANNEL};
use crate::error::{SessionApiError, SyncError, TransportError};
use crate::model::{Identity, Session};
use crate::protocol::{TerminalCommand, TerminalFrame};
use crate::session_api::SessionApi;
use crate::side_channel::{Instruction, Parsed, SideChannelParser};
use crate::transport::{
    ChannelEvent, ConnectionState, Connector, ReconnectPolicy, Subscription, Transport,
};
use crate::turn_taking::{AgentState, TurnTaking, TurnTakingState};
use crate::watchdog::{RecoverySignal, Watchdog, WatchdogAction};

// ── Core ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(TerminalCommand),
    ArmLiveness,
    DisarmLiveness,
    Reopen(RecoverySignal),
    FireOutput {
        port: &'static str,
        payload: FlowPayload,
    },
    Display(String),
}

/// What terminal consumers render.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSnapshot {
    pub connection: ConnectionState,
    pub turn_taking: TurnTakingState,
    pub agent_state: Option<AgentState>,
    pub pty_closed: bool,
    pub error: Option<SyncError>,
    pub session: Option<Session>,
    pub restart_pending: bool,
}

pub struct TerminalCore {
    item_id: String,
    turn: TurnTaking,
    watchdog: Watchdog,
    parser: SideChannelParser,
    connection: ConnectionState,
    pty_closed: bool,
    error: Option<SyncError>,
    session: Option<Session>,
    restart_pending: bool,
}

impl TerminalCore {
    pub fn new(identity: Identity, item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            turn: TurnTaking::new(identity),
            watchdog: Watchdog::new(),
            parser: SideChannelParser::new(),
            connection: ConnectionState::Disconnected,
            pty_closed: false,
            error: None,
            session: None,
            restart_pending: false,
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Attach a fresh session: per-session flags start over.
    pub fn bind(&mut self, session: Session) {
        info!(item_id = %self.item_id, session_id = %session.id, "terminal bound to session");
        self.turn.bind_session(Some(&session));
        self.watchdog.reset_session();
        self.parser.reset();
        self.pty_closed = false;
        self.error = None;
        self.restart_pending = false;
        self.session = Some(session);
    }

    /// Drop the local session reference ahead of a reopen.
    pub fn clear_session(&mut self) -> Option<Session> {
        self.turn.bind_session(None);
        self.restart_pending = true;
        self.session.take()
    }

    pub fn on_event(&mut self, event: ChannelEvent) -> Vec<Effect> {
        match event {
            ChannelEvent::State { from, to, error } => self.on_state(from, to, error),
            ChannelEvent::Frame(text) => match TerminalFrame::parse(&text) {
                Ok(frame) => self.on_frame(frame),
                Err(e) => {
                    warn!(item_id = %self.item_id, error = %e, "ignoring terminal frame");
                    Vec::new()
                }
            },
        }
    }

    fn on_state(
        &mut self,
        from: ConnectionState,
        to: ConnectionState,
        error: Option<TransportError>,
    ) -> Vec<Effect> {
        self.connection = to;
        match (to, error) {
            (ConnectionState::Failed, Some(e)) => self.error = Some(SyncError::Transport(e)),
            (ConnectionState::Connected, _) => {
                if matches!(self.error, Some(SyncError::Transport(_))) {
                    self.error = None;
                }
            }
            _ => {}
        }

        let mut effects: Vec<Effect> = self.turn.on_connection(to).map(Effect::Send).into_iter().collect();
        effects.extend(self.watchdog.on_connection(from, to).into_iter().map(watchdog_effect));
        effects
    }

    fn on_frame(&mut self, frame: TerminalFrame) -> Vec<Effect> {
        let mut effects: Vec<Effect> = self.watchdog.on_data().map(watchdog_effect).into_iter().collect();
        match frame {
            TerminalFrame::Output { data } => {
                let parsed = self.parser.feed(&data);
                effects.extend(parsed_effects(parsed));
            }
            TerminalFrame::TurnTaking {
                controller,
                controller_name,
                pending_requests,
            } => {
                effects.extend(
                    self.turn
                        .on_turn_taking(controller, controller_name, pending_requests)
                        .map(Effect::Send),
                );
            }
            TerminalFrame::AgentState { state } => {
                effects.extend(self.turn.on_agent_state(state).map(Effect::Send));
            }
            TerminalFrame::PtyClosed { exit_code } => {
                info!(item_id = %self.item_id, ?exit_code, "remote process exited");
                effects.extend(self.flush_output());
                self.pty_closed = true;
                effects.extend(self.watchdog.on_pty_closed().map(watchdog_effect));
            }
            TerminalFrame::AgentComplete { text } => effects.push(Effect::FireOutput {
                port: PORT_AGENT_OUTPUT,
                payload: FlowPayload::text(text),
            }),
            TerminalFrame::Error { message } => {
                warn!(item_id = %self.item_id, %message, "terminal server reported an error");
                self.error = Some(SyncError::Server(message));
            }
        }
        effects
    }

    /// Release output the parser is still holding for the current session.
    pub fn flush_output(&mut self) -> Vec<Effect> {
        parsed_effects(self.parser.flush())
    }

    pub fn on_liveness_timeout(&mut self) -> Vec<Effect> {
        self.watchdog.on_liveness_timeout().map(watchdog_effect).into_iter().collect()
    }

    pub fn request_reopen(&mut self) -> Vec<Effect> {
        self.watchdog.request_reopen().map(watchdog_effect).into_iter().collect()
    }

    pub fn reopen_failed(&mut self, error: &SessionApiError) {
        warn!(item_id = %self.item_id, %error, "could not create a replacement session");
        self.error = Some(SyncError::SessionCreate(error.to_string()));
        self.watchdog.reopen_failed();
    }

    pub fn input_allowed(&self) -> bool {
        self.turn.can_type()
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        TerminalSnapshot {
            connection: self.connection,
            turn_taking: self.turn.state(),
            agent_state: self.turn.agent_state(),
            pty_closed: self.pty_closed,
            error: self.error.clone(),
            session: self.session.clone(),
            restart_pending: self.restart_pending,
        }
    }
}

fn parsed_effects(parsed: Parsed) -> Vec<Effect> {
    let mut effects = Vec::with_capacity(parsed.instructions.len() + 1);
    if !parsed.display.is_empty() {
        effects.push(Effect::Display(parsed.display));
    }
    effects.extend(parsed.instructions.into_iter().map(|i| match i {
        Instruction::OpenUrl(url) => Effect::FireOutput {
            port: PORT_BROWSER,
            payload: FlowPayload::text(url),
        },
        Instruction::Raw(text) => Effect::FireOutput {
            port: PORT_SIDE_CHANNEL,
            payload: FlowPayload {
                text,
                execute: Some(false),
            },
        },
    }));
    effects
}

fn watchdog_effect(action: WatchdogAction) -> Effect {
    match action {
        WatchdogAction::ArmLiveness => Effect::ArmLiveness,
        WatchdogAction::DisarmLiveness => Effect::DisarmLiveness,
        WatchdogAction::Reopen(signal) => Effect::Reopen(signal),
    }
}

// ── Endpoints ─────────────────────────────────────────────────────────────

pub fn terminal_url(server_url: &str, session: &Session, user_id: &str) -> String {
    format!(
        "{}/sessions/{}/pty/{}/ws?user_id={}",
        server_url.trim_end_matches('/'),
        urlencoding::encode(&session.id),
        urlencoding::encode(&session.pty_id),
        urlencoding::encode(user_id),
    )
}

// ── Runner ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub server_url: String,
    pub dashboard_id: String,
    pub item_id: String,
    pub identity: Identity,
    pub policy: ReconnectPolicy,
    pub liveness_timeout: Duration,
}

enum Control {
    Reconnect,
}

pub struct TerminalChannel {
    transport: Transport,
    core: Arc<Mutex<TerminalCore>>,
    snapshot: watch::Receiver<TerminalSnapshot>,
    control: mpsc::UnboundedSender<Control>,
    alive: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

fn lock(core: &Mutex<TerminalCore>) -> MutexGuard<'_, TerminalCore> {
    core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TerminalChannel {
    /// Bind to `session`, or create one for the item when `None`, and start
    /// the channel.  Display text arrives on the returned receiver.
    pub async fn open(
        options: TerminalOptions,
        session: Option<Session>,
        connector: Arc<dyn Connector>,
        api: Arc<dyn SessionApi>,
        bus: DataFlowBus,
    ) -> Result<(Self, mpsc::UnboundedReceiver<String>), SessionApiError> {
        let session = match session {
            Some(session) => session,
            None => api.create_session(&options.dashboard_id, &options.item_id).await?,
        };

        let mut core = TerminalCore::new(options.identity.clone(), options.item_id.clone());
        core.bind(session.clone());
        let (snapshot_tx, snapshot_rx) = watch::channel(core.snapshot());
        let core = Arc::new(Mutex::new(core));

        let transport = Transport::new(
            format!("terminal:{}", options.item_id),
            terminal_url(&options.server_url, &session, &options.identity.user_id),
            connector,
            options.policy.clone(),
        );
        let (subscription, events) = transport.subscribe();
        let (display_tx, display_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (reopen_tx, reopen_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let runner = Runner {
            options,
            core: Arc::clone(&core),
            transport: transport.clone(),
            api,
            bus,
            snapshot: snapshot_tx,
            display: display_tx,
            alive: Arc::clone(&alive),
            reopen_tx,
            deadline: None,
        };
        let task = tokio::spawn(runner.run(subscription, events, control_rx, reopen_rx));
        transport.connect();

        Ok((
            Self {
                transport,
                core,
                snapshot: snapshot_rx,
                control: control_tx,
                alive,
                task: Some(task),
            },
            display_rx,
        ))
    }

    pub fn watch(&self) -> watch::Receiver<TerminalSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> TerminalSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Returns `false` (and sends nothing) when input is blocked.
    pub fn send_input(&self, text: &str) -> bool {
        if !lock(&self.core).input_allowed() {
            return false;
        }
        self.transport.send(&TerminalCommand::Input {
            data: text.to_string(),
        })
    }

    pub fn send_raw_input(&self, bytes: &[u8]) -> bool {
        if !lock(&self.core).input_allowed() {
            return false;
        }
        self.transport.send(&TerminalCommand::raw_input(bytes))
    }

    pub fn send_resize(&self, cols: u16, rows: u16) {
        self.transport.send(&TerminalCommand::Resize { cols, rows });
    }

    pub fn take_control(&self) -> bool {
        self.transport.send(&TerminalCommand::TakeControl)
    }

    pub fn request_control(&self) -> bool {
        self.transport.send(&TerminalCommand::RequestControl)
    }

    pub fn grant_control(&self, to_user_id: &str) -> bool {
        self.transport.send(&TerminalCommand::GrantControl {
            to_user_id: to_user_id.to_string(),
        })
    }

    pub fn revoke_control(&self) -> bool {
        self.transport.send(&TerminalCommand::RevokeControl)
    }

    /// Reconnect the channel, or retry the reopen if the last one failed.
    pub fn reconnect(&self) {
        let _ = self.control.send(Control::Reconnect);
    }

    /// Stop processing immediately.  An in-flight reopen is discarded.
    pub fn shutdown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.transport.disconnect();
    }
}

impl Drop for TerminalChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Runner {
    options: TerminalOptions,
    core: Arc<Mutex<TerminalCore>>,
    transport: Transport,
    api: Arc<dyn SessionApi>,
    bus: DataFlowBus,
    snapshot: watch::Sender<TerminalSnapshot>,
    display: mpsc::UnboundedSender<String>,
    alive: Arc<AtomicBool>,
    reopen_tx: mpsc::UnboundedSender<Result<Session, SessionApiError>>,
    deadline: Option<Instant>,
}

impl Runner {
    async fn run(
        mut self,
        mut subscription: Subscription,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut reopened: mpsc::UnboundedReceiver<Result<Session, SessionApiError>>,
    ) {
        loop {
            let deadline = self.deadline;
            let effects = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => lock(&self.core).on_event(event),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.deadline = None;
                    lock(&self.core).on_liveness_timeout()
                }
                Some(result) = reopened.recv() => {
                    self.finish_reopen(result);
                    Vec::new()
                }
                Some(Control::Reconnect) = control.recv() => self.on_reconnect(),
            };
            if !self.alive.load(Ordering::SeqCst) {
                break;
            }
            self.apply(effects);
            let snapshot = lock(&self.core).snapshot();
            self.snapshot.send_replace(snapshot);
        }
        subscription.unsubscribe();
        debug!(item_id = %self.options.item_id, "terminal runner stopped");
    }

    fn on_reconnect(&mut self) -> Vec<Effect> {
        let mut core = lock(&self.core);
        if core.session().is_none() {
            return core.request_reopen();
        }
        drop(core);
        self.transport.reconnect();
        Vec::new()
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send(command) => {
                    self.transport.send(&command);
                }
                Effect::ArmLiveness => {
                    self.deadline = Some(Instant::now() + self.options.liveness_timeout);
                }
                Effect::DisarmLiveness => self.deadline = None,
                Effect::Reopen(signal) => self.start_reopen(signal),
                Effect::FireOutput { port, payload } => {
                    self.bus.fire_output(&self.options.item_id, port, payload);
                }
                Effect::Display(text) => {
                    let _ = self.display.send(text);
                }
            }
        }
    }

    fn start_reopen(&mut self, signal: RecoverySignal) {
        info!(item_id = %self.options.item_id, %signal, "starting session reopen");
        self.deadline = None;
        self.transport.disconnect();
        let flushed = lock(&self.core).flush_output();
        self.apply(flushed);
        let old = lock(&self.core).clear_session();

        let api = Arc::clone(&self.api);
        let alive = Arc::clone(&self.alive);
        let tx = self.reopen_tx.clone();
        let dashboard_id = self.options.dashboard_id.clone();
        let item_id = self.options.item_id.clone();
        tokio::spawn(async move {
            if let Some(old) = old {
                if let Err(e) = api.stop_session(&old.id).await {
                    debug!(session_id = %old.id, error = %e, "stopping old session failed, ignored");
                }
            }
            let result = api.create_session(&dashboard_id, &item_id).await;
            if !alive.load(Ordering::SeqCst) {
                debug!(%item_id, "terminal torn down, discarding reopen result");
                return;
            }
            let _ = tx.send(result);
        });
    }

    fn finish_reopen(&mut self, result: Result<Session, SessionApiError>) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        match result {
            Ok(session) => {
                let url = terminal_url(&self.options.server_url, &session, &self.options.identity.user_id);
                lock(&self.core).bind(session);
                self.transport.rebind(url);
            }
            Err(e) => lock(&self.core).reopen_failed(&e),
        }
    }
}
