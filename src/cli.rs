use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::BoardlinkConfig;
use crate::dashboard::{DashboardOptions, DashboardSnapshot, DashboardSync};
use crate::dataflow::DataFlowBus;
use crate::item_content::ItemContent;
use crate::model::Session;
use crate::session_api::{HttpSessionApi, SessionApi};
use crate::sync::TaskView;
use crate::terminal::{TerminalChannel, TerminalOptions, TerminalSnapshot};
use crate::transport::WsConnector;

#[derive(Parser)]
#[command(name = "boardlink")]
#[command(about = "Realtime client for collaborative agent dashboards")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Follow a dashboard and print a line whenever its state changes
    Watch {
        /// Dashboard ID
        #[arg(long)]
        dashboard: String,
        /// Include completed and cancelled tasks
        #[arg(long)]
        include_completed: bool,
    },
    /// Attach this terminal to a dashboard terminal block
    Attach {
        /// Dashboard ID
        #[arg(long)]
        dashboard: String,
        /// Terminal item ID
        #[arg(long)]
        item: String,
        /// Bind to an existing session instead of creating one
        #[arg(long)]
        session: Option<String>,
    },
    /// Show or edit configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show resolved configuration with secrets masked
    Show,
    /// Set a value in config.toml (e.g. `server_url`, `reconnect.max_retries`)
    Set {
        /// Config key
        key: String,
        /// New value; empty clears a text setting
        value: String,
    },
}

/// A line typed on stdin while attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinAction {
    Input(String),
    Take,
    Request,
    Release,
    Grant(String),
    Reconnect,
    Quit,
    Unknown(String),
}

pub fn parse_stdin_line(line: &str) -> StdinAction {
    let Some(command) = line.strip_prefix('/') else {
        return StdinAction::Input(format!("{line}\n"));
    };
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("take"), None) => StdinAction::Take,
        (Some("request"), None) => StdinAction::Request,
        (Some("release"), None) => StdinAction::Release,
        (Some("grant"), Some(user)) => StdinAction::Grant(user.to_string()),
        (Some("reconnect"), None) => StdinAction::Reconnect,
        (Some("quit"), None) => StdinAction::Quit,
        // `//text` sends a literal leading slash
        _ if command.starts_with('/') => StdinAction::Input(format!("{command}\n")),
        _ => StdinAction::Unknown(line.to_string()),
    }
}

pub fn dashboard_summary(snap: &DashboardSnapshot) -> String {
    let open_todos: usize = snap
        .contents
        .values()
        .map(|content| match content {
            ItemContent::Todo(todo) => todo.items.iter().filter(|entry| !entry.done).count(),
            _ => 0,
        })
        .sum();
    let mut line = format!(
        "[{}] items={} open_todos={} edges={} sessions={} online={} tasks={} memories={} inbox={}",
        snap.connection,
        snap.items.len(),
        open_todos,
        snap.edges.len(),
        snap.sessions.len(),
        snap.presence.len(),
        snap.tasks.len(),
        snap.memories.len(),
        snap.inbox.len(),
    );
    if snap.queued_commands > 0 {
        line.push_str(&format!(" unsent={}", snap.queued_commands));
    }
    if let Some(err) = &snap.error {
        line.push_str(&format!(" error: {err}"));
    }
    line
}

pub fn terminal_status(snap: &TerminalSnapshot) -> String {
    let mut line = format!("[{}]", snap.connection);
    if snap.restart_pending {
        line.push_str(" restarting session");
    } else if snap.turn_taking.input_blocked {
        line.push_str(&format!(" read-only: {}", snap.turn_taking.input_block_reason));
    } else {
        line.push_str(" you have control");
    }
    if !snap.turn_taking.controller_name.is_empty() {
        line.push_str(&format!(" (controller: {})", snap.turn_taking.controller_name));
    }
    if snap.pty_closed {
        line.push_str(" process exited");
    }
    if let Some(err) = &snap.error {
        line.push_str(&format!(" error: {err}"));
    }
    line
}

pub async fn handle_cli_command(command: Commands) -> Result<()> {
    match command {
        Commands::Watch {
            dashboard,
            include_completed,
        } => {
            let config = BoardlinkConfig::load()?;
            let options = DashboardOptions {
                server_url: config.server_url().to_string(),
                dashboard_id: dashboard,
                identity: config.identity()?,
                policy: config.reconnect.policy(),
                task_view: TaskView {
                    session_id: None,
                    include_completed,
                },
            };
            let mut sync = DashboardSync::start(options, Arc::new(WsConnector), DataFlowBus::new());
            let mut rx = sync.watch();
            let mut last = String::new();
            loop {
                let line = dashboard_summary(&rx.borrow_and_update());
                if line != last {
                    println!("{line}");
                    last = line;
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            sync.shutdown();
            Ok(())
        }
        Commands::Attach {
            dashboard,
            item,
            session,
        } => attach(dashboard, item, session).await,
        Commands::Config { config_command } => match config_command {
            ConfigCommands::Show => {
                let config = BoardlinkConfig::load()?;
                println!("{}", config.display_masked());
                Ok(())
            }
            ConfigCommands::Set { key, value } => {
                // Env overrides must not leak into the file.
                let mut config = BoardlinkConfig::load_from(&BoardlinkConfig::config_path())?;
                config.set(&key, &value)?;
                config.save_to_disk()?;
                println!("Saved {key} to {}", BoardlinkConfig::config_path().display());
                Ok(())
            }
        },
    }
}

async fn attach(dashboard_id: String, item_id: String, session_id: Option<String>) -> Result<()> {
    let config = BoardlinkConfig::load()?;
    let identity = config.identity()?;
    let connector = Arc::new(WsConnector);
    let api: Arc<dyn SessionApi> = Arc::new(HttpSessionApi::new(config.api_url(), config.api_token.clone()));

    // The dashboard channel supplies existing sessions and data-flow routes.
    let mut board = DashboardSync::start(
        DashboardOptions {
            server_url: config.server_url().to_string(),
            dashboard_id: dashboard_id.clone(),
            identity: identity.clone(),
            policy: config.reconnect.policy(),
            task_view: TaskView::default(),
        },
        connector.clone(),
        DataFlowBus::new(),
    );

    let existing = match session_id {
        Some(id) => Some(wait_for_session(&board, &id).await?),
        None => None,
    };

    let (mut terminal, mut display) = TerminalChannel::open(
        TerminalOptions {
            server_url: config.server_url().to_string(),
            dashboard_id,
            item_id,
            identity,
            policy: config.reconnect.policy(),
            liveness_timeout: config.reconnect.liveness_timeout(),
        },
        existing,
        connector,
        api,
        board.bus().clone(),
    )
    .await
    .context("Failed to start terminal session")?;

    let mut status_rx = terminal.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_status = String::new();
    loop {
        tokio::select! {
            Some(text) = display.recv() => {
                print!("{text}");
                std::io::stdout().flush()?;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = terminal_status(&status_rx.borrow_and_update());
                if status != last_status {
                    eprintln!("{status}");
                    last_status = status;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !run_stdin_action(&terminal, parse_stdin_line(&line)) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    terminal.shutdown();
    board.shutdown();
    Ok(())
}

/// Returns `false` when the user asked to quit.
fn run_stdin_action(terminal: &TerminalChannel, action: StdinAction) -> bool {
    let sent = match action {
        StdinAction::Input(text) => terminal.send_input(&text),
        StdinAction::Take => terminal.take_control(),
        StdinAction::Request => terminal.request_control(),
        StdinAction::Release => terminal.revoke_control(),
        StdinAction::Grant(user) => terminal.grant_control(&user),
        StdinAction::Reconnect => {
            terminal.reconnect();
            true
        }
        StdinAction::Quit => return false,
        StdinAction::Unknown(line) => {
            eprintln!("Unknown command: {line} (try /take, /request, /release, /grant <user>, /reconnect, /quit)");
            return true;
        }
    };
    if !sent {
        eprintln!("Not sent: {}", terminal.snapshot().turn_taking.input_block_reason);
    }
    true
}

async fn wait_for_session(board: &DashboardSync, session_id: &str) -> Result<Session> {
    let mut rx = board.watch();
    let found = tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|s| s.sessions.iter().any(|x| x.id == session_id)),
    )
    .await
    .with_context(|| format!("Session '{session_id}' did not appear on the dashboard"))?
    .context("Dashboard channel closed")?;
    let session = found.sessions.iter().find(|x| x.id == session_id).cloned();
    session.with_context(|| format!("Session '{session_id}' not found"))
}
