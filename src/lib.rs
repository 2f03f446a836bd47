//! Realtime client for collaborative agent dashboards.
//!
//! Two channel kinds share one transport layer: a dashboard channel that
//! keeps a local replica of items, edges, sessions, tasks and memories, and
//! terminal channels that stream a remote PTY with turn-taking and automatic
//! session recovery.

pub mod cli;
pub mod config;
pub mod dashboard;
pub mod dataflow;
pub mod error;
pub mod history;
pub mod item_content;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod session_api;
pub mod side_channel;
pub mod sync;
pub mod terminal;
pub mod transport;
pub mod turn_taking;
pub mod watchdog;
