use thiserror::Error;

/// Physical channel faults.  Recovered inside the transport; consumers only
/// ever see them as `last_error` next to a state transition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },
    #[error("channel closed: {0}")]
    Closed(String),
    #[error("reconnect gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// A frame that could not be understood.  Logged and skipped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no type discriminator")]
    MissingType,
    #[error("unknown frame type `{0}`")]
    UnknownType(String),
}

#[derive(Debug, Error)]
pub enum SessionApiError {
    #[error("session request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("session service unavailable: {0}")]
    Unavailable(String),
}

/// User-visible error slot published in dashboard and terminal snapshots.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not start a new session: {0}")]
    SessionCreate(String),
    #[error("server error: {0}")]
    Server(String),
}
