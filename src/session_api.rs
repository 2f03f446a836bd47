//! Session lifecycle collaborator.
//!
//! The terminal runner only needs two calls: create a remote session for a
//! dashboard item, and stop one.  Stopping is best-effort; stopping a session
//! the server no longer knows about is not an error.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use crate::error::SessionApiError;
use crate::model::Session;

#[async_trait]
pub trait SessionApi: Send + Sync + 'static {
    async fn create_session(&self, dashboard_id: &str, item_id: &str) -> Result<Session, SessionApiError>;
    async fn stop_session(&self, session_id: &str) -> Result<(), SessionApiError>;
}

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    item_id: &'a str,
}

pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json");
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(&self, dashboard_id: &str, item_id: &str) -> Result<Session, SessionApiError> {
        let path = format!("/dashboards/{}/sessions", urlencoding::encode(dashboard_id));
        let resp = self
            .post(&path)
            .json(&CreateSessionRequest { item_id })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SessionApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<Session>().await?)
    }

    async fn stop_session(&self, session_id: &str) -> Result<(), SessionApiError> {
        let path = format!("/sessions/{}/stop", urlencoding::encode(session_id));
        let resp = self.post(&path).send().await?;
        let status = resp.status();
        if status.is_success() || stop_is_benign(status) {
            debug!(%session_id, status = status.as_u16(), "session stopped");
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SessionApiError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Already gone, or already stopped.
fn stop_is_benign(status: StatusCode) -> bool {
    matches!(status, StatusCode::NOT_FOUND | StatusCode::CONFLICT)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::model::SessionStatus;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records calls; `create_session` hands out `s1`, `s2`, ... unless a
    /// failure is queued.
    pub struct FakeSessionApi {
        pub owner_user_id: String,
        pub creates: AtomicUsize,
        pub stops: AtomicUsize,
        pub stopped: Mutex<Vec<String>>,
        failures: Mutex<VecDeque<SessionApiError>>,
        fail_stop: bool,
    }

    impl FakeSessionApi {
        pub fn new(owner_user_id: &str) -> Self {
            Self {
                owner_user_id: owner_user_id.to_string(),
                creates: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                stopped: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                fail_stop: false,
            }
        }

        /// Stop calls fail, as if the session were unreachable.
        pub fn with_failing_stop(mut self) -> Self {
            self.fail_stop = true;
            self
        }

        pub fn fail_next_create(&self, reason: &str) {
            self.failures
                .lock()
                .unwrap()
                .push_back(SessionApiError::Unavailable(reason.to_string()));
        }

        pub fn create_count(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }

        pub fn stop_count(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    pub fn session(id: &str, item_id: &str, owner: &str) -> Session {
        Session {
            id: id.to_string(),
            dashboard_id: "dash1".into(),
            item_id: item_id.to_string(),
            owner_user_id: owner.to_string(),
            sandbox_session_id: format!("sb-{id}"),
            pty_id: format!("p{}", id.trim_start_matches('s')),
            status: SessionStatus::Active,
            region: "local".into(),
            created_at: String::new(),
            stopped_at: None,
        }
    }

    #[async_trait]
    impl SessionApi for FakeSessionApi {
        async fn create_session(&self, _dashboard_id: &str, item_id: &str) -> Result<Session, SessionApiError> {
            let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(session(&format!("s{n}"), item_id, &self.owner_user_id))
        }

        async fn stop_session(&self, session_id: &str) -> Result<(), SessionApiError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.stopped.lock().unwrap().push(session_id.to_string());
            if self.fail_stop {
                return Err(SessionApiError::Unavailable("gone".into()));
            }
            Ok(())
        }
    }
}
