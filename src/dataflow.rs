//! Cross-block data-flow bus.
//!
//! Blocks publish on named output ports; the bus forwards each payload along
//! the dashboard edges leaving that block to whatever input handlers the
//! target blocks registered.  Routes are refreshed from the dashboard's edge
//! list whenever it changes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::model::DashboardEdge;

pub const PORT_AGENT_OUTPUT: &str = "agent-output";
pub const PORT_BROWSER: &str = "browser";
pub const PORT_SIDE_CHANNEL: &str = "side-channel";
/// Input port used when an edge names no target handle.
pub const DEFAULT_INPUT_PORT: &str = "input";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute: Option<bool>,
}

impl FlowPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            execute: None,
        }
    }
}

pub type InputHandler = Arc<dyn Fn(FlowPayload) + Send + Sync>;

type PortKey = (String, String);

#[derive(Default)]
struct BusInner {
    handlers: HashMap<PortKey, Vec<(u64, InputHandler)>>,
    routes: Vec<DashboardEdge>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct DataFlowBus {
    inner: Arc<Mutex<BusInner>>,
}

fn lock(inner: &Mutex<BusInner>) -> MutexGuard<'_, BusInner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DataFlowBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_input_handler(
        &self,
        block_id: &str,
        port: &str,
        handler: impl Fn(FlowPayload) + Send + Sync + 'static,
    ) -> HandlerRegistration {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        let key = (block_id.to_string(), port.to_string());
        inner
            .handlers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        HandlerRegistration {
            bus: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    pub fn set_routes(&self, edges: &[DashboardEdge]) {
        lock(&self.inner).routes = edges.to_vec();
    }

    /// Deliver `payload` along every edge leaving `block_id` on `port`.
    /// Returns how many handlers were invoked.
    pub fn fire_output(&self, block_id: &str, port: &str, payload: FlowPayload) -> usize {
        let targets: Vec<InputHandler> = {
            let inner = lock(&self.inner);
            inner
                .routes
                .iter()
                .filter(|e| {
                    e.source_item_id == block_id
                        && e.source_handle.as_deref().is_none_or(|h| h == port)
                })
                .flat_map(|e| {
                    let key = (
                        e.target_item_id.clone(),
                        e.target_handle
                            .clone()
                            .unwrap_or_else(|| DEFAULT_INPUT_PORT.to_string()),
                    );
                    inner
                        .handlers
                        .get(&key)
                        .into_iter()
                        .flatten()
                        .map(|(_, h)| Arc::clone(h))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        if targets.is_empty() {
            trace!(%block_id, %port, "output has no connected inputs");
            return 0;
        }
        debug!(%block_id, %port, targets = targets.len(), "routing block output");
        for handler in &targets {
            handler(payload.clone());
        }
        targets.len()
    }
}

/// Removes its handler when dropped.
pub struct HandlerRegistration {
    bus: Weak<Mutex<BusInner>>,
    key: PortKey,
    id: u64,
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut inner = lock(&bus);
        if let Some(list) = inner.handlers.get_mut(&self.key) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                inner.handlers.remove(&self.key);
            }
        }
    }
}
