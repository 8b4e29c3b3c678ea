//! In-process hub for `loopback://` addresses.
//!
//! Everything the hub does in reply (transport events and acknowledgements)
//! is spawned onto the runtime, never run inside the sending call.

use hub_actor::protocol::{greeting_events, remote_events};
use hub_actor::{
    AckCallback, ChannelError, ChannelOpener, DuplexChannel, TransportEvent, TransportListener,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::*;
use url::Url;

pub const LOOPBACK_SCHEME: &str = "loopback";

/// Piped events kept for inspection; older ones are only counted.
pub const MAX_KEPT_EVENTS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredActor {
    pub key: String,
    pub channel_id: String,
    pub module: Option<String>,
    pub spec: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipedEvent {
    pub key: String,
    pub module: String,
    pub event: String,
    pub data: Option<Value>,
}

#[derive(Default)]
struct HubState {
    actors: BTreeMap<String, RegisteredActor>,
    piped: VecDeque<PipedEvent>,
    piped_total: u64,
}

pub struct LoopbackHub {
    handle: Handle,
    state: Arc<Mutex<HubState>>,
    next_channel: AtomicU64,
}

impl LoopbackHub {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            state: Arc::new(Mutex::new(HubState::default())),
            next_channel: AtomicU64::new(0),
        }
    }

    /// Greeted actors, ordered by key.
    pub fn actors(&self) -> Vec<RegisteredActor> {
        self.state.lock().actors.values().cloned().collect()
    }

    /// The most recent piped events, oldest first.
    pub fn piped_events(&self) -> Vec<PipedEvent> {
        self.state.lock().piped.iter().cloned().collect()
    }

    /// Every event piped since the hub started, including evicted ones.
    pub fn piped_total(&self) -> u64 {
        self.state.lock().piped_total
    }
}

impl ChannelOpener for LoopbackHub {
    fn open(
        &self,
        address: &str,
        namespace: &str,
    ) -> Result<Arc<dyn DuplexChannel>, ChannelError> {
        let url = Url::parse(address).map_err(|err| ChannelError::InvalidAddress {
            address: address.to_string(),
            reason: err.to_string(),
        })?;
        if url.scheme() != LOOPBACK_SCHEME {
            return Err(ChannelError::Unavailable {
                address: address.to_string(),
                reason: format!("no transport for scheme {}", url.scheme()),
            });
        }

        let id = format!(
            "loopback-{}",
            self.next_channel.fetch_add(1, Ordering::Relaxed)
        );
        debug!(channel_id = %id, %address, namespace, "Opened loopback channel");
        Ok(Arc::new(LoopbackChannel {
            id,
            handle: self.handle.clone(),
            hub: self.state.clone(),
            inner: Mutex::new(ChannelState::default()),
        }))
    }
}

#[derive(Default)]
struct ChannelState {
    listeners: HashMap<TransportEvent, Vec<TransportListener>>,
    connected: bool,
    greeted_key: Option<String>,
}

struct LoopbackChannel {
    id: String,
    handle: Handle,
    hub: Arc<Mutex<HubState>>,
    inner: Mutex<ChannelState>,
}

impl LoopbackChannel {
    fn dispatch(&self, event: TransportEvent) {
        let listeners = self
            .inner
            .lock()
            .listeners
            .get(&event)
            .cloned()
            .unwrap_or_default();
        self.handle.spawn(async move {
            for listener in listeners {
                listener();
            }
        });
    }

    fn acknowledge(&self, ack: AckCallback, args: Vec<Value>) {
        self.handle.spawn(async move { ack(args) });
    }

    fn string_field(payload: &Value, field: &str) -> Option<String> {
        payload.get(field).and_then(Value::as_str).map(str::to_string)
    }

    fn greet(&self, payload: &Value) -> Vec<Value> {
        let Some(key) = Self::string_field(payload, "key") else {
            warn!(channel_id = %self.id, "Greeting without key");
            return vec![json!({ "error": "missing key" })];
        };
        self.inner.lock().greeted_key = Some(key.clone());
        self.hub.lock().actors.insert(
            key.clone(),
            RegisteredActor {
                key: key.clone(),
                channel_id: self.id.clone(),
                module: None,
                spec: None,
            },
        );
        info!(channel_id = %self.id, %key, "Actor greeted");
        Vec::new()
    }

    fn register(&self, payload: &Value) -> Vec<Value> {
        let Some(key) = self.inner.lock().greeted_key.clone() else {
            warn!(channel_id = %self.id, "Specification before greeting");
            return vec![json!({ "error": "not greeted" })];
        };
        let module = Self::string_field(payload, "name");
        let mut hub = self.hub.lock();
        if let Some(actor) = hub.actors.get_mut(&key) {
            actor.module = module.clone();
            actor.spec = payload.get("spec").cloned();
        }
        info!(channel_id = %self.id, %key, module = ?module, "Actor registered");
        Vec::new()
    }

    fn leave(&self, payload: &Value) -> Vec<Value> {
        let key = Self::string_field(payload, "key");
        self.inner.lock().greeted_key = None;
        if let Some(key) = key {
            self.hub.lock().actors.remove(&key);
            info!(channel_id = %self.id, %key, "Actor left");
        }
        Vec::new()
    }

    fn pipe(&self, payload: Value) {
        let (Some(key), Some(module), Some(event)) = (
            Self::string_field(&payload, "key"),
            Self::string_field(&payload, "module"),
            Self::string_field(&payload, "event"),
        ) else {
            warn!(channel_id = %self.id, "Malformed pipe envelope");
            return;
        };
        info!(channel_id = %self.id, %key, %module, %event, data = ?payload.get("data"), "Piped event");
        let mut hub = self.hub.lock();
        if hub.piped.len() == MAX_KEPT_EVENTS {
            hub.piped.pop_front();
        }
        hub.piped.push_back(PipedEvent {
            key,
            module,
            event,
            data: payload.get("data").cloned(),
        });
        hub.piped_total += 1;
    }
}

impl DuplexChannel for LoopbackChannel {
    fn id(&self) -> Option<String> {
        self.inner.lock().connected.then(|| self.id.clone())
    }

    fn on(&self, event: TransportEvent, listener: TransportListener) {
        self.inner
            .lock()
            .listeners
            .entry(event)
            .or_default()
            .push(listener);
    }

    fn connect(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.connected {
                return;
            }
            inner.connected = true;
        }
        self.dispatch(TransportEvent::Connect);
    }

    fn disconnect(&self) {
        let key = {
            let mut inner = self.inner.lock();
            if !inner.connected {
                return;
            }
            inner.connected = false;
            inner.greeted_key.take()
        };
        if let Some(key) = key {
            // dropped without a leave
            self.hub.lock().actors.remove(&key);
        }
        self.dispatch(TransportEvent::Disconnect);
    }

    fn emit(&self, event: &str, payload: Value) {
        if event == remote_events::PIPE {
            self.pipe(payload);
        } else {
            warn!(channel_id = %self.id, event, "Unexpected unacknowledged event");
        }
    }

    fn emit_with_ack(&self, event: &str, payload: Value, ack: AckCallback) {
        let args = match event {
            greeting_events::HI => self.greet(&payload),
            remote_events::SPEC => self.register(&payload),
            greeting_events::BYE => self.leave(&payload),
            _ => {
                warn!(channel_id = %self.id, event, "Unknown event");
                vec![json!({ "error": "unknown event" })]
            }
        };
        self.acknowledge(ack, args);
    }
}
