//! Hand-driven channel doubles.
//!
//! [`MockChannel`] never does anything on its own: it records what the
//! connection sends and keeps acknowledgements pending until a test fires
//! them, so every interleaving of transport events, acks and caller
//! operations can be reproduced deterministically.

use crate::channel::{
    AckCallback, ChannelError, ChannelOpener, DuplexChannel, TransportEvent, TransportListener,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// One message handed to [`DuplexChannel::emit`] or
/// [`DuplexChannel::emit_with_ack`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub event: String,
    pub payload: Value,
    pub expects_ack: bool,
}

#[derive(Default)]
struct MockChannelState {
    listeners: HashMap<TransportEvent, Vec<TransportListener>>,
    sent: Vec<SentMessage>,
    pending_acks: VecDeque<(String, AckCallback)>,
    connect_calls: usize,
    disconnect_calls: usize,
}

pub struct MockChannel {
    id: String,
    address: String,
    namespace: String,
    state: Mutex<MockChannelState>,
}

impl MockChannel {
    pub fn new(id: impl Into<String>, address: &str, namespace: &str) -> Self {
        Self {
            id: id.into(),
            address: address.to_string(),
            namespace: namespace.to_string(),
            state: Mutex::new(MockChannelState::default()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn fire(&self, event: TransportEvent) {
        let listeners = self
            .state
            .lock()
            .listeners
            .get(&event)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener();
        }
    }

    pub fn fire_connect(&self) {
        self.fire(TransportEvent::Connect)
    }

    pub fn fire_disconnect(&self) {
        self.fire(TransportEvent::Disconnect)
    }

    /// Acknowledges the oldest pending message and returns its event name.
    pub fn ack_next(&self) -> Option<String> {
        let (event, ack) = self.state.lock().pending_acks.pop_front()?;
        ack(Vec::new());
        Some(event)
    }

    /// Drops every pending acknowledgement without invoking it, like a hub
    /// that never answers.
    pub fn discard_pending_acks(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.pending_acks.len();
        state.pending_acks.clear();
        count
    }

    pub fn pending_acks(&self) -> Vec<String> {
        self.state
            .lock()
            .pending_acks
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().sent.clone()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.state
            .lock()
            .sent
            .iter()
            .map(|message| message.event.clone())
            .collect()
    }

    pub fn listener_count(&self, event: TransportEvent) -> usize {
        self.state
            .lock()
            .listeners
            .get(&event)
            .map_or(0, Vec::len)
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().disconnect_calls
    }
}

impl DuplexChannel for MockChannel {
    fn id(&self) -> Option<String> {
        Some(self.id.clone())
    }

    fn on(&self, event: TransportEvent, listener: TransportListener) {
        self.state
            .lock()
            .listeners
            .entry(event)
            .or_default()
            .push(listener);
    }

    fn connect(&self) {
        self.state.lock().connect_calls += 1;
    }

    fn disconnect(&self) {
        self.state.lock().disconnect_calls += 1;
    }

    fn emit(&self, event: &str, payload: Value) {
        self.state.lock().sent.push(SentMessage {
            event: event.to_string(),
            payload,
            expects_ack: false,
        });
    }

    fn emit_with_ack(&self, event: &str, payload: Value, ack: AckCallback) {
        let mut state = self.state.lock();
        state.sent.push(SentMessage {
            event: event.to_string(),
            payload,
            expects_ack: true,
        });
        state.pending_acks.push_back((event.to_string(), ack));
    }
}

/// Hands out a fresh [`MockChannel`] per `open` and remembers all of them.
#[derive(Default)]
pub struct MockOpener {
    channels: Mutex<Vec<Arc<MockChannel>>>,
    refuse: Mutex<Option<String>>,
}

impl MockOpener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following `open` fail with `reason`, or succeed again with
    /// `None`.
    pub fn refuse_with(&self, reason: Option<&str>) {
        *self.refuse.lock() = reason.map(str::to_string);
    }

    pub fn opened(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockChannel>> {
        self.channels.lock().last().cloned()
    }
}

impl ChannelOpener for MockOpener {
    fn open(
        &self,
        address: &str,
        namespace: &str,
    ) -> Result<Arc<dyn DuplexChannel>, ChannelError> {
        if let Some(reason) = self.refuse.lock().clone() {
            return Err(ChannelError::Unavailable {
                address: address.to_string(),
                reason,
            });
        }
        let mut channels = self.channels.lock();
        let channel = Arc::new(MockChannel::new(
            format!("mock-{}", channels.len()),
            address,
            namespace,
        ));
        channels.push(channel.clone());
        Ok(channel)
    }
}
