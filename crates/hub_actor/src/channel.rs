//! Transport capability consumed by [`crate::ActorConnection`].
//!
//! Framing, heartbeats and socket reconnection belong to the transport that
//! implements these traits. The connection only needs to open a handle on a
//! namespace, watch it connect and disconnect, and send framed events with or
//! without an acknowledgement.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Called once with the hub's acknowledgement arguments.
pub type AckCallback = Box<dyn FnOnce(Vec<Value>) + Send + 'static>;

/// Called every time the subscribed transport event fires.
pub type TransportListener = Arc<dyn Fn() + Send + Sync + 'static>;

/// Transport-level notifications a channel reports to its listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEvent {
    Connect,
    Disconnect,
}

impl TransportEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportEvent::Connect => "connect",
            TransportEvent::Disconnect => "disconnect",
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Invalid hub address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Transport unavailable for {address}: {reason}")]
    Unavailable { address: String, reason: String },
}

/// One persistent bidirectional connection to the hub.
///
/// Implementations must deliver listener invocations and acknowledgements
/// asynchronously, never from inside the `connect`, `emit` or
/// `emit_with_ack` call that caused them: the connection holds its state lock
/// while it drives the channel.
pub trait DuplexChannel: Send + Sync {
    /// Stable identifier for logging, once the transport has assigned one.
    fn id(&self) -> Option<String>;

    fn on(&self, event: TransportEvent, listener: TransportListener);

    fn connect(&self);

    fn disconnect(&self);

    fn emit(&self, event: &str, payload: Value);

    fn emit_with_ack(&self, event: &str, payload: Value, ack: AckCallback);
}

/// Opens channels; one handle per connect cycle.
pub trait ChannelOpener: Send + Sync {
    fn open(&self, address: &str, namespace: &str)
        -> Result<Arc<dyn DuplexChannel>, ChannelError>;
}
