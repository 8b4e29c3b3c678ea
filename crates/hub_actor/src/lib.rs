//! Client side of the hub actor protocol.
//!
//! An [`ActorConnection`] registers one actor with a remote hub over a
//! [`DuplexChannel`] supplied by the caller's transport, then pipes
//! application events to the hub until it is told to leave.
//!
//! ```text
//!   connect()                    greet ack                 register ack
//! Idle ──────▶ Connecting ──────────▶ Greeted ──────────▶ Registered
//!  ▲             │  sg:greet:hi          │ sg:remote:spec       │
//!  │             │                       │                      │ disconnect()
//!  │             └──── disconnect() ─────┴──────┐               ▼ sg:greet:bye
//!  └──────────────────────────────────────────── Disconnecting ◀┘
//! ```

mod channel;
mod connection;
mod error;
mod identity;
pub mod metrics;
pub mod protocol;
mod state;
pub mod testing;

pub use channel::{
    AckCallback, ChannelError, ChannelOpener, DuplexChannel, TransportEvent, TransportListener,
};
pub use connection::{ActorConnection, IdleCallback, ReadyCallback};
pub use error::{Error, Result};
pub use identity::ActorIdentity;
pub use protocol::{CapabilityDescriptor, OutboundEnvelope};
pub use state::{ConnectionState, Generation, StateMachine};

/// Namespace every actor channel is opened on.
pub const ACTORS_NAMESPACE: &str = "/actors";
