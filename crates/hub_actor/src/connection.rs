//! The actor connection state machine.
//!
//! All state lives behind one lock. Public operations and handshake
//! continuations take it for the duration of a transition and release it
//! before any acknowledgement is awaited. Continuations carry the
//! [`Generation`] they were scheduled in; `disconnect` starts a new one, so
//! anything still in flight from the torn down cycle sees a mismatch and
//! stops.

use crate::channel::{ChannelOpener, DuplexChannel, TransportEvent};
use crate::error::Result;
use crate::identity::ActorIdentity;
use crate::metrics::{
    CHANNEL_OPEN_FAILURES, CONNECT_ATTEMPTS, EVENTS_EMITTED, HANDSHAKE_ABORTS, HANDSHAKE_STEPS,
    IGNORED_CALLS,
};
use crate::protocol::{self, greeting_events, remote_events};
use crate::state::{ConnectionState, Generation, StateMachine};
use crate::ACTORS_NAMESPACE;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use tracing::*;

/// Invoked after every successful registration.
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Invoked whenever a connect cycle ends and the connection is Idle again.
pub type IdleCallback = Arc<dyn Fn() + Send + Sync + 'static>;

pub struct ActorConnection {
    inner: Arc<Inner>,
}

struct Inner {
    identity: ActorIdentity,
    opener: Arc<dyn ChannelOpener>,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    machine: StateMachine,
    channel: Option<Arc<dyn DuplexChannel>>,
    on_ready: Option<ReadyCallback>,
    on_idle: Option<IdleCallback>,
}

fn notify_idle(on_idle: Option<IdleCallback>) {
    if let Some(on_idle) = on_idle {
        on_idle();
    }
}

fn channel_label(channel: &dyn DuplexChannel) -> String {
    channel.id().unwrap_or_else(|| "-".to_string())
}

impl ActorConnection {
    pub fn new(identity: ActorIdentity, opener: Arc<dyn ChannelOpener>) -> Result<Self> {
        identity.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                identity,
                opener,
                shared: Mutex::new(Shared::default()),
            }),
        })
    }

    pub fn identity(&self) -> &ActorIdentity {
        &self.inner.identity
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.lock().machine.state()
    }

    pub fn generation(&self) -> Generation {
        self.inner.shared.lock().machine.generation()
    }

    /// True while a channel exists, from `connect` until `disconnect`.
    pub fn is_connecting(&self) -> bool {
        self.inner.shared.lock().channel.is_some()
    }

    /// Sets the single ready callback, replacing any previous one.
    pub fn set_on_connection<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.shared.lock().on_ready = Some(Arc::new(callback));
    }

    /// Sets the single idle callback, replacing any previous one. It runs
    /// once the leave is acknowledged, or straight from `disconnect` when
    /// the hub never saw a greeting.
    pub fn set_on_idle<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.shared.lock().on_idle = Some(Arc::new(callback));
    }

    pub fn connect(&self) {
        let inner = &self.inner;
        let identity = &inner.identity;
        let mut shared = inner.shared.lock();

        if shared.machine.state() != ConnectionState::Idle {
            info!(state = %shared.machine.state(), "Already connected, connect ignored");
            IGNORED_CALLS.with_label_values(&["connect"]).inc();
            return;
        }

        let channel = match inner.opener.open(&identity.address, ACTORS_NAMESPACE) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(address = %identity.address, "Failed to open channel: {err}");
                CHANNEL_OPEN_FAILURES.inc();
                return;
            }
        };
        let generation = match shared
            .machine
            .transition_and_advance(ConnectionState::Connecting)
        {
            Ok(generation) => generation,
            Err(err) => {
                warn!("{err}");
                return;
            }
        };
        shared.channel = Some(channel.clone());
        CONNECT_ATTEMPTS.inc();

        let weak = Arc::downgrade(inner);
        channel.on(
            TransportEvent::Connect,
            Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.after_connection(generation);
                }
            }),
        );
        let address = identity.address.clone();
        channel.on(
            TransportEvent::Disconnect,
            Arc::new(move || debug!(%address, "Disconnected from hub")),
        );
        debug!(address = %identity.address, %generation, "Connecting to hub");
        channel.connect();
    }

    /// Pipes an application event to the hub, unacknowledged.
    ///
    /// Sent whenever a channel exists; nothing is queued while none does.
    pub fn emit(&self, event: &str, data: Option<Map<String, Value>>) {
        let identity = &self.inner.identity;
        let shared = self.inner.shared.lock();

        let Some(channel) = shared.channel.as_ref() else {
            info!(event, "Not connecting, event dropped");
            IGNORED_CALLS.with_label_values(&["emit"]).inc();
            return;
        };
        if shared.machine.state() != ConnectionState::Registered {
            debug!(event, state = %shared.machine.state(), "Emitting before registration");
        }

        match protocol::envelope(identity, event, data) {
            Ok(payload) => {
                channel.emit(remote_events::PIPE, payload);
                EVENTS_EMITTED
                    .with_label_values(&[identity.module.as_str()])
                    .inc();
                trace!(event, channel_id = %channel_label(channel.as_ref()), "Piped event");
            }
            Err(err) => warn!(event, "Failed to encode event: {err}"),
        }
    }

    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut shared = inner.shared.lock();

        let Some(channel) = shared.channel.take() else {
            info!("Not connecting");
            IGNORED_CALLS.with_label_values(&["disconnect"]).inc();
            return;
        };

        if !shared.machine.state().is_greeted() {
            if let Err(err) = shared.machine.transition_and_advance(ConnectionState::Idle) {
                warn!("{err}");
            }
            channel.disconnect();
            debug!(channel_id = %channel_label(channel.as_ref()), "Closed channel before greeting");
            let on_idle = shared.on_idle.clone();
            drop(shared);
            notify_idle(on_idle);
            return;
        }

        let generation = match shared
            .machine
            .transition_and_advance(ConnectionState::Disconnecting)
        {
            Ok(generation) => generation,
            Err(err) => {
                warn!("{err}");
                channel.disconnect();
                return;
            }
        };

        let payload = match protocol::greeting(&inner.identity) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to encode leave: {err}");
                let on_idle = inner.finish_leave(&mut shared, generation);
                drop(shared);
                channel.disconnect();
                notify_idle(on_idle);
                return;
            }
        };

        let weak = Arc::downgrade(inner);
        let leaving = channel.clone();
        channel.emit_with_ack(
            greeting_events::BYE,
            payload,
            Box::new(move |_| {
                debug!(channel_id = %channel_label(leaving.as_ref()), "Left hub");
                HANDSHAKE_STEPS.with_label_values(&["bye"]).inc();
                leaving.disconnect();
                if let Some(inner) = Weak::upgrade(&weak) {
                    let on_idle = {
                        let mut shared = inner.shared.lock();
                        inner.finish_leave(&mut shared, generation)
                    };
                    notify_idle(on_idle);
                }
            }),
        );
    }
}

impl Drop for ActorConnection {
    fn drop(&mut self) {
        if self.is_connecting() {
            self.disconnect();
        }
    }
}

impl Inner {
    fn after_connection(self: Arc<Self>, generation: Generation) {
        let shared = self.shared.lock();
        let channel = match shared.channel.as_ref() {
            Some(channel) if shared.machine.is_current(generation) => channel.clone(),
            _ => {
                HANDSHAKE_ABORTS.with_label_values(&["connect"]).inc();
                return;
            }
        };
        if shared.machine.state() == ConnectionState::Connecting {
            debug!(address = %self.identity.address, "Connected to hub");
        } else {
            // the transport re-established the socket; the hub has forgotten us
            info!(state = %shared.machine.state(), "Reconnected to hub, greeting again");
        }

        let payload = match protocol::greeting(&self.identity) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to encode greeting: {err}");
                return;
            }
        };
        let weak = Arc::downgrade(&self);
        channel.emit_with_ack(
            greeting_events::HI,
            payload,
            Box::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.after_greeting(generation);
                }
            }),
        );
    }

    fn after_greeting(self: Arc<Self>, generation: Generation) {
        let mut shared = self.shared.lock();
        let channel = match shared.channel.as_ref() {
            Some(channel) if shared.machine.is_current(generation) => channel.clone(),
            _ => {
                HANDSHAKE_ABORTS.with_label_values(&["hi"]).inc();
                return;
            }
        };
        if shared.machine.state() == ConnectionState::Connecting {
            if let Err(err) = shared.machine.transition(ConnectionState::Greeted) {
                warn!("{err}");
                return;
            }
        }
        HANDSHAKE_STEPS.with_label_values(&["hi"]).inc();
        debug!(channel_id = %channel_label(channel.as_ref()), "Greeted");

        let payload = match protocol::registration(&self.identity) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Failed to encode specification: {err}");
                return;
            }
        };
        let weak = Arc::downgrade(&self);
        channel.emit_with_ack(
            remote_events::SPEC,
            payload,
            Box::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.after_registration(generation);
                }
            }),
        );
    }

    fn after_registration(self: Arc<Self>, generation: Generation) {
        let on_ready = {
            let mut shared = self.shared.lock();
            let channel = match shared.channel.as_ref() {
                Some(channel) if shared.machine.is_current(generation) => channel.clone(),
                _ => {
                    HANDSHAKE_ABORTS.with_label_values(&["spec"]).inc();
                    return;
                }
            };
            if shared.machine.state() == ConnectionState::Greeted {
                if let Err(err) = shared.machine.transition(ConnectionState::Registered) {
                    warn!("{err}");
                    return;
                }
            }
            HANDSHAKE_STEPS.with_label_values(&["spec"]).inc();
            info!(
                channel_id = %channel_label(channel.as_ref()),
                module = %self.identity.module,
                "Sent specification"
            );
            shared.on_ready.clone()
        };

        // the callback may call back into the connection
        if let Some(on_ready) = on_ready {
            on_ready();
        }
    }

    /// Returns the idle callback to run once the lock is released.
    fn finish_leave(&self, shared: &mut Shared, generation: Generation) -> Option<IdleCallback> {
        if !shared.machine.is_current(generation) {
            return None;
        }
        match shared.machine.transition(ConnectionState::Idle) {
            Ok(()) => shared.on_idle.clone(),
            Err(err) => {
                warn!("{err}");
                None
            }
        }
    }
}
