//! Prometheus counters for the actor protocol, kept in a crate-local registry.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry, Encoder,
    IntCounter, IntCounterVec, Registry, TextEncoder,
};

lazy_static! {
    pub static ref HUB_ACTOR_REGISTRY: Registry =
        Registry::new_custom(Some("hub_actor".to_string()), None).unwrap();

    pub static ref CONNECT_ATTEMPTS: IntCounter = register_int_counter_with_registry!(
        "connect_attempts_total",
        "connect() calls that opened a channel",
        HUB_ACTOR_REGISTRY
    )
    .unwrap();

    pub static ref CHANNEL_OPEN_FAILURES: IntCounter = register_int_counter_with_registry!(
        "channel_open_failures_total",
        "Channels the transport refused to open",
        HUB_ACTOR_REGISTRY
    )
    .unwrap();

    pub static ref HANDSHAKE_STEPS: IntCounterVec = register_int_counter_vec_with_registry!(
        "handshake_steps_total",
        "Acknowledged handshake steps",
        &["step"],
        HUB_ACTOR_REGISTRY
    )
    .unwrap();

    pub static ref HANDSHAKE_ABORTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "handshake_aborts_total",
        "Continuations that found their connect cycle torn down",
        &["step"],
        HUB_ACTOR_REGISTRY
    )
    .unwrap();

    pub static ref EVENTS_EMITTED: IntCounterVec = register_int_counter_vec_with_registry!(
        "events_emitted_total",
        "Application events piped to the hub, by module",
        &["module"],
        HUB_ACTOR_REGISTRY
    )
    .unwrap();

    pub static ref IGNORED_CALLS: IntCounterVec = register_int_counter_vec_with_registry!(
        "ignored_calls_total",
        "Calls ignored because the connection was in the wrong state",
        &["operation"],
        HUB_ACTOR_REGISTRY
    )
    .unwrap();
}

/// Renders the registry in the Prometheus text exposition format.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&HUB_ACTOR_REGISTRY.gather(), &mut buffer) {
        tracing::warn!("Failed to encode metrics: {err}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
