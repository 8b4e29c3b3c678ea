//! Wire events and payloads exchanged with the hub.
//!
//! Every payload is a JSON object. Field names are part of the hub's
//! contract and must not change.

use crate::error::Result;
use crate::identity::ActorIdentity;
use serde::Serialize;
use serde_json::{Map, Value};

pub mod greeting_events {
    pub const HI: &str = "sg:greet:hi";
    pub const BYE: &str = "sg:greet:bye";
}

pub mod remote_events {
    pub const SPEC: &str = "sg:remote:spec";
    pub const PIPE: &str = "sg:remote:pipe";
}

/// What the actor offers. Methods stay empty: this actor only emits events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityDescriptor<'a> {
    pub name: &'a str,
    pub version: &'a str,
    #[serde(rename = "desc", skip_serializing_if = "Option::is_none")]
    pub description: Option<&'a str>,
    pub methods: Map<String, Value>,
}

impl<'a> CapabilityDescriptor<'a> {
    pub fn for_identity(identity: &'a ActorIdentity) -> Self {
        Self {
            name: &identity.name,
            version: &identity.version,
            description: identity.description.as_deref(),
            methods: Map::new(),
        }
    }
}

#[derive(Serialize)]
struct Greeting<'a> {
    key: &'a str,
}

#[derive(Serialize)]
struct Registration<'a> {
    name: &'a str,
    spec: CapabilityDescriptor<'a>,
}

/// Routing wrapper around an application event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEnvelope<'a> {
    pub key: &'a str,
    pub module: &'a str,
    pub event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl<'a> OutboundEnvelope<'a> {
    pub fn new(
        identity: &'a ActorIdentity,
        event: &'a str,
        data: Option<Map<String, Value>>,
    ) -> Self {
        Self {
            key: &identity.key,
            module: &identity.module,
            event,
            data,
        }
    }
}

/// Payload for both `sg:greet:hi` and `sg:greet:bye`.
pub fn greeting(identity: &ActorIdentity) -> Result<Value> {
    Ok(serde_json::to_value(Greeting { key: &identity.key })?)
}

/// Payload for `sg:remote:spec`.
pub fn registration(identity: &ActorIdentity) -> Result<Value> {
    Ok(serde_json::to_value(Registration {
        name: &identity.module,
        spec: CapabilityDescriptor::for_identity(identity),
    })?)
}

/// Payload for `sg:remote:pipe`.
pub fn envelope(
    identity: &ActorIdentity,
    event: &str,
    data: Option<Map<String, Value>>,
) -> Result<Value> {
    Ok(serde_json::to_value(OutboundEnvelope::new(
        identity, event, data,
    ))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn identity() -> ActorIdentity {
        ActorIdentity::new("http://hub:3000", "K", "N", "1.0.0", "M")
    }

    #[test]
    fn test_greeting_payload() {
        assert_eq!(greeting(&identity()).unwrap(), json!({"key": "K"}));
    }

    #[test]
    fn test_registration_omits_missing_description() {
        assert_eq!(
            registration(&identity()).unwrap(),
            json!({"name": "M", "spec": {"name": "N", "version": "1.0.0", "methods": {}}})
        );
    }

    #[test]
    fn test_registration_with_description() {
        let identity = identity().with_description("D");
        assert_eq!(
            registration(&identity).unwrap(),
            json!({
                "name": "M",
                "spec": {"name": "N", "version": "1.0.0", "desc": "D", "methods": {}}
            })
        );
    }

    #[test]
    fn test_envelope_with_data() {
        let data = json!({"x": 1}).as_object().cloned();
        assert_eq!(
            envelope(&identity(), "alarm", data).unwrap(),
            json!({"key": "K", "module": "M", "event": "alarm", "data": {"x": 1}})
        );
    }

    #[test]
    fn test_envelope_without_data_has_no_data_field() {
        let payload = envelope(&identity(), "alarm", None).unwrap();
        assert_eq!(
            payload,
            json!({"key": "K", "module": "M", "event": "alarm"})
        );
        assert!(payload.get("data").is_none());
    }
}
