// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Serializers
//!
//! This module defines the codec contract for message bodies and the registry
//! that resolves codecs by their wire name. Payloads are dynamic
//! [`serde_json::Value`] trees so that independently deployed services can
//! exchange data without sharing types. JSON and MessagePack codecs are built
//! in and registered by default.

use crate::errors::AmqpError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type used for binary codecs
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// A payload codec.
///
/// The `name` is carried on the wire in the message envelope so that the
/// receiving side can resolve the same codec; the `content_type` is set on
/// the broker message properties.
pub trait Serializer: Send + Sync {
    fn serialize(&self, data: &Value) -> Result<Vec<u8>, AmqpError>;

    fn unserialize(&self, data: &[u8]) -> Result<Value, AmqpError>;

    /// Wire name of the codec, unique within a registry.
    fn name(&self) -> &'static str;

    /// Content type reported on messages encoded with this codec.
    fn content_type(&self) -> &'static str;
}

/// Serialize and unserialize data with JSON.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, data: &Value) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(data).map_err(|_| AmqpError::SerializeError)
    }

    fn unserialize(&self, data: &[u8]) -> Result<Value, AmqpError> {
        serde_json::from_slice(data).map_err(|_| AmqpError::ParsePayloadError)
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}

/// Serialize and unserialize data with MessagePack.
#[derive(Debug, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn serialize(&self, data: &Value) -> Result<Vec<u8>, AmqpError> {
        rmp_serde::to_vec(data).map_err(|_| AmqpError::SerializeError)
    }

    fn unserialize(&self, data: &[u8]) -> Result<Value, AmqpError> {
        rmp_serde::from_slice(data).map_err(|_| AmqpError::ParsePayloadError)
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn content_type(&self) -> &'static str {
        BINARY_CONTENT_TYPE
    }
}

/// Name-keyed set of serializers with one marked as the sending default.
///
/// Built once before the queue handle is shared; lookups during consumption
/// are read-only.
pub struct SerializerRegistry {
    serializers: HashMap<&'static str, Arc<dyn Serializer>>,
    default: &'static str,
}

impl Default for SerializerRegistry {
    fn default() -> Self {
        SerializerRegistry::new()
    }
}

impl SerializerRegistry {
    /// Creates a registry holding the built-in codecs, JSON as default.
    pub fn new() -> SerializerRegistry {
        let mut registry = SerializerRegistry {
            serializers: HashMap::default(),
            default: "json",
        };
        registry.add(Arc::new(JsonSerializer));
        registry.add(Arc::new(MessagePackSerializer));
        registry
    }

    /// Adds a serializer, replacing any previous one with the same name.
    pub fn add(&mut self, serializer: Arc<dyn Serializer>) {
        self.serializers.insert(serializer.name(), serializer);
    }

    /// Removes a serializer by name. The current default stays registered.
    pub fn remove(&mut self, name: &str) {
        if name != self.default {
            self.serializers.remove(name);
        }
    }

    /// Marks an already registered serializer as the sending default.
    pub fn set_default(&mut self, name: &'static str) -> Result<(), AmqpError> {
        if !self.serializers.contains_key(name) {
            return Err(AmqpError::SerializerNotFound(name.to_owned()));
        }
        self.default = name;
        Ok(())
    }

    /// Resolves a serializer by its wire name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Serializer>> {
        self.serializers.get(name).cloned()
    }

    /// The serializer used when this side encodes a message.
    pub fn default_serializer(&self) -> Arc<dyn Serializer> {
        // The default name is validated on every mutation.
        self.serializers[self.default].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn composite_value() -> Value {
        json!({
            "id": 123,
            "name": "user",
            "flags": [true, false, null],
            "nested": {
                "ratio": 0.5,
                "tags": ["a", "b"],
                "deep": {"count": -7}
            }
        })
    }

    #[test]
    fn json_round_trip() {
        let serializer = JsonSerializer;
        let value = composite_value();
        let bytes = serializer.serialize(&value).unwrap();
        assert_eq!(serializer.unserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn msgpack_round_trip() {
        let serializer = MessagePackSerializer;
        let value = composite_value();
        let bytes = serializer.serialize(&value).unwrap();
        assert_eq!(serializer.unserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn json_rejects_invalid_payload() {
        assert_eq!(
            JsonSerializer.unserialize(b"{not json"),
            Err(AmqpError::ParsePayloadError)
        );
    }

    #[test]
    fn registry_resolves_by_wire_name() {
        let registry = SerializerRegistry::new();
        assert_eq!(registry.get("json").unwrap().name(), "json");
        assert_eq!(registry.get("msgpack").unwrap().name(), "msgpack");
        assert!(registry.get("igbinary").is_none());
        assert_eq!(registry.default_serializer().name(), "json");
    }

    #[test]
    fn registry_default_must_be_registered() {
        let mut registry = SerializerRegistry::new();
        assert_eq!(
            registry.set_default("cbor"),
            Err(AmqpError::SerializerNotFound("cbor".to_owned()))
        );
        registry.set_default("msgpack").unwrap();
        assert_eq!(registry.default_serializer().name(), "msgpack");

        registry.remove("json");
        assert!(registry.get("json").is_none());

        // the default cannot be removed
        registry.remove("msgpack");
        assert!(registry.get("msgpack").is_some());
    }
}
