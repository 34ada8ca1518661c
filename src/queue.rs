// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Hub
//!
//! The [`Queue`] value ties together the application identity, the broker
//! transport, and the serializer registry. Both the dispatch engine and the
//! senders are built from a shared `Arc<Queue>`; it owns message construction
//! defaults (message id, timestamp, serializer header, content type) and the
//! crate-wide queue declaration defaults (max priority, expiry, lazy mode,
//! application tag).

use crate::{
    errors::AmqpError,
    message::{Message, MAX_PRIORITY},
    serializer::{Serializer, SerializerRegistry},
    transport::{
        QueueSpec, Transport, QUEUE_ARG_APP, QUEUE_ARG_EXPIRES, QUEUE_ARG_MAX_PRIORITY,
        QUEUE_ARG_QUEUE_MODE,
    },
};
use serde_json::{json, Value};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Shared hub for one broker connection.
pub struct Queue {
    app_name: String,
    transport: Arc<dyn Transport>,
    serializers: SerializerRegistry,
    lazy_queue: bool,
}

impl Queue {
    /// Creates a queue hub with the built-in serializers, JSON as default.
    pub fn new(app_name: &str, transport: Arc<dyn Transport>) -> Queue {
        Queue {
            app_name: app_name.to_owned(),
            transport,
            serializers: SerializerRegistry::new(),
            lazy_queue: true,
        }
    }

    /// Registers an additional serializer.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Queue {
        self.serializers.add(serializer);
        self
    }

    /// Selects the serializer used when this side encodes messages.
    pub fn with_default_serializer(mut self, name: &'static str) -> Result<Queue, AmqpError> {
        self.serializers.set_default(name)?;
        Ok(self)
    }

    /// Disables the lazy queue mode on declared queues.
    pub fn without_lazy_queue(mut self) -> Queue {
        self.lazy_queue = false;
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    /// Generates a unique identifier for message and correlation ids.
    pub fn unique_identify(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Creates a message with this hub's defaults: body encoded with the
    /// default serializer, fresh message id, timestamp, serializer header,
    /// and content type.
    pub fn create_message(&self, data: &Value, persistent: bool) -> Result<Message, AmqpError> {
        let serializer = self.serializers.default_serializer();

        let mut message = Message::new(serializer.serialize(data)?);
        message.message_id = Some(self.unique_identify());
        message.persistent = persistent;
        message.content_type = Some(serializer.content_type().to_owned());
        message.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs());
        message.set_serializer(serializer.name());

        Ok(message)
    }

    /// Builds a queue spec with the crate-wide declaration defaults applied.
    pub fn queue_spec(&self, name: &str, durable: bool, ttl: u64) -> QueueSpec {
        let mut spec = QueueSpec::new(name)
            .durable(durable)
            .argument(QUEUE_ARG_MAX_PRIORITY, json!(MAX_PRIORITY))
            .argument(QUEUE_ARG_EXPIRES, json!(ttl))
            .argument(QUEUE_ARG_APP, json!(self.app_name));

        if self.lazy_queue {
            spec = spec.argument(QUEUE_ARG_QUEUE_MODE, json!("lazy"));
        }

        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use serde_json::json;

    fn queue() -> Queue {
        Queue::new("user_app", Arc::new(MockTransport::new()))
    }

    #[test]
    fn create_message_applies_defaults() {
        let message = queue().create_message(&json!({"id": 123}), false).unwrap();

        assert_eq!(message.serializer(), "json");
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert!(!message.persistent);
        assert!(message.message_id.is_some());
        assert!(message.timestamp.is_some());
        assert_eq!(
            serde_json::from_slice::<Value>(&message.body).unwrap(),
            json!({"id": 123})
        );
    }

    #[test]
    fn queue_spec_carries_declaration_defaults() {
        let spec = queue().queue_spec("jobs", true, 5000);

        assert!(spec.durable);
        assert_eq!(spec.arguments.get("x-max-priority").unwrap(), &json!(5));
        assert_eq!(spec.arguments.get("x-expires").unwrap(), &json!(5000));
        assert_eq!(spec.arguments.get("x-app").unwrap(), &json!("user_app"));
        assert_eq!(spec.arguments.get("x-queue-mode").unwrap(), &json!("lazy"));
    }

    #[test]
    fn lazy_queue_mode_can_be_disabled() {
        let queue = queue().without_lazy_queue();
        let spec = queue.queue_spec("jobs", true, 5000);
        assert!(!spec.arguments.contains_key("x-queue-mode"));
    }

    #[test]
    fn unique_identify_is_unique() {
        let queue = queue();
        assert_ne!(queue.unique_identify(), queue.unique_identify());
    }
}
