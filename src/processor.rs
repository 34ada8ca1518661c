// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Processors
//!
//! A processor is one message handler. Instead of a handler class hierarchy,
//! a processor declares its interaction method and routing names through a
//! [`ProcessorBinding`] tag, and the dispatch engine switches on that tag.
//! Hook methods around `execute` let a processor observe and steer the
//! message lifecycle; all of them have no-op defaults.

use crate::message::{AckStatus, Message, QUEUE_DEFAULT_TTL};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Factory producing fresh processor instances.
///
/// The registry stores the factory next to the live instance so that
/// [`Processor::reset_after_process`] can swap in a clean one between
/// messages.
pub type ProcessorFactory = Arc<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

/// Declared identity of a processor: its method tag plus the names the
/// registry routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorBinding {
    /// Fire-and-forget job on a queue.
    Worker { queue: String, job: String },
    /// Request/reply job on a queue.
    Command { queue: String, job: String },
    /// Routing-key-filtered broadcast; the queue is this consumer's own
    /// queue bound to the direct exchange under each routing key.
    Topic {
        topic: String,
        queue: String,
        routing_keys: Vec<String>,
    },
    /// Unconditional broadcast; the queue is bound to the fanout exchange.
    Emit { topic: String, queue: String },
}

impl ProcessorBinding {
    /// The queue this processor consumes from.
    pub fn queue(&self) -> &str {
        match self {
            ProcessorBinding::Worker { queue, .. }
            | ProcessorBinding::Command { queue, .. }
            | ProcessorBinding::Topic { queue, .. }
            | ProcessorBinding::Emit { queue, .. } => queue,
        }
    }
}

/// Decoded payload handed to a processor.
///
/// Topic deliveries carry the routing key they matched on; every other
/// method delivers the plain body.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Plain(Value),
    Topic { routing_key: String, body: Value },
}

impl Request {
    pub fn body(&self) -> &Value {
        match self {
            Request::Plain(body) => body,
            Request::Topic { body, .. } => body,
        }
    }

    pub fn routing_key(&self) -> Option<&str> {
        match self {
            Request::Plain(_) => None,
            Request::Topic { routing_key, .. } => Some(routing_key),
        }
    }
}

/// One message handler.
///
/// The engine drives the lifecycle strictly in this order for every
/// delivery: `before_execute`, `execute`, `after_execute`, `process` (whose
/// result is applied to the broker), `after_message_acknowledge`, the
/// command reply (command method only), then `processor_finished`.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Declared method tag and routing names. Must be constant for the
    /// lifetime of the instance.
    fn binding(&self) -> ProcessorBinding;

    /// Time-to-live applied to this processor's queue, milliseconds.
    fn queue_ttl(&self) -> u64 {
        QUEUE_DEFAULT_TTL
    }

    /// Whether this processor's queue is declared durable. Command queues
    /// are always non-durable regardless of this value.
    fn durable_queue(&self) -> bool {
        true
    }

    /// Runs before `execute`. Returning false rejects the message and skips
    /// `execute`, `after_execute` and `process`; a command additionally
    /// replies with reject status.
    async fn before_execute(&self, _request: &Request) -> bool {
        true
    }

    /// The main action. Only command processors return a payload; it becomes
    /// the body of the reply.
    async fn execute(&self, request: Request) -> Option<Value>;

    /// Runs after `execute`.
    async fn after_execute(&self, _request: &Request) {}

    /// Decides the broker outcome for this delivery.
    async fn process(&self, _message: &Message) -> AckStatus {
        AckStatus::Ack
    }

    /// Runs after the outcome has been applied to the broker.
    async fn after_message_acknowledge(&self, _status: AckStatus) {}

    /// Runs after the reply of a command has been published.
    async fn after_message_reply_to_command(
        &self,
        _message_id: Option<&str>,
        _reply_message_id: Option<&str>,
        _correlation_id: &str,
        _status: AckStatus,
    ) {
    }

    /// Runs last; `None` when the delivery never reached this processor.
    async fn processor_finished(&self, _status: Option<AckStatus>) {}

    /// When true, the registry replaces this instance with a freshly built
    /// one after the message finishes, so state accumulated during execution
    /// cannot leak into the next message.
    fn reset_after_process(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_shapes() {
        let plain = Request::Plain(json!({"id": 1}));
        assert_eq!(plain.body(), &json!({"id": 1}));
        assert_eq!(plain.routing_key(), None);

        let topic = Request::Topic {
            routing_key: "user_topic_update".into(),
            body: json!([1, 2]),
        };
        assert_eq!(topic.body(), &json!([1, 2]));
        assert_eq!(topic.routing_key(), Some("user_topic_update"));
    }

    #[test]
    fn binding_exposes_queue() {
        let binding = ProcessorBinding::Topic {
            topic: "user".into(),
            queue: "user_events".into(),
            routing_keys: vec!["user_topic_create".into()],
        };
        assert_eq!(binding.queue(), "user_events");
    }
}
