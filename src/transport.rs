// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! This module defines the contract the rest of the crate has with the broker
//! client: declaring queues and exchanges, binding them, publishing with
//! priority/ttl/delay, and consuming with acknowledge control. The dispatch
//! engine and the request clients only ever talk to these traits; the lapin
//! implementation lives in [`crate::amqp`].

use crate::{errors::AmqpError, message::Message};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};

#[cfg(test)]
use mockall::automock;

/// Queue argument controlling single-active-consumer behavior
pub const QUEUE_ARG_SINGLE_ACTIVE_CONSUMER: &str = "x-single-active-consumer";
/// Queue argument limiting the highest accepted priority
pub const QUEUE_ARG_MAX_PRIORITY: &str = "x-max-priority";
/// Queue argument after which an unused queue is removed
pub const QUEUE_ARG_EXPIRES: &str = "x-expires";
/// Queue argument selecting the lazy queue mode
pub const QUEUE_ARG_QUEUE_MODE: &str = "x-queue-mode";
/// Queue argument tagging the owning application
pub const QUEUE_ARG_APP: &str = "x-app";
/// Queue argument for per-queue message time-to-live
pub const QUEUE_ARG_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument naming the dead letter exchange
pub const QUEUE_ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the dead letter routing key
pub const QUEUE_ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// Declaration parameters for a queue.
#[derive(Debug, Clone, Default)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub arguments: BTreeMap<String, Value>,
}

impl QueueSpec {
    /// Creates a queue spec with the given name and default flags.
    pub fn new(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            ..QueueSpec::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Makes the declaration passive, verifying existence without creating.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Adds a declaration argument.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

/// The two exchange kinds the bus uses: direct for topic routing,
/// fanout for emit broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
}

/// Declaration parameters for an exchange.
#[derive(Debug, Clone, Default)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub passive: bool,
}

impl ExchangeSpec {
    /// Creates an exchange spec with the given name, direct by default.
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            ..ExchangeSpec::default()
        }
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Makes the declaration passive, verifying existence without creating.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

/// Per-publish options, all wall-clock milliseconds where applicable.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Message priority, 0..=5
    pub priority: Option<u8>,
    /// Message time-to-live in milliseconds
    pub ttl: Option<u64>,
    /// Delivery delay in milliseconds; the transport owns the delay mechanism
    pub delay: Option<u64>,
}

impl PublishOptions {
    pub fn priority(mut self, priority: Option<u8>) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl(mut self, ttl: Option<u64>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn delay(mut self, delay: Option<u64>) -> Self {
        self.delay = delay;
        self
    }
}

/// Broker operations the bus depends on.
///
/// Implementations must be safe to share behind an `Arc`; the engine and the
/// request clients hold the same instance.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a queue, creating it or (for passive specs) verifying it.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError>;

    /// Declares an exclusive auto-delete queue with a broker-generated name
    /// and returns that name.
    async fn declare_temporary_queue(&self) -> Result<String, AmqpError>;

    /// Declares an exchange.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange under a routing key, empty for fanout.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Creates a consumer subscribed to one queue.
    async fn create_consumer(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, AmqpError>;

    /// Publishes directly to a queue through the default exchange.
    async fn publish_to_queue(
        &self,
        queue: &str,
        message: &Message,
        options: &PublishOptions,
    ) -> Result<(), AmqpError>;

    /// Publishes to an exchange under a routing key, empty for fanout.
    async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        options: &PublishOptions,
    ) -> Result<(), AmqpError>;

    /// Calls basic.qos on the underlying channel.
    async fn qos(&self, prefetch_size: u32, prefetch_count: u16, global: bool)
        -> Result<(), AmqpError>;
}

/// A subscription on one queue delivering messages one at a time.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Blocks up to `timeout` for the next message.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, AmqpError>;

    /// Returns the next message if one is already available.
    async fn receive_no_wait(&mut self) -> Result<Option<Message>, AmqpError>;

    /// Acknowledges a delivery.
    async fn ack(&self, message: &Message) -> Result<(), AmqpError>;

    /// Rejects a delivery, optionally asking the broker to requeue it.
    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), AmqpError>;
}
