// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Senders
//!
//! The [`Sender`] facade publishes messages under the four interaction
//! methods: fire-and-forget worker jobs, synchronous commands with a blocking
//! reply wait, unconditional emit broadcasts, and routing-key-filtered topic
//! broadcasts. Batched asynchronous commands are created through
//! [`Sender::async_commands`].

use crate::{
    async_sender::AsyncSender,
    errors::AmqpError,
    message::{AckStatus, Method, MAX_PRIORITY, QUEUE_DEFAULT_TTL},
    otel,
    queue::Queue,
    transport::{ExchangeSpec, PublishOptions},
};
use opentelemetry::Context;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::error;

/// Default timeout for a synchronous command, milliseconds.
pub const COMMAND_MESSAGE_TIMEOUT: u64 = 10_000;

/// Slack added to the request TTL so an in-flight reply is not expired the
/// instant the caller stops waiting, milliseconds.
pub const COMMAND_MESSAGE_EXPIRE_AFTER_SEND: u64 = 1_000;

pub(crate) fn validate_priority(priority: Option<u8>) -> Result<(), AmqpError> {
    match priority {
        Some(p) if p > MAX_PRIORITY => Err(AmqpError::Configuration(format!(
            "priority accept between 0 and {MAX_PRIORITY}"
        ))),
        _ => Ok(()),
    }
}

pub(crate) fn validate_timeout(timeout: u64) -> Result<(), AmqpError> {
    if timeout < 1 {
        return Err(AmqpError::Configuration(
            "timeout should be more than 0".to_owned(),
        ));
    }
    Ok(())
}

fn validate_name(name: &str, what: &str) -> Result<(), AmqpError> {
    if name.trim().is_empty() {
        return Err(AmqpError::Configuration(format!("{what} is required")));
    }
    Ok(())
}

/// Client for publishing messages to the bus.
pub struct Sender {
    queue: Arc<Queue>,
    passive: bool,
}

impl Sender {
    /// Creates a sender that passively verifies target queues and exchanges
    /// exist before publishing.
    pub fn new(queue: Arc<Queue>) -> Sender {
        Sender {
            queue,
            passive: true,
        }
    }

    /// Disables the passive existence check on targets; they are declared
    /// instead.
    pub fn without_passive(mut self) -> Sender {
        self.passive = false;
        self
    }

    /// Sends a fire-and-forget job to workers of a queue and returns the
    /// message id. `expiration` and `delay` (both milliseconds) are mutually
    /// exclusive.
    pub async fn worker(
        &self,
        queue_name: &str,
        job_name: &str,
        data: &Value,
        priority: Option<u8>,
        expiration: Option<u64>,
        delay: Option<u64>,
    ) -> Result<String, AmqpError> {
        validate_name(queue_name, "queue name")?;
        validate_name(job_name, "job name")?;
        validate_priority(priority)?;
        if delay.is_some() && expiration.is_some() {
            return Err(AmqpError::Configuration(
                "just one of delay or expiration can be set".to_owned(),
            ));
        }

        let mut spec = self.queue.queue_spec(queue_name, true, QUEUE_DEFAULT_TTL);
        if self.passive {
            spec = spec.passive();
        }
        self.queue.transport().declare_queue(&spec).await?;

        let mut message = self.queue.create_message(data, true)?;
        message.set_queue(queue_name);
        message.set_job(job_name);
        message.set_method(Method::Worker);
        otel::inject(&Context::current(), &mut message);

        self.queue
            .transport()
            .publish_to_queue(
                queue_name,
                &message,
                &PublishOptions::default()
                    .priority(priority)
                    .ttl(expiration)
                    .delay(delay),
            )
            .await?;

        Ok(message.message_id.unwrap_or_default())
    }

    /// Broadcasts to every consumer subscribed to a topic and returns the
    /// message id.
    pub async fn emit(
        &self,
        topic_name: &str,
        data: &Value,
        delay: Option<u64>,
    ) -> Result<String, AmqpError> {
        validate_name(topic_name, "topic name")?;

        let mut exchange = ExchangeSpec::new(topic_name).fanout();
        if self.passive {
            exchange = exchange.passive();
        }
        self.queue.transport().declare_exchange(&exchange).await?;

        // a temporary binding keeps the broadcast from vanishing when no
        // subscriber queue exists yet
        let temporary = self.queue.transport().declare_temporary_queue().await?;
        self.queue
            .transport()
            .bind_queue(&temporary, topic_name, "")
            .await?;

        let mut message = self.queue.create_message(data, true)?;
        message.set_topic(topic_name);
        message.set_method(Method::Emit);
        otel::inject(&Context::current(), &mut message);

        self.queue
            .transport()
            .publish_to_exchange(
                topic_name,
                "",
                &message,
                &PublishOptions::default().delay(delay),
            )
            .await?;

        Ok(message.message_id.unwrap_or_default())
    }

    /// Broadcasts to consumers whose topic subscription matches the routing
    /// key and returns the message id.
    pub async fn topic(
        &self,
        topic_name: &str,
        routing_key: &str,
        data: &Value,
        delay: Option<u64>,
    ) -> Result<String, AmqpError> {
        validate_name(topic_name, "topic name")?;
        validate_name(routing_key, "routing key")?;

        let mut exchange = ExchangeSpec::new(topic_name);
        if self.passive {
            exchange = exchange.passive();
        }
        self.queue.transport().declare_exchange(&exchange).await?;

        let temporary = self.queue.transport().declare_temporary_queue().await?;
        self.queue
            .transport()
            .bind_queue(&temporary, topic_name, routing_key)
            .await?;

        let mut message = self.queue.create_message(data, true)?;
        message.set_topic(topic_name);
        message.set_method(Method::Topic);
        message.routing_key = Some(routing_key.to_owned());
        otel::inject(&Context::current(), &mut message);

        self.queue
            .transport()
            .publish_to_exchange(
                topic_name,
                routing_key,
                &message,
                &PublishOptions::default().delay(delay),
            )
            .await?;

        Ok(message.message_id.unwrap_or_default())
    }

    /// Sends a command and blocks up to `timeout` milliseconds for its
    /// reply, returning the decoded reply body.
    ///
    /// The request is published with a fresh correlation id and a private
    /// exclusive reply queue; its TTL is the timeout plus a fixed slack so
    /// an unconsumed request expires shortly after the caller gives up.
    pub async fn command(
        &self,
        queue_name: &str,
        job_name: &str,
        data: &Value,
        timeout: u64,
        priority: Option<u8>,
    ) -> Result<Value, AmqpError> {
        validate_name(queue_name, "queue name")?;
        validate_name(job_name, "job name")?;
        validate_timeout(timeout)?;
        validate_priority(priority)?;

        let transport = self.queue.transport();

        let reply_queue = transport.declare_temporary_queue().await?;
        let mut reply_consumer = transport.create_consumer(&reply_queue).await?;

        let mut spec = self.queue.queue_spec(queue_name, false, QUEUE_DEFAULT_TTL);
        if self.passive {
            spec = spec.passive();
        }
        transport.declare_queue(&spec).await?;

        let mut message = self.queue.create_message(data, false)?;
        message.set_queue(queue_name);
        message.set_job(job_name);
        message.set_method(Method::Command);
        message.correlation_id = Some(self.queue.unique_identify());
        message.reply_to = Some(reply_queue);
        otel::inject(&Context::current(), &mut message);

        transport
            .publish_to_queue(
                queue_name,
                &message,
                &PublishOptions::default()
                    .priority(priority)
                    .ttl(Some(timeout + COMMAND_MESSAGE_EXPIRE_AFTER_SEND)),
            )
            .await?;

        let Some(reply) = reply_consumer
            .receive(Duration::from_millis(timeout))
            .await?
        else {
            return Err(AmqpError::CommandTimeout);
        };

        if reply.ack_status() == Some(AckStatus::Reject) {
            reply_consumer.ack(&reply).await?;
            return Err(AmqpError::CommandReject);
        }

        if reply.correlation_id != message.correlation_id {
            reply_consumer.reject(&reply, false).await?;
            error!(
                sent = ?message.correlation_id,
                received = ?reply.correlation_id,
                "command reply correlation not same as sent message"
            );
            return Err(AmqpError::CorrelationInvalid);
        }

        let Some(serializer) = self.queue.serializers().get(reply.serializer()) else {
            reply_consumer.reject(&reply, false).await?;
            error!(
                serializer = reply.serializer(),
                "serializer of command reply not found"
            );
            return Err(AmqpError::SerializerNotFound(reply.serializer().to_owned()));
        };

        reply_consumer.ack(&reply).await?;

        serializer.unserialize(&reply.body)
    }

    /// Creates a batched asynchronous command client sharing one private
    /// reply queue; `timeout` (milliseconds) bounds the whole batch.
    pub async fn async_commands(&self, timeout: u64) -> Result<AsyncSender, AmqpError> {
        AsyncSender::new(self.queue.clone(), timeout).await
    }
}
