// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Batched Async Commands
//!
//! [`AsyncSender`] sends several commands up front, all sharing one private
//! reply queue, then drains their replies through [`CommandReplies`]: a lazy,
//! single-pass sequence keyed by the caller-supplied correlation ids. The
//! sequence polls the reply consumer without blocking and is not restartable.

use crate::{
    errors::AmqpError,
    message::{AckStatus, Message, Method, QUEUE_DEFAULT_TTL},
    otel,
    queue::Queue,
    sender::{validate_priority, validate_timeout, COMMAND_MESSAGE_EXPIRE_AFTER_SEND},
    transport::{PublishOptions, QueueConsumer},
};
use opentelemetry::Context;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::error;

/// Default timeout for a whole command batch, milliseconds.
pub const COMMAND_ASYNC_MESSAGE_TIMEOUT: u64 = 10_000;

/// Longest accepted correlation id, characters.
pub const MAX_CORRELATION_ID_LENGTH: usize = 100;

/// Interval between reply polls, same cadence as the dispatch engine.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of one async command: the reply status and, for acknowledged
/// replies, the decoded body.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub status: AckStatus,
    pub body: Option<Value>,
}

/// Batched command client over one shared private reply queue.
pub struct AsyncSender {
    queue: Arc<Queue>,
    timeout: u64,
    reply_queue: String,
    consumer: Box<dyn QueueConsumer>,
    sent: HashMap<String, Message>,
}

impl AsyncSender {
    /// Creates the client and its private reply queue; `timeout`
    /// (milliseconds) bounds the whole batch.
    pub async fn new(queue: Arc<Queue>, timeout: u64) -> Result<AsyncSender, AmqpError> {
        validate_timeout(timeout)?;

        let reply_queue = queue.transport().declare_temporary_queue().await?;
        let consumer = queue.transport().create_consumer(&reply_queue).await?;

        Ok(AsyncSender {
            queue,
            timeout,
            reply_queue,
            consumer,
            sent: HashMap::new(),
        })
    }

    /// Sends one command of the batch and returns the client for chaining.
    ///
    /// The caller picks the correlation id; it keys the matching entry of
    /// [`CommandReplies`]. `timeout` applies to this command's request TTL
    /// and cannot exceed the batch timeout.
    pub async fn command(
        mut self,
        queue_name: &str,
        job_name: &str,
        data: &Value,
        correlation_id: &str,
        timeout: u64,
        priority: Option<u8>,
    ) -> Result<AsyncSender, AmqpError> {
        validate_timeout(timeout)?;
        if timeout > self.timeout {
            return Err(AmqpError::Configuration(format!(
                "command timeout {timeout} cant great than async sender timeout {}",
                self.timeout
            )));
        }
        validate_priority(priority)?;

        let correlation_id = correlation_id.trim();
        if correlation_id.is_empty() {
            return Err(AmqpError::Configuration(
                "correlation id required for async command sending".to_owned(),
            ));
        }
        if correlation_id.len() > MAX_CORRELATION_ID_LENGTH {
            return Err(AmqpError::Configuration(format!(
                "correlation id should be less than {MAX_CORRELATION_ID_LENGTH} character"
            )));
        }

        let spec = self.queue.queue_spec(queue_name, false, QUEUE_DEFAULT_TTL);
        self.queue.transport().declare_queue(&spec).await?;

        let mut message = self.queue.create_message(data, false)?;
        message.set_queue(queue_name);
        message.set_job(job_name);
        message.set_method(Method::Command);
        message.correlation_id = Some(correlation_id.to_owned());
        message.reply_to = Some(self.reply_queue.clone());
        otel::inject(&Context::current(), &mut message);

        self.queue
            .transport()
            .publish_to_queue(
                queue_name,
                &message,
                &PublishOptions::default()
                    .priority(priority)
                    .ttl(Some(timeout + COMMAND_MESSAGE_EXPIRE_AFTER_SEND)),
            )
            .await?;

        self.sent.insert(correlation_id.to_owned(), message);

        Ok(self)
    }

    /// Starts draining replies. Consumes the client; the sequence cannot be
    /// restarted.
    pub fn receive(self) -> CommandReplies {
        let deadline = Instant::now() + Duration::from_millis(self.timeout);
        CommandReplies {
            queue: self.queue,
            consumer: self.consumer,
            pending: self.sent,
            deadline,
            done: false,
        }
    }
}

/// Lazy single-pass sequence of async command replies.
///
/// Ends after every sent correlation id has been matched. When the batch
/// deadline passes with replies still pending, the final item is a
/// [`AmqpError::CommandTimeout`]; a correlation or serializer failure also
/// ends the sequence.
pub struct CommandReplies {
    queue: Arc<Queue>,
    consumer: Box<dyn QueueConsumer>,
    pending: HashMap<String, Message>,
    deadline: Instant,
    done: bool,
}

impl CommandReplies {
    /// Next reply of the batch, `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<Result<(String, CommandReply), AmqpError>> {
        loop {
            if self.done || self.pending.is_empty() {
                self.done = true;
                return None;
            }

            if Instant::now() >= self.deadline {
                self.done = true;
                return Some(Err(AmqpError::CommandTimeout));
            }

            let reply = match self.consumer.receive_no_wait().await {
                Ok(reply) => reply,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            let Some(reply) = reply else {
                tokio::time::sleep(RECEIVE_POLL_INTERVAL).await;
                continue;
            };

            let correlation_id = reply.correlation_id.clone().unwrap_or_default();

            if self.pending.remove(&correlation_id).is_none() {
                self.done = true;
                if let Err(err) = self.consumer.reject(&reply, false).await {
                    return Some(Err(err));
                }
                error!(
                    correlation_id = correlation_id,
                    "received async command correlation is invalid"
                );
                return Some(Err(AmqpError::CorrelationInvalid));
            }

            if reply.ack_status() == Some(AckStatus::Reject) {
                if let Err(err) = self.consumer.ack(&reply).await {
                    self.done = true;
                    return Some(Err(err));
                }
                return Some(Ok((
                    correlation_id,
                    CommandReply {
                        status: AckStatus::Reject,
                        body: None,
                    },
                )));
            }

            let Some(serializer) = self.queue.serializers().get(reply.serializer()) else {
                self.done = true;
                if let Err(err) = self.consumer.reject(&reply, false).await {
                    return Some(Err(err));
                }
                error!(
                    serializer = reply.serializer(),
                    correlation_id = correlation_id,
                    "serializer of async command reply not found"
                );
                return Some(Err(AmqpError::SerializerNotFound(
                    reply.serializer().to_owned(),
                )));
            };

            if let Err(err) = self.consumer.ack(&reply).await {
                self.done = true;
                return Some(Err(err));
            }

            let body = match serializer.unserialize(&reply.body) {
                Ok(body) => body,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            return Some(Ok((
                correlation_id,
                CommandReply {
                    status: AckStatus::Ack,
                    body: Some(body),
                },
            )));
        }
    }
}
