// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Engine
//!
//! This module owns the broker subscriptions and the message-received path.
//! It declares one subscription per distinct handler queue, decodes the
//! envelope of every delivery, runs the redelivery state machine, routes the
//! message to exactly one processor, and applies the resulting
//! acknowledge/reject/requeue outcome. Messages are processed strictly one at
//! a time; a processor always runs to completion before the next delivery is
//! pulled.

use crate::{
    errors::AmqpError,
    group::ConsumerGroup,
    message::{AckStatus, Message, Method},
    otel,
    processor::Request,
    queue::Queue,
    registry::ProcessorRegistry,
    transport::{
        ExchangeSpec, PublishOptions, QueueConsumer, QUEUE_ARG_SINGLE_ACTIVE_CONSUMER,
    },
};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use serde_json::{json, Value};
use std::{
    borrow::Cow,
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

/// Pause between empty polls of the subscription set.
const CONSUME_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One active broker subscription, tied to its owning consumer group.
struct Subscription {
    group_index: usize,
    consumer: Box<dyn QueueConsumer>,
}

/// The dispatch engine.
///
/// Built from the shared [`Queue`] hub and the consumer groups declared at
/// startup. [`Consumer::consume`] blocks the calling task until the given
/// wall-clock timeout elapses.
pub struct Consumer {
    queue: Arc<Queue>,
    groups: Vec<Arc<dyn ConsumerGroup>>,
}

impl Consumer {
    pub fn new(queue: Arc<Queue>, groups: Vec<Arc<dyn ConsumerGroup>>) -> Consumer {
        Consumer { queue, groups }
    }

    /// Consumes messages until `timeout` elapses; a zero timeout runs
    /// forever. `consumers` filters the groups by identify, empty selects
    /// all. Registration problems surface here before any subscription is
    /// declared.
    pub async fn consume(&self, timeout: Duration, consumers: &[&str]) -> Result<(), AmqpError> {
        let mut registry = ProcessorRegistry::build(&self.groups, consumers)?;
        let mut subscriptions = self.subscribe(&registry).await?;

        if subscriptions.is_empty() {
            return Err(AmqpError::Configuration(
                "consumer has no processor to create".to_owned(),
            ));
        }

        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let tracer = global::tracer("amqp consumer");

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }

            let mut idle = true;

            for subscription in subscriptions.iter_mut() {
                let message = match subscription.consumer.receive_no_wait().await {
                    Ok(Some(message)) => message,
                    Ok(None) => continue,
                    Err(err) => {
                        error!(error = err.to_string(), "error receiving message");
                        continue;
                    }
                };

                idle = false;

                let group = registry.groups()[subscription.group_index].clone();
                let method = message
                    .method()
                    .map(|m| m.as_str().to_owned())
                    .unwrap_or_default();
                let (ctx, mut span) = otel::new_span(&message, &tracer, &method);

                match self
                    .receive_callback(&mut registry, &group, &*subscription.consumer, &message, &ctx)
                    .await
                {
                    Ok(()) => span.set_status(Status::Ok),
                    Err(err) => {
                        error!(error = err.to_string(), "error consume msg");
                        span.record_error(&err);
                        span.set_status(Status::Error {
                            description: Cow::from("error to consume msg"),
                        });
                    }
                }
            }

            if idle {
                tokio::time::sleep(CONSUME_POLL_INTERVAL).await;
            }
        }

        Ok(())
    }

    /// Declares one subscription per distinct handler queue, per group, in
    /// worker, command, emit, topic order.
    ///
    /// Worker and command subscriptions raise the channel prefetch to the
    /// group's configured count for the duration of their queue declaration
    /// and set it back to 1 before the next handler is processed.
    async fn subscribe(&self, registry: &ProcessorRegistry) -> Result<Vec<Subscription>, AmqpError> {
        let transport = self.queue.transport();
        let mut subscriptions = Vec::new();
        let mut claimed: HashSet<String> = HashSet::default();

        for (group_index, group) in registry.groups().iter().enumerate() {
            for method in [Method::Worker, Method::Command, Method::Emit, Method::Topic] {
                for slot_index in registry.slots_of(group_index, method) {
                    let slot = registry.slot(slot_index);
                    let processor = slot.instance.as_ref();
                    let queue_name = slot.binding.queue().to_owned();

                    // several jobs on one queue share a single subscription;
                    // cross-method clashes were rejected at registry build
                    if !claimed.insert(queue_name.clone()) {
                        continue;
                    }

                    debug!(queue = queue_name, method = method.as_str(), "declaring subscription");

                    match method {
                        Method::Worker | Method::Command => {
                            transport.qos(0, group.prefetch_count(), false).await?;

                            // command queues are non-durable by convention
                            let durable = method == Method::Worker && processor.durable_queue();
                            let spec = self
                                .queue
                                .queue_spec(&queue_name, durable, processor.queue_ttl())
                                .argument(
                                    QUEUE_ARG_SINGLE_ACTIVE_CONSUMER,
                                    json!(group.single_active_consumer()),
                                );
                            transport.declare_queue(&spec).await?;

                            subscriptions.push(Subscription {
                                group_index,
                                consumer: transport.create_consumer(&queue_name).await?,
                            });

                            transport.qos(0, 1, false).await?;
                        }
                        Method::Emit | Method::Topic => {
                            let spec = self
                                .queue
                                .queue_spec(
                                    &queue_name,
                                    processor.durable_queue(),
                                    processor.queue_ttl(),
                                )
                                .argument(QUEUE_ARG_SINGLE_ACTIVE_CONSUMER, json!(true));
                            transport.declare_queue(&spec).await?;

                            match &slot.binding {
                                crate::processor::ProcessorBinding::Emit { topic, .. } => {
                                    let exchange = ExchangeSpec::new(topic).fanout();
                                    transport.declare_exchange(&exchange).await?;
                                    transport.bind_queue(&queue_name, topic, "").await?;
                                }
                                crate::processor::ProcessorBinding::Topic {
                                    topic,
                                    routing_keys,
                                    ..
                                } => {
                                    let exchange = ExchangeSpec::new(topic);
                                    transport.declare_exchange(&exchange).await?;
                                    for routing_key in routing_keys {
                                        transport
                                            .bind_queue(&queue_name, topic, routing_key)
                                            .await?;
                                    }
                                }
                                _ => unreachable!("slot method matches its binding"),
                            }

                            subscriptions.push(Subscription {
                                group_index,
                                consumer: transport.create_consumer(&queue_name).await?,
                            });
                        }
                    }
                }
            }
        }

        Ok(subscriptions)
    }

    /// The per-message path. Every failure here resolves into a broker
    /// outcome for the message; errors escape only when the broker itself
    /// refuses an acknowledge or publish.
    async fn receive_callback(
        &self,
        registry: &mut ProcessorRegistry,
        group: &Arc<dyn ConsumerGroup>,
        consumer: &dyn QueueConsumer,
        message: &Message,
        ctx: &Context,
    ) -> Result<(), AmqpError> {
        let Some(method) = message.method() else {
            consumer.reject(message, false).await?;
            error!(headers = ?message.headers, "unknown method received in consuming");
            return Ok(());
        };

        debug!(
            method = method.as_str(),
            queue = message.queue(),
            topic = message.topic(),
            "received message"
        );

        if self
            .check_redelivered(method, group, consumer, message)
            .await?
        {
            return Ok(());
        }

        group.message_received(message).await;

        let Some(serializer) = self.queue.serializers().get(message.serializer()) else {
            // a peer with the serializer installed may still consume it
            consumer.reject(message, true).await?;
            error!(
                serializer = message.serializer(),
                headers = ?message.headers,
                "serializer not found in consuming"
            );
            return Ok(());
        };

        if method == Method::Command
            && (message.correlation_id.as_deref().unwrap_or_default().is_empty()
                || message.reply_to.as_deref().unwrap_or_default().is_empty())
        {
            consumer.reject(message, false).await?;
            error!(
                headers = ?message.headers,
                "command received without correlation_id and reply_to"
            );
            return Ok(());
        }

        let routing_key = match method {
            Method::Topic => message.routing_key.clone().unwrap_or_default(),
            _ => String::new(),
        };

        let Some(index) = registry.resolve(
            method,
            message.queue(),
            message.topic(),
            &routing_key,
            message.job(),
        ) else {
            consumer.reject(message, true).await?;
            error!(headers = ?message.headers, "processor not found");
            return Ok(());
        };

        let body = match serializer.unserialize(&message.body) {
            Ok(body) => body,
            Err(err) => {
                consumer.reject(message, false).await?;
                error!(error = err.to_string(), "failure to decode message body");
                return Ok(());
            }
        };

        let request = match method {
            Method::Topic => Request::Topic {
                routing_key,
                body,
            },
            _ => Request::Plain(body),
        };

        let processor = registry.slot(index).instance.as_ref();
        let reset = processor.reset_after_process();

        if !processor.before_execute(&request).await {
            consumer.reject(message, false).await?;

            if method == Method::Command {
                let reply_id = self.reply_back(message, None, AckStatus::Reject, ctx).await?;
                processor
                    .after_message_reply_to_command(
                        message.message_id.as_deref(),
                        reply_id.as_deref(),
                        message.correlation_id.as_deref().unwrap_or_default(),
                        AckStatus::Reject,
                    )
                    .await;
            }

            if reset {
                registry.reset(index);
            }
            return Ok(());
        }

        let execute_result = processor.execute(request.clone()).await;
        processor.after_execute(&request).await;

        let ack_result = processor.process(message).await;
        match ack_result {
            AckStatus::Ack => {
                if let Err(err) = consumer.ack(message).await {
                    error!(error = err.to_string(), "error whiling ack msg");
                    return Err(AmqpError::AckMessageError);
                }
            }
            AckStatus::Reject => {
                if let Err(err) = consumer.reject(message, false).await {
                    error!(error = err.to_string(), "error whiling nack msg");
                    return Err(AmqpError::NackMessageError);
                }
            }
            AckStatus::Requeue => {
                if let Err(err) = consumer.reject(message, true).await {
                    error!(error = err.to_string(), "error whiling requeuing msg");
                    return Err(AmqpError::NackMessageError);
                }
            }
        }

        processor.after_message_acknowledge(ack_result).await;
        group
            .after_message_acknowledge(processor, ack_result, message)
            .await;

        if method == Method::Command {
            let reply_id = self
                .reply_back(message, execute_result, ack_result, ctx)
                .await?;
            processor
                .after_message_reply_to_command(
                    message.message_id.as_deref(),
                    reply_id.as_deref(),
                    message.correlation_id.as_deref().unwrap_or_default(),
                    ack_result,
                )
                .await;
        }

        processor.processor_finished(Some(ack_result)).await;
        group.processor_finished(Some(ack_result), processor).await;

        if reset {
            registry.reset(index);
        }

        Ok(())
    }

    /// The redelivery/backoff state machine. Returns true when the message
    /// was terminal here and the processor must not run for this delivery.
    ///
    /// The attempt counter travels inside the envelope: the backoff
    /// republish below produces a brand-new broker message, so server-side
    /// redelivery state would start over without it.
    async fn check_redelivered(
        &self,
        method: Method,
        group: &Arc<dyn ConsumerGroup>,
        consumer: &dyn QueueConsumer,
        message: &Message,
    ) -> Result<bool, AmqpError> {
        if !message.redelivered {
            return Ok(false);
        }

        let redelivery_count = message.redelivery_count();

        if redelivery_count > group.max_redelivery_retry() {
            consumer.reject(message, false).await?;
            error!(
                maximum = group.max_redelivery_retry(),
                headers = ?message.headers,
                "maximum redelivery is reached"
            );
            group.message_redelivered_maximum_reached(message).await;
            return Ok(true);
        }

        let mut republished = message.clone();
        republished.set_redelivery_count(redelivery_count + 1);
        republished.redelivered = false;

        let (queue_name, single_active) = match method {
            Method::Worker | Method::Command => {
                (republished.queue().to_owned(), group.single_active_consumer())
            }
            Method::Emit | Method::Topic => (
                republished.routing_key.clone().unwrap_or_default(),
                true,
            ),
        };

        warn!(
            queue = queue_name,
            count = redelivery_count + 1,
            "redelivering message with backoff"
        );

        let spec = self
            .queue
            .queue_spec(&queue_name, true, crate::message::QUEUE_DEFAULT_TTL)
            .argument(QUEUE_ARG_SINGLE_ACTIVE_CONSUMER, json!(single_active));
        self.queue.transport().declare_queue(&spec).await?;

        let delay = group.redelivery_delay();
        self.queue
            .transport()
            .publish_to_queue(
                &queue_name,
                &republished,
                &PublishOptions::default().delay((delay > 0).then_some(delay)),
            )
            .await?;

        consumer.reject(message, false).await?;
        group.message_redelivered(message).await;

        Ok(true)
    }

    /// Builds and publishes the reply envelope of a command: non-persistent,
    /// encoded with this side's default serializer, same correlation id,
    /// ack-status header set, addressed to the requester's reply queue.
    async fn reply_back(
        &self,
        message: &Message,
        result: Option<Value>,
        status: AckStatus,
        ctx: &Context,
    ) -> Result<Option<String>, AmqpError> {
        let reply_to = message.reply_to.clone().unwrap_or_default();

        let mut reply = self
            .queue
            .create_message(&result.unwrap_or(Value::Null), false)?;
        reply.correlation_id = message.correlation_id.clone();
        reply.reply_to = message.reply_to.clone();
        reply.set_ack_status(status);
        otel::inject(ctx, &mut reply);

        self.queue
            .transport()
            .publish_to_queue(&reply_to, &reply, &PublishOptions::default())
            .await?;

        Ok(reply.message_id)
    }
}
