// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! This module implements the [`Transport`] contract on top of a lapin
//! channel: queue/exchange declaration, binding, publishing with
//! priority/ttl/delay, consuming, and qos. Delayed publishing is built from
//! broker primitives with a per-delay dead-letter queue, since the broker has
//! no native delayed-requeue.

use crate::{
    errors::AmqpError,
    message::Message,
    transport::{
        ExchangeKind, ExchangeSpec, PublishOptions, QueueConsumer, QueueSpec, Transport,
        QUEUE_ARG_DEAD_LETTER_EXCHANGE, QUEUE_ARG_DEAD_LETTER_ROUTING_KEY, QUEUE_ARG_EXPIRES,
        QUEUE_ARG_MESSAGE_TTL,
    },
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error};
use uuid::Uuid;

/// How long an unused delay queue lingers past its delay, milliseconds.
const DELAY_QUEUE_EXTRA_EXPIRE: u64 = 60_000;

/// Establishes a connection to the broker and opens one channel on it.
pub async fn new_amqp_channel(
    uri: &str,
    app_name: &str,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(app_name.to_owned()));

    let conn = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// [`Transport`] implementation over a lapin channel.
pub struct AmqpTransport {
    channel: Arc<Channel>,
}

impl AmqpTransport {
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpTransport> {
        Arc::new(AmqpTransport { channel })
    }

    /// Declares the dead-letter queue carrying one delay toward a target and
    /// returns its name. Messages parked there expire after `delay` and are
    /// dead-lettered to the target exchange/routing key; the queue itself is
    /// removed shortly after falling idle.
    async fn declare_delay_queue(
        &self,
        exchange: &str,
        routing_key: &str,
        delay: u64,
    ) -> Result<String, AmqpError> {
        let name = format!("delay.{delay}.{exchange}.{routing_key}");

        let mut arguments = BTreeMap::new();
        arguments.insert(
            ShortString::from(QUEUE_ARG_MESSAGE_TTL),
            AMQPValue::LongLongInt(delay as i64),
        );
        arguments.insert(
            ShortString::from(QUEUE_ARG_EXPIRES),
            AMQPValue::LongLongInt((delay + DELAY_QUEUE_EXTRA_EXPIRE) as i64),
        );
        arguments.insert(
            ShortString::from(QUEUE_ARG_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.to_owned())),
        );
        arguments.insert(
            ShortString::from(QUEUE_ARG_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(routing_key.to_owned())),
        );

        match self
            .channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::from(arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to declare delay queue");
                Err(AmqpError::DeclareQueueError(name))
            }
            _ => Ok(name),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.body,
                properties_from(message, options),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishError)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError> {
        debug!("creating queue: {}", spec.name);

        match self
            .channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: false,
                },
                field_table_from(&spec.arguments),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = spec.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(spec.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", spec.name);
                Ok(())
            }
        }
    }

    async fn declare_temporary_queue(&self) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to declare temporary queue");
                Err(AmqpError::DeclareQueueError(String::new()))
            }
            Ok(queue) => Ok(queue.name().as_str().to_owned()),
        }
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", spec.name);

        let kind = match spec.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };

        match self
            .channel
            .exchange_declare(
                &spec.name,
                kind,
                ExchangeDeclareOptions {
                    passive: spec.passive,
                    durable: spec.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = spec.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(spec.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", spec.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindQueueError(
                    queue.to_owned(),
                    exchange.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn create_consumer(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, AmqpError> {
        let tag = format!("{}-{}", queue, Uuid::new_v4());

        match self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::CreateConsumerError(queue.to_owned()))
            }
            Ok(consumer) => Ok(Box::new(AmqpQueueConsumer {
                channel: self.channel.clone(),
                consumer,
            })),
        }
    }

    async fn publish_to_queue(
        &self,
        queue: &str,
        message: &Message,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        match options.delay {
            Some(delay) if delay > 0 => {
                let delay_queue = self.declare_delay_queue("", queue, delay).await?;
                self.basic_publish("", &delay_queue, message, options).await
            }
            _ => self.basic_publish("", queue, message, options).await,
        }
    }

    async fn publish_to_exchange(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        match options.delay {
            Some(delay) if delay > 0 => {
                let delay_queue = self
                    .declare_delay_queue(exchange, routing_key, delay)
                    .await?;
                self.basic_publish("", &delay_queue, message, options).await
            }
            _ => {
                self.basic_publish(exchange, routing_key, message, options)
                    .await
            }
        }
    }

    async fn qos(
        &self,
        _prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), AmqpError> {
        // lapin only exposes the prefetch count; the size window is not
        // supported by RabbitMQ anyway
        match self
            .channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QosError)
            }
            _ => Ok(()),
        }
    }
}

struct AmqpQueueConsumer {
    channel: Arc<Channel>,
    consumer: lapin::Consumer,
}

#[async_trait]
impl QueueConsumer for AmqpQueueConsumer {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>, AmqpError> {
        match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Ok(None),
            Ok(Some(Err(err))) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
            Ok(Some(Ok(delivery))) => Ok(Some(message_from(&delivery))),
        }
    }

    async fn receive_no_wait(&mut self) -> Result<Option<Message>, AmqpError> {
        match self.consumer.next().now_or_never() {
            None | Some(None) => Ok(None),
            Some(Some(Err(err))) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
            Some(Some(Ok(delivery))) => Ok(Some(message_from(&delivery))),
        }
    }

    async fn ack(&self, message: &Message) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(message.delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_nack(
                message.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

fn field_table_from(arguments: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = BTreeMap::new();

    for (key, value) in arguments {
        let amqp_value = match value {
            Value::Bool(v) => AMQPValue::Boolean(*v),
            Value::Number(v) => AMQPValue::LongLongInt(v.as_i64().unwrap_or_default()),
            Value::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
            _ => continue,
        };
        table.insert(ShortString::from(key.as_str()), amqp_value);
    }

    FieldTable::from(table)
}

fn properties_from(message: &Message, options: &PublishOptions) -> BasicProperties {
    let mut headers = BTreeMap::new();
    for (key, value) in &message.headers {
        headers.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let mut properties = BasicProperties::default()
        .with_headers(FieldTable::from(headers))
        .with_delivery_mode(if message.persistent { 2 } else { 1 });

    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(message_id) = &message.message_id {
        properties = properties.with_message_id(ShortString::from(message_id.as_str()));
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(timestamp) = message.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(priority) = options.priority.or(message.priority) {
        properties = properties.with_priority(priority);
    }
    if let Some(ttl) = options.ttl {
        properties = properties.with_expiration(ShortString::from(ttl.to_string()));
    }

    properties
}

fn message_from(delivery: &Delivery) -> Message {
    let mut message = Message::new(delivery.data.clone());

    if let Some(headers) = delivery.properties.headers() {
        for (key, value) in headers.inner() {
            let value = match value {
                AMQPValue::LongString(v) => v.to_string(),
                AMQPValue::ShortString(v) => v.to_string(),
                AMQPValue::LongLongInt(v) => v.to_string(),
                AMQPValue::LongInt(v) => v.to_string(),
                AMQPValue::Boolean(v) => v.to_string(),
                _ => continue,
            };
            message.headers.insert(key.as_str().to_owned(), value);
        }
    }

    message.content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|v| v.to_string());
    message.correlation_id = delivery
        .properties
        .correlation_id()
        .as_ref()
        .map(|v| v.to_string());
    message.reply_to = delivery.properties.reply_to().as_ref().map(|v| v.to_string());
    message.message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|v| v.to_string());
    message.priority = *delivery.properties.priority();
    message.persistent = *delivery.properties.delivery_mode() == Some(2);
    message.timestamp = *delivery.properties.timestamp();
    message.routing_key = Some(delivery.routing_key.to_string());
    message.redelivered = delivery.redelivered;
    message.delivery_tag = delivery.delivery_tag;

    message
}
