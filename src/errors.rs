// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error type shared by the whole crate. The
//! `AmqpError` enum covers configuration and protocol failures raised before
//! or during consumption, broker operation failures, and the typed RPC errors
//! surfaced to command callers.

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// Configuration and protocol variants are fatal: they are raised before any
/// consumption starts or abort the engine instead of corrupting routing. The
/// command variants propagate to the calling code of the request clients.
/// The remaining variants wrap broker operation failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Bad or duplicate registration, detected before consumption starts
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broken contract between engine and broker state, should crash the process
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// No reply arrived for a command within its timeout
    #[error("command timeout")]
    CommandTimeout,

    /// The command handler rejected the request
    #[error("command rejected")]
    CommandReject,

    /// A reply carried a correlation id this client never sent
    #[error("invalid correlation received")]
    CorrelationInvalid,

    /// The serializer named in a message is not registered
    #[error("serializer `{0}` not found")]
    SerializerNotFound(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{0}` to exchange `{1}`")]
    BindQueueError(String, String),

    /// Error creating a consumer on a queue
    #[error("failure to create consumer on `{0}`")]
    CreateConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishError,

    /// Error serializing a payload
    #[error("failure to serialize payload")]
    SerializeError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos")]
    QosError,

    /// Error receiving from a consumer
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
