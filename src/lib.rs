// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod amqp;
pub mod async_sender;
pub mod consumer;
pub mod errors;
pub mod group;
pub mod message;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod sender;
pub mod serializer;
pub mod transport;
