// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Groups
//!
//! A consumer group is a named set of processors sharing subscription policy:
//! prefetch, single-active-consumer, redelivery limits and delay. Groups are
//! declared once, before consumption starts, and stay immutable while the
//! engine runs. The hook methods are observability callbacks with no
//! control-flow effect.

use crate::{
    message::{AckStatus, Message},
    processor::{Processor, ProcessorFactory},
};
use async_trait::async_trait;

/// Default maximum number of redeliveries before a message is dropped.
pub const MAX_RETRY_REDELIVER: u32 = 5;

/// Default delay before a redelivered message is pushed back, milliseconds.
pub const REDELIVER_DELAY: u64 = 0;

/// A named collection of processors sharing subscription policy.
#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Unique name of this group within one engine run.
    fn identify(&self) -> &str;

    /// Factories for the processors this group consumes with.
    fn processors(&self) -> Vec<ProcessorFactory>;

    /// Prefetch count applied while this group's queues are declared.
    fn prefetch_count(&self) -> u16 {
        1
    }

    /// Single-active-consumer flag for worker and command queues. Emit and
    /// topic queues are always single-active.
    fn single_active_consumer(&self) -> bool {
        false
    }

    /// Maximum number of redeliveries before a message is dropped.
    fn max_redelivery_retry(&self) -> u32 {
        MAX_RETRY_REDELIVER
    }

    /// Delay before a redelivered message is republished, milliseconds.
    fn redelivery_delay(&self) -> u64 {
        REDELIVER_DELAY
    }

    /// Runs when a message passes the redelivery check.
    async fn message_received(&self, _message: &Message) {}

    /// Runs after a redelivered message has been republished with backoff.
    async fn message_redelivered(&self, _message: &Message) {}

    /// Runs when a message exceeded the redelivery limit and was dropped.
    async fn message_redelivered_maximum_reached(&self, _message: &Message) {}

    /// Runs after the processor outcome has been applied to the broker.
    async fn after_message_acknowledge(
        &self,
        _processor: &dyn Processor,
        _status: AckStatus,
        _message: &Message,
    ) {
    }

    /// Runs when the processor lifecycle for a message has finished.
    async fn processor_finished(&self, _status: Option<AckStatus>, _processor: &dyn Processor) {}
}
