// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! This module defines the application-level envelope carried by every broker
//! message: the interaction method, the routing fields, the serializer name,
//! the acknowledge status of a command reply, and the redelivery counter. The
//! envelope lives in the message header bag under fixed wire names; the typed
//! accessors here are the only place those names appear.

use std::collections::BTreeMap;

/// Wire header carrying the interaction method.
pub const PROPERTY_METHOD: &str = "araz_method";
/// Wire header carrying the target queue name for worker/command messages.
pub const PROPERTY_QUEUE: &str = "araz_queue";
/// Wire header carrying the topic (exchange) name for emit/topic messages.
pub const PROPERTY_TOPIC: &str = "araz_topic";
/// Wire header carrying the job name for worker/command messages.
pub const PROPERTY_JOB: &str = "araz_job";
/// Wire header carrying the serializer name used to encode the body.
pub const PROPERTY_SERIALIZER: &str = "araz_serialize";
/// Wire header carrying the acknowledge status on command replies.
pub const PROPERTY_ACK_STATUS: &str = "araz_ack_status";
/// Wire header carrying the redelivery counter.
pub const PROPERTY_REDELIVERED_COUNT: &str = "araz_redelivered_count";

/// Highest message priority accepted by the senders; queues are declared with
/// `x-max-priority` set to this value.
pub const MAX_PRIORITY: u8 = 5;

/// Default queue time-to-live, 20 days as milliseconds.
pub const QUEUE_DEFAULT_TTL: u64 = 1_728_000_000;

/// The four interaction methods supported by the bus.
///
/// - `Worker`: point-to-point fire-and-forget job
/// - `Command`: point-to-point request/reply
/// - `Topic`: routing-key-filtered broadcast
/// - `Emit`: unconditional broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Worker,
    Command,
    Topic,
    Emit,
}

impl Method {
    /// Wire name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Worker => "worker",
            Method::Command => "command",
            Method::Topic => "topic",
            Method::Emit => "emit",
        }
    }

    /// Parses a wire name, `None` for anything unknown.
    pub fn parse(value: &str) -> Option<Method> {
        match value {
            "worker" => Some(Method::Worker),
            "command" => Some(Method::Command),
            "topic" => Some(Method::Topic),
            "emit" => Some(Method::Emit),
            _ => None,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of processing a message, applied to the broker as
/// acknowledge, reject without requeue, or reject with requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckStatus {
    #[default]
    Ack,
    Reject,
    Requeue,
}

impl AckStatus {
    /// Wire name of the status, used in command reply envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            AckStatus::Ack => "ack",
            AckStatus::Reject => "reject",
            AckStatus::Requeue => "requeue",
        }
    }

    /// Parses a wire name, `None` for anything unknown.
    pub fn parse(value: &str) -> Option<AckStatus> {
        match value {
            "ack" => Some(AckStatus::Ack),
            "reject" => Some(AckStatus::Reject),
            "requeue" => Some(AckStatus::Requeue),
            _ => None,
        }
    }
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application view of a broker message.
///
/// The envelope fields live in `headers`; broker-native properties are plain
/// fields. Only the subset of envelope fields relevant to the method is
/// meaningful: queue and job for worker/command, topic and routing key for
/// topic, topic only for emit. `delivery_tag` is the broker handle used to
/// acknowledge or reject this delivery and is never sent on the wire.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub routing_key: Option<String>,
    pub timestamp: Option<u64>,
    pub redelivered: bool,
    pub delivery_tag: u64,
}

impl Message {
    /// Creates a message with the given encoded body.
    pub fn new(body: Vec<u8>) -> Message {
        Message {
            body,
            persistent: true,
            ..Message::default()
        }
    }

    fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_owned(), value.to_owned());
    }

    /// Interaction method, `None` when missing or unknown.
    pub fn method(&self) -> Option<Method> {
        self.header(PROPERTY_METHOD).and_then(Method::parse)
    }

    pub fn set_method(&mut self, method: Method) {
        self.set_header(PROPERTY_METHOD, method.as_str());
    }

    /// Target queue name, empty string when absent.
    pub fn queue(&self) -> &str {
        self.header(PROPERTY_QUEUE).unwrap_or_default()
    }

    pub fn set_queue(&mut self, queue: &str) {
        self.set_header(PROPERTY_QUEUE, queue);
    }

    /// Topic name, empty string when absent.
    pub fn topic(&self) -> &str {
        self.header(PROPERTY_TOPIC).unwrap_or_default()
    }

    pub fn set_topic(&mut self, topic: &str) {
        self.set_header(PROPERTY_TOPIC, topic);
    }

    /// Job name, empty string when absent.
    pub fn job(&self) -> &str {
        self.header(PROPERTY_JOB).unwrap_or_default()
    }

    pub fn set_job(&mut self, job: &str) {
        self.set_header(PROPERTY_JOB, job);
    }

    /// Name of the serializer that encoded the body, empty string when absent.
    pub fn serializer(&self) -> &str {
        self.header(PROPERTY_SERIALIZER).unwrap_or_default()
    }

    pub fn set_serializer(&mut self, name: &str) {
        self.set_header(PROPERTY_SERIALIZER, name);
    }

    /// Acknowledge status of a command reply, `None` when missing or unknown.
    pub fn ack_status(&self) -> Option<AckStatus> {
        self.header(PROPERTY_ACK_STATUS).and_then(AckStatus::parse)
    }

    pub fn set_ack_status(&mut self, status: AckStatus) {
        self.set_header(PROPERTY_ACK_STATUS, status.as_str());
    }

    /// Number of times this logical message has been redelivered. The counter
    /// travels inside the envelope because the broker does not persist an
    /// attempt count across the backoff republish.
    pub fn redelivery_count(&self) -> u32 {
        self.header(PROPERTY_REDELIVERED_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_redelivery_count(&mut self, count: u32) {
        self.set_header(PROPERTY_REDELIVERED_COUNT, &count.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_wire_names_round_trip() {
        for method in [Method::Worker, Method::Command, Method::Topic, Method::Emit] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("job"), None);
        assert_eq!(Method::parse(""), None);
    }

    #[test]
    fn ack_status_wire_names_round_trip() {
        for status in [AckStatus::Ack, AckStatus::Reject, AckStatus::Requeue] {
            assert_eq!(AckStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AckStatus::parse("nack"), None);
    }

    #[test]
    fn envelope_accessors_use_wire_headers() {
        let mut message = Message::new(b"{}".to_vec());
        message.set_method(Method::Command);
        message.set_queue("user_service");
        message.set_job("profile_info");
        message.set_serializer("json");
        message.set_ack_status(AckStatus::Reject);

        assert_eq!(message.headers.get("araz_method").unwrap(), "command");
        assert_eq!(message.headers.get("araz_queue").unwrap(), "user_service");
        assert_eq!(message.headers.get("araz_job").unwrap(), "profile_info");
        assert_eq!(message.headers.get("araz_serialize").unwrap(), "json");
        assert_eq!(message.headers.get("araz_ack_status").unwrap(), "reject");

        assert_eq!(message.method(), Some(Method::Command));
        assert_eq!(message.queue(), "user_service");
        assert_eq!(message.job(), "profile_info");
        assert_eq!(message.serializer(), "json");
        assert_eq!(message.ack_status(), Some(AckStatus::Reject));
        assert_eq!(message.topic(), "");
    }

    #[test]
    fn redelivery_count_defaults_to_zero_and_increments() {
        let mut message = Message::new(vec![]);
        assert_eq!(message.redelivery_count(), 0);

        message.set_redelivery_count(message.redelivery_count() + 1);
        assert_eq!(message.redelivery_count(), 1);
        assert_eq!(message.headers.get("araz_redelivered_count").unwrap(), "1");

        message.headers
            .insert("araz_redelivered_count".into(), "not-a-number".into());
        assert_eq!(message.redelivery_count(), 0);
    }
}
