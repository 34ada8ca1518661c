// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels inside the message header bag next to the envelope
//! fields. Senders inject the current context before publishing; the dispatch
//! engine extracts it and opens a consumer span per message.

use crate::message::Message;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// An adapter for injecting and extracting OpenTelemetry context from the
/// message header bag.
pub(crate) struct TracePropagator<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> TracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for TracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for TracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Injects the current trace context into an outgoing message.
pub(crate) fn inject(ctx: &Context, message: &mut Message) {
    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut TracePropagator::new(&mut message.headers))
    });
}

/// Extracts the trace context from an incoming message and starts a consumer
/// span named after the interaction method.
pub(crate) fn new_span(message: &Message, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = message.headers.clone();

    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&TracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
