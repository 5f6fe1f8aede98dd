// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates trace context through message headers and creates a
//! consumer span for every delivery handed to the handlers.

use crate::transport::{HeaderValue, MessageProperties};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, TraceContextExt, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// An adapter for injecting and extracting OpenTelemetry context from message headers.
pub(crate) struct HeaderTracePropagator<'a> {
    headers: &'a mut BTreeMap<String, HeaderValue>,
}

impl<'a> HeaderTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, HeaderValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::LongString(value));
    }
}

impl Extractor for HeaderTracePropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the trace context of `ctx` into the message headers.
pub(crate) fn inject_context(ctx: &Context, props: &mut MessageProperties) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderTracePropagator::new(&mut props.headers))
    });
}

/// Creates a new consumer span for message processing.
///
/// The trace context carried in the headers becomes the parent of the span. The
/// returned context holds the consumer span, so spans started from it by the
/// handlers are its children. The span ends once the last clone of the context is
/// dropped.
pub(crate) fn new_span(props: &MessageProperties, tracer: &BoxedTracer, name: &str) -> Context {
    let mut headers = props.headers.clone();
    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderTracePropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent);

    parent.with_span(span)
}
