// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! This module implements what happens to a single delivery: every handler of the
//! channel runs in registration order, then the message is acknowledged, handed back
//! to its queue with an incremented redelivery counter, or dead-lettered once the
//! counter reached the configured limit.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    transport::{BrokerChannel, Confirmation, Delivery},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Status, TraceContextExt},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Everything needed to process the deliveries of one subscribed queue.
pub(crate) struct Subscription {
    pub(crate) channel_name: String,
    pub(crate) queue: String,
    pub(crate) handlers: Vec<Arc<dyn ConsumerHandler>>,
    pub(crate) max_redeliveries: u32,
    pub(crate) channel: Arc<dyn BrokerChannel>,
}

/// What happened to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    /// Handed back to the queue; carries the message's redelivery counter
    Requeued(u32),
    DeadLettered,
}

/// Runs the handlers for `delivery` and settles it with the broker.
///
/// Handler failures never escape: they become a requeue or a dead-letter. Only
/// failures to settle the message with the broker are returned.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    sub: &Subscription,
) -> Result<Outcome, AmqpError> {
    let count = delivery.properties.redelivery_count();

    let ctx = otel::new_span(&delivery.properties, tracer, &sub.channel_name);
    let span = ctx.span();

    debug!(
        channel = sub.channel_name,
        queue = sub.queue,
        redeliveries = count,
        redelivered = delivery.redelivered,
        "received message"
    );

    let msg = ConsumerMessage {
        channel: sub.channel_name.clone(),
        queue: sub.queue.clone(),
        kind: delivery.properties.kind.clone(),
        message_id: delivery.properties.message_id.clone(),
        data: delivery.data.clone(),
        persistent: delivery.properties.persistent,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        redelivery_count: count,
    };

    let mut failure = None;
    for handler in &sub.handlers {
        if let Err(err) = handler.exec(&ctx, &msg).await {
            failure = Some(AmqpError::HandlerFailure(err.to_string()));
            break;
        }
    }

    let Some(failure) = failure else {
        debug!("message successfully processed");
        return match sub.channel.basic_ack(delivery.delivery_tag).await {
            Err(e) => {
                error!("error whiling ack msg");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(e)
            }
            _ => {
                span.set_status(Status::Ok);
                Ok(Outcome::Acked)
            }
        };
    };

    span.record_error(&failure);
    span.set_status(Status::Error {
        description: Cow::from(failure.to_string()),
    });

    if count < sub.max_redeliveries {
        return requeue(delivery, sub, count, &failure).await;
    }

    error!(
        channel = sub.channel_name,
        queue = sub.queue,
        redeliveries = count,
        error = failure.to_string(),
        "too many attempts, dead-lettering message"
    );

    sub.channel
        .basic_nack(delivery.delivery_tag, false)
        .await
        .map(|_| Outcome::DeadLettered)
}

/// Republishes the message to its own queue with the counter incremented, then
/// acknowledges the original once the broker confirmed the copy. Falls back to a
/// plain requeue when the copy was not confirmed.
async fn requeue(
    delivery: &Delivery,
    sub: &Subscription,
    count: u32,
    failure: &AmqpError,
) -> Result<Outcome, AmqpError> {
    let next = count + 1;
    warn!(
        channel = sub.channel_name,
        queue = sub.queue,
        redeliveries = next,
        limit = sub.max_redeliveries,
        error = failure.to_string(),
        "error whiling handling msg, requeuing for latter"
    );

    let props = delivery.properties.clone().with_redelivery_count(next);
    let republished = sub
        .channel
        .basic_publish("", &sub.queue, &delivery.data, &props)
        .await;

    match republished {
        Ok(Confirmation::Ack) => {
            sub.channel.basic_ack(delivery.delivery_tag).await?;
            Ok(Outcome::Requeued(next))
        }
        other => {
            warn!(
                queue = sub.queue,
                result = ?other,
                "republish not confirmed, requeuing original"
            );
            sub.channel.basic_nack(delivery.delivery_tag, true).await?;
            Ok(Outcome::Requeued(count))
        }
    }
}
