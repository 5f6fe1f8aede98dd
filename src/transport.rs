// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The messaging core talks to the broker exclusively through the traits in this
//! module. [`crate::channel::LapinTransport`] implements them over lapin and
//! [`crate::memory::InMemoryBroker`] implements them in-process.
//!
//! The value types here (`MessageProperties`, `HeaderValue`, `Delivery`) are
//! transport-neutral so that the producer, consumer and trace propagation never
//! depend on a client library's wire types.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// Header carrying the number of times a message was handed back to its queue
/// after a handler failure.
pub const AMQP_HEADERS_REDELIVERY_COUNT: &str = "x-redelivery-count";

/// Header and argument values supported by the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
}

impl HeaderValue {
    /// Integer value, whatever the width.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::LongInt(v) => Some(*v as i64),
            HeaderValue::LongLongInt(v) => Some(*v),
            HeaderValue::LongUint(v) => Some(*v as i64),
            _ => None,
        }
    }

    /// String value, short or long.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::ShortString(v) | HeaderValue::LongString(v) => Some(v),
            _ => None,
        }
    }
}

/// Message metadata sent along with the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub kind: Option<String>,
    /// Survive a broker restart (delivery mode 2)
    pub persistent: bool,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl MessageProperties {
    /// Redeliveries already consumed by this message. Absent or malformed
    /// headers count as zero.
    pub fn redelivery_count(&self) -> u32 {
        self.headers
            .get(AMQP_HEADERS_REDELIVERY_COUNT)
            .and_then(HeaderValue::as_i64)
            .map(|v| v.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or_default()
    }

    /// Sets the redelivery counter header.
    pub fn with_redelivery_count(mut self, count: u32) -> Self {
        self.headers.insert(
            AMQP_HEADERS_REDELIVERY_COUNT.to_owned(),
            HeaderValue::LongLongInt(count as i64),
        );
        self
    }
}

/// A message handed out by the broker to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned, scoped to the channel that received it
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
}

/// Outcome of a publisher confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack(String),
    /// The channel is not in confirm mode
    NotRequested,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens connections to the broker. Every call yields a fresh transport handle.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One physical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves when the connection drops unexpectedly, with the reason.
    /// Never resolves after a graceful [`BrokerConnection::close`].
    async fn closed(&self) -> String;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// A multiplexed session over a [`BrokerConnection`]. Invalid once its connection
/// is gone.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Publishes and waits for the broker confirmation when the channel is in
    /// confirm mode.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<Confirmation, AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self);
}
