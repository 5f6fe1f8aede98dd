// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Producer
//!
//! This module publishes messages to the logical channels of the active topology.
//! A publish only succeeds once the broker confirmed the message; the producer never
//! retries on its own, since retrying a publish may duplicate the message.

use crate::{
    connection::{ConnectionManager, ConnectionState},
    configs::PublishPolicy,
    errors::AmqpError,
    otel,
    topology::Pattern,
    transport::{BrokerChannel, Confirmation, HeaderValue, MessageProperties},
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Per-call publish options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Survive a broker restart; falls back to the configured channel default
    pub persistent: Option<bool>,
    /// Routing key for broadcast channels
    pub routing_key: Option<String>,
    pub kind: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
}

impl PublishOptions {
    /// Overrides the persistence configured for the channel.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Routing key used on broadcast channels.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Message type carried in the properties.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Adds a header to the message.
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }
}

/// Publishes to named logical channels over a dedicated confirm-mode channel.
pub struct Producer {
    manager: Weak<ConnectionManager>,
    channel: Mutex<Option<(u64, Arc<dyn BrokerChannel>)>>,
}

impl Producer {
    /// Creates a producer bound to `manager`.
    pub fn new(manager: &Arc<ConnectionManager>) -> Producer {
        Producer {
            manager: Arc::downgrade(manager),
            channel: Mutex::new(None),
        }
    }

    /// Publishes `payload` to `channel` within the current trace context.
    pub async fn publish(
        &self,
        channel: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        self.publish_with_context(&Context::current(), channel, payload, options)
            .await
    }

    /// Serializes `value` as JSON and publishes it.
    pub async fn publish_json<T: Serialize>(
        &self,
        channel: &str,
        value: &T,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::PublishingError
        })?;

        let mut options = options.clone();
        options
            .content_type
            .get_or_insert_with(|| JSON_CONTENT_TYPE.to_owned());

        self.publish(channel, &payload, &options).await
    }

    /// Publishes a message, propagating the trace context of `ctx` in its headers.
    ///
    /// Fails with `UnknownChannel` for channels outside the topology, `Closed`
    /// after shutdown, `ConnectionLost` when the connection is not usable (after
    /// waiting, under the `wait` policy) and `PublishRejected` when the broker
    /// nacks the message.
    pub async fn publish_with_context(
        &self,
        ctx: &Context,
        channel: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let manager = self.manager.upgrade().ok_or(AmqpError::Closed)?;

        let def = manager
            .topology()
            .channel(channel)
            .ok_or_else(|| AmqpError::UnknownChannel(channel.to_owned()))?;

        let (exchange, routing_key) = match def.pattern {
            Pattern::PointToPoint => ("", channel.to_owned()),
            Pattern::Broadcast => (channel, options.routing_key.clone().unwrap_or_default()),
        };

        Self::ensure_connected(&manager).await?;

        let mut props = MessageProperties {
            message_id: Some(Uuid::new_v4().to_string()),
            content_type: options.content_type.clone(),
            kind: options.kind.clone(),
            persistent: options
                .persistent
                .unwrap_or_else(|| manager.configs().persistent_for(channel)),
            headers: options.headers.clone(),
        };
        otel::inject_context(ctx, &mut props);

        let timeout = manager.configs().publish_timeout();
        let publish = self.publish_confirmed(&manager, exchange, &routing_key, payload, &props);

        let result = tokio::select! {
            _ = manager.closing() => Err(AmqpError::Closed),
            result = tokio::time::timeout(timeout, publish) => {
                result.unwrap_or_else(|_| {
                    warn!(channel, "publisher confirm timed out");
                    Err(AmqpError::ConnectionLost)
                })
            }
        };

        if result.is_ok() {
            debug!(
                channel,
                message_id = props.message_id.as_deref().unwrap_or_default(),
                "message published"
            );
        }

        result
    }

    async fn ensure_connected(manager: &ConnectionManager) -> Result<(), AmqpError> {
        match manager.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(AmqpError::Closed),
            state => match manager.configs().publish_policy {
                PublishPolicy::FailFast => {
                    debug!(%state, "connection unavailable, failing fast");
                    Err(AmqpError::ConnectionLost)
                }
                PublishPolicy::Wait { timeout_ms } => tokio::select! {
                    _ = manager.closing() => Err(AmqpError::Closed),
                    result = manager.wait_connected(Duration::from_millis(timeout_ms)) => result,
                },
            },
        }
    }

    async fn publish_confirmed(
        &self,
        manager: &ConnectionManager,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        props: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut cached = self.channel.lock().await;

        let generation = manager.generation();
        let channel = match cached.as_ref() {
            Some((cached_generation, channel)) if *cached_generation == generation => {
                channel.clone()
            }
            _ => {
                let channel = manager.open_channel().await?;
                channel
                    .confirm_select()
                    .await
                    .map_err(|_| AmqpError::ConnectionLost)?;
                *cached = Some((generation, channel.clone()));
                channel
            }
        };

        match channel
            .basic_publish(exchange, routing_key, payload, props)
            .await
        {
            Ok(Confirmation::Ack) => Ok(()),
            Ok(Confirmation::Nack(reason)) => {
                warn!(exchange, routing_key, reason, "broker rejected message");
                Err(AmqpError::PublishRejected(reason))
            }
            Ok(Confirmation::NotRequested) => {
                error!("publisher confirm was not requested on the channel");
                cached.take();
                Err(AmqpError::PublishingError)
            }
            Err(err) => {
                warn!(error = err.to_string(), "publish failed");
                cached.take();
                Err(AmqpError::ConnectionLost)
            }
        }
    }
}
