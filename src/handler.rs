// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Handlers are registered per logical channel. Every accepted message runs through
//! all handlers of its channel, in registration order, before it is acknowledged.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, sync::Arc};

/// A message as seen by the handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerMessage {
    /// Logical channel the message was published to
    pub channel: String,
    /// Queue the message was read from
    pub queue: String,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub data: Vec<u8>,
    pub persistent: bool,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Redeliveries already consumed after handler failures
    pub redelivery_count: u32,
}

impl ConsumerMessage {
    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Maps a channel name to its ordered handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn ConsumerHandler>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Appends `handler` to the handlers of `channel`.
    pub fn register(&mut self, channel: &str, handler: Arc<dyn ConsumerHandler>) {
        self.handlers
            .entry(channel.to_owned())
            .or_default()
            .push(handler);
    }

    /// Marks `channel` as subscribed without adding handlers.
    pub fn subscribe(&mut self, channel: &str) {
        self.handlers.entry(channel.to_owned()).or_default();
    }

    /// Handlers of `channel` in registration order; empty when none were registered.
    pub fn handlers_for(&self, channel: &str) -> Vec<Arc<dyn ConsumerHandler>> {
        self.handlers.get(channel).cloned().unwrap_or_default()
    }

    /// Subscribed channels, sorted by name.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.handlers.keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Whether no channel was subscribed.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Named {
        name: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ConsumerHandler for Named {
        async fn exec(&self, _ctx: &Context, _msg: &ConsumerMessage) -> Result<(), HandlerError> {
            self.calls.lock().unwrap().push(self.name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handlers_keep_registration_order() {
        let calls = Arc::new(Mutex::new(vec![]));
        let mut registry = HandlerRegistry::new();
        for name in ["first", "second", "third"] {
            registry.register(
                "orders",
                Arc::new(Named {
                    name,
                    calls: calls.clone(),
                }),
            );
        }

        let handlers = registry.handlers_for("orders");
        assert_eq!(handlers.len(), 3);
        for handler in handlers {
            handler
                .exec(&Context::new(), &ConsumerMessage::default())
                .await
                .unwrap();
        }
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_unknown_channel_has_no_handlers() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.handlers_for("orders").is_empty());

        registry.subscribe("audit");
        registry.register("billing", Arc::new(MockConsumerHandler::new()));
        assert!(registry.handlers_for("audit").is_empty());
        assert_eq!(registry.channels(), vec!["audit", "billing"]);
    }

    #[test]
    fn test_message_json_payload() {
        let msg = ConsumerMessage {
            data: br#"{"orderId":1}"#.to_vec(),
            ..ConsumerMessage::default()
        };
        let value: serde_json::Value = msg.json().unwrap();
        assert_eq!(value["orderId"], 1);
    }
}
