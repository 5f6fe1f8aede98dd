// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Topology
//!
//! This module describes the logical channels of an application and turns them into
//! broker declarations.
//!
//! - `Topology`: channel name to pattern, durability and broadcast subscribers
//! - `TopologyDeclarator`: issues exchanges, queues and bindings in a deterministic order
//!
//! A point-to-point channel is a queue named after the channel, fed by the default
//! exchange. A broadcast channel is a fanout exchange named after the channel with one
//! queue per subscriber (`<channel>.<subscriber>`) bound to it.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::BrokerChannel,
};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

/// Messaging pattern of a logical channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pattern {
    /// Work queue: each message goes to one of the competing consumers
    PointToPoint,
    /// Fanout: each message goes to every subscriber queue
    Broadcast,
}

/// Declarative description of one logical channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelDefinition {
    pub pattern: Pattern,
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub subscribers: BTreeSet<String>,
    /// Declare a `<queue>-dlq` companion receiving rejected messages
    #[serde(default)]
    pub dead_letter: bool,
}

/// Name of the queue owned by a broadcast subscriber.
pub fn subscriber_queue_name(channel: &str, subscriber: &str) -> String {
    format!("{channel}.{subscriber}")
}

/// Set of logical channels supplied by the embedding application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Topology {
    channels: BTreeMap<String, ChannelDefinition>,
}

impl Topology {
    /// Creates an empty topology.
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds (or replaces) a point-to-point channel.
    pub fn point_to_point(mut self, name: &str, durable: bool) -> Self {
        self.channels.insert(
            name.to_owned(),
            ChannelDefinition {
                pattern: Pattern::PointToPoint,
                durable,
                subscribers: BTreeSet::new(),
                dead_letter: false,
            },
        );
        self
    }

    /// Adds (or replaces) a broadcast channel with its subscribers.
    pub fn broadcast(mut self, name: &str, durable: bool, subscribers: &[&str]) -> Self {
        self.channels.insert(
            name.to_owned(),
            ChannelDefinition {
                pattern: Pattern::Broadcast,
                durable,
                subscribers: subscribers.iter().map(|s| (*s).to_owned()).collect(),
                dead_letter: false,
            },
        );
        self
    }

    /// Enables the dead-letter companion queues of an already added channel.
    pub fn dead_letter(mut self, name: &str) -> Self {
        if let Some(def) = self.channels.get_mut(name) {
            def.dead_letter = true;
        }
        self
    }

    /// Definition of the channel called `name`.
    pub fn channel(&self, name: &str) -> Option<&ChannelDefinition> {
        self.channels.get(name)
    }

    /// Channels in lexicographic order.
    pub fn channels(&self) -> impl Iterator<Item = (&String, &ChannelDefinition)> {
        self.channels.iter()
    }

    /// Whether no channel was defined.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Queue a consumer reads for `channel`. Broadcast channels need a subscriber
    /// registered in the topology.
    pub fn queue_for(&self, channel: &str, subscriber: Option<&str>) -> Result<String, AmqpError> {
        let def = self
            .channel(channel)
            .ok_or_else(|| AmqpError::UnknownChannel(channel.to_owned()))?;

        match def.pattern {
            Pattern::PointToPoint => Ok(channel.to_owned()),
            Pattern::Broadcast => match subscriber {
                Some(sub) if def.subscribers.contains(sub) => {
                    Ok(subscriber_queue_name(channel, sub))
                }
                _ => Err(AmqpError::UnknownChannel(channel.to_owned())),
            },
        }
    }
}

/// A single broker-side entity to declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

impl Declaration {
    /// Human readable name of the entity, used when a declaration fails.
    pub fn entity(&self) -> String {
        match self {
            Declaration::Exchange(def) => format!("exchange {}", def.name),
            Declaration::Queue(def) => format!("queue {}", def.name),
            Declaration::Binding(b) => format!("binding {}->{}", b.exchange_name, b.queue_name),
        }
    }
}

/// Issues the broker declarations required by a [`Topology`].
///
/// Declaring is idempotent and runs after every successful (re)connection, because
/// nothing declared on a previous connection is assumed to still exist.
#[derive(Debug, Clone)]
pub struct TopologyDeclarator {
    topology: Topology,
}

impl TopologyDeclarator {
    /// Creates a declarator for `topology`.
    pub fn new(topology: Topology) -> TopologyDeclarator {
        for (name, def) in topology.channels() {
            if def.pattern == Pattern::Broadcast && def.subscribers.is_empty() {
                warn!(channel = name.as_str(), "broadcast channel without subscribers");
            }
        }

        TopologyDeclarator { topology }
    }

    /// Topology issued by the declarator.
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Declarations in the order they are issued: channels lexicographically; within
    /// a broadcast channel the exchange first, then each subscriber as dlq, queue and
    /// binding.
    pub fn plan(&self) -> Vec<Declaration> {
        let mut plan = vec![];

        for (name, def) in self.topology.channels() {
            match def.pattern {
                Pattern::PointToPoint => {
                    Self::plan_queue(&mut plan, name, def);
                }
                Pattern::Broadcast => {
                    let mut exchange = ExchangeDefinition::new(name).fanout();
                    if def.durable {
                        exchange = exchange.durable();
                    }
                    plan.push(Declaration::Exchange(exchange));

                    for sub in &def.subscribers {
                        let queue = subscriber_queue_name(name, sub);
                        Self::plan_queue(&mut plan, &queue, def);
                        plan.push(Declaration::Binding(
                            QueueBinding::new(&queue).exchange(name),
                        ));
                    }
                }
            }
        }

        plan
    }

    fn plan_queue(plan: &mut Vec<Declaration>, queue: &str, def: &ChannelDefinition) {
        let mut queue_def = QueueDefinition::new(queue);
        if def.durable {
            queue_def = queue_def.durable();
        }

        if def.dead_letter {
            queue_def = queue_def.with_dlq();
            if let Some(dlq) = queue_def.dlq_name() {
                plan.push(Declaration::Queue(QueueDefinition::new(dlq).durable()));
            }
        }

        plan.push(Declaration::Queue(queue_def));
    }

    /// Issues the whole plan on `channel`.
    ///
    /// The first failing entity aborts the batch; the error names it and the caller
    /// retries the full batch.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let plan = self.plan();
        debug!(entities = plan.len(), "declaring topology");

        for declaration in &plan {
            let result = match declaration {
                Declaration::Exchange(def) => channel.exchange_declare(def).await,
                Declaration::Queue(def) => channel.queue_declare(def).await,
                Declaration::Binding(binding) => channel.queue_bind(binding).await,
            };

            if let Err(err) = result {
                error!(
                    entity = declaration.entity(),
                    error = err.to_string(),
                    "topology declaration failed"
                );
                return Err(err);
            }
        }

        debug!("topology declared");
        Ok(())
    }
}
