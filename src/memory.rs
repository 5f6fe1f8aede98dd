// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! `InMemoryBroker` implements the broker seam without a network. It follows the AMQP
//! behaviors the core depends on:
//!
//! - default exchange routing by queue name, fanout and direct exchanges
//! - idempotent declarations, conflicting redeclarations rejected
//! - per-channel prefetch with round-robin dispatch across consumers
//! - ack, nack with or without requeue, dead-lettering through queue arguments
//! - durable entities and persistent messages surviving [`InMemoryBroker::restart`]
//!
//! Faults are injected with [`InMemoryBroker::drop_connections`] and
//! [`InMemoryBroker::set_available`]. Several brokers can live in one process.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream,
        MessageProperties, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::{mpsc, watch};
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    conn_id: u64,
    channel_id: u64,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

struct QueueState {
    def: QueueDefinition,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Default)]
struct ChannelState {
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

impl ChannelState {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

struct ConnState {
    dropped: watch::Sender<Option<String>>,
    channels: HashMap<u64, ChannelState>,
}

struct BrokerState {
    available: bool,
    reject_publishes: bool,
    exchanges: BTreeMap<String, ExchangeDefinition>,
    queues: BTreeMap<String, QueueState>,
    bindings: BTreeSet<QueueBinding>,
    connections: HashMap<u64, ConnState>,
    next_id: u64,
    connects: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState {
            available: true,
            reject_publishes: false,
            exchanges: BTreeMap::new(),
            queues: BTreeMap::new(),
            bindings: BTreeSet::new(),
            connections: HashMap::new(),
            next_id: 1,
            connects: 0,
        }
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn channel_mut(&mut self, conn_id: u64, channel_id: u64) -> Result<&mut ChannelState, AmqpError> {
        self.connections
            .get_mut(&conn_id)
            .and_then(|conn| conn.channels.get_mut(&channel_id))
            .ok_or(AmqpError::ConnectionLost)
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_owned())
                    .into_iter()
                    .collect(),
            );
        }

        let def = self.exchanges.get(exchange)?;
        Some(
            self.bindings
                .iter()
                .filter(|b| b.exchange_name == exchange)
                .filter(|b| def.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                .map(|b| b.queue_name.clone())
                .collect(),
        )
    }

    fn enqueue(&mut self, queue: &str, msg: StoredMessage) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.messages.push_back(msg);
        }
    }

    /// Hands ready messages to consumers with free prefetch capacity, round-robin.
    fn dispatch(&mut self) {
        let BrokerState {
            queues, connections, ..
        } = self;

        for (queue_name, queue) in queues.iter_mut() {
            loop {
                if queue.messages.is_empty() {
                    break;
                }
                queue.consumers.retain(|slot| !slot.sender.is_closed());
                let total = queue.consumers.len();
                if total == 0 {
                    break;
                }

                let picked = (0..total)
                    .map(|offset| (queue.cursor + offset) % total)
                    .find(|idx| {
                        let slot = &queue.consumers[*idx];
                        connections
                            .get(&slot.conn_id)
                            .and_then(|conn| conn.channels.get(&slot.channel_id))
                            .is_some_and(ChannelState::has_capacity)
                    });

                let Some(idx) = picked else {
                    break;
                };
                let Some(msg) = queue.messages.pop_front() else {
                    break;
                };

                let slot = &queue.consumers[idx];
                let Some(channel) = connections
                    .get_mut(&slot.conn_id)
                    .and_then(|conn| conn.channels.get_mut(&slot.channel_id))
                else {
                    queue.messages.push_front(msg);
                    break;
                };

                channel.next_tag += 1;
                let tag = channel.next_tag;
                let delivery = Delivery {
                    delivery_tag: tag,
                    exchange: msg.exchange.clone(),
                    routing_key: msg.routing_key.clone(),
                    redelivered: msg.redelivered,
                    data: msg.data.clone(),
                    properties: msg.properties.clone(),
                };

                if slot.sender.send(Ok(delivery)).is_err() {
                    queue.messages.push_front(msg);
                    queue.consumers.remove(idx);
                    continue;
                }

                channel.unacked.insert(tag, (queue_name.clone(), msg));
                queue.cursor = idx + 1;
            }
        }
    }

    /// Returns unacknowledged messages of a channel to the head of their queues.
    fn requeue_channel(&mut self, channel: ChannelState) {
        for (_, (queue, mut msg)) in channel.unacked.into_iter().rev() {
            msg.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_front(msg);
            }
        }
    }

    fn remove_channel(&mut self, conn_id: u64, channel_id: u64) {
        let channel = self
            .connections
            .get_mut(&conn_id)
            .and_then(|conn| conn.channels.remove(&channel_id));

        for queue in self.queues.values_mut() {
            queue
                .consumers
                .retain(|slot| !(slot.conn_id == conn_id && slot.channel_id == channel_id));
        }

        if let Some(channel) = channel {
            self.requeue_channel(channel);
        }
    }

    fn remove_connection(&mut self, conn_id: u64, reason: Option<&str>) {
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|slot| slot.conn_id != conn_id);
        }

        for (_, channel) in conn.channels {
            self.requeue_channel(channel);
        }

        if let Some(reason) = reason {
            let _ = conn.dropped.send(Some(reason.to_owned()));
        }
    }
}

/// In-process broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker accepting connections.
    pub fn new() -> InMemoryBroker {
        InMemoryBroker::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Refuses (or accepts again) new connections.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Nacks every publish while set, as a broker under resource alarm does.
    pub fn set_reject_publishes(&self, reject: bool) {
        self.state().reject_publishes = reject;
    }

    /// Kills every open connection as a network failure would. Unacknowledged
    /// messages go back to their queues flagged as redelivered.
    pub fn drop_connections(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.remove_connection(id, Some("connection reset by broker"));
        }
        state.dispatch();
        debug!("in-memory broker dropped all connections");
    }

    /// Simulates a broker restart: connections are dropped, transient entities and
    /// transient messages are lost.
    pub fn restart(&self) {
        let mut state = self.state();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            state.remove_connection(id, Some("broker restarted"));
        }

        state.exchanges.retain(|_, def| def.durable);
        state.queues.retain(|_, q| q.def.durable);
        for queue in state.queues.values_mut() {
            queue.messages.retain(|m| m.properties.persistent);
            queue.messages.iter_mut().for_each(|m| m.redelivered = true);
        }

        let BrokerState {
            bindings,
            exchanges,
            queues,
            ..
        } = &mut *state;
        bindings.retain(|b| exchanges.contains_key(&b.exchange_name) && queues.contains_key(&b.queue_name));
    }

    /// Declared queues, sorted by name.
    pub fn queue_names(&self) -> Vec<String> {
        self.state().queues.keys().cloned().collect()
    }

    /// Declared exchanges, sorted by name.
    pub fn exchange_names(&self) -> Vec<String> {
        self.state().exchanges.keys().cloned().collect()
    }

    /// Queues bound to `exchange`.
    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        self.state()
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .map(|b| b.queue_name.clone())
            .collect()
    }

    /// Payloads ready for delivery in `queue`, in order.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages ready for delivery in `queue`.
    pub fn message_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    /// Deliveries of `queue` handed out and not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .connections
            .values()
            .flat_map(|conn| conn.channels.values())
            .flat_map(|channel| channel.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    /// Live consumers attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or_default()
    }

    /// Connections currently open.
    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Successful connections since the broker was created.
    pub fn connects(&self) -> usize {
        self.state().connects
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.state();
        if !state.available {
            return Err(AmqpError::ConnectionError);
        }

        let id = state.next_id();
        let (dropped_tx, dropped_rx) = watch::channel(None);
        state.connections.insert(
            id,
            ConnState {
                dropped: dropped_tx,
                channels: HashMap::new(),
            },
        );
        state.connects += 1;

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            dropped: dropped_rx,
        }))
    }
}

struct MemoryConnection {
    broker: InMemoryBroker,
    id: u64,
    dropped: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.state();
        let channel_id = state.next_id();
        let conn = state
            .connections
            .get_mut(&self.id)
            .ok_or(AmqpError::ChannelError)?;
        conn.channels.insert(channel_id, ChannelState::default());

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            conn_id: self.id,
            channel_id,
            confirm: AtomicBool::new(false),
        }))
    }

    async fn closed(&self) -> String {
        let mut rx = self.dropped.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }

            if rx.changed().await.is_err() {
                return futures_util::future::pending().await;
            }
        }
    }

    fn is_open(&self) -> bool {
        self.broker.state().connections.contains_key(&self.id)
    }

    async fn close(&self) {
        let mut state = self.broker.state();
        state.remove_connection(self.id, None);
        state.dispatch();
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    conn_id: u64,
    channel_id: u64,
    confirm: AtomicBool,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.conn_id, self.channel_id)?;
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => {
                Err(AmqpError::DeclarationConflict(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        match state.queues.get(&def.name) {
            Some(existing) if existing.def != *def => {
                Err(AmqpError::DeclarationConflict(def.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    QueueState {
                        def: def.clone(),
                        messages: VecDeque::new(),
                        consumers: vec![],
                        cursor: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        state.channel_mut(self.conn_id, self.channel_id)?.prefetch = prefetch_count;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        let _state = self.open_state()?;
        self.confirm.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<Confirmation, AmqpError> {
        let mut state = self.open_state()?;
        let confirm = self.confirm.load(Ordering::SeqCst);

        if state.reject_publishes {
            return Ok(if confirm {
                Confirmation::Nack("resource alarm".to_owned())
            } else {
                Confirmation::NotRequested
            });
        }

        let Some(targets) = state.route(exchange, routing_key) else {
            return Ok(Confirmation::Nack(format!("no exchange `{exchange}`")));
        };

        for queue in targets {
            state.enqueue(
                &queue,
                StoredMessage {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    data: payload.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                },
            );
        }
        state.dispatch();

        Ok(if confirm {
            Confirmation::Ack
        } else {
            Confirmation::NotRequested
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;
        q.consumers.push(ConsumerSlot {
            conn_id: self.conn_id,
            channel_id: self.channel_id,
            sender: tx,
        });
        state.dispatch();

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        let channel = state
            .channel_mut(self.conn_id, self.channel_id)
            .map_err(|_| AmqpError::AckMessageError)?;
        channel
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::AckMessageError)?;
        state.dispatch();
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.state();
        let channel = state
            .channel_mut(self.conn_id, self.channel_id)
            .map_err(|_| AmqpError::NackMessageError)?;
        let (queue, mut msg) = channel
            .unacked
            .remove(&delivery_tag)
            .ok_or(AmqpError::NackMessageError)?;

        if requeue {
            msg.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push_front(msg);
            }
        } else {
            let dlq = state
                .queues
                .get(&queue)
                .and_then(|q| q.def.dlq_name.clone());
            match dlq {
                Some(dlq) => {
                    msg.redelivered = false;
                    state.enqueue(&dlq, msg);
                }
                None => debug!(queue, "message discarded without dead-letter queue"),
            }
        }

        state.dispatch();
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.broker.state();
        state.remove_channel(self.conn_id, self.channel_id);
        state.dispatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &InMemoryBroker) -> (Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>) {
        let conn = broker.connect().await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        (conn, channel)
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .queue_declare(&QueueDefinition::new("orders").durable())
            .await
            .unwrap();
        channel.confirm_select().await.unwrap();

        let confirm = channel
            .basic_publish("", "orders", b"one", &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(confirm, Confirmation::Ack);
        assert_eq!(broker.messages("orders"), vec![b"one".to_vec()]);

        channel
            .basic_publish("", "unknown", b"lost", &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.message_count("orders"), 1);
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .queue_declare(&QueueDefinition::new("jobs"))
            .await
            .unwrap();
        for i in 0..5u8 {
            channel
                .basic_publish("", "jobs", &[i], &MessageProperties::default())
                .await
                .unwrap();
        }

        channel.basic_qos(2).await.unwrap();
        let mut stream = channel.basic_consume("jobs", "c1").await.unwrap();
        assert_eq!(broker.unacked_count("jobs"), 2);
        assert_eq!(broker.message_count("jobs"), 3);

        let first = stream.next().await.unwrap().unwrap();
        channel.basic_ack(first.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count("jobs"), 2);
        assert_eq!(broker.message_count("jobs"), 2);
    }

    #[tokio::test]
    async fn test_dropped_connection_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let (conn, channel) = open(&broker).await;
        channel
            .queue_declare(&QueueDefinition::new("jobs").durable())
            .await
            .unwrap();
        channel
            .basic_publish("", "jobs", b"job", &MessageProperties::default())
            .await
            .unwrap();
        let mut stream = channel.basic_consume("jobs", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);

        broker.drop_connections();
        assert_eq!(conn.closed().await, "connection reset by broker");
        assert!(!conn.is_open());
        assert!(stream.next().await.is_none());
        assert_eq!(broker.message_count("jobs"), 1);

        let (_conn, channel) = open(&broker).await;
        let mut stream = channel.basic_consume("jobs", "c2").await.unwrap();
        assert!(stream.next().await.unwrap().unwrap().redelivered);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .queue_declare(&QueueDefinition::new("jobs-dlq").durable())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("jobs").durable().with_dlq())
            .await
            .unwrap();
        channel
            .basic_publish("", "jobs", b"poison", &MessageProperties::default())
            .await
            .unwrap();

        let mut stream = channel.basic_consume("jobs", "c1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        channel.basic_nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.message_count("jobs"), 0);
        assert_eq!(broker.messages("jobs-dlq"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn test_restart_keeps_only_durable_and_persistent() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .queue_declare(&QueueDefinition::new("durable").durable())
            .await
            .unwrap();
        channel
            .queue_declare(&QueueDefinition::new("transient"))
            .await
            .unwrap();
        let persistent = MessageProperties {
            persistent: true,
            ..MessageProperties::default()
        };
        channel
            .basic_publish("", "durable", b"kept", &persistent)
            .await
            .unwrap();
        channel
            .basic_publish("", "durable", b"lost", &MessageProperties::default())
            .await
            .unwrap();

        broker.restart();
        assert_eq!(broker.queue_names(), vec!["durable"]);
        assert_eq!(broker.messages("durable"), vec![b"kept".to_vec()]);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        assert_eq!(broker.connect().await.err(), Some(AmqpError::ConnectionError));
        broker.set_available(true);
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connects(), 1);
    }

    #[tokio::test]
    async fn test_confirm_mode_needs_an_open_channel() {
        let broker = InMemoryBroker::new();
        let (_conn, channel) = open(&broker).await;
        channel
            .queue_declare(&QueueDefinition::new("orders"))
            .await
            .unwrap();

        let unconfirmed = channel
            .basic_publish("", "orders", b"one", &MessageProperties::default())
            .await
            .unwrap();
        assert_eq!(unconfirmed, Confirmation::NotRequested);

        channel.confirm_select().await.unwrap();
        broker.drop_connections();
        assert_eq!(
            channel.confirm_select().await,
            Err(AmqpError::ConnectionLost)
        );
    }
}
