// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! `Consumer` subscribes logical channels to their handlers and keeps consuming for
//! as long as it runs. Every time the connection reaches `connected` it opens one
//! broker channel per subscribed queue, applies the prefetch window and starts a
//! delivery worker per queue. When the connection drops, the session is torn down
//! and rebuilt on the next `connected` transition.
//!
//! Point-to-point channels are read from the shared queue, so competing consumers
//! split the work. Broadcast channels are read from the consumer's own subscriber
//! queue, so every subscriber sees every message.

use crate::{
    configs::HandlerConcurrency,
    connection::{ConnectionManager, ConnectionState},
    consumer::{consume, Subscription},
    errors::AmqpError,
    handler::{ConsumerHandler, HandlerRegistry},
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use opentelemetry::global::{self, BoxedTracer};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A subscribed channel resolved against the topology.
#[derive(Clone)]
struct Route {
    channel: String,
    queue: String,
    handlers: Vec<Arc<dyn ConsumerHandler>>,
}

/// Consumer settings taken from the manager configuration at start.
#[derive(Clone, Copy)]
struct Settings {
    prefetch_count: u16,
    max_redeliveries: u32,
    concurrency: HandlerConcurrency,
    retry_delay: Duration,
}

enum SessionEnd {
    Stopped,
    Interrupted,
}

pub struct Consumer {
    manager: Weak<ConnectionManager>,
    subscriber: Option<String>,
    registry: HandlerRegistry,
    queues: BTreeMap<String, String>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Consumer {
    /// Consumer without a subscriber name. It can only subscribe point-to-point
    /// channels.
    pub fn new(manager: &Arc<ConnectionManager>) -> Consumer {
        let (shutdown_tx, _) = watch::channel(false);
        Consumer {
            manager: Arc::downgrade(manager),
            subscriber: None,
            registry: HandlerRegistry::new(),
            queues: BTreeMap::new(),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Consumer reading broadcast channels through the queue of `subscriber`.
    pub fn with_subscriber(manager: &Arc<ConnectionManager>, subscriber: &str) -> Consumer {
        let mut consumer = Consumer::new(manager);
        consumer.subscriber = Some(subscriber.to_owned());
        consumer
    }

    /// Subscriber name used for broadcast channels.
    pub fn subscriber(&self) -> Option<&str> {
        self.subscriber.as_deref()
    }

    /// Subscribes every channel of `subscriptions` to its handlers, appended after
    /// the handlers already registered.
    ///
    /// Nothing is registered when one of the channels is unknown to the topology.
    /// Changes apply from the next `start`.
    pub fn subscribe(
        &mut self,
        subscriptions: HashMap<String, Vec<Arc<dyn ConsumerHandler>>>,
    ) -> Result<(), AmqpError> {
        let mut resolved = Vec::with_capacity(subscriptions.len());
        for (channel, handlers) in subscriptions {
            let queue = self.resolve(&channel)?;
            resolved.push((channel, queue, handlers));
        }

        for (channel, queue, handlers) in resolved {
            if handlers.is_empty() && self.registry.handlers_for(&channel).is_empty() {
                warn!(
                    channel,
                    "channel subscribed without handlers, its messages will be drained"
                );
            }

            self.registry.subscribe(&channel);
            for handler in handlers {
                self.registry.register(&channel, handler);
            }
            info!(channel, queue, "channel subscribed");
            self.queues.insert(channel, queue);
        }

        Ok(())
    }

    /// Appends `handler` to the handlers of `channel`.
    pub fn register(
        &mut self,
        channel: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let queue = self.resolve(channel)?;
        self.registry.register(channel, handler);
        self.queues.insert(channel.to_owned(), queue);
        Ok(())
    }

    /// Channels subscribed so far with their handlers.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Starts consuming in the background. Calling it while running is a no-op.
    ///
    /// Fails with `Closed` when the connection manager was shut down.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let manager = self.manager.upgrade().ok_or(AmqpError::Closed)?;
        if manager.state() == ConnectionState::Closed {
            return Err(AmqpError::Closed);
        }

        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        if self.registry.is_empty() {
            warn!("no channel subscribed, nothing to consume");
            return Ok(());
        }

        let routes: Vec<Route> = self
            .queues
            .iter()
            .map(|(channel, queue)| Route {
                channel: channel.clone(),
                queue: queue.clone(),
                handlers: self.registry.handlers_for(channel),
            })
            .collect();

        let configs = manager.configs();
        let settings = Settings {
            prefetch_count: configs.prefetch_count,
            max_redeliveries: configs.max_redeliveries,
            concurrency: configs.handler_concurrency,
            retry_delay: configs.reconnect.delay_for(1),
        };

        self.shutdown_tx.send_replace(false);
        let shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(run(
            self.manager.clone(),
            routes,
            settings,
            shutdown,
        )));

        debug!(subscriber = self.subscriber.as_deref(), "consumer started");
        Ok(())
    }

    /// Stops consuming and closes the consumer channels. Unacknowledged deliveries
    /// go back to the broker.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "consumer task failed");
            }
            debug!("consumer stopped");
        }
    }

    /// Whether the background consumer task is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .try_lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(true)
    }

    fn resolve(&self, channel: &str) -> Result<String, AmqpError> {
        let manager = self.manager.upgrade().ok_or(AmqpError::Closed)?;
        manager
            .topology()
            .queue_for(channel, self.subscriber.as_deref())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

/// Consumer loop: one session per connection, until stopped or the manager closes.
async fn run(
    manager: Weak<ConnectionManager>,
    routes: Vec<Route>,
    settings: Settings,
    mut shutdown: watch::Receiver<bool>,
) {
    let tracer = Arc::new(global::tracer("amqp consumer"));

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let Some(mut state) = manager.upgrade().map(|m| m.watch()) else {
            break;
        };

        let reached = tokio::select! {
            _ = shutdown.changed() => break,
            reached = state.wait_for(|s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Closed)
            }) => reached.map(|s| *s),
        };
        if !matches!(reached, Ok(ConnectionState::Connected)) {
            debug!("connection closed, consumer exiting");
            break;
        }

        let session = match open_session(&manager, &routes, settings).await {
            Some(session) => session,
            None => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(settings.retry_delay) => {}
                }
                continue;
            }
        };

        let mut workers = JoinSet::new();
        let subs: Vec<Arc<Subscription>> = session.iter().map(|(sub, _)| sub.clone()).collect();
        for (sub, stream) in session {
            workers.spawn(deliver(tracer.clone(), sub, stream, settings.concurrency));
        }

        let end = tokio::select! {
            _ = shutdown.changed() => SessionEnd::Stopped,
            _ = state.wait_for(|s| *s != ConnectionState::Connected) => SessionEnd::Interrupted,
            _ = workers.join_next() => SessionEnd::Interrupted,
        };

        workers.shutdown().await;
        for sub in &subs {
            sub.channel.close().await;
        }

        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Interrupted => {
                warn!("consumer session interrupted, resubscribing once connected")
            }
        }
    }
}

/// Opens a channel per route with the prefetch window applied and starts
/// consuming its queue. Channels opened before a failure are closed again.
async fn open_session(
    manager: &Weak<ConnectionManager>,
    routes: &[Route],
    settings: Settings,
) -> Option<Vec<(Arc<Subscription>, DeliveryStream)>> {
    let manager = manager.upgrade()?;
    let mut session = Vec::with_capacity(routes.len());

    for route in routes {
        match subscribe_route(&manager, route, settings).await {
            Ok(opened) => session.push(opened),
            Err(err) => {
                warn!(
                    channel = route.channel,
                    queue = route.queue,
                    error = err.to_string(),
                    "failure to subscribe, retrying"
                );
                for (sub, _) in session {
                    sub.channel.close().await;
                }
                return None;
            }
        }
    }

    info!(
        generation = manager.generation(),
        queues = session.len(),
        "consumer subscribed"
    );
    Some(session)
}

async fn subscribe_route(
    manager: &ConnectionManager,
    route: &Route,
    settings: Settings,
) -> Result<(Arc<Subscription>, DeliveryStream), AmqpError> {
    let channel = manager.open_channel().await?;

    let consumed = async {
        channel.basic_qos(settings.prefetch_count).await?;
        // redeliveries are republished on this channel and must be confirmed
        channel.confirm_select().await?;
        let tag = format!("{}-{}", route.queue, Uuid::new_v4());
        channel.basic_consume(&route.queue, &tag).await
    }
    .await;

    let stream = match consumed {
        Ok(stream) => stream,
        Err(err) => {
            channel.close().await;
            return Err(err);
        }
    };

    debug!(channel = route.channel, queue = route.queue, "consuming queue");

    let sub = Subscription {
        channel_name: route.channel.clone(),
        queue: route.queue.clone(),
        handlers: route.handlers.clone(),
        max_redeliveries: settings.max_redeliveries,
        channel,
    };
    Ok((Arc::new(sub), stream))
}

/// Feeds the deliveries of one queue to its handlers until the stream ends.
async fn deliver(
    tracer: Arc<BoxedTracer>,
    sub: Arc<Subscription>,
    mut stream: DeliveryStream,
    concurrency: HandlerConcurrency,
) {
    let mut inflight = JoinSet::new();

    while let Some(result) = stream.next().await {
        let delivery = match result {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                continue;
            }
        };

        match concurrency {
            HandlerConcurrency::Sequential => {
                if let Err(err) = consume(&tracer, &delivery, &sub).await {
                    error!(error = err.to_string(), "error consume msg");
                }
            }
            HandlerConcurrency::Concurrent => {
                let tracer = tracer.clone();
                let sub = sub.clone();
                inflight.spawn(async move {
                    if let Err(err) = consume(&tracer, &delivery, &sub).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                });
                while inflight.try_join_next().is_some() {}
            }
        }
    }

    debug!(queue = sub.queue, "delivery stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::{AmqpConfigs, ReconnectConfigs},
        errors::HandlerError,
        handler::{ConsumerMessage, MockConsumerHandler},
        memory::InMemoryBroker,
        publisher::{Producer, PublishOptions},
        topology::Topology,
    };
    use async_trait::async_trait;
    use opentelemetry::Context;
    use tokio::sync::Barrier;

    fn configs() -> AmqpConfigs {
        AmqpConfigs {
            reconnect: ReconnectConfigs {
                initial_delay_ms: 10,
                max_delay_ms: 40,
                multiplier: 2.0,
            },
            ..AmqpConfigs::default()
        }
    }

    async fn connected(
        broker: &InMemoryBroker,
        configs: AmqpConfigs,
        topology: Topology,
    ) -> Arc<ConnectionManager> {
        let manager = ConnectionManager::new(configs, topology, Arc::new(broker.clone())).unwrap();
        manager.connect().await.unwrap();
        manager
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    struct Recorder {
        name: &'static str,
        seen: Arc<std::sync::Mutex<Vec<(&'static str, Vec<u8>)>>>,
    }

    #[async_trait]
    impl ConsumerHandler for Recorder {
        async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push((self.name, msg.data.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_consumer_loop_can_be_spawned() {
        fn assert_send<T: Send>(_: &T) {}

        let (_tx, shutdown) = watch::channel(false);
        let settings = Settings {
            prefetch_count: 1,
            max_redeliveries: 0,
            concurrency: HandlerConcurrency::Concurrent,
            retry_delay: Duration::from_millis(1),
        };
        let session = run(Weak::new(), vec![], settings, shutdown);
        assert_send(&session);
        assert_send(&open_session(&Weak::new(), &[], settings));
    }

    #[tokio::test]
    async fn test_unknown_channels_are_rejected() {
        let broker = InMemoryBroker::new();
        let topology = Topology::new()
            .point_to_point("orders", true)
            .broadcast("prices", true, &["billing"]);
        let manager = connected(&broker, configs(), topology).await;

        let mut anonymous = Consumer::new(&manager);
        assert_eq!(
            anonymous.register("payments", Arc::new(MockConsumerHandler::new())),
            Err(AmqpError::UnknownChannel("payments".to_owned()))
        );
        assert_eq!(
            anonymous.register("prices", Arc::new(MockConsumerHandler::new())),
            Err(AmqpError::UnknownChannel("prices".to_owned()))
        );

        let mut stranger = Consumer::with_subscriber(&manager, "audit");
        let subscriptions = HashMap::from([
            ("orders".to_owned(), vec![]),
            ("prices".to_owned(), vec![]),
        ]);
        assert!(matches!(
            stranger.subscribe(subscriptions),
            Err(AmqpError::UnknownChannel(_))
        ));
        assert!(stranger.registry().is_empty());

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_handlers_run_in_registration_order() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, configs(), Topology::new().point_to_point("orders", true)).await;
        let seen = Arc::new(std::sync::Mutex::new(vec![]));

        let mut consumer = Consumer::new(&manager);
        consumer
            .subscribe(HashMap::from([(
                "orders".to_owned(),
                vec![
                    Arc::new(Recorder {
                        name: "first",
                        seen: seen.clone(),
                    }) as Arc<dyn ConsumerHandler>,
                    Arc::new(Recorder {
                        name: "second",
                        seen: seen.clone(),
                    }),
                ],
            )]))
            .unwrap();
        consumer.start().await.unwrap();
        assert!(consumer.is_running());

        Producer::new(&manager)
            .publish("orders", b"one", &PublishOptions::default())
            .await
            .unwrap();

        eventually(|| seen.lock().unwrap().len() == 2).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", b"one".to_vec()), ("second", b"one".to_vec())]
        );
        eventually(|| broker.unacked_count("orders") == 0).await;
        assert_eq!(broker.message_count("orders"), 0);

        consumer.stop().await;
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_failing_message_ends_in_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let mut configs = configs();
        configs.max_redeliveries = 2;
        let topology = Topology::new().point_to_point("jobs", true).dead_letter("jobs");
        let manager = connected(&broker, configs, topology).await;

        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(3)
            .returning(|_, _| Err("boom".into()));

        let mut consumer = Consumer::new(&manager);
        consumer.register("jobs", Arc::new(handler)).unwrap();
        consumer.start().await.unwrap();

        Producer::new(&manager)
            .publish("jobs", b"poison", &PublishOptions::default())
            .await
            .unwrap();

        eventually(|| broker.message_count("jobs-dlq") == 1).await;
        assert_eq!(broker.messages("jobs-dlq"), vec![b"poison".to_vec()]);
        assert_eq!(broker.message_count("jobs"), 0);

        consumer.stop().await;
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnection() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, configs(), Topology::new().point_to_point("orders", true)).await;
        let seen = Arc::new(std::sync::Mutex::new(vec![]));

        let mut consumer = Consumer::new(&manager);
        consumer
            .register(
                "orders",
                Arc::new(Recorder {
                    name: "recorder",
                    seen: seen.clone(),
                }),
            )
            .unwrap();
        consumer.start().await.unwrap();
        eventually(|| broker.consumer_count("orders") == 1).await;

        broker.drop_connections();
        eventually(|| manager.generation() == 2).await;
        eventually(|| broker.consumer_count("orders") == 1).await;

        Producer::new(&manager)
            .publish("orders", b"after", &PublishOptions::default())
            .await
            .unwrap();

        eventually(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].1, b"after".to_vec());
        assert!(consumer.is_running());

        consumer.stop().await;
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_stop_then_start_again() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, configs(), Topology::new().point_to_point("orders", true)).await;
        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        let producer = Producer::new(&manager);

        let mut consumer = Consumer::new(&manager);
        consumer
            .register(
                "orders",
                Arc::new(Recorder {
                    name: "recorder",
                    seen: seen.clone(),
                }),
            )
            .unwrap();
        consumer.start().await.unwrap();
        eventually(|| broker.consumer_count("orders") == 1).await;

        consumer.stop().await;
        assert!(!consumer.is_running());
        assert_eq!(broker.consumer_count("orders"), 0);

        producer
            .publish("orders", b"queued", &PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.message_count("orders"), 1);

        consumer.start().await.unwrap();
        eventually(|| seen.lock().unwrap().len() == 1).await;
        eventually(|| broker.message_count("orders") == 0).await;

        consumer.stop().await;
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_start_without_subscriptions_or_after_shutdown() {
        let broker = InMemoryBroker::new();
        let manager = connected(&broker, configs(), Topology::new().point_to_point("orders", true)).await;

        let consumer = Consumer::new(&manager);
        consumer.start().await.unwrap();
        assert!(!consumer.is_running());

        manager.disconnect().await;
        assert_eq!(consumer.start().await, Err(AmqpError::Closed));
    }

    struct Rendezvous {
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl ConsumerHandler for Rendezvous {
        async fn exec(&self, _ctx: &Context, _msg: &ConsumerMessage) -> Result<(), HandlerError> {
            self.barrier.wait().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_mode_overlaps_distinct_messages() {
        let broker = InMemoryBroker::new();
        let mut configs = configs();
        configs.handler_concurrency = HandlerConcurrency::Concurrent;
        configs.prefetch_count = 2;
        let manager = connected(&broker, configs, Topology::new().point_to_point("orders", true)).await;

        // both messages must be in a handler at once to get past the barrier
        let mut consumer = Consumer::new(&manager);
        consumer
            .register(
                "orders",
                Arc::new(Rendezvous {
                    barrier: Arc::new(Barrier::new(2)),
                }),
            )
            .unwrap();
        consumer.start().await.unwrap();

        let producer = Producer::new(&manager);
        for payload in [b"a", b"b"] {
            producer
                .publish("orders", payload, &PublishOptions::default())
                .await
                .unwrap();
        }

        eventually(|| broker.message_count("orders") == 0 && broker.unacked_count("orders") == 0)
            .await;

        consumer.stop().await;
        manager.disconnect().await;
    }
}
