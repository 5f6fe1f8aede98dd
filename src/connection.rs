// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! `ConnectionManager` owns the single logical connection to the broker. A background
//! supervisor task establishes the transport, declares the topology, watches for
//! drops and reconnects with exponential backoff until `disconnect` is called.
//!
//! State machine:
//!
//! ```text
//! disconnected -> connecting -> connected <-> reconnecting
//!                      \____________________/
//!                       any state -> closed (terminal)
//! ```
//!
//! Every transition goes through a single guarded writer, then notifies the
//! registered observers synchronously and in transition order.

use crate::{
    channel::LapinTransport,
    configs::AmqpConfigs,
    errors::AmqpError,
    topology::{Topology, TopologyDeclarator},
    transport::{BrokerChannel, BrokerConnection, Transport},
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, RwLock, Weak,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal, reached through `disconnect` or a fatal configuration error
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

type StateObserver = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Shared {
    configs: AmqpConfigs,
    transport: Arc<dyn Transport>,
    declarator: TopologyDeclarator,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    observers: RwLock<Vec<StateObserver>>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    channels: Mutex<Vec<Weak<dyn BrokerChannel>>>,
    generation: AtomicU64,
    retries: AtomicU32,
    last_error: Mutex<Option<AmqpError>>,
    writer: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Single writer of the connection state. Transitions out of `closed` and
    /// transitions to the current state are ignored.
    fn transition(&self, next: ConnectionState) -> bool {
        let _writer = lock(&self.writer);

        let current = self.state();
        if current == next || current == ConnectionState::Closed {
            return false;
        }

        self.state_tx.send_replace(next);
        info!(from = %current, to = %next, "connection state changed");

        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            observer(next);
        }

        true
    }

    fn set_last_error(&self, err: AmqpError) {
        *lock(&self.last_error) = Some(err);
    }

    /// Opens a fresh transport and declares the topology on it.
    async fn establish(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let conn = self.transport.connect().await?;

        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                conn.close().await;
                return Err(err);
            }
        };

        let declared = self.declarator.declare(channel.as_ref()).await;
        channel.close().await;

        if let Err(err) = declared {
            conn.close().await;
            return Err(err);
        }

        Ok(conn)
    }

    /// Closes every channel handed out and the transport, if any.
    async fn release(&self) {
        let channels: Vec<_> = lock(&self.channels).drain(..).collect();
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close().await;
        }

        let conn = self
            .connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(conn) = conn {
            conn.close().await;
            debug!("transport released");
        }
    }

    async fn supervise(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            if attempt == 0 {
                self.transition(ConnectionState::Connecting);
            }

            let outcome = tokio::select! {
                _ = shutdown.changed() => break,
                outcome = self.establish() => outcome,
            };

            match outcome {
                Ok(conn) => {
                    attempt = 0;
                    self.retries.store(0, Ordering::SeqCst);
                    *self
                        .connection
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(conn.clone());
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(generation, "topology declared on new connection");
                    self.transition(ConnectionState::Connected);

                    let reason = tokio::select! {
                        _ = shutdown.changed() => break,
                        reason = conn.closed() => reason,
                    };

                    warn!(reason, "connection lost");
                    self.connection
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .take();
                    lock(&self.channels).clear();
                    self.set_last_error(AmqpError::ConnectionLost);
                    self.transition(ConnectionState::Reconnecting);
                }
                Err(AmqpError::DeclarationConflict(entity)) => {
                    error!(entity, "topology conflicts with the broker, closing");
                    self.set_last_error(AmqpError::DeclarationConflict(entity));
                    self.transition(ConnectionState::Closed);
                    return;
                }
                Err(err) => {
                    warn!(attempt, error = err.to_string(), "connection attempt failed");
                    self.set_last_error(err);
                    self.transition(ConnectionState::Reconnecting);
                }
            }

            attempt = attempt.saturating_add(1);
            self.retries.store(attempt, Ordering::SeqCst);
            let delay = self.configs.reconnect.delay_for(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.release().await;
        self.transition(ConnectionState::Closed);
    }
}

/// Owner of the broker connection and of every channel derived from it.
///
/// Producers and consumers keep a `Weak` reference and ask for channels on demand.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Builds a manager over any transport. The configuration is validated first.
    pub fn new(
        configs: AmqpConfigs,
        topology: Topology,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<ConnectionManager>, AmqpError> {
        configs.validate()?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(ConnectionManager {
            shared: Arc::new(Shared {
                configs,
                transport,
                declarator: TopologyDeclarator::new(topology),
                state_tx,
                shutdown_tx,
                observers: RwLock::new(vec![]),
                connection: RwLock::new(None),
                channels: Mutex::new(vec![]),
                generation: AtomicU64::new(0),
                retries: AtomicU32::new(0),
                last_error: Mutex::new(None),
                writer: Mutex::new(()),
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }))
    }

    /// Builds a manager connecting to RabbitMQ through lapin.
    pub fn with_lapin(
        configs: AmqpConfigs,
        topology: Topology,
    ) -> Result<Arc<ConnectionManager>, AmqpError> {
        let transport = Arc::new(LapinTransport::new(&configs));
        ConnectionManager::new(configs, topology, transport)
    }

    /// Starts the connection supervisor and waits for the first attempt to settle.
    ///
    /// Returns `Ok` once connected. A failed first attempt returns `ConnectionLost`
    /// while reconnection continues in the background. A topology conflict closes
    /// the manager and is returned as `DeclarationConflict`. Calling it while
    /// connected is a no-op.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        let mut rx = self.shared.state_tx.subscribe();

        {
            let mut supervisor = self.supervisor.lock().await;
            match self.state() {
                ConnectionState::Closed => return Err(self.closed_error()),
                ConnectionState::Connected => return Ok(()),
                _ => {}
            }

            if supervisor.is_none() {
                let shutdown = self.shared.shutdown_tx.subscribe();
                *supervisor = Some(tokio::spawn(self.shared.clone().supervise(shutdown)));
            }
        }

        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Reconnecting => return Err(AmqpError::ConnectionLost),
                ConnectionState::Closed => return Err(self.closed_error()),
                ConnectionState::Disconnected | ConnectionState::Connecting => {}
            }

            if rx.changed().await.is_err() {
                return Err(AmqpError::Closed);
            }
        }
    }

    /// Graceful shutdown: stops reconnecting, closes channels and transport. Any
    /// pending connect or publish wait is released. Always succeeds.
    pub async fn disconnect(&self) {
        self.shared.shutdown_tx.send_replace(true);

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = err.to_string(), "connection supervisor failed");
            }
        }

        self.shared.release().await;
        self.shared.transition(ConnectionState::Closed);
    }

    /// Registers an observer fired synchronously on every state transition.
    /// Observers run under the state writer and must not block.
    pub fn on_state_change<F>(&self, observer: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.shared
            .observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(observer));
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Receiver following every state transition.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Consecutive failed attempts since the last successful connection.
    pub fn retry_count(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    /// Last failure recorded by the connection supervisor, if any.
    pub fn last_error(&self) -> Option<AmqpError> {
        lock(&self.shared.last_error).clone()
    }

    /// Number of successful connections so far. Changes on every reconnect.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Configuration the manager was built with.
    pub fn configs(&self) -> &AmqpConfigs {
        &self.shared.configs
    }

    /// Topology declared on every connection.
    pub fn topology(&self) -> &Topology {
        self.shared.declarator.topology()
    }

    /// Opens a channel on the current connection.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.state() {
            ConnectionState::Closed => return Err(AmqpError::Closed),
            ConnectionState::Connected => {}
            _ => return Err(AmqpError::ConnectionLost),
        }

        let conn = self
            .shared
            .connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(AmqpError::ConnectionLost)?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|_| AmqpError::ConnectionLost)?;

        let mut channels = lock(&self.shared.channels);
        channels.retain(|c| c.strong_count() > 0);
        channels.push(Arc::downgrade(&channel));

        Ok(channel)
    }

    /// Waits until connected, at most `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), AmqpError> {
        let mut rx = self.watch();
        let wait = async {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => return Err(AmqpError::Closed),
                    _ => {}
                }

                if rx.changed().await.is_err() {
                    return Err(AmqpError::Closed);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(AmqpError::ConnectionLost))
    }

    /// Resolves once `disconnect` was requested or the manager is gone.
    pub(crate) async fn closing(&self) {
        let mut rx = self.shared.shutdown_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }

            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn closed_error(&self) -> AmqpError {
        match self.last_error() {
            Some(err @ AmqpError::DeclarationConflict(_)) => err,
            _ => AmqpError::Closed,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown_tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{configs::ReconnectConfigs, memory::InMemoryBroker};

    pub(crate) fn fast_configs() -> AmqpConfigs {
        AmqpConfigs {
            reconnect: ReconnectConfigs {
                initial_delay_ms: 10,
                max_delay_ms: 40,
                multiplier: 2.0,
            },
            ..AmqpConfigs::default()
        }
    }

    fn manager(broker: &InMemoryBroker, topology: Topology) -> Arc<ConnectionManager> {
        ConnectionManager::new(fast_configs(), topology, Arc::new(broker.clone())).unwrap()
    }

    fn record(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        manager.on_state_change(move |state| sink.lock().unwrap().push(state));
        seen
    }

    #[tokio::test]
    async fn test_connect_declares_topology_and_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, Topology::new().point_to_point("orders", true));
        let seen = record(&manager);

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.connects(), 1);
        assert_eq!(manager.generation(), 1);
        assert_eq!(broker.queue_names(), vec!["orders"]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_reconnects_and_redeclares_after_drop() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, Topology::new().point_to_point("scratch", false));
        let seen = record(&manager);
        manager.connect().await.unwrap();

        broker.restart();
        assert!(broker.queue_names().is_empty());

        let mut rx = manager.watch();
        rx.wait_for(|s| *s == ConnectionState::Reconnecting).await.unwrap();
        manager
            .wait_connected(Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(manager.generation(), 2);
        assert_eq!(manager.retry_count(), 0);
        assert_eq!(manager.last_error(), Some(AmqpError::ConnectionLost));
        assert_eq!(broker.queue_names(), vec!["scratch"]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_failed_first_attempt_keeps_retrying() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let manager = manager(&broker, Topology::new().point_to_point("orders", true));

        assert_eq!(manager.connect().await, Err(AmqpError::ConnectionLost));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.last_error(), Some(AmqpError::ConnectionError));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(manager.retry_count() >= 2);

        broker.set_available(true);
        manager
            .wait_connected(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(manager.retry_count(), 0);

        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_terminal() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker, Topology::new().point_to_point("orders", true));
        let seen = record(&manager);
        manager.connect().await.unwrap();
        let _channel = manager.open_channel().await.unwrap();

        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(broker.connection_count(), 0);
        assert_eq!(manager.connect().await, Err(AmqpError::Closed));
        assert_eq!(manager.open_channel().await.err(), Some(AmqpError::Closed));
        assert_eq!(seen.lock().unwrap().last(), Some(&ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_backoff_promptly() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);
        let mut configs = fast_configs();
        configs.reconnect = ReconnectConfigs {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            multiplier: 1.0,
        };
        let manager = ConnectionManager::new(
            configs,
            Topology::new().point_to_point("orders", true),
            Arc::new(broker.clone()),
        )
        .unwrap();

        assert_eq!(manager.connect().await, Err(AmqpError::ConnectionLost));
        tokio::time::timeout(Duration::from_secs(1), manager.disconnect())
            .await
            .unwrap();
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_declaration_conflict_is_fatal_at_startup() {
        let broker = InMemoryBroker::new();
        let other = manager(&broker, Topology::new().point_to_point("orders", false));
        other.connect().await.unwrap();

        let manager = manager(&broker, Topology::new().point_to_point("orders", true));
        assert_eq!(
            manager.connect().await,
            Err(AmqpError::DeclarationConflict("orders".to_owned()))
        );
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(
            manager.connect().await,
            Err(AmqpError::DeclarationConflict("orders".to_owned()))
        );

        other.disconnect().await;
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let configs = AmqpConfigs {
            prefetch_count: 0,
            ..AmqpConfigs::default()
        };
        let result = ConnectionManager::new(
            configs,
            Topology::new(),
            Arc::new(InMemoryBroker::new()),
        );
        assert!(matches!(result, Err(AmqpError::InvalidConfigs(_))));
    }
}
