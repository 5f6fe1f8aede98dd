// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Messaging
//!
//! Resilient messaging over an AMQP broker: a supervised connection that reconnects
//! on its own, a declarative topology of point-to-point and broadcast channels, and
//! a producer and consumer working on top of them.
//!
//! ```ignore
//! let topology = Topology::new().point_to_point("orders", true);
//! let manager = ConnectionManager::with_lapin(configs, topology)?;
//! manager.connect().await?;
//!
//! let mut consumer = Consumer::new(&manager);
//! consumer.register("orders", Arc::new(OrdersHandler))?;
//! consumer.start().await?;
//!
//! Producer::new(&manager)
//!     .publish_json("orders", &order, &PublishOptions::default())
//!     .await?;
//! ```

mod consumer;
mod otel;

pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod topology;
pub mod transport;

pub use configs::{AmqpConfigs, HandlerConcurrency, PublishPolicy, ReconnectConfigs};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatcher::Consumer;
pub use errors::{AmqpError, HandlerError};
pub use handler::{ConsumerHandler, ConsumerMessage, HandlerRegistry};
pub use memory::InMemoryBroker;
pub use publisher::{Producer, PublishOptions};
pub use topology::{Pattern, Topology, TopologyDeclarator};
