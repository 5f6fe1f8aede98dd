// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport over lapin
//!
//! This module handles the creation of AMQP connections and channels with lapin and
//! adapts them to the broker seam in [`crate::transport`]. Every connection attempt
//! rotates to the next configured broker URL.

use crate::{
    configs::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        BrokerChannel, BrokerConnection, Confirmation, Delivery, DeliveryStream, HeaderValue,
        MessageProperties, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::sync::watch;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, rotating through the configured broker URLs.
pub struct LapinTransport {
    app_name: String,
    urls: Vec<String>,
    cursor: AtomicUsize,
}

impl LapinTransport {
    /// Creates a transport for the broker URLs of `cfg`.
    pub fn new(cfg: &AmqpConfigs) -> LapinTransport {
        LapinTransport {
            app_name: cfg.app_name.clone(),
            urls: cfg.urls.clone(),
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        if self.urls.is_empty() {
            return Err(AmqpError::ConnectionError);
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.urls.len();

        debug!(url_index = index, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.app_name.clone()));

        let conn = match Connection::connect(&self.urls[index], options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), url_index = index, "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        let (dropped_tx, dropped_rx) = watch::channel(None);
        conn.on_error(move |err| {
            let _ = dropped_tx.send(Some(err.to_string()));
        });

        Ok(Arc::new(LapinConnection {
            conn,
            dropped: dropped_rx,
        }))
    }
}

struct LapinConnection {
    conn: Connection,
    dropped: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
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
        self.conn.status().connected()
    }

    async fn close(&self) {
        if let Err(err) = self.conn.close(REPLY_SUCCESS, "shutdown").await {
            debug!(error = err.to_string(), "error closing amqp connection");
        }
    }
}

struct LapinChannel {
    channel: Channel,
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_err) => matches!(
            amqp_err.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.try_into()?,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(error = err.to_string(), name = def.name, "exchange conflicts");
                Err(AmqpError::DeclarationConflict(def.name.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                to_field_table(&def.arguments()),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(error = err.to_string(), name = def.name, "queue conflicts");
                Err(AmqpError::DeclarationConflict(def.name.clone()))
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(prefetch_count.to_string())
            })
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<Confirmation, AmqpError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::ConnectionLost)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        match confirm.await {
            Ok(publisher_confirm::Confirmation::Ack(_)) => Ok(Confirmation::Ack),
            Ok(publisher_confirm::Confirmation::Nack(_)) => {
                Ok(Confirmation::Nack("broker nacked the message".to_owned()))
            }
            Ok(publisher_confirm::Confirmation::NotRequested) => Ok(Confirmation::NotRequested),
            Err(err) => {
                error!(error = err.to_string(), "error waiting publisher confirm");
                Err(AmqpError::ConnectionLost)
            }
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.to_string(),
                    routing_key: delivery.routing_key.to_string(),
                    redelivered: delivery.redelivered,
                    properties: from_basic_properties(&delivery.properties),
                    data: delivery.data,
                }),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConnectionLost)
                }
            })
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
            debug!(error = err.to_string(), "error closing amqp channel");
        }
    }
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value.clone() {
        HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
        HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
        HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        HeaderValue::LongInt(v) => AMQPValue::LongInt(v),
        HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(v),
        HeaderValue::LongUint(v) => AMQPValue::LongUInt(v),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::ShortString(v) => Some(HeaderValue::ShortString(v.to_string())),
        AMQPValue::LongString(v) => Some(HeaderValue::LongString(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortShortInt(v) => Some(HeaderValue::LongInt(*v as i32)),
        AMQPValue::ShortInt(v) => Some(HeaderValue::LongInt(*v as i32)),
        AMQPValue::LongInt(v) => Some(HeaderValue::LongInt(*v)),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::LongLongInt(*v)),
        AMQPValue::ShortShortUInt(v) => Some(HeaderValue::LongUint(*v as u32)),
        AMQPValue::ShortUInt(v) => Some(HeaderValue::LongUint(*v as u32)),
        AMQPValue::LongUInt(v) => Some(HeaderValue::LongUint(*v)),
        _ => None,
    }
}

fn to_field_table(values: &BTreeMap<String, HeaderValue>) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in values {
        btree.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    FieldTable::from(btree)
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default()
        .with_delivery_mode(if props.persistent { 2 } else { 1 })
        .with_headers(to_field_table(&props.headers));

    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }

    basic
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let mut headers = BTreeMap::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            if let Some(value) = from_amqp_value(value) {
                headers.insert(key.to_string(), value);
            }
        }
    }

    MessageProperties {
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        persistent: matches!(props.delivery_mode(), Some(2)),
        headers,
    }
}
