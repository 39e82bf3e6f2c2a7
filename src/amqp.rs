// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Live AMQP Client
//!
//! This module implements the broker capabilities on top of `lapin`. It
//! establishes connections and channels, inspects and consumes the source
//! queue, and issues dispositions for received deliveries.
//!
//! Every ack/nack on a channel is serialized through a per-channel lock so
//! workers sharing the channel never write disposition frames concurrently.

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream, QueueInfo},
    errors::AdapterError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Serializes dispositions issued on one channel.
pub type DispositionLock = Arc<Mutex<()>>;

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    connection_name: Option<String>,
}

impl LapinConnector {
    pub fn new() -> LapinConnector {
        LapinConnector::default()
    }

    /// Sets the connection name shown in the broker management UI.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AdapterError> {
        debug!("creating amqp connection...");
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match Connection::connect(uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AdapterError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// Connection established by [`LapinConnector`].
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AdapterError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel {
                    channel,
                    dispositions: Arc::new(Mutex::new(())),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AdapterError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.conn
            .close(REPLY_SUCCESS, "shutting down")
            .await
            .map_err(|err| AdapterError::ConnectionError(err.to_string()))
    }
}

/// Channel opened by [`LapinConnection`].
pub struct LapinChannel {
    channel: Channel,
    dispositions: DispositionLock,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AdapterError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AdapterError::QoSDeclarationError(err.to_string())
            })
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, AdapterError> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AdapterError::QueueInspectionError(describe(queue, err)))?;

        Ok(QueueInfo {
            name: declared.name().to_string(),
            messages: declared.message_count(),
            consumers: declared.consumer_count(),
        })
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AdapterError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AdapterError::ConsumerDeclarationError(describe(queue, err))
            })?;

        let dispositions = self.dispositions.clone();
        let stream = consumer.map(move |result| match result {
            Ok(delivery) => Ok(Box::new(LapinDelivery {
                inner: delivery,
                dispositions: dispositions.clone(),
            }) as Box<dyn Delivery>),
            Err(err) => Err(AdapterError::ConsumerError(err.to_string())),
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.channel
            .close(REPLY_SUCCESS, "shutting down")
            .await
            .map_err(|err| AdapterError::ChannelError(err.to_string()))
    }
}

/// Delivery received from a [`LapinChannel`] consumer.
pub struct LapinDelivery {
    inner: message::Delivery,
    dispositions: DispositionLock,
}

#[async_trait]
impl Delivery for LapinDelivery {
    fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    fn message_id(&self) -> Option<String> {
        self.inner
            .properties
            .message_id()
            .as_ref()
            .map(|id| id.to_string())
    }

    fn content_type(&self) -> Option<String> {
        self.inner
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.to_string())
    }

    fn headers(&self) -> BTreeMap<String, String> {
        match self.inner.properties.headers() {
            Some(table) => string_headers(table),
            None => BTreeMap::default(),
        }
    }

    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    async fn ack(&self) -> Result<(), AdapterError> {
        let _guard = self.dispositions.lock().await;
        self.inner
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AdapterError::AckMessageError(err.to_string()))
    }

    async fn reject(&self) -> Result<(), AdapterError> {
        let _guard = self.dispositions.lock().await;
        self.inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .map_err(|err| AdapterError::NackMessageError(err.to_string()))
    }
}

/// Keeps the headers whose values are textual.
/// Prefixes a broker error with the queue it concerns.
fn describe(queue: &str, err: impl std::fmt::Display) -> String {
    format!("{}: {}", queue, err)
}

fn string_headers(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.to_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                _ => return None,
            };
            Some((key.to_string(), text))
        })
        .collect()
}
