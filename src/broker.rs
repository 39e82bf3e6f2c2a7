// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Capabilities
//!
//! The adapter talks to the broker only through the traits in this module.
//! Two variants exist: the live lapin client in [`crate::amqp`] and the
//! in-memory fake in [`crate::memory`], chosen when the adapter is built.

use crate::errors::AdapterError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, sync::Arc};

/// Stream of deliveries produced by a consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, AdapterError>>;

/// Result of a passive queue inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub messages: u32,
    pub consumers: u32,
}

/// Dials the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AdapterError>;
}

/// An established broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AdapterError>;

    async fn close(&self) -> Result<(), AdapterError>;
}

/// A communication channel shared by the dispatcher and every worker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Limits unacknowledged deliveries on this channel to `prefetch_count`.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AdapterError>;

    /// Confirms the queue exists without declaring it.
    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, AdapterError>;

    /// Subscribes to `queue` with manual acknowledgment and an empty consumer tag.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AdapterError>;

    async fn close(&self) -> Result<(), AdapterError>;
}

/// One message handed over by the broker, pending disposition.
///
/// Both dispositions are single-message; `reject` never requeues.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn delivery_tag(&self) -> u64;

    fn message_id(&self) -> Option<String>;

    fn content_type(&self) -> Option<String>;

    /// String-valued message headers.
    fn headers(&self) -> BTreeMap<String, String>;

    fn body(&self) -> &[u8];

    async fn ack(&self) -> Result<(), AdapterError>;

    async fn reject(&self) -> Result<(), AdapterError>;
}
