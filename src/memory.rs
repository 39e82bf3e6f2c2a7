// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker variant living entirely in process memory. It honours the channel
//! prefetch limit, records every disposition and can be told to refuse dials
//! or to drop an established connection, which makes the forwarding pipeline
//! observable without a RabbitMQ server.

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryStream, QueueInfo},
    errors::AdapterError,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Terminal disposition recorded for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Reject,
}

/// Message published into a [`MemoryBroker`] queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessage {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl MemoryMessage {
    pub fn new(body: &[u8]) -> MemoryMessage {
        MemoryMessage {
            body: body.to_vec(),
            ..MemoryMessage::default()
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum DialFailures {
    Never,
    Times(u64),
    Always,
}

struct QueueState {
    sender: Option<mpsc::UnboundedSender<MemoryMessage>>,
    receiver: Option<mpsc::UnboundedReceiver<MemoryMessage>>,
    pending: u32,
}

struct State {
    dial_failures: DialFailures,
    dials: u64,
    last_uri: Option<String>,
    fail_inspection: bool,
    link: CancellationToken,
    queues: HashMap<String, QueueState>,
    prefetch: Option<u16>,
    next_tag: u64,
    dispositions: Vec<(u64, Disposition)>,
    in_flight: usize,
    max_in_flight: usize,
    channel_closed: bool,
    connection_closed: bool,
}

/// Handle to an in-memory broker; clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker::new()
    }
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker {
            state: Arc::new(Mutex::new(State {
                dial_failures: DialFailures::Never,
                dials: 0,
                last_uri: None,
                fail_inspection: false,
                link: CancellationToken::new(),
                queues: HashMap::default(),
                prefetch: None,
                next_tag: 1,
                dispositions: vec![],
                in_flight: 0,
                max_in_flight: 0,
                channel_closed: false,
                connection_closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    /// Refuses the next `times` dials.
    pub fn fail_dials(self, times: u64) -> Self {
        self.lock().dial_failures = DialFailures::Times(times);
        self
    }

    /// Refuses every dial.
    pub fn refuse_dials(self) -> Self {
        self.lock().dial_failures = DialFailures::Always;
        self
    }

    /// Makes queue inspection fail even for declared queues.
    pub fn fail_inspection(self) -> Self {
        self.lock().fail_inspection = true;
        self
    }

    pub fn declare_queue(&self, name: &str) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().queues.insert(
            name.to_owned(),
            QueueState {
                sender: Some(sender),
                receiver: Some(receiver),
                pending: 0,
            },
        );
    }

    /// Enqueues a message; returns false when the queue is unknown or closed.
    pub fn publish(&self, queue: &str, message: MemoryMessage) -> bool {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue) else {
            return false;
        };
        let sent = match &queue.sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        };
        if sent {
            queue.pending += 1;
        }
        sent
    }

    /// Ends the delivery stream of `queue` once its buffered messages are consumed.
    pub fn close_queue(&self, queue: &str) {
        if let Some(queue) = self.lock().queues.get_mut(queue) {
            queue.sender = None;
        }
    }

    /// Severs the current connection as a network failure would.
    ///
    /// Open delivery streams yield an error and end; messages not yet
    /// delivered stay queued for the next consumer.
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.link.cancel();
        state.channel_closed = true;
        state.connection_closed = true;
    }

    pub fn dials(&self) -> u64 {
        self.lock().dials
    }

    pub fn last_uri(&self) -> Option<String> {
        self.lock().last_uri.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    /// Every disposition call in the order it was issued.
    pub fn dispositions(&self) -> Vec<(u64, Disposition)> {
        self.lock().dispositions.clone()
    }

    /// Number of messages handed out on delivery streams so far.
    pub fn delivered(&self) -> u64 {
        self.lock().next_tag - 1
    }

    /// Deliveries handed out and not settled yet.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Highest number of unsettled deliveries observed at once.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn channel_closed(&self) -> bool {
        self.lock().channel_closed
    }

    pub fn connection_closed(&self) -> bool {
        self.lock().connection_closed
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn dial(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, AdapterError> {
        let mut state = self.lock();
        state.dials += 1;
        state.last_uri = Some(uri.to_owned());

        let refuse = match state.dial_failures {
            DialFailures::Never => false,
            DialFailures::Always => true,
            DialFailures::Times(0) => false,
            DialFailures::Times(n) => {
                state.dial_failures = DialFailures::Times(n - 1);
                true
            }
        };
        if refuse {
            return Err(AdapterError::ConnectionError(format!(
                "connection refused: {}",
                uri
            )));
        }

        state.connection_closed = false;
        if state.link.is_cancelled() {
            state.link = CancellationToken::new();
        }
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AdapterError> {
        let mut state = self.broker.lock();
        if state.connection_closed {
            return Err(AdapterError::ChannelError("connection is closed".to_owned()));
        }
        state.channel_closed = false;
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        let mut state = self.broker.lock();
        if state.connection_closed {
            return Err(AdapterError::ConnectionError("already closed".to_owned()));
        }
        state.connection_closed = true;
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
}

impl MemoryChannel {
    fn ensure_open(state: &State) -> Result<(), AdapterError> {
        if state.channel_closed {
            return Err(AdapterError::ChannelError("channel is closed".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn qos(&self, prefetch_count: u16) -> Result<(), AdapterError> {
        let mut state = self.broker.lock();
        Self::ensure_open(&state)?;
        state.prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo, AdapterError> {
        let state = self.broker.lock();
        Self::ensure_open(&state)?;
        if state.fail_inspection {
            return Err(AdapterError::QueueInspectionError(queue.to_owned()));
        }
        match state.queues.get(queue) {
            Some(q) => Ok(QueueInfo {
                name: queue.to_owned(),
                messages: q.pending,
                consumers: u32::from(q.receiver.is_none()),
            }),
            None => Err(AdapterError::QueueInspectionError(queue.to_owned())),
        }
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AdapterError> {
        let (receiver, prefetch, link) = {
            let mut state = self.broker.lock();
            Self::ensure_open(&state)?;
            let prefetch = state.prefetch.unwrap_or(0);
            let receiver = state
                .queues
                .get_mut(queue)
                .and_then(|q| q.receiver.take())
                .ok_or_else(|| AdapterError::ConsumerDeclarationError(queue.to_owned()))?;
            (receiver, prefetch, state.link.clone())
        };

        let permits = match prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => usize::from(n),
        };
        let consumer = Consumer {
            receiver: Some(receiver),
            limiter: Arc::new(Semaphore::new(permits)),
            link,
            broker: self.broker.clone(),
            queue: queue.to_owned(),
        };

        Ok(stream::unfold(consumer, Consumer::next).boxed())
    }

    async fn close(&self) -> Result<(), AdapterError> {
        let mut state = self.broker.lock();
        if state.channel_closed {
            return Err(AdapterError::ChannelError("already closed".to_owned()));
        }
        state.channel_closed = true;
        Ok(())
    }
}

/// State behind one delivery stream.
struct Consumer {
    receiver: Option<mpsc::UnboundedReceiver<MemoryMessage>>,
    limiter: Arc<Semaphore>,
    link: CancellationToken,
    broker: MemoryBroker,
    queue: String,
}

enum Received {
    Message(OwnedSemaphorePermit, MemoryMessage),
    Closed,
    Severed,
}

impl Consumer {
    async fn next(mut self) -> Option<(Result<Box<dyn Delivery>, AdapterError>, Consumer)> {
        let mut receiver = self.receiver.take()?;

        let received = tokio::select! {
            biased;
            _ = self.link.cancelled() => Received::Severed,
            next = receive(&mut receiver, &self.limiter) => match next {
                Some((permit, message)) => Received::Message(permit, message),
                None => Received::Closed,
            },
        };

        match received {
            Received::Closed => None,
            Received::Severed => {
                // hand the queue back so a later consumer picks up the rest
                if let Some(q) = self.broker.lock().queues.get_mut(&self.queue) {
                    q.receiver = Some(receiver);
                }
                let err = AdapterError::ConsumerError("connection lost".to_owned());
                Some((Err(err), self))
            }
            Received::Message(permit, message) => {
                let tag = {
                    let mut state = self.broker.lock();
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    state.in_flight += 1;
                    state.max_in_flight = state.max_in_flight.max(state.in_flight);
                    if let Some(q) = state.queues.get_mut(&self.queue) {
                        q.pending = q.pending.saturating_sub(1);
                    }
                    tag
                };
                debug!(delivery_tag = tag, "memory broker delivered message");

                let delivery: Box<dyn Delivery> = Box::new(MemoryDelivery {
                    tag,
                    message,
                    permit: Mutex::new(Some(permit)),
                    broker: self.broker.clone(),
                });
                self.receiver = Some(receiver);
                Some((Ok(delivery), self))
            }
        }
    }
}

async fn receive(
    receiver: &mut mpsc::UnboundedReceiver<MemoryMessage>,
    limiter: &Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, MemoryMessage)> {
    let permit = limiter.clone().acquire_owned().await.ok()?;
    let message = receiver.recv().await?;
    Some((permit, message))
}

struct MemoryDelivery {
    tag: u64,
    message: MemoryMessage,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    broker: MemoryBroker,
}

impl MemoryDelivery {
    fn settle(&self, disposition: Disposition) -> bool {
        let permit = self
            .permit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let mut state = self.broker.lock();
        state.dispositions.push((self.tag, disposition));
        if permit.is_some() {
            state.in_flight -= 1;
        }
        permit.is_some()
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn message_id(&self) -> Option<String> {
        self.message.message_id.clone()
    }

    fn content_type(&self) -> Option<String> {
        self.message.content_type.clone()
    }

    fn headers(&self) -> BTreeMap<String, String> {
        self.message.headers.clone()
    }

    fn body(&self) -> &[u8] {
        &self.message.body
    }

    async fn ack(&self) -> Result<(), AdapterError> {
        if !self.settle(Disposition::Ack) {
            return Err(AdapterError::AckMessageError(format!(
                "delivery {} already settled",
                self.tag
            )));
        }
        Ok(())
    }

    async fn reject(&self) -> Result<(), AdapterError> {
        if !self.settle(Disposition::Reject) {
            return Err(AdapterError::NackMessageError(format!(
                "delivery {} already settled",
                self.tag
            )));
        }
        Ok(())
    }
}
