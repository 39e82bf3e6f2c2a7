// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumption Dispatcher
//!
//! This module subscribes to the source queue and fans deliveries out to a
//! fixed pool of forwarding workers through a bounded relay queue.
//!
//! The dispatch loop also coordinates shutdown: once the stop token fires (or
//! the broker closes the delivery stream) no further deliveries are admitted,
//! the relay is closed and the call returns only after every worker has
//! drained what was already admitted.

use crate::{
    broker::{BrokerChannel, Delivery},
    errors::AdapterError,
    worker::{Forwarder, ForwardingWorker},
};
use futures_util::{future::join_all, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Why a dispatch run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// The stop token was cancelled.
    Stopped,
    /// The broker ended the delivery stream, usually because the connection was lost.
    StreamClosed,
}

/// Drives consumption of one queue with `parallelism` workers.
pub struct ConsumptionDispatcher {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    parallelism: usize,
    forwarder: Arc<Forwarder>,
}

impl ConsumptionDispatcher {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        queue: &str,
        parallelism: usize,
        forwarder: Arc<Forwarder>,
    ) -> ConsumptionDispatcher {
        ConsumptionDispatcher {
            channel,
            queue: queue.to_owned(),
            parallelism: parallelism.max(1),
            forwarder,
        }
    }

    /// Consumes until `stop` is cancelled or the delivery stream ends.
    ///
    /// A failed queue inspection is logged and consumption is attempted
    /// anyway. Either way the run returns only after every admitted delivery
    /// has been settled by its worker.
    ///
    /// # Parameters
    /// * `stop` - Shutdown token; once cancelled no further delivery is admitted
    ///
    /// # Returns
    /// The reason the run ended, or `ConsumerDeclarationError` when the
    /// consumer cannot be registered
    pub async fn run(&self, stop: CancellationToken) -> Result<DispatchExit, AdapterError> {
        match self.channel.inspect_queue(&self.queue).await {
            Ok(queue) => info!(
                queue = %queue.name,
                messages = queue.messages,
                consumers = queue.consumers,
                "queue inspected"
            ),
            Err(err) => warn!(
                error = err.to_string(),
                queue = %self.queue,
                "queue inspection failed, consuming anyway"
            ),
        }

        let mut deliveries = self.channel.consume(&self.queue).await?;

        let (relay, relay_rx) = mpsc::channel::<Box<dyn Delivery>>(self.parallelism);
        let relay_rx = Arc::new(Mutex::new(relay_rx));

        info!(worker_count = self.parallelism, "starting workers");
        let workers = (0..self.parallelism)
            .map(|id| {
                let worker = ForwardingWorker::new(id, self.forwarder.clone());
                tokio::spawn(worker.run(relay_rx.clone()))
            })
            .collect::<Vec<_>>();

        let exit = loop {
            tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    info!("shutting down...");
                    break DispatchExit::Stopped;
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        if let Err(mpsc::error::SendError(delivery)) = relay.send(delivery).await {
                            error!(delivery_tag = delivery.delivery_tag(), "no worker left to take delivery");
                            if let Err(err) = delivery.reject().await {
                                error!(error = err.to_string(), "sending nack failed");
                            }
                            break DispatchExit::StreamClosed;
                        }
                    }
                    Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                    None => {
                        info!(queue = %self.queue, "delivery stream closed");
                        break DispatchExit::StreamClosed;
                    }
                },
            }
        };

        drop(relay);
        for result in join_all(workers).await {
            if let Err(err) = result {
                error!(error = err.to_string(), "worker task failed");
            }
        }
        info!("all workers drained");

        Ok(exit)
    }
}
