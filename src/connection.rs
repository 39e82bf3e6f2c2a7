// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Coordinator
//!
//! This module establishes the broker connection and the channel shared by the
//! forwarding pipeline. Failed dials are retried on the reconnect
//! [`RetryPolicy`] schedule; whether to keep retrying is decided by an
//! injectable [`RetryController`], which keeps attempt cadence separate from
//! the decision to give up.

use crate::{
    broker::{BrokerChannel, BrokerConnection, BrokerConnector},
    endpoint::BrokerEndpoint,
    errors::AdapterError,
    retry::{RetryPolicy, Sleeper},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of the coordinator's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Failed dial bookkeeping, handed to the retry controller after each failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryAttempt {
    pub counter: u64,
    pub last_error: Option<String>,
}

/// Decides whether the reconnect loop keeps going after a failed dial.
#[async_trait]
pub trait RetryController: Send + Sync {
    async fn on_retry(&self, attempt: &RetryAttempt) -> bool;
}

/// Retries forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

#[async_trait]
impl RetryController for AlwaysRetry {
    async fn on_retry(&self, _attempt: &RetryAttempt) -> bool {
        true
    }
}

/// Gives up once `max_failures` dials have failed.
#[derive(Debug, Clone, Copy)]
pub struct BoundedRetry {
    pub max_failures: u64,
}

#[async_trait]
impl RetryController for BoundedRetry {
    async fn on_retry(&self, attempt: &RetryAttempt) -> bool {
        attempt.counter < self.max_failures
    }
}

/// Publishes every failed attempt and waits for an external continue/stop decision.
pub struct SignalRetryController {
    notifications: mpsc::UnboundedSender<RetryAttempt>,
    decisions: Mutex<mpsc::UnboundedReceiver<bool>>,
}

/// External side of a [`SignalRetryController`].
pub struct RetrySignals {
    notifications: mpsc::UnboundedReceiver<RetryAttempt>,
    decisions: mpsc::UnboundedSender<bool>,
}

impl SignalRetryController {
    pub fn new() -> (SignalRetryController, RetrySignals) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (decide_tx, decide_rx) = mpsc::unbounded_channel();
        (
            SignalRetryController {
                notifications: notify_tx,
                decisions: Mutex::new(decide_rx),
            },
            RetrySignals {
                notifications: notify_rx,
                decisions: decide_tx,
            },
        )
    }
}

#[async_trait]
impl RetryController for SignalRetryController {
    async fn on_retry(&self, attempt: &RetryAttempt) -> bool {
        if self.notifications.send(attempt.clone()).is_err() {
            return false;
        }
        // a dropped signal handle means nobody will ever decide
        self.decisions.lock().await.recv().await.unwrap_or(false)
    }
}

impl RetrySignals {
    /// Waits for the next failed attempt; `None` once the controller is gone.
    pub async fn next_attempt(&mut self) -> Option<RetryAttempt> {
        self.notifications.recv().await
    }

    /// Tells the reconnect loop whether to keep retrying.
    pub fn signal(&self, keep_retrying: bool) {
        let _ = self.decisions.send(keep_retrying);
    }
}

/// Connection and channel produced by a successful [`ConnectionCoordinator::connect`].
#[derive(Clone)]
pub struct Session {
    pub connection: Arc<dyn BrokerConnection>,
    pub channel: Arc<dyn BrokerChannel>,
}

/// Establishes the broker session with retry-on-failure.
pub struct ConnectionCoordinator {
    connector: Arc<dyn BrokerConnector>,
    policy: RetryPolicy,
    controller: Arc<dyn RetryController>,
    sleeper: Arc<dyn Sleeper>,
    prefetch: u16,
    state: ConnectionState,
    attempt: RetryAttempt,
}

impl ConnectionCoordinator {
    /// Creates a coordinator whose channels prefetch `prefetch` deliveries.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        policy: RetryPolicy,
        controller: Arc<dyn RetryController>,
        sleeper: Arc<dyn Sleeper>,
        prefetch: u16,
    ) -> ConnectionCoordinator {
        ConnectionCoordinator {
            connector,
            policy,
            controller,
            sleeper,
            prefetch,
            state: ConnectionState::Disconnected,
            attempt: RetryAttempt::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed dial bookkeeping since this coordinator was created.
    pub fn attempt(&self) -> &RetryAttempt {
        &self.attempt
    }

    /// Dials until a connection and its channel are up, or retrying is stopped.
    ///
    /// A failure to open the channel or to apply QoS counts as a failed
    /// attempt just like a refused dial. Retrying stops when the controller
    /// declines another attempt or when `stop` is cancelled, including while
    /// the controller is still deciding.
    ///
    /// # Parameters
    /// * `endpoint` - Broker address and virtual host to dial
    /// * `stop` - Shutdown token; cancelling it ends the reconnect loop
    ///
    /// # Returns
    /// The established [`Session`], or `RetriesStopped` carrying the attempt
    /// counter and the last dial error
    pub async fn connect(
        &mut self,
        endpoint: &BrokerEndpoint,
        stop: &CancellationToken,
    ) -> Result<Session, AdapterError> {
        let uri = endpoint.uri();

        loop {
            self.state = ConnectionState::Connecting;
            match self.try_connect(&uri).await {
                Ok(session) => {
                    self.state = ConnectionState::Connected;
                    info!(attempts = self.attempt.counter, "broker session established");
                    return Ok(session);
                }
                Err(err) => {
                    self.state = ConnectionState::Disconnected;
                    self.attempt.counter += 1;
                    self.attempt.last_error = Some(err.to_string());
                    error!(
                        error = err.to_string(),
                        attempt = self.attempt.counter,
                        "failure to establish broker session"
                    );
                }
            }

            if stop.is_cancelled() {
                return Err(self.stopped());
            }
            // the stop token must win even while an external decision is pending
            let keep_retrying = tokio::select! {
                biased;
                _ = stop.cancelled() => false,
                keep = self.controller.on_retry(&self.attempt) => keep,
            };
            if !keep_retrying {
                return Err(self.stopped());
            }

            let delay = self.policy.delay_for(retry_number(self.attempt.counter));
            debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnecting");
            tokio::select! {
                _ = stop.cancelled() => return Err(self.stopped()),
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }

    async fn try_connect(&self, uri: &str) -> Result<Session, AdapterError> {
        let connection = self.connector.dial(uri).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close().await;
                return Err(err);
            }
        };

        info!(parallelism = self.prefetch, "initializing channel");
        if let Err(err) = channel.qos(self.prefetch).await {
            let _ = channel.close().await;
            let _ = connection.close().await;
            return Err(err);
        }

        Ok(Session {
            connection,
            channel,
        })
    }

    fn stopped(&self) -> AdapterError {
        warn!(attempts = self.attempt.counter, "stopped retrying broker connection");
        AdapterError::RetriesStopped {
            attempts: self.attempt.counter,
            last_error: self.attempt.last_error.clone().unwrap_or_default(),
        }
    }

    /// Closes the channel, then the connection, tolerating either being closed already.
    pub async fn cleanup(&mut self, session: Session) {
        if let Err(err) = session.channel.close().await {
            debug!(error = err.to_string(), "channel already closed");
        }
        if let Err(err) = session.connection.close().await {
            debug!(error = err.to_string(), "connection already closed");
        }
        self.state = ConnectionState::Closed;
    }
}

fn retry_number(counter: u64) -> u32 {
    u32::try_from(counter).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryBroker,
        retry::{testing::RecordingSleeper, BackoffPolicy},
    };
    use std::time::Duration;

    fn coordinator(
        broker: &MemoryBroker,
        controller: Arc<dyn RetryController>,
        sleeper: Arc<RecordingSleeper>,
    ) -> ConnectionCoordinator {
        ConnectionCoordinator::new(
            Arc::new(broker.clone()),
            RetryPolicy::new(0, BackoffPolicy::Exponential, Duration::from_millis(10)),
            controller,
            sleeper,
            4,
        )
    }

    #[tokio::test]
    async fn connects_and_applies_prefetch() {
        let broker = MemoryBroker::new();
        let mut coordinator = coordinator(
            &broker,
            Arc::new(AlwaysRetry),
            Arc::new(RecordingSleeper::default()),
        );

        let session = coordinator
            .connect(&BrokerEndpoint::new("amqp://host", "v"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(coordinator.state(), ConnectionState::Connected);
        assert_eq!(broker.prefetch(), Some(4));
        assert_eq!(broker.last_uri().as_deref(), Some("amqp://host/v"));

        coordinator.cleanup(session.clone()).await;
        assert_eq!(coordinator.state(), ConnectionState::Closed);
        assert!(broker.channel_closed());
        assert!(broker.connection_closed());

        // a second cleanup finds both already closed and still succeeds
        coordinator.cleanup(session).await;
        assert_eq!(coordinator.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn retries_with_backoff_until_connected() {
        let broker = MemoryBroker::new().fail_dials(3);
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut coordinator = coordinator(&broker, Arc::new(AlwaysRetry), sleeper.clone());

        coordinator
            .connect(&BrokerEndpoint::new("amqp://host", ""), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(coordinator.attempt().counter, 3);
        assert_eq!(broker.dials(), 4);
        assert_eq!(
            sleeper.waits(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[tokio::test]
    async fn bounded_retry_returns_last_error() {
        let broker = MemoryBroker::new().refuse_dials();
        let mut coordinator = coordinator(
            &broker,
            Arc::new(BoundedRetry { max_failures: 2 }),
            Arc::new(RecordingSleeper::default()),
        );

        let err = coordinator
            .connect(&BrokerEndpoint::new("amqp://host", ""), &CancellationToken::new())
            .await
            .err()
            .unwrap();

        match err {
            AdapterError::RetriesStopped {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(coordinator.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn counter_increases_until_told_to_stop() {
        let broker = MemoryBroker::new().refuse_dials();
        let (controller, mut signals) = SignalRetryController::new();
        let mut coordinator = coordinator(
            &broker,
            Arc::new(controller),
            Arc::new(RecordingSleeper::default()),
        );

        let handle = tokio::spawn(async move {
            let result = coordinator
                .connect(&BrokerEndpoint::new("amqp://host", ""), &CancellationToken::new())
                .await;
            (result, coordinator.attempt().counter)
        });

        let mut seen = vec![];
        for _ in 0..3 {
            let attempt = signals.next_attempt().await.unwrap();
            seen.push(attempt.counter);
            assert!(!handle.is_finished());
            signals.signal(true);
        }
        let last = signals.next_attempt().await.unwrap();
        seen.push(last.counter);
        signals.signal(false);

        let (result, counter) = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(counter, 4);
    }

    #[tokio::test]
    async fn stop_signal_interrupts_pending_retry_decision() {
        let broker = MemoryBroker::new().refuse_dials();
        let (controller, mut signals) = SignalRetryController::new();
        let mut coordinator = coordinator(
            &broker,
            Arc::new(controller),
            Arc::new(RecordingSleeper::default()),
        );
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            coordinator
                .connect(&BrokerEndpoint::new("amqp://host", ""), &token)
                .await
        });

        let attempt = signals.next_attempt().await.unwrap();
        assert_eq!(attempt.counter, 1);
        // nobody answers the decision; only the stop token is raised
        stop.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("connect must return once stopped")
            .unwrap();
        assert!(matches!(result, Err(AdapterError::RetriesStopped { attempts: 1, .. })));
        assert_eq!(broker.dials(), 1);
    }

    #[tokio::test]
    async fn stop_signal_ends_retrying() {
        let broker = MemoryBroker::new().refuse_dials();
        let stop = CancellationToken::new();
        stop.cancel();
        let mut coordinator = coordinator(
            &broker,
            Arc::new(AlwaysRetry),
            Arc::new(RecordingSleeper::default()),
        );

        let result = coordinator
            .connect(&BrokerEndpoint::new("amqp://host", ""), &stop)
            .await;

        assert!(matches!(result, Err(AdapterError::RetriesStopped { attempts: 1, .. })));
        assert_eq!(broker.dials(), 1);
    }
}
