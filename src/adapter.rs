// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Source Adapter
//!
//! Wires the pipeline together: connection coordinator, consumption
//! dispatcher, forwarding workers and HTTP dispatcher. The broker variant is
//! chosen by the connector handed to [`Adapter::new`].

use crate::{
    broker::BrokerConnector,
    config::AdapterConfig,
    connection::{AlwaysRetry, BoundedRetry, ConnectionCoordinator, RetryController},
    converter::{BinaryEventConverter, MessageConverter},
    dispatcher::{ConsumptionDispatcher, DispatchExit},
    errors::AdapterError,
    http::HttpDispatcher,
    reporter::{OtelStatsReporter, ReportArgs, StatsReporter},
    retry::{RetryPolicy, Sleeper, TokioSleeper},
    worker::Forwarder,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Adapter {
    config: AdapterConfig,
    connector: Arc<dyn BrokerConnector>,
    controller: Arc<dyn RetryController>,
    sleeper: Arc<dyn Sleeper>,
    http: Arc<HttpDispatcher>,
    send_policy: RetryPolicy,
    converter: Arc<dyn MessageConverter>,
    reporter: Arc<dyn StatsReporter>,
}

impl Adapter {
    /// Validates `config` and builds an adapter with the default collaborators.
    pub fn new(
        config: AdapterConfig,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Adapter, AdapterError> {
        config.validate()?;

        let send_policy = config.sender_retry_policy()?;
        let http = HttpDispatcher::new(&config.sink, config.http_timeout()?)?;
        let controller: Arc<dyn RetryController> = match config.reconnect_attempts {
            0 => Arc::new(AlwaysRetry),
            max_failures => Arc::new(BoundedRetry { max_failures }),
        };
        let converter = Arc::new(BinaryEventConverter::new(
            &config.name,
            &config.namespace,
            &config.queue_name,
        ));

        Ok(Adapter {
            config,
            connector,
            controller,
            sleeper: Arc::new(TokioSleeper),
            http: Arc::new(http),
            send_policy,
            converter,
            reporter: Arc::new(OtelStatsReporter::new()),
        })
    }

    pub fn with_retry_controller(mut self, controller: Arc<dyn RetryController>) -> Self {
        self.controller = controller;
        self
    }

    /// Clock used between reconnect attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn MessageConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StatsReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Runs until `stop` is cancelled.
    ///
    /// When the broker ends the delivery stream without a stop request the
    /// session is cleaned up and the adapter reconnects on the reconnect
    /// policy. Per-message failures never surface here.
    ///
    /// # Parameters
    /// * `stop` - Shutdown token, the only way to end a healthy run
    ///
    /// # Returns
    /// Ok(()) after a requested stop has drained every admitted delivery, or
    /// the error that ended the run: reconnection abandoned or the consumer
    /// could not be registered
    pub async fn start(&self, stop: CancellationToken) -> Result<(), AdapterError> {
        info!(
            name = %self.config.name,
            namespace = %self.config.namespace,
            queue = %self.config.queue_name,
            sink = %self.config.sink,
            "starting with config"
        );

        let mut coordinator = ConnectionCoordinator::new(
            self.connector.clone(),
            self.config.reconnect_retry_policy()?,
            self.controller.clone(),
            self.sleeper.clone(),
            self.config.prefetch()?,
        );
        let endpoint = self.config.endpoint();
        let forwarder = Arc::new(Forwarder::new(
            self.http.clone(),
            self.send_policy.clone(),
            self.converter.clone(),
            self.reporter.clone(),
            ReportArgs::new(&self.config.namespace, &self.config.name),
        ));

        loop {
            let session = coordinator.connect(&endpoint, &stop).await?;
            let dispatcher = ConsumptionDispatcher::new(
                session.channel.clone(),
                &self.config.queue_name,
                self.config.parallelism,
                forwarder.clone(),
            );

            let result = dispatcher.run(stop.clone()).await;
            coordinator.cleanup(session).await;

            match result {
                Ok(DispatchExit::StreamClosed) if !stop.is_cancelled() => {
                    warn!(queue = %self.config.queue_name, "lost broker session, reconnecting");
                }
                Ok(_) => {
                    info!("adapter stopped");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{Disposition, MemoryBroker, MemoryMessage},
        reporter::MockStatsReporter,
        retry::testing::RecordingSleeper,
    };
    use std::{collections::HashSet, time::Duration};
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    async fn wait_for_dispositions(broker: &MemoryBroker, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while broker.dispositions().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deliveries were not settled in time");
    }

    async fn accepting_sink() -> MockServer {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        mock_server
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = AdapterConfig::new("amqp://localhost", "q", "http://sink");
        config.backoff_policy = "sometimes".to_owned();

        let result = Adapter::new(config, Arc::new(MemoryBroker::new()));

        assert!(matches!(result, Err(AdapterError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn forwards_after_reconnecting() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("ce-id", "order-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let broker = MemoryBroker::new().fail_dials(2);
        broker.declare_queue("orders");
        broker.publish("orders", MemoryMessage::new(b"{}").with_id("order-1"));

        let mut reporter = MockStatsReporter::new();
        reporter
            .expect_report_event_count()
            .withf(|args, status| args.namespace == "default" && *status == 200)
            .times(1)
            .return_const(());

        let mut config = AdapterConfig::new("amqp://localhost:5672", "orders", &mock_server.uri());
        config.vhost = "tenant".to_owned();
        config.namespace = "default".to_owned();
        config.parallelism = 2;
        let sleeper = Arc::new(RecordingSleeper::default());
        let adapter = Adapter::new(config, Arc::new(broker.clone()))
            .unwrap()
            .with_sleeper(sleeper.clone())
            .with_reporter(Arc::new(reporter));

        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let stop = stop.clone();
            async move { adapter.start(stop).await }
        });
        wait_for_dispositions(&broker, 1).await;
        stop.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(broker.dials(), 3);
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(1); 2]);
        assert_eq!(broker.last_uri().as_deref(), Some("amqp://localhost:5672/tenant"));
        assert_eq!(broker.prefetch(), Some(2));
        assert_eq!(broker.dispositions(), vec![(1, Disposition::Ack)]);
        assert!(broker.channel_closed());
        assert!(broker.connection_closed());
    }

    #[tokio::test]
    async fn reconnects_after_losing_the_connection() {
        let mock_server = accepting_sink().await;
        let broker = MemoryBroker::new();
        broker.declare_queue("orders");
        broker.publish("orders", MemoryMessage::new(b"{}").with_id("order-1"));
        broker.publish("orders", MemoryMessage::new(b"{}").with_id("order-2"));

        let config = AdapterConfig::new("amqp://localhost", "orders", &mock_server.uri());
        let adapter = Adapter::new(config, Arc::new(broker.clone()))
            .unwrap()
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        let stop = CancellationToken::new();
        let run = tokio::spawn({
            let stop = stop.clone();
            async move { adapter.start(stop).await }
        });

        wait_for_dispositions(&broker, 2).await;
        broker.drop_connection();
        broker.publish("orders", MemoryMessage::new(b"{}").with_id("order-3"));
        broker.publish("orders", MemoryMessage::new(b"{}").with_id("order-4"));
        wait_for_dispositions(&broker, 4).await;
        assert!(!run.is_finished());

        stop.cancel();
        run.await.unwrap().unwrap();

        let dispositions = broker.dispositions();
        let tags = dispositions.iter().map(|(tag, _)| *tag).collect::<HashSet<_>>();
        assert_eq!(tags.len(), 4);
        assert!(dispositions.iter().all(|(_, d)| *d == Disposition::Ack));
        assert_eq!(broker.dials(), 2);
        assert!(broker.channel_closed());
        assert!(broker.connection_closed());
    }

    #[tokio::test]
    async fn deleted_queue_ends_the_run_with_an_error() {
        let mock_server = accepting_sink().await;
        let broker = MemoryBroker::new();
        broker.declare_queue("orders");
        broker.publish("orders", MemoryMessage::new(b"{}"));
        broker.close_queue("orders");

        let config = AdapterConfig::new("amqp://localhost", "orders", &mock_server.uri());
        let adapter = Adapter::new(config, Arc::new(broker.clone())).unwrap();

        let result = adapter.start(CancellationToken::new()).await;

        assert!(matches!(result, Err(AdapterError::ConsumerDeclarationError(_))));
        assert_eq!(broker.dispositions(), vec![(1, Disposition::Ack)]);
        assert_eq!(broker.dials(), 2);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_reconnects() {
        let broker = MemoryBroker::new().refuse_dials();
        let mut config = AdapterConfig::new("amqp://localhost", "orders", "http://127.0.0.1:1");
        config.reconnect_attempts = 3;
        let adapter = Adapter::new(config, Arc::new(broker.clone()))
            .unwrap()
            .with_sleeper(Arc::new(RecordingSleeper::default()));

        let result = adapter.start(CancellationToken::new()).await;

        assert!(matches!(result, Err(AdapterError::RetriesStopped { attempts: 3, .. })));
        assert_eq!(broker.dials(), 3);
    }
}
