// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Forwarding Worker
//!
//! Workers pull deliveries from the relay queue, forward each one to the sink
//! and settle it with exactly one disposition: ack when the sink answered
//! 2xx, reject (without requeue) otherwise.

use crate::{
    broker::Delivery,
    converter::MessageConverter,
    errors::AdapterError,
    http::HttpDispatcher,
    reporter::{ReportArgs, StatsReporter},
    retry::RetryPolicy,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

/// Receiving side of the relay queue, shared by every worker.
pub type RelayReceiver = Arc<Mutex<mpsc::Receiver<Box<dyn Delivery>>>>;

/// Result of forwarding one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    pub succeeded: bool,
    pub http_status: Option<u16>,
    pub error: Option<AdapterError>,
}

impl ForwardOutcome {
    fn failed(http_status: Option<u16>, error: AdapterError) -> ForwardOutcome {
        ForwardOutcome {
            succeeded: false,
            http_status,
            error: Some(error),
        }
    }
}

/// Everything a worker needs to forward a delivery; shared by the pool.
pub struct Forwarder {
    http: Arc<HttpDispatcher>,
    policy: RetryPolicy,
    converter: Arc<dyn MessageConverter>,
    reporter: Arc<dyn StatsReporter>,
    report_args: ReportArgs,
}

impl Forwarder {
    pub fn new(
        http: Arc<HttpDispatcher>,
        policy: RetryPolicy,
        converter: Arc<dyn MessageConverter>,
        reporter: Arc<dyn StatsReporter>,
        report_args: ReportArgs,
    ) -> Forwarder {
        Forwarder {
            http,
            policy,
            converter,
            reporter,
            report_args,
        }
    }

    /// Converts and sends one delivery; never touches its disposition.
    ///
    /// # Parameters
    /// * `delivery` - The delivery to forward to the sink
    ///
    /// # Returns
    /// A [`ForwardOutcome`]: succeeded on a 2xx answer, otherwise carrying the
    /// observed status and the conversion, send or rejection error
    pub async fn forward(&self, delivery: &dyn Delivery) -> ForwardOutcome {
        debug!(sink = self.http.target(), "forwarding event");

        let request = match self.converter.convert(delivery) {
            Ok(request) => request,
            Err(err) => {
                error!(error = err.to_string(), "error writing event to http");
                return ForwardOutcome::failed(None, err);
            }
        };

        match self.http.send(&request, &self.policy).await {
            Ok(response) if response.is_success() => ForwardOutcome {
                succeeded: true,
                http_status: Some(response.status),
                error: None,
            },
            Ok(response) => {
                error!(status = response.status, "unexpected status code");
                ForwardOutcome::failed(
                    Some(response.status),
                    AdapterError::SinkRejection(response.status),
                )
            }
            Err(err) => ForwardOutcome::failed(None, err),
        }
    }

    /// Forwards a delivery and issues its single disposition.
    ///
    /// A successful forward is acked and counted with the observed status; any
    /// failure is rejected without requeue. Disposition errors are logged only.
    ///
    /// # Parameters
    /// * `delivery` - The delivery owned by the calling worker
    ///
    /// # Returns
    /// The outcome of [`Forwarder::forward`]
    pub async fn process(&self, delivery: &dyn Delivery) -> ForwardOutcome {
        let outcome = self.forward(delivery).await;
        let tag = delivery.delivery_tag();

        if outcome.succeeded {
            info!(delivery_tag = tag, "successfully sent event to sink");
            if let Err(err) = delivery.ack().await {
                error!(error = err.to_string(), delivery_tag = tag, "sending ack failed");
            }
            if let Some(status) = outcome.http_status {
                self.reporter.report_event_count(&self.report_args, status);
            }
        } else {
            let reason = outcome
                .error
                .as_ref()
                .map(|err| err.to_string())
                .unwrap_or_default();
            error!(error = reason, delivery_tag = tag, "sending event to sink failed");
            if let Err(err) = delivery.reject().await {
                error!(error = err.to_string(), delivery_tag = tag, "sending nack failed");
            }
        }

        outcome
    }
}

/// One member of the fixed worker pool.
pub struct ForwardingWorker {
    id: usize,
    forwarder: Arc<Forwarder>,
}

impl ForwardingWorker {
    pub fn new(id: usize, forwarder: Arc<Forwarder>) -> ForwardingWorker {
        ForwardingWorker { id, forwarder }
    }

    /// Processes relay items sequentially until the relay is closed and drained.
    pub async fn run(self, relay: RelayReceiver) {
        debug!(worker = self.id, "worker started");
        loop {
            let next = relay.lock().await.recv().await;
            let Some(delivery) = next else {
                break;
            };

            info!(
                worker = self.id,
                message_id = delivery.message_id().unwrap_or_default(),
                delivery_tag = delivery.delivery_tag(),
                "received"
            );
            self.forwarder.process(delivery.as_ref()).await;
        }
        debug!(worker = self.id, "worker drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{BrokerChannel, BrokerConnection, BrokerConnector},
        converter::BinaryEventConverter,
        http::OutboundRequest,
        memory::{Disposition, MemoryBroker, MemoryMessage},
        reporter::MockStatsReporter,
        retry::{testing::RecordingSleeper, BackoffPolicy},
    };
    use futures_util::StreamExt;
    use std::time::Duration;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    struct BrokenConverter;

    impl MessageConverter for BrokenConverter {
        fn convert(&self, _delivery: &dyn Delivery) -> Result<OutboundRequest, AdapterError> {
            Err(AdapterError::ConversionError("malformed body".to_owned()))
        }
    }

    fn forwarder(
        sink: &str,
        converter: Arc<dyn MessageConverter>,
        reporter: MockStatsReporter,
    ) -> Forwarder {
        let http = HttpDispatcher::new(sink, Duration::from_secs(5))
            .unwrap()
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        Forwarder::new(
            Arc::new(http),
            RetryPolicy::new(2, BackoffPolicy::Linear, Duration::from_millis(1)),
            converter,
            Arc::new(reporter),
            ReportArgs::new("default", "source"),
        )
    }

    async fn single_delivery(broker: &MemoryBroker) -> Box<dyn Delivery> {
        broker.declare_queue("q");
        broker.publish("q", MemoryMessage::new(b"{}").with_id("m-1"));
        let conn = broker.dial("amqp://test").await.unwrap();
        let channel: Arc<dyn BrokerChannel> = conn.open_channel().await.unwrap();
        let mut deliveries = channel.consume("q").await.unwrap();
        deliveries.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn accepted_event_is_acked_and_counted() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut reporter = MockStatsReporter::new();
        reporter
            .expect_report_event_count()
            .withf(|args, status| args.name == "source" && *status == 200)
            .times(1)
            .return_const(());

        let broker = MemoryBroker::new();
        let delivery = single_delivery(&broker).await;
        let forwarder = forwarder(
            &mock_server.uri(),
            Arc::new(BinaryEventConverter::new("source", "default", "q")),
            reporter,
        );

        let outcome = forwarder.process(delivery.as_ref()).await;

        assert!(outcome.succeeded);
        assert_eq!(outcome.http_status, Some(200));
        assert_eq!(broker.dispositions(), vec![(1, Disposition::Ack)]);
    }

    #[tokio::test]
    async fn sink_failure_rejects_without_counting() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&mock_server)
            .await;

        let mut reporter = MockStatsReporter::new();
        reporter.expect_report_event_count().times(0);

        let broker = MemoryBroker::new();
        let delivery = single_delivery(&broker).await;
        let forwarder = forwarder(
            &mock_server.uri(),
            Arc::new(BinaryEventConverter::new("source", "default", "q")),
            reporter,
        );

        let outcome = forwarder.process(delivery.as_ref()).await;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.http_status, Some(500));
        assert_eq!(outcome.error, Some(AdapterError::SinkRejection(500)));
        assert_eq!(broker.dispositions(), vec![(1, Disposition::Reject)]);
    }

    #[tokio::test]
    async fn conversion_failure_rejects_without_sending() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let mut reporter = MockStatsReporter::new();
        reporter.expect_report_event_count().times(0);

        let broker = MemoryBroker::new();
        let delivery = single_delivery(&broker).await;
        let forwarder = forwarder(&mock_server.uri(), Arc::new(BrokenConverter), reporter);

        let outcome = forwarder.process(delivery.as_ref()).await;

        assert!(matches!(outcome.error, Some(AdapterError::ConversionError(_))));
        assert_eq!(broker.dispositions(), vec![(1, Disposition::Reject)]);
    }

    #[tokio::test]
    async fn unreachable_sink_rejects_delivery() {
        let mut reporter = MockStatsReporter::new();
        reporter.expect_report_event_count().times(0);

        let broker = MemoryBroker::new();
        let delivery = single_delivery(&broker).await;
        let forwarder = forwarder(
            "http://127.0.0.1:1",
            Arc::new(BinaryEventConverter::new("source", "default", "q")),
            reporter,
        );

        let outcome = forwarder.process(delivery.as_ref()).await;

        assert!(matches!(outcome.error, Some(AdapterError::SendError(_))));
        assert_eq!(outcome.http_status, None);
        assert_eq!(broker.dispositions(), vec![(1, Disposition::Reject)]);
    }
}
