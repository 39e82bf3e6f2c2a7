// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Count Reporting
//!
//! One counter report is emitted for every event the sink accepted, keyed by
//! the source identity and the observed HTTP status.

use opentelemetry::{global, metrics::Counter, KeyValue};
use tracing::debug;

/// Resource group identifying RabbitMQ sources.
pub const RESOURCE_GROUP: &str = "rabbitmqsources.sources.knative.dev";

/// Identity under which forwarded events are counted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportArgs {
    pub namespace: String,
    pub name: String,
    pub resource_group: String,
}

impl ReportArgs {
    pub fn new(namespace: &str, name: &str) -> ReportArgs {
        ReportArgs {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            resource_group: RESOURCE_GROUP.to_owned(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait StatsReporter: Send + Sync {
    fn report_event_count(&self, args: &ReportArgs, status: u16);
}

/// Reports through the globally installed OpenTelemetry meter provider.
pub struct OtelStatsReporter {
    counter: Counter<u64>,
}

impl Default for OtelStatsReporter {
    fn default() -> Self {
        OtelStatsReporter::new()
    }
}

impl OtelStatsReporter {
    pub fn new() -> OtelStatsReporter {
        let counter = global::meter("rabbitmq-source")
            .u64_counter("event_count")
            .with_description("Number of events sent to the sink")
            .build();

        OtelStatsReporter { counter }
    }
}

impl StatsReporter for OtelStatsReporter {
    fn report_event_count(&self, args: &ReportArgs, status: u16) {
        debug!(
            namespace = %args.namespace,
            name = %args.name,
            status,
            "reporting event count"
        );
        self.counter.add(
            1,
            &[
                KeyValue::new("namespace", args.namespace.clone()),
                KeyValue::new("name", args.name.clone()),
                KeyValue::new("resource_group", args.resource_group.clone()),
                KeyValue::new("response_code", i64::from(status)),
                KeyValue::new("response_code_class", response_code_class(status)),
            ],
        );
    }
}

fn response_code_class(status: u16) -> String {
    format!("{}xx", status / 100)
}
