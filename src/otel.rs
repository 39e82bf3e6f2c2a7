// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Context Propagation
//!
//! Carries the trace context found in broker message headers over to the
//! outbound HTTP request, using whichever text map propagator is installed
//! globally.

use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use tracing::warn;

/// Reads trace context from the string headers of a delivery.
pub(crate) struct DeliveryHeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> DeliveryHeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for DeliveryHeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|key| key.as_str()).collect()
    }
}

/// Writes trace context into outbound HTTP headers.
pub(crate) struct HttpHeaderInjector<'a> {
    headers: &'a mut HeaderMap,
}

impl<'a> HttpHeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut HeaderMap) -> Self {
        Self { headers }
    }
}

impl Injector for HttpHeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        match (
            HeaderName::from_bytes(key.to_lowercase().as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => warn!(key, "dropping trace header that is not valid HTTP"),
        }
    }
}

/// Copies the trace context of `incoming` into `outgoing`.
pub fn propagate_trace_context(incoming: &BTreeMap<String, String>, outgoing: &mut HeaderMap) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&DeliveryHeaderExtractor::new(incoming))
    });

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HttpHeaderInjector::new(outgoing))
    });
}
