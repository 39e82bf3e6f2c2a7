// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Conversion
//!
//! Maps a broker delivery onto the outbound HTTP request. The default
//! converter emits a binary-mode CloudEvent: attributes travel as `ce-`
//! headers and the message body is the event data.

use crate::{broker::Delivery, errors::AdapterError, http::OutboundRequest, otel};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Method,
};
use tracing::debug;
use uuid::Uuid;

/// CloudEvents type attached to every forwarded message.
pub const EVENT_TYPE: &str = "dev.knative.rabbitmq.event";
/// Content type assumed when the message does not carry one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

const SPEC_VERSION: &str = "1.0";
const TRACE_HEADERS: [&str; 2] = ["traceparent", "tracestate"];

/// Builds the outbound request for a delivery.
pub trait MessageConverter: Send + Sync {
    fn convert(&self, delivery: &dyn Delivery) -> Result<OutboundRequest, AdapterError>;
}

/// Binary-mode CloudEvents converter.
#[derive(Debug, Clone)]
pub struct BinaryEventConverter {
    source: String,
}

impl BinaryEventConverter {
    pub fn new(name: &str, namespace: &str, queue: &str) -> BinaryEventConverter {
        BinaryEventConverter {
            source: format!(
                "/apis/v1/namespaces/{}/rabbitmqsources/{}#{}",
                namespace, name, queue
            ),
        }
    }
}

impl MessageConverter for BinaryEventConverter {
    fn convert(&self, delivery: &dyn Delivery) -> Result<OutboundRequest, AdapterError> {
        let id = delivery
            .message_id()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let content_type = delivery
            .content_type()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned());

        let mut headers = HeaderMap::new();
        headers.insert("ce-specversion", HeaderValue::from_static(SPEC_VERSION));
        headers.insert("ce-type", HeaderValue::from_static(EVENT_TYPE));
        headers.insert("ce-id", header_value("ce-id", &id)?);
        headers.insert("ce-source", header_value("ce-source", &self.source)?);
        headers.insert(CONTENT_TYPE, header_value("content-type", &content_type)?);

        let message_headers = delivery.headers();
        for (key, value) in &message_headers {
            let key = key.to_ascii_lowercase();
            if TRACE_HEADERS.contains(&key.as_str()) || !is_extension_name(&key) {
                debug!(header = %key, "skipping header that is not a valid extension");
                continue;
            }
            let name = format!("ce-{}", key);
            // core attributes set above win over message headers
            if headers.contains_key(name.as_str()) {
                continue;
            }
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| AdapterError::ConversionError(err.to_string()))?;
            headers.insert(header, header_value(&name, value)?);
        }

        otel::propagate_trace_context(&message_headers, &mut headers);

        Ok(OutboundRequest {
            method: Method::POST,
            headers,
            body: delivery.body().to_vec(),
        })
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, AdapterError> {
    HeaderValue::from_str(value).map_err(|_| {
        AdapterError::ConversionError(format!("`{}` is not a valid value for {}", value, name))
    })
}

/// Extension attribute names are lower-case alphanumerics.
fn is_extension_name(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}
