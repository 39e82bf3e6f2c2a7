// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Endpoint
//!
//! Composition of the broker connection string from a base URL and an
//! optional virtual host.

/// Location of the broker: base URL plus virtual host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub base_url: String,
    pub virtual_host: String,
}

impl BrokerEndpoint {
    pub fn new(base_url: &str, virtual_host: &str) -> BrokerEndpoint {
        BrokerEndpoint {
            base_url: base_url.to_owned(),
            virtual_host: virtual_host.to_owned(),
        }
    }

    /// Returns the connection string for this endpoint.
    pub fn uri(&self) -> String {
        compose_endpoint(&self.base_url, &self.virtual_host)
    }
}

/// Appends a virtual host to a broker base URL.
///
/// A single `/` separator is inserted only when neither side already
/// provides one; an empty virtual host leaves the base untouched.
pub fn compose_endpoint(base: &str, vhost: &str) -> String {
    if vhost.is_empty() {
        return base.to_owned();
    }

    if !base.ends_with('/') && !vhost.starts_with('/') {
        return format!("{}/{}", base, vhost);
    }

    format!("{}{}", base, vhost)
}
