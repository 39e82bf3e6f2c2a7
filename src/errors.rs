// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Source Adapter
//!
//! This module provides the error taxonomy shared by every stage of the
//! forwarding pipeline: broker connectivity, consumption, per-message
//! conversion and delivery, and startup configuration.

use thiserror::Error;

/// Represents errors that can occur while forwarding broker messages to a sink.
///
/// Connection errors are retried by the connection coordinator, per-message
/// errors only ever decide the disposition of a single delivery, and
/// configuration errors are fatal before consumption begins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Error dialing the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error opening a channel on an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error inspecting the source queue
    #[error("failure to inspect queue `{0}`")]
    QueueInspectionError(String),

    /// Error registering the consumer on the source queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error reading a delivery from the broker stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// The delivery could not be mapped into an outbound request
    #[error("failure to convert message: {0}")]
    ConversionError(String),

    /// Transport failure once the send retry budget is exhausted
    #[error("failure to send event: {0}")]
    SendError(String),

    /// The sink answered with a non-2xx status
    #[error("sink rejected event with status {0}")]
    SinkRejection(u16),

    /// Invalid startup configuration
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Reconnection was stopped by the retry controller or the stop signal
    #[error("stopped retrying after {attempts} attempts: {last_error}")]
    RetriesStopped { attempts: u64, last_error: String },
}
