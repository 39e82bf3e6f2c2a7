// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod adapter;
pub mod amqp;
pub mod broker;
pub mod config;
pub mod connection;
pub mod converter;
pub mod dispatcher;
pub mod endpoint;
pub mod errors;
pub mod http;
pub mod memory;
pub mod reporter;
pub mod retry;
pub mod worker;
