// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use clap::Parser;
use opentelemetry::global;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use rabbitmq_source::{adapter::Adapter, amqp::LapinConnector, config::AdapterConfig};
use std::{process::ExitCode, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = AdapterConfig::parse();
    init_tracing(&config.log_format);
    global::set_text_map_propagator(TraceContextPropagator::new());

    let connector = LapinConnector::new().with_connection_name(&connection_name(&config));
    let adapter = match Adapter::new(config, Arc::new(connector)) {
        Ok(adapter) => adapter,
        Err(err) => {
            error!(error = err.to_string(), "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let stop = CancellationToken::new();
    tokio::spawn(cancel_on_signal(stop.clone()));

    match adapter.start(stop).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = err.to_string(), "adapter stopped with error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn connection_name(config: &AdapterConfig) -> String {
    match config.name.as_str() {
        "" => "rabbitmq-source".to_owned(),
        name => format!("{}/{}", config.namespace, name),
    }
}

async fn cancel_on_signal(stop: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("stop signal received");
    stop.cancel();
}
