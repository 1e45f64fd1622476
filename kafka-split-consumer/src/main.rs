use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{routing::get, Router};
use futures::future::ready;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kafka_split_consumer::config::Config;
use kafka_split_consumer::kafka::Record;
use kafka_split_consumer::metrics_server::{serve, setup_metrics_routes};
use kafka_split_consumer::shutdown::GracefulShutdown;
use kafka_split_consumer::{RecordHandler, SplitConsumerClient};

pub async fn index() -> &'static str {
    "kafka split consumer"
}

/// Logs each record it receives
struct LoggingHandler;

#[async_trait]
impl RecordHandler for LoggingHandler {
    async fn handle(&self, record: &Record) -> Result<()> {
        info!(
            topic = record.topic(),
            partition = record.partition(),
            offset = record.offset(),
            payload_bytes = record.payload().map_or(0, |p| p.len()),
            "Received record"
        );
        Ok(())
    }
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")));
    let router = setup_metrics_routes(router)?;

    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(error = %e, "Metrics server failed");
        }
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("Starting Kafka split consumer");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;
    info!("Configuration loaded: {:?}", config);

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    let consumer = Arc::new(
        SplitConsumerClient::connect(&config)
            .context("Failed to create split consumer. Check your Kafka connection settings.")?,
    );

    for topic in config.topics() {
        consumer.set_record_handler(&topic, Arc::new(LoggingHandler))?;
    }

    let cancel = CancellationToken::new();
    let mut poll_task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.poll(cancel).await })
    };

    let result = tokio::select! {
        result = &mut poll_task => result,
        _ = shutdown_signal() => {
            let mut shutdown = GracefulShutdown::new(config.shutdown_timeout());
            let consumer = consumer.clone();
            shutdown.register("split-consumer", move || async move {
                consumer.shutdown();
                Ok(())
            });
            shutdown.run().await;

            // Leaving the group drains every partition; stop polling if it takes too long
            match tokio::time::timeout(config.shutdown_timeout(), &mut poll_task).await {
                Ok(result) => result,
                Err(_) => {
                    error!("Consumer did not leave the group in time, cancelling poll loop");
                    cancel.cancel();
                    poll_task.await
                }
            }
        }
    };

    let result = result.context("poll task panicked")?;
    server_handle.abort();

    match result {
        Ok(()) => {
            info!("Split consumer stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = ?e, "Split consumer stopped with an error");
            Err(e.into())
        }
    }
}
