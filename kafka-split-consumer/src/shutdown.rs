//! Graceful shutdown - run every registered cleanup concurrently under one deadline

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{error, info, warn};

type ShutdownFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type ShutdownHandler = Box<dyn FnOnce() -> ShutdownFuture + Send>;

pub struct GracefulShutdown {
    timeout: Duration,
    handlers: Vec<(String, ShutdownHandler)>,
}

impl GracefulShutdown {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            handlers: Vec::new(),
        }
    }

    /// Register a cleanup to run at shutdown
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .push((name.into(), Box::new(move || Box::pin(handler()))));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run all handlers concurrently. Returns false when the deadline passed
    /// before every handler finished; failures are logged either way.
    pub async fn run(self) -> bool {
        let started = Instant::now();
        info!(
            handler_count = self.handlers.len(),
            timeout_secs = self.timeout.as_secs(),
            "Starting graceful shutdown"
        );

        let tasks = self.handlers.into_iter().map(|(name, handler)| async move {
            let result = handler().await;
            (name, result)
        });

        match tokio::time::timeout(self.timeout, join_all(tasks)).await {
            Ok(results) => {
                for (name, result) in results {
                    if let Err(e) = result {
                        error!(handler = %name, error = ?e, "Shutdown handler failed");
                    }
                }
                info!(
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Graceful shutdown complete"
                );
                true
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Graceful shutdown timed out"
                );
                false
            }
        }
    }
}
