use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::{ConsumerGroupClient, RebalanceListener};
use crate::config::Config;
use crate::error::ConsumerError;
use crate::kafka::assignments::ActiveAssignments;
use crate::kafka::group_client::KafkaGroupClient;
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::partition_worker::PartitionWorkerConfig;
use crate::kafka::types::TopicPartition;
use crate::poll_loop::{PollLoop, PollLoopConfig};
use crate::rebalance_coordinator::RebalanceCoordinator;
use crate::registry::{RecordHandler, RecordHandlerRegistry};

#[derive(Debug, Clone, Default)]
pub struct SplitConsumerConfig {
    pub poll: PollLoopConfig,
    pub worker: PartitionWorkerConfig,
}

/// Consumes a consumer group's partitions with one ordered worker per partition.
///
/// Handlers are registered per topic with [`set_record_handler`](Self::set_record_handler),
/// then [`poll`](Self::poll) drives fetching until the client is shut down or the
/// cancellation token fires.
pub struct SplitConsumerClient<C: ConsumerGroupClient + 'static> {
    client: Arc<C>,
    handlers: Arc<RecordHandlerRegistry>,
    coordinator: Arc<RebalanceCoordinator>,
    config: SplitConsumerConfig,
    polling: AtomicBool,
    shut_down: AtomicBool,
}

impl<C: ConsumerGroupClient + 'static> SplitConsumerClient<C> {
    /// Build a split consumer over the client returned by `connect`.
    ///
    /// `connect` receives the listener the client must deliver rebalance events to.
    /// Must be called from within a tokio runtime, which hosts the partition workers.
    pub fn new<F>(config: SplitConsumerConfig, connect: F) -> Result<Self, ConsumerError>
    where
        F: FnOnce(Arc<dyn RebalanceListener>) -> Result<C, ConsumerError>,
    {
        let rt = Handle::try_current().map_err(|_| ConsumerError::NoRuntime)?;

        let handlers = Arc::new(RecordHandlerRegistry::new());
        let coordinator = Arc::new(RebalanceCoordinator::new(
            handlers.clone(),
            Arc::new(ActiveAssignments::new()),
            Arc::new(OffsetTracker::new()),
            config.worker.clone(),
            rt,
        ));
        let listener: Arc<dyn RebalanceListener> = coordinator.clone();
        let client = Arc::new(connect(listener)?);

        Ok(Self {
            client,
            handlers,
            coordinator,
            config,
            polling: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Register the handler for a topic and subscribe to it.
    ///
    /// A later registration for the same topic replaces the earlier handler.
    /// If the subscription fails the registration is undone.
    pub fn set_record_handler(
        &self,
        topic: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<(), ConsumerError> {
        // Registered first: a running poll may be assigned the topic as soon as it is subscribed
        let previous = self.handlers.register(topic, handler)?;
        if let Err(e) = self.client.add_consume_topic(topic) {
            warn!(topic, error = %e, "Failed to subscribe, restoring previous record handler");
            self.handlers.restore(topic, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Run the poll loop until the client closes, a fetch fails, or `cancel` fires.
    ///
    /// The loop runs on a blocking thread since rebalance callbacks block it while
    /// partitions drain.
    pub async fn poll(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        if self.polling.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyPolling);
        }

        let mut poll_loop = PollLoop::new(
            self.client.clone(),
            self.coordinator.clone(),
            self.config.poll.clone(),
            cancel,
        );
        let result = tokio::task::spawn_blocking(move || poll_loop.run())
            .await
            .map_err(|e| ConsumerError::PollTask(e.to_string()))
            .and_then(|r| r);

        self.polling.store(false, Ordering::SeqCst);
        result
    }

    /// Ask the client to leave the group. Safe to call more than once.
    ///
    /// Leaving happens inside [`poll`](Self::poll): a rebalance already in flight
    /// completes first, then the revoke of every partition drains and commits, and
    /// the poll loop returns. If no poll is running, for example after a fetch
    /// error stopped it, call `poll` again to leave the group cleanly. Otherwise the
    /// member stays in the group until the client is dropped.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            warn!("Split consumer shutdown already requested");
            return;
        }

        info!("Shutting down split consumer");
        self.client.close_allowing_rebalance();
    }

    pub fn active_partitions(&self) -> Vec<TopicPartition> {
        self.coordinator.assignments().partitions()
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }
}

impl SplitConsumerClient<KafkaGroupClient> {
    /// Connect a split consumer to the Kafka cluster described by `config`
    pub fn connect(config: &Config) -> Result<Self, ConsumerError> {
        config.validate()?;
        let client_config = config.build_client_config();
        let group_client_config = config.group_client_config();

        Self::new(config.split_consumer_config(), move |listener| {
            KafkaGroupClient::connect(&client_config, listener, group_client_config)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockGroupClient, RecordingHandler};

    fn mock_consumer() -> SplitConsumerClient<MockGroupClient> {
        SplitConsumerClient::new(SplitConsumerConfig::default(), |listener| {
            Ok(MockGroupClient::new(listener))
        })
        .unwrap()
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = SplitConsumerClient::new(SplitConsumerConfig::default(), |listener| {
            Ok(MockGroupClient::new(listener))
        });

        assert!(matches!(result, Err(ConsumerError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_set_record_handler_subscribes_topic() {
        let consumer = mock_consumer();

        consumer
            .set_record_handler("emails", Arc::new(RecordingHandler::new()))
            .unwrap();

        assert_eq!(consumer.client().subscribed_topics(), vec!["emails".to_string()]);
    }

    #[tokio::test]
    async fn test_set_record_handler_rejects_empty_topic() {
        let consumer = mock_consumer();

        let result = consumer.set_record_handler("", Arc::new(RecordingHandler::new()));

        assert!(matches!(result, Err(ConsumerError::InvalidArgument(_))));
        assert!(consumer.client().subscribed_topics().is_empty());
    }

    #[tokio::test]
    async fn test_failed_subscription_restores_handlers() {
        let consumer = mock_consumer();
        let original: Arc<dyn RecordHandler> = Arc::new(RecordingHandler::new());
        consumer
            .set_record_handler("emails", original.clone())
            .unwrap();

        consumer.client().set_fail_subscribe(true);
        let replaced = consumer.set_record_handler("emails", Arc::new(RecordingHandler::new()));
        let added = consumer.set_record_handler("chat", Arc::new(RecordingHandler::new()));

        assert!(matches!(replaced, Err(ConsumerError::Kafka(_))));
        assert!(matches!(added, Err(ConsumerError::Kafka(_))));
        assert!(Arc::ptr_eq(&consumer.handlers.get("emails").unwrap(), &original));
        assert!(consumer.handlers.get("chat").is_none());
        assert_eq!(consumer.client().subscribed_topics(), vec!["emails".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let consumer = mock_consumer();

        consumer.shutdown();
        consumer.shutdown();

        assert_eq!(consumer.client().close_count(), 1);
    }
}
