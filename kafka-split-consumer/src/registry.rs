//! Record handler registry - maps a topic to the function that processes its records

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::ConsumerError;
use crate::kafka::types::Record;

/// Processes records of one topic.
///
/// A returned error is logged by the partition worker and the next record is
/// processed; retries and dead-lettering belong to the implementation.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: &Record) -> Result<()>;
}

/// Adapts a synchronous closure into a [`RecordHandler`].
///
/// The closure runs on tokio's blocking pool, so a handler that blocks on I/O
/// holds up only its own partition.
pub struct FnHandler<F>(Arc<F>);

#[async_trait]
impl<F> RecordHandler for FnHandler<F>
where
    F: Fn(&Record) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, record: &Record) -> Result<()> {
        let f = self.0.clone();
        let record = record.clone();

        match tokio::task::spawn_blocking(move || f(&record)).await {
            Ok(result) => result,
            // Re-raise so the partition worker counts it as a handler panic
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("record handler task was cancelled: {e}")),
        }
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn RecordHandler>
where
    F: Fn(&Record) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(Arc::new(f)))
}

#[derive(Default)]
pub struct RecordHandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn RecordHandler>>>,
}

impl RecordHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a topic, replacing any earlier one.
    ///
    /// Returns the handler that was replaced.
    pub fn register(
        &self,
        topic: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<Option<Arc<dyn RecordHandler>>, ConsumerError> {
        if topic.is_empty() {
            return Err(ConsumerError::InvalidArgument(
                "missing required topic".to_string(),
            ));
        }

        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = handlers.insert(topic.to_string(), handler);
        if previous.is_some() {
            warn!(topic, "Replaced existing record handler");
        } else {
            info!(topic, "Registered record handler");
        }
        Ok(previous)
    }

    /// Put back what `register` replaced, or forget the topic if nothing was
    pub fn restore(&self, topic: &str, previous: Option<Arc<dyn RecordHandler>>) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match previous {
            Some(handler) => {
                handlers.insert(topic.to_string(), handler);
            }
            None => {
                handlers.remove(topic);
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn RecordHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(topic)
            .cloned()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::types::TopicPartition;
    use futures::FutureExt;
    use std::panic::AssertUnwindSafe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn RecordHandler> {
        handler_fn(move |_record| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_register_rejects_empty_topic_without_changes() {
        let registry = RecordHandlerRegistry::new();
        registry
            .register("emails", counting_handler(Arc::default()))
            .unwrap();

        let result = registry.register("", counting_handler(Arc::default()));

        assert!(matches!(result, Err(ConsumerError::InvalidArgument(_))));
        assert_eq!(registry.topics(), vec!["emails".to_string()]);
        assert!(registry.get("").is_none());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = RecordHandlerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        registry
            .register("emails", counting_handler(first.clone()))
            .unwrap();
        registry
            .register("emails", counting_handler(second.clone()))
            .unwrap();
        assert_eq!(registry.len(), 1);

        let record = Record::new_for_test(TopicPartition::new("emails", 0), 0, "body");
        registry
            .get("emails")
            .unwrap()
            .handle(&record)
            .await
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_fn_panic_reaches_caller() {
        let handler = handler_fn(|record| {
            if record.offset() == 3 {
                panic!("bad record");
            }
            Ok(())
        });
        let tp = TopicPartition::new("emails", 0);

        assert!(handler
            .handle(&Record::new_for_test(tp.clone(), 1, "ok"))
            .await
            .is_ok());

        let panicked = AssertUnwindSafe(handler.handle(&Record::new_for_test(tp, 3, "bad")))
            .catch_unwind()
            .await;
        assert!(panicked.is_err());
    }

    #[test]
    fn test_restore_undoes_registration() {
        let registry = RecordHandlerRegistry::new();
        let original = counting_handler(Arc::default());

        let previous = registry.register("emails", original.clone()).unwrap();
        assert!(previous.is_none());
        let replaced = registry
            .register("emails", counting_handler(Arc::default()))
            .unwrap();
        assert!(replaced.is_some());

        registry.restore("emails", replaced);
        let added = registry
            .register("chat", counting_handler(Arc::default()))
            .unwrap();
        registry.restore("chat", added);

        assert_eq!(registry.topics(), vec!["emails".to_string()]);
        assert!(Arc::ptr_eq(&registry.get("emails").unwrap(), &original));
    }

    #[test]
    fn test_lookup_of_unregistered_topic() {
        let registry = RecordHandlerRegistry::new();

        assert!(registry.is_empty());
        assert!(registry.get("chat-messages").is_none());
    }
}
