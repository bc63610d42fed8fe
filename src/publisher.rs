use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;

/// Error returned by a subscriber while receiving a publication.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct SubscriberError(Box<dyn std::error::Error + Send + Sync>);

impl SubscriberError {
    /// Wraps a subscriber-specific error.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// This trait is used to implement a subscriber: the receiving end of the topics a
/// [`Publisher`] fans out on. All subscribers of a topic receive every publication on it, in
/// registration order.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Receive a message published on a topic this subscriber is registered for.
    async fn receive(&self, topic: &str, message: &Value) -> Result<(), SubscriberError>;

    /// The name of the subscriber. By default, this is the type name of the subscriber,
    /// but it can be overridden to provide a custom name. This name is used as
    /// part of tracing spans, to identify the subscriber being run.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A message sitting in the publisher buffer, waiting for the owning transaction to commit.
#[derive(Debug, Clone)]
pub struct Publication {
    /// The topic the message was published on.
    pub topic: String,
    /// The serialized message.
    pub message: Value,
    /// When the message entered the buffer.
    pub enqueued_at: DateTime<Utc>,
}

/// A single failed delivery to a single subscriber.
#[derive(thiserror::Error, Debug)]
#[error("subscriber `{subscriber}` failed on topic `{topic}`: {source}")]
pub struct DeliveryFailure {
    /// The topic the failed publication was on.
    pub topic: String,
    /// The name of the failing subscriber.
    pub subscriber: &'static str,
    /// What the subscriber failed with.
    #[source]
    pub source: SubscriberError,
}

/// Raised once a flush finished with at least one failed delivery. Every delivery is attempted
/// before this is reported: one failing subscriber never blocks the remaining subscribers or
/// messages.
#[derive(thiserror::Error, Debug)]
#[error("{} deliveries failed ({} delivered)", .failures.len(), .delivered)]
pub struct FlushError {
    /// The deliveries that failed.
    pub failures: Vec<DeliveryFailure>,
    /// How many deliveries succeeded.
    pub delivered: usize,
}

/// Error raised by [`Publisher::publish`].
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// The message could not be serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// An immediate-mode delivery failed.
    #[error(transparent)]
    Delivery(#[from] FlushError),
}

/// Topic-based publisher decoupling notification producers from consumers.
///
/// A standalone publisher delivers immediately. A publisher owned by a session is switched to
/// buffered mode: publications accumulate in FIFO order and nothing reaches a subscriber until
/// the session commits and flushes the buffer, or the buffer is discarded on rollback. Flushing
/// and discarding are the session's job, tied to its transaction boundary.
pub struct Publisher {
    subscribers: HashMap<String, Vec<Arc<dyn Subscriber>>>,
    buffer: VecDeque<Publication>,
    buffered: bool,
}

impl Publisher {
    /// Creates a standalone publisher delivering immediately.
    pub fn new() -> Self {
        Self {
            subscribers: HashMap::new(),
            buffer: VecDeque::new(),
            buffered: false,
        }
    }

    pub(crate) fn buffered() -> Self {
        let mut publisher = Self::new();
        publisher.buffered = true;
        publisher
    }

    pub(crate) fn set_buffered(&mut self) {
        self.buffered = true;
    }

    /// Registers a subscriber on a topic. A topic's subscribers receive its publications in
    /// registration order.
    pub fn subscribe(
        &mut self,
        topic: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
    ) -> &mut Self {
        self.subscribers.entry(topic.into()).or_default().push(subscriber);
        self
    }

    /// Publishes a message on a topic: buffered for the commit-time flush when this publisher
    /// belongs to a session, delivered immediately otherwise.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the message cannot be serialized, or, in immediate mode, if a
    /// delivery fails.
    pub async fn publish<M>(&mut self, topic: &str, message: &M) -> Result<(), PublishError>
    where
        M: Serialize + Sync + ?Sized,
    {
        let publication = Publication {
            topic: topic.to_owned(),
            message: serde_json::to_value(message)?,
            enqueued_at: Utc::now(),
        };

        if self.buffered {
            self.buffer.push_back(publication);
            return Ok(());
        }

        let mut failures: Vec<DeliveryFailure> = Vec::new();
        let mut delivered: usize = 0;
        self.deliver(&publication, &mut failures, &mut delivered).await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(FlushError { failures, delivered }.into())
        }
    }

    /// Delivers every buffered publication in FIFO order, then clears the buffer. Returns how
    /// many deliveries succeeded, or the collected failures once every delivery was attempted.
    pub(crate) async fn flush(&mut self) -> Result<usize, FlushError> {
        let pending: Vec<Publication> = self.buffer.drain(..).collect();
        let mut failures: Vec<DeliveryFailure> = Vec::new();
        let mut delivered: usize = 0;

        for publication in &pending {
            self.deliver(publication, &mut failures, &mut delivered).await;
        }

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(FlushError { failures, delivered })
        }
    }

    /// Clears the buffer without delivering anything; returns how many publications were
    /// discarded.
    pub(crate) fn discard(&mut self) -> usize {
        let discarded: usize = self.buffer.len();
        self.buffer.clear();
        discarded
    }

    /// Number of publications waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    async fn deliver(
        &self,
        publication: &Publication,
        failures: &mut Vec<DeliveryFailure>,
        delivered: &mut usize,
    ) {
        let subscribers = match self.subscribers.get(&publication.topic) {
            Some(subscribers) => subscribers,
            None => return,
        };

        for subscriber in subscribers {
            let span = tracing::debug_span!(
                "uow.subscriber",
                topic = %publication.topic,
                subscriber = subscriber.name()
            );

            match subscriber
                .receive(&publication.topic, &publication.message)
                .instrument(span)
                .await
            {
                Ok(()) => *delivered += 1,
                Err(error) => {
                    tracing::error!({
                        topic = %publication.topic,
                        subscriber = subscriber.name(),
                        error = ?error,
                    }, "subscriber failed to receive publication");

                    failures.push(DeliveryFailure {
                        topic: publication.topic.clone(),
                        subscriber: subscriber.name(),
                        source: error,
                    });
                }
            }
        }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topics", &self.subscribers.keys().collect::<Vec<_>>())
            .field("pending", &self.buffer.len())
            .field("buffered", &self.buffered)
            .finish()
    }
}
