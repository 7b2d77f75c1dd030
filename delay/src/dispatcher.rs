//! Consumer side: one listener task per topic partition.
//!
//! A listener loops over its partition:
//!
//! 1. poll (returns expired in-flight items to ready, takes the first due
//!    item and marks it in flight),
//! 2. run the topic handler inside the producer's task context, bounded by
//!    the handler timeout,
//! 3. acknowledge, unless the handler panicked or timed out,
//! 4. when nothing is due, sleep until the next not-before or the poll
//!    interval, whichever comes first.
//!
//! Store failures back the listener off along a [`RetryPolicy`] without
//! ever stopping it. Only a shutdown signal ends the loop.

use crate::error::{DelayError, Result};
use crate::handler::{DelayHandler, TopicRegistry};
use crate::message::{DelayMessage, Envelope};
use crate::queue::{Poll, PolledItem, TopicQueue};
use futures::FutureExt;
use seatlock_core::environment::{Clock, SystemClock};
use seatlock_core::store::{duration_ms, SharedStore};
use seatlock_core::DelayConfig;
use seatlock_runtime::metrics::{DelayMetrics, RetryMetrics};
use seatlock_runtime::{ContextExecutor, RetryPolicy, TaskContext};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Wires registered topics to listener tasks.
pub struct DelayDispatcher {
    store: Arc<dyn SharedStore>,
    prefix: String,
    registry: Arc<TopicRegistry>,
    config: DelayConfig,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for DelayDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayDispatcher")
            .field("prefix", &self.prefix)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DelayDispatcher {
    /// Create a dispatcher for every topic in `registry`.
    #[must_use]
    pub fn new(
        store: Arc<dyn SharedStore>,
        prefix: impl Into<String>,
        registry: Arc<TopicRegistry>,
        config: DelayConfig,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            registry,
            config,
            clock: Arc::new(SystemClock),
            retry: RetryPolicy::new()
                .with_initial_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(5)),
        }
    }

    /// Use another clock to decide what is due.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Backoff applied while the store is failing. Only the delays are
    /// used; listeners retry indefinitely.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Store handle for a registered topic.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::Configuration`] if `topic` is not registered.
    pub fn queue(&self, topic: &str) -> Result<TopicQueue> {
        if self.registry.get(topic).is_none() {
            return Err(DelayError::configuration(format!("topic `{topic}` is not registered")));
        }
        TopicQueue::new(Arc::clone(&self.store), self.prefix.clone(), topic, self.config.partitions)
    }

    /// Items waiting in a partition of `topic`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown topic or partition, or
    /// a store error.
    pub async fn pending(&self, topic: &str, partition: usize) -> Result<usize> {
        self.queue(topic)?.pending(partition).await
    }

    /// Items of a partition of `topic` delivered but not acknowledged.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown topic or partition, or
    /// a store error.
    pub async fn in_flight(&self, topic: &str, partition: usize) -> Result<usize> {
        self.queue(topic)?.in_flight(partition).await
    }

    /// Verify every topic's partition count, then spawn one listener per
    /// (topic, partition). Listeners stop when `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::PartitionMismatch`] if any topic disagrees
    /// with the store; no listener is started in that case.
    pub async fn start(&self, shutdown: &broadcast::Sender<()>) -> Result<DispatcherHandle> {
        if self.registry.is_empty() {
            tracing::warn!("Delay dispatcher started without registered topics");
        }

        let mut listeners = Vec::new();
        for topic in self.registry.topics() {
            let queue = self.queue(topic)?;
            queue.verify_partitions().await?;
            let handler = self
                .registry
                .get(topic)
                .ok_or_else(|| DelayError::configuration(format!("topic `{topic}` is not registered")))?;
            for partition in 0..queue.partitions() {
                listeners.push(Listener {
                    queue: queue.clone(),
                    partition,
                    handler: Arc::clone(&handler),
                    clock: Arc::clone(&self.clock),
                    retry: self.retry,
                    poll_interval: self.config.poll_interval,
                    visibility_timeout: self.config.visibility_timeout,
                    handler_timeout: self.config.handler_timeout,
                });
            }
        }

        let executor = ContextExecutor::new("delay-listener");
        let tasks = listeners
            .into_iter()
            .map(|listener| {
                let receiver = shutdown.subscribe();
                let ctx = TaskContext::new()
                    .with_attribute("topic", listener.queue.topic())
                    .with_attribute("partition", listener.partition.to_string());
                executor.spawn(ctx, move |_| listener.run(receiver))
            })
            .collect::<Vec<_>>();

        tracing::info!(
            topics = self.registry.len(),
            listeners = tasks.len(),
            "Delay dispatcher started"
        );
        Ok(DispatcherHandle {
            shutdown: shutdown.clone(),
            tasks,
        })
    }
}

/// Running listeners.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Number of listener tasks.
    #[must_use]
    pub fn listeners(&self) -> usize {
        self.tasks.len()
    }

    /// Signal shutdown and wait for every listener to finish its current
    /// item and stop.
    pub async fn shutdown(self) {
        // No receivers left means every listener already stopped.
        let _ = self.shutdown.send(());
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::error!(error = %error, "Delay listener ended abnormally");
            }
        }
    }
}

struct Listener {
    queue: TopicQueue,
    partition: usize,
    handler: Arc<dyn DelayHandler>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    poll_interval: Duration,
    visibility_timeout: Duration,
    handler_timeout: Duration,
}

impl Listener {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let topic = self.queue.topic().to_string();
        tracing::info!(topic = %topic, partition = self.partition, "Delay listener started");
        let mut failures = 0_usize;

        loop {
            let now = self.clock.now_millis();
            let deadline = now.saturating_add(duration_ms(self.visibility_timeout));
            let polled = tokio::select! {
                _ = shutdown.recv() => break,
                polled = self.queue.poll(self.partition, now, deadline) => polled,
            };

            let pause = match polled {
                Ok(Poll::Item(item)) => {
                    failures = 0;
                    self.deliver(item).await;
                    continue;
                }
                Ok(Poll::Idle(next_due)) => {
                    failures = 0;
                    self.idle_pause(now, next_due)
                }
                Err(error) => {
                    RetryMetrics::record_attempt();
                    let pause = self.retry.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        topic = %topic,
                        partition = self.partition,
                        failures,
                        error = %error,
                        "Delay poll failed, backing off"
                    );
                    pause
                }
            };

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!(topic = %topic, partition = self.partition, "Delay listener stopped");
    }

    fn idle_pause(&self, now: i64, next_due: Option<i64>) -> Duration {
        next_due.map_or(self.poll_interval, |due| {
            let wait = u64::try_from(due.saturating_sub(now)).unwrap_or_default();
            Duration::from_millis(wait).min(self.poll_interval)
        })
    }

    async fn deliver(&self, item: PolledItem) {
        let topic = self.queue.topic();
        let envelope = match Envelope::decode(&item.envelope) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::error!(
                    topic = %topic,
                    partition = self.partition,
                    id = %item.id,
                    error = %error,
                    "Undecodable delay item dropped"
                );
                self.ack(&item.id).await;
                return;
            }
        };

        let lag_ms = self.clock.now_millis().saturating_sub(item.not_before_ms);
        DelayMetrics::record_delivery(
            topic,
            item.attempt,
            Duration::from_millis(u64::try_from(lag_ms).unwrap_or_default()),
        );

        let context = envelope.context.clone();
        let message = DelayMessage {
            id: item.id.clone(),
            topic: topic.to_string(),
            partition: self.partition,
            payload: envelope.payload,
            not_before_ms: item.not_before_ms,
            attempt: item.attempt,
            context: envelope.context,
        };
        let run = AssertUnwindSafe(context.scope(self.handler.execute(message))).catch_unwind();

        match tokio::time::timeout(self.handler_timeout, run).await {
            Ok(Ok(Ok(()))) => self.ack(&item.id).await,
            Ok(Ok(Err(error))) => {
                DelayMetrics::record_handler_error(topic);
                tracing::error!(
                    topic = %topic,
                    partition = self.partition,
                    id = %item.id,
                    attempt = item.attempt,
                    error = %error,
                    "Delay handler failed, item acknowledged"
                );
                self.ack(&item.id).await;
            }
            Ok(Err(_panic)) => {
                DelayMetrics::record_handler_error(topic);
                tracing::error!(
                    topic = %topic,
                    partition = self.partition,
                    id = %item.id,
                    attempt = item.attempt,
                    "Delay handler panicked, item left for redelivery"
                );
            }
            Err(_elapsed) => {
                DelayMetrics::record_handler_error(topic);
                tracing::warn!(
                    topic = %topic,
                    partition = self.partition,
                    id = %item.id,
                    attempt = item.attempt,
                    timeout_ms = duration_ms(self.handler_timeout),
                    "Delay handler timed out, item left for redelivery"
                );
            }
        }
    }

    async fn ack(&self, id: &str) {
        match self.queue.ack(self.partition, id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(topic = %self.queue.topic(), id = %id, "Item was no longer in flight");
            }
            Err(error) => {
                tracing::warn!(
                    topic = %self.queue.topic(),
                    partition = self.partition,
                    id = %id,
                    error = %error,
                    "Ack failed, item will be redelivered"
                );
            }
        }
    }
}
