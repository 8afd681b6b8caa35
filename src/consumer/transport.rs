use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_channel::{Receiver, Sender};
use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::{Delivery, QuotaGuardError, Shutdown, Subscription};

/// Receives messages from a transport.
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one message and say what the transport should do with it.
    ///
    /// An `Err` is treated like [`Delivery::RetryLater`].
    fn handle(
        &self,
        topic: &str,
        payload: &str,
    ) -> impl Future<Output = Result<Delivery, QuotaGuardError>> + Send;
}

/// Configuration for [`InMemoryTransport`].
#[derive(Debug, Clone, Copy)]
pub struct InMemoryTransportOptions {
    /// Bound of each consumer group's queue.
    pub channel_capacity: usize,
    /// Delay before a `RetryLater` message is put back on its queue.
    pub redelivery_delay: Duration,
    /// Redeliveries before a message is dead-lettered.
    pub max_redeliveries: u32,
}

impl Default for InMemoryTransportOptions {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            redelivery_delay: Duration::from_secs(1),
            max_redeliveries: 16,
        }
    }
}

/// Delivery counters of a transport.
#[derive(Debug, Default)]
pub struct TransportStats {
    published: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
    handler_errors: AtomicU64,
}

impl TransportStats {
    /// Messages accepted by `publish`, counted once per consumer group.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Messages acknowledged by a handler.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Messages scheduled for redelivery.
    pub fn redelivered(&self) -> u64 {
        self.redelivered.load(Ordering::Relaxed)
    }

    /// Messages a handler asked to drop.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Messages discarded after `max_redeliveries`.
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }

    /// Handler invocations that returned `Err`.
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    topic: Arc<str>,
    payload: Arc<str>,
    redeliveries: u32,
}

#[derive(Debug, Clone)]
struct GroupQueue {
    sender: Sender<Envelope>,
    receiver: Receiver<Envelope>,
}

/// In-process message transport with at-least-once delivery.
///
/// Each `(topic, group)` pair has its own bounded queue; `publish` fans a
/// message out to every group subscribed to the topic, and the workers of one
/// group compete for its queue. Messages published to a topic with no
/// subscribed group are discarded.
#[derive(Debug)]
pub struct InMemoryTransport {
    queues: DashMap<(String, String), GroupQueue>,
    options: InMemoryTransportOptions,
    stats: Arc<TransportStats>,
    shutdown: Shutdown,
}

impl InMemoryTransport {
    /// Create a transport whose workers stop on `shutdown`.
    pub fn new(options: InMemoryTransportOptions, shutdown: Shutdown) -> Self {
        Self {
            queues: DashMap::new(),
            options,
            stats: Arc::new(TransportStats::default()),
            shutdown,
        }
    }

    /// Delivery counters.
    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    /// Messages waiting in the queue of `group_id` on `topic`.
    pub fn pending(&self, topic: &str, group_id: &str) -> usize {
        self.queues
            .get(&(topic.to_string(), group_id.to_string()))
            .map(|queue| queue.sender.len())
            .unwrap_or(0)
    }

    fn queue(&self, subscription: &Subscription) -> GroupQueue {
        self.queues
            .entry((
                subscription.topic().to_string(),
                subscription.group_id().to_string(),
            ))
            .or_insert_with(|| {
                let (sender, receiver) = async_channel::bounded(self.options.channel_capacity.max(1));
                GroupQueue { sender, receiver }
            })
            .clone()
    }

    /// Publish `payload` to every group subscribed to `topic`; returns the
    /// number of groups it was queued for. Waits while a queue is full.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<usize, QuotaGuardError> {
        let senders: Vec<Sender<Envelope>> = self
            .queues
            .iter()
            .filter(|entry| entry.key().0 == topic)
            .map(|entry| entry.value().sender.clone())
            .collect();

        if senders.is_empty() {
            tracing::warn!(topic, "no consumer group subscribed, message discarded");
            return Ok(0);
        }

        let envelope = Envelope {
            topic: Arc::from(topic),
            payload: Arc::from(payload),
            redeliveries: 0,
        };

        for sender in &senders {
            sender
                .send(envelope.clone())
                .await
                .map_err(|_| QuotaGuardError::TransportClosed)?;
            self.stats.published.fetch_add(1, Ordering::Relaxed);
        }

        Ok(senders.len())
    } // end method publish

    /// Start `subscription.concurrency()` workers feeding `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<H: MessageHandler>(
        &self,
        subscription: &Subscription,
        handler: Arc<H>,
    ) -> SubscriptionHandle {
        let queue = self.queue(subscription);

        let workers = (0..subscription.concurrency())
            .map(|worker| {
                let worker = Worker {
                    id: worker,
                    queue: queue.clone(),
                    handler: Arc::clone(&handler),
                    stats: Arc::clone(&self.stats),
                    options: self.options,
                    shutdown: self.shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(
            topic = subscription.topic(),
            group_id = subscription.group_id(),
            concurrency = subscription.concurrency(),
            "subscription started"
        );

        SubscriptionHandle { workers }
    } // end method subscribe

    /// Close every queue. Workers exit once their queue is drained.
    pub fn close(&self) {
        for entry in self.queues.iter() {
            entry.value().sender.close();
        }
    }
}

/// Workers of one subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    workers: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Wait for every worker to exit.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                tracing::error!(error = ?err, "consumer worker panicked");
            }
        }
    }

    /// Stop every worker immediately.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

struct Worker<H> {
    id: usize,
    queue: GroupQueue,
    handler: Arc<H>,
    stats: Arc<TransportStats>,
    options: InMemoryTransportOptions,
    shutdown: Shutdown,
}

impl<H: MessageHandler> Worker<H> {
    async fn run(self) {
        loop {
            let envelope = tokio::select! {
                _ = self.shutdown.wait() => break,
                received = self.queue.receiver.recv() => match received {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                },
            };

            let delivery = match self.handler.handle(&envelope.topic, &envelope.payload).await {
                Ok(delivery) => delivery,
                Err(err) => {
                    tracing::error!(worker = self.id, topic = %envelope.topic, error = ?err, "message handler failed");
                    self.stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    Delivery::RetryLater
                }
            };

            match delivery {
                Delivery::Ack => {
                    self.stats.acked.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::Drop => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Delivery::RetryLater => self.redeliver(envelope),
            }
        }

        tracing::debug!(worker = self.id, "consumer worker stopped");
    } // end method run

    fn redeliver(&self, mut envelope: Envelope) {
        if envelope.redeliveries >= self.options.max_redeliveries {
            tracing::error!(
                topic = %envelope.topic,
                redeliveries = envelope.redeliveries,
                payload = %envelope.payload,
                "message dead-lettered"
            );
            self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        envelope.redeliveries += 1;
        self.stats.redelivered.fetch_add(1, Ordering::Relaxed);

        let sender = self.queue.sender.clone();
        let delay = self.options.redelivery_delay;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            if sender.send(envelope).await.is_err() {
                tracing::warn!("queue closed before redelivery");
            }
        });
    } // end method redeliver
}
