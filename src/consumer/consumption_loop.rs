use std::sync::Arc;

use crate::{
    BreakerStatus, DegradationFallback, Downstream, Execution, FallbackDisposition,
    MessageHandler, QuotaGuardError, RateLimitEngine, RateLimitKey, ResilienceOptions,
    ResilienceWrapper, Shutdown, StoreClient,
};

/// Acknowledgement returned to the transport for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Processed; do not redeliver.
    Ack,
    /// Not processed; redeliver later.
    RetryLater,
    /// Not processed and must not be redelivered.
    Drop,
}

/// Where a consumption loop reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    topic: String,
    group_id: String,
    concurrency: usize,
}

impl Subscription {
    /// Subscribe `group_id` to `topic` with `concurrency` parallel workers.
    pub fn new(
        topic: impl Into<String>,
        group_id: impl Into<String>,
        concurrency: usize,
    ) -> Result<Self, QuotaGuardError> {
        let topic = topic.into();
        let group_id = group_id.into();

        if topic.is_empty() {
            return Err(QuotaGuardError::InvalidConfiguration(
                "Topic must not be empty".to_string(),
            ));
        }

        if group_id.is_empty() {
            return Err(QuotaGuardError::InvalidConfiguration(
                "Group id must not be empty".to_string(),
            ));
        }

        if concurrency == 0 {
            return Err(QuotaGuardError::InvalidConfiguration(
                "Concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            topic,
            group_id,
            concurrency,
        })
    }

    /// Topic name.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consumer group id.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Parallel workers for this subscription.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// Configuration for [`ConsumptionLoop`].
#[derive(Debug, Clone)]
pub struct ConsumptionLoopOptions {
    /// Topic and group to consume.
    pub subscription: Subscription,
    /// Key every message of this loop is admitted against.
    pub key: RateLimitKey,
    /// Admission, breaker and retry settings.
    pub resilience: ResilienceOptions,
}

/// Per-consumer processing of messages from one subscription.
///
/// Each message goes through the loop's [`ResilienceWrapper`] and is mapped to a
/// [`Delivery`]:
///
/// | execution                    | delivery     |
/// |------------------------------|--------------|
/// | completed                    | `Ack`        |
/// | circuit open                 | `RetryLater` |
/// | degraded, fallback deferred  | `RetryLater` |
/// | degraded, fallback diverted  | `Drop`       |
/// | admitted call failed         | `RetryLater` |
/// | cancelled by shutdown        | `RetryLater` |
///
/// Messages for a topic the loop is not subscribed to are dropped.
#[derive(Debug)]
pub struct ConsumptionLoop<S, D, F> {
    subscription: Subscription,
    key: RateLimitKey,
    wrapper: ResilienceWrapper<S, D, F>,
}

impl<S, D, F> ConsumptionLoop<S, D, F>
where
    S: StoreClient,
    D: Downstream,
    F: DegradationFallback,
{
    /// Create a loop sharing `engine` and `downstream` with any other loops in
    /// the process. The circuit breaker is private to this loop.
    pub fn new(
        options: ConsumptionLoopOptions,
        engine: Arc<RateLimitEngine<S>>,
        downstream: Arc<D>,
        fallback: F,
        shutdown: Shutdown,
    ) -> Result<Self, QuotaGuardError> {
        let wrapper =
            ResilienceWrapper::new(options.resilience, engine, downstream, fallback, shutdown)?;

        Ok(Self {
            subscription: options.subscription,
            key: options.key,
            wrapper,
        })
    }

    /// Process one message.
    pub async fn on_message(&self, topic: &str, payload: &str) -> Result<Delivery, QuotaGuardError> {
        if topic != self.subscription.topic() {
            tracing::warn!(
                topic,
                subscribed = self.subscription.topic(),
                "message for unsubscribed topic, dropping"
            );
            return Ok(Delivery::Drop);
        }

        tracing::info!(
            topic,
            group_id = self.subscription.group_id(),
            payload,
            "message received"
        );

        let execution = self.wrapper.execute(&self.key, payload).await?;

        let delivery = match execution {
            Execution::Completed => Delivery::Ack,
            Execution::Degraded {
                disposition: FallbackDisposition::Diverted,
                ..
            } => Delivery::Drop,
            Execution::CircuitOpen
            | Execution::Degraded {
                disposition: FallbackDisposition::Defer,
                ..
            }
            | Execution::Failed(_)
            | Execution::Cancelled => Delivery::RetryLater,
        };

        tracing::info!(topic, execution = ?execution, delivery = ?delivery, "message handled");

        Ok(delivery)
    } // end method on_message

    /// The subscription this loop consumes.
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// The rate limit key of this loop.
    pub fn key(&self) -> &RateLimitKey {
        &self.key
    }

    /// Snapshot of this loop's circuit breaker.
    pub fn breaker_status(&self) -> BreakerStatus {
        self.wrapper.breaker_status()
    }

    /// The shared rate limit engine.
    pub fn engine(&self) -> &Arc<RateLimitEngine<S>> {
        self.wrapper.engine()
    }

    /// The protected dependency.
    pub fn downstream(&self) -> &Arc<D> {
        self.wrapper.downstream()
    }
}

impl<S, D, F> MessageHandler for ConsumptionLoop<S, D, F>
where
    S: StoreClient + 'static,
    D: Downstream + 'static,
    F: DegradationFallback + 'static,
{
    async fn handle(&self, topic: &str, payload: &str) -> Result<Delivery, QuotaGuardError> {
        self.on_message(topic, payload).await
    }
}
