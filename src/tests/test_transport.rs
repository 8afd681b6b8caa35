use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    Delivery, InMemoryTransport, InMemoryTransportOptions, MessageHandler, QuotaGuardError,
    Shutdown, Subscription,
};

use super::support::wait_until;

struct ScriptedHandler {
    replies: Mutex<VecDeque<Result<Delivery, QuotaGuardError>>>,
    otherwise: Delivery,
    received: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    fn new(replies: Vec<Result<Delivery, QuotaGuardError>>, otherwise: Delivery) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            otherwise,
            received: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl MessageHandler for ScriptedHandler {
    async fn handle(&self, _topic: &str, payload: &str) -> Result<Delivery, QuotaGuardError> {
        self.received.lock().unwrap().push(payload.to_string());
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or(Ok(self.otherwise))
    }
}

fn transport(max_redeliveries: u32) -> (crate::ShutdownTrigger, InMemoryTransport) {
    let (trigger, shutdown) = Shutdown::channel();
    let transport = InMemoryTransport::new(
        InMemoryTransportOptions {
            channel_capacity: 64,
            redelivery_delay: Duration::from_millis(100),
            max_redeliveries,
        },
        shutdown,
    );
    (trigger, transport)
}

#[tokio::test(start_paused = true)]
async fn delivers_and_acks_published_messages() {
    let (trigger, transport) = transport(3);
    let subscription = Subscription::new("orders", "g", 2).unwrap();
    let handler = ScriptedHandler::new(vec![], Delivery::Ack);

    let workers = transport.subscribe(&subscription, handler.clone());

    for i in 0..10 {
        assert_eq!(
            transport.publish("orders", &format!("order-{i}")).await.unwrap(),
            1
        );
    }

    wait_until(|| transport.stats().acked() == 10).await;

    let mut received = handler.received();
    received.sort();
    let mut expected: Vec<_> = (0..10).map(|i| format!("order-{i}")).collect();
    expected.sort();
    assert_eq!(received, expected);
    assert_eq!(transport.stats().published(), 10);
    assert_eq!(transport.pending("orders", "g"), 0);

    trigger.trigger();
    workers.join().await;
}

#[tokio::test(start_paused = true)]
async fn retry_later_is_redelivered_after_the_delay() {
    let (trigger, transport) = transport(3);
    let subscription = Subscription::new("orders", "g", 1).unwrap();
    let handler = ScriptedHandler::new(vec![Ok(Delivery::RetryLater)], Delivery::Ack);

    let workers = transport.subscribe(&subscription, handler.clone());
    transport.publish("orders", "order-1").await.unwrap();

    wait_until(|| transport.stats().acked() == 1).await;

    assert_eq!(handler.received(), vec!["order-1", "order-1"]);
    assert_eq!(transport.stats().redelivered(), 1);

    trigger.trigger();
    workers.join().await;
}

#[tokio::test(start_paused = true)]
async fn dead_letters_after_max_redeliveries() {
    let (trigger, transport) = transport(2);
    let subscription = Subscription::new("orders", "g", 1).unwrap();
    let handler = ScriptedHandler::new(vec![], Delivery::RetryLater);

    let workers = transport.subscribe(&subscription, handler.clone());
    transport.publish("orders", "order-1").await.unwrap();

    wait_until(|| transport.stats().dead_lettered() == 1).await;

    assert_eq!(handler.received().len(), 3);
    assert_eq!(transport.stats().redelivered(), 2);
    assert_eq!(transport.stats().acked(), 0);

    trigger.trigger();
    workers.join().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_messages_are_not_redelivered() {
    let (trigger, transport) = transport(3);
    let subscription = Subscription::new("orders", "g", 1).unwrap();
    let handler = ScriptedHandler::new(vec![], Delivery::Drop);

    let workers = transport.subscribe(&subscription, handler.clone());
    transport.publish("orders", "order-1").await.unwrap();

    wait_until(|| transport.stats().dropped() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(handler.received().len(), 1);
    assert_eq!(transport.stats().redelivered(), 0);

    trigger.trigger();
    workers.join().await;
}

#[tokio::test(start_paused = true)]
async fn handler_errors_are_redelivered() {
    let (trigger, transport) = transport(3);
    let subscription = Subscription::new("orders", "g", 1).unwrap();
    let handler = ScriptedHandler::new(
        vec![Err(QuotaGuardError::StoreUnavailable("down".to_string()))],
        Delivery::Ack,
    );

    let workers = transport.subscribe(&subscription, handler.clone());
    transport.publish("orders", "order-1").await.unwrap();

    wait_until(|| transport.stats().acked() == 1).await;

    assert_eq!(transport.stats().handler_errors(), 1);
    assert_eq!(transport.stats().redelivered(), 1);

    trigger.trigger();
    workers.join().await;
}

#[tokio::test(start_paused = true)]
async fn every_group_receives_every_message() {
    let (trigger, transport) = transport(3);
    let first = ScriptedHandler::new(vec![], Delivery::Ack);
    let second = ScriptedHandler::new(vec![], Delivery::Ack);

    let first_workers =
        transport.subscribe(&Subscription::new("orders", "billing", 1).unwrap(), first.clone());
    let second_workers = transport.subscribe(
        &Subscription::new("orders", "shipping", 1).unwrap(),
        second.clone(),
    );

    assert_eq!(transport.publish("orders", "order-1").await.unwrap(), 2);

    wait_until(|| transport.stats().acked() == 2).await;
    assert_eq!(first.received(), vec!["order-1"]);
    assert_eq!(second.received(), vec!["order-1"]);

    trigger.trigger();
    first_workers.join().await;
    second_workers.join().await;
}

#[tokio::test(start_paused = true)]
async fn publish_without_subscribers_is_discarded() {
    let (_trigger, transport) = transport(3);

    assert_eq!(transport.publish("orders", "order-1").await.unwrap(), 0);
    assert_eq!(transport.stats().published(), 0);
}

#[tokio::test(start_paused = true)]
async fn closing_the_transport_stops_workers() {
    let (_trigger, transport) = transport(3);
    let subscription = Subscription::new("orders", "g", 3).unwrap();
    let handler = ScriptedHandler::new(vec![], Delivery::Ack);

    let workers = transport.subscribe(&subscription, handler);
    transport.publish("orders", "order-1").await.unwrap();

    transport.close();
    workers.join().await;

    assert_eq!(transport.stats().acked(), 1);
    assert!(matches!(
        transport.publish("orders", "order-2").await,
        Err(QuotaGuardError::TransportClosed)
    ));
}
