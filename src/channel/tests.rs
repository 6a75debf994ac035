use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use super::{Channel, ChannelOptions};
use crate::dispatch::{Delivery, Subscription};
use crate::store::QueueStore;
use crate::transport::{BackoffPolicy, LoopbackConnector, Transport};
use crate::utils::error::Error;

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        base_ms: 1,
        factor: 2.0,
        cap_ms: 5,
        jitter_ms: 0,
    }
}

fn slow_policy() -> BackoffPolicy {
    BackoffPolicy {
        base_ms: 5_000,
        factor: 2.0,
        cap_ms: 5_000,
        jitter_ms: 0,
    }
}

async fn connected_transport(policy: BackoffPolicy) -> Arc<Transport> {
    Transport::connect("mem://test", Arc::new(LoopbackConnector), policy)
        .await
        .unwrap()
}

async fn recv(sub: &mut Subscription) -> Delivery {
    timeout(Duration::from_secs(2), sub.next_delivery())
        .await
        .expect("timed out waiting for a delivery")
        .expect("subscription closed")
}

#[tokio::test]
async fn open_fails_on_disconnected_transport() {
    let transport = connected_transport(fast_policy()).await;
    transport.close();

    let store = Arc::new(QueueStore::in_memory());
    let err = Channel::open(transport, store).unwrap_err();
    assert!(matches!(err, Error::Channel(_)));
}

#[tokio::test]
async fn prefetch_must_be_positive() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());

    let err = Channel::open_with(
        Arc::clone(&transport),
        Arc::clone(&store),
        ChannelOptions {
            prefetch: 0,
            delivery_timeout: None,
        },
    )
    .unwrap_err();
    assert!(matches!(err, Error::Channel(_)));

    let channel = Channel::open(Arc::clone(&transport), store).unwrap();
    assert!(matches!(channel.set_prefetch(0), Err(Error::Channel(_))));
    channel.set_prefetch(3).unwrap();

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn declare_queue_conflict_surfaces() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), store).unwrap();

    channel.declare_queue("jobs", true).unwrap();
    channel.declare_queue("jobs", true).unwrap();
    let err = channel.declare_queue("jobs", false).unwrap_err();
    assert!(matches!(err, Error::QueueConflict { .. }));

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn publish_fails_on_closed_channel() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), store).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.close().await;
    let err = channel.publish(&queue, b"x".to_vec(), false).unwrap_err();
    assert!(matches!(err, Error::Publish(_)));

    transport.close();
}

#[tokio::test]
async fn publish_fails_while_link_is_down() {
    let transport = connected_transport(slow_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), store).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    transport.drop_link("test");
    let err = channel.publish(&queue, b"x".to_vec(), false).unwrap_err();
    assert!(matches!(err, Error::Connection(_)));

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn messages_arrive_in_publish_order() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), Arc::clone(&store)).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.publish(&queue, b"A".to_vec(), false).unwrap();
    channel.publish(&queue, b"B".to_vec(), false).unwrap();
    channel.publish(&queue, b"C".to_vec(), false).unwrap();

    let mut sub = channel.consume(&queue).unwrap();
    for expected in [b"A", b"B", b"C"] {
        let delivery = recv(&mut sub).await;
        assert_eq!(delivery.message.payload, expected.to_vec());
        delivery.ack().unwrap();
    }
    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn acking_twice_is_a_noop() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), Arc::clone(&store)).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.publish(&queue, b"A".to_vec(), false).unwrap();
    let mut sub = channel.consume(&queue).unwrap();
    let delivery = recv(&mut sub).await;
    let ticket = delivery.ticket_id();

    channel.ack(ticket).unwrap();
    channel.ack(ticket).unwrap();
    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn nack_requeues_at_tail_with_incremented_count() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), Arc::clone(&store)).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.publish(&queue, b"A".to_vec(), false).unwrap();
    channel.publish(&queue, b"B".to_vec(), false).unwrap();

    let mut sub = channel.consume(&queue).unwrap();
    let first = recv(&mut sub).await;
    assert_eq!(first.message.payload, b"A".to_vec());
    first.nack(true).unwrap();

    // B is ahead of the requeued A now
    let second = recv(&mut sub).await;
    assert_eq!(second.message.payload, b"B".to_vec());
    second.ack().unwrap();

    let third = recv(&mut sub).await;
    assert_eq!(third.message.payload, b"A".to_vec());
    assert_eq!(third.message.delivery_count, 1);
    third.ack().unwrap();

    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn nack_without_requeue_drops_the_message() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), Arc::clone(&store)).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.publish(&queue, b"A".to_vec(), false).unwrap();
    let mut sub = channel.consume(&queue).unwrap();
    recv(&mut sub).await.nack(false).unwrap();
    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn prefetch_bounds_open_deliveries() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open_with(
        Arc::clone(&transport),
        Arc::clone(&store),
        ChannelOptions {
            prefetch: 2,
            delivery_timeout: None,
        },
    )
    .unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    for i in 0..5u8 {
        channel.publish(&queue, vec![i], false).unwrap();
    }

    let mut sub = channel.consume(&queue).unwrap();
    let first = recv(&mut sub).await;
    let second = recv(&mut sub).await;
    assert_eq!(channel.dispatcher.open_tickets(sub.consumer_id()), 2);

    // The prefetch window is full; nothing else may arrive
    let blocked = timeout(Duration::from_millis(100), sub.next_delivery()).await;
    assert!(blocked.is_err());

    first.ack().unwrap();
    let third = recv(&mut sub).await;
    assert_eq!(third.message.payload, vec![2]);
    assert_eq!(channel.dispatcher.open_tickets(sub.consumer_id()), 2);

    second.ack().unwrap();
    third.ack().unwrap();

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn close_requeues_open_deliveries() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), Arc::clone(&store)).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.publish(&queue, b"A".to_vec(), false).unwrap();
    let mut sub = channel.consume(&queue).unwrap();
    let delivery = recv(&mut sub).await;

    channel.close().await;

    // The message went back to the queue, count incremented
    assert_eq!(store.depth("jobs"), 1);
    let candidate = store.dequeue_candidate("jobs").unwrap();
    assert_eq!(candidate.delivery_count, 1);

    // A late ack of the dead ticket changes nothing
    delivery.ack().unwrap();
    assert_eq!(store.depth("jobs"), 1);

    transport.close();
}

#[tokio::test]
async fn link_drop_makes_open_delivery_redeliverable() {
    // A base delay comfortably above scheduler noise, so the dispatch loop
    // observes the outage before the link is back.
    let transport = connected_transport(BackoffPolicy {
        base_ms: 50,
        factor: 2.0,
        cap_ms: 100,
        jitter_ms: 0,
    })
    .await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), Arc::clone(&store)).unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.publish(&queue, b"Y".to_vec(), false).unwrap();
    let mut sub = channel.consume(&queue).unwrap();
    let first = recv(&mut sub).await;
    let first_ticket = first.ticket_id();

    transport.drop_link("test");

    // The loopback connector reconnects almost immediately; the message is
    // dispatched again under a fresh ticket.
    let second = recv(&mut sub).await;
    assert_eq!(second.message.payload, b"Y".to_vec());
    assert_ne!(second.ticket_id(), first_ticket);

    // The invalidated ticket is dead; settling it is a no-op
    first.ack().unwrap();
    assert_eq!(store.depth("jobs"), 1);

    second.ack().unwrap();
    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn delivery_timeout_forces_requeue() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open_with(
        Arc::clone(&transport),
        Arc::clone(&store),
        ChannelOptions {
            prefetch: 1,
            delivery_timeout: Some(Duration::from_millis(50)),
        },
    )
    .unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();

    channel.publish(&queue, b"A".to_vec(), false).unwrap();
    let mut sub = channel.consume(&queue).unwrap();
    let stuck = recv(&mut sub).await;

    // Never settle `stuck`; the loop forces a nack and redelivers
    let retried = recv(&mut sub).await;
    assert_eq!(retried.message.payload, b"A".to_vec());
    assert_eq!(retried.message.delivery_count, 1);
    retried.ack().unwrap();

    // The expired ticket is already closed
    stuck.ack().unwrap();
    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn consume_requires_declared_queue() {
    let transport = connected_transport(fast_policy()).await;
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open(Arc::clone(&transport), store).unwrap();

    let ghost = super::QueueRef {
        name: "ghost".to_string(),
        durable: false,
    };
    assert!(matches!(
        channel.consume(&ghost),
        Err(Error::UnknownQueue(_))
    ));

    channel.close().await;
    transport.close();
}
