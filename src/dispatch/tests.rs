use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::channel::{Channel, ChannelOptions, QueueRef};
use crate::dispatch::{Delivery, Subscription};
use crate::store::QueueStore;
use crate::transport::{BackoffPolicy, LoopbackConnector, Transport};

fn fast_policy() -> BackoffPolicy {
    BackoffPolicy {
        base_ms: 1,
        factor: 2.0,
        cap_ms: 5,
        jitter_ms: 0,
    }
}

async fn setup(prefetch: usize) -> (Arc<Transport>, Arc<QueueStore>, Arc<Channel>, QueueRef) {
    let transport = Transport::connect("mem://test", Arc::new(LoopbackConnector), fast_policy())
        .await
        .unwrap();
    let store = Arc::new(QueueStore::in_memory());
    let channel = Channel::open_with(
        Arc::clone(&transport),
        Arc::clone(&store),
        ChannelOptions {
            prefetch,
            delivery_timeout: None,
        },
    )
    .unwrap();
    let queue = channel.declare_queue("jobs", false).unwrap();
    (transport, store, channel, queue)
}

async fn recv(sub: &mut Subscription) -> Delivery {
    timeout(Duration::from_secs(2), sub.next_delivery())
        .await
        .expect("timed out waiting for a delivery")
        .expect("subscription closed")
}

#[tokio::test]
async fn round_robin_across_two_slots() {
    let (transport, _store, channel, queue) = setup(1).await;

    let mut sub_a = channel.consume(&queue).unwrap();
    let mut sub_b = channel.consume(&queue).unwrap();

    for i in 0..4u8 {
        channel.publish(&queue, vec![i], false).unwrap();
    }

    let first_a = recv(&mut sub_a).await;
    let first_b = recv(&mut sub_b).await;
    assert_eq!(first_a.message.payload, vec![0]);
    assert_eq!(first_b.message.payload, vec![1]);

    first_a.ack().unwrap();
    first_b.ack().unwrap();

    let second_a = recv(&mut sub_a).await;
    let second_b = recv(&mut sub_b).await;
    assert_eq!(second_a.message.payload, vec![2]);
    assert_eq!(second_b.message.payload, vec![3]);
    second_a.ack().unwrap();
    second_b.ack().unwrap();

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn busy_slot_does_not_starve_the_other() {
    let (transport, _store, channel, queue) = setup(1).await;

    let mut sub_a = channel.consume(&queue).unwrap();
    let mut sub_b = channel.consume(&queue).unwrap();

    channel.publish(&queue, b"first".to_vec(), false).unwrap();
    // Slot A takes the first message and sits on it
    let held = recv(&mut sub_a).await;

    // Everything that follows flows to the slot with spare capacity
    channel.publish(&queue, b"second".to_vec(), false).unwrap();
    channel.publish(&queue, b"third".to_vec(), false).unwrap();

    let b1 = recv(&mut sub_b).await;
    assert_eq!(b1.message.payload, b"second".to_vec());
    b1.ack().unwrap();

    let b2 = recv(&mut sub_b).await;
    assert_eq!(b2.message.payload, b"third".to_vec());
    b2.ack().unwrap();

    held.ack().unwrap();
    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn dropped_subscription_requeues_its_open_deliveries() {
    let (transport, store, channel, queue) = setup(1).await;

    let mut sub_a = channel.consume(&queue).unwrap();
    channel.publish(&queue, b"A".to_vec(), false).unwrap();
    let held = recv(&mut sub_a).await;
    drop(sub_a);
    drop(held);

    // The slot is gone; a fresh subscription picks the message up again
    let mut sub_b = channel.consume(&queue).unwrap();
    let redelivered = recv(&mut sub_b).await;
    assert_eq!(redelivered.message.payload, b"A".to_vec());
    assert_eq!(redelivered.message.delivery_count, 1);
    redelivered.ack().unwrap();
    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}

#[tokio::test]
async fn consumer_registered_before_publish_gets_the_message() {
    let (transport, store, channel, queue) = setup(1).await;

    let mut sub = channel.consume(&queue).unwrap();
    channel.publish(&queue, b"late".to_vec(), false).unwrap();

    let delivery = recv(&mut sub).await;
    assert_eq!(delivery.message.payload, b"late".to_vec());
    delivery.ack().unwrap();
    assert_eq!(store.depth("jobs"), 0);

    channel.close().await;
    transport.close();
}
