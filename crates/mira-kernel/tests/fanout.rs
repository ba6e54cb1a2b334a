use bytes::Bytes;
use mira_common::ids::ChannelId;
use mira_common::message::DIRECT_EXCHANGE_NAME;
use mira_common::{KernelConfig, Message, MessageId, MessageMetadata};
use mira_kernel::Kernel;
use mira_kernel::cluster::StaticClusterIdentity;
use mira_kernel::sequencer::SequentialIdGenerator;
use mira_kernel::subscription::{InMemorySubscriptionDirectory, Subscription};
use mira_storage::InMemoryMessageStore;
use std::sync::Arc;

fn start(first_id: u64) -> (Arc<Kernel>, Arc<InMemoryMessageStore>) {
    let config = KernelConfig::new("n1");
    let store = Arc::new(InMemoryMessageStore::new());
    let kernel = Kernel::start(
        config.clone(),
        store.clone(),
        Arc::new(InMemorySubscriptionDirectory::new()),
        Arc::new(StaticClusterIdentity::from_config(&config)),
        Box::new(SequentialIdGenerator::starting_at(first_id)),
    )
    .expect("kernel");
    (Arc::new(kernel), store)
}

fn topic_message(topic: &str, payload: &'static [u8]) -> Message {
    Message::from_payload(MessageMetadata::topic(topic), Bytes::from_static(payload), 3)
}

async fn shutdown(kernel: Arc<Kernel>) {
    let kernel = Arc::try_unwrap(kernel).expect("sole owner");
    kernel.shutdown().await;
}

#[tokio::test]
async fn cricket_score_reaches_durable_and_node_queues() {
    let (kernel, store) = start(100);
    kernel
        .open_subscription(Subscription::durable_topic(
            ChannelId::new(),
            "sports.#",
            "Q1",
            "n1",
        ))
        .await
        .expect("durable");
    kernel
        .open_subscription(Subscription::non_durable_topic(
            ChannelId::new(),
            "sports.cricket",
            "n1",
        ))
        .await
        .expect("non-durable");

    kernel
        .submit_message_event_and_wait(topic_message("sports.cricket", b"IND 287/4"))
        .await
        .expect("routed");

    let durable = store.queue_messages("Q1").await;
    let node = store.queue_messages("n1:sports.cricket").await;
    assert_eq!(durable.len(), 1);
    assert_eq!(node.len(), 1);

    // Inbound took 100, the copies follow in directory order.
    assert_eq!(durable[0].id(), MessageId::new(101));
    assert_eq!(node[0].id(), MessageId::new(102));

    let rewritten = durable[0].metadata();
    assert_eq!(rewritten.destination, "Q1");
    assert_eq!(rewritten.exchange, DIRECT_EXCHANGE_NAME);
    assert!(!rewritten.is_topic);
    assert_eq!(node[0].metadata().destination, "sports.cricket");

    for copy in durable.iter().chain(node.iter()) {
        assert_eq!(copy.content(), Bytes::from_static(b"IND 287/4"));
        copy.validate().expect("well formed");
    }
    shutdown(kernel).await;
}

#[tokio::test]
async fn shared_storage_queue_gets_one_copy() {
    let (kernel, store) = start(1);
    for _ in 0..5 {
        kernel
            .open_subscription(Subscription::non_durable_topic(
                ChannelId::new(),
                "news.*",
                "n1",
            ))
            .await
            .expect("open");
    }
    kernel
        .submit_message_event_and_wait(topic_message("news.world", b"headline"))
        .await
        .expect("routed");
    assert_eq!(store.total_messages().await, 1);
    assert_eq!(store.queue_len("n1:news.*").await, 1);
    shutdown(kernel).await;
}

#[tokio::test]
async fn unrouted_topic_message_is_not_stored() {
    let (kernel, store) = start(1);
    kernel
        .submit_message_event_and_wait(topic_message("weather.rain", b"drizzle"))
        .await
        .expect("ignored, not failed");
    assert_eq!(store.total_messages().await, 0);
    shutdown(kernel).await;
}

#[tokio::test]
async fn closed_subscription_stops_receiving() {
    let (kernel, store) = start(1);
    let subscription = Subscription::non_durable_topic(ChannelId::new(), "sports.cricket", "n1");
    kernel
        .open_subscription(subscription.clone())
        .await
        .expect("open");
    kernel
        .submit_message_event_and_wait(topic_message("sports.cricket", b"first"))
        .await
        .expect("routed");
    assert!(kernel.close_subscription(&subscription).await.expect("close"));
    kernel
        .submit_message_event_and_wait(topic_message("sports.cricket", b"second"))
        .await
        .expect("ignored");
    assert_eq!(store.queue_len("n1:sports.cricket").await, 1);
    shutdown(kernel).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_get_strictly_increasing_ids() {
    let (kernel, store) = start(1);
    let publishers = 8;
    let per_publisher = 50;
    let mut tasks = Vec::new();
    for publisher in 0..publishers {
        let kernel = Arc::clone(&kernel);
        tasks.push(tokio::spawn(async move {
            for seq in 0..per_publisher {
                let payload = Bytes::from(format!("{publisher}:{seq}"));
                let message = Message::from_payload(MessageMetadata::queue("orders"), payload, 16);
                kernel.submit_message_event(message).await.expect("submit");
            }
        }));
    }
    for task in tasks {
        task.await.expect("publisher");
    }
    shutdown(kernel).await;

    let stored = store.queue_messages("orders").await;
    assert_eq!(stored.len(), publishers * per_publisher);
    let ids: Vec<u64> = stored.iter().map(|m| m.id().get()).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(ids.first(), Some(&1));
    assert_eq!(ids.last(), Some(&((publishers * per_publisher) as u64)));

    // Each publisher's own messages keep their submission order.
    for publisher in 0..publishers {
        let prefix = format!("{publisher}:");
        let seqs: Vec<usize> = stored
            .iter()
            .filter_map(|m| {
                let body = String::from_utf8(m.content().to_vec()).ok()?;
                body.strip_prefix(&prefix)?.parse().ok()
            })
            .collect();
        assert_eq!(seqs, (0..per_publisher).collect::<Vec<_>>());
    }
}
