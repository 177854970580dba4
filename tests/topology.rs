// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{connect, forwarding, recv_within};
use rabbitbus::{
    consumer::ConsumerStatus,
    exchange::{ExchangeKind, ExchangeOptions},
    message::MessageProperties,
    queue::QueueOptions,
    testing::{BrokerCall, MemoryBroker},
    transport::{Arguments, ConsumeOptions},
    BusError,
};

#[tokio::test]
async fn deleting_an_exchange_unbinds_before_deleting() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "topology");

    let events = conn.declare_exchange("events", ExchangeKind::Topic, ExchangeOptions::new());
    let audit = conn.declare_exchange("audit", ExchangeKind::Fanout, ExchangeOptions::new());
    let queue = conn.declare_queue("orders", QueueOptions::new());

    queue.bind(&events, "orders.#", Arguments::new()).await.unwrap();
    audit.bind(&events, "#", Arguments::new()).await.unwrap();
    assert_eq!(conn.bindings().len(), 2);
    assert_eq!(broker.bindings().len(), 2);

    conn.delete_exchange("events").await.unwrap();

    let calls = broker.calls();
    let delete_at = calls
        .iter()
        .position(|c| *c == BrokerCall::ExchangeDelete("events".into()))
        .expect("exchange deleted");
    let queue_unbind_at = calls
        .iter()
        .position(|c| matches!(c, BrokerCall::QueueUnbind { queue, .. } if queue == "orders"))
        .expect("queue unbound");
    let exchange_unbind_at = calls
        .iter()
        .position(|c| matches!(c, BrokerCall::ExchangeUnbind { destination, .. } if destination == "audit"))
        .expect("exchange unbound");

    assert!(queue_unbind_at < delete_at);
    assert!(exchange_unbind_at < delete_at);
    assert!(conn.bindings().is_empty());
    assert!(broker.bindings().is_empty());
    assert!(conn.exchange("events").is_none());
    assert!(conn.exchange("audit").is_some());
    assert!(!broker.has_exchange("events"));
}

#[tokio::test]
async fn deleting_a_queue_stops_its_consumer_and_bindings() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "topology");

    let events = conn.declare_exchange("events", ExchangeKind::Direct, ExchangeOptions::new());
    let queue = conn.declare_queue("jobs", QueueOptions::new());
    queue.bind(&events, "job", Arguments::new()).await.unwrap();

    let (handler, _rx) = forwarding();
    queue
        .activate_consumer(handler, ConsumeOptions::default())
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("jobs"), 1);

    conn.delete_queue("jobs").await.unwrap();

    assert_eq!(queue.consumer_status(), ConsumerStatus::Stopped);
    assert!(!broker.has_queue("jobs"));
    assert!(broker.bindings().is_empty());
    assert!(conn.queue("jobs").is_none());
}

#[tokio::test]
async fn incompatible_redeclaration_is_a_conflict() {
    let broker = MemoryBroker::new();
    let first = connect(&broker, "first");
    let second = connect(&broker, "second");

    first
        .declare_exchange("shared", ExchangeKind::Fanout, ExchangeOptions::new())
        .initialized()
        .await
        .unwrap();

    let conflicting = second.declare_exchange("shared", ExchangeKind::Topic, ExchangeOptions::new());
    let err = conflicting.initialized().await.unwrap_err();

    assert!(matches!(err, BusError::DeclarationConflict { .. }));
    assert!(second.exchange("shared").is_none());
}

#[tokio::test]
async fn checking_a_missing_queue_fails_without_creating_it() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "topology");

    let queue = conn.declare_queue("absent", QueueOptions::new().no_create());
    let err = queue.initialized().await.unwrap_err();

    assert!(matches!(err, BusError::DeclarationConflict { .. }));
    assert!(!broker.has_queue("absent"));
    assert_eq!(broker.count_calls(|c| matches!(c, BrokerCall::QueueDeclare(_))), 0);
}

#[tokio::test]
async fn a_second_consumer_on_the_same_queue_is_refused() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "consumers");
    let queue = conn.declare_queue("work", QueueOptions::new());

    let (first, _rx1) = forwarding();
    let (second, _rx2) = forwarding();

    queue
        .activate_consumer(first, ConsumeOptions::default())
        .await
        .unwrap();
    let err = queue
        .activate_consumer(second, ConsumeOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::ConsumerStateError(..)));
    assert_eq!(queue.consumer_status(), ConsumerStatus::Active);
    assert_eq!(broker.consumer_count("work"), 1);

    queue.stop_consumer().await.unwrap();
    queue.stop_consumer().await.unwrap();
    assert_eq!(queue.consumer_status(), ConsumerStatus::Stopped);
    assert_eq!(broker.count_calls(|c| matches!(c, BrokerCall::Cancel(_))), 1);

    let (again, mut rx) = forwarding();
    queue
        .activate_consumer(again, ConsumeOptions::default())
        .await
        .unwrap();
    queue
        .publish("hello", MessageProperties::default())
        .await
        .unwrap();

    let message = recv_within(&mut rx, 1000).await.expect("delivered");
    assert_eq!(message.data(), b"hello");
}

#[tokio::test]
async fn closing_twice_releases_everything_once() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "closing");

    conn.declare_exchange("events", ExchangeKind::Topic, ExchangeOptions::new())
        .initialized()
        .await
        .unwrap();
    conn.declare_queue("inbox", QueueOptions::new())
        .initialized()
        .await
        .unwrap();
    let channels = broker.open_channels();
    assert_eq!(channels, 2);

    conn.close().await.unwrap();
    conn.close().await.unwrap();

    assert_eq!(
        broker.count_calls(|c| *c == BrokerCall::CloseConnection),
        1
    );
    assert_eq!(
        broker.count_calls(|c| matches!(c, BrokerCall::CloseChannel(_))),
        channels
    );
    assert!(!conn.is_open());

    let err = conn
        .publish("events", "a", "late", Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Closed(_)));
}

#[tokio::test]
async fn resource_close_and_delete_are_issued_once() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "closing");

    let events = conn.declare_exchange("events", ExchangeKind::Topic, ExchangeOptions::new());
    let queue = conn.declare_queue("inbox", QueueOptions::new());
    events.initialized().await.unwrap();
    queue.initialized().await.unwrap();

    let (first, second) = tokio::join!(events.close(), events.close());
    assert_eq!(first, second);
    events.close().await.unwrap();

    queue.delete().await.unwrap();
    queue.delete().await.unwrap();

    assert_eq!(
        broker.count_calls(|c| matches!(c, BrokerCall::CloseChannel(_))),
        2
    );
    assert_eq!(
        broker.count_calls(|c| *c == BrokerCall::QueueDelete("inbox".into())),
        1
    );
    assert!(broker.has_exchange("events"));
}
