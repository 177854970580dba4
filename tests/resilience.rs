// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{connect, forwarding, recv_within};
use rabbitbus::{
    connection::{ConnectionEvent, ConnectionState, PublishOptions},
    consumer::ConsumerStatus,
    exchange::{ExchangeKind, ExchangeOptions},
    message::MessageProperties,
    queue::QueueOptions,
    testing::{BrokerCall, MemoryBroker},
    transport::{Arguments, ConsumeOptions},
    BusError,
};
use std::time::Duration;

#[tokio::test]
async fn a_failed_publish_rebuilds_the_topology_and_retries_once() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "resilience");

    let orders = conn.declare_exchange("orders", ExchangeKind::Topic, ExchangeOptions::new());
    let audit = conn.declare_exchange("audit", ExchangeKind::Fanout, ExchangeOptions::new());
    let inbox = conn.declare_queue("inbox", QueueOptions::new());
    inbox.bind(&orders, "orders.#", Arguments::new()).await.unwrap();
    audit.initialized().await.unwrap();

    let (handler, mut received) = forwarding();
    inbox
        .activate_consumer(handler, ConsumeOptions::default())
        .await
        .unwrap();

    broker.clear_calls();
    assert_eq!(broker.fail_channels(), 3);

    orders
        .publish("created", "orders.created", MessageProperties::default())
        .await
        .unwrap();

    let declared = |name: &'static str| {
        broker.count_calls(move |c| matches!(c, BrokerCall::ExchangeDeclare { name: n, .. } if n == name))
    };
    assert_eq!(declared("orders"), 1);
    assert_eq!(declared("audit"), 1);
    assert_eq!(
        broker.count_calls(|c| *c == BrokerCall::QueueDeclare("inbox".into())),
        1
    );
    assert_eq!(
        broker.count_calls(|c| matches!(c, BrokerCall::QueueBind { queue, .. } if queue == "inbox")),
        1
    );
    assert_eq!(
        broker.count_calls(|c| matches!(c, BrokerCall::Consume { queue, .. } if queue == "inbox")),
        1
    );
    assert_eq!(
        broker.count_calls(|c| matches!(c, BrokerCall::Publish { exchange, .. } if exchange == "orders")),
        1
    );

    let message = recv_within(&mut received, 1000).await.expect("delivered");
    assert_eq!(message.data(), b"created");
    assert!(recv_within(&mut received, 100).await.is_none());
    assert_eq!(inbox.consumer_status(), ConsumerStatus::Active);
}

#[tokio::test]
async fn a_dropped_connection_is_rebuilt_in_the_background() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "resilience");

    let inbox = conn.declare_queue("inbox", QueueOptions::new().exclusive());
    let (handler, mut received) = forwarding();
    inbox
        .activate_consumer(handler, ConsumeOptions::default())
        .await
        .unwrap();

    let mut events = conn.events();
    broker.drop_connection();
    assert!(!broker.has_queue("inbox"));

    let mut saw_disconnect = false;
    let reconnected = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Disconnected(_)) => saw_disconnect = true,
                Ok(ConnectionEvent::Reconnected) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(saw_disconnect);
    assert!(reconnected);
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(broker.count_calls(|c| *c == BrokerCall::Connect), 2);
    assert!(broker.has_queue("inbox"));
    assert_eq!(broker.consumer_count("inbox"), 1);

    inbox
        .publish("after", MessageProperties::default())
        .await
        .unwrap();
    let message = recv_within(&mut received, 1000).await.expect("delivered");
    assert_eq!(message.data(), b"after");
}

#[tokio::test]
async fn unacked_deliveries_come_back_after_a_channel_failure() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "resilience");
    let jobs = conn.declare_queue("jobs", QueueOptions::new());

    let (handler, mut received) = forwarding();
    jobs.activate_consumer(handler, ConsumeOptions::default())
        .await
        .unwrap();
    jobs.publish("job-1", MessageProperties::default())
        .await
        .unwrap();

    let first = recv_within(&mut received, 1000).await.expect("delivered");
    assert!(!first.fields.as_ref().unwrap().redelivered);

    broker.fail_channels();
    let err = first.ack().await.unwrap_err();
    assert!(err.is_recoverable());

    // the next publish notices the dead channel and rebuilds
    jobs.publish("job-2", MessageProperties::default())
        .await
        .unwrap();

    let again = recv_within(&mut received, 1000).await.expect("redelivered");
    assert_eq!(again.data(), b"job-1");
    assert!(again.fields.as_ref().unwrap().redelivered);
    again.ack().await.unwrap();

    let next = recv_within(&mut received, 1000).await.expect("delivered");
    assert_eq!(next.data(), b"job-2");
}

#[tokio::test]
async fn connect_failures_are_reported_and_retried_on_demand() {
    let broker = MemoryBroker::new();
    broker.refuse_next_connects(1);
    let conn = connect(&broker, "resilience");

    let err = conn.open().await.unwrap_err();
    assert!(matches!(err, BusError::ConnectionError(_)));
    assert!(!conn.is_open());

    conn.open().await.unwrap();
    assert!(conn.is_open());
}

#[tokio::test]
async fn declarations_refused_before_connecting_recover_once_connected() {
    let broker = MemoryBroker::new();
    broker.refuse_next_connects(1);
    let conn = connect(&broker, "resilience");

    let err = conn
        .publish("events", "orders.created", "lost", PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::ConnectionError(_)));
    let events = conn.exchange("events").expect("still registered");

    conn.open().await.unwrap();
    assert!(conn.is_open());

    events
        .publish("first", "orders.created", MessageProperties::default())
        .await
        .unwrap();
    conn.publish("events", "orders.created", "second", PublishOptions::default())
        .await
        .unwrap();

    assert!(broker.has_exchange("events"));
    assert_eq!(
        broker.count_calls(|c| matches!(c, BrokerCall::Publish { exchange, .. } if exchange == "events")),
        2
    );
}

#[tokio::test]
async fn a_failed_queue_declaration_is_retried_when_declared_again() {
    let broker = MemoryBroker::new();
    broker.refuse_next_connects(1);
    let conn = connect(&broker, "resilience");

    let inbox = conn.declare_queue("inbox", QueueOptions::new());
    assert!(matches!(
        inbox.initialized().await,
        Err(BusError::ConnectionError(_))
    ));

    let again = conn.declare_queue("inbox", QueueOptions::new());
    again.initialized().await.unwrap();
    inbox.initialized().await.unwrap();
    assert!(broker.has_queue("inbox"));
}
