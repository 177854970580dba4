// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{connect, forwarding, recv_within};
use rabbitbus::{
    exchange::{ExchangeKind, ExchangeOptions},
    queue::QueueOptions,
    rpc::{ClientRequest, RpcClientOptions, RpcServerOptions},
    testing::MemoryBroker,
    transport::{Arguments, ConsumeOptions},
    BusError,
};
use serde_json::{json, Value};
use std::time::Duration;

fn client_options() -> RpcClientOptions {
    RpcClientOptions {
        timeout: Some(Duration::from_secs(2)),
        ..Default::default()
    }
}

#[tokio::test]
async fn resources_answer_through_the_server() {
    let broker = MemoryBroker::new();
    let server_conn = connect(&broker, "server");
    let client_conn = connect(&broker, "client");

    let server = server_conn.rpc_server("users.rpc", "users", "users.find", RpcServerOptions::default());
    assert!(server.add_resource("users.find", |request: ClientRequest| async move {
        Ok::<Value, BusError>(json!({ "id": request.handle[0], "name": "ada" }))
    }));
    server.start().await.unwrap();

    let reply = client_conn
        .rpc_call("users", "users.find", vec![json!(7)], client_options())
        .await
        .unwrap();

    assert_eq!(reply.json::<Value>().unwrap(), json!({ "id": 7, "name": "ada" }));
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn handler_failures_come_back_as_remote_errors() {
    let broker = MemoryBroker::new();
    let server_conn = connect(&broker, "server");
    let client_conn = connect(&broker, "client");

    server_conn
        .rpc_serve(
            "billing.rpc",
            "billing",
            "invoice",
            |_request: ClientRequest| async {
                Err::<Value, _>(BusError::RemoteError("invoice not found".into()))
            },
            RpcServerOptions::default(),
        )
        .await
        .unwrap();

    let err = client_conn
        .rpc_call("billing", "invoice", vec![json!("inv-1")], client_options())
        .await
        .unwrap_err();

    assert_eq!(err, BusError::RemoteError("invoice not found".into()));
}

#[tokio::test]
async fn unknown_resources_are_reported_to_the_caller() {
    let broker = MemoryBroker::new();
    let server_conn = connect(&broker, "server");
    let client_conn = connect(&broker, "client");

    let server = server_conn.rpc_server("catalog.rpc", "catalog", "#", RpcServerOptions {
        kind: rabbitbus::exchange::ExchangeKind::Topic,
        ..Default::default()
    });
    server.start().await.unwrap();

    let err = client_conn
        .rpc_call(
            "catalog",
            "catalog.missing",
            vec![],
            RpcClientOptions {
                kind: rabbitbus::exchange::ExchangeKind::Topic,
                ..client_options()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::RemoteError(msg) if msg.contains("catalog.missing")));
}

#[tokio::test]
async fn replies_are_matched_by_correlation_id_not_order() {
    let broker = MemoryBroker::new();
    let server_conn = connect(&broker, "server");
    let client_conn = connect(&broker, "client");

    let work = server_conn.declare_queue("work", QueueOptions::new());
    let (handler, mut requests) = forwarding();
    work.activate_consumer(handler, ConsumeOptions::default())
        .await
        .unwrap();

    let client_queue = client_conn.declare_queue("work", QueueOptions::new());
    let first = {
        let queue = client_queue.clone();
        tokio::spawn(async move { queue.rpc("first", Some(Duration::from_secs(2))).await })
    };
    let first_request = recv_within(&mut requests, 1000).await.expect("first request");

    let second = {
        let queue = client_queue.clone();
        tokio::spawn(async move { queue.rpc("second", Some(Duration::from_secs(2))).await })
    };
    let second_request = recv_within(&mut requests, 1000).await.expect("second request");

    second_request.reply(second_request.data().to_vec()).await.unwrap();
    first_request.reply(first_request.data().to_vec()).await.unwrap();
    first_request.ack().await.unwrap();
    second_request.ack().await.unwrap();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.data(), b"first");
    assert_eq!(second.data(), b"second");
}

#[tokio::test]
async fn concurrent_exchange_calls_each_get_their_own_reply() {
    let broker = MemoryBroker::new();
    let server_conn = connect(&broker, "server");
    let client_conn = connect(&broker, "client");

    let calc = server_conn.declare_exchange("calc", ExchangeKind::Direct, ExchangeOptions::new());
    let inbox = server_conn.declare_queue("calc.requests", QueueOptions::new());
    inbox.bind(&calc, "sum", Arguments::new()).await.unwrap();
    let (handler, mut requests) = forwarding();
    inbox
        .activate_consumer(handler, ConsumeOptions::default())
        .await
        .unwrap();

    let call = |operand: i64| {
        let conn = client_conn.clone();
        tokio::spawn(async move {
            conn.rpc_call("calc", "sum", vec![json!(operand)], client_options())
                .await
        })
    };
    let first = call(1);
    let second = call(2);

    let earlier = recv_within(&mut requests, 1000).await.expect("request");
    let later = recv_within(&mut requests, 1000).await.expect("request");

    // answer the most recent request first
    for request in [&later, &earlier] {
        let body: ClientRequest = request.json().unwrap();
        request
            .reply(json!({ "operand": body.handle[0] }))
            .await
            .unwrap();
        request.ack().await.unwrap();
    }

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.json::<Value>().unwrap(), json!({ "operand": 1 }));
    assert_eq!(second.json::<Value>().unwrap(), json!({ "operand": 2 }));
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn unanswered_requests_time_out() {
    let broker = MemoryBroker::new();
    let conn = connect(&broker, "client");
    let queue = conn.declare_queue("nobody-home", QueueOptions::new());

    let err = queue
        .rpc("ping", Some(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert!(matches!(err, BusError::RpcTimeout(_)));
}

#[tokio::test]
async fn callbacks_run_once_with_the_reply() {
    let broker = MemoryBroker::new();
    let server_conn = connect(&broker, "server");
    let client_conn = connect(&broker, "client");

    server_conn
        .rpc_serve(
            "echo.rpc",
            "echo",
            "echo",
            |request: ClientRequest| async move { Ok::<Value, BusError>(json!(request.handle)) },
            RpcServerOptions::default(),
        )
        .await
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client_conn.rpc_call_with_callback(
        "echo",
        "echo",
        vec![json!(1), json!(2)],
        client_options(),
        move |result| {
            let _ = tx.send(result);
        },
    );

    let reply = recv_within(&mut rx, 2000).await.expect("callback ran").unwrap();
    assert_eq!(reply.json::<Value>().unwrap(), json!([1, 2]));
    assert!(recv_within(&mut rx, 50).await.is_none());
}
