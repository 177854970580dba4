// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use rabbitbus::{
    config::ConnectionConfig, consumer::MessageHandler, message::Message, testing::MemoryBroker,
    BusError, Connection,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

pub fn connect(broker: &MemoryBroker, app_name: &str) -> Connection {
    let config = ConnectionConfig {
        app_name: app_name.to_owned(),
        ..Default::default()
    };
    Connection::new(config, Arc::new(broker.clone()))
}

/// Handler forwarding every message into a channel.
pub fn forwarding() -> (
    impl MessageHandler + 'static,
    mpsc::UnboundedReceiver<Message>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |message: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(message);
            Ok::<(), BusError>(())
        }
    };
    (handler, rx)
}

pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, millis: u64) -> Option<T> {
    tokio::time::timeout(Duration::from_millis(millis), rx.recv())
        .await
        .ok()
        .flatten()
}
