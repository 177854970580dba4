// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request / Response
//!
//! Requests sent through a resource share one reply destination: the broker's
//! direct reply-to pseudo-queue, consumed once per channel on first use. Each
//! request carries a fresh correlation id that is registered before the
//! request is published, so an immediate reply can never miss its entry.
//! Replies are matched by correlation id, delivered exactly once and removed.
//!
//! On top of the engine, [`RpcServer`] answers named resource requests
//! (`{"resource_name": ..., "handle": [...]}`) arriving on a queue.

use crate::{
    connection::Connection,
    errors::BusError,
    exchange::{Exchange, ExchangeKind, ExchangeOptions},
    message::{Message, MessageProperties},
    otel,
    queue::{Queue, QueueOptions},
    resource::{lock, spawn_shared, ResourceCore, SharedResult},
    transport::{AmqpChannel, Arguments, ConsumeOptions, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};
use tokio::{sync::oneshot, time};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Broker-provided pseudo-queue used as the reply destination of every request.
pub const DIRECT_REPLY_TO_QUEUE: &str = "amq.rabbitmq.reply-to";
/// Message kind marking a reply as a remote failure
pub const ERROR_REPLY_KIND: &str = "error";

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Result<Message, BusError>>>>>;

/// Correlation entry owned by one in-flight request.
///
/// Dropping it removes the entry, so a caller that stops waiting (a timeout
/// wrapper, an aborted task) never leaves a stale waiter behind.
struct PendingEntry<'a> {
    pending: &'a PendingReplies,
    correlation_id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.correlation_id);
    }
}

/// Correlation table and reply consumer of one resource.
#[derive(Default)]
pub(crate) struct RpcEngine {
    pending: PendingReplies,
    reply_consumer: Mutex<Option<SharedResult<()>>>,
}

impl RpcEngine {
    /// Fails every outstanding request with `err` and forgets the reply consumer.
    pub(crate) fn reset(&self, err: BusError) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        for (correlation_id, reply) in drained {
            debug!(correlation_id, "failing pending request");
            let _ = reply.send(Err(err.clone()));
        }
        lock(&self.reply_consumer).take();
    }

    pub(crate) fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Registers a waiter for `correlation_id`; the entry lives as long as
    /// the returned guard.
    fn register(
        &self,
        correlation_id: &str,
    ) -> (PendingEntry<'_>, oneshot::Receiver<Result<Message, BusError>>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(correlation_id.to_owned(), reply_tx);

        let entry = PendingEntry {
            pending: &self.pending,
            correlation_id: correlation_id.to_owned(),
        };
        (entry, reply_rx)
    }

    /// Publishes `request` and waits for its reply.
    ///
    /// A channel failure while publishing triggers one rebuild and one resend.
    /// `timeout` falls back to the connection's configured RPC timeout.
    pub(crate) async fn call(
        &self,
        core: &ResourceCore,
        exchange: &str,
        routing_key: &str,
        request: &Message,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let timeout = timeout.or_else(|| {
            core.connection()
                .ok()
                .and_then(|connection| connection.config.rpc_timeout())
        });
        let mut retried = false;

        loop {
            let channel = core.ready().await?;
            self.ensure_reply_consumer(&channel).await?;

            let correlation_id = Uuid::new_v4().to_string();
            let (entry, reply_rx) = self.register(&correlation_id);

            let mut properties = request.properties.clone();
            properties.correlation_id = Some(correlation_id.clone());
            properties.reply_to = Some(DIRECT_REPLY_TO_QUEUE.to_owned());
            otel::inject_context(&mut properties.headers);

            match channel
                .basic_publish(exchange, routing_key, request.data(), &properties)
                .await
            {
                Ok(()) => {
                    debug!(correlation_id, exchange, routing_key, "request sent");
                    let reply = self.wait(&correlation_id, reply_rx, timeout).await;
                    drop(entry);
                    return reply;
                }
                Err(err) => {
                    drop(entry);

                    if retried || !err.is_recoverable() {
                        return Err(err);
                    }
                    retried = true;

                    warn!(
                        error = err.to_string(),
                        name = core.name,
                        "request publish failed, rebuilding channels"
                    );
                    core.connection()?.rebuild_all(err).await?;
                }
            }
        }
    }

    async fn wait(
        &self,
        correlation_id: &str,
        reply: oneshot::Receiver<Result<Message, BusError>>,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let outcome = match timeout {
            Some(limit) => match time::timeout(limit, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock(&self.pending).remove(correlation_id);
                    return Err(BusError::RpcTimeout(correlation_id.to_owned()));
                }
            },
            None => reply.await,
        };

        outcome.unwrap_or_else(|_| Err(BusError::Closed(correlation_id.to_owned())))
    }

    async fn ensure_reply_consumer(&self, channel: &Arc<dyn AmqpChannel>) -> Result<(), BusError> {
        let pending = {
            let mut slot = lock(&self.reply_consumer);
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let pending = spawn_shared(consume_replies(
                        channel.clone(),
                        self.pending.clone(),
                    ));
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        let result = pending.await;
        if result.is_err() {
            lock(&self.reply_consumer).take();
        }
        result
    }
}

async fn consume_replies(
    channel: Arc<dyn AmqpChannel>,
    pending: PendingReplies,
) -> Result<(), BusError> {
    let options = ConsumeOptions {
        no_ack: true,
        ..Default::default()
    };
    let DeliveryStream {
        consumer_tag,
        mut deliveries,
    } = channel.basic_consume(DIRECT_REPLY_TO_QUEUE, &options).await?;

    debug!(consumer_tag, "reply consumer started");

    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
                warn!("discarding reply without correlation id");
                continue;
            };

            let waiter = lock(&pending).remove(&correlation_id);
            match waiter {
                Some(reply) => {
                    let _ = reply.send(Ok(Message::from_delivery(delivery, None)));
                }
                None => debug!(correlation_id, "discarding uncorrelated reply"),
            }
        }

        debug!(consumer_tag, "reply consumer closed");
    });

    Ok(())
}

/// Body of a request addressed to an [`RpcServer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub resource_name: String,
    #[serde(default)]
    pub handle: Vec<Value>,
}

/// Options of [`Connection::rpc_call`].
#[derive(Debug, Clone, Default)]
pub struct RpcClientOptions {
    pub kind: ExchangeKind,
    pub exchange: ExchangeOptions,
    /// Defaults to the resource name.
    pub routing_key: Option<String>,
    pub timeout: Option<Duration>,
}

/// Options of [`Connection::rpc_server`].
#[derive(Debug, Clone, Default)]
pub struct RpcServerOptions {
    pub kind: ExchangeKind,
    pub exchange: ExchangeOptions,
    pub queue: QueueOptions,
    pub consume: ConsumeOptions,
}

/// Answers requests for one named resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Answers one request.
    ///
    /// # Returns
    /// The JSON reply; an error is sent back as an error reply and surfaces as
    /// [`BusError::RemoteError`] on the caller's side
    async fn handle(&self, request: ClientRequest) -> Result<Value, BusError>;
}

#[async_trait]
impl<F, Fut> ResourceHandler for F
where
    F: Fn(ClientRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BusError>> + Send,
{
    async fn handle(&self, request: ClientRequest) -> Result<Value, BusError> {
        (self)(request).await
    }
}

type Resources = Arc<RwLock<HashMap<String, Arc<dyn ResourceHandler>>>>;

/// Serves named resources over a queue bound to an exchange.
pub struct RpcServer {
    queue: Queue,
    exchange: Exchange,
    routing_key: String,
    consume: ConsumeOptions,
    resources: Resources,
    fallback: Option<Arc<dyn ResourceHandler>>,
}

impl RpcServer {
    pub(crate) fn new(
        queue: Queue,
        exchange: Exchange,
        routing_key: &str,
        consume: ConsumeOptions,
        fallback: Option<Arc<dyn ResourceHandler>>,
    ) -> Self {
        RpcServer {
            queue,
            exchange,
            routing_key: routing_key.to_owned(),
            consume,
            resources: Arc::default(),
            fallback,
        }
    }

    /// Registers `handler` for `resource_name`. Returns false if the name was taken.
    pub fn add_resource<H>(&self, resource_name: &str, handler: H) -> bool
    where
        H: ResourceHandler + 'static,
    {
        let mut resources = self
            .resources
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if resources.contains_key(resource_name) {
            return false;
        }
        resources.insert(resource_name.to_owned(), Arc::new(handler));
        true
    }

    /// Unregisters `resource_name`. Returns false if it was not registered.
    pub fn remove_resource(&self, resource_name: &str) -> bool {
        self.resources
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(resource_name)
            .is_some()
    }

    /// Registered resource names, sorted.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .resources
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// The queue requests are consumed from.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Binds the queue and starts answering requests.
    pub async fn start(&self) -> Result<(), BusError> {
        self.queue
            .bind(&self.exchange, &self.routing_key, Arguments::new())
            .await?;

        let resources = self.resources.clone();
        let fallback = self.fallback.clone();

        self.queue
            .activate_consumer(
                move |message: Message| {
                    let resources = resources.clone();
                    let fallback = fallback.clone();
                    async move { serve(message, resources, fallback).await }
                },
                self.consume.clone(),
            )
            .await?;

        debug!(
            queue = self.queue.name(),
            exchange = self.exchange.name(),
            routing_key = self.routing_key,
            "rpc server started"
        );
        Ok(())
    }

    /// Stops answering requests. The queue and its binding stay in place.
    pub async fn stop(&self) -> Result<(), BusError> {
        self.queue.stop_consumer().await
    }
}

/// Answers one request and acks it.
///
/// Unknown resources and failing or panicking handlers produce an error reply;
/// requests without `reply_to` are acked without an answer.
async fn serve(
    message: Message,
    resources: Resources,
    fallback: Option<Arc<dyn ResourceHandler>>,
) -> Result<(), BusError> {
    let outcome = match message.json::<ClientRequest>() {
        Ok(request) => {
            let handler = resources
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(&request.resource_name)
                .cloned()
                .or(fallback);

            match handler {
                Some(handler) => {
                    let resource_name = request.resource_name.clone();
                    AssertUnwindSafe(handler.handle(request))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            Err(BusError::RemoteError(format!(
                                "resource `{}` panicked",
                                resource_name
                            )))
                        })
                }
                None => Err(BusError::RemoteError(format!(
                    "resource `{}` is not registered",
                    request.resource_name
                ))),
            }
        }
        Err(err) => Err(err),
    };

    if message.properties.reply_to.is_some() {
        let sent = match outcome {
            Ok(value) => message.reply(value).await,
            Err(err) => {
                error!(error = err.to_string(), "rpc resource failed");
                message
                    .reply_with(
                        json!({ "message": remote_message(&err) }),
                        MessageProperties::default().with_kind(ERROR_REPLY_KIND),
                    )
                    .await
            }
        };
        if let Err(err) = sent {
            error!(error = err.to_string(), "failure to send rpc reply");
        }
    } else {
        warn!("rpc request without reply_to, dropping answer");
    }

    message.ack().await
}

fn remote_message(err: &BusError) -> String {
    match err {
        BusError::RemoteError(msg) => msg.clone(),
        other => other.to_string(),
    }
}

/// Turns a reply tagged as an error into [`BusError::RemoteError`].
pub(crate) fn into_result(reply: Message) -> Result<Message, BusError> {
    if reply.properties.kind.as_deref() != Some(ERROR_REPLY_KIND) {
        return Ok(reply);
    }

    let detail = reply
        .json::<Value>()
        .ok()
        .and_then(|body| body.get("message").and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| String::from_utf8_lossy(reply.data()).into_owned());
    Err(BusError::RemoteError(detail))
}

impl Connection {
    /// Calls `resource_name` on the server listening behind `exchange_name`.
    pub async fn rpc_call(
        &self,
        exchange_name: &str,
        resource_name: &str,
        parameters: Vec<Value>,
        options: RpcClientOptions,
    ) -> Result<Message, BusError> {
        let exchange = self.declare_exchange(exchange_name, options.kind, options.exchange);
        let request = ClientRequest {
            resource_name: resource_name.to_owned(),
            handle: parameters,
        };
        let routing_key = options.routing_key.as_deref().unwrap_or(resource_name);

        let content = crate::message::Content::json(&request)?;
        let reply = exchange.rpc(content, routing_key, options.timeout).await?;
        into_result(reply)
    }

    /// Callback flavour of [`Connection::rpc_call`]; the callback runs exactly once.
    pub fn rpc_call_with_callback<F>(
        &self,
        exchange_name: &str,
        resource_name: &str,
        parameters: Vec<Value>,
        options: RpcClientOptions,
        callback: F,
    ) where
        F: FnOnce(Result<Message, BusError>) + Send + 'static,
    {
        let connection = self.clone();
        let exchange_name = exchange_name.to_owned();
        let resource_name = resource_name.to_owned();

        tokio::spawn(async move {
            callback(
                connection
                    .rpc_call(&exchange_name, &resource_name, parameters, options)
                    .await,
            );
        });
    }

    /// Creates a server whose resources are registered with
    /// [`RpcServer::add_resource`] before calling [`RpcServer::start`].
    pub fn rpc_server(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
        options: RpcServerOptions,
    ) -> RpcServer {
        let exchange = self.declare_exchange(exchange_name, options.kind, options.exchange);
        let queue = self.declare_queue(queue_name, options.queue);
        RpcServer::new(queue, exchange, routing_key, options.consume, None)
    }

    /// Serves every request arriving through `routing_key` with `handler`,
    /// unless a named resource is registered on the returned server.
    pub async fn rpc_serve<H>(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
        handler: H,
        options: RpcServerOptions,
    ) -> Result<RpcServer, BusError>
    where
        H: ResourceHandler + 'static,
    {
        let exchange = self.declare_exchange(exchange_name, options.kind, options.exchange);
        let queue = self.declare_queue(queue_name, options.queue);
        let server = RpcServer::new(
            queue,
            exchange,
            routing_key,
            options.consume,
            Some(Arc::new(handler)),
        );
        server.start().await?;
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Content;

    #[test]
    fn client_request_wire_format() {
        let request = ClientRequest {
            resource_name: "users.find".into(),
            handle: vec![json!(42), json!("active")],
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({"resource_name": "users.find", "handle": [42, "active"]})
        );

        let decoded: ClientRequest =
            serde_json::from_value(json!({"resource_name": "ping"})).unwrap();
        assert!(decoded.handle.is_empty());
    }

    #[test]
    fn error_replies_become_remote_errors() {
        let reply = Message::new(
            Content::Json(json!({"message": "user not found"})),
            MessageProperties::default().with_kind(ERROR_REPLY_KIND),
        );
        assert_eq!(
            into_result(reply),
            Err(BusError::RemoteError("user not found".into()))
        );

        let ok = Message::new(json!({"id": 1}), MessageProperties::default());
        assert!(into_result(ok).is_ok());
    }

    #[tokio::test]
    async fn reset_fails_every_pending_request() {
        let engine = RpcEngine::default();
        let (tx, rx) = oneshot::channel();
        lock(&engine.pending).insert("c-1".into(), tx);

        engine.reset(BusError::ChannelError("rebuilt".into()));

        assert_eq!(engine.pending_count(), 0);
        assert_eq!(
            rx.await.unwrap().unwrap_err(),
            BusError::ChannelError("rebuilt".into())
        );
    }

    #[tokio::test]
    async fn timed_out_request_leaves_no_entry() {
        let engine = RpcEngine::default();
        let (tx, rx) = oneshot::channel();
        lock(&engine.pending).insert("c-2".into(), tx);

        let result = engine
            .wait("c-2", rx, Some(Duration::from_millis(5)))
            .await;

        assert_eq!(result.unwrap_err(), BusError::RpcTimeout("c-2".into()));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_requests_leave_no_entry() {
        let engine = RpcEngine::default();
        let engine = &engine;

        let waiting = async move {
            let (_entry, reply) = engine.register("c-3");
            engine.wait("c-3", reply, None).await
        };
        assert_eq!(engine.pending_count(), 0);

        let abandoned = time::timeout(Duration::from_millis(5), waiting).await;
        assert!(abandoned.is_err());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn answered_requests_release_their_entry() {
        let engine = RpcEngine::default();
        let (entry, reply) = engine.register("c-4");
        assert_eq!(engine.pending_count(), 1);

        let waiter = lock(&engine.pending).remove("c-4").unwrap();
        waiter
            .send(Ok(Message::new("pong", MessageProperties::default())))
            .unwrap();
        assert_eq!(reply.await.unwrap().unwrap().data(), b"pong");

        drop(entry);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn panicking_resources_answer_with_an_error() {
        let resources: Resources = Arc::default();
        resources.write().unwrap().insert(
            "explode".into(),
            Arc::new(|_request: ClientRequest| async {
                if true {
                    panic!("resource bug");
                }
                Ok::<Value, BusError>(Value::Null)
            }),
        );

        // no reply_to and no acker: serve only has to survive the panic
        let request = Message::new(
            json!({ "resource_name": "explode", "handle": [] }),
            MessageProperties::default(),
        );
        assert!(serve(request, resources, None).await.is_ok());
    }
}
