// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A broker double implementing the transport traits without a network.
//! It routes through direct, fanout and topic exchanges, honours
//! exchange-to-exchange bindings, tracks unacknowledged deliveries per channel
//! and answers direct reply-to requests. Every call reaching the broker is
//! recorded so tests can assert on declarations, bindings and publishes.
//!
//! Headers exchanges deliver to every bound queue; binding arguments are not
//! evaluated. Auto-delete queues are never removed automatically.
//!
//! Faults can be injected with [`MemoryBroker::fail_channels`],
//! [`MemoryBroker::drop_connection`] and [`MemoryBroker::refuse_next_connects`].

use crate::{
    config::ConnectionConfig,
    errors::BusError,
    exchange::{ExchangeKind, ExchangeOptions},
    message::{DeliveryFields, MessageProperties},
    pattern::TopicPattern,
    queue::QueueOptions,
    resource::lock,
    rpc::DIRECT_REPLY_TO_QUEUE,
    transport::{
        AmqpChannel, AmqpConnection, Arguments, ConsumeOptions, Delivery, DeliveryStream,
        ErrorHandler, QueueDeclared, Transport,
    },
};
use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// A protocol operation that reached the broker.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerCall {
    Connect,
    CloseConnection,
    CreateChannel(u64),
    CloseChannel(u64),
    ExchangeDeclare {
        name: String,
        kind: ExchangeKind,
    },
    ExchangeCheck(String),
    ExchangeDelete(String),
    QueueDeclare(String),
    QueueCheck(String),
    QueueDelete(String),
    QueueBind {
        queue: String,
        exchange: String,
        pattern: String,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        pattern: String,
    },
    ExchangeBind {
        destination: String,
        source: String,
        pattern: String,
    },
    ExchangeUnbind {
        destination: String,
        source: String,
        pattern: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        properties: MessageProperties,
    },
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Cancel(String),
    Qos(u16),
    Ack(u64),
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Reject {
        delivery_tag: u64,
        requeue: bool,
    },
    Recover,
}

#[derive(Debug, Clone)]
struct Pending {
    data: Vec<u8>,
    properties: MessageProperties,
    exchange: String,
    routing_key: String,
    redelivered: bool,
}

struct Subscriber {
    tag: String,
    channel: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    consumers: Vec<Subscriber>,
    next_consumer: usize,
    owner: Option<u64>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    next_tag: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, (String, Pending)>,
    reply: Option<(String, mpsc::UnboundedSender<Delivery>)>,
}

struct OpenConnection {
    open: bool,
    handlers: Vec<Arc<dyn Fn(BusError) + Send + Sync>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteBinding {
    destination: String,
    source: String,
    pattern: String,
    args: Arguments,
    to_exchange: bool,
    // compiled once, used when the source is a topic exchange
    topic: TopicPattern,
}

impl RouteBinding {
    fn new(
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
        to_exchange: bool,
    ) -> Result<RouteBinding, BusError> {
        Ok(RouteBinding {
            destination: destination.to_owned(),
            source: source.to_owned(),
            pattern: pattern.to_owned(),
            args: args.clone(),
            to_exchange,
            topic: TopicPattern::new(pattern)?,
        })
    }

    fn matches(&self, kind: &ExchangeKind, routing_key: &str) -> bool {
        match kind {
            ExchangeKind::Direct => self.pattern == routing_key,
            ExchangeKind::Topic => self.topic.matches(routing_key),
            ExchangeKind::Fanout | ExchangeKind::Headers => true,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<RouteBinding>,
    connections: HashMap<u64, OpenConnection>,
    channels: HashMap<u64, ChannelState>,
    calls: Vec<BrokerCall>,
    refuse_connects: usize,
    next_id: u64,
}

fn channel_closed(id: u64) -> BusError {
    BusError::ChannelError(format!("channel {} is closed", id))
}

fn not_found(kind: &str, name: &str) -> BusError {
    BusError::declaration(name, format!("NOT_FOUND - no {} '{}'", kind, name))
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&self, exchange: &str, routing_keys: &[&str]) -> BTreeSet<String> {
        let mut queues = BTreeSet::new();

        if exchange.is_empty() {
            for key in routing_keys {
                if self.queues.contains_key(*key) {
                    queues.insert((*key).to_owned());
                }
            }
            return queues;
        }

        let mut visited = HashSet::new();
        let mut pending = vec![exchange.to_owned()];
        while let Some(current) = pending.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(kind) = self.exchanges.get(&current) else {
                continue;
            };
            for binding in self.bindings.iter().filter(|b| b.source == current) {
                if !routing_keys
                    .iter()
                    .any(|key| binding.matches(kind, key))
                {
                    continue;
                }
                if binding.to_exchange {
                    pending.push(binding.destination.clone());
                } else {
                    queues.insert(binding.destination.clone());
                }
            }
        }

        queues
    }

    /// Hands ready messages of `queue` to its consumers, round robin.
    fn deliver(&mut self, queue: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(state) = queues.get_mut(queue) else {
            return;
        };

        while !state.ready.is_empty() && !state.consumers.is_empty() {
            let count = state.consumers.len();
            let mut delivered = false;

            for step in 0..count {
                let index = (state.next_consumer + step) % count;
                let subscriber = &state.consumers[index];
                let Some(channel) = channels.get_mut(&subscriber.channel) else {
                    continue;
                };
                if !channel.open {
                    continue;
                }
                if !subscriber.no_ack
                    && channel.prefetch > 0
                    && channel.unacked.len() >= channel.prefetch as usize
                {
                    continue;
                }

                let Some(pending) = state.ready.pop_front() else {
                    return;
                };
                channel.next_tag += 1;
                let delivery_tag = channel.next_tag;
                let delivery = Delivery {
                    data: pending.data.clone(),
                    properties: pending.properties.clone(),
                    fields: DeliveryFields {
                        consumer_tag: subscriber.tag.clone(),
                        delivery_tag,
                        redelivered: pending.redelivered,
                        exchange: pending.exchange.clone(),
                        routing_key: pending.routing_key.clone(),
                    },
                };

                if subscriber.tx.send(delivery).is_err() {
                    // receiver gone: drop the consumer and retry the message
                    state.ready.push_front(pending);
                    state.consumers.remove(index);
                    delivered = true;
                    break;
                }

                if !subscriber.no_ack {
                    channel
                        .unacked
                        .insert(delivery_tag, (queue.to_owned(), pending));
                }
                state.next_consumer = (index + 1) % count;
                delivered = true;
                break;
            }

            if !delivered {
                return;
            }
        }
    }

    fn enqueue(&mut self, queue: &str, pending: Pending, front: bool) {
        if let Some(state) = self.queues.get_mut(queue) {
            if front {
                state.ready.push_front(pending);
            } else {
                state.ready.push_back(pending);
            }
        }
    }

    fn settle(&mut self, channel: u64, tags: Vec<u64>, requeue: bool) -> Result<(), BusError> {
        let mut touched = BTreeSet::new();
        let mut returned = Vec::new();
        {
            let state = self
                .channels
                .get_mut(&channel)
                .ok_or_else(|| channel_closed(channel))?;
            for tag in tags {
                let (queue, mut pending) = state.unacked.remove(&tag).ok_or_else(|| {
                    BusError::ChannelError(format!("PRECONDITION_FAILED - unknown delivery tag {}", tag))
                })?;
                if requeue {
                    pending.redelivered = true;
                    returned.push((queue, pending));
                }
            }
        }

        // restore original order at the head of each queue
        for (queue, pending) in returned.into_iter().rev() {
            touched.insert(queue.clone());
            self.enqueue(&queue, pending, true);
        }
        for queue in touched {
            self.deliver(&queue);
        }
        Ok(())
    }

    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        channel.reply = None;
        let unacked = std::mem::take(&mut channel.unacked);

        for state in self.queues.values_mut() {
            state.consumers.retain(|s| s.channel != id);
            state.next_consumer = 0;
        }

        let mut touched = BTreeSet::new();
        for (_, (queue, mut pending)) in unacked.into_iter().rev() {
            pending.redelivered = true;
            touched.insert(queue.clone());
            self.enqueue(&queue, pending, true);
        }
        for queue in touched {
            self.deliver(&queue);
        }
    }

    fn close_connection(&mut self, id: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(channel, _)| *channel)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.remove_queue(&queue);
        }

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.open = false;
        }
    }

    fn remove_queue(&mut self, name: &str) -> u32 {
        self.bindings
            .retain(|b| b.to_exchange || b.destination != name);
        self.queues
            .remove(name)
            .map(|q| q.ready.len() as u32)
            .unwrap_or(0)
    }

    fn publish(
        &mut self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        let mut properties = properties.clone();

        if properties.reply_to.as_deref() == Some(DIRECT_REPLY_TO_QUEUE) {
            let has_reply_consumer = self
                .channels
                .get(&channel)
                .is_some_and(|c| c.reply.is_some());
            if !has_reply_consumer {
                return Err(BusError::declaration(
                    DIRECT_REPLY_TO_QUEUE,
                    "PRECONDITION_FAILED - fast reply consumer does not exist",
                ));
            }
            properties.reply_to = Some(format!("{}.{}", DIRECT_REPLY_TO_QUEUE, channel));
        }

        if exchange.is_empty() {
            if let Some(target) = routing_key
                .strip_prefix(DIRECT_REPLY_TO_QUEUE)
                .and_then(|rest| rest.strip_prefix('.'))
            {
                let reply = target
                    .parse::<u64>()
                    .ok()
                    .and_then(|id| self.channels.get(&id))
                    .filter(|c| c.open)
                    .and_then(|c| c.reply.as_ref());
                if let Some((tag, tx)) = reply {
                    let _ = tx.send(Delivery {
                        data: payload.to_vec(),
                        properties,
                        fields: DeliveryFields {
                            consumer_tag: tag.clone(),
                            delivery_tag: 0,
                            redelivered: false,
                            exchange: String::new(),
                            routing_key: routing_key.to_owned(),
                        },
                    });
                }
                return Ok(());
            }
        } else if !self.exchanges.contains_key(exchange) {
            return Err(not_found("exchange", exchange));
        }

        let mut keys: Vec<&str> = vec![routing_key];
        let cc = properties.cc.clone();
        let bcc = std::mem::take(&mut properties.bcc);
        keys.extend(cc.iter().map(String::as_str));
        keys.extend(bcc.iter().map(String::as_str));

        let targets = self.route(exchange, &keys);
        debug!(exchange, routing_key, queues = targets.len(), "message routed");

        for queue in targets {
            self.enqueue(
                &queue,
                Pending {
                    data: payload.to_vec(),
                    properties: properties.clone(),
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                },
                false,
            );
            self.deliver(&queue);
        }
        Ok(())
    }
}

/// In-memory broker shared by every connection it hands out.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call recorded so far, in order.
    pub fn calls(&self) -> Vec<BrokerCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&BrokerCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    /// Messages waiting in `queue` that no consumer has received yet.
    pub fn queue_depth(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        lock(&self.state)
            .queues
            .get(name)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    /// Deliveries handed out on open channels and not settled yet.
    pub fn unacked_count(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .filter(|c| c.open)
            .map(|c| c.unacked.len())
            .sum()
    }

    /// Current bindings as `(source, destination, pattern)`.
    pub fn bindings(&self) -> Vec<(String, String, String)> {
        let mut bindings: Vec<(String, String, String)> = lock(&self.state)
            .bindings
            .iter()
            .map(|b| (b.source.clone(), b.destination.clone(), b.pattern.clone()))
            .collect();
        bindings.sort();
        bindings
    }

    pub fn open_connections(&self) -> usize {
        lock(&self.state)
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    pub fn open_channels(&self) -> usize {
        lock(&self.state).channels.values().filter(|c| c.open).count()
    }

    /// Publishes as an outside producer would, without going through a bus.
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        lock(&self.state).publish(0, exchange, routing_key, payload, &properties)
    }

    /// Closes every open channel while keeping connections up. Returns how
    /// many channels were closed.
    pub fn fail_channels(&self) -> usize {
        let mut state = lock(&self.state);
        let open: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in &open {
            state.close_channel(*id);
        }
        open.len()
    }

    /// Drops every open connection and notifies their error handlers.
    pub fn drop_connection(&self) {
        let handlers = {
            let mut state = lock(&self.state);
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();

            let mut handlers = Vec::new();
            for id in open {
                state.close_connection(id);
                if let Some(conn) = state.connections.get(&id) {
                    handlers.extend(conn.handlers.iter().cloned());
                }
            }
            handlers
        };

        for handler in handlers {
            handler(BusError::ConnectionError(
                "CONNECTION_FORCED - broker forced connection closure".to_owned(),
            ));
        }
    }

    /// Makes the next `attempts` connection attempts fail.
    pub fn refuse_next_connects(&self, attempts: usize) {
        lock(&self.state).refuse_connects = attempts;
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, _cfg: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>, BusError> {
        let mut state = lock(&self.state);
        state.calls.push(BrokerCall::Connect);

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BusError::ConnectionError("connection refused".to_owned()));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            OpenConnection {
                open: true,
                handlers: Vec::new(),
            },
        );

        Ok(Arc::new(MemoryConnection {
            state: self.state.clone(),
            id,
        }))
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, BusError> {
        let mut state = lock(&self.state);
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(BusError::ConnectionError("connection is closed".to_owned()));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                next_tag: 0,
                prefetch: 0,
                unacked: BTreeMap::new(),
                reply: None,
            },
        );
        state.calls.push(BrokerCall::CreateChannel(id));

        Ok(Arc::new(MemoryChannel {
            state: self.state.clone(),
            id,
        }))
    }

    fn is_open(&self) -> bool {
        lock(&self.state)
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn on_error(&self, handler: ErrorHandler) {
        if let Some(conn) = lock(&self.state).connections.get_mut(&self.id) {
            conn.handlers.push(Arc::from(handler));
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if state.connections.get(&self.id).is_some_and(|c| c.open) {
            state.calls.push(BrokerCall::CloseConnection);
            state.close_connection(self.id);
        }
        Ok(())
    }
}

pub struct MemoryChannel {
    state: Arc<Mutex<BrokerState>>,
    id: u64,
}

impl MemoryChannel {
    fn with_open<R>(
        &self,
        call: BrokerCall,
        op: impl FnOnce(&mut BrokerState) -> Result<R, BusError>,
    ) -> Result<R, BusError> {
        let mut state = lock(&self.state);
        if !state.channels.get(&self.id).is_some_and(|c| c.open) {
            return Err(channel_closed(self.id));
        }
        state.calls.push(call);
        op(&mut state)
    }

    fn bind(&self, call: BrokerCall, binding: RouteBinding) -> Result<(), BusError> {
        self.with_open(call, |state| {
            if !state.exchanges.contains_key(&binding.source) {
                return Err(not_found("exchange", &binding.source));
            }
            let destination_exists = if binding.to_exchange {
                state.exchanges.contains_key(&binding.destination)
            } else {
                state.queues.contains_key(&binding.destination)
            };
            if !destination_exists {
                let kind = if binding.to_exchange { "exchange" } else { "queue" };
                return Err(not_found(kind, &binding.destination));
            }
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    fn unbind(&self, call: BrokerCall, binding: RouteBinding) -> Result<(), BusError> {
        self.with_open(call, |state| {
            state.bindings.retain(|b| *b != binding);
            Ok(())
        })
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        lock(&self.state)
            .channels
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<(), BusError> {
        let call = BrokerCall::ExchangeDeclare {
            name: name.to_owned(),
            kind: kind.clone(),
        };
        self.with_open(call, |state| match state.exchanges.get(name) {
            Some(existing) if existing != kind => Err(BusError::declaration(
                name,
                format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    name, kind, existing
                ),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_owned(), kind.clone());
                Ok(())
            }
        })
    }

    async fn exchange_check(&self, name: &str) -> Result<(), BusError> {
        self.with_open(BrokerCall::ExchangeCheck(name.to_owned()), |state| {
            if state.exchanges.contains_key(name) {
                Ok(())
            } else {
                Err(not_found("exchange", name))
            }
        })
    }

    async fn exchange_delete(&self, name: &str) -> Result<(), BusError> {
        self.with_open(BrokerCall::ExchangeDelete(name.to_owned()), |state| {
            state.exchanges.remove(name);
            state
                .bindings
                .retain(|b| b.source != name && !(b.to_exchange && b.destination == name));
            Ok(())
        })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueDeclared, BusError> {
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };
        let channel = self.id;

        self.with_open(BrokerCall::QueueDeclare(name.clone()), |state| {
            let connection = state.channels.get(&channel).map(|c| c.connection);
            let queue = state.queues.entry(name.clone()).or_default();
            if options.is_exclusive() && queue.owner.is_none() {
                queue.owner = connection;
            }
            Ok(QueueDeclared {
                queue: name,
                message_count: queue.ready.len() as u32,
                consumer_count: queue.consumers.len() as u32,
            })
        })
    }

    async fn queue_check(&self, name: &str) -> Result<QueueDeclared, BusError> {
        self.with_open(BrokerCall::QueueCheck(name.to_owned()), |state| {
            state
                .queues
                .get(name)
                .map(|queue| QueueDeclared {
                    queue: name.to_owned(),
                    message_count: queue.ready.len() as u32,
                    consumer_count: queue.consumers.len() as u32,
                })
                .ok_or_else(|| not_found("queue", name))
        })
    }

    async fn queue_delete(&self, name: &str) -> Result<u32, BusError> {
        self.with_open(BrokerCall::QueueDelete(name.to_owned()), |state| {
            Ok(state.remove_queue(name))
        })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        let call = BrokerCall::QueueBind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            pattern: pattern.to_owned(),
        };
        let binding = RouteBinding::new(queue, exchange, pattern, args, false)?;
        self.bind(call, binding)
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        let call = BrokerCall::QueueUnbind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            pattern: pattern.to_owned(),
        };
        let binding = RouteBinding::new(queue, exchange, pattern, args, false)?;
        self.unbind(call, binding)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        let call = BrokerCall::ExchangeBind {
            destination: destination.to_owned(),
            source: source.to_owned(),
            pattern: pattern.to_owned(),
        };
        let binding = RouteBinding::new(destination, source, pattern, args, true)?;
        self.bind(call, binding)
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        let call = BrokerCall::ExchangeUnbind {
            destination: destination.to_owned(),
            source: source.to_owned(),
            pattern: pattern.to_owned(),
        };
        let binding = RouteBinding::new(destination, source, pattern, args, true)?;
        self.unbind(call, binding)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        let call = BrokerCall::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
        };
        let channel = self.id;
        self.with_open(call, |state| {
            state.publish(channel, exchange, routing_key, payload, properties)
        })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BusError> {
        let channel = self.id;
        let mut state = lock(&self.state);
        if !state.channels.get(&channel).is_some_and(|c| c.open) {
            return Err(channel_closed(channel));
        }

        let consumer_tag = format!("amq.ctag-{}", Uuid::new_v4().simple());
        state.calls.push(BrokerCall::Consume {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.clone(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        if queue == DIRECT_REPLY_TO_QUEUE {
            if let Some(c) = state.channels.get_mut(&channel) {
                c.reply = Some((consumer_tag.clone(), tx));
            }
        } else {
            let Some(target) = state.queues.get_mut(queue) else {
                return Err(not_found("queue", queue));
            };
            target.consumers.push(Subscriber {
                tag: consumer_tag.clone(),
                channel,
                no_ack: options.no_ack,
                tx,
            });
            state.deliver(queue);
        }

        Ok(DeliveryStream {
            consumer_tag,
            deliveries: rx,
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BusError> {
        let channel = self.id;
        self.with_open(BrokerCall::Qos(prefetch_count), |state| {
            if let Some(c) = state.channels.get_mut(&channel) {
                c.prefetch = prefetch_count;
            }
            Ok(())
        })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        let channel = self.id;
        self.with_open(BrokerCall::Cancel(consumer_tag.to_owned()), |state| {
            for queue in state.queues.values_mut() {
                queue
                    .consumers
                    .retain(|s| !(s.channel == channel && s.tag == consumer_tag));
                queue.next_consumer = 0;
            }
            if let Some(c) = state.channels.get_mut(&channel) {
                if c.reply.as_ref().is_some_and(|(tag, _)| tag == consumer_tag) {
                    c.reply = None;
                }
            }
            Ok(())
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        let channel = self.id;
        self.with_open(BrokerCall::Ack(delivery_tag), |state| {
            state.settle(channel, vec![delivery_tag], false)
        })
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), BusError> {
        let channel = self.id;
        let call = BrokerCall::Nack {
            delivery_tag,
            requeue,
        };
        self.with_open(call, |state| {
            let tags: Vec<u64> = if all_up_to {
                state
                    .channels
                    .get(&channel)
                    .map(|c| c.unacked.range(..=delivery_tag).map(|(t, _)| *t).collect())
                    .unwrap_or_default()
            } else {
                vec![delivery_tag]
            };
            state.settle(channel, tags, requeue)
        })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        let channel = self.id;
        let call = BrokerCall::Reject {
            delivery_tag,
            requeue,
        };
        self.with_open(call, |state| {
            state.settle(channel, vec![delivery_tag], requeue)
        })
    }

    async fn basic_recover(&self, _requeue: bool) -> Result<(), BusError> {
        let channel = self.id;
        self.with_open(BrokerCall::Recover, |state| {
            let tags: Vec<u64> = state
                .channels
                .get(&channel)
                .map(|c| c.unacked.keys().copied().collect())
                .unwrap_or_default();
            state.settle(channel, tags, true)
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if state.channels.get(&self.id).is_some_and(|c| c.open) {
            state.calls.push(BrokerCall::CloseChannel(self.id));
            state.close_channel(self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn AmqpChannel> {
        let conn = broker
            .connect(&ConnectionConfig::default())
            .await
            .expect("connect");
        conn.create_channel().await.expect("channel")
    }

    #[test]
    fn route_bindings_match_by_exchange_kind() {
        let binding =
            RouteBinding::new("eu", "events", "eu.*.created", &Arguments::new(), false).unwrap();

        assert!(binding.matches(&ExchangeKind::Topic, "eu.orders.created"));
        assert!(!binding.matches(&ExchangeKind::Topic, "eu.orders.updated"));
        assert!(!binding.matches(&ExchangeKind::Direct, "eu.orders.created"));
        assert!(binding.matches(&ExchangeKind::Direct, "eu.*.created"));
        assert!(binding.matches(&ExchangeKind::Fanout, "anything"));
    }

    #[tokio::test]
    async fn topic_routing_and_redelivery_on_requeue() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        ch.exchange_declare("events", &ExchangeKind::Topic, &ExchangeOptions::new())
            .await
            .unwrap();
        ch.queue_declare("eu", &QueueOptions::new()).await.unwrap();
        ch.queue_bind("eu", "events", "eu.#", &Arguments::new())
            .await
            .unwrap();

        let props = MessageProperties::default();
        ch.basic_publish("events", "eu.orders.created", b"1", &props)
            .await
            .unwrap();
        ch.basic_publish("events", "us.orders.created", b"2", &props)
            .await
            .unwrap();
        assert_eq!(broker.queue_depth("eu"), 1);

        let mut stream = ch
            .basic_consume("eu", &ConsumeOptions::default())
            .await
            .unwrap();
        let first = stream.deliveries.recv().await.unwrap();
        assert!(!first.fields.redelivered);
        assert_eq!(broker.unacked_count(), 1);

        ch.basic_nack(first.fields.delivery_tag, false, true)
            .await
            .unwrap();
        let again = stream.deliveries.recv().await.unwrap();
        assert!(again.fields.redelivered);
        assert_eq!(again.data, b"1".to_vec());

        ch.basic_ack(again.fields.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn declaration_conflicts_and_missing_resources() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;

        ch.exchange_declare("x", &ExchangeKind::Fanout, &ExchangeOptions::new())
            .await
            .unwrap();
        let err = ch
            .exchange_declare("x", &ExchangeKind::Topic, &ExchangeOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DeclarationConflict { .. }));

        let err = ch.queue_check("missing").await.unwrap_err();
        assert!(matches!(err, BusError::DeclarationConflict { .. }));
    }

    #[tokio::test]
    async fn direct_reply_to_answers_the_requesting_channel() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.queue_declare("service", &QueueOptions::new()).await.unwrap();

        let mut replies = ch
            .basic_consume(
                DIRECT_REPLY_TO_QUEUE,
                &ConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let request = MessageProperties::default()
            .with_reply_to(DIRECT_REPLY_TO_QUEUE)
            .with_correlation_id("c-1");
        ch.basic_publish("", "service", b"ping", &request)
            .await
            .unwrap();

        let mut server = ch
            .basic_consume("service", &ConsumeOptions::default())
            .await
            .unwrap();
        let received = server.deliveries.recv().await.unwrap();
        let reply_to = received.properties.reply_to.clone().unwrap();
        assert!(reply_to.starts_with("amq.rabbitmq.reply-to."));

        let answer = MessageProperties::default().with_correlation_id("c-1");
        ch.basic_publish("", &reply_to, b"pong", &answer)
            .await
            .unwrap();

        let reply = replies.deliveries.recv().await.unwrap();
        assert_eq!(reply.data, b"pong".to_vec());
        assert_eq!(reply.properties.correlation_id.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn failed_channels_refuse_operations_and_requeue() {
        let broker = MemoryBroker::new();
        let ch = channel(&broker).await;
        ch.queue_declare("jobs", &QueueOptions::new()).await.unwrap();
        ch.basic_publish("", "jobs", b"job", &MessageProperties::default())
            .await
            .unwrap();
        let mut stream = ch
            .basic_consume("jobs", &ConsumeOptions::default())
            .await
            .unwrap();
        stream.deliveries.recv().await.unwrap();

        assert_eq!(broker.fail_channels(), 1);
        assert!(!ch.is_open());
        assert_eq!(broker.queue_depth("jobs"), 1);
        assert!(stream.deliveries.recv().await.is_none());

        let err = ch.queue_check("jobs").await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn refused_connects_are_counted() {
        let broker = MemoryBroker::new();
        broker.refuse_next_connects(1);

        assert!(broker.connect(&ConnectionConfig::default()).await.is_err());
        assert!(broker.connect(&ConnectionConfig::default()).await.is_ok());
        assert_eq!(broker.count_calls(|c| *c == BrokerCall::Connect), 2);
        assert_eq!(broker.open_connections(), 1);
    }
}
