// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Boundary
//!
//! The bus never speaks the wire protocol itself. Frame encoding, heartbeats and
//! socket handling belong to a protocol client hidden behind the traits in this
//! module. The [`crate::amqp`] module implements them on lapin and
//! [`crate::testing`] implements them in memory.

use crate::{
    config::ConnectionConfig,
    errors::BusError,
    exchange::{ExchangeKind, ExchangeOptions},
    message::{DeliveryFields, MessageProperties},
    queue::QueueOptions,
};
use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

/// Value of a declaration or binding argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::Int(v as i64)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Text(v.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Text(v)
    }
}

/// Arguments attached to declarations and bindings (`x-message-ttl`, ...).
pub type Arguments = BTreeMap<String, ArgValue>;

/// Broker answer to a queue declaration or check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclared {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Options for a low-level consume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker settles deliveries on send; ack/nack/reject become no-ops.
    pub no_ack: bool,
    pub exclusive: bool,
    pub priority: Option<i32>,
    pub arguments: Arguments,
}

/// A message handed over by the transport.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    pub fields: DeliveryFields,
}

/// A consumer registered on a channel together with its delivery stream.
///
/// The stream ends when the consumer is cancelled or the channel dies.
#[derive(Debug)]
pub struct DeliveryStream {
    pub consumer_tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Callback invoked by the transport when the connection fails.
pub type ErrorHandler = Box<dyn Fn(BusError) + Send + Sync>;

/// Opens connections to a broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection.
    ///
    /// # Errors
    /// [`BusError::ConnectionError`] when the broker cannot be reached
    async fn connect(&self, cfg: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>, BusError>;
}

/// An open connection able to multiplex channels.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a new channel on the connection.
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, BusError>;

    fn is_open(&self) -> bool;

    /// Registers the callback notified on connection-level failures.
    fn on_error(&self, handler: ErrorHandler);

    async fn close(&self) -> Result<(), BusError>;
}

/// Channel-level protocol primitives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declares an exchange, creating it when missing.
    ///
    /// # Errors
    /// [`BusError::DeclarationConflict`] when the exchange exists with another
    /// type or incompatible flags
    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BusError>;

    /// Fails with [`BusError::DeclarationConflict`] when the exchange is absent.
    async fn exchange_check(&self, name: &str) -> Result<(), BusError>;

    async fn exchange_delete(&self, name: &str) -> Result<(), BusError>;

    /// Declares a queue, creating it when missing.
    ///
    /// # Returns
    /// The queue's current message and consumer counts
    async fn queue_declare(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueDeclared, BusError>;

    /// Fails with [`BusError::DeclarationConflict`] when the queue is absent.
    async fn queue_check(&self, name: &str) -> Result<QueueDeclared, BusError>;

    /// Returns the number of messages dropped with the queue.
    async fn queue_delete(&self, name: &str) -> Result<u32, BusError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError>;

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError>;

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError>;

    /// Publishes a message.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange; empty for the default exchange
    /// * `routing_key` - Routing key, or the queue name on the default exchange
    /// * `payload` - Message body
    /// * `properties` - Message properties
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError>;

    /// Starts a consumer on `queue`.
    ///
    /// # Returns
    /// The consumer tag and the stream its deliveries arrive on
    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BusError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BusError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BusError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BusError>;

    /// Negatively acknowledges a delivery.
    ///
    /// # Parameters
    /// * `delivery_tag` - Tag of the delivery on this channel
    /// * `all_up_to` - Also settle every earlier unacknowledged delivery
    /// * `requeue` - Put the message back instead of dropping or dead-lettering it
    async fn basic_nack(&self, delivery_tag: u64, all_up_to: bool, requeue: bool)
        -> Result<(), BusError>;

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError>;

    /// Asks the broker to redeliver every unacknowledged message on the channel.
    async fn basic_recover(&self, requeue: bool) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}
