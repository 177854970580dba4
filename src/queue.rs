// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queues
//!
//! A `Queue` is a handle to a named queue owned by a
//! [`Connection`](crate::connection::Connection). Like exchanges, queues are
//! declared in the background and every operation waits for the declaration.
//! A queue additionally carries its consumer registration and the prefetch
//! limit, both of which survive a connection rebuild.

use crate::{
    binding::{Binding, ResourceRef},
    consumer::{
        ConsumerHandler, ConsumerSlot, ConsumerStatus, MessageHandler, RawHandler,
        StartConsumerResult,
    },
    errors::BusError,
    exchange::Exchange,
    message::{Content, Message, MessageProperties},
    resource::{lock, ResourceCore},
    transport::{ArgValue, Arguments, ConsumeOptions},
};
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::error;

/// Declaration argument for the per-queue message TTL, in milliseconds
pub const AMQP_MESSAGE_TTL: &str = "x-message-ttl";
/// Declaration argument for the maximum number of messages
pub const AMQP_MAX_LENGTH: &str = "x-max-length";
/// Declaration argument for the maximum total size of messages in bytes
pub const AMQP_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration options of a queue.
///
/// Built with chained setters, starting from a non-durable, non-exclusive
/// queue that the broker keeps until explicitly deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) no_create: bool,
    pub(crate) arguments: Arguments,
}

impl QueueOptions {
    /// Creates queue options with default settings.
    ///
    /// By default the queue is non-durable, non-exclusive, not auto-deleted and is
    /// created when missing.
    ///
    /// # Returns
    /// A new options value with default settings
    pub fn new() -> Self {
        QueueOptions::default()
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// Durable queues will survive broker restart, preserving persistent messages.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes and re-declared
    /// when the connection is rebuilt.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete once its last consumer is cancelled.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Only verifies that the queue already exists.
    ///
    /// A missing queue fails with [`BusError::DeclarationConflict`] and nothing is
    /// created.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_create(mut self) -> Self {
        self.no_create = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue.
    ///
    /// Messages that exceed this TTL will be automatically removed from the queue.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ttl(self, ttl: i64) -> Self {
        self.argument(AMQP_MESSAGE_TTL, ttl)
    }

    /// Sets the maximum number of messages the queue can hold.
    ///
    /// When this limit is reached, the oldest messages will be discarded.
    ///
    /// # Parameters
    /// * `max` - Maximum number of messages
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length(self, max: i64) -> Self {
        self.argument(AMQP_MAX_LENGTH, max)
    }

    /// Sets the maximum size in bytes the queue can hold.
    ///
    /// When this limit is reached, the oldest messages will be discarded.
    ///
    /// # Parameters
    /// * `max_bytes` - Maximum size in bytes
    ///
    /// # Returns
    /// Self for method chaining
    pub fn max_length_bytes(self, max_bytes: i64) -> Self {
        self.argument(AMQP_MAX_LENGTH_BYTES, max_bytes)
    }

    /// Adds a single declaration argument.
    ///
    /// # Parameters
    /// * `key` - Argument name, e.g. `x-queue-type`
    /// * `value` - Argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: impl Into<ArgValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether the queue belongs to a single connection.
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_no_create(&self) -> bool {
        self.no_create
    }

    /// Declaration arguments, limits included.
    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }
}

struct QueueShared {
    options: QueueOptions,
    consumer: Arc<ConsumerSlot>,
    prefetch: Mutex<Option<u16>>,
}

/// Handle to a queue owned by a connection. Cheap to clone.
#[derive(Clone)]
pub struct Queue {
    core: Arc<ResourceCore>,
    shared: Arc<QueueShared>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.core.name)
            .field("consumer", &self.shared.consumer.status())
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(core: Arc<ResourceCore>, options: QueueOptions) -> Self {
        let queue = Queue {
            core,
            shared: Arc::new(QueueShared {
                options,
                consumer: Arc::new(ConsumerSlot::default()),
                prefetch: Mutex::new(None),
            }),
        };
        queue.initialize();
        queue
    }

    /// (Re-)declares the queue on a fresh channel and restores its prefetch.
    pub(crate) fn initialize(&self) {
        let name = self.core.name.clone();
        let shared = self.shared.clone();

        self.core.initialize(move |channel| async move {
            if shared.options.no_create {
                channel.queue_check(&name).await?;
            } else {
                channel.queue_declare(&name, &shared.options).await?;
            }

            let prefetch = *lock(&shared.prefetch);
            if let Some(count) = prefetch {
                channel.basic_qos(count).await?;
            }
            Ok(())
        });
    }

    pub(crate) fn core(&self) -> &Arc<ResourceCore> {
        &self.core
    }

    pub(crate) async fn rearm_consumer(&self) -> Result<(), BusError> {
        self.shared.consumer.rearm(&self.core).await
    }

    /// The queue name on the broker.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    /// Resolves once the queue is declared (or verified) on the broker.
    ///
    /// # Returns
    /// `Ok(())` when the queue is ready, or the error the declaration failed with
    pub async fn initialized(&self) -> Result<(), BusError> {
        self.core.ready().await.map(|_| ())
    }

    /// Publishes straight to this queue through the default exchange.
    ///
    /// # Parameters
    /// * `content` - Bytes, text or a JSON value
    /// * `properties` - Message properties
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message
    pub async fn publish(
        &self,
        content: impl Into<Content>,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let message = Message::new(content, properties);
        message.send_to(self, self.name()).await
    }

    /// Sends an already built message to this queue through the default exchange.
    pub async fn send(&self, message: &Message) -> Result<(), BusError> {
        message.send_to(self, self.name()).await
    }

    /// Sends a request to this queue and waits for the correlated reply.
    ///
    /// # Parameters
    /// * `request` - Request content
    /// * `timeout` - Reply deadline; falls back to the connection's RPC timeout
    ///
    /// # Returns
    /// The reply message, or [`BusError::RpcTimeout`] once the deadline passes
    pub async fn rpc(
        &self,
        request: impl Into<Content>,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let message = Message::new(request, MessageProperties::default());
        self.core
            .rpc
            .call(&self.core, "", self.name(), &message, timeout)
            .await
    }

    /// Limits the number of unacknowledged deliveries on the queue's channel.
    ///
    /// Call before activating the consumer; the limit is re-applied after a rebuild.
    ///
    /// # Parameters
    /// * `count` - Maximum unacknowledged deliveries, `0` for no limit
    ///
    /// # Errors
    /// [`BusError::QoSDeclarationError`] when the broker refuses the limit
    pub async fn prefetch(&self, count: u16) -> Result<(), BusError> {
        *lock(&self.shared.prefetch) = Some(count);

        let channel = self.core.ready().await?;
        channel.basic_qos(count).await.map_err(|err| {
            error!(error = err.to_string(), queue = self.name(), "error to set qos");
            BusError::QoSDeclarationError(self.name().to_owned())
        })
    }

    /// Asks the broker to redeliver every unacknowledged message.
    pub async fn recover(&self) -> Result<(), BusError> {
        let channel = self.core.ready().await?;
        channel.basic_recover(true).await
    }

    /// Starts a raw consumer; see [`RawHandler`].
    ///
    /// Content returned by the handler is sent to the delivery's `reply_to`. The
    /// delivery is acked when the handler succeeds and nacked without requeue when
    /// it fails or panics.
    ///
    /// # Parameters
    /// * `handler` - Receives each undecoded delivery
    /// * `options` - Consume options
    ///
    /// # Returns
    /// The consumer tag, or [`BusError::ConsumerStateError`] if a consumer is
    /// already active
    pub async fn start_consumer<H>(
        &self,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<StartConsumerResult, BusError>
    where
        H: RawHandler + 'static,
    {
        self.shared
            .consumer
            .start(&self.core, ConsumerHandler::Raw(Arc::new(handler)), options)
            .await
    }

    /// Starts a consumer that hands decoded, settleable messages to `handler`.
    ///
    /// The handler settles each message itself; a failing or panicking handler gets
    /// its message nacked without requeue. Concurrent starts share one activation.
    ///
    /// # Parameters
    /// * `handler` - Receives each decoded message
    /// * `options` - Consume options
    ///
    /// # Returns
    /// The consumer tag, or [`BusError::ConsumerStateError`] if a consumer is
    /// already active
    pub async fn activate_consumer<H>(
        &self,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<StartConsumerResult, BusError>
    where
        H: MessageHandler + 'static,
    {
        self.shared
            .consumer
            .start(
                &self.core,
                ConsumerHandler::Decoded(Arc::new(handler)),
                options,
            )
            .await
    }

    /// Cancels the consumer. A no-op when none is running.
    ///
    /// Waits for an in-flight start to settle before cancelling it.
    pub async fn stop_consumer(&self) -> Result<(), BusError> {
        self.shared.consumer.stop(self.name()).await
    }

    /// Current lifecycle state of the queue's consumer.
    pub fn consumer_status(&self) -> ConsumerStatus {
        self.shared.consumer.status()
    }

    /// Tag of the active consumer, if any.
    pub fn consumer_tag(&self) -> Option<String> {
        self.shared.consumer.tag()
    }

    /// Stops the consumer, removes the queue's bindings, then deletes it.
    pub async fn delete(&self) -> Result<(), BusError> {
        let consumer = self.shared.consumer.clone();
        let name = self.name().to_owned();
        self.core
            .delete(async move { consumer.stop(&name).await })
            .await
    }

    /// Stops the consumer and removes the queue's bindings without deleting it.
    pub async fn close(&self) -> Result<(), BusError> {
        let consumer = self.shared.consumer.clone();
        let name = self.name().to_owned();
        self.core
            .close(async move { consumer.stop(&name).await })
            .await
    }

    /// Binds the queue to `source`.
    ///
    /// The binding is registered on the connection and re-applied after a rebuild.
    ///
    /// # Parameters
    /// * `source` - The exchange messages flow from
    /// * `pattern` - Routing pattern matched by `source`
    /// * `args` - Binding arguments
    ///
    /// # Returns
    /// The registered binding
    pub async fn bind(
        &self,
        source: &Exchange,
        pattern: &str,
        args: Arguments,
    ) -> Result<Binding, BusError> {
        let binding = Binding::new(
            ResourceRef::Queue(self.name().to_owned()),
            source.name(),
            pattern,
            args,
        );
        self.core.connection()?.bind(binding).await
    }

    /// Removes the binding from `source` with the given pattern.
    ///
    /// Unknown bindings are a no-op.
    pub async fn unbind(&self, source: &Exchange, pattern: &str) -> Result<(), BusError> {
        let id = Binding::new(
            ResourceRef::Queue(self.name().to_owned()),
            source.name(),
            pattern,
            Arguments::new(),
        )
        .id();
        self.core.connection()?.unbind(&id).await
    }
}
