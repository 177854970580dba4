// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchanges
//!
//! An `Exchange` is a handle to a named, typed exchange owned by a
//! [`Connection`](crate::connection::Connection). Declaration runs in the
//! background as soon as the handle is created; every operation waits for it.
//! Deleting or closing an exchange first removes every binding that references
//! it, then releases its channel.

use crate::{
    binding::{Binding, ResourceRef},
    consumer::{MessageHandler, RawHandler, StartConsumerResult},
    errors::BusError,
    message::{Content, Message, MessageProperties},
    queue::{Queue, QueueOptions},
    resource::ResourceCore,
    transport::{ArgValue, Arguments, ConsumeOptions},
};
use std::{fmt, sync::Arc, time::Duration};
use tracing::debug;

/// Declaration argument naming the exchange that receives unroutable messages
pub const AMQP_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    /// Wire name of the exchange type, as sent in `exchange.declare`.
    ///
    /// # Returns
    /// One of `direct`, `fanout`, `topic` or `headers`
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ExchangeKind {
    type Error = BusError;

    /// Parses a wire name back into an exchange type.
    ///
    /// # Errors
    /// [`BusError::ConfigError`] for any name other than the four standard types
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(BusError::ConfigError(
                "exchange kind".to_owned(),
                other.to_owned(),
            )),
        }
    }
}

/// Declaration options of an exchange, built with chained setters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) no_create: bool,
    pub(crate) alternate_exchange: Option<String>,
    pub(crate) arguments: Arguments,
}

impl ExchangeOptions {
    /// Creates exchange options with default settings.
    ///
    /// By default the exchange is non-durable, not auto-deleted, not internal and
    /// is created when missing.
    ///
    /// # Returns
    /// A new options value with default settings
    pub fn new() -> Self {
        ExchangeOptions::default()
    }

    /// Makes the exchange durable, persisting across broker restarts.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the exchange once its last binding is removed.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    ///
    /// Internal exchanges only receive messages through exchange-to-exchange
    /// bindings.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Only verifies that the exchange already exists.
    ///
    /// The declaration becomes a passive check; a missing exchange fails with
    /// [`BusError::DeclarationConflict`] and nothing is created.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_create(mut self) -> Self {
        self.no_create = true;
        self
    }

    /// Routes unroutable messages to another exchange.
    ///
    /// # Parameters
    /// * `name` - The exchange receiving messages no binding matched
    ///
    /// # Returns
    /// Self for method chaining
    pub fn alternate_exchange(mut self, name: &str) -> Self {
        self.alternate_exchange = Some(name.to_owned());
        self
    }

    /// Adds a single declaration argument.
    ///
    /// # Parameters
    /// * `key` - Argument name, e.g. `x-delayed-type`
    /// * `value` - Argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn argument(mut self, key: &str, value: impl Into<ArgValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Replaces every custom declaration argument.
    ///
    /// # Parameters
    /// * `arguments` - The full argument table
    ///
    /// # Returns
    /// Self for method chaining
    pub fn arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// Whether the exchange survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Whether declaration is a passive existence check.
    pub fn is_no_create(&self) -> bool {
        self.no_create
    }

    /// Arguments sent with the declaration, alternate exchange included.
    ///
    /// # Returns
    /// The custom arguments plus `alternate-exchange` when one is set
    pub fn declaration_arguments(&self) -> Arguments {
        let mut args = self.arguments.clone();
        if let Some(alternate) = &self.alternate_exchange {
            args.insert(
                AMQP_ALTERNATE_EXCHANGE.to_owned(),
                ArgValue::Text(alternate.clone()),
            );
        }
        args
    }
}

/// Handle to an exchange owned by a connection. Cheap to clone.
#[derive(Clone)]
pub struct Exchange {
    core: Arc<ResourceCore>,
    kind: ExchangeKind,
    options: Arc<ExchangeOptions>,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.core.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Exchange {
    pub(crate) fn new(
        core: Arc<ResourceCore>,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Self {
        let exchange = Exchange {
            core,
            kind,
            options: Arc::new(options),
        };
        exchange.initialize();
        exchange
    }

    /// (Re-)declares the exchange on a fresh channel.
    pub(crate) fn initialize(&self) {
        let name = self.core.name.clone();
        let kind = self.kind.clone();
        let options = self.options.clone();

        self.core.initialize(move |channel| async move {
            if options.no_create {
                channel.exchange_check(&name).await
            } else {
                channel.exchange_declare(&name, &kind, &options).await
            }
        });
    }

    pub(crate) fn core(&self) -> &Arc<ResourceCore> {
        &self.core
    }

    /// The exchange name on the broker.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The exchange type this handle declares.
    pub fn kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    /// Resolves once the exchange is declared (or verified) on the broker.
    ///
    /// # Returns
    /// `Ok(())` when the exchange is ready, or the error the declaration failed with
    pub async fn initialized(&self) -> Result<(), BusError> {
        self.core.ready().await.map(|_| ())
    }

    /// Publishes content to the exchange.
    ///
    /// Strings and JSON values are packed first, setting the content type.
    /// Waits for the declaration; a channel failure triggers one rebuild and one
    /// retry.
    ///
    /// # Parameters
    /// * `content` - Bytes, text or a JSON value
    /// * `routing_key` - Routing key used by the exchange's bindings
    /// * `properties` - Message properties
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message
    pub async fn publish(
        &self,
        content: impl Into<Content>,
        routing_key: &str,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let message = Message::new(content, properties);
        message.send_to(self, routing_key).await
    }

    /// Publishes an already built message to the exchange.
    ///
    /// # Parameters
    /// * `message` - The message to send; its properties are kept
    /// * `routing_key` - Routing key used by the exchange's bindings
    pub async fn send(&self, message: &Message, routing_key: &str) -> Result<(), BusError> {
        message.send_to(self, routing_key).await
    }

    /// Sends a request and waits for the correlated reply.
    ///
    /// The request goes out with a fresh correlation id and the broker's direct
    /// reply-to queue as its reply destination.
    ///
    /// # Parameters
    /// * `request` - Request content
    /// * `routing_key` - Routing key of the serving queue's binding
    /// * `timeout` - Reply deadline; falls back to the connection's RPC timeout
    ///
    /// # Returns
    /// The reply message, or [`BusError::RpcTimeout`] once the deadline passes
    pub async fn rpc(
        &self,
        request: impl Into<Content>,
        routing_key: &str,
        timeout: Option<Duration>,
    ) -> Result<Message, BusError> {
        let message = Message::new(request, MessageProperties::default());
        self.core
            .rpc
            .call(&self.core, self.name(), routing_key, &message, timeout)
            .await
    }

    /// Callback flavour of [`Exchange::rpc`]; the callback runs exactly once.
    ///
    /// Must be called within a tokio runtime.
    pub fn rpc_with_callback<F>(
        &self,
        request: impl Into<Content>,
        routing_key: &str,
        timeout: Option<Duration>,
        callback: F,
    ) where
        F: FnOnce(Result<Message, BusError>) + Send + 'static,
    {
        let exchange = self.clone();
        let request = request.into();
        let routing_key = routing_key.to_owned();

        tokio::spawn(async move {
            callback(exchange.rpc(request, &routing_key, timeout).await);
        });
    }

    /// Deletes the exchange on the broker after removing its bindings.
    ///
    /// Repeated calls return the first call's result without contacting the broker
    /// again.
    pub async fn delete(&self) -> Result<(), BusError> {
        self.core.delete(async { Ok(()) }).await
    }

    /// Removes bindings and releases the channel, leaving the broker object in place.
    ///
    /// Idempotent like [`Exchange::delete`].
    pub async fn close(&self) -> Result<(), BusError> {
        self.core.close(async { Ok(()) }).await
    }

    /// Binds this exchange as the destination of `source`.
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
            ResourceRef::Exchange(self.name().to_owned()),
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
            ResourceRef::Exchange(self.name().to_owned()),
            source.name(),
            pattern,
            Arguments::new(),
        )
        .id();
        self.core.connection()?.unbind(&id).await
    }

    /// Name of the private queue used by [`Exchange::activate_consumer`].
    ///
    /// # Returns
    /// `<exchange>.<app name>.<connection id>.<process id>`
    pub fn consumer_queue_name(&self) -> Result<String, BusError> {
        let connection = self.core.connection()?;
        Ok(format!(
            "{}.{}.{}.{}",
            self.name(),
            connection.config.app_name,
            connection.id(),
            std::process::id()
        ))
    }

    /// Consumes everything routed through this exchange with an empty pattern,
    /// delivering decoded messages.
    ///
    /// A private queue is declared and bound first; only one exchange consumer may
    /// exist per connection.
    ///
    /// # Parameters
    /// * `handler` - Receives each decoded message and settles it
    /// * `options` - Consume options
    ///
    /// # Returns
    /// The consumer tag of the new consumer
    pub async fn activate_consumer<H>(
        &self,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<StartConsumerResult, BusError>
    where
        H: MessageHandler + 'static,
    {
        let queue = self.consumer_queue().await?;
        queue.activate_consumer(handler, options).await
    }

    /// Raw flavour of [`Exchange::activate_consumer`].
    pub async fn start_consumer<H>(
        &self,
        handler: H,
        options: ConsumeOptions,
    ) -> Result<StartConsumerResult, BusError>
    where
        H: RawHandler + 'static,
    {
        let queue = self.consumer_queue().await?;
        queue.start_consumer(handler, options).await
    }

    /// Stops the exchange consumer by deleting its private queue.
    pub async fn stop_consumer(&self) -> Result<(), BusError> {
        let connection = self.core.connection()?;
        match connection.queue(&self.consumer_queue_name()?) {
            Some(queue) => queue.delete().await,
            None => Ok(()),
        }
    }

    async fn consumer_queue(&self) -> Result<Queue, BusError> {
        let connection = self.core.connection()?;
        let queue_name = self.consumer_queue_name()?;

        if connection.queue(&queue_name).is_some() {
            return Err(BusError::consumer_state(
                self.name(),
                "consumer already defined",
            ));
        }

        debug!(exchange = self.name(), queue = queue_name, "creating consumer queue");
        let queue = connection.declare_queue(&queue_name, QueueOptions::new());
        queue.initialized().await?;
        queue.bind(self, "", Arguments::new()).await?;
        Ok(queue)
    }
}
