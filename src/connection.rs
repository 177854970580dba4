// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection
//!
//! A `Connection` is one logical link to the broker and the owner of every
//! exchange, queue and binding declared through it. Resources are keyed by
//! name, declared lazily and kept with the same identity across failures.
//!
//! Connecting is idempotent: concurrent callers share one attempt. When the
//! transport reports a failure, or an operation hits a dead channel, the
//! connection rebuilds: it reconnects if needed, re-declares every resource
//! whose channel is gone, re-creates every binding and re-arms active
//! consumers. A rebuild is shared by everybody who asks for one while it runs.

use crate::{
    amqp::LapinTransport,
    binding::{Binding, BindingId, BindingRegistry},
    config::ConnectionConfig,
    consumer::MessageHandler,
    dispatcher::Dispatcher,
    errors::BusError,
    exchange::{Exchange, ExchangeKind, ExchangeOptions},
    message::{Content, Message, MessageProperties, Target},
    queue::{Queue, QueueOptions},
    resource::{lock, spawn_shared, ResourceCore, ResourceKind, SharedResult},
    transport::{AmqpConnection, Arguments, ConsumeOptions, Transport},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, broadcast::error::RecvError, watch, OnceCell},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENTS_CAPACITY: usize = 64;

/// Transport state of a connection.
///
/// `Closing` is only entered through [`Connection::close`]; a closed
/// connection stays `Disconnected` and never reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Lifecycle notifications published by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnected(String),
    Reconnected,
    Error(BusError),
    Closed,
}

/// Discriminant of [`ConnectionEvent`], used to filter listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connecting,
    Connected,
    Disconnected,
    Reconnected,
    Error,
    Closed,
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connecting => EventKind::Connecting,
            ConnectionEvent::Connected => EventKind::Connected,
            ConnectionEvent::Disconnected(_) => EventKind::Disconnected,
            ConnectionEvent::Reconnected => EventKind::Reconnected,
            ConnectionEvent::Error(_) => EventKind::Error,
            ConnectionEvent::Closed => EventKind::Closed,
        }
    }
}

/// Options of [`Connection::publish`].
#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub kind: ExchangeKind,
    pub exchange: ExchangeOptions,
    pub properties: MessageProperties,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            kind: ExchangeKind::Topic,
            exchange: ExchangeOptions::new().durable(),
            properties: MessageProperties::default(),
        }
    }
}

/// Options of [`Connection::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub kind: ExchangeKind,
    pub exchange: ExchangeOptions,
    pub queue: QueueOptions,
    /// Deliver messages published by this same connection.
    pub receive_from_yourself: bool,
    pub consume: ConsumeOptions,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        SubscribeOptions {
            kind: ExchangeKind::Topic,
            exchange: ExchangeOptions::new().durable(),
            queue: QueueOptions::new().durable(),
            receive_from_yourself: false,
            consume: ConsumeOptions::default(),
        }
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    id: OnceLock<String>,
    state: watch::Sender<ConnectionState>,
    amqp: Mutex<Option<Arc<dyn AmqpConnection>>>,
    connecting: Mutex<Option<SharedResult<Arc<dyn AmqpConnection>>>>,
    rebuilding: Mutex<Option<SharedResult<()>>>,
    exchanges: Mutex<HashMap<String, Exchange>>,
    queues: Mutex<HashMap<String, Queue>>,
    pub(crate) bindings: Mutex<BindingRegistry>,
    events: broadcast::Sender<ConnectionEvent>,
    pub(crate) dispatcher: Dispatcher,
    closing: OnceCell<Result<(), BusError>>,
    closed: AtomicBool,
}

impl ConnectionInner {
    fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        ConnectionInner {
            config,
            transport,
            id: OnceLock::new(),
            state,
            amqp: Mutex::new(None),
            connecting: Mutex::new(None),
            rebuilding: Mutex::new(None),
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            bindings: Mutex::new(BindingRegistry::default()),
            events,
            dispatcher: Dispatcher::default(),
            closing: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Lazily generated identifier stamped as `app_id` on bus publishes.
    pub(crate) fn id(&self) -> &str {
        self.id.get_or_init(|| {
            let random = Uuid::new_v4().simple().to_string();
            format!("id-{}", &random[..16])
        })
    }

    fn emit(&self, event: ConnectionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns the open transport connection, connecting first if needed.
    pub(crate) async fn ensure_connected(
        self: &Arc<Self>,
    ) -> Result<Arc<dyn AmqpConnection>, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed("connection".to_owned()));
        }

        if let Some(conn) = lock(&self.amqp).as_ref().filter(|conn| conn.is_open()) {
            return Ok(conn.clone());
        }

        let pending = {
            let mut slot = lock(&self.connecting);
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let inner = self.clone();
                    let pending = spawn_shared(async move { inner.connect().await });
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    async fn connect(self: Arc<Self>) -> Result<Arc<dyn AmqpConnection>, BusError> {
        debug!("creating amqp connection...");
        self.state.send_replace(ConnectionState::Connecting);
        self.emit(ConnectionEvent::Connecting);

        let result = self.transport.connect(&self.config).await;

        match &result {
            Ok(conn) => {
                let runtime = Handle::current();
                let inner = Arc::downgrade(&self);
                conn.on_error(Box::new(move |err| {
                    if let Some(inner) = inner.upgrade() {
                        inner.on_transport_error(&runtime, err);
                    }
                }));

                *lock(&self.amqp) = Some(conn.clone());
                self.state.send_replace(ConnectionState::Connected);
                self.emit(ConnectionEvent::Connected);
                info!(host = self.config.host, "amqp connected");

                self.retry_failed_declarations();
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                self.state.send_replace(ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Error(err.clone()));
            }
        }

        lock(&self.connecting).take();
        result
    }

    /// Re-declares registered resources whose last declaration failed, e.g.
    /// because no connection could be opened at the time.
    ///
    /// Conflicting declarations are never retried: they leave the registry
    /// when they fail.
    fn retry_failed_declarations(&self) {
        let exchanges: Vec<Exchange> = lock(&self.exchanges)
            .values()
            .filter(|exchange| exchange.core().is_failed())
            .cloned()
            .collect();
        let queues: Vec<Queue> = lock(&self.queues)
            .values()
            .filter(|queue| queue.core().is_failed())
            .cloned()
            .collect();

        for exchange in exchanges {
            debug!(exchange = exchange.name(), "retrying exchange declaration");
            exchange.initialize();
        }
        for queue in queues {
            debug!(queue = queue.name(), "retrying queue declaration");
            queue.initialize();
        }
    }

    fn on_transport_error(self: Arc<Self>, runtime: &Handle, err: BusError) {
        if self.is_closed() {
            return;
        }

        warn!(error = err.to_string(), "amqp connection failed");
        self.state.send_replace(ConnectionState::Disconnected);
        self.emit(ConnectionEvent::Disconnected(err.to_string()));

        runtime.spawn(async move {
            if let Err(err) = self.rebuild_all(err).await {
                error!(error = err.to_string(), "failure to rebuild after connection loss");
            }
        });
    }

    /// Rebuilds channels, resources, bindings and consumers. Concurrent
    /// callers share the running rebuild.
    pub(crate) async fn rebuild_all(self: &Arc<Self>, cause: BusError) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed("connection".to_owned()));
        }

        let pending = {
            let mut slot = lock(&self.rebuilding);
            match slot.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let inner = self.clone();
                    let pending = spawn_shared(async move { inner.rebuild(cause).await });
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    async fn rebuild(self: Arc<Self>, cause: BusError) -> Result<(), BusError> {
        warn!(cause = cause.to_string(), "rebuilding channels");

        let result = self.redeclare_everything().await;
        lock(&self.rebuilding).take();

        match &result {
            Ok(()) => {
                info!("channels rebuilt");
                self.emit(ConnectionEvent::Reconnected);
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to rebuild channels");
                self.emit(ConnectionEvent::Error(err.clone()));
            }
        }

        result
    }

    async fn redeclare_everything(self: &Arc<Self>) -> Result<(), BusError> {
        self.ensure_connected().await?;

        let exchanges: Vec<Exchange> = lock(&self.exchanges)
            .values()
            .filter(|exchange| !exchange.core().is_valid())
            .cloned()
            .collect();
        let queues: Vec<Queue> = lock(&self.queues)
            .values()
            .filter(|queue| !queue.core().is_valid())
            .cloned()
            .collect();

        for exchange in &exchanges {
            exchange.initialize();
        }
        for queue in &queues {
            queue.initialize();
        }

        // A failing resource must not keep the others from coming back.
        let mut first_error = None;

        for exchange in &exchanges {
            if let Err(err) = exchange.initialized().await {
                first_error.get_or_insert(err);
            }
        }
        for queue in &queues {
            let restored = match queue.initialized().await {
                Ok(()) => queue.rearm_consumer().await,
                Err(err) => Err(err),
            };
            if let Err(err) = restored {
                first_error.get_or_insert(err);
            }
        }

        let bindings: Vec<SharedResult<()>> = {
            let mut registry = lock(&self.bindings);
            registry
                .all()
                .into_iter()
                .map(|binding| {
                    let id = binding.id();
                    let ready = self.spawn_binding(binding);
                    registry.replace_ready(&id, ready.clone());
                    ready
                })
                .collect()
        };
        for ready in bindings {
            if let Err(err) = ready.await {
                first_error.get_or_insert(err);
            }
        }

        debug!(
            exchanges = exchanges.len(),
            queues = queues.len(),
            "resources re-declared"
        );

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn declare_exchange(
        self: &Arc<Self>,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Exchange {
        let mut exchanges = lock(&self.exchanges);
        if let Some(exchange) = exchanges.get(name) {
            if exchange.core().is_failed() {
                exchange.initialize();
            }
            return exchange.clone();
        }

        let core = ResourceCore::new(self, name, ResourceKind::Exchange);
        let exchange = Exchange::new(core, kind, options);
        exchanges.insert(name.to_owned(), exchange.clone());
        exchange
    }

    pub(crate) fn declare_queue(self: &Arc<Self>, name: &str, options: QueueOptions) -> Queue {
        let mut queues = lock(&self.queues);
        if let Some(queue) = queues.get(name) {
            if queue.core().is_failed() {
                queue.initialize();
            }
            return queue.clone();
        }

        let core = ResourceCore::new(self, name, ResourceKind::Queue);
        let queue = Queue::new(core, options);
        queues.insert(name.to_owned(), queue.clone());
        queue
    }

    pub(crate) fn exchange(&self, name: &str) -> Option<Exchange> {
        lock(&self.exchanges).get(name).cloned()
    }

    pub(crate) fn queue(&self, name: &str) -> Option<Queue> {
        lock(&self.queues).get(name).cloned()
    }

    /// Drops `core` from the registry if it is still the registered instance.
    pub(crate) fn forget(&self, core: &ResourceCore) {
        match core.kind {
            ResourceKind::Exchange => {
                let mut exchanges = lock(&self.exchanges);
                if exchanges
                    .get(&core.name)
                    .is_some_and(|exchange| std::ptr::eq(exchange.core().as_ref(), core))
                {
                    exchanges.remove(&core.name);
                }
            }
            ResourceKind::Queue => {
                let mut queues = lock(&self.queues);
                if queues
                    .get(&core.name)
                    .is_some_and(|queue| std::ptr::eq(queue.core().as_ref(), core))
                {
                    queues.remove(&core.name);
                    self.dispatcher.unmark(&core.name);
                }
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closing
            .get_or_init(|| async {
                self.closed.store(true, Ordering::SeqCst);
                self.state.send_replace(ConnectionState::Closing);
                debug!("closing connection...");

                let queues: Vec<Queue> = lock(&self.queues).values().cloned().collect();
                for queue in queues {
                    if let Err(err) = queue.close().await {
                        warn!(error = err.to_string(), queue = queue.name(), "failure to close queue");
                    }
                }

                let exchanges: Vec<Exchange> = lock(&self.exchanges).values().cloned().collect();
                for exchange in exchanges {
                    if let Err(err) = exchange.close().await {
                        warn!(
                            error = err.to_string(),
                            exchange = exchange.name(),
                            "failure to close exchange"
                        );
                    }
                }

                let amqp = lock(&self.amqp).take();
                if let Some(conn) = amqp {
                    if let Err(err) = conn.close().await {
                        warn!(error = err.to_string(), "failure to close amqp connection");
                    }
                }

                self.state.send_replace(ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Closed);
                info!("connection closed");
                Ok(())
            })
            .await
            .clone()
    }

    /// Invalidates whatever survived `close` and empties every registry.
    fn clear(&self) {
        let exchanges: Vec<Exchange> = lock(&self.exchanges).drain().map(|(_, e)| e).collect();
        for exchange in exchanges {
            exchange.core().invalidate();
        }

        let queues: Vec<Queue> = lock(&self.queues).drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.core().invalidate();
        }

        lock(&self.bindings).clear();
        self.dispatcher.clear();
    }
}

/// One logical link to the broker. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Creates a connection over `transport`. Nothing is opened until first use.
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        Connection {
            inner: Arc::new(ConnectionInner::new(config, transport)),
        }
    }

    /// Creates a connection speaking AMQP 0.9.1 through lapin.
    pub fn with_lapin(config: ConnectionConfig) -> Self {
        Connection::new(config, Arc::new(LapinTransport::default()))
    }

    /// Opens the transport. Resolves immediately when already connected.
    pub async fn open(&self) -> Result<(), BusError> {
        self.inner.ensure_connected().await.map(|_| ())
    }

    /// Whether the transport is currently connected.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current transport state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Identifier of this connection, `id-` followed by 16 hex characters.
    ///
    /// Stamped as `app_id` on every [`Connection::publish`] so subscribers can
    /// skip their own messages.
    pub fn id(&self) -> &str {
        self.inner.id()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Stream of every lifecycle event published from now on.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Runs `listener` for every future event of the given kind.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(ConnectionEvent) + Send + 'static,
    {
        let mut events = self.events();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind() == kind => listener(event),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener lagging behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Returns the registered exchange or declares a new one.
    ///
    /// Declaration runs in the background; must be called within a tokio runtime.
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Exchange {
        self.inner.declare_exchange(name, kind, options)
    }

    /// Returns the registered queue or declares a new one.
    pub fn declare_queue(&self, name: &str, options: QueueOptions) -> Queue {
        self.inner.declare_queue(name, options)
    }

    /// The registered exchange called `name`, if any.
    pub fn exchange(&self, name: &str) -> Option<Exchange> {
        self.inner.exchange(name)
    }

    /// The registered queue called `name`, if any.
    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.inner.queue(name)
    }

    /// Deletes a registered exchange. Unknown names are a no-op.
    pub async fn delete_exchange(&self, name: &str) -> Result<(), BusError> {
        match self.exchange(name) {
            Some(exchange) => exchange.delete().await,
            None => Ok(()),
        }
    }

    /// Deletes a registered queue. Unknown names are a no-op.
    pub async fn delete_queue(&self, name: &str) -> Result<(), BusError> {
        match self.queue(name) {
            Some(queue) => queue.delete().await,
            None => Ok(()),
        }
    }

    /// Registers and applies a binding.
    ///
    /// The binding is applied once both ends are declared and re-applied after
    /// every rebuild. Binding an identity already registered waits for the
    /// existing binding instead of applying it again.
    ///
    /// # Errors
    /// [`BusError::Closed`] when either end is not registered on this
    /// connection; a failed binding leaves the registry
    pub async fn bind(&self, binding: Binding) -> Result<Binding, BusError> {
        self.inner.bind(binding).await
    }

    /// Removes a binding from the broker and the registry. Unknown ids are a no-op.
    pub async fn unbind(&self, id: &BindingId) -> Result<(), BusError> {
        self.inner.unbind(id).await
    }

    /// Every registered binding, ordered by identity.
    pub fn bindings(&self) -> Vec<Binding> {
        lock(&self.inner.bindings).all()
    }

    /// Publishes `content` on `exchange_name`, declaring the exchange if needed.
    ///
    /// The message is stamped with this connection's id as `app_id`, a
    /// timestamp and a message id.
    pub async fn publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        content: impl Into<Content>,
        options: PublishOptions,
    ) -> Result<(), BusError> {
        let exchange = self.declare_exchange(exchange_name, options.kind, options.exchange);

        let mut properties = options.properties;
        properties.app_id = Some(self.id().to_owned());
        properties
            .timestamp
            .get_or_insert(chrono::Utc::now().timestamp().max(0) as u64);
        properties
            .message_id
            .get_or_insert_with(|| Uuid::new_v4().to_string());

        exchange.publish(content, routing_key, properties).await?;
        debug!(exchange = exchange_name, routing_key, "bus event message sent");
        Ok(())
    }

    /// Sends an already built message to an exchange or a queue.
    pub async fn send<'a>(
        &self,
        target: impl Into<Target<'a>>,
        message: &Message,
        routing_key: &str,
    ) -> Result<(), BusError> {
        message.send_to(target, routing_key).await
    }

    /// Routes messages matching `routing_key` from `exchange_name` into
    /// `queue_name` and hands them to `handler`.
    ///
    /// The first subscription on a queue starts its dispatch consumer; later
    /// ones only add a binding and a pattern.
    pub async fn subscribe<H>(
        &self,
        queue_name: &str,
        exchange_name: &str,
        routing_key: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<(), BusError>
    where
        H: MessageHandler + 'static,
    {
        let exchange = self.declare_exchange(exchange_name, options.kind, options.exchange);
        let queue = self.declare_queue(queue_name, options.queue);
        exchange.initialized().await?;

        let dispatcher = &self.inner.dispatcher;
        dispatcher.register(routing_key, Arc::new(handler))?;

        if let Err(err) = queue.bind(&exchange, routing_key, Arguments::new()).await {
            dispatcher.unregister(routing_key);
            return Err(err);
        }

        if !dispatcher.mark_activated(queue_name) {
            return Ok(());
        }

        let inner = Arc::downgrade(&self.inner);
        let receive_from_yourself = options.receive_from_yourself;
        let started = queue
            .activate_consumer(
                move |message: Message| {
                    let inner = inner.clone();
                    async move {
                        let inner = inner
                            .upgrade()
                            .ok_or_else(|| BusError::Closed("connection".to_owned()))?;
                        inner
                            .dispatcher
                            .dispatch(message, inner.id(), receive_from_yourself)
                            .await;
                        Ok::<(), BusError>(())
                    }
                },
                options.consume,
            )
            .await;

        match started {
            Ok(result) => {
                info!(
                    queue = queue_name,
                    consumer_tag = result.consumer_tag,
                    "queue consumer created"
                );
                Ok(())
            }
            Err(err) => {
                dispatcher.unmark(queue_name);
                Err(err)
            }
        }
    }

    /// Removes the handler registered for `routing_key`.
    pub fn unsubscribe(&self, routing_key: &str) -> bool {
        self.inner.dispatcher.unregister(routing_key)
    }

    /// Closes every queue and exchange, then the transport. Terminal and idempotent.
    pub async fn close(&self) -> Result<(), BusError> {
        self.inner.close().await
    }

    /// Closes the connection and drops every registered resource and handler.
    pub async fn dispose(&self) -> Result<(), BusError> {
        let result = self.inner.close().await;
        self.inner.clear();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockAmqpConnection, MockTransport};
    use std::sync::atomic::AtomicUsize;

    fn refusing_transport(attempts: Arc<AtomicUsize>) -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_connect().returning(move |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(BusError::ConnectionError("refused".into()))
        });
        transport
    }

    #[test]
    fn connection_id_is_stable_and_prefixed() {
        let connection = Connection::new(
            ConnectionConfig::default(),
            Arc::new(MockTransport::new()),
        );
        let id = connection.id().to_owned();
        assert!(id.starts_with("id-"));
        assert_eq!(id.len(), 19);
        assert_eq!(connection.id(), id);
    }

    #[tokio::test]
    async fn connect_failures_surface_as_connection_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connection = Connection::new(
            ConnectionConfig::default(),
            Arc::new(refusing_transport(attempts.clone())),
        );

        assert_eq!(
            connection.open().await,
            Err(BusError::ConnectionError("refused".into()))
        );
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        // a new attempt is made once the previous one settled
        assert!(connection.open().await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let mut transport = MockTransport::new();
        transport.expect_connect().times(1).returning(|_| {
            let mut conn = MockAmqpConnection::new();
            conn.expect_on_error().return_const(());
            conn.expect_is_open().return_const(true);
            Ok(Arc::new(conn) as Arc<dyn AmqpConnection>)
        });

        let connection = Connection::new(ConnectionConfig::default(), Arc::new(transport));
        let (a, b) = tokio::join!(connection.open(), connection.open());
        assert!(a.is_ok() && b.is_ok());
        assert!(connection.open().await.is_ok());
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn closed_connections_refuse_to_reconnect() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connection = Connection::new(
            ConnectionConfig::default(),
            Arc::new(refusing_transport(attempts.clone())),
        );

        assert!(connection.close().await.is_ok());
        assert!(connection.close().await.is_ok());
        assert_eq!(
            connection.open().await,
            Err(BusError::Closed("connection".into()))
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn event_kinds() {
        assert_eq!(ConnectionEvent::Reconnected.kind(), EventKind::Reconnected);
        assert_eq!(
            ConnectionEvent::Disconnected("lost".into()).kind(),
            EventKind::Disconnected
        );
    }
}
