// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Lifecycle
//!
//! Exchanges and queues share one lifecycle: each owns a channel and an
//! explicit initialization state (`pending → ready | failed`, or `closed` once
//! torn down). Every public operation awaits that state first, so calls made
//! before the declaration completes queue behind it instead of racing it.

use crate::{
    binding::ResourceRef,
    connection::ConnectionInner,
    errors::BusError,
    message::MessageProperties,
    rpc::RpcEngine,
    transport::AmqpChannel,
};
use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, warn};

/// A spawned operation whose single result is shared by every caller awaiting it.
pub(crate) type SharedResult<T> = Shared<BoxFuture<'static, Result<T, BusError>>>;

/// Runs `fut` on the runtime and hands out a cloneable handle to its result.
///
/// The operation keeps running even if every caller stops waiting.
pub(crate) fn spawn_shared<T, F>(fut: F) -> SharedResult<T>
where
    T: Clone + Send + Sync + 'static,
    F: Future<Output = Result<T, BusError>> + Send + 'static,
{
    let handle = tokio::spawn(fut);

    async move {
        handle
            .await
            .unwrap_or_else(|err| Err(BusError::InternalError(err.to_string())))
    }
    .boxed()
    .shared()
}

/// Locks a registry mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResourceKind {
    Exchange,
    Queue,
}

pub(crate) enum InitState {
    Pending,
    Ready(Arc<dyn AmqpChannel>),
    Failed(BusError),
    Closed,
}

/// Channel, initialization state and teardown results of one exchange or queue.
pub(crate) struct ResourceCore {
    pub(crate) name: String,
    pub(crate) kind: ResourceKind,
    connection: Weak<ConnectionInner>,
    state: watch::Sender<InitState>,
    pub(crate) rpc: RpcEngine,
    deleting: OnceCell<Result<(), BusError>>,
    closing: OnceCell<Result<(), BusError>>,
}

impl ResourceCore {
    pub(crate) fn new(
        connection: &Arc<ConnectionInner>,
        name: &str,
        kind: ResourceKind,
    ) -> Arc<ResourceCore> {
        let (state, _) = watch::channel(InitState::Pending);

        Arc::new(ResourceCore {
            name: name.to_owned(),
            kind,
            connection: Arc::downgrade(connection),
            state,
            rpc: RpcEngine::default(),
            deleting: OnceCell::new(),
            closing: OnceCell::new(),
        })
    }

    pub(crate) fn reference(&self) -> ResourceRef {
        match self.kind {
            ResourceKind::Exchange => ResourceRef::Exchange(self.name.clone()),
            ResourceKind::Queue => ResourceRef::Queue(self.name.clone()),
        }
    }

    pub(crate) fn connection(&self) -> Result<Arc<ConnectionInner>, BusError> {
        self.connection
            .upgrade()
            .ok_or_else(|| BusError::Closed("connection".to_owned()))
    }

    /// Opens a fresh channel and runs `declare` on it in the background.
    ///
    /// Used both for the first declaration and for re-declaration during a
    /// rebuild; the resource keeps its identity either way.
    pub(crate) fn initialize<F, Fut>(self: &Arc<Self>, declare: F)
    where
        F: FnOnce(Arc<dyn AmqpChannel>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.state.send_replace(InitState::Pending);
        self.rpc.reset(BusError::ChannelError(format!(
            "`{}` was re-initialized",
            self.name
        )));

        let core = self.clone();
        tokio::spawn(async move {
            let result = async {
                let connection = core.connection()?.ensure_connected().await?;
                let channel = connection.create_channel().await?;
                if let Err(err) = declare(channel.clone()).await {
                    // the broker closes the channel on a refused declaration anyway
                    let _ = channel.close().await;
                    return Err(err);
                }
                Ok::<_, BusError>(channel)
            }
            .await;

            match result {
                Ok(channel) => {
                    debug!(name = core.name, "resource declared");
                    core.state.send_replace(InitState::Ready(channel));
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = core.name,
                        "failure to declare resource"
                    );

                    if matches!(err, BusError::DeclarationConflict { .. }) {
                        if let Ok(connection) = core.connection() {
                            connection.forget(&core);
                        }
                    }
                    core.state.send_replace(InitState::Failed(err));
                }
            }
        });
    }

    /// Waits for the declaration to settle and returns the resource's channel.
    pub(crate) async fn ready(&self) -> Result<Arc<dyn AmqpChannel>, BusError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, InitState::Pending))
            .await
            .map_err(|_| BusError::Closed(self.name.clone()))?;

        match &*state {
            InitState::Ready(channel) => Ok(channel.clone()),
            InitState::Failed(err) => Err(err.clone()),
            InitState::Closed => Err(BusError::Closed(self.name.clone())),
            InitState::Pending => Err(BusError::InternalError(
                "resource still pending".to_owned(),
            )),
        }
    }

    /// A resource is valid while it is declared on a channel that is still open.
    pub(crate) fn is_valid(&self) -> bool {
        match &*self.state.borrow() {
            InitState::Ready(channel) => channel.is_open(),
            InitState::Pending => true,
            _ => false,
        }
    }

    /// True when the last declaration attempt failed.
    pub(crate) fn is_failed(&self) -> bool {
        matches!(&*self.state.borrow(), InitState::Failed(_))
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(&*self.state.borrow(), InitState::Closed)
    }

    /// Channel currently holding the resource, if declared.
    pub(crate) fn channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        match &*self.state.borrow() {
            InitState::Ready(channel) => Some(channel.clone()),
            _ => None,
        }
    }

    /// Publishes on this resource's channel. A channel failure triggers one
    /// connection-wide rebuild followed by exactly one retry.
    pub(crate) async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        match self
            .try_publish(exchange, routing_key, payload, properties)
            .await
        {
            Err(err) if err.is_recoverable() => {
                warn!(
                    error = err.to_string(),
                    name = self.name,
                    "publish failed, rebuilding channels"
                );
                self.connection()?.rebuild_all(err).await?;

                debug!(name = self.name, "retransmitting message");
                self.try_publish(exchange, routing_key, payload, properties)
                    .await
            }
            other => other,
        }
    }

    async fn try_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        let channel = self.ready().await?;
        channel
            .basic_publish(exchange, routing_key, payload, properties)
            .await
    }

    /// Deletes the resource on the broker. Runs `before` first; later calls
    /// return the first call's result without touching the broker.
    pub(crate) async fn delete<Fut>(&self, before: Fut) -> Result<(), BusError>
    where
        Fut: Future<Output = Result<(), BusError>>,
    {
        self.deleting
            .get_or_init(|| async {
                before.await?;
                self.teardown(true).await
            })
            .await
            .clone()
    }

    /// Releases the resource's channel without deleting the broker object.
    pub(crate) async fn close<Fut>(&self, before: Fut) -> Result<(), BusError>
    where
        Fut: Future<Output = Result<(), BusError>>,
    {
        self.closing
            .get_or_init(|| async {
                if self.is_closed() {
                    return Ok(());
                }
                before.await?;
                self.teardown(false).await
            })
            .await
            .clone()
    }

    async fn teardown(&self, delete: bool) -> Result<(), BusError> {
        let channel = self.ready().await?;

        // Bindings must go before the resource itself.
        if let Ok(connection) = self.connection() {
            connection
                .remove_bindings_containing(&self.reference())
                .await?;
        }

        if delete {
            match self.kind {
                ResourceKind::Exchange => channel.exchange_delete(&self.name).await?,
                ResourceKind::Queue => {
                    let dropped = channel.queue_delete(&self.name).await?;
                    debug!(name = self.name, dropped, "queue deleted");
                }
            }
        }

        self.invalidate();
        if let Ok(connection) = self.connection() {
            connection.forget(self);
        }

        channel.close().await
    }

    pub(crate) fn invalidate(&self) {
        self.state.send_replace(InitState::Closed);
        self.rpc.reset(BusError::Closed(self.name.clone()));
    }
}
