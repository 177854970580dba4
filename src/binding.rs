// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bindings
//!
//! A binding routes messages from a source exchange to a destination queue or
//! exchange through a pattern. Its identity is `(destination, source,
//! pattern)` within one connection, so binding the same triple twice is a
//! no-op. The registry keeps a reverse index from each resource to the
//! bindings touching it so a delete can remove them without a full scan.

use crate::{
    connection::ConnectionInner,
    errors::BusError,
    resource::{lock, spawn_shared, SharedResult},
    transport::Arguments,
};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
};
use tracing::{debug, error};

/// A named exchange or queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceRef {
    Exchange(String),
    Queue(String),
}

impl ResourceRef {
    pub fn name(&self) -> &str {
        match self {
            ResourceRef::Exchange(name) | ResourceRef::Queue(name) => name,
        }
    }
}

/// Identity of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId {
    pub destination: ResourceRef,
    pub source: String,
    pub pattern: String,
}

impl fmt::Display for BindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.destination {
            ResourceRef::Exchange(_) => "exchange",
            ResourceRef::Queue(_) => "queue",
        };
        write!(
            f,
            "{}:{}<-{}[{}]",
            prefix,
            self.destination.name(),
            self.source,
            self.pattern
        )
    }
}

/// Routing rule from a source exchange to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub destination: ResourceRef,
    pub source: String,
    pub pattern: String,
    pub args: Arguments,
}

impl Binding {
    /// Describes a binding from exchange `source` to `destination`.
    ///
    /// # Parameters
    /// * `destination` - The queue or exchange receiving messages
    /// * `source` - Name of the exchange messages flow from
    /// * `pattern` - Routing pattern matched by `source`
    /// * `args` - Binding arguments, not part of the identity
    pub fn new(destination: ResourceRef, source: &str, pattern: &str, args: Arguments) -> Self {
        Binding {
            destination,
            source: source.to_owned(),
            pattern: pattern.to_owned(),
            args,
        }
    }

    /// Identity of the binding: destination, source and pattern.
    pub fn id(&self) -> BindingId {
        BindingId {
            destination: self.destination.clone(),
            source: self.source.clone(),
            pattern: self.pattern.clone(),
        }
    }
}

pub(crate) struct BindingEntry {
    pub(crate) binding: Binding,
    pub(crate) ready: SharedResult<()>,
}

/// Bindings owned by a connection plus the resource → bindings index.
#[derive(Default)]
pub(crate) struct BindingRegistry {
    entries: HashMap<BindingId, BindingEntry>,
    by_resource: HashMap<ResourceRef, BTreeSet<BindingId>>,
}

impl BindingRegistry {
    pub(crate) fn get(&self, id: &BindingId) -> Option<&BindingEntry> {
        self.entries.get(id)
    }

    pub(crate) fn insert(&mut self, binding: Binding, ready: SharedResult<()>) {
        let id = binding.id();

        self.by_resource
            .entry(id.destination.clone())
            .or_default()
            .insert(id.clone());
        self.by_resource
            .entry(ResourceRef::Exchange(id.source.clone()))
            .or_default()
            .insert(id.clone());

        self.entries.insert(id, BindingEntry { binding, ready });
    }

    pub(crate) fn remove(&mut self, id: &BindingId) -> Option<BindingEntry> {
        let entry = self.entries.remove(id)?;

        for resource in [
            id.destination.clone(),
            ResourceRef::Exchange(id.source.clone()),
        ] {
            if let Some(ids) = self.by_resource.get_mut(&resource) {
                ids.remove(id);
                if ids.is_empty() {
                    self.by_resource.remove(&resource);
                }
            }
        }

        Some(entry)
    }

    /// Bindings that use `resource` as source or destination, in a stable order.
    pub(crate) fn containing(&self, resource: &ResourceRef) -> Vec<BindingId> {
        self.by_resource
            .get(resource)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn replace_ready(&mut self, id: &BindingId, ready: SharedResult<()>) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.ready = ready;
        }
    }

    pub(crate) fn all(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> =
            self.entries.values().map(|e| e.binding.clone()).collect();
        bindings.sort_by_key(|b| b.id());
        bindings
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_resource.clear();
    }
}

impl ConnectionInner {
    /// Creates the binding on the broker, or joins the existing one.
    pub(crate) async fn bind(self: &Arc<Self>, binding: Binding) -> Result<Binding, BusError> {
        let id = binding.id();

        let ready = {
            let mut registry = lock(&self.bindings);
            match registry.get(&id) {
                Some(entry) => entry.ready.clone(),
                None => {
                    let ready = self.spawn_binding(binding.clone());
                    registry.insert(binding.clone(), ready.clone());
                    ready
                }
            }
        };

        match ready.await {
            Ok(()) => Ok(binding),
            Err(err) => {
                lock(&self.bindings).remove(&id);
                Err(err)
            }
        }
    }

    pub(crate) fn spawn_binding(self: &Arc<Self>, binding: Binding) -> SharedResult<()> {
        let inner = self.clone();
        spawn_shared(async move { inner.apply_binding(&binding).await })
    }

    async fn apply_binding(&self, binding: &Binding) -> Result<(), BusError> {
        let source = self
            .exchange(&binding.source)
            .ok_or_else(|| BusError::Closed(binding.source.clone()))?;
        source.initialized().await?;

        let result = match &binding.destination {
            ResourceRef::Queue(name) => {
                let queue = self
                    .queue(name)
                    .ok_or_else(|| BusError::Closed(name.clone()))?;
                let channel = queue.core().ready().await?;
                channel
                    .queue_bind(name, &binding.source, &binding.pattern, &binding.args)
                    .await
            }
            ResourceRef::Exchange(name) => {
                let destination = self
                    .exchange(name)
                    .ok_or_else(|| BusError::Closed(name.clone()))?;
                let channel = destination.core().ready().await?;
                channel
                    .exchange_bind(name, &binding.source, &binding.pattern, &binding.args)
                    .await
            }
        };

        match result {
            Ok(()) => {
                debug!(binding = binding.id().to_string(), "binding created");
                Ok(())
            }
            Err(err) if err.is_recoverable() => Err(err),
            Err(err) => {
                error!(error = err.to_string(), "error to bind");
                Err(BusError::BindingError(
                    binding.destination.name().to_owned(),
                    binding.source.clone(),
                ))
            }
        }
    }

    /// Removes the binding from the registry and the broker. Unknown ids are a no-op.
    pub(crate) async fn unbind(&self, id: &BindingId) -> Result<(), BusError> {
        let Some(entry) = lock(&self.bindings).remove(id) else {
            return Ok(());
        };

        if entry.ready.await.is_err() {
            // never reached the broker
            return Ok(());
        }

        let binding = entry.binding;
        let channel = match &binding.destination {
            ResourceRef::Queue(name) => self.queue(name).and_then(|q| q.core().channel()),
            ResourceRef::Exchange(name) => self.exchange(name).and_then(|e| e.core().channel()),
        }
        .or_else(|| {
            self.exchange(&binding.source)
                .and_then(|e| e.core().channel())
        });

        let Some(channel) = channel else {
            debug!(binding = id.to_string(), "no open channel left, dropping binding");
            return Ok(());
        };

        match &binding.destination {
            ResourceRef::Queue(name) => {
                channel
                    .queue_unbind(name, &binding.source, &binding.pattern, &binding.args)
                    .await
            }
            ResourceRef::Exchange(name) => {
                channel
                    .exchange_unbind(name, &binding.source, &binding.pattern, &binding.args)
                    .await
            }
        }
    }

    /// Unbinds everything that references `resource`, one binding at a time.
    pub(crate) async fn remove_bindings_containing(
        &self,
        resource: &ResourceRef,
    ) -> Result<(), BusError> {
        let ids = lock(&self.bindings).containing(resource);

        for id in ids {
            self.unbind(&id).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{future, FutureExt};

    fn ready() -> SharedResult<()> {
        future::ready(Ok::<(), BusError>(())).boxed().shared()
    }

    fn queue_binding(queue: &str, exchange: &str, pattern: &str) -> Binding {
        Binding::new(
            ResourceRef::Queue(queue.into()),
            exchange,
            pattern,
            Arguments::new(),
        )
    }

    #[test]
    fn identity_ignores_arguments() {
        let mut args = Arguments::new();
        args.insert("x-match".into(), "all".into());
        let a = queue_binding("q", "ex", "a.*");
        let b = Binding::new(ResourceRef::Queue("q".into()), "ex", "a.*", args);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn reverse_index_tracks_both_endpoints() {
        let mut registry = BindingRegistry::default();
        registry.insert(queue_binding("q1", "orders", "eu.*"), ready());
        registry.insert(queue_binding("q2", "orders", "us.*"), ready());
        registry.insert(
            Binding::new(
                ResourceRef::Exchange("audit".into()),
                "orders",
                "#",
                Arguments::new(),
            ),
            ready(),
        );

        assert_eq!(
            registry
                .containing(&ResourceRef::Exchange("orders".into()))
                .len(),
            3
        );
        assert_eq!(
            registry.containing(&ResourceRef::Queue("q1".into())),
            vec![queue_binding("q1", "orders", "eu.*").id()]
        );
        assert_eq!(
            registry
                .containing(&ResourceRef::Exchange("audit".into()))
                .len(),
            1
        );
    }

    #[test]
    fn removal_cleans_the_index() {
        let mut registry = BindingRegistry::default();
        let binding = queue_binding("q1", "orders", "eu.*");
        registry.insert(binding.clone(), ready());

        assert!(registry.remove(&binding.id()).is_some());
        assert!(registry.remove(&binding.id()).is_none());
        assert!(registry
            .containing(&ResourceRef::Exchange("orders".into()))
            .is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn queue_and_exchange_with_the_same_name_are_distinct() {
        let mut registry = BindingRegistry::default();
        registry.insert(queue_binding("shared", "src", ""), ready());

        assert!(registry
            .containing(&ResourceRef::Exchange("shared".into()))
            .is_empty());
        assert_eq!(
            registry
                .containing(&ResourceRef::Queue("shared".into()))
                .len(),
            1
        );
    }
}
