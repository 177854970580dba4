// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Pub/Sub Dispatcher
//!
//! Subscriptions register a topic pattern and a handler. Each queue used for
//! subscriptions gets a single dispatch consumer; every message it receives is
//! acknowledged first and then handed to every handler whose pattern matches
//! the routing key. Overlapping patterns are intentional: all of them fire.
//!
//! Messages published by the local connection carry its id as `app_id` and
//! are dropped (still acknowledged) unless the subscriber opted in.

use crate::{consumer::MessageHandler, errors::BusError, message::Message, pattern::TopicPattern};
use futures_util::FutureExt;
use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, PoisonError, RwLock},
};
use tracing::{debug, error, info};

struct Route {
    pattern: TopicPattern,
    handler: Arc<dyn MessageHandler>,
}

/// Routing key pattern → handler table shared by a connection's subscriptions.
#[derive(Default)]
pub struct Dispatcher {
    routes: RwLock<HashMap<String, Route>>,
    activated: Mutex<HashSet<String>>,
}

impl Dispatcher {
    /// Registers `handler` for `pattern`, replacing any previous handler.
    ///
    /// # Errors
    /// Returns [`BusError::ConfigError`] if `pattern` cannot be compiled.
    pub fn register(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let route = Route {
            pattern: TopicPattern::new(pattern)?,
            handler,
        };
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.to_owned(), route);

        info!(pattern, "callback registered");
        Ok(())
    }

    pub fn unregister(&self, pattern: &str) -> bool {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pattern)
            .is_some()
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        patterns.sort();
        patterns
    }

    /// Marks the dispatch consumer of `queue` as created. Returns false if it already was.
    pub(crate) fn mark_activated(&self, queue: &str) -> bool {
        self.activated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_owned())
    }

    pub(crate) fn unmark(&self, queue: &str) {
        self.activated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(queue);
    }

    pub(crate) fn clear(&self) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.activated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Acknowledges `message` and runs every matching handler.
    ///
    /// Handler failures and panics are logged and never reach other handlers
    /// or the consumer. Returns how many handlers ran.
    pub async fn dispatch(
        &self,
        message: Message,
        local_id: &str,
        receive_from_yourself: bool,
    ) -> usize {
        if let Err(err) = message.ack().await {
            error!(error = err.to_string(), "error whiling ack msg");
        }

        if !receive_from_yourself && message.properties.app_id.as_deref() == Some(local_id) {
            debug!(app_id = local_id, "skipping message published by this connection");
            return 0;
        }

        let routing_key = message.routing_key().unwrap_or_default().to_owned();
        let handlers: Vec<(String, Arc<dyn MessageHandler>)> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|route| route.pattern.matches(&routing_key))
            .map(|route| (route.pattern.as_str().to_owned(), route.handler.clone()))
            .collect();

        for (pattern, handler) in &handlers {
            let outcome = AssertUnwindSafe(handler.handle(message.clone()))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => BusError::DispatchError(err.to_string()),
                Err(_) => BusError::DispatchError("handler panicked".to_owned()),
            };
            error!(
                error = failure.to_string(),
                pattern,
                routing_key,
                "subscriber failed"
            );
        }

        handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{DeliveryFields, MessageProperties},
        transport::Delivery,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delivered(routing_key: &str, app_id: &str) -> Message {
        Message::from_delivery(
            Delivery {
                data: b"{}".to_vec(),
                properties: MessageProperties::default().with_app_id(app_id),
                fields: DeliveryFields {
                    routing_key: routing_key.into(),
                    ..Default::default()
                },
            },
            None,
        )
    }

    fn counting(counter: &Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        let counter = counter.clone();
        Arc::new(move |_msg: Message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn every_matching_pattern_fires() {
        let dispatcher = Dispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register("eu.#", counting(&hits)).unwrap();
        dispatcher.register("*.orders", counting(&hits)).unwrap();
        dispatcher.register("us.*", counting(&hits)).unwrap();

        let ran = dispatcher
            .dispatch(delivered("eu.orders", "id-remote"), "id-local", false)
            .await;

        assert_eq!(ran, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn own_messages_are_filtered_unless_opted_in() {
        let dispatcher = Dispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register("#", counting(&hits)).unwrap();

        let own = delivered("eu.orders", "id-local");
        assert_eq!(dispatcher.dispatch(own.clone(), "id-local", false).await, 0);
        assert_eq!(dispatcher.dispatch(own, "id-local", true).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_isolated() {
        let dispatcher = Dispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.register(
            "a.#",
            Arc::new(|_msg: Message| async {
                Err::<(), _>(BusError::InternalError("handler failed".into()))
            }),
        )
        .unwrap();
        dispatcher.register(
            "a.*",
            Arc::new(|_msg: Message| async {
                if true {
                    panic!("handler exploded");
                }
                Ok::<(), BusError>(())
            }),
        )
        .unwrap();
        dispatcher.register("#", counting(&hits)).unwrap();

        let ran = dispatcher
            .dispatch(delivered("a.b", "id-remote"), "id-local", false)
            .await;

        assert_eq!(ran, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_and_activation_marks() {
        let dispatcher = Dispatcher::default();
        let hits = Arc::new(AtomicUsize::new(0));
        dispatcher.register("a.b", counting(&hits)).unwrap();

        assert_eq!(dispatcher.patterns(), vec!["a.b".to_owned()]);
        assert!(dispatcher.unregister("a.b"));
        assert!(!dispatcher.unregister("a.b"));

        assert!(dispatcher.mark_activated("q"));
        assert!(!dispatcher.mark_activated("q"));
        dispatcher.unmark("q");
        assert!(dispatcher.mark_activated("q"));
    }
}
