// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Every queue owns at most one low-level consumer. Its lifecycle is
//! `uninitialized → starting → active → stopping → stopped`; concurrent
//! starts share the in-flight activation and concurrent stops share the
//! cancellation. After a connection rebuild an active consumer is re-armed on
//! the queue's new channel with its original handler and options.
//!
//! Two delivery modes exist. Raw handlers receive the delivery untouched and
//! may return reply content; the consumer then answers `reply_to`, acks on
//! success and nacks without requeue on failure. Decoded handlers receive a
//! [`Message`] and settle it themselves.

use crate::{
    errors::BusError,
    message::{pack, Acker, Content, Message, MessageProperties},
    otel,
    resource::{lock, spawn_shared, ResourceCore, SharedResult},
    transport::{AmqpChannel, ConsumeOptions, Delivery, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
};
use tracing::{debug, error, warn};

/// Handles decoded messages. Implemented for any matching async closure.
///
/// The handler owns settlement: call [`Message::ack`], [`Message::nack`] or
/// [`Message::reject`]. Returning an error, or panicking, nacks the message
/// without requeue unless it was settled already.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivered message.
    ///
    /// # Parameters
    /// * `message` - The decoded message, settleable on its delivery channel
    async fn handle(&self, message: Message) -> Result<(), BusError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BusError>> + Send,
{
    async fn handle(&self, message: Message) -> Result<(), BusError> {
        (self)(message).await
    }
}

/// Handles undecoded deliveries; returned content is sent back to `reply_to`.
///
/// The consumer settles raw deliveries itself: ack after success, nack without
/// requeue after a failure or a panic.
#[async_trait]
pub trait RawHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Returns
    /// Reply content for requests carrying `reply_to`, or `None`
    async fn handle(&self, delivery: Delivery) -> Result<Option<Content>, BusError>;
}

#[async_trait]
impl<F, Fut> RawHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Content>, BusError>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> Result<Option<Content>, BusError> {
        (self)(delivery).await
    }
}

#[derive(Clone)]
pub(crate) enum ConsumerHandler {
    Raw(Arc<dyn RawHandler>),
    Decoded(Arc<dyn MessageHandler>),
}

/// Observable consumer state of a queue.
///
/// Moves `Uninitialized → Starting → Active → Stopping → Stopped`; a failed
/// start falls back to `Uninitialized` and a stopped consumer may start again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// No consumer was ever started, or the last start failed
    Uninitialized,
    /// `basic.consume` is in flight
    Starting,
    /// Deliveries are flowing to the handler
    Active,
    /// The consumer is being cancelled
    Stopping,
    /// Cancelled; a new start is allowed
    Stopped,
}

/// Outcome of a successful consumer start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartConsumerResult {
    /// Tag assigned by the broker, unique per channel
    pub consumer_tag: String,
}

#[derive(Clone)]
struct ActiveConsumer {
    tag: String,
    channel: Arc<dyn AmqpChannel>,
    handler: ConsumerHandler,
    options: ConsumeOptions,
}

enum SlotState {
    Uninitialized,
    Starting(SharedResult<String>),
    Active(ActiveConsumer),
    Stopping(SharedResult<()>),
    Stopped,
}

enum StopStep {
    Done,
    WaitStart(SharedResult<String>),
    WaitStop(SharedResult<()>),
}

/// Consumer registration of one queue.
///
/// Holds the handler and options of the active consumer so a rebuild can
/// re-register it on the queue's new channel.
pub(crate) struct ConsumerSlot {
    state: Mutex<SlotState>,
}

impl Default for ConsumerSlot {
    fn default() -> Self {
        ConsumerSlot {
            state: Mutex::new(SlotState::Uninitialized),
        }
    }
}

impl ConsumerSlot {
    pub(crate) fn status(&self) -> ConsumerStatus {
        match &*lock(&self.state) {
            SlotState::Uninitialized => ConsumerStatus::Uninitialized,
            SlotState::Starting(_) => ConsumerStatus::Starting,
            SlotState::Active(_) => ConsumerStatus::Active,
            SlotState::Stopping(_) => ConsumerStatus::Stopping,
            SlotState::Stopped => ConsumerStatus::Stopped,
        }
    }

    pub(crate) fn tag(&self) -> Option<String> {
        match &*lock(&self.state) {
            SlotState::Active(active) => Some(active.tag.clone()),
            _ => None,
        }
    }

    /// Starts the consumer, or joins a start already in flight.
    ///
    /// # Errors
    /// [`BusError::ConsumerStateError`] while a consumer is active or stopping
    pub(crate) async fn start(
        self: &Arc<Self>,
        core: &Arc<ResourceCore>,
        handler: ConsumerHandler,
        options: ConsumeOptions,
    ) -> Result<StartConsumerResult, BusError> {
        let pending = {
            let mut state = lock(&self.state);
            match &*state {
                SlotState::Starting(pending) => pending.clone(),
                SlotState::Active(_) => {
                    return Err(BusError::consumer_state(
                        &core.name,
                        "consumer already active",
                    ))
                }
                SlotState::Stopping(_) => {
                    return Err(BusError::consumer_state(&core.name, "consumer is stopping"))
                }
                SlotState::Uninitialized | SlotState::Stopped => {
                    let pending = spawn_shared(Self::activate(
                        self.clone(),
                        core.clone(),
                        handler,
                        options,
                    ));
                    *state = SlotState::Starting(pending.clone());
                    pending
                }
            }
        };

        pending
            .await
            .map(|consumer_tag| StartConsumerResult { consumer_tag })
    }

    async fn activate(
        self: Arc<Self>,
        core: Arc<ResourceCore>,
        handler: ConsumerHandler,
        options: ConsumeOptions,
    ) -> Result<String, BusError> {
        let result = async {
            let channel = core.ready().await?;
            let stream = channel.basic_consume(&core.name, &options).await?;
            Ok::<_, BusError>((channel, stream))
        }
        .await;

        let mut state = lock(&self.state);
        match result {
            Ok((channel, stream)) => {
                let tag = stream.consumer_tag.clone();
                debug!(queue = core.name, consumer_tag = tag, "consumer started");

                spawn_delivery_loop(
                    core.name.clone(),
                    channel.clone(),
                    stream,
                    handler.clone(),
                    options.no_ack,
                );
                *state = SlotState::Active(ActiveConsumer {
                    tag: tag.clone(),
                    channel,
                    handler,
                    options,
                });
                Ok(tag)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = core.name,
                    "failure to create the consumer"
                );
                *state = SlotState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Cancels the consumer. Safe while a start is still in flight: the start
    /// settles first and is then reversed.
    pub(crate) async fn stop(self: &Arc<Self>, queue: &str) -> Result<(), BusError> {
        loop {
            let step = {
                let mut state = lock(&self.state);
                match &*state {
                    SlotState::Uninitialized | SlotState::Stopped => StopStep::Done,
                    SlotState::Starting(pending) => StopStep::WaitStart(pending.clone()),
                    SlotState::Stopping(pending) => StopStep::WaitStop(pending.clone()),
                    SlotState::Active(active) => {
                        let pending = spawn_shared(Self::cancel(
                            self.clone(),
                            queue.to_owned(),
                            active.clone(),
                        ));
                        *state = SlotState::Stopping(pending.clone());
                        StopStep::WaitStop(pending)
                    }
                }
            };

            match step {
                StopStep::Done => return Ok(()),
                StopStep::WaitStart(pending) => {
                    let _ = pending.await;
                }
                StopStep::WaitStop(pending) => return pending.await,
            }
        }
    }

    async fn cancel(
        self: Arc<Self>,
        queue: String,
        active: ActiveConsumer,
    ) -> Result<(), BusError> {
        let result = active.channel.basic_cancel(&active.tag).await;

        let mut state = lock(&self.state);
        match result {
            Ok(()) => {
                debug!(queue, consumer_tag = active.tag, "consumer stopped");
                *state = SlotState::Stopped;
                Ok(())
            }
            // a dead channel already dropped the consumer
            Err(err) if err.is_recoverable() => {
                warn!(error = err.to_string(), queue, "consumer channel already gone");
                *state = SlotState::Stopped;
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to cancel consumer");
                *state = SlotState::Active(active);
                Err(err)
            }
        }
    }

    /// Re-registers an active consumer on the queue's current channel.
    pub(crate) async fn rearm(&self, core: &ResourceCore) -> Result<(), BusError> {
        let active = match &*lock(&self.state) {
            SlotState::Active(active) => active.clone(),
            _ => return Ok(()),
        };

        let channel = core.ready().await?;
        let stream = channel.basic_consume(&core.name, &active.options).await?;
        let tag = stream.consumer_tag.clone();

        spawn_delivery_loop(
            core.name.clone(),
            channel.clone(),
            stream,
            active.handler.clone(),
            active.options.no_ack,
        );

        if let SlotState::Active(current) = &mut *lock(&self.state) {
            debug!(queue = core.name, consumer_tag = tag, "consumer re-armed");
            current.tag = tag;
            current.channel = channel;
        }

        Ok(())
    }
}

fn spawn_delivery_loop(
    queue: String,
    channel: Arc<dyn AmqpChannel>,
    mut stream: DeliveryStream,
    handler: ConsumerHandler,
    no_ack: bool,
) {
    tokio::spawn(async move {
        let tracer = global::tracer("amqp consumer");

        while let Some(delivery) = stream.deliveries.recv().await {
            if let Err(err) = consume(&tracer, &queue, &channel, delivery, &handler, no_ack).await
            {
                error!(error = err.to_string(), queue, "error consume msg");
            }
        }

        debug!(queue, consumer_tag = stream.consumer_tag, "delivery stream closed");
    });
}

fn handler_panicked(queue: &str) -> BusError {
    BusError::DispatchError(format!("handler of `{}` panicked", queue))
}

/// Hands one delivery to the handler and settles it according to the mode.
///
/// A panicking handler counts as a failed one: the delivery is nacked
/// without requeue and the loop moves on to the next delivery.
async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    channel: &Arc<dyn AmqpChannel>,
    delivery: Delivery,
    handler: &ConsumerHandler,
    no_ack: bool,
) -> Result<(), BusError> {
    let routing_key = delivery.fields.routing_key.clone();
    let (_ctx, mut span) = otel::new_span(&delivery.properties.headers, tracer, &routing_key);

    debug!(queue, routing_key, "received");

    let result = match handler {
        ConsumerHandler::Decoded(handler) => {
            let acker = Acker::new(channel.clone(), delivery.fields.delivery_tag, no_ack);
            let message = Message::from_delivery(delivery, Some(acker));

            let outcome = AssertUnwindSafe(handler.handle(message.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(handler_panicked(queue)));

            match outcome {
                Ok(()) => Ok(()),
                Err(err) => {
                    // no-op if the handler settled it already
                    message.nack(false).await?;
                    Err(err)
                }
            }
        }
        ConsumerHandler::Raw(handler) => {
            let delivery_tag = delivery.fields.delivery_tag;
            let reply_to = delivery.properties.reply_to.clone();
            let correlation_id = delivery.properties.correlation_id.clone();

            let outcome = AssertUnwindSafe(handler.handle(delivery))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(handler_panicked(queue)));

            match outcome {
                Ok(reply) => {
                    if let (Some(content), Some(reply_to)) = (reply, reply_to) {
                        let mut properties = MessageProperties {
                            correlation_id,
                            ..Default::default()
                        };
                        let data = pack(&content, &mut properties);
                        channel
                            .basic_publish("", &reply_to, &data, &properties)
                            .await?;
                    }

                    if !no_ack {
                        channel.basic_ack(delivery_tag).await.map_err(|err| {
                            error!(error = err.to_string(), "error whiling ack msg");
                            BusError::AckMessageError
                        })?;
                    }
                    Ok(())
                }
                Err(err) => {
                    if !no_ack {
                        channel.basic_nack(delivery_tag, false, false).await?;
                    }
                    Err(err)
                }
            }
        }
    };

    match &result {
        Ok(()) => span.set_status(Status::Ok),
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{message::DeliveryFields, transport::MockAmqpChannel};
    use tokio::sync::mpsc;

    fn delivery(tag: u64) -> Delivery {
        Delivery {
            data: b"payload".to_vec(),
            properties: MessageProperties::default()
                .with_reply_to("amq.rabbitmq.reply-to.test")
                .with_correlation_id("c-1"),
            fields: DeliveryFields {
                delivery_tag: tag,
                routing_key: "jobs".into(),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn raw_handler_reply_is_published_then_acked() {
        let mut channel = MockAmqpChannel::new();
        let mut seq = mockall::Sequence::new();
        channel
            .expect_basic_publish()
            .withf(|ex, rk, data, props| {
                ex.is_empty()
                    && rk == "amq.rabbitmq.reply-to.test"
                    && data == b"done"
                    && props.correlation_id.as_deref() == Some("c-1")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_basic_ack()
            .withf(|tag| *tag == 7)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);
        let handler = ConsumerHandler::Raw(Arc::new(|_d: Delivery| async {
            Ok::<_, BusError>(Some(Content::from("done")))
        }));

        let tracer = global::tracer("test");
        consume(&tracer, "jobs", &channel, delivery(7), &handler, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn raw_handler_failure_nacks_without_requeue() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .withf(|tag, all, requeue| *tag == 3 && !*all && !*requeue)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);
        let handler = ConsumerHandler::Raw(Arc::new(|_d: Delivery| async {
            Err::<Option<Content>, _>(BusError::InternalError("boom".into()))
        }));

        let tracer = global::tracer("test");
        let result = consume(&tracer, "jobs", &channel, delivery(3), &handler, false).await;
        assert_eq!(result, Err(BusError::InternalError("boom".into())));
    }

    #[tokio::test]
    async fn no_ack_mode_never_settles() {
        let channel: Arc<dyn AmqpChannel> = Arc::new(MockAmqpChannel::new());
        let handler = ConsumerHandler::Decoded(Arc::new(|msg: Message| async move {
            msg.ack().await?;
            Err::<(), _>(BusError::InternalError("ignored".into()))
        }));

        let tracer = global::tracer("test");
        let result = consume(&tracer, "jobs", &channel, delivery(1), &handler, true).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn delivery_loop_keeps_running_after_handler_errors() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let mut channel = MockAmqpChannel::new();
        channel.expect_basic_nack().returning(|_, _, _| Ok(()));
        channel.expect_basic_ack().returning(|_| Ok(()));

        let handler = ConsumerHandler::Decoded(Arc::new(move |msg: Message| {
            let seen_tx = seen_tx.clone();
            async move {
                let tag = msg.fields.as_ref().map(|f| f.delivery_tag).unwrap_or_default();
                seen_tx.send(tag).unwrap();
                if tag == 1 {
                    return Err(BusError::InternalError("first fails".into()));
                }
                msg.ack().await
            }
        }));

        spawn_delivery_loop(
            "jobs".into(),
            Arc::new(channel),
            DeliveryStream {
                consumer_tag: "ctag".into(),
                deliveries: rx,
            },
            handler,
            false,
        );

        tx.send(delivery(1)).unwrap();
        tx.send(delivery(2)).unwrap();

        assert_eq!(seen_rx.recv().await, Some(1));
        assert_eq!(seen_rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn a_panicking_handler_is_nacked_and_the_loop_survives() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .withf(|tag, all, requeue| *tag == 1 && !*all && !*requeue)
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel
            .expect_basic_ack()
            .withf(|tag| *tag == 2)
            .times(1)
            .returning(|_| Ok(()));

        let handler = ConsumerHandler::Decoded(Arc::new(move |msg: Message| {
            let seen_tx = seen_tx.clone();
            async move {
                let tag = msg.fields.as_ref().map(|f| f.delivery_tag).unwrap_or_default();
                if tag == 1 {
                    panic!("handler bug");
                }
                msg.ack().await?;
                seen_tx.send(tag).unwrap();
                Ok(())
            }
        }));

        spawn_delivery_loop(
            "jobs".into(),
            Arc::new(channel),
            DeliveryStream {
                consumer_tag: "ctag".into(),
                deliveries: rx,
            },
            handler,
            false,
        );

        tx.send(delivery(1)).unwrap();
        tx.send(delivery(2)).unwrap();

        assert_eq!(seen_rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn a_panicking_raw_handler_is_reported_as_a_dispatch_error() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_basic_nack()
            .withf(|tag, _, requeue| *tag == 4 && !*requeue)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);
        let handler = ConsumerHandler::Raw(Arc::new(|_d: Delivery| async {
            if true {
                panic!("raw handler bug");
            }
            Ok::<Option<Content>, BusError>(None)
        }));

        let tracer = global::tracer("test");
        let result = consume(&tracer, "jobs", &channel, delivery(4), &handler, false).await;
        assert!(matches!(result, Err(BusError::DispatchError(_))));
    }
}
