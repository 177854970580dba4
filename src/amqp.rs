// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport over lapin
//!
//! Implements the transport boundary on top of lapin: connections, channels,
//! declarations, bindings, publishing and consumers. Broker refusals caused by
//! incompatible declarations (`PRECONDITION_FAILED`, `NOT_FOUND`) are mapped to
//! [`BusError::DeclarationConflict`]; every other failure is a recoverable
//! [`BusError::ChannelError`].

use crate::{
    config::ConnectionConfig,
    errors::BusError,
    exchange::{ExchangeKind, ExchangeOptions},
    message::{DeliveryFields, MessageProperties},
    queue::QueueOptions,
    transport::{
        AmqpChannel, AmqpConnection, ArgValue, Arguments, ConsumeOptions, Delivery,
        DeliveryStream, ErrorHandler, QueueDeclared, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRecoverOptions, BasicRejectOptions,
        ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Header carrying the CC routing keys
pub const AMQP_HEADERS_CC: &str = "CC";
/// Header carrying the BCC routing keys
pub const AMQP_HEADERS_BCC: &str = "BCC";

const REPLY_SUCCESS: u16 = 200;

/// Translates a lapin failure into a bus error.
///
/// # Parameters
/// * `context` - Resource or operation named in the resulting error
/// * `err` - The lapin error
///
/// # Returns
/// [`BusError::DeclarationConflict`] for soft `PRECONDITION_FAILED` and
/// `NOT_FOUND` refusals, [`BusError::ChannelError`] for everything else
fn map_error(context: &str, err: lapin::Error) -> BusError {
    if let lapin::Error::ProtocolError(amqp) = &err {
        if matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
                | AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)
        ) {
            return BusError::declaration(context, amqp.get_message());
        }
    }

    BusError::ChannelError(format!("{}: {}", context, err))
}

/// Opens lapin connections.
///
/// The connection is named after the configured application, so it can be
/// told apart in the broker's management UI.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

#[async_trait]
impl Transport for LapinTransport {
    /// Connects to the URI rendered from `cfg`.
    ///
    /// # Errors
    /// [`BusError::ConnectionError`] when the broker is unreachable or refuses
    /// the credentials
    async fn connect(&self, cfg: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>, BusError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app_name.clone()));

        let conn = match Connection::connect(&cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(BusError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// An open lapin connection.
///
/// Channels created from it are independent: a channel closed by the broker
/// does not affect the others.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, BusError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(map_error("create channel", err))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    /// Forwards lapin's connection-level failures to `handler` as
    /// [`BusError::ConnectionError`].
    fn on_error(&self, handler: ErrorHandler) {
        self.conn.on_error(move |err| {
            handler(BusError::ConnectionError(err.to_string()));
        });
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.is_open() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| BusError::ConnectionError(err.to_string()))
    }
}

/// A lapin channel owned by one exchange or queue.
pub struct LapinChannel {
    channel: Channel,
}

/// Converts declaration or binding arguments into an AMQP field table.
///
/// Integers are sent as signed 64-bit values and text as long strings.
fn field_table(args: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in args {
        let value = match value {
            ArgValue::Bool(v) => AMQPValue::Boolean(*v),
            ArgValue::Int(v) => AMQPValue::LongLongInt(*v),
            ArgValue::Text(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

/// Encodes CC/BCC routing keys as a field array of long strings.
fn routing_keys(keys: &[String]) -> AMQPValue {
    AMQPValue::FieldArray(FieldArray::from(
        keys.iter()
            .map(|key| AMQPValue::LongString(LongString::from(key.clone())))
            .collect::<Vec<_>>(),
    ))
}

fn short(value: &Option<String>) -> Option<ShortString> {
    value.as_ref().map(|v| ShortString::from(v.clone()))
}

/// Converts bus properties into lapin's representation.
///
/// Text headers become long strings; CC and BCC keys are carried as field
/// arrays under the `CC` and `BCC` headers.
pub(crate) fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &props.headers {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    if !props.cc.is_empty() {
        headers.insert(ShortString::from(AMQP_HEADERS_CC), routing_keys(&props.cc));
    }
    if !props.bcc.is_empty() {
        headers.insert(ShortString::from(AMQP_HEADERS_BCC), routing_keys(&props.bcc));
    }

    let mut amqp = BasicProperties::default().with_headers(headers);

    if let Some(v) = short(&props.content_type) {
        amqp = amqp.with_content_type(v);
    }
    if let Some(v) = short(&props.content_encoding) {
        amqp = amqp.with_content_encoding(v);
    }
    if let Some(v) = short(&props.correlation_id) {
        amqp = amqp.with_correlation_id(v);
    }
    if let Some(v) = short(&props.reply_to) {
        amqp = amqp.with_reply_to(v);
    }
    if let Some(v) = short(&props.expiration) {
        amqp = amqp.with_expiration(v);
    }
    if let Some(v) = short(&props.message_id) {
        amqp = amqp.with_message_id(v);
    }
    if let Some(v) = short(&props.kind) {
        amqp = amqp.with_type(v);
    }
    if let Some(v) = short(&props.user_id) {
        amqp = amqp.with_user_id(v);
    }
    if let Some(v) = short(&props.app_id) {
        amqp = amqp.with_app_id(v);
    }
    if let Some(v) = short(&props.cluster_id) {
        amqp = amqp.with_cluster_id(v);
    }
    if let Some(v) = props.priority {
        amqp = amqp.with_priority(v);
    }
    if let Some(v) = props.delivery_mode {
        amqp = amqp.with_delivery_mode(v);
    }
    if let Some(v) = props.timestamp {
        amqp = amqp.with_timestamp(v);
    }

    amqp
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        _ => None,
    }
}

fn header_list(value: &AMQPValue) -> Vec<String> {
    match value {
        AMQPValue::FieldArray(values) => values.as_slice().iter().filter_map(header_text).collect(),
        other => header_text(other).into_iter().collect(),
    }
}

/// Converts lapin properties back into bus properties.
pub(crate) fn from_amqp_properties(amqp: &BasicProperties) -> MessageProperties {
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.to_string());
    let mut props = MessageProperties {
        content_type: text(amqp.content_type()),
        content_encoding: text(amqp.content_encoding()),
        correlation_id: text(amqp.correlation_id()),
        reply_to: text(amqp.reply_to()),
        priority: *amqp.priority(),
        expiration: text(amqp.expiration()),
        message_id: text(amqp.message_id()),
        timestamp: *amqp.timestamp(),
        kind: text(amqp.kind()),
        user_id: text(amqp.user_id()),
        app_id: text(amqp.app_id()),
        cluster_id: text(amqp.cluster_id()),
        delivery_mode: *amqp.delivery_mode(),
        ..Default::default()
    };

    if let Some(headers) = amqp.headers() {
        for (key, value) in headers.inner() {
            match key.as_str() {
                AMQP_HEADERS_CC => props.cc = header_list(value),
                AMQP_HEADERS_BCC => props.bcc = header_list(value),
                name => {
                    if let Some(text) = header_text(value) {
                        props.headers.insert(name.to_owned(), text);
                    }
                }
            }
        }
    }

    props
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: &ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), BusError> {
        debug!(exchange = name, kind = kind.as_str(), "declaring exchange");
        let lapin_kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        };

        self.channel
            .exchange_declare(
                name,
                lapin_kind,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                field_table(&options.declaration_arguments()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                map_error(name, err)
            })
    }

    /// Passive declaration: succeeds only if the exchange exists.
    async fn exchange_check(&self, name: &str) -> Result<(), BusError> {
        self.channel
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| map_error(name, err))
    }

    async fn exchange_delete(&self, name: &str) -> Result<(), BusError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| map_error(name, err))
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueDeclared, BusError> {
        debug!(queue = name, "declaring queue");
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                map_error(name, err)
            })?;

        Ok(QueueDeclared {
            queue: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    /// Passive declaration: succeeds only if the queue exists, reporting its
    /// message and consumer counts.
    async fn queue_check(&self, name: &str) -> Result<QueueDeclared, BusError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| map_error(name, err))?;

        Ok(QueueDeclared {
            queue: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_delete(&self, name: &str) -> Result<u32, BusError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| map_error(name, err))
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions { nowait: false },
                field_table(args),
            )
            .await
            .map_err(|err| map_error(queue, err))
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        self.channel
            .queue_unbind(queue, exchange, pattern, field_table(args))
            .await
            .map_err(|err| map_error(queue, err))
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                pattern,
                ExchangeBindOptions::default(),
                field_table(args),
            )
            .await
            .map_err(|err| map_error(destination, err))
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        args: &Arguments,
    ) -> Result<(), BusError> {
        self.channel
            .exchange_unbind(
                destination,
                source,
                pattern,
                ExchangeUnbindOptions::default(),
                field_table(args),
            )
            .await
            .map_err(|err| map_error(destination, err))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), BusError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                to_amqp_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(map_error(exchange, err))
            }
            _ => Ok(()),
        }
    }

    /// Starts a lapin consumer and forwards its deliveries into a
    /// [`DeliveryStream`].
    ///
    /// The forwarding task ends when the lapin consumer is cancelled or its
    /// channel dies; the stream then yields `None`. A consumer priority in the
    /// options is sent as the `x-priority` argument.
    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<DeliveryStream, BusError> {
        let mut arguments = options.arguments.clone();
        if let Some(priority) = options.priority {
            arguments.insert("x-priority".to_owned(), ArgValue::Int(priority as i64));
        }

        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                field_table(&arguments),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(map_error(queue, err))
            }
            Ok(c) => Ok(c),
        }?;

        let consumer_tag = consumer.tag().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let tag = consumer_tag.clone();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            fields: DeliveryFields {
                                consumer_tag: tag.clone(),
                                delivery_tag: delivery.delivery_tag,
                                redelivered: delivery.redelivered,
                                exchange: delivery.exchange.to_string(),
                                routing_key: delivery.routing_key.to_string(),
                            },
                            properties: from_amqp_properties(&delivery.properties),
                            data: delivery.data,
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        break;
                    }
                }
            }
        });

        Ok(DeliveryStream {
            consumer_tag,
            deliveries: rx,
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BusError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                BusError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BusError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| map_error(consumer_tag, err))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| map_error("ack", err))
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), BusError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: all_up_to,
                    requeue,
                },
            )
            .await
            .map_err(|err| map_error("nack", err))
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| map_error("reject", err))
    }

    /// Asks the broker to redeliver every unacknowledged message on the channel.
    async fn basic_recover(&self, requeue: bool) -> Result<(), BusError> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue })
            .await
            .map_err(|err| map_error("recover", err))
    }

    async fn close(&self) -> Result<(), BusError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| map_error("close channel", err))
    }
}
