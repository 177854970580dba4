// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! A `Message` carries an immutable payload plus the protocol properties that
//! travel with it. Content is normalized to bytes on the way out and restored
//! on the way in:
//!
//! - bytes pass through untouched
//! - text becomes UTF-8 bytes tagged with `content_encoding = utf-8`
//! - JSON values are serialized and tagged with `content_type = application/json`
//!
//! Messages delivered by a consumer also carry their delivery fields and can
//! be acknowledged, rejected or answered.

use crate::{
    errors::BusError,
    exchange::Exchange,
    queue::Queue,
    transport::{AmqpChannel, Delivery},
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content encoding used to tag text payloads
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";

/// Protocol properties sent along with a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the unix epoch.
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
    pub delivery_mode: Option<u8>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Sets the id a reply echoes back to its request.
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Sets the destination replies are sent to.
    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    /// Sets the message type (`type` property).
    ///
    /// Replies of kind `error` are remote failures.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    /// Sets the message priority, honoured by priority queues.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the per-message TTL.
    ///
    /// # Parameters
    /// * `millis` - Expiration in milliseconds
    pub fn with_expiration(mut self, millis: u64) -> Self {
        self.expiration = Some(millis.to_string());
        self
    }

    /// Adds a text header.
    ///
    /// # Parameters
    /// * `key` - Header name
    /// * `value` - Header value
    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// Fields describing how a message was delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryFields {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// Logical message content.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl Content {
    /// Serializes any value into JSON content.
    pub fn json<T: Serialize>(value: &T) -> Result<Content, BusError> {
        serde_json::to_value(value)
            .map(Content::Json)
            .map_err(|err| BusError::ParsePayloadError(err.to_string()))
    }
}

impl From<Vec<u8>> for Content {
    fn from(v: Vec<u8>) -> Self {
        Content::Bytes(v)
    }
}

impl From<&[u8]> for Content {
    fn from(v: &[u8]) -> Self {
        Content::Bytes(v.to_vec())
    }
}

impl From<String> for Content {
    fn from(v: String) -> Self {
        Content::Text(v)
    }
}

impl From<&str> for Content {
    fn from(v: &str) -> Self {
        Content::Text(v.to_owned())
    }
}

impl From<Value> for Content {
    fn from(v: Value) -> Self {
        Content::Json(v)
    }
}

/// Normalizes content into bytes, tagging `properties` with the encoding used.
///
/// A content type already set by the caller is kept.
pub fn pack(content: &Content, properties: &mut MessageProperties) -> Vec<u8> {
    match content {
        Content::Bytes(bytes) => bytes.clone(),
        Content::Text(text) => {
            if properties.content_type.is_none() && properties.content_encoding.is_none() {
                properties.content_encoding = Some(UTF8_CONTENT_ENCODING.to_owned());
            }
            text.as_bytes().to_vec()
        }
        Content::Json(value) => {
            if properties.content_type.is_none() {
                properties.content_type = Some(JSON_CONTENT_TYPE.to_owned());
            }
            value.to_string().into_bytes()
        }
    }
}

/// Restores the logical content from bytes, dispatching on the content type.
///
/// Unknown content types come back as raw bytes.
pub fn unpack(data: &[u8], properties: &MessageProperties) -> Result<Content, BusError> {
    let content_type = properties.content_type.as_deref().unwrap_or_default();

    if content_type.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
        return serde_json::from_slice(data)
            .map(Content::Json)
            .map_err(|err| BusError::ParsePayloadError(err.to_string()));
    }

    let is_text = content_type.starts_with("text/")
        || properties
            .content_encoding
            .as_deref()
            .is_some_and(|enc| {
                enc.eq_ignore_ascii_case(UTF8_CONTENT_ENCODING) || enc.eq_ignore_ascii_case("utf8")
            });

    if is_text {
        if let Ok(text) = std::str::from_utf8(data) {
            return Ok(Content::Text(text.to_owned()));
        }
    }

    Ok(Content::Bytes(data.to_vec()))
}

/// Settles a delivery on the channel it arrived on.
#[derive(Clone)]
pub(crate) struct Acker {
    channel: Arc<dyn AmqpChannel>,
    delivery_tag: u64,
    no_ack: bool,
    settled: Arc<AtomicBool>,
}

impl Acker {
    pub(crate) fn new(channel: Arc<dyn AmqpChannel>, delivery_tag: u64, no_ack: bool) -> Self {
        Acker {
            channel,
            delivery_tag,
            no_ack,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns true the first time it is called for a delivery that needs settling.
    fn claim(&self) -> bool {
        !self.no_ack && !self.settled.swap(true, Ordering::SeqCst)
    }
}

/// Where [`Message::send_to`] publishes.
pub enum Target<'a> {
    Exchange(&'a Exchange),
    Queue(&'a Queue),
}

impl<'a> From<&'a Exchange> for Target<'a> {
    fn from(ex: &'a Exchange) -> Self {
        Target::Exchange(ex)
    }
}

impl<'a> From<&'a Queue> for Target<'a> {
    fn from(q: &'a Queue) -> Self {
        Target::Queue(q)
    }
}

/// A bus message: payload, properties and, once delivered, delivery fields.
#[derive(Clone)]
pub struct Message {
    data: Vec<u8>,
    pub properties: MessageProperties,
    pub fields: Option<DeliveryFields>,
    acker: Option<Acker>,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("data_len", &self.data.len())
            .field("properties", &self.properties)
            .field("fields", &self.fields)
            .finish()
    }
}

impl Message {
    /// Creates an outbound message, packing `content` into its wire form.
    pub fn new(content: impl Into<Content>, properties: MessageProperties) -> Message {
        let mut properties = properties;
        let data = pack(&content.into(), &mut properties);

        Message {
            data,
            properties,
            fields: None,
            acker: None,
        }
    }

    pub(crate) fn from_delivery(delivery: Delivery, acker: Option<Acker>) -> Message {
        Message {
            data: delivery.data,
            properties: delivery.properties,
            fields: Some(delivery.fields),
            acker,
        }
    }

    /// Raw payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decoded payload.
    pub fn content(&self) -> Result<Content, BusError> {
        unpack(&self.data, &self.properties)
    }

    /// Decodes a JSON payload into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_slice(&self.data)
            .map_err(|err| BusError::ParsePayloadError(err.to_string()))
    }

    /// Routing key the message was published with; `None` before delivery.
    pub fn routing_key(&self) -> Option<&str> {
        self.fields.as_ref().map(|f| f.routing_key.as_str())
    }

    /// Publishes this message to an exchange or queue.
    ///
    /// Both [`Exchange::send`] and [`Queue::send`] go through here, so the
    /// payload and properties are framed identically for either target.
    pub async fn send_to<'a>(
        &self,
        target: impl Into<Target<'a>>,
        routing_key: &str,
    ) -> Result<(), BusError> {
        let mut properties = self.properties.clone();
        crate::otel::inject_context(&mut properties.headers);

        match target.into() {
            Target::Exchange(exchange) => {
                exchange
                    .core()
                    .publish(exchange.name(), routing_key, &self.data, &properties)
                    .await
            }
            Target::Queue(queue) => {
                queue
                    .core()
                    .publish("", queue.name(), &self.data, &properties)
                    .await
            }
        }
    }

    /// Acknowledges the delivery. A no-op in no-ack mode or once settled.
    pub async fn ack(&self) -> Result<(), BusError> {
        let Some(acker) = self.claim() else {
            return Ok(());
        };

        acker.channel.basic_ack(acker.delivery_tag).await.map_err(|err| {
            error!(error = err.to_string(), "failure to ack message");
            BusError::AckMessageError
        })
    }

    /// Negatively acknowledges the delivery. A no-op in no-ack mode or once settled.
    pub async fn nack(&self, requeue: bool) -> Result<(), BusError> {
        let Some(acker) = self.claim() else {
            return Ok(());
        };

        acker
            .channel
            .basic_nack(acker.delivery_tag, false, requeue)
            .await
    }

    /// Rejects the delivery. A no-op in no-ack mode or once settled.
    pub async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        let Some(acker) = self.claim() else {
            return Ok(());
        };

        acker.channel.basic_reject(acker.delivery_tag, requeue).await
    }

    /// Answers a request on the channel it was delivered on, echoing its
    /// correlation id to the `reply_to` destination.
    pub async fn reply(&self, content: impl Into<Content>) -> Result<(), BusError> {
        self.reply_with(content, MessageProperties::default()).await
    }

    pub(crate) async fn reply_with(
        &self,
        content: impl Into<Content>,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let Some(reply_to) = self.properties.reply_to.as_deref() else {
            return Err(BusError::PublishingError(
                "message has no reply_to destination".to_owned(),
            ));
        };
        let Some(acker) = self.acker.as_ref() else {
            return Err(BusError::PublishingError(
                "message was not delivered by a consumer".to_owned(),
            ));
        };

        let mut properties = properties;
        properties.correlation_id = self.properties.correlation_id.clone();
        let data = pack(&content.into(), &mut properties);

        debug!(reply_to, "sending reply");
        acker
            .channel
            .basic_publish("", reply_to, &data, &properties)
            .await
    }

    fn claim(&self) -> Option<&Acker> {
        self.acker.as_ref().filter(|acker| acker.claim())
    }
}
