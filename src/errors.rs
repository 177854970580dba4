// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Bus
//!
//! The `BusError` enum represents every failure the bus can surface: transport
//! connection problems, channel failures that drive the rebuild path,
//! declaration conflicts, consumer state violations, handler failures and RPC
//! timeouts. It is `Clone` so a single in-flight result (a connect attempt, a
//! consumer start, a delete) can be handed to every caller awaiting it.

use thiserror::Error;

/// Represents errors that can occur during bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// The broker is unreachable or refused the credentials
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// A channel died or could not be created; recoverable through a rebuild
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// The resource exists with incompatible options, or a "must exist" check failed
    #[error("declaration conflict on `{name}`: {reason}")]
    DeclarationConflict { name: String, reason: String },

    /// A consumer operation was not valid for the consumer's current state
    #[error("consumer state error on `{0}`: {1}")]
    ConsumerStateError(String, String),

    /// A message handler failed
    #[error("failure to dispatch message: {0}")]
    DispatchError(String),

    /// No reply arrived for an RPC request before its deadline
    #[error("rpc request `{0}` timed out")]
    RpcTimeout(String),

    /// The RPC server answered with an error
    #[error("rpc server error: {0}")]
    RemoteError(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error binding a destination to a source exchange
    #[error("failure to bind `{0}` to `{1}`")]
    BindingError(String, String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Invalid configuration value
    #[error("invalid configuration `{0}`: {1}")]
    ConfigError(String, String),

    /// The resource or connection was closed or deleted
    #[error("`{0}` is closed")]
    Closed(String),
}

impl BusError {
    pub(crate) fn declaration(name: &str, reason: impl ToString) -> Self {
        BusError::DeclarationConflict {
            name: name.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn consumer_state(queue: &str, reason: &str) -> Self {
        BusError::ConsumerStateError(queue.to_owned(), reason.to_owned())
    }

    /// Returns true for failures that a channel rebuild can repair.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, BusError::ChannelError(_))
    }
}
