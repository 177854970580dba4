// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod resource;

pub mod amqp;
pub mod binding;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod pattern;
pub mod queue;
pub mod rpc;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use connection::Connection;
pub use errors::BusError;
