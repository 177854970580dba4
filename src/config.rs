// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Broker address, credentials and bus-wide defaults. The configuration can be
//! deserialized with serde or read from the process environment.

use crate::errors::BusError;
use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};

pub const ENV_HOST: &str = "RABBITMQ_HOST";
pub const ENV_PORT: &str = "RABBITMQ_PORT";
pub const ENV_USER: &str = "RABBITMQ_USER";
pub const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_RPC_TIMEOUT_MS: &str = "RABBITMQ_RPC_TIMEOUT_MS";
pub const ENV_HEARTBEAT_SECS: &str = "RABBITMQ_HEARTBEAT_SECS";

/// Parameters used to open a connection to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Reported to the broker as the connection name and used in private queue names.
    pub app_name: String,
    /// Default deadline for RPC calls; `None` waits forever.
    pub rpc_timeout_ms: Option<u64>,
    pub heartbeat_secs: Option<u16>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            app_name: "rabbitbus".to_owned(),
            rpc_timeout_ms: None,
            heartbeat_secs: None,
        }
    }
}

impl ConnectionConfig {
    /// Reads the configuration from the environment, falling back to the
    /// defaults for every variable that is not set.
    pub fn from_env() -> Result<Self, BusError> {
        let defaults = ConnectionConfig::default();

        Ok(ConnectionConfig {
            host: env::var(ENV_HOST).unwrap_or(defaults.host),
            port: parse_var(ENV_PORT)?.unwrap_or(defaults.port),
            user: env::var(ENV_USER).unwrap_or(defaults.user),
            password: env::var(ENV_PASSWORD).unwrap_or(defaults.password),
            vhost: env::var(ENV_VHOST).unwrap_or(defaults.vhost),
            app_name: env::var(ENV_APP_NAME).unwrap_or(defaults.app_name),
            rpc_timeout_ms: parse_var(ENV_RPC_TIMEOUT_MS)?,
            heartbeat_secs: parse_var(ENV_HEARTBEAT_SECS)?,
        })
    }

    /// Renders the AMQP URI. The default vhost `/` is percent-encoded.
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_owned()
        } else {
            self.vhost.trim_start_matches('/').to_owned()
        };

        let mut uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        );

        if let Some(heartbeat) = self.heartbeat_secs {
            uri.push_str(&format!("?heartbeat={}", heartbeat));
        }

        uri
    }

    /// Default reply deadline of RPC calls; `None` waits forever.
    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: FromStr>(key: &str) -> Result<Option<T>, BusError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| BusError::ConfigError(key.to_owned(), raw)),
        Err(_) => Ok(None),
    }
}
