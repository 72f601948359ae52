// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the `purelink` service.
//!
//! This module provides the error hierarchy for the supervision subsystem:
//! configuration loading, device transport communication, and discovery.
//!
//! Recoverable errors (connect timeouts, transient poll failures) are
//! handled where they occur and never cross the supervisor boundary; only
//! startup-time configuration errors propagate to the process entry point.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Error occurred while loading configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error occurred on a device transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Error occurred in the discovery service.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Errors related to loading the device configuration at startup.
///
/// All of these are fatal: the process exits with a distinct status
/// instead of starting discovery.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("could not read {path}: {source}")]
    Read {
        /// Path that failed to load.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("could not parse {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// The underlying TOML error.
        source: toml::de::Error,
    },

    /// No devices are configured.
    #[error("no devices configured")]
    NoDevices,
}

/// Errors related to a single device's transport session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection attempt did not complete within the transport's
    /// connect timeout. Recoverable: the supervisor schedules a retry.
    #[error("timed out connecting to {host} after {timeout_ms} ms")]
    ConnectTimeout {
        /// Host the attempt was made against.
        host: String,
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// An operation was attempted while the session is not connected.
    ///
    /// Seen by the poll task when the underlying handle has been torn
    /// down between the connectivity check and the request. Recoverable:
    /// the iteration is skipped.
    #[error("session is not connected")]
    NotConnected,

    /// The session closed or failed before the connection was
    /// established. Retried like a timeout.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// MQTT client request failed.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Invalid host or address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl TransportError {
    /// Returns true if this error is a connect timeout.
    #[must_use]
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, Self::ConnectTimeout { .. })
    }
}

/// Errors related to the discovery service.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The discovery listener socket could not be bound.
    #[error("could not bind discovery socket on {addr}: {source}")]
    Bind {
        /// Address the bind was attempted on.
        addr: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A device could not be registered because discovery is not running.
    #[error("discovery is not running")]
    NotRunning,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
