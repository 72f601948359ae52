// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device configuration loaded at startup.
//!
//! The configuration file is TOML:
//!
//! ```toml
//! [[devices]]
//! name = "Living Room"
//! serial = "AB1-XX-1234ABCD"
//! credential = "aGVsbG8gd29ybGQ="
//! product_type = "438"
//!
//! # Optional: skip discovery for devices with a known address.
//! [hosts]
//! "AB1-XX-1234ABCD" = "10.0.0.5"
//!
//! # Optional: supervision timing overrides.
//! [supervision]
//! retry_interval_secs = 30
//! environment_refresh_secs = 30
//! ```
//!
//! Device records and host overrides are immutable after load; the
//! supervision subsystem only ever reads them.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Default interval between connect retries after a timeout.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Default interval between environmental data polls.
pub const DEFAULT_ENVIRONMENT_REFRESH: Duration = Duration::from_secs(30);

/// Identity and credentials for one appliance.
///
/// Immutable after load. The serial is the device's globally unique
/// identifier; host override lookups treat it case-insensitively.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    /// Display name, e.g. "Living Room".
    pub name: String,
    /// Device serial, e.g. `AB1-XX-1234ABCD`.
    pub serial: String,
    /// Opaque connection secret.
    pub credential: Credential,
    /// Product type tag, e.g. `438`.
    pub product_type: String,
}

impl Device {
    /// Creates a new device record.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        serial: impl Into<String>,
        credential: impl Into<String>,
        product_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            serial: serial.into(),
            credential: Credential::new(credential),
            product_type: product_type.into(),
        }
    }
}

/// An opaque device secret.
///
/// Holds the credential used to authenticate the transport session.
/// The `Debug` representation is redacted so the secret never lands in
/// logs.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Wraps a secret string.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Exposes the secret for transport authentication.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(****)")
    }
}

/// Manual address overrides, keyed by uppercased serial.
///
/// Devices present in this table are connected directly instead of via
/// discovery. Consulted once per connection attempt.
#[derive(Debug, Clone, Default)]
pub struct HostOverrides(HashMap<String, String>);

impl HostOverrides {
    /// Builds the table from `serial -> address` pairs.
    ///
    /// Keys are uppercased so lookups are case-insensitive.
    #[must_use]
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(serial, addr)| (serial.to_uppercase(), addr))
                .collect(),
        )
    }

    /// Returns the manual address for a serial, if configured.
    #[must_use]
    pub fn lookup(&self, serial: &str) -> Option<&str> {
        self.0.get(&serial.to_uppercase()).map(String::as_str)
    }

    /// Returns the number of configured overrides.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no overrides are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Timing knobs for the connection supervisors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    /// Seconds between connect retries after a timeout.
    pub retry_interval_secs: u64,
    /// Seconds between environmental data polls.
    pub environment_refresh_secs: u64,
}

impl SupervisionConfig {
    /// Returns the retry interval as a `Duration`.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Returns the environment refresh interval as a `Duration`.
    #[must_use]
    pub fn environment_refresh(&self) -> Duration {
        Duration::from_secs(self.environment_refresh_secs)
    }
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            retry_interval_secs: DEFAULT_RETRY_INTERVAL.as_secs(),
            environment_refresh_secs: DEFAULT_ENVIRONMENT_REFRESH.as_secs(),
        }
    }
}

/// The full startup configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Configured device records.
    pub devices: Vec<Device>,
    /// Manual address overrides.
    pub hosts: HostOverrides,
    /// Supervision timing.
    pub supervision: SupervisionConfig,
}

/// On-disk shape of the configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    hosts: HashMap<String, String>,
    #[serde(default)]
    supervision: SupervisionConfig,
}

impl Config {
    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid TOML. Both are fatal at
    /// startup.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns the underlying TOML error on invalid input.
    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        let raw: RawConfig = toml::from_str(contents)?;

        Ok(Self {
            devices: raw.devices,
            hosts: HostOverrides::new(raw.hosts),
            supervision: raw.supervision,
        })
    }
}
