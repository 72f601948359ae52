// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `purelink` - connection supervision for fan/purifier appliances.
//!
//! This crate maintains live network connections to a fleet of
//! smart-home fan/purifier appliances and republishes their push
//! updates as classified events for a metrics sink.
//!
//! # Components
//!
//! - [`config`]: immutable device records and host overrides, loaded
//!   once at startup.
//! - [`transport`]: the per-device session capability and its MQTT
//!   implementation.
//! - [`discovery`]: local-network device discovery via presence beacons.
//! - [`supervisor`]: one device's connect / retry / poll lifecycle.
//! - [`manager`]: fleet orchestration, disconnect detection, and update
//!   routing.
//! - [`metrics`]: the sink boundary consuming classified updates.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use purelink::config::Config;
//! use purelink::discovery::BeaconDiscovery;
//! use purelink::manager::ConnectionManager;
//! use purelink::metrics::CountingSink;
//! use purelink::transport::MqttSession;
//!
//! #[tokio::main]
//! async fn main() -> purelink::Result<()> {
//!     let config = Config::load("purelink.toml")?;
//!
//!     let manager = ConnectionManager::new(
//!         Arc::new(BeaconDiscovery::new()),
//!         Arc::new(CountingSink::new()),
//!         Box::new(|device| Arc::new(MqttSession::new(device)) as _),
//!         config.supervision.clone(),
//!     );
//!
//!     // Runs until the process is interrupted.
//!     manager.run(config.devices, config.hosts).await
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Config, Credential, Device, HostOverrides, SupervisionConfig};
pub use discovery::{BeaconDiscovery, DiscoveredCallback, Discovery};
pub use error::{ConfigError, DiscoveryError, Error, Result, TransportError};
pub use manager::{ConnectionManager, TransportFactory};
pub use metrics::{CountingSink, MetricsSink};
pub use supervisor::{ConnectionState, DeviceSupervisor};
pub use transport::{DeviceMessage, DeviceTransport, MessageKind, MessageListener, MqttSession};
