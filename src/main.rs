// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `purelink` service entry point.
//!
//! Loads the device configuration, wires the connection manager to the
//! beacon discovery service and the counting metrics sink, and
//! supervises the fleet until interrupted.
//!
//! # Exit codes
//!
//! - `1`: the configuration file could not be read or parsed.
//! - `2`: no devices are configured.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use purelink::config::Config;
use purelink::discovery::BeaconDiscovery;
use purelink::manager::ConnectionManager;
use purelink::metrics::CountingSink;
use purelink::transport::{DeviceTransport, MqttSession};

/// Configuration could not be loaded.
const EXIT_CONFIG: u8 = 1;

/// No devices configured.
const EXIT_NO_DEVICES: u8 = 2;

/// Supervises connections to fan/purifier appliances.
#[derive(Debug, Parser)]
#[command(name = "purelink", version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "purelink.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    tracing::info!(config = %args.config.display(), "Starting up");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Could not load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if config.devices.is_empty() {
        tracing::error!("No devices configured; add [[devices]] entries to the configuration");
        return ExitCode::from(EXIT_NO_DEVICES);
    }

    let manager = ConnectionManager::new(
        Arc::new(BeaconDiscovery::new()),
        Arc::new(CountingSink::new()),
        Box::new(|device| Arc::new(MqttSession::new(device)) as Arc<dyn DeviceTransport>),
        config.supervision.clone(),
    );

    if let Err(e) = manager.run(config.devices, config.hosts).await {
        tracing::error!(error = %e, "Supervision failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
