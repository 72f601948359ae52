// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local-network device discovery.
//!
//! The appliances periodically broadcast a small JSON presence beacon on
//! a well-known UDP port. [`BeaconDiscovery`] listens for those beacons,
//! matches them against registered serials (case-insensitively) and
//! fires each registration's callback once with the sender's address.
//!
//! The underlying mechanism cannot withdraw a single registration: the
//! registration table persists across [`stop`](Discovery::stop) /
//! [`start`](Discovery::start), and re-registering a serial replaces the
//! previous entry. Callers that need to re-arm discovery for one device
//! therefore restart the whole service and register again, which never
//! duplicates listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::DiscoveryError;

/// UDP port the appliances announce themselves on.
pub const DEFAULT_ANNOUNCE_PORT: u16 = 56710;

/// Callback invoked with the discovered network address.
///
/// Runs on the discovery task; implementations must hand off promptly
/// (e.g. by spawning the connect) instead of blocking.
pub type DiscoveredCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Discovery service capability.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Starts (or restarts) the discovery listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying mechanism cannot be started.
    async fn start(&self) -> Result<(), DiscoveryError>;

    /// Stops the discovery listener. Registrations are kept.
    async fn stop(&self);

    /// Associates a serial with a callback fired once when the device is
    /// first seen. Replaces any previous registration for that serial.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be registered; the failure
    /// affects only this device's discovery path.
    async fn register_device(
        &self,
        serial: &str,
        on_found: DiscoveredCallback,
    ) -> Result<(), DiscoveryError>;
}

/// A presence beacon as broadcast by the appliances.
#[derive(Debug, Deserialize)]
struct Beacon {
    serial: String,
}

/// One registered device.
struct Registration {
    on_found: DiscoveredCallback,
    /// Set once the callback has fired; reset by re-registration.
    notified: bool,
}

/// Registration table, keyed by uppercased serial.
#[derive(Default)]
struct Registrations {
    devices: RwLock<HashMap<String, Registration>>,
}

impl Registrations {
    fn insert(&self, serial: &str, on_found: DiscoveredCallback) {
        self.devices.write().insert(
            serial.to_uppercase(),
            Registration {
                on_found,
                notified: false,
            },
        );
    }

    /// Matches a raw beacon against the table.
    ///
    /// Returns the callback to fire, or `None` if the beacon is
    /// unparseable, unknown, or already notified. Marks the
    /// registration notified before releasing the lock so a racing
    /// beacon cannot fire the callback twice.
    fn match_beacon(&self, payload: &[u8]) -> Option<(String, DiscoveredCallback)> {
        let beacon: Beacon = serde_json::from_slice(payload).ok()?;
        let key = beacon.serial.to_uppercase();

        let mut devices = self.devices.write();
        let registration = devices.get_mut(&key)?;
        if registration.notified {
            return None;
        }
        registration.notified = true;

        Some((key, Arc::clone(&registration.on_found)))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.devices.read().len()
    }
}

/// UDP beacon listener implementing [`Discovery`].
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use purelink::discovery::{BeaconDiscovery, Discovery};
///
/// # async fn example() -> Result<(), purelink::error::DiscoveryError> {
/// let discovery = BeaconDiscovery::new();
/// discovery.start().await?;
///
/// discovery
///     .register_device(
///         "AB1-XX-1234ABCD",
///         Arc::new(|address| println!("found at {address}")),
///     )
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct BeaconDiscovery {
    port: u16,
    registrations: Arc<Registrations>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl BeaconDiscovery {
    /// Creates a listener on the default announce port.
    #[must_use]
    pub fn new() -> Self {
        Self::with_port(DEFAULT_ANNOUNCE_PORT)
    }

    /// Creates a listener on a specific port.
    ///
    /// Port 0 binds an ephemeral port; see
    /// [`local_addr`](Self::local_addr).
    #[must_use]
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            registrations: Arc::new(Registrations::default()),
            listen_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Returns the bound listener address while discovery is running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl Default for BeaconDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Discovery for BeaconDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        // Restart semantics: drop any previous listener first.
        self.stop().await;

        let bind_addr = format!("0.0.0.0:{}", self.port);
        let socket = UdpSocket::bind(&bind_addr)
            .await
            .map_err(|source| DiscoveryError::Bind {
                addr: bind_addr,
                source,
            })?;

        let local_addr = socket.local_addr().map_err(|source| DiscoveryError::Bind {
            addr: format!("0.0.0.0:{}", self.port),
            source,
        })?;
        *self.local_addr.lock() = Some(local_addr);

        tracing::info!(addr = %local_addr, "Discovery listening for device beacons");

        let registrations = Arc::clone(&self.registrations);
        let task = tokio::spawn(listen_for_beacons(socket, registrations));
        *self.listen_task.lock() = Some(task);

        Ok(())
    }

    async fn stop(&self) {
        if let Some(task) = self.listen_task.lock().take() {
            task.abort();
            tracing::debug!("Discovery listener stopped");
        }
        *self.local_addr.lock() = None;
    }

    async fn register_device(
        &self,
        serial: &str,
        on_found: DiscoveredCallback,
    ) -> Result<(), DiscoveryError> {
        self.registrations.insert(serial, on_found);
        tracing::debug!(serial = %serial, "Device registered for discovery");
        Ok(())
    }
}

impl std::fmt::Debug for BeaconDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeaconDiscovery")
            .field("port", &self.port)
            .field("running", &self.local_addr.lock().is_some())
            .finish_non_exhaustive()
    }
}

/// Receives beacons and fires matching registrations.
async fn listen_for_beacons(socket: UdpSocket, registrations: Arc<Registrations>) {
    let mut buf = [0u8; 1024];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::error!(error = %e, "Discovery socket error, listener exiting");
                break;
            }
        };

        if let Some((serial, on_found)) = registrations.match_beacon(&buf[..len]) {
            let address = peer.ip().to_string();
            tracing::info!(serial = %serial, %address, "Discovered device");
            on_found(address);
        }
    }
}
