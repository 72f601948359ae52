// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection manager for the whole device fleet.
//!
//! The [`ConnectionManager`] builds one [`DeviceSupervisor`] per
//! configured device and decides how each gets connected: directly when
//! a host override exists, via discovery otherwise. It routes inbound
//! push messages, infers disconnects from the connection layer itself
//! (the push transport does not reliably surface disconnects as their
//! own message type), re-arms discovery after one, and forwards
//! classified updates to the metrics sink.
//!
//! # Concurrency
//!
//! Discovery callbacks, transport push deliveries, and retry/poll timers
//! all fire on independent tasks. Every device gets its own
//! single-consumer dispatch queue, so same-device handling is serialized
//! while devices never contend with each other.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::config::{Device, HostOverrides, SupervisionConfig};
use crate::discovery::{DiscoveredCallback, Discovery};
use crate::error::{ConfigError, Error};
use crate::metrics::MetricsSink;
use crate::supervisor::DeviceSupervisor;
use crate::transport::{DeviceMessage, DeviceTransport};

/// Builds a transport session for a device record.
pub type TransportFactory = Box<dyn Fn(&Device) -> Arc<dyn DeviceTransport> + Send + Sync>;

struct ManagerInner {
    discovery: Arc<dyn Discovery>,
    sink: Arc<dyn MetricsSink>,
    transport_factory: TransportFactory,
    supervision: SupervisionConfig,
    hosts: RwLock<HostOverrides>,
    supervisors: RwLock<Vec<DeviceSupervisor>>,
}

/// Orchestrates connection supervision for all configured devices.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use purelink::config::{Config, SupervisionConfig};
/// use purelink::discovery::BeaconDiscovery;
/// use purelink::manager::ConnectionManager;
/// use purelink::metrics::CountingSink;
/// use purelink::transport::MqttSession;
///
/// # async fn example(config: Config) -> purelink::error::Result<()> {
/// let manager = ConnectionManager::new(
///     Arc::new(BeaconDiscovery::new()),
///     Arc::new(CountingSink::new()),
///     Box::new(|device| Arc::new(MqttSession::new(device)) as _),
///     config.supervision.clone(),
/// );
///
/// // Blocks until the process is interrupted.
/// manager.run(config.devices, config.hosts).await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Creates a manager from its collaborators.
    #[must_use]
    pub fn new(
        discovery: Arc<dyn Discovery>,
        sink: Arc<dyn MetricsSink>,
        transport_factory: TransportFactory,
        supervision: SupervisionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                discovery,
                sink,
                transport_factory,
                supervision,
                hosts: RwLock::new(HostOverrides::default()),
                supervisors: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Supervises the fleet until the process is interrupted.
    ///
    /// Wires every device, then blocks on ctrl-c. On interrupt, all
    /// supervisors are disconnected and discovery is stopped before
    /// returning; nothing inside the system triggers termination.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoDevices`] when `devices` is empty
    /// (before discovery is touched) and any error from starting the
    /// discovery service.
    pub async fn run(&self, devices: Vec<Device>, hosts: HostOverrides) -> Result<(), Error> {
        self.start(devices, hosts).await?;

        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Could not listen for shutdown signal");
        }

        tracing::info!("Interrupted; shutting down");
        self.shutdown().await;

        Ok(())
    }

    /// Wires every configured device without blocking.
    ///
    /// Starts discovery, then builds a supervisor per device, attaches
    /// its message listener and either connects it directly (host
    /// override) or registers it with discovery.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoDevices`] when `devices` is empty and
    /// any error from starting the discovery service.
    pub async fn start(&self, devices: Vec<Device>, hosts: HostOverrides) -> Result<(), Error> {
        if devices.is_empty() {
            return Err(ConfigError::NoDevices.into());
        }

        *self.inner.hosts.write() = hosts;

        tracing::info!(devices = devices.len(), "Starting discovery");
        self.inner.discovery.start().await?;

        for device in devices {
            let transport = (self.inner.transport_factory)(&device);
            let supervisor = DeviceSupervisor::with_intervals(
                device,
                transport,
                self.inner.supervision.retry_interval(),
                self.inner.supervision.environment_refresh(),
            );

            self.attach_listener(&supervisor);
            self.inner.supervisors.write().push(supervisor.clone());

            self.connect_or_register(supervisor).await;
        }

        Ok(())
    }

    /// Disconnects every supervisor and stops discovery.
    pub async fn shutdown(&self) {
        let supervisors: Vec<_> = self.inner.supervisors.read().clone();
        for supervisor in supervisors {
            supervisor.disconnect().await;
        }
        self.inner.discovery.stop().await;
    }

    /// Returns the supervisors, in configuration order.
    #[must_use]
    pub fn supervisors(&self) -> Vec<DeviceSupervisor> {
        self.inner.supervisors.read().clone()
    }

    /// Attaches the device's one and only message listener.
    ///
    /// The listener forwards into an unbounded per-device queue drained
    /// by a dedicated dispatch task, so the transport's event loop is
    /// never blocked and same-device messages are handled in order.
    fn attach_listener(&self, supervisor: &DeviceSupervisor) {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeviceMessage>();

        supervisor
            .transport()
            .add_message_listener(Arc::new(move |message| {
                let _ = tx.send(message.clone());
            }));

        let manager = self.clone();
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                manager.handle_message(&supervisor, &message).await;
            }
        });
    }

    /// Connects a device directly or registers it with discovery.
    ///
    /// Also the re-add path after a detected disconnect; it never
    /// attaches a listener. Registration failure is fatal for this
    /// device's discovery path only.
    async fn connect_or_register(&self, supervisor: DeviceSupervisor) {
        let manual = self
            .inner
            .hosts
            .read()
            .lookup(supervisor.serial())
            .map(str::to_string);

        if let Some(address) = manual {
            tracing::info!(
                device = %supervisor.name(),
                serial = %supervisor.serial(),
                %address,
                "Connecting via configured address"
            );
            tokio::spawn(async move { supervisor.connect(&address).await });
            return;
        }

        tracing::info!(
            device = %supervisor.name(),
            serial = %supervisor.serial(),
            "Registering device for discovery"
        );

        let target = supervisor.clone();
        let on_found: DiscoveredCallback = Arc::new(move |address| {
            // Runs on the discovery task: hand the connect off so the
            // discovery mechanism is never starved.
            let supervisor = target.clone();
            tokio::spawn(async move { supervisor.connect(&address).await });
        });

        if let Err(e) = self
            .inner
            .discovery
            .register_device(supervisor.serial(), on_found)
            .await
        {
            tracing::error!(
                device = %supervisor.name(),
                serial = %supervisor.serial(),
                error = %e,
                "Could not register device for discovery; it will stay unmonitored"
            );
        }
    }

    /// Handles one inbound message for a device.
    ///
    /// A dispatch observed while the transport reports itself
    /// disconnected is the disconnect signal: tear down, restart
    /// discovery and re-add the device without a second listener, and
    /// forward nothing. Live messages are classified and forwarded to
    /// the sink.
    async fn handle_message(&self, supervisor: &DeviceSupervisor, message: &DeviceMessage) {
        tracing::debug!(
            serial = %supervisor.serial(),
            kind = ?message.kind,
            "Received update"
        );

        if !supervisor.is_connected() {
            tracing::info!(
                serial = %supervisor.serial(),
                "Device is now disconnected; clearing it and re-adding"
            );

            supervisor.disconnect().await;

            // The discovery mechanism cannot withdraw one registration,
            // so converge by restarting it and registering again.
            self.inner.discovery.stop().await;
            if let Err(e) = self.inner.discovery.start().await {
                tracing::error!(error = %e, "Could not restart discovery");
                return;
            }

            self.connect_or_register(supervisor.clone()).await;
            return;
        }

        self.inner.sink.update(
            supervisor.name(),
            supervisor.transport().as_ref(),
            message.kind.is_state(),
            message.kind.is_environmental(),
        );
    }
}

impl Clone for ConnectionManager {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("devices", &self.inner.supervisors.read().len())
            .finish_non_exhaustive()
    }
}
