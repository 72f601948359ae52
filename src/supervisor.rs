// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device connection supervision.
//!
//! A [`DeviceSupervisor`] owns one device's connection lifecycle:
//! connecting, retrying after timeouts, tearing down, and polling the
//! device for environmental data while connected.
//!
//! State machine: `Idle -> Connecting -> Connected`, then
//! `Connected -> Disconnected -> Connecting` via retry or rediscovery,
//! with the supervisor staying in `Connecting` across retry waits. There
//! is no terminal state while the process runs.
//!
//! All recoverable errors (connect timeouts, transient poll failures)
//! are handled here and never propagate to callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{DEFAULT_ENVIRONMENT_REFRESH, DEFAULT_RETRY_INTERVAL, Device};
use crate::transport::DeviceTransport;

/// Lifecycle state of a supervised connection.
///
/// Tracks the connect-attempt discipline; live session state is always
/// read from the transport itself via
/// [`is_connected`](DeviceSupervisor::is_connected).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Idle,
    /// A connect attempt is in progress or awaiting its next retry.
    Connecting,
    /// The session is established and the poll task is running.
    Connected,
    /// The session was torn down; rediscovery or a retry will follow.
    Disconnected,
}

/// Outcome of a single connect attempt.
enum AttemptOutcome {
    /// Session established.
    Connected,
    /// Nothing to do: the session is already up.
    AlreadyConnected,
    /// Another attempt holds the single-flight guard.
    InFlight,
    /// The attempt failed; a retry is warranted.
    Failed,
}

struct SupervisorInner {
    device: Device,
    transport: Arc<dyn DeviceTransport>,
    retry_interval: Duration,
    environment_refresh: Duration,
    /// Connect-attempt lifecycle; held only for transitions, never
    /// across await points.
    state: Mutex<ConnectionState>,
    /// Single-flight guard: at most one outstanding connect attempt.
    attempt_in_flight: AtomicBool,
    /// At most one retry task waiting out the retry interval.
    retry_scheduled: AtomicBool,
    /// Bumped on every successful connect and every disconnect. A poll
    /// task only lives as long as the generation it was spawned for, so
    /// rapid disconnect/reconnect cycles never leave two pollers alive.
    generation: AtomicU64,
}

/// Supervises one device's connection.
///
/// Cheap to clone: clones share the same per-device state, which lives
/// behind a per-supervisor lock so supervisors of different devices
/// never contend with each other.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use purelink::config::Device;
/// use purelink::supervisor::DeviceSupervisor;
/// use purelink::transport::MqttSession;
///
/// # async fn example() {
/// let device = Device::new("Living Room", "AB1-XX-1234ABCD", "secret", "438");
/// let transport = Arc::new(MqttSession::new(&device));
/// let supervisor = DeviceSupervisor::new(device, transport);
///
/// supervisor.connect("10.0.0.5").await;
/// # }
/// ```
pub struct DeviceSupervisor {
    inner: Arc<SupervisorInner>,
}

impl DeviceSupervisor {
    /// Creates a supervisor with the default retry and refresh intervals.
    #[must_use]
    pub fn new(device: Device, transport: Arc<dyn DeviceTransport>) -> Self {
        Self::with_intervals(
            device,
            transport,
            DEFAULT_RETRY_INTERVAL,
            DEFAULT_ENVIRONMENT_REFRESH,
        )
    }

    /// Creates a supervisor with explicit timing.
    ///
    /// `retry_interval` is the wait between connect retries after a
    /// timeout; `environment_refresh` is the poll cadence while
    /// connected.
    #[must_use]
    pub fn with_intervals(
        device: Device,
        transport: Arc<dyn DeviceTransport>,
        retry_interval: Duration,
        environment_refresh: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                device,
                transport,
                retry_interval,
                environment_refresh,
                state: Mutex::new(ConnectionState::Idle),
                attempt_in_flight: AtomicBool::new(false),
                retry_scheduled: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the device's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.device.name
    }

    /// Returns the device serial.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.inner.device.serial
    }

    /// Returns the underlying transport handle.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn DeviceTransport> {
        &self.inner.transport
    }

    /// Reflects the live transport session state.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Connects to the device at `host`.
    ///
    /// A no-op when already connected. On failure, logs and arms a
    /// single retry task that re-attempts every retry interval until it
    /// succeeds; the call itself returns after the first attempt.
    pub async fn connect(&self, host: &str) {
        if let AttemptOutcome::Failed = self.try_connect_once(host).await {
            self.schedule_retries(host.to_string());
        }
    }

    /// Tears down the session.
    ///
    /// The poll task observes the torn-down session at its next firing
    /// and terminates; only a later successful
    /// [`connect`](Self::connect) starts a fresh one.
    pub async fn disconnect(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.transport.disconnect().await;
        *self.inner.state.lock() = ConnectionState::Disconnected;

        tracing::info!(serial = %self.inner.device.serial, "Disconnected");
    }

    /// Performs one connect attempt.
    async fn try_connect_once(&self, host: &str) -> AttemptOutcome {
        if self.is_connected() {
            tracing::info!(
                serial = %self.inner.device.serial,
                %host,
                "Already connected; no need to reconnect"
            );
            return AttemptOutcome::AlreadyConnected;
        }

        if self.inner.attempt_in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!(
                serial = %self.inner.device.serial,
                "Connect attempt already in flight"
            );
            return AttemptOutcome::InFlight;
        }

        *self.inner.state.lock() = ConnectionState::Connecting;

        let result = self.inner.transport.connect(host).await;
        self.inner.attempt_in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.inner.state.lock() = ConnectionState::Connected;

                tracing::info!(serial = %self.inner.device.serial, %host, "Connected");
                self.spawn_poll_task(generation);
                AttemptOutcome::Connected
            }
            Err(e) if e.is_connect_timeout() => {
                tracing::error!(
                    serial = %self.inner.device.serial,
                    %host,
                    error = %e,
                    "Timeout connecting; will retry"
                );
                AttemptOutcome::Failed
            }
            Err(e) => {
                // Retried like a timeout so a transient fault does not
                // abandon the device.
                tracing::error!(
                    serial = %self.inner.device.serial,
                    %host,
                    error = %e,
                    "Connection attempt failed; will retry"
                );
                AttemptOutcome::Failed
            }
        }
    }

    /// Arms the retry task, if none is already waiting.
    ///
    /// The task re-attempts once per retry interval, indefinitely, until
    /// an attempt succeeds or reports the session already up.
    fn schedule_retries(&self, host: String) {
        if self.inner.retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(supervisor.inner.retry_interval).await;

                match supervisor.try_connect_once(&host).await {
                    AttemptOutcome::Failed => {}
                    AttemptOutcome::Connected
                    | AttemptOutcome::AlreadyConnected
                    | AttemptOutcome::InFlight => break,
                }
            }
            supervisor
                .inner
                .retry_scheduled
                .store(false, Ordering::SeqCst);
        });
    }

    /// Starts the environmental poll task for a connection generation.
    ///
    /// Each firing checks, under the state lock, that its generation is
    /// still current and the session still up before issuing a request;
    /// a request that fails because the handle was torn down mid-call is
    /// logged and skipped without killing the task.
    fn spawn_poll_task(&self, generation: u64) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(supervisor.inner.environment_refresh).await;

                let still_current = {
                    let _state = supervisor.inner.state.lock();
                    supervisor.inner.generation.load(Ordering::SeqCst) == generation
                        && supervisor.is_connected()
                };

                if !still_current {
                    tracing::debug!(
                        serial = %supervisor.inner.device.serial,
                        "Device is disconnected; poll task exiting"
                    );
                    break;
                }

                tracing::debug!(
                    serial = %supervisor.inner.device.serial,
                    "Requesting updated environmental data"
                );

                if let Err(e) = supervisor.inner.transport.request_environmental_data().await {
                    tracing::error!(
                        serial = %supervisor.inner.device.serial,
                        error = %e,
                        "Environmental request failed; skipping this iteration"
                    );
                }
            }
        });
    }
}

impl Clone for DeviceSupervisor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for DeviceSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSupervisor")
            .field("name", &self.inner.device.name)
            .field("serial", &self.inner.device.serial)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
