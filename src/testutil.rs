// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mock capability implementations shared by unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use crate::discovery::{DiscoveredCallback, Discovery};
use crate::error::{DiscoveryError, TransportError};
use crate::metrics::MetricsSink;
use crate::transport::{DeviceMessage, DeviceTransport, MessageListener};

/// Scripted in-memory transport.
pub(crate) struct MockTransport {
    connected: AtomicBool,
    /// Results returned by successive connect calls; empty = `Ok`.
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    /// How long each connect attempt takes.
    connect_delay: Duration,
    connect_calls: Mutex<Vec<String>>,
    env_requests: AtomicU32,
    fail_env_requests: AtomicBool,
    listeners: RwLock<Vec<MessageListener>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub(crate) fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            connect_script: Mutex::new(VecDeque::new()),
            connect_delay: delay,
            connect_calls: Mutex::new(Vec::new()),
            env_requests: AtomicU32::new(0),
            fail_env_requests: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
        })
    }

    pub(crate) fn script(&self, results: Vec<Result<(), TransportError>>) {
        *self.connect_script.lock() = results.into();
    }

    pub(crate) fn timeout_error() -> TransportError {
        TransportError::ConnectTimeout {
            host: "10.0.0.5".to_string(),
            timeout_ms: 10_000,
        }
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connect_calls.lock().len()
    }

    pub(crate) fn connect_calls(&self) -> Vec<String> {
        self.connect_calls.lock().clone()
    }

    pub(crate) fn env_request_count(&self) -> u32 {
        self.env_requests.load(Ordering::SeqCst)
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub(crate) fn set_fail_env_requests(&self, fail: bool) {
        self.fail_env_requests.store(fail, Ordering::SeqCst);
    }

    /// Simulates a silent connection loss: the transport reports itself
    /// disconnected without anyone having called `disconnect`.
    pub(crate) fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Delivers a push message to all registered listeners.
    pub(crate) fn push_message(&self, message: &DeviceMessage) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(message);
        }
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    async fn connect(&self, host: &str) -> Result<(), TransportError> {
        self.connect_calls.lock().push(host.to_string());

        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let result = self.connect_script.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.connected.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn add_message_listener(&self, listener: MessageListener) {
        self.listeners.write().push(listener);
    }

    async fn request_environmental_data(&self) -> Result<(), TransportError> {
        if self.fail_env_requests.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.env_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory discovery with inspectable lifecycle counters.
#[derive(Default)]
pub(crate) struct MockDiscovery {
    starts: AtomicU32,
    stops: AtomicU32,
    fail_serials: Mutex<HashSet<String>>,
    registrations: Mutex<Vec<(String, DiscoveredCallback)>>,
}

impl MockDiscovery {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes registration fail for one serial.
    pub(crate) fn fail_registration_for(&self, serial: &str) {
        self.fail_serials.lock().insert(serial.to_uppercase());
    }

    pub(crate) fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn registration_count(&self, serial: &str) -> usize {
        let serial = serial.to_uppercase();
        self.registrations
            .lock()
            .iter()
            .filter(|(s, _)| *s == serial)
            .count()
    }

    /// Fires the most recent registration for a serial.
    pub(crate) fn fire(&self, serial: &str, address: &str) {
        let serial = serial.to_uppercase();
        let callback = self
            .registrations
            .lock()
            .iter()
            .rev()
            .find(|(s, _)| *s == serial)
            .map(|(_, cb)| Arc::clone(cb));

        if let Some(callback) = callback {
            callback(address.to_string());
        }
    }
}

#[async_trait]
impl Discovery for MockDiscovery {
    async fn start(&self) -> Result<(), DiscoveryError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }

    async fn register_device(
        &self,
        serial: &str,
        on_found: DiscoveredCallback,
    ) -> Result<(), DiscoveryError> {
        if self.fail_serials.lock().contains(&serial.to_uppercase()) {
            return Err(DiscoveryError::NotRunning);
        }
        self.registrations
            .lock()
            .push((serial.to_uppercase(), on_found));
        Ok(())
    }
}

/// One recorded sink update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UpdateRecord {
    pub(crate) name: String,
    pub(crate) is_state: bool,
    pub(crate) is_environmental: bool,
}

/// Sink that records every update it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    updates: Mutex<Vec<UpdateRecord>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn updates(&self) -> Vec<UpdateRecord> {
        self.updates.lock().clone()
    }
}

impl MetricsSink for RecordingSink {
    fn update(
        &self,
        name: &str,
        _transport: &dyn DeviceTransport,
        is_state: bool,
        is_environmental: bool,
    ) {
        self.updates.lock().push(UpdateRecord {
            name: name.to_string(),
            is_state,
            is_environmental,
        });
    }
}
