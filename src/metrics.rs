// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Metrics sink boundary.
//!
//! The connection manager forwards every live, classified device update
//! to a [`MetricsSink`]. The sink owns the translation of raw readings
//! into exported samples; that schema is deliberately outside this
//! crate. [`CountingSink`] is the built-in implementation the binary
//! uses: per-device update counters that can be snapshotted for
//! inspection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::transport::DeviceTransport;

/// Consumer of classified device updates.
///
/// `update` runs on a device's dispatch task and must not block
/// indefinitely. It is invoked for every inbound message from a live
/// connection; disconnect events are never forwarded.
pub trait MetricsSink: Send + Sync {
    /// Records one update.
    ///
    /// Exactly one of `is_state` / `is_environmental` is true for
    /// classified messages; both are false for other message kinds. The
    /// transport handle lets implementations pull whatever readings
    /// they export.
    fn update(
        &self,
        name: &str,
        transport: &dyn DeviceTransport,
        is_state: bool,
        is_environmental: bool,
    );
}

/// Per-device update counters.
#[derive(Default)]
struct DeviceCounters {
    updates: AtomicU64,
    state: AtomicU64,
    environmental: AtomicU64,
}

/// Point-in-time copy of one device's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Total updates received.
    pub updates: u64,
    /// Updates classified as state messages.
    pub state: u64,
    /// Updates classified as environmental messages.
    pub environmental: u64,
}

/// Counting [`MetricsSink`] used by the binary.
///
/// Tracks how many updates of each kind every device has delivered.
/// Counters are monotonic for the life of the process.
#[derive(Default)]
pub struct CountingSink {
    devices: RwLock<HashMap<String, Arc<DeviceCounters>>>,
}

impl CountingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters for a device, if it has reported anything.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<CounterSnapshot> {
        let counters = Arc::clone(self.devices.read().get(name)?);
        Some(CounterSnapshot {
            updates: counters.updates.load(Ordering::Relaxed),
            state: counters.state.load(Ordering::Relaxed),
            environmental: counters.environmental.load(Ordering::Relaxed),
        })
    }

    /// Returns the counters for every reporting device.
    #[must_use]
    pub fn snapshot_all(&self) -> HashMap<String, CounterSnapshot> {
        let devices = self.devices.read();
        devices
            .iter()
            .map(|(name, counters)| {
                (
                    name.clone(),
                    CounterSnapshot {
                        updates: counters.updates.load(Ordering::Relaxed),
                        state: counters.state.load(Ordering::Relaxed),
                        environmental: counters.environmental.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    fn counters_for(&self, name: &str) -> Arc<DeviceCounters> {
        if let Some(counters) = self.devices.read().get(name) {
            return Arc::clone(counters);
        }

        let mut devices = self.devices.write();
        Arc::clone(devices.entry(name.to_string()).or_default())
    }
}

impl MetricsSink for CountingSink {
    fn update(
        &self,
        name: &str,
        _transport: &dyn DeviceTransport,
        is_state: bool,
        is_environmental: bool,
    ) {
        let counters = self.counters_for(name);

        counters.updates.fetch_add(1, Ordering::Relaxed);
        if is_state {
            counters.state.fetch_add(1, Ordering::Relaxed);
        }
        if is_environmental {
            counters.environmental.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            device = %name,
            is_state,
            is_environmental,
            "Recorded device update"
        );
    }
}

impl std::fmt::Debug for CountingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingSink")
            .field("devices", &self.devices.read().len())
            .finish()
    }
}
