// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end supervision scenarios over the public API, exercised with
//! mock transport and discovery capabilities.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use purelink::config::{Device, HostOverrides, SupervisionConfig};
use purelink::discovery::{DiscoveredCallback, Discovery};
use purelink::error::{DiscoveryError, TransportError};
use purelink::manager::ConnectionManager;
use purelink::metrics::MetricsSink;
use purelink::transport::{DeviceMessage, DeviceTransport, MessageListener};

/// Interval used by the default supervision config.
const INTERVAL: Duration = Duration::from_secs(30);

/// Scripted transport standing in for a real device session.
#[derive(Default)]
struct FakeSession {
    connected: AtomicBool,
    connect_script: Mutex<VecDeque<Result<(), TransportError>>>,
    connect_calls: Mutex<Vec<String>>,
    env_requests: AtomicU32,
    listeners: RwLock<Vec<MessageListener>>,
}

impl FakeSession {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script_timeout(&self, host: &str) {
        self.connect_script
            .lock()
            .push_back(Err(TransportError::ConnectTimeout {
                host: host.to_string(),
                timeout_ms: 10_000,
            }));
    }

    fn connect_calls(&self) -> Vec<String> {
        self.connect_calls.lock().clone()
    }

    fn env_request_count(&self) -> u32 {
        self.env_requests.load(Ordering::SeqCst)
    }

    fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Simulates a silent connection loss.
    fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Delivers a push message to every registered listener.
    fn push(&self, message: &DeviceMessage) {
        let listeners = self.listeners.read();
        for listener in listeners.iter() {
            listener(message);
        }
    }
}

#[async_trait]
impl DeviceTransport for FakeSession {
    async fn connect(&self, host: &str) -> Result<(), TransportError> {
        self.connect_calls.lock().push(host.to_string());

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
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.env_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory discovery service.
#[derive(Default)]
struct FakeDiscovery {
    starts: AtomicU32,
    stops: AtomicU32,
    registrations: Mutex<Vec<(String, DiscoveredCallback)>>,
}

impl FakeDiscovery {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }

    fn registration_count(&self, serial: &str) -> usize {
        let serial = serial.to_uppercase();
        self.registrations
            .lock()
            .iter()
            .filter(|(s, _)| *s == serial)
            .count()
    }

    /// Fires the most recent registration for a serial.
    fn fire(&self, serial: &str, address: &str) {
        let serial = serial.to_uppercase();
        let callback = self
            .registrations
            .lock()
            .iter()
            .rev()
            .find(|(s, _)| *s == serial)
            .map(|(_, cb)| Arc::clone(cb));

        callback.expect("device registered")(address.to_string());
    }
}

#[async_trait]
impl Discovery for FakeDiscovery {
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
        self.registrations
            .lock()
            .push((serial.to_uppercase(), on_found));
        Ok(())
    }
}

/// Sink recording every classified update.
#[derive(Default)]
struct FakeSink {
    updates: Mutex<Vec<(String, bool, bool)>>,
}

impl FakeSink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn updates(&self) -> Vec<(String, bool, bool)> {
        self.updates.lock().clone()
    }
}

impl MetricsSink for FakeSink {
    fn update(
        &self,
        name: &str,
        _transport: &dyn DeviceTransport,
        is_state: bool,
        is_environmental: bool,
    ) {
        self.updates
            .lock()
            .push((name.to_string(), is_state, is_environmental));
    }
}

fn living_room() -> Device {
    Device::new("Living Room", "AB1-XX-1234ABCD", "secret", "438")
}

fn manager_for(
    sessions: HashMap<String, Arc<FakeSession>>,
    discovery: Arc<FakeDiscovery>,
    sink: Arc<FakeSink>,
) -> ConnectionManager {
    ConnectionManager::new(
        discovery,
        sink,
        Box::new(move |device| {
            Arc::clone(sessions.get(&device.serial).expect("session for device"))
                as Arc<dyn DeviceTransport>
        }),
        SupervisionConfig::default(),
    )
}

/// Lets spawned connect/dispatch tasks finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn manual_ip_device_connects_and_polls() {
    let session = FakeSession::new();
    let discovery = FakeDiscovery::new();
    let sink = FakeSink::new();

    let manager = manager_for(
        HashMap::from([(living_room().serial, Arc::clone(&session))]),
        Arc::clone(&discovery),
        Arc::clone(&sink),
    );

    let hosts = HostOverrides::new(HashMap::from([(
        "AB1-XX-1234ABCD".to_string(),
        "10.0.0.5".to_string(),
    )]));

    manager.start(vec![living_room()], hosts).await.unwrap();
    settle().await;

    assert_eq!(session.connect_calls(), ["10.0.0.5"]);
    assert!(session.is_connected());

    // One poll per refresh interval while connected.
    tokio::time::sleep(INTERVAL).await;
    assert_eq!(session.env_request_count(), 1);

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(session.env_request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_retries_same_address() {
    let session = FakeSession::new();
    session.script_timeout("10.0.0.5");

    let discovery = FakeDiscovery::new();
    let sink = FakeSink::new();
    let manager = manager_for(
        HashMap::from([(living_room().serial, Arc::clone(&session))]),
        Arc::clone(&discovery),
        Arc::clone(&sink),
    );

    let hosts = HostOverrides::new(HashMap::from([(
        "AB1-XX-1234ABCD".to_string(),
        "10.0.0.5".to_string(),
    )]));

    manager.start(vec![living_room()], hosts).await.unwrap();
    settle().await;

    assert_eq!(session.connect_calls(), ["10.0.0.5"]);
    assert!(!session.is_connected());

    // Exactly one retry, after the configured interval, same address.
    tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
    assert_eq!(session.connect_calls(), ["10.0.0.5", "10.0.0.5"]);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn discovered_device_connects_exactly_once() {
    let session = FakeSession::new();
    let discovery = FakeDiscovery::new();
    let sink = FakeSink::new();
    let manager = manager_for(
        HashMap::from([(living_room().serial, Arc::clone(&session))]),
        Arc::clone(&discovery),
        Arc::clone(&sink),
    );

    manager
        .start(vec![living_room()], HostOverrides::default())
        .await
        .unwrap();
    settle().await;

    assert_eq!(discovery.start_count(), 1);
    assert!(session.connect_calls().is_empty());

    discovery.fire("AB1-XX-1234ABCD", "10.0.0.9");
    settle().await;

    assert_eq!(session.connect_calls(), ["10.0.0.9"]);
    assert!(session.is_connected());
}

#[tokio::test(start_paused = true)]
async fn detected_disconnect_restarts_discovery_once() {
    let session = FakeSession::new();
    let discovery = FakeDiscovery::new();
    let sink = FakeSink::new();
    let manager = manager_for(
        HashMap::from([(living_room().serial, Arc::clone(&session))]),
        Arc::clone(&discovery),
        Arc::clone(&sink),
    );

    manager
        .start(vec![living_room()], HostOverrides::default())
        .await
        .unwrap();
    settle().await;
    discovery.fire("AB1-XX-1234ABCD", "10.0.0.9");
    settle().await;
    assert!(session.is_connected());

    session.drop_connection();
    session.push(&DeviceMessage::state(r#"{"msg": "CURRENT-STATE"}"#));
    settle().await;

    // Exactly one restart and one re-registration, no duplicate
    // listener, and the triggering dispatch was not forwarded.
    assert_eq!(discovery.stop_count(), 1);
    assert_eq!(discovery.start_count(), 2);
    assert_eq!(discovery.registration_count("AB1-XX-1234ABCD"), 2);
    assert_eq!(session.listener_count(), 1);
    assert!(sink.updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn poll_task_stops_once_disconnected() {
    let session = FakeSession::new();
    let discovery = FakeDiscovery::new();
    let sink = FakeSink::new();
    let manager = manager_for(
        HashMap::from([(living_room().serial, Arc::clone(&session))]),
        Arc::clone(&discovery),
        Arc::clone(&sink),
    );

    manager
        .start(vec![living_room()], HostOverrides::default())
        .await
        .unwrap();
    settle().await;
    discovery.fire("AB1-XX-1234ABCD", "10.0.0.9");
    settle().await;

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(session.env_request_count(), 1);

    // The device goes silent-dead and is re-armed for discovery; until
    // it is rediscovered, zero further requests are issued.
    session.drop_connection();
    session.push(&DeviceMessage::state(r#"{"msg": "CURRENT-STATE"}"#));
    settle().await;

    tokio::time::sleep(INTERVAL * 3).await;
    assert_eq!(session.env_request_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn classified_updates_reach_the_sink() {
    let session = FakeSession::new();
    let discovery = FakeDiscovery::new();
    let sink = FakeSink::new();
    let manager = manager_for(
        HashMap::from([(living_room().serial, Arc::clone(&session))]),
        Arc::clone(&discovery),
        Arc::clone(&sink),
    );

    let hosts = HostOverrides::new(HashMap::from([(
        "AB1-XX-1234ABCD".to_string(),
        "10.0.0.5".to_string(),
    )]));
    manager.start(vec![living_room()], hosts).await.unwrap();
    settle().await;

    session.push(&DeviceMessage::state(r#"{"msg": "STATE-CHANGE"}"#));
    session.push(&DeviceMessage::environmental(
        r#"{"msg": "ENVIRONMENTAL-CURRENT-SENSOR-DATA"}"#,
    ));
    session.push(&DeviceMessage::other(r#"{"msg": "LOCATION"}"#));
    settle().await;

    assert_eq!(
        sink.updates(),
        vec![
            ("Living Room".to_string(), true, false),
            ("Living Room".to_string(), false, true),
            ("Living Room".to_string(), false, false),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn concurrent_fleets_do_not_interfere() {
    let sessions: HashMap<String, Arc<FakeSession>> = (0..4)
        .map(|i| (format!("SER-{i:02}"), FakeSession::new()))
        .collect();
    let devices: Vec<Device> = (0..4)
        .map(|i| Device::new(format!("Device {i}"), format!("SER-{i:02}"), "secret", "438"))
        .collect();

    let discovery = FakeDiscovery::new();
    let sink = FakeSink::new();
    let manager = manager_for(
        sessions.clone(),
        Arc::clone(&discovery),
        Arc::clone(&sink),
    );

    manager
        .start(devices, HostOverrides::default())
        .await
        .unwrap();
    settle().await;

    // Discover all devices "simultaneously".
    for i in 0..4 {
        discovery.fire(&format!("SER-{i:02}"), &format!("10.0.1.{i}"));
    }
    settle().await;

    for (serial, session) in &sessions {
        assert!(session.is_connected(), "{serial} should be connected");
    }

    // Every device's messages land under its own name.
    for i in 0..4 {
        sessions[&format!("SER-{i:02}")].push(&DeviceMessage::environmental(
            r#"{"msg": "ENVIRONMENTAL-CURRENT-SENSOR-DATA"}"#,
        ));
    }
    settle().await;

    let updates = sink.updates();
    assert_eq!(updates.len(), 4);
    let names: std::collections::HashSet<_> = updates.iter().map(|(n, _, _)| n.clone()).collect();
    assert_eq!(names.len(), 4);
}
