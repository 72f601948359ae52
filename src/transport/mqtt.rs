// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MQTT implementation of the device transport.
//!
//! Each appliance runs its own MQTT endpoint. A session authenticates
//! with the device serial and credential, subscribes to the device's
//! status topic, and receives push updates from a background event-loop
//! task:
//!
//! - Status: `<product_type>/<serial>/status/current`
//! - Commands: `<product_type>/<serial>/command`
//!
//! Environmental data is requested by publishing a
//! `REQUEST-PRODUCT-ENVIRONMENT-CURRENT-SENSOR-DATA` envelope to the
//! command topic; the device answers with a push on the status topic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Device;
use crate::error::TransportError;

use super::{DeviceMessage, DeviceTransport, MessageKind, MessageListener};

/// Global counter for generating unique client IDs.
static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Default MQTT port the appliances listen on.
const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default time to wait for the broker handshake before giving up.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// MQTT transport session for one appliance.
///
/// # Examples
///
/// ```no_run
/// use purelink::config::Device;
/// use purelink::transport::{DeviceTransport, MqttSession};
///
/// # async fn example() -> Result<(), purelink::error::TransportError> {
/// let device = Device::new("Living Room", "AB1-XX-1234ABCD", "secret", "438");
/// let session = MqttSession::new(&device);
///
/// session.connect("10.0.0.5").await?;
/// session.request_environmental_data().await?;
/// # Ok(())
/// # }
/// ```
pub struct MqttSession {
    serial: String,
    product_type: String,
    credential: String,
    connect_timeout: Duration,
    /// Live session state, flipped by the event-loop task.
    connected: Arc<AtomicBool>,
    listeners: Arc<Listeners>,
    client: Mutex<Option<AsyncClient>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttSession {
    /// Creates a session for the given device record.
    ///
    /// Nothing is connected until [`connect`](DeviceTransport::connect)
    /// is called.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self {
            serial: device.serial.clone(),
            product_type: device.product_type.clone(),
            credential: device.credential.expose().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connected: Arc::new(AtomicBool::new(false)),
            listeners: Arc::new(Listeners::new()),
            client: Mutex::new(None),
            loop_task: Mutex::new(None),
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the device serial this session belongs to.
    #[must_use]
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Topic the device pushes status and sensor data on.
    fn status_topic(&self) -> String {
        format!("{}/{}/status/current", self.product_type, self.serial)
    }

    /// Topic commands are published to.
    fn command_topic(&self) -> String {
        format!("{}/{}/command", self.product_type, self.serial)
    }

    /// Aborts the event-loop task and clears the client handle.
    fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
        self.client.lock().take();
    }
}

#[async_trait]
impl DeviceTransport for MqttSession {
    async fn connect(&self, host: &str) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let (host, port) = parse_host(host)?;

        let counter = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let client_id = format!("purelink_{}_{}", std::process::id(), counter);

        let mut options = MqttOptions::new(&client_id, host.clone(), port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        options.set_credentials(&self.serial, &self.credential);

        let (client, event_loop) = AsyncClient::new(options, 10);

        client
            .subscribe(self.status_topic(), QoS::AtLeastOnce)
            .await?;

        let (connected_tx, mut connected_rx) = watch::channel(false);
        let task = tokio::spawn(run_event_loop(
            event_loop,
            self.serial.clone(),
            Arc::clone(&self.connected),
            Arc::clone(&self.listeners),
            connected_tx,
        ));

        {
            let mut loop_task = self.loop_task.lock();
            if let Some(stale) = loop_task.replace(task) {
                stale.abort();
            }
            *self.client.lock() = Some(client);
        }

        // Block until ConnAck or the connect timeout, whichever first.
        match tokio::time::timeout(self.connect_timeout, connected_rx.wait_for(|&up| up)).await {
            Ok(Ok(_)) => {
                tracing::debug!(serial = %self.serial, %host, "MQTT session established");
                Ok(())
            }
            Ok(Err(_)) => {
                // Event loop ended before the handshake completed.
                self.teardown();
                Err(TransportError::ConnectionFailed(format!(
                    "session to {host} closed before connect completed"
                )))
            }
            Err(_) => {
                self.teardown();
                // Safe: practical timeouts never exceed u64::MAX milliseconds
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.connect_timeout.as_millis() as u64;
                Err(TransportError::ConnectTimeout { host, timeout_ms })
            }
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);

        let client = self.client.lock().take();
        if let Some(client) = client {
            // Best effort: the broker may already be gone.
            let _ = client.disconnect().await;
        }

        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }

        tracing::debug!(serial = %self.serial, "MQTT session torn down");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn add_message_listener(&self, listener: MessageListener) {
        self.listeners.add(listener);
    }

    async fn request_environmental_data(&self) -> Result<(), TransportError> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let payload = serde_json::json!({
            "msg": "REQUEST-PRODUCT-ENVIRONMENT-CURRENT-SENSOR-DATA",
            "time": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        })
        .to_string();

        tracing::debug!(serial = %self.serial, "Requesting environmental data");

        client
            .publish(self.command_topic(), QoS::AtLeastOnce, false, payload)
            .await?;

        Ok(())
    }
}

impl std::fmt::Debug for MqttSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSession")
            .field("serial", &self.serial)
            .field("product_type", &self.product_type)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Registered push-message listeners for one session.
struct Listeners {
    callbacks: RwLock<Vec<MessageListener>>,
}

impl Listeners {
    fn new() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
        }
    }

    fn add(&self, listener: MessageListener) {
        self.callbacks.write().push(listener);
    }

    fn dispatch(&self, message: &DeviceMessage) {
        let callbacks = self.callbacks.read();
        for callback in callbacks.iter() {
            callback(message);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.callbacks.read().len()
    }
}

/// Handles MQTT events in the background.
///
/// Flips the connected flag on ConnAck, dispatches status publishes to
/// the registered listeners, and exits on the first event-loop error.
async fn run_event_loop(
    mut event_loop: EventLoop,
    serial: String,
    connected: Arc<AtomicBool>,
    listeners: Arc<Listeners>,
    connected_tx: watch::Sender<bool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                tracing::debug!(serial = %serial, ?ack, "MQTT connected");
                connected.store(true, Ordering::SeqCst);
                let _ = connected_tx.send(true);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Ok(payload) = String::from_utf8(publish.payload.to_vec()) else {
                    tracing::warn!(serial = %serial, topic = %publish.topic, "Non-UTF8 payload dropped");
                    continue;
                };

                let message = DeviceMessage {
                    kind: classify(&payload),
                    payload,
                };
                listeners.dispatch(&message);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(serial = %serial, error = %e, "MQTT event loop error");
                connected.store(false, Ordering::SeqCst);
                let _ = connected_tx.send(false);
                break;
            }
        }
    }
}

/// Envelope shape shared by all device push messages.
#[derive(Deserialize)]
struct Envelope {
    msg: String,
}

/// Classifies a push payload by its `msg` field.
fn classify(payload: &str) -> MessageKind {
    match serde_json::from_str::<Envelope>(payload) {
        Ok(envelope) => match envelope.msg.as_str() {
            "CURRENT-STATE" | "STATE-CHANGE" => MessageKind::State,
            "ENVIRONMENTAL-CURRENT-SENSOR-DATA" => MessageKind::Environmental,
            _ => MessageKind::Other,
        },
        Err(_) => MessageKind::Other,
    }
}

/// Parses a `host` or `host:port` address.
fn parse_host(addr: &str) -> Result<(String, u16), TransportError> {
    let addr = addr
        .strip_prefix("mqtt://")
        .or_else(|| addr.strip_prefix("tcp://"))
        .unwrap_or(addr);

    if addr.is_empty() {
        return Err(TransportError::InvalidAddress("empty address".to_string()));
    }

    if let Some((host, port)) = addr.rsplit_once(':') {
        let port = port
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("invalid port: {port}")))?;
        Ok((host.to_string(), port))
    } else {
        Ok((addr.to_string(), DEFAULT_MQTT_PORT))
    }
}
