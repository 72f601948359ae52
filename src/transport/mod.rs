// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device transport capability.
//!
//! The appliances push status messages over a per-device session and
//! answer explicit environmental data requests. Everything above the wire
//! is written against the [`DeviceTransport`] trait so the supervision
//! subsystem can be exercised with mock transports in tests; the
//! production implementation is [`MqttSession`].

mod mqtt;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TransportError;

pub use mqtt::MqttSession;

/// Classification of an inbound push message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Operational status update (power, mode, ...).
    State,
    /// Sensor readings (air quality, humidity, ...).
    Environmental,
    /// Anything else the device pushes.
    Other,
}

impl MessageKind {
    /// Returns true for state messages.
    #[must_use]
    pub fn is_state(self) -> bool {
        matches!(self, Self::State)
    }

    /// Returns true for environmental messages.
    #[must_use]
    pub fn is_environmental(self) -> bool {
        matches!(self, Self::Environmental)
    }
}

/// An inbound push message from a device.
#[derive(Debug, Clone)]
pub struct DeviceMessage {
    /// Classified message kind.
    pub kind: MessageKind,
    /// Raw message payload as received from the wire.
    pub payload: String,
}

impl DeviceMessage {
    /// Creates a state message.
    #[must_use]
    pub fn state(payload: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::State,
            payload: payload.into(),
        }
    }

    /// Creates an environmental message.
    #[must_use]
    pub fn environmental(payload: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Environmental,
            payload: payload.into(),
        }
    }

    /// Creates a message of an unclassified kind.
    #[must_use]
    pub fn other(payload: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Other,
            payload: payload.into(),
        }
    }
}

/// Callback invoked for every inbound push message.
///
/// Listeners run on the transport's event-loop task and must hand off
/// promptly instead of blocking.
pub type MessageListener = Arc<dyn Fn(&DeviceMessage) + Send + Sync>;

/// One device's transport session.
///
/// Implementations own the live connection to a single appliance. The
/// trait mirrors what the supervision layer needs and nothing more:
/// connect with a transport-defined timeout, tear down, report liveness,
/// register push listeners, and request environmental data.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Establishes a session with the device at `host`.
    ///
    /// Blocks the caller until the session is up or the transport's
    /// connect timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectTimeout`] when the device does
    /// not answer in time.
    async fn connect(&self, host: &str) -> Result<(), TransportError>;

    /// Tears down the active session.
    ///
    /// After this returns, [`is_connected`](Self::is_connected) reports
    /// false. Registered listeners are kept; they fire again after a
    /// later reconnect.
    async fn disconnect(&self);

    /// Reflects the live session state.
    fn is_connected(&self) -> bool;

    /// Registers a callback for inbound push messages.
    ///
    /// Listeners persist across disconnect/reconnect cycles.
    fn add_message_listener(&self, listener: MessageListener);

    /// Asks the device to publish its current environmental data.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotConnected`] if the session has been
    /// torn down, e.g. by a concurrent disconnect.
    async fn request_environmental_data(&self) -> Result<(), TransportError>;
}
