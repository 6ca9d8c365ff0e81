/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Configuration for the delivery engine and for client-role connection attempts.
 */

use crate::mqtt::{ConnectPacket, QualityOfService, Will};

use std::time::Duration;

pub(crate) const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_CONNACK_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS: u16 = 60;

/// Timing and limit configuration shared by every exchange an endpoint runs.
#[derive(Debug, Clone)]
pub struct DeliveryOptions {

    /// How long to wait for a matching acknowledgement before resending.
    pub(crate) ack_timeout: Duration,

    /// Total number of times a packet is written before its exchange fails with
    /// AckTimeoutExceeded.  Never less than one.
    pub(crate) max_attempts: u32,

    /// How long received packets are kept in the per-connection replay buffer.  Defaults to the ack
    /// timeout.
    pub(crate) replay_window: Option<Duration>,

    /// Upper bound on the QoS granted to subscriptions.
    pub(crate) maximum_qos: QualityOfService,

    /// How long a client-role connect waits for a Connack.
    pub(crate) connack_timeout: Duration,
}

impl DeliveryOptions {

    /// Returns the per-attempt acknowledgement timeout
    pub fn ack_timeout(&self) -> Duration { self.ack_timeout }

    /// Returns the maximum number of attempts per exchange
    pub fn max_attempts(&self) -> u32 { self.max_attempts }

    /// Returns the replay buffer window
    pub fn replay_window(&self) -> Duration { self.replay_window.unwrap_or(self.ack_timeout) }

    /// Returns the maximum QoS granted to subscriptions
    pub fn maximum_qos(&self) -> QualityOfService { self.maximum_qos }

    /// Returns the Connack wait timeout
    pub fn connack_timeout(&self) -> Duration { self.connack_timeout }
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        DeliveryOptions {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            replay_window: None,
            maximum_qos: QualityOfService::ExactlyOnce,
            connack_timeout: DEFAULT_CONNACK_TIMEOUT,
        }
    }
}

/// Builder type for DeliveryOptions
#[derive(Default)]
pub struct DeliveryOptionsBuilder {
    options: DeliveryOptions
}

impl DeliveryOptionsBuilder {

    /// Creates a new builder seeded with default values
    pub fn new() -> Self {
        DeliveryOptionsBuilder {
            ..Default::default()
        }
    }

    /// Sets the per-attempt acknowledgement timeout
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.options.ack_timeout = timeout;
        self
    }

    /// Sets the maximum number of attempts per exchange.  Zero is treated as one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.options.max_attempts = max_attempts.max(1);
        self
    }

    /// Sets how long received packets stay in the replay buffer
    pub fn with_replay_window(mut self, window: Duration) -> Self {
        self.options.replay_window = Some(window);
        self
    }

    /// Sets the maximum QoS granted to subscriptions
    pub fn with_maximum_qos(mut self, qos: QualityOfService) -> Self {
        self.options.maximum_qos = qos;
        self
    }

    /// Sets how long a client-role connect waits for a Connack
    pub fn with_connack_timeout(mut self, timeout: Duration) -> Self {
        self.options.connack_timeout = timeout;
        self
    }

    /// Builds a new set of delivery options
    pub fn build(self) -> DeliveryOptions {
        self.options
    }
}

/// Configuration options that will determine packet field values for the CONNECT packet sent out
/// by a client-role endpoint.
#[derive(Debug, Clone)]
pub struct ConnectOptions {

    /// A unique string identifying the client to the server.  Used to restore session state between connections.
    pub(crate) client_id: String,

    /// Whether the server should discard any prior session for this client id.
    pub(crate) clean_session: bool,

    /// The maximum time interval, in seconds, that is permitted to elapse between outbound packets.  The client
    /// uses PINGREQ packets to maintain this property.  Zero disables keep alive.
    pub(crate) keep_alive_interval_seconds: u16,

    /// A string value that the server may use for client authentication and authorization.
    pub(crate) username: Option<String>,

    /// Opaque binary data that the server may use for client authentication and authorization.
    pub(crate) password: Option<Vec<u8>>,

    /// Message the server should publish if this client disconnects abnormally.
    pub(crate) will: Option<Will>,
}

impl ConnectOptions {

    /// Returns the configured client id
    pub fn client_id(&self) -> &str { self.client_id.as_str() }

    /// Returns the keep alive interval, if one is enabled
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        match self.keep_alive_interval_seconds {
            0 => None,
            seconds => Some(Duration::from_secs(seconds as u64)),
        }
    }

    pub(crate) fn to_connect_packet(&self) -> ConnectPacket {
        ConnectPacket {
            client_id: self.client_id.clone(),
            clean_session: self.clean_session,
            keep_alive_interval_seconds: self.keep_alive_interval_seconds,
            username: self.username.clone(),
            password: self.password.clone(),
            will: self.will.clone(),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            client_id: String::new(),
            clean_session: false,
            keep_alive_interval_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
            username: None,
            password: None,
            will: None,
        }
    }
}

/// A builder for connection-related options on the client
#[derive(Default)]
pub struct ConnectOptionsBuilder {
    options: ConnectOptions
}

impl ConnectOptionsBuilder {

    /// Creates a new builder for the supplied client id
    pub fn new(client_id: &str) -> Self {
        let mut builder = ConnectOptionsBuilder {
            ..Default::default()
        };
        builder.options.client_id = client_id.to_string();
        builder
    }

    /// Sets the clean session flag
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.options.clean_session = clean_session;
        self
    }

    /// Sets the keep alive interval in seconds.  Zero disables keep alive.
    pub fn with_keep_alive_interval_seconds(mut self, keep_alive: u16) -> Self {
        self.options.keep_alive_interval_seconds = keep_alive;
        self
    }

    /// Sets the user name presented for authentication
    pub fn with_username(mut self, username: &str) -> Self {
        self.options.username = Some(username.to_string());
        self
    }

    /// Sets the password presented for authentication
    pub fn with_password(mut self, password: &[u8]) -> Self {
        self.options.password = Some(password.to_vec());
        self
    }

    /// Sets the will message
    pub fn with_will(mut self, will: Will) -> Self {
        self.options.will = Some(will);
        self
    }

    /// Builds a new set of connect options
    pub fn build(self) -> ConnectOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_window_defaults_to_ack_timeout() {
        let options = DeliveryOptionsBuilder::new().with_ack_timeout(Duration::from_millis(250)).build();
        assert_eq!(Duration::from_millis(250), options.replay_window());

        let options = DeliveryOptionsBuilder::new().with_replay_window(Duration::from_secs(2)).build();
        assert_eq!(Duration::from_secs(2), options.replay_window());
    }

    #[test]
    fn max_attempts_never_zero() {
        let options = DeliveryOptionsBuilder::new().with_max_attempts(0).build();
        assert_eq!(1, options.max_attempts());
    }

    #[test]
    fn keep_alive_zero_disables() {
        let options = ConnectOptionsBuilder::new("client").with_keep_alive_interval_seconds(0).build();
        assert_eq!(None, options.keep_alive_interval());

        let packet = ConnectOptionsBuilder::new("client").with_clean_session(true).build().to_connect_packet();
        assert_eq!("client", packet.client_id);
        assert!(packet.clean_session);
        assert_eq!(DEFAULT_KEEP_ALIVE_SECONDS, packet.keep_alive_interval_seconds);
    }
}
