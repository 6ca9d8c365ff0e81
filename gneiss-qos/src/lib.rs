/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
MQTT 3.1.1 delivery-guarantee engine.

This crate implements the QoS 0/1/2 handshakes, packet id lifecycle, retry with duplicate
marking, and session continuity across reconnects, for both ends of a connection.  Packets move
over an abstract [`Transport`](transport::Transport); wire encoding and sockets are left to the
transport implementation.

The two endpoint roles are [`SessionServer`](server::SessionServer), which accepts connections
and owns the sessions of many clients, and [`SessionClient`](client::SessionClient), which
connects to a server and keeps its own local session.
 */

pub mod client;
pub mod config;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod events;
pub mod flow;
mod logging;
pub mod mqtt;
pub mod packet_id;
pub mod registry;
pub mod retry;
pub mod server;
pub mod session;
pub mod transport;
mod validate;

#[cfg(test)]
mod testing;

/* Re-export the commonly used types at the root level */
pub use client::{SessionClient, SessionClientBuilder};
pub use config::{ConnectOptions, ConnectOptionsBuilder, DeliveryOptions, DeliveryOptionsBuilder};
pub use error::{GneissError, GneissResult};
pub use flow::sender::{PublishHandle, PublishResponse, PublishResult};
pub use mqtt::{MqttPacket, PacketType, QualityOfService, Subscription, Will};
pub use server::{Authenticator, ForwardOutcome, SessionServer, SessionServerBuilder};
pub use session::{ApplicationMessage, SessionStore};
