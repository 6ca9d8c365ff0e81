/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
QoS delivery state machines.

[`sender`] drives outbound application messages through their QoS 0/1/2 handshakes,
[`receiver`] answers inbound publishes and releases, and [`connect`] decides session presence on
connect and replays outstanding work onto a new connection.
 */

pub mod connect;
pub mod receiver;
pub mod sender;

use crate::config::DeliveryOptions;
use crate::events::EndpointEvents;
use crate::packet_id::PacketIdAllocator;
use crate::session::SessionStore;

use tokio::runtime::Handle;

use std::sync::Arc;

/// Everything a flow needs beyond the connection it runs on.  Shared by every connection of an
/// endpoint.
pub(crate) struct DeliveryContext {
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) packet_ids: Arc<PacketIdAllocator>,
    pub(crate) events: Arc<EndpointEvents>,
    pub(crate) options: DeliveryOptions,
    pub(crate) runtime: Handle,
}

impl DeliveryContext {
    pub(crate) fn new(sessions: Arc<SessionStore>, options: DeliveryOptions, runtime: Handle) -> Self {
        DeliveryContext {
            sessions,
            packet_ids: Arc::new(PacketIdAllocator::new()),
            events: Arc::new(EndpointEvents::default()),
            options,
            runtime,
        }
    }
}
