/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
The seam between the delivery engine and whatever moves packets.

A transport accepts already-typed outbound packets and surfaces an ordered stream of decoded
inbound packets.  Encoding, sockets, and pipes all live behind this seam.
 */

pub mod memory;

use crate::error::GneissResult;
use crate::mqtt::MqttPacket;

use futures::Stream;

use std::future::Future;
use std::pin::Pin;

/// Completion of a single transport write
pub type SendResultFuture = Pin<Box<dyn Future<Output = GneissResult<()>> + Send>>;

/// Ordered sequence of inbound packets.  Ends when the transport closes cleanly; yields an error
/// item when the transport fails.
pub type PacketStream = Pin<Box<dyn Stream<Item = GneissResult<MqttPacket>> + Send>>;

/// Outbound half of a connection's transport
pub trait Transport : Send + Sync {

    /// Writes a packet.  The returned future resolves once the transport has accepted it.
    fn send(&self, packet: MqttPacket) -> SendResultFuture;

    /// Returns true while the underlying channel is usable
    fn is_connected(&self) -> bool;

    /// Shuts the channel down.  Calling this more than once has no further effect.
    fn close(&self);
}
