/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
An in-process transport: two linked endpoints where packets sent by one side appear, in order, on
the other side's inbound stream.  Closing either side ends both streams.
 */

use crate::error::{GneissError, GneissResult};
use crate::mqtt::MqttPacket;
use crate::transport::{PacketStream, SendResultFuture, Transport};

use futures::channel::mpsc;
use futures::StreamExt;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One end of an in-process transport pair
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<GneissResult<MqttPacket>>,
    loopback: mpsc::UnboundedSender<GneissResult<MqttPacket>>,
    closed: Arc<AtomicBool>,
}

/// A transport endpoint together with the stream of packets addressed to it
pub struct MemoryEndpoint {

    /// Outbound half
    pub transport: Arc<MemoryTransport>,

    /// Inbound half
    pub inbound: PacketStream,
}

/// Creates two linked endpoints
pub fn memory_transport_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_sender, a_receiver) = mpsc::unbounded();
    let (b_sender, b_receiver) = mpsc::unbounded();
    let closed = Arc::new(AtomicBool::new(false));

    let a = MemoryEndpoint {
        transport: Arc::new(MemoryTransport {
            outbound: b_sender.clone(),
            loopback: a_sender.clone(),
            closed: closed.clone(),
        }),
        inbound: a_receiver.boxed(),
    };

    let b = MemoryEndpoint {
        transport: Arc::new(MemoryTransport {
            outbound: a_sender,
            loopback: b_sender,
            closed,
        }),
        inbound: b_receiver.boxed(),
    };

    (a, b)
}

impl MemoryTransport {

    /// Ends this side's inbound stream with an error item, simulating a transport failure.
    pub fn inject_failure(&self, reason: &str) {
        let _ = self.loopback.unbounded_send(Err(GneissError::new_transport_error(reason.to_string())));
        self.close();
    }
}

impl Transport for MemoryTransport {

    fn send(&self, packet: MqttPacket) -> SendResultFuture {
        let result =
            if self.closed.load(Ordering::Acquire) {
                Err(GneissError::new_connection_closed("memory transport closed"))
            } else {
                self.outbound.unbounded_send(Ok(packet)).map_err(|_| { GneissError::new_connection_closed("memory transport peer dropped") })
            };

        Box::pin(async move { result })
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.outbound.close_channel();
        self.loopback.close_channel();
    }
}
