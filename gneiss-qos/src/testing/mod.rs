/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Scripted raw peer for driving an endpoint packet-by-packet in tests.
 */

use crate::connection::MqttConnection;
use crate::mqtt::MqttPacket;
use crate::retry::RetryPolicy;
use crate::transport::memory::{memory_transport_pair, MemoryEndpoint, MemoryTransport};
use crate::transport::{PacketStream, Transport};

use futures::StreamExt;
use tokio::runtime::Handle;

use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(5);

/// The far side of a memory transport, operated directly by a test
pub(crate) struct TestPeer {
    pub(crate) transport: Arc<MemoryTransport>,
    inbound: PacketStream,
}

impl TestPeer {

    pub(crate) fn new(endpoint: MemoryEndpoint) -> Self {
        TestPeer {
            transport: endpoint.transport,
            inbound: endpoint.inbound,
        }
    }

    /// Returns the next packet the endpoint wrote.  Panics if none arrives in time.
    pub(crate) async fn next_packet(&mut self) -> MqttPacket {
        match tokio::time::timeout(DEFAULT_PACKET_TIMEOUT, self.inbound.next()).await {
            Ok(Some(Ok(packet))) => { packet }
            Ok(Some(Err(error))) => { panic!("peer inbound failed: {}", error) }
            Ok(None) => { panic!("peer inbound ended") }
            Err(_) => { panic!("no packet within {:?}", DEFAULT_PACKET_TIMEOUT) }
        }
    }

    /// Panics if the endpoint writes anything within the interval
    pub(crate) async fn expect_silence(&mut self, interval: Duration) {
        if let Ok(Some(Ok(packet))) = tokio::time::timeout(interval, self.inbound.next()).await {
            panic!("expected silence, got {}", packet);
        }
    }

    /// Waits for the endpoint to close the channel, discarding anything written before that
    pub(crate) async fn expect_closed(&mut self) {
        let closed = tokio::time::timeout(DEFAULT_PACKET_TIMEOUT, async {
            while let Some(Ok(_)) = self.inbound.next().await {}
        }).await;

        assert!(closed.is_ok(), "channel still open after {:?}", DEFAULT_PACKET_TIMEOUT);
    }

    pub(crate) async fn send(&self, packet: MqttPacket) {
        self.transport.send(packet).await.unwrap();
    }
}

/// Creates a linked pair: the endpoint half for the code under test and a scripted peer
pub(crate) fn make_test_peer() -> (MemoryEndpoint, TestPeer) {
    let (local, remote) = memory_transport_pair();
    (local, TestPeer::new(remote))
}

/// A bare connection whose far side is a scripted peer.  Nothing reads the connection's own
/// inbound stream.
pub(crate) fn make_test_connection(runtime: &Handle, policy: RetryPolicy) -> (Arc<MqttConnection>, TestPeer) {
    let (local, peer) = make_test_peer();
    let connection = MqttConnection::new(1, local.transport, policy, Duration::from_secs(1), runtime);
    (connection, peer)
}

pub(crate) fn make_test_connection_with_id(runtime: &Handle, id: u64) -> (Arc<MqttConnection>, TestPeer) {
    let (local, peer) = make_test_peer();
    let connection = MqttConnection::new(id, local.transport, RetryPolicy::new(Duration::from_secs(10), 3), Duration::from_secs(1), runtime);
    (connection, peer)
}

pub(crate) fn random_client_id() -> String {
    format!("test-{}", uuid::Uuid::new_v4())
}
