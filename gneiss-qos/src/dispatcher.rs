/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Inbound packet dispatch for a single connection.

A dispatcher owns a connection's inbound stream and processes one packet at a time, in arrival
order.  Each packet is matched exactly once against the closed packet set and handed, already
narrowed, to the role-specific [`ProtocolFlows`] implementation.  Acknowledgement-style responses
go straight to the connection's retry coordinator.
 */

use crate::connection::{ConnectionState, MqttConnection, OutboundQueueType};
use crate::error::{GneissError, GneissResult};
use crate::logging::get_packet_type_for_logging;
use crate::mqtt::*;
use crate::transport::PacketStream;

use futures::StreamExt;
use log::*;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Future returned by a flow body
pub(crate) type FlowFuture<'a> = Pin<Box<dyn Future<Output = GneissResult<()>> + Send + 'a>>;

/// Future returned by the termination hook
pub(crate) type TerminationFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

fn reject<'a>(packet_type: PacketType) -> FlowFuture<'a> {
    Box::pin(async move {
        Err(GneissError::new_protocol_error(format!("{} is not valid in this role", packet_type)))
    })
}

/// Role-specific handlers for each inbound packet type.  Any packet a role does not handle is a
/// protocol error.
pub(crate) trait ProtocolFlows : Send + Sync + 'static {

    /// Packet type that must open the inbound sequence
    fn expected_first_packet(&self) -> PacketType;

    /// Interval for autonomous pings, if this role sends them
    fn keep_alive_interval(&self) -> Option<Duration> { None }

    fn handle_connect<'a>(&'a self, _connection: &'a Arc<MqttConnection>, _packet: ConnectPacket) -> FlowFuture<'a> {
        reject(PacketType::Connect)
    }

    fn handle_connack<'a>(&'a self, _connection: &'a Arc<MqttConnection>, _packet: ConnackPacket) -> FlowFuture<'a> {
        reject(PacketType::Connack)
    }

    fn handle_publish<'a>(&'a self, _connection: &'a Arc<MqttConnection>, _packet: PublishPacket) -> FlowFuture<'a> {
        reject(PacketType::Publish)
    }

    fn handle_pubrel<'a>(&'a self, _connection: &'a Arc<MqttConnection>, _packet: PubrelPacket) -> FlowFuture<'a> {
        reject(PacketType::Pubrel)
    }

    fn handle_subscribe<'a>(&'a self, _connection: &'a Arc<MqttConnection>, _packet: SubscribePacket) -> FlowFuture<'a> {
        reject(PacketType::Subscribe)
    }

    fn handle_unsubscribe<'a>(&'a self, _connection: &'a Arc<MqttConnection>, _packet: UnsubscribePacket) -> FlowFuture<'a> {
        reject(PacketType::Unsubscribe)
    }

    fn handle_pingreq<'a>(&'a self, _connection: &'a Arc<MqttConnection>) -> FlowFuture<'a> {
        reject(PacketType::Pingreq)
    }

    fn handle_disconnect<'a>(&'a self, _connection: &'a Arc<MqttConnection>) -> FlowFuture<'a> {
        reject(PacketType::Disconnect)
    }

    /// Runs once, after the connection reached its terminal state
    fn on_terminated<'a>(&'a self, connection: &'a Arc<MqttConnection>, state: ConnectionState, error: Option<GneissError>) -> TerminationFuture<'a>;
}

/// Recently received packets, kept for a bounded time window.  Diagnostic only.
pub(crate) struct PacketReplayBuffer {
    window: Duration,
    packets: Mutex<VecDeque<(Instant, MqttPacket)>>,
}

impl PacketReplayBuffer {

    pub(crate) fn new(window: Duration) -> Self {
        PacketReplayBuffer {
            window,
            packets: Mutex::new(VecDeque::new()),
        }
    }

    fn prune(window: Duration, packets: &mut VecDeque<(Instant, MqttPacket)>) {
        while let Some((received, _)) = packets.front() {
            if received.elapsed() <= window {
                break;
            }
            packets.pop_front();
        }
    }

    pub(crate) fn record(&self, packet: &MqttPacket) {
        if let Ok(mut packets) = self.packets.lock() {
            packets.push_back((Instant::now(), packet.clone()));
            PacketReplayBuffer::prune(self.window, &mut packets);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<MqttPacket> {
        match self.packets.lock() {
            Ok(mut packets) => {
                PacketReplayBuffer::prune(self.window, &mut packets);
                packets.iter().map(|(_, packet)| packet.clone()).collect()
            }
            Err(_) => { Vec::new() }
        }
    }
}

/// Sequential inbound processor for one connection
pub(crate) struct FlowDispatcher<F: ProtocolFlows> {
    connection: Arc<MqttConnection>,
    flows: Arc<F>,
    inbound: PacketStream,
    runtime: Handle,
}

impl<F: ProtocolFlows> FlowDispatcher<F> {

    pub(crate) fn new(connection: Arc<MqttConnection>, flows: Arc<F>, inbound: PacketStream, runtime: Handle) -> Self {
        FlowDispatcher {
            connection,
            flows,
            inbound,
            runtime,
        }
    }

    /// Starts processing on the runtime
    pub(crate) fn spawn(self) -> JoinHandle<ConnectionState> {
        let runtime = self.runtime.clone();
        runtime.spawn(self.run())
    }

    /// Processes inbound packets until the connection terminates, then notifies the flows.
    /// Returns the terminal state in effect.
    pub(crate) async fn run(mut self) -> ConnectionState {
        let connection = self.connection.clone();
        let connection_id = connection.id();
        let mut state_watch = connection.subscribe_state();
        let mut keep_alive : Option<JoinHandle<()>> = None;
        let mut awaiting_first_packet = true;

        info!("dispatch - connection {} - listening", connection_id);

        let (state, error) = loop {
            if connection.state().is_terminal() {
                break (connection.state(), None);
            }

            tokio::select! {
                changed = state_watch.changed() => {
                    if changed.is_err() || state_watch.borrow().is_terminal() {
                        break (connection.state(), None);
                    }
                }
                next = self.inbound.next() => {
                    let packet = match next {
                        None => {
                            info!("dispatch - connection {} - inbound stream ended", connection_id);
                            break (ConnectionState::Completed, None);
                        }
                        Some(Err(error)) => {
                            error!("dispatch - connection {} - inbound stream failed: {}", connection_id, error);
                            break (ConnectionState::Faulted, Some(error));
                        }
                        Some(Ok(packet)) => { packet }
                    };

                    debug!("dispatch - connection {} - received {}", connection_id, packet);
                    connection.replay_buffer().record(&packet);

                    if awaiting_first_packet {
                        let expected = self.flows.expected_first_packet();
                        if packet.packet_type() != expected {
                            error!("dispatch - connection {} - expected {} first, got {}", connection_id, expected, get_packet_type_for_logging(&packet));
                            break (ConnectionState::Faulted, Some(GneissError::new_protocol_error(format!("first packet must be {}", expected))));
                        }
                    }

                    if let Err(error) = dispatch(self.flows.as_ref(), &connection, packet).await {
                        if error.is_connection_fatal() {
                            error!("dispatch - connection {} - flow failed: {}", connection_id, error);
                            break (ConnectionState::Faulted, Some(error));
                        }

                        warn!("dispatch - connection {} - flow failed without closing the connection: {}", connection_id, error);
                    }

                    if awaiting_first_packet {
                        awaiting_first_packet = false;
                        if let Some(interval) = self.flows.keep_alive_interval() {
                            keep_alive = Some(self.runtime.spawn(keep_alive_loop(connection.clone(), interval)));
                        }
                    }
                }
            }
        };

        if let Some(keep_alive) = keep_alive {
            keep_alive.abort();
        }

        let effective = connection.terminate(state);
        let error = if effective == state { error } else { None };

        self.flows.on_terminated(&connection, effective, error).await;
        effective
    }
}

async fn dispatch<F: ProtocolFlows>(flows: &F, connection: &Arc<MqttConnection>, packet: MqttPacket) -> GneissResult<()> {
    match packet {
        MqttPacket::Connect(connect) => { flows.handle_connect(connection, connect).await }
        MqttPacket::Connack(connack) => { flows.handle_connack(connection, connack).await }
        MqttPacket::Publish(publish) => { flows.handle_publish(connection, publish).await }
        MqttPacket::Pubrel(pubrel) => { flows.handle_pubrel(connection, pubrel).await }
        MqttPacket::Subscribe(subscribe) => { flows.handle_subscribe(connection, subscribe).await }
        MqttPacket::Unsubscribe(unsubscribe) => { flows.handle_unsubscribe(connection, unsubscribe).await }
        MqttPacket::Pingreq(_) => { flows.handle_pingreq(connection).await }
        MqttPacket::Disconnect(_) => { flows.handle_disconnect(connection).await }
        MqttPacket::Puback(_) | MqttPacket::Pubrec(_) | MqttPacket::Pubcomp(_) | MqttPacket::Suback(_) | MqttPacket::Unsuback(_) => {
            if let Some(unmatched) = connection.retry().complete(packet) {
                warn!("dispatch - connection {} - ignoring {} with no matching exchange", connection.id(), get_packet_type_for_logging(&unmatched));
            }
            Ok(())
        }
        MqttPacket::Pingresp(_) => { Ok(()) }
    }
}

// Sleeps until the outbound side has been idle for a full interval.  Any submit moves the
// deadline, so a ping only goes out if nothing else did.
async fn keep_alive_loop(connection: Arc<MqttConnection>, interval: Duration) {
    let mut state_watch = connection.subscribe_state();
    let started = Instant::now();

    loop {
        let idle_since = connection.last_outbound().max(started);
        let deadline = tokio::time::Instant::from_std(idle_since + interval);
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            changed = state_watch.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if connection.state().is_terminal() {
            break;
        }

        if connection.last_outbound().max(started).elapsed() < interval {
            continue;
        }

        debug!("keep alive - connection {} - idle for {:?}, pinging", connection.id(), interval);
        drop(connection.submit(MqttPacket::Pingreq(PingreqPacket {}), OutboundQueueType::Protocol));
    }
}
