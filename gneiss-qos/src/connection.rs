/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Per-connection outbound plumbing.

Every packet a connection writes goes through one of two FIFO queues serviced by a single writer
task.  The protocol queue (connack, acknowledgements, replays, retries, pings) is always
serviced first.  The application queue is held back until the connection is marked ready, which
happens only once connect handling and session replay have been queued.
 */

use crate::dispatcher::PacketReplayBuffer;
use crate::error::{GneissError, GneissResult};
use crate::logging::log_packet;
use crate::mqtt::MqttPacket;
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::transport::Transport;

use log::*;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch, Notify};

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle of a connection.  Every state other than Listening is terminal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConnectionState {

    /// Inbound packets are being dispatched
    Listening,

    /// The transport ended cleanly
    Completed,

    /// A transport or protocol error ended the connection
    Faulted,

    /// The connection was explicitly disposed
    Disposed,
}

impl ConnectionState {

    /// Returns true for every state other than Listening
    pub fn is_terminal(&self) -> bool {
        *self != ConnectionState::Listening
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Listening => { write!(f, "Listening") }
            ConnectionState::Completed => { write!(f, "Completed") }
            ConnectionState::Faulted => { write!(f, "Faulted") }
            ConnectionState::Disposed => { write!(f, "Disposed") }
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutboundQueueType {
    Protocol,
    Application,
}

struct OutboundOperation {
    packet: MqttPacket,
    completion: oneshot::Sender<GneissResult<()>>,
}

#[derive(Default)]
struct OutboundQueues {
    protocol: VecDeque<OutboundOperation>,
    application: VecDeque<OutboundOperation>,
    ready: bool,
    closed: bool,
}

impl OutboundQueues {
    fn dequeue(&mut self) -> Option<OutboundOperation> {
        if let Some(operation) = self.protocol.pop_front() {
            return Some(operation);
        }

        if self.ready {
            return self.application.pop_front();
        }

        None
    }

    fn drain(&mut self) -> Vec<OutboundOperation> {
        self.protocol.drain(..).chain(self.application.drain(..)).collect()
    }
}

/// Resolves once a submitted packet has been accepted by the transport
pub(crate) struct WriteCompletion {
    receiver: oneshot::Receiver<GneissResult<()>>,
}

impl WriteCompletion {
    pub(crate) async fn wait(self) -> GneissResult<()> {
        match self.receiver.await {
            Ok(result) => { result }
            Err(_) => { Err(GneissError::new_connection_closed("connection writer stopped")) }
        }
    }
}

/// One transport channel and the delivery state bound to it.
pub struct MqttConnection {
    id: u64,
    client_id: Mutex<Option<String>>,
    transport: Arc<dyn Transport>,
    queues: Mutex<OutboundQueues>,
    outbound_signal: Notify,
    last_outbound: Mutex<Instant>,
    state: watch::Sender<ConnectionState>,
    retry: RetryCoordinator,
    recent_packets: PacketReplayBuffer,
}

impl MqttConnection {

    pub(crate) fn new(id: u64, transport: Arc<dyn Transport>, policy: RetryPolicy, replay_window: Duration, runtime: &Handle) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Listening);
        let connection = Arc::new(MqttConnection {
            id,
            client_id: Mutex::new(None),
            transport,
            queues: Mutex::new(OutboundQueues::default()),
            outbound_signal: Notify::new(),
            last_outbound: Mutex::new(Instant::now()),
            state,
            retry: RetryCoordinator::new(policy),
            recent_packets: PacketReplayBuffer::new(replay_window),
        });

        runtime.spawn(service_outbound(connection.clone()));

        connection
    }

    /// Endpoint-local identifier of this connection
    pub fn id(&self) -> u64 { self.id }

    /// Client id bound to this connection, once the connect exchange has established it
    pub fn client_id(&self) -> Option<String> {
        self.client_id.lock().ok().and_then(|client_id| client_id.clone())
    }

    pub(crate) fn set_client_id(&self, client_id: &str) {
        if let Ok(mut current) = self.client_id.lock() {
            *current = Some(client_id.to_string());
        }
    }

    pub(crate) fn require_client_id(&self) -> GneissResult<String> {
        self.client_id().ok_or_else(|| { GneissError::new_protocol_error("packet received before the connection was bound to a client") })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Returns true while the connection is listening and its transport is usable
    pub fn is_connected(&self) -> bool {
        !self.state().is_terminal() && self.transport.is_connected()
    }

    /// Packets received within the replay window, oldest first.  For diagnostics only.
    pub fn recent_packets(&self) -> Vec<MqttPacket> {
        self.recent_packets.snapshot()
    }

    /// Terminates the connection: outstanding waits and queued writes fail with ConnectionClosed
    /// and the transport is closed.  Has no effect on an already-terminated connection.
    pub fn dispose(&self) {
        self.terminate(ConnectionState::Disposed);
    }

    pub(crate) fn retry(&self) -> &RetryCoordinator {
        &self.retry
    }

    pub(crate) fn replay_buffer(&self) -> &PacketReplayBuffer {
        &self.recent_packets
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Moves to a terminal state and releases everything bound to the connection.  Returns the
    /// terminal state actually in effect, which is the earlier one if the connection had already
    /// terminated.
    pub(crate) fn terminate(&self, state: ConnectionState) -> ConnectionState {
        let mut effective = state;
        let transitioned = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                effective = *current;
                false
            } else {
                *current = state;
                true
            }
        });

        if transitioned {
            info!("connection {} - terminated as {}", self.id, state);

            let abandoned = match self.queues.lock() {
                Ok(mut queues) => {
                    queues.closed = true;
                    queues.drain()
                }
                Err(_) => { Vec::new() }
            };

            for operation in abandoned {
                let _ = operation.completion.send(Err(GneissError::new_connection_closed("connection terminated before the packet was written")));
            }

            self.outbound_signal.notify_one();
            self.retry.close();
            self.transport.close();
        }

        effective
    }

    /// Queues a packet for writing.  Relative order among submits to the same queue is the order
    /// of these calls.
    pub(crate) fn submit(&self, packet: MqttPacket, queue: OutboundQueueType) -> WriteCompletion {
        let (completion, receiver) = oneshot::channel();
        let operation = OutboundOperation { packet, completion };

        let rejected = match self.queues.lock() {
            Ok(mut queues) => {
                if queues.closed {
                    Some(operation)
                } else {
                    match queue {
                        OutboundQueueType::Protocol => { queues.protocol.push_back(operation); }
                        OutboundQueueType::Application => { queues.application.push_back(operation); }
                    }
                    None
                }
            }
            Err(_) => { Some(operation) }
        };

        match rejected {
            Some(operation) => {
                let _ = operation.completion.send(Err(GneissError::new_connection_closed("connection is no longer accepting packets")));
            }
            None => {
                self.touch_outbound();
                self.outbound_signal.notify_one();
            }
        }

        WriteCompletion { receiver }
    }

    /// Queues a packet and waits until the transport has accepted it
    pub(crate) async fn send(&self, packet: MqttPacket, queue: OutboundQueueType) -> GneissResult<()> {
        self.submit(packet, queue).wait().await
    }

    /// Releases the application queue
    pub(crate) fn mark_ready(&self) {
        if let Ok(mut queues) = self.queues.lock() {
            queues.ready = true;
        }

        debug!("connection {} - ready for application traffic", self.id);
        self.outbound_signal.notify_one();
    }

    pub(crate) fn last_outbound(&self) -> Instant {
        self.last_outbound.lock().map_or_else(|_| Instant::now(), |instant| *instant)
    }

    fn touch_outbound(&self) {
        if let Ok(mut last_outbound) = self.last_outbound.lock() {
            *last_outbound = Instant::now();
        }
    }

    async fn next_outbound(&self) -> Option<OutboundOperation> {
        loop {
            {
                let mut queues = self.queues.lock().ok()?;
                if queues.closed {
                    return None;
                }

                if let Some(operation) = queues.dequeue() {
                    return Some(operation);
                }
            }

            self.outbound_signal.notified().await;
        }
    }
}

async fn service_outbound(connection: Arc<MqttConnection>) {
    let prefix = format!("connection {} - writing ", connection.id);

    while let Some(operation) = connection.next_outbound().await {
        log_packet(&prefix, &operation.packet);

        match connection.transport.send(operation.packet).await {
            Ok(()) => {
                let _ = operation.completion.send(Ok(()));
            }
            Err(error) => {
                error!("connection {} - transport write failed: {}", connection.id, error);
                connection.terminate(ConnectionState::Faulted);
                let _ = operation.completion.send(Err(error));
                break;
            }
        }
    }

    debug!("connection {} - writer stopped", connection.id);
}
