/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Send-then-await-response with timeout and retry.

An exchange registers interest in one (response type, packet id) pair, queues its request, and
then waits.  Each timeout resends the request with its duplicate flag set until the attempt
budget runs out.  Closing the owning connection fails every outstanding wait immediately.
 */

use crate::config::DeliveryOptions;
use crate::connection::{MqttConnection, OutboundQueueType, WriteCompletion};
use crate::error::{GneissError, GneissResult};
use crate::mqtt::{MqttPacket, PacketType};

use log::*;
use tokio::sync::oneshot;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Timeout and attempt budget applied to every exchange on a connection
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    pub(crate) ack_timeout: Duration,
    pub(crate) max_attempts: u32,
}

impl RetryPolicy {

    /// Creates a policy.  An attempt budget of zero is treated as one.
    pub fn new(ack_timeout: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            ack_timeout,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl From<&DeliveryOptions> for RetryPolicy {
    fn from(options: &DeliveryOptions) -> Self {
        RetryPolicy::new(options.ack_timeout(), options.max_attempts())
    }
}

/// The response an exchange is waiting for
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ResponseKey {

    /// Expected response packet type
    pub packet_type: PacketType,

    /// Correlating packet id; zero for responses that carry none
    pub packet_id: u16,
}

impl ResponseKey {

    /// Creates a key for a response type and packet id
    pub fn new(packet_type: PacketType, packet_id: u16) -> Self {
        ResponseKey { packet_type, packet_id }
    }

    fn of(packet: &MqttPacket) -> Option<Self> {
        packet.packet_id().map(|packet_id| ResponseKey::new(packet.packet_type(), packet_id))
    }
}

type ResponseSender = oneshot::Sender<GneissResult<MqttPacket>>;

#[derive(Default)]
struct WaiterTable {
    closed: bool,
    waiters: HashMap<ResponseKey, ResponseSender>,
}

/// Table of outstanding response waits for one connection
pub struct RetryCoordinator {
    policy: RetryPolicy,
    table: Mutex<WaiterTable>,
}

impl RetryCoordinator {

    pub(crate) fn new(policy: RetryPolicy) -> Self {
        RetryCoordinator {
            policy,
            table: Mutex::new(WaiterTable::default()),
        }
    }

    /// Returns the policy applied to new exchanges
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Number of waits currently outstanding
    pub fn outstanding(&self) -> usize {
        self.table.lock().map_or(0, |table| table.waiters.len())
    }

    fn register(&self, key: ResponseKey) -> GneissResult<oneshot::Receiver<GneissResult<MqttPacket>>> {
        let mut table = self.table.lock().map_err(|_| { GneissError::new_internal_state_error("retry table lock poisoned") })?;
        if table.closed {
            return Err(GneissError::new_connection_closed("connection closed before the exchange started"));
        }

        if table.waiters.contains_key(&key) {
            error!("retry - {} ({}) already has an outstanding wait", key.packet_type, key.packet_id);
            return Err(GneissError::new_internal_state_error(format!("duplicate wait for {} ({})", key.packet_type, key.packet_id)));
        }

        let (sender, receiver) = oneshot::channel();
        table.waiters.insert(key, sender);
        Ok(receiver)
    }

    fn unregister(&self, key: &ResponseKey) {
        if let Ok(mut table) = self.table.lock() {
            table.waiters.remove(key);
        }
    }

    /// Hands an inbound response to the exchange waiting for it.  Returns the packet back when
    /// no exchange was waiting.
    pub(crate) fn complete(&self, packet: MqttPacket) -> Option<MqttPacket> {
        let Some(key) = ResponseKey::of(&packet) else {
            return Some(packet);
        };

        let waiter = match self.table.lock() {
            Ok(mut table) => { table.waiters.remove(&key) }
            Err(_) => { None }
        };

        match waiter {
            Some(sender) => {
                // a failed send means the waiter gave up in the same instant; nothing left to do
                let _ = sender.send(Ok(packet));
                None
            }
            None => { Some(packet) }
        }
    }

    /// Fails every outstanding wait with ConnectionClosed and refuses new ones
    pub(crate) fn close(&self) {
        let waiters : Vec<ResponseSender> = match self.table.lock() {
            Ok(mut table) => {
                table.closed = true;
                table.waiters.drain().map(|(_, sender)| sender).collect()
            }
            Err(_) => { Vec::new() }
        };

        if !waiters.is_empty() {
            debug!("retry - failing {} outstanding wait(s) on close", waiters.len());
        }

        for sender in waiters {
            let _ = sender.send(Err(GneissError::new_connection_closed("connection closed while waiting for a response")));
        }
    }
}

/// An exchange whose request has been queued and whose response has not arrived yet
pub(crate) struct PendingExchange {
    connection: Arc<MqttConnection>,
    request: MqttPacket,
    key: ResponseKey,
    response: oneshot::Receiver<GneissResult<MqttPacket>>,
    written: Option<WriteCompletion>,
    attempts: u32,
    policy: RetryPolicy,
}

impl fmt::Debug for PendingExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PendingExchange {{ connection: {}, request: {}, attempts: {} }}", self.connection.id(), self.request, self.attempts)
    }
}

/// Registers for the response and queues the request.  The request's position in the outbound
/// order is fixed when this returns.
pub(crate) fn begin_exchange(connection: &Arc<MqttConnection>, request: MqttPacket, response_type: PacketType, queue: OutboundQueueType) -> GneissResult<PendingExchange> {
    let key = ResponseKey::new(response_type, request.packet_id().unwrap_or(0));
    let response = connection.retry().register(key)?;
    let written = connection.submit(request.clone(), queue);

    Ok(PendingExchange {
        connection: connection.clone(),
        request,
        key,
        response,
        written: Some(written),
        attempts: 1,
        policy: connection.retry().policy(),
    })
}

impl PendingExchange {

    /// Overrides the connection's policy for this exchange
    pub(crate) fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Waits until the first attempt has been written
    pub(crate) async fn written(&mut self) -> GneissResult<()> {
        if let Some(written) = self.written.take() {
            if let Err(error) = written.wait().await {
                self.connection.retry().unregister(&self.key);
                return Err(error);
            }
        }

        Ok(())
    }

    /// Waits for the matching response, resending on each timeout
    pub(crate) async fn response(mut self) -> GneissResult<MqttPacket> {
        self.written().await?;

        loop {
            match tokio::time::timeout(self.policy.ack_timeout, &mut self.response).await {
                Ok(Ok(result)) => {
                    return result;
                }
                Ok(Err(_)) => {
                    return Err(GneissError::new_connection_closed("response wait abandoned"));
                }
                Err(_) => {
                    if self.attempts >= self.policy.max_attempts {
                        self.connection.retry().unregister(&self.key);
                        let packet_type = self.request.packet_type();
                        let packet_id = self.request.packet_id().unwrap_or(0);
                        warn!("connection {} - {} ({}) unanswered after {} attempt(s)", self.connection.id(), packet_type, packet_id, self.attempts);
                        return Err(GneissError::new_ack_timeout_exceeded(packet_type, packet_id, self.attempts));
                    }

                    self.attempts += 1;
                    self.request.mark_duplicate();
                    warn!("connection {} - no {} for {} within {:?}, resending (attempt {})", self.connection.id(), self.key.packet_type, self.key.packet_id, self.policy.ack_timeout, self.attempts);

                    if let Err(error) = self.connection.send(self.request.clone(), OutboundQueueType::Protocol).await {
                        self.connection.retry().unregister(&self.key);
                        return Err(error);
                    }
                }
            }
        }
    }
}

/// Runs a complete exchange: queue the request, then wait for its response with retries
pub(crate) async fn send_and_wait(connection: &Arc<MqttConnection>, request: MqttPacket, response_type: PacketType, queue: OutboundQueueType) -> GneissResult<MqttPacket> {
    begin_exchange(connection, request, response_type, queue)?.response().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::mqtt::*;
    use crate::testing::*;
    use assert_matches::assert_matches;

    fn make_publish(packet_id: u16) -> MqttPacket {
        MqttPacket::Publish(PublishPacket {
            packet_id: Some(packet_id),
            topic: "retry/test".to_string(),
            qos: QualityOfService::AtLeastOnce,
            ..Default::default()
        })
    }

    #[test]
    fn response_resolves_wait() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let (connection, mut peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_secs(5), 3));
            connection.mark_ready();

            let exchange = begin_exchange(&connection, make_publish(4), PacketType::Puback, OutboundQueueType::Application).unwrap();
            let wait = tokio::spawn(exchange.response());

            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(4), duplicate: false, .. }));

            // a response for some other id is not consumed by this wait
            let unrelated = MqttPacket::Puback(PubackPacket { packet_id: 5 });
            assert_eq!(Some(unrelated.clone()), connection.retry().complete(unrelated));
            assert_eq!(None, connection.retry().complete(MqttPacket::Puback(PubackPacket { packet_id: 4 })));

            assert_matches!(wait.await.unwrap(), Ok(MqttPacket::Puback(PubackPacket { packet_id: 4 })));
            assert_eq!(0, connection.retry().outstanding());

            // a second ack for the same id has nobody left to resolve
            assert!(connection.retry().complete(MqttPacket::Puback(PubackPacket { packet_id: 4 })).is_some());
        });
    }

    #[test]
    fn timeout_resends_with_duplicate_flag_then_fails() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let (connection, mut peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_millis(50), 3));

            let wait = tokio::spawn({
                let connection = connection.clone();
                async move { send_and_wait(&connection, make_publish(9), PacketType::Puback, OutboundQueueType::Protocol).await }
            });

            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(9), duplicate: false, .. }));
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(9), duplicate: true, .. }));
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(9), duplicate: true, .. }));

            assert_matches!(wait.await.unwrap(), Err(GneissError::AckTimeoutExceeded(context)) => {
                assert_eq!(PacketType::Publish, context.packet_type);
                assert_eq!(9, context.packet_id);
                assert_eq!(3, context.attempts);
            });

            assert_eq!(0, connection.retry().outstanding());
            assert_eq!(ConnectionState::Listening, connection.state());
            peer.expect_silence(Duration::from_millis(100)).await;
        });
    }

    #[test]
    fn late_response_after_resend_still_resolves() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let (connection, mut peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_millis(50), 5));

            let wait = tokio::spawn({
                let connection = connection.clone();
                async move { send_and_wait(&connection, make_publish(2), PacketType::Puback, OutboundQueueType::Protocol).await }
            });

            peer.next_packet().await;
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { duplicate: true, .. }));
            assert_eq!(None, connection.retry().complete(MqttPacket::Puback(PubackPacket { packet_id: 2 })));

            assert_matches!(wait.await.unwrap(), Ok(MqttPacket::Puback(_)));
        });
    }

    #[test]
    fn close_fails_outstanding_waits() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let (connection, mut peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_secs(10), 3));

            let first = tokio::spawn({
                let connection = connection.clone();
                async move { send_and_wait(&connection, make_publish(1), PacketType::Puback, OutboundQueueType::Protocol).await }
            });
            let second = tokio::spawn({
                let connection = connection.clone();
                async move { send_and_wait(&connection, make_publish(2), PacketType::Pubrec, OutboundQueueType::Protocol).await }
            });
            peer.next_packet().await;
            peer.next_packet().await;

            connection.dispose();

            assert_matches!(first.await.unwrap(), Err(GneissError::ConnectionClosed(_)));
            assert_matches!(second.await.unwrap(), Err(GneissError::ConnectionClosed(_)));
            assert_matches!(begin_exchange(&connection, make_publish(3), PacketType::Puback, OutboundQueueType::Protocol), Err(GneissError::ConnectionClosed(_)));
        });
    }

    #[test]
    fn one_wait_per_key() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let (connection, _peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_secs(10), 3));

            let _first = begin_exchange(&connection, make_publish(1), PacketType::Puback, OutboundQueueType::Protocol).unwrap();
            assert_matches!(begin_exchange(&connection, make_publish(1), PacketType::Puback, OutboundQueueType::Protocol), Err(GneissError::InternalStateError(_)));

            // same id, different expected response, is a separate wait
            assert_matches!(begin_exchange(&connection, make_publish(1), PacketType::Pubrec, OutboundQueueType::Protocol), Ok(_));
        });
    }
}
