/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Client role: connects to a server over a supplied transport, keeps a local session, and runs the
sender and receiver sides of the QoS handshakes.

```no_run
use gneiss_qos::client::SessionClientBuilder;
use gneiss_qos::config::ConnectOptionsBuilder;
use gneiss_qos::mqtt::QualityOfService;
use gneiss_qos::transport::memory::memory_transport_pair;

# async fn example() -> gneiss_qos::error::GneissResult<()> {
let client = SessionClientBuilder::new(tokio::runtime::Handle::current()).build();

let (local, _remote) = memory_transport_pair();
let options = ConnectOptionsBuilder::new("sensor-7").build();
let session_present = client.connect(local.transport, local.inbound, options).await?;

let published = client.publish("sensors/7/temperature", "21.5".as_bytes(), QualityOfService::ExactlyOnce, false);
published.complete().await?;
# Ok(())
# }
```
 */

use crate::config::{ConnectOptions, DeliveryOptions};
use crate::connection::{ConnectionState, MqttConnection, OutboundQueueType};
use crate::dispatcher::{FlowDispatcher, FlowFuture, ProtocolFlows, TerminationFuture};
use crate::error::{GneissError, GneissResult};
use crate::events::{ConnectionTerminated, EndpointEvents};
use crate::flow::connect::{replay_session, send_saved_messages};
use crate::flow::receiver::{receive_publish, receive_pubrel};
use crate::flow::sender::{publish_message, subscription_exchange, PublishHandle};
use crate::flow::DeliveryContext;
use crate::mqtt::*;
use crate::retry::{begin_exchange, RetryPolicy};
use crate::session::{ApplicationMessage, ClientSession, SessionStore};
use crate::transport::{PacketStream, Transport};
use crate::validate::{validate_publish_packet_outbound, validate_subscribe_packet_outbound, validate_unsubscribe_packet_outbound};

use log::*;
use tokio::runtime::Handle;

use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct ConnectionSlot {
    client_id: Option<String>,
    active: Option<Arc<MqttConnection>>,
    ready: bool,
}

impl ConnectionSlot {
    fn ready_connection(&self) -> Option<(Arc<MqttConnection>, String)> {
        if !self.ready {
            return None;
        }

        match (&self.active, &self.client_id) {
            (Some(connection), Some(client_id)) if connection.is_connected() => { Some((connection.clone(), client_id.clone())) }
            _ => { None }
        }
    }

    fn is_current(&self, connection: &MqttConnection) -> bool {
        self.active.as_ref().map_or(false, |active| active.id() == connection.id())
    }
}

struct ClientCore {
    context: Arc<DeliveryContext>,

    // which connection is current, and whether application traffic may use it; never held
    // across an await
    slot: Mutex<ConnectionSlot>,
}

impl ClientCore {

    fn lock_slot(&self) -> GneissResult<MutexGuard<'_, ConnectionSlot>> {
        self.slot.lock().map_err(|_| { GneissError::new_internal_state_error("client connection slot lock poisoned") })
    }

    // Replaces the current connection and reconciles the local session.  Ids recovered from a
    // resumed session are reserved before any new publish can allocate.
    fn bind(&self, connection: &Arc<MqttConnection>, client_id: &str, clean_session: bool) -> GneissResult<Option<ClientSession>> {
        let mut slot = self.lock_slot()?;

        if let Some(previous) = slot.active.take() {
            info!("client - replacing connection {} with connection {}", previous.id(), connection.id());
            previous.dispose();
        }

        let reconciled = self.context.sessions.reconcile(client_id, clean_session)?;
        match &reconciled.resumed {
            Some(session) => {
                for packet_id in session.outstanding_packet_ids() {
                    self.context.packet_ids.mark_outstanding(client_id, packet_id)?;
                }
            }
            None => {
                self.context.packet_ids.release_client(client_id);
            }
        }

        slot.client_id = Some(client_id.to_string());
        slot.active = Some(connection.clone());
        slot.ready = false;

        Ok(reconciled.resumed)
    }

    // Queues whatever the session owes the server, then opens the connection to application
    // traffic.  A server without our session means our in-flight state is void.
    fn resume(&self, connection: &Arc<MqttConnection>, client_id: &str, session_present: bool, resumed: Option<ClientSession>) -> GneissResult<()> {
        let mut slot = self.lock_slot()?;
        if !slot.is_current(connection) {
            return Err(GneissError::new_connection_closed("superseded by a newer connect"));
        }

        match (session_present, resumed) {
            (true, Some(session)) => {
                replay_session(&self.context, connection, &session)?;
            }
            (_, resumed) => {
                if resumed.is_some() {
                    warn!("client - \"{}\" server has no session, discarding in-flight state", client_id);
                }

                for packet_id in self.context.sessions.clear_in_flight(client_id)? {
                    self.context.packet_ids.free(client_id, packet_id);
                }

                send_saved_messages(&self.context, connection, client_id)?;
            }
        }

        connection.mark_ready();
        slot.ready = true;
        Ok(())
    }

    fn cleanup(&self, connection: &Arc<MqttConnection>, client_id: &str) -> GneissResult<()> {
        let mut slot = self.lock_slot()?;

        if slot.active.is_some() {
            if !slot.is_current(connection) {
                debug!("client - connection {} superseded, leaving session state to its replacement", connection.id());
                return Ok(());
            }

            slot.active = None;
            slot.ready = false;
        }

        let clean = self.context.sessions.read(client_id)?.map_or(false, |session| session.clean);
        if clean {
            debug!("client - \"{}\" clean session discarded", client_id);
            self.context.sessions.delete(client_id)?;
            self.context.packet_ids.release_client(client_id);
        }

        Ok(())
    }
}

struct ClientFlows {
    core: Arc<ClientCore>,
    keep_alive: Option<Duration>,
}

impl ProtocolFlows for ClientFlows {

    fn expected_first_packet(&self) -> PacketType {
        PacketType::Connack
    }

    fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive
    }

    fn handle_connack<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: ConnackPacket) -> FlowFuture<'a> {
        Box::pin(async move {
            match connection.retry().complete(MqttPacket::Connack(packet)) {
                None => { Ok(()) }
                Some(_) => { Err(GneissError::new_protocol_error("ConnackPacket received outside a connect exchange")) }
            }
        })
    }

    fn handle_publish<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: PublishPacket) -> FlowFuture<'a> {
        Box::pin(receive_publish(&self.core.context, connection, packet))
    }

    fn handle_pubrel<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: PubrelPacket) -> FlowFuture<'a> {
        Box::pin(receive_pubrel(&self.core.context, connection, packet))
    }

    fn on_terminated<'a>(&'a self, connection: &'a Arc<MqttConnection>, state: ConnectionState, error: Option<GneissError>) -> TerminationFuture<'a> {
        Box::pin(async move {
            let client_id = connection.client_id();
            if let Some(client_id) = &client_id {
                if let Err(cleanup_error) = self.core.cleanup(connection, client_id) {
                    error!("client - \"{}\" cleanup failed: {}", client_id, cleanup_error);
                }
            }

            self.core.context.events.connection_terminated.raise(ConnectionTerminated {
                connection_id: connection.id(),
                client_id,
                state,
                error,
            }).await;
        })
    }
}

/// A builder for [`SessionClient`]
pub struct SessionClientBuilder {
    runtime: Handle,
    delivery_options: Option<DeliveryOptions>,
    sessions: Option<Arc<SessionStore>>,
}

impl SessionClientBuilder {

    /// Creates a builder for a client whose tasks run on the given runtime
    pub fn new(runtime: Handle) -> Self {
        SessionClientBuilder {
            runtime,
            delivery_options: None,
            sessions: None,
        }
    }

    /// Configures timeouts and the retry budget.
    ///
    /// If not specified, default values will be used.
    pub fn with_delivery_options(&mut self, options: DeliveryOptions) -> &mut Self {
        self.delivery_options = Some(options);
        self
    }

    /// Configures where the local session is kept.  Defaults to an in-memory store.
    pub fn with_session_store(&mut self, sessions: Arc<SessionStore>) -> &mut Self {
        self.sessions = Some(sessions);
        self
    }

    /// Builds a client from the configured options
    pub fn build(&self) -> SessionClient {
        let sessions = self.sessions.clone().unwrap_or_else(|| Arc::new(SessionStore::new_in_memory()));
        let options = self.delivery_options.clone().unwrap_or_default();

        let core = ClientCore {
            context: Arc::new(DeliveryContext::new(sessions, options, self.runtime.clone())),
            slot: Mutex::new(ConnectionSlot::default()),
        };

        SessionClient {
            core: Arc::new(core),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Client-role endpoint.  Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct SessionClient {
    core: Arc<ClientCore>,
    next_connection_id: Arc<AtomicU64>,
}

impl SessionClient {

    /// Runs the connect exchange over a newly opened transport, replacing any current
    /// connection.  Returns the server's session-present flag.
    ///
    /// When the server still holds our session, outstanding publishes and releases are resent
    /// under their original packet ids before any new application traffic.  Otherwise local
    /// in-flight state is discarded.  Messages saved while offline are sent in both cases.
    pub async fn connect(&self, transport: Arc<dyn Transport>, inbound: PacketStream, options: ConnectOptions) -> GneissResult<bool> {
        let client_id = options.client_id().to_string();
        if client_id.is_empty() && !options.clean_session {
            return Err(GneissError::new_packet_validation(PacketType::Connect, "an empty client id requires a clean session"));
        }

        let context = &self.core.context;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = MqttConnection::new(connection_id, transport, RetryPolicy::from(&context.options), context.options.replay_window(), &context.runtime);
        connection.set_client_id(&client_id);

        let resumed = match self.core.bind(&connection, &client_id, options.clean_session) {
            Ok(resumed) => { resumed }
            Err(error) => {
                connection.dispose();
                return Err(error);
            }
        };

        let flows = Arc::new(ClientFlows { core: self.core.clone(), keep_alive: options.keep_alive_interval() });
        FlowDispatcher::new(connection.clone(), flows, inbound, context.runtime.clone()).spawn();

        info!("client - connection {} - connecting as \"{}\"", connection_id, client_id);
        let connack = match self.exchange_connect(&connection, &options).await {
            Ok(connack) => { connack }
            Err(error) => {
                warn!("client - connection {} - connect failed: {}", connection_id, error);
                connection.terminate(ConnectionState::Faulted);
                return Err(error);
            }
        };

        if connack.return_code != ConnectReturnCode::Accepted {
            warn!("client - connection {} - connect rejected: {:?}", connection_id, connack.return_code);
            connection.terminate(ConnectionState::Faulted);
            return Err(GneissError::new_connection_rejected(connack.return_code));
        }

        if let Err(error) = self.core.resume(&connection, &client_id, connack.session_present, resumed) {
            connection.terminate(ConnectionState::Faulted);
            return Err(error);
        }

        info!("client - connection {} - connected as \"{}\", session present: {}", connection_id, client_id, connack.session_present);
        Ok(connack.session_present)
    }

    async fn exchange_connect(&self, connection: &Arc<MqttConnection>, options: &ConnectOptions) -> GneissResult<ConnackPacket> {
        let policy = RetryPolicy::new(self.core.context.options.connack_timeout(), 1);
        let connect = MqttPacket::Connect(options.to_connect_packet());

        match begin_exchange(connection, connect, PacketType::Connack, OutboundQueueType::Protocol)?.with_policy(policy).response().await? {
            MqttPacket::Connack(connack) => { Ok(connack) }
            other => { Err(GneissError::new_internal_state_error(format!("connect exchange resolved by unexpected {}", other.packet_type()))) }
        }
    }

    /// Submits an application message.
    ///
    /// While disconnected, QoS 1 and 2 messages are saved in the session and sent on the next
    /// connection; the returned handle's `stored` completion succeeds and its `completed`
    /// completion fails with ConnectionClosed.  QoS 0 messages fail while disconnected.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService, retain: bool) -> PublishHandle {
        let message = ApplicationMessage::new(topic, payload, qos, retain);

        let slot = match self.core.lock_slot() {
            Ok(slot) => { slot }
            Err(error) => { return PublishHandle::failed(error); }
        };

        if let Some((connection, client_id)) = slot.ready_connection() {
            return publish_message(&self.core.context, &connection, &client_id, message, OutboundQueueType::Application);
        }

        if qos == QualityOfService::AtMostOnce {
            return PublishHandle::failed(GneissError::new_connection_closed("not connected; qos 0 messages are not saved"));
        }

        let Some(client_id) = slot.client_id.clone() else {
            return PublishHandle::failed(GneissError::new_connection_closed("never connected"));
        };

        let publish = PublishPacket { packet_id: Some(1), topic: topic.to_string(), qos, ..Default::default() };
        if let Err(error) = validate_publish_packet_outbound(&publish) {
            return PublishHandle::failed(error);
        }

        match self.core.context.sessions.save_message(&client_id, message) {
            Ok(true) => {
                debug!("client - \"{}\" offline, message on \"{}\" saved", client_id, topic);
                PublishHandle::saved()
            }
            Ok(false) => { PublishHandle::failed(GneissError::new_session_not_found(&client_id)) }
            Err(error) => { PublishHandle::failed(error) }
        }
    }

    fn ready_connection(&self) -> GneissResult<(Arc<MqttConnection>, String)> {
        self.core.lock_slot()?.ready_connection().ok_or_else(|| { GneissError::new_connection_closed("not connected") })
    }

    /// Subscribes to one or more topic filters.  Granted subscriptions are recorded in the local
    /// session.
    pub async fn subscribe(&self, subscriptions: Vec<Subscription>) -> GneissResult<SubackPacket> {
        validate_subscribe_packet_outbound(&SubscribePacket { packet_id: 0, subscriptions: subscriptions.clone() })?;
        let (connection, client_id) = self.ready_connection()?;

        let requested = subscriptions.clone();
        let response = subscription_exchange(&self.core.context, &connection, &client_id, |packet_id| {
            MqttPacket::Subscribe(SubscribePacket { packet_id, subscriptions })
        }, PacketType::Suback).await?;

        let MqttPacket::Suback(suback) = response else {
            return Err(GneissError::new_internal_state_error("subscribe exchange resolved by a non-Suback packet"));
        };

        for (subscription, return_code) in requested.iter().zip(suback.return_codes.iter()) {
            let granted = match return_code {
                SubackReturnCode::GrantedQos0 => { QualityOfService::AtMostOnce }
                SubackReturnCode::GrantedQos1 => { QualityOfService::AtLeastOnce }
                SubackReturnCode::GrantedQos2 => { QualityOfService::ExactlyOnce }
                SubackReturnCode::Failure => {
                    warn!("client - \"{}\" subscription to \"{}\" refused", client_id, subscription.topic_filter);
                    continue;
                }
            };

            self.core.context.sessions.set_subscription(&client_id, Subscription::new(&subscription.topic_filter, granted))?;
        }

        Ok(suback)
    }

    /// Removes subscriptions for one or more topic filters
    pub async fn unsubscribe(&self, topic_filters: Vec<String>) -> GneissResult<UnsubackPacket> {
        validate_unsubscribe_packet_outbound(&UnsubscribePacket { packet_id: 0, topic_filters: topic_filters.clone() })?;
        let (connection, client_id) = self.ready_connection()?;

        let requested = topic_filters.clone();
        let response = subscription_exchange(&self.core.context, &connection, &client_id, |packet_id| {
            MqttPacket::Unsubscribe(UnsubscribePacket { packet_id, topic_filters })
        }, PacketType::Unsuback).await?;

        let MqttPacket::Unsuback(unsuback) = response else {
            return Err(GneissError::new_internal_state_error("unsubscribe exchange resolved by a non-Unsuback packet"));
        };

        for topic_filter in requested.iter() {
            self.core.context.sessions.remove_subscription(&client_id, topic_filter)?;
        }

        Ok(unsuback)
    }

    /// Sends a Disconnect and closes the connection.  The server discards our will.
    pub async fn disconnect(&self) -> GneissResult<()> {
        let connection = self.core.lock_slot()?.active.clone().ok_or_else(|| { GneissError::new_connection_closed("not connected") })?;

        let result = connection.send(MqttPacket::Disconnect(DisconnectPacket {}), OutboundQueueType::Protocol).await;
        connection.terminate(ConnectionState::Completed);
        result
    }

    /// The current connection, if any
    pub fn connection(&self) -> Option<Arc<MqttConnection>> {
        self.core.lock_slot().ok().and_then(|slot| slot.active.clone())
    }

    /// Local session state
    pub fn sessions(&self) -> &SessionStore {
        &self.core.context.sessions
    }

    /// Listener registration for deliveries and terminations
    pub fn events(&self) -> &EndpointEvents {
        &self.core.context.events
    }
}
