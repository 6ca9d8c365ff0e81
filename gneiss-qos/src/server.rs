/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Server role: accepts connections from MQTT clients, owns their sessions, and delivers messages
to them.

```no_run
use gneiss_qos::server::SessionServerBuilder;
use gneiss_qos::transport::memory::memory_transport_pair;

# async fn example() {
let server = SessionServerBuilder::new(tokio::runtime::Handle::current()).build();

let (local, _remote) = memory_transport_pair();
let connection = server.accept(local.transport, local.inbound);
# }
```
 */

use crate::config::DeliveryOptions;
use crate::connection::{ConnectionState, MqttConnection, OutboundQueueType};
use crate::dispatcher::{FlowDispatcher, FlowFuture, ProtocolFlows, TerminationFuture};
use crate::error::{GneissError, GneissResult};
use crate::events::{ConnectionTerminated, EndpointEvents};
use crate::flow::connect::{replay_session, ConnectReconciliation};
use crate::flow::receiver::{receive_publish, receive_pubrel};
use crate::flow::sender::{publish_message, PublishHandle};
use crate::flow::DeliveryContext;
use crate::mqtt::*;
use crate::registry::ConnectionRegistry;
use crate::retry::RetryPolicy;
use crate::session::{ApplicationMessage, ConnectionWill, InMemoryRepository, Repository, SessionStore};
use crate::transport::{PacketStream, Transport};
use crate::validate::{validate_subscribe_packet_inbound, validate_unsubscribe_packet_inbound};

use log::*;
use rand::Rng;
use tokio::runtime::Handle;

use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};

/// Connect-time credential check
pub trait Authenticator : Send + Sync {

    /// Returns true if the connect's credentials are acceptable
    fn authenticate(&self, connect: &ConnectPacket) -> bool;
}

/// Accepts every connect
#[derive(Default)]
pub struct AllowAllAuthenticator {}

impl Authenticator for AllowAllAuthenticator {
    fn authenticate(&self, _connect: &ConnectPacket) -> bool {
        true
    }
}

/// What happened to a message offered to a client
#[derive(Debug)]
pub enum ForwardOutcome {

    /// The client is connected; delivery has started
    Sent(PublishHandle),

    /// The client is offline with a session; the message was queued for its next connection
    Saved,

    /// The client is offline and the message was discarded
    Dropped,
}

struct ServerFlows {
    context: Arc<DeliveryContext>,
    registry: ConnectionRegistry,
    reconciliation: ConnectReconciliation,
    authenticator: Arc<dyn Authenticator>,

    // held across every change to which connection owns a client id, and across forwarding a
    // message to a client; never held across an await
    handoff: Mutex<()>,
}

fn assign_client_id() -> String {
    let mut rng = rand::thread_rng();
    format!("gneiss-{:016x}", rng.gen::<u64>())
}

impl ServerFlows {

    fn lock_handoff(&self) -> GneissResult<MutexGuard<'_, ()>> {
        self.handoff.lock().map_err(|_| { GneissError::new_internal_state_error("server handoff lock poisoned") })
    }

    async fn reject_connect(&self, connection: &Arc<MqttConnection>, return_code: ConnectReturnCode) -> GneissResult<()> {
        let connack = ConnackPacket { session_present: false, return_code };
        connection.send(MqttPacket::Connack(connack), OutboundQueueType::Protocol).await
    }

    async fn on_connect(&self, connection: &Arc<MqttConnection>, connect: ConnectPacket) -> GneissResult<()> {
        if connection.client_id().is_some() {
            return Err(GneissError::new_protocol_error("second ConnectPacket on one connection"));
        }

        if !self.authenticator.authenticate(&connect) {
            warn!("server - connection {} - client \"{}\" failed authentication", connection.id(), connect.client_id);
            self.reject_connect(connection, ConnectReturnCode::BadUsernameOrPassword).await?;
            return Err(GneissError::new_authentication_failed(&connect.client_id));
        }

        let client_id =
            if connect.client_id.is_empty() {
                if !connect.clean_session {
                    warn!("server - connection {} - empty client id requires a clean session", connection.id());
                    self.reject_connect(connection, ConnectReturnCode::IdentifierRejected).await?;
                    return Err(GneissError::new_connection_rejected(ConnectReturnCode::IdentifierRejected));
                }

                let assigned = assign_client_id();
                info!("server - connection {} - assigned client id \"{}\"", connection.id(), assigned);
                assigned
            } else {
                connect.client_id.clone()
            };

        let connack_written = {
            let _handoff = self.lock_handoff()?;

            connection.set_client_id(&client_id);
            self.registry.add(&client_id, connection.clone());

            let reconciled = self.reconciliation.reconcile_connect(&client_id, connect.clean_session, connect.will)?;
            if reconciled.resumed.is_none() {
                self.context.packet_ids.release_client(&client_id);
            }

            let connack = ConnackPacket { session_present: reconciled.session_present, return_code: ConnectReturnCode::Accepted };
            let connack_written = connection.submit(MqttPacket::Connack(connack), OutboundQueueType::Protocol);

            if let Some(session) = reconciled.resumed {
                replay_session(&self.context, connection, &session)?;
            }

            connection.mark_ready();
            connack_written
        };

        info!("server - connection {} - client \"{}\" connected", connection.id(), client_id);
        connack_written.wait().await
    }

    async fn on_subscribe(&self, connection: &Arc<MqttConnection>, subscribe: SubscribePacket) -> GneissResult<()> {
        validate_subscribe_packet_inbound(&subscribe)?;
        let client_id = connection.require_client_id()?;
        let maximum_qos = self.context.options.maximum_qos();

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        for subscription in subscribe.subscriptions {
            let granted = subscription.qos.min(maximum_qos);
            debug!("server - client \"{}\" subscribed to \"{}\" at {}", client_id, subscription.topic_filter, granted);
            self.context.sessions.set_subscription(&client_id, Subscription::new(&subscription.topic_filter, granted))?;
            return_codes.push(SubackReturnCode::from(granted));
        }

        let suback = SubackPacket { packet_id: subscribe.packet_id, return_codes };
        connection.send(MqttPacket::Suback(suback), OutboundQueueType::Protocol).await
    }

    async fn on_unsubscribe(&self, connection: &Arc<MqttConnection>, unsubscribe: UnsubscribePacket) -> GneissResult<()> {
        validate_unsubscribe_packet_inbound(&unsubscribe)?;
        let client_id = connection.require_client_id()?;

        for topic_filter in unsubscribe.topic_filters.iter() {
            if !self.context.sessions.remove_subscription(&client_id, topic_filter)? {
                debug!("server - client \"{}\" was not subscribed to \"{}\"", client_id, topic_filter);
            }
        }

        let unsuback = UnsubackPacket { packet_id: unsubscribe.packet_id };
        connection.send(MqttPacket::Unsuback(unsuback), OutboundQueueType::Protocol).await
    }

    async fn on_disconnect(&self, connection: &Arc<MqttConnection>) -> GneissResult<()> {
        let client_id = connection.require_client_id()?;
        self.reconciliation.delete_will(&client_id)?;

        info!("server - client \"{}\" disconnected", client_id);
        connection.terminate(ConnectionState::Completed);
        Ok(())
    }

    async fn cleanup(&self, connection: &Arc<MqttConnection>, client_id: &str, state: ConnectionState) -> GneissResult<()> {
        let will = {
            let _handoff = self.lock_handoff()?;

            if self.registry.is_registered_elsewhere(client_id, connection.id()) {
                debug!("server - connection {} - client \"{}\" superseded, leaving its state to the new connection", connection.id(), client_id);
                return Ok(());
            }

            self.registry.remove_if_current(client_id, connection.id());

            let will =
                if state != ConnectionState::Disposed {
                    self.reconciliation.take_will(client_id)?
                } else {
                    None
                };

            let clean = self.context.sessions.read(client_id)?.map_or(false, |session| session.clean);
            if clean {
                debug!("server - client \"{}\" clean session discarded", client_id);
                self.context.sessions.delete(client_id)?;
                self.context.packet_ids.release_client(client_id);
            }

            will
        };

        if let Some(will) = will {
            info!("server - client \"{}\" ended abnormally, releasing will on \"{}\"", client_id, will.will.topic);
            self.context.events.will_published.raise(will).await;
        }

        Ok(())
    }
}

impl ProtocolFlows for ServerFlows {

    fn expected_first_packet(&self) -> PacketType {
        PacketType::Connect
    }

    fn handle_connect<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: ConnectPacket) -> FlowFuture<'a> {
        Box::pin(self.on_connect(connection, packet))
    }

    fn handle_publish<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: PublishPacket) -> FlowFuture<'a> {
        Box::pin(receive_publish(&self.context, connection, packet))
    }

    fn handle_pubrel<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: PubrelPacket) -> FlowFuture<'a> {
        Box::pin(receive_pubrel(&self.context, connection, packet))
    }

    fn handle_subscribe<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: SubscribePacket) -> FlowFuture<'a> {
        Box::pin(self.on_subscribe(connection, packet))
    }

    fn handle_unsubscribe<'a>(&'a self, connection: &'a Arc<MqttConnection>, packet: UnsubscribePacket) -> FlowFuture<'a> {
        Box::pin(self.on_unsubscribe(connection, packet))
    }

    fn handle_pingreq<'a>(&'a self, connection: &'a Arc<MqttConnection>) -> FlowFuture<'a> {
        Box::pin(connection.send(MqttPacket::Pingresp(PingrespPacket {}), OutboundQueueType::Protocol))
    }

    fn handle_disconnect<'a>(&'a self, connection: &'a Arc<MqttConnection>) -> FlowFuture<'a> {
        Box::pin(self.on_disconnect(connection))
    }

    fn on_terminated<'a>(&'a self, connection: &'a Arc<MqttConnection>, state: ConnectionState, error: Option<GneissError>) -> TerminationFuture<'a> {
        Box::pin(async move {
            let client_id = connection.client_id();
            if let Some(client_id) = &client_id {
                if let Err(cleanup_error) = self.cleanup(connection, client_id, state).await {
                    error!("server - client \"{}\" cleanup failed: {}", client_id, cleanup_error);
                }
            }

            self.context.events.connection_terminated.raise(ConnectionTerminated {
                connection_id: connection.id(),
                client_id,
                state,
                error,
            }).await;
        })
    }
}

/// A builder for [`SessionServer`]
pub struct SessionServerBuilder {
    runtime: Handle,
    delivery_options: Option<DeliveryOptions>,
    sessions: Option<Arc<SessionStore>>,
    wills: Option<Arc<dyn Repository<ConnectionWill>>>,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl SessionServerBuilder {

    /// Creates a builder for a server whose tasks run on the given runtime
    pub fn new(runtime: Handle) -> Self {
        SessionServerBuilder {
            runtime,
            delivery_options: None,
            sessions: None,
            wills: None,
            authenticator: None,
        }
    }

    /// Configures timeouts, retry budget, and the maximum granted QoS.
    ///
    /// If not specified, default values will be used.
    pub fn with_delivery_options(&mut self, options: DeliveryOptions) -> &mut Self {
        self.delivery_options = Some(options);
        self
    }

    /// Configures the session store.  Defaults to an in-memory store.
    pub fn with_session_store(&mut self, sessions: Arc<SessionStore>) -> &mut Self {
        self.sessions = Some(sessions);
        self
    }

    /// Configures where wills are kept.  Defaults to an in-memory repository.
    pub fn with_will_repository(&mut self, wills: Arc<dyn Repository<ConnectionWill>>) -> &mut Self {
        self.wills = Some(wills);
        self
    }

    /// Configures the connect credential check.  Defaults to accepting every connect.
    pub fn with_authenticator(&mut self, authenticator: Arc<dyn Authenticator>) -> &mut Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Builds a server from the configured options
    pub fn build(&self) -> SessionServer {
        let sessions = self.sessions.clone().unwrap_or_else(|| Arc::new(SessionStore::new_in_memory()));
        let wills = self.wills.clone().unwrap_or_else(|| Arc::new(InMemoryRepository::<ConnectionWill>::new()));
        let authenticator = self.authenticator.clone().unwrap_or_else(|| Arc::new(AllowAllAuthenticator::default()));
        let options = self.delivery_options.clone().unwrap_or_default();

        let flows = ServerFlows {
            context: Arc::new(DeliveryContext::new(sessions.clone(), options, self.runtime.clone())),
            registry: ConnectionRegistry::new(),
            reconciliation: ConnectReconciliation::new(sessions, wills),
            authenticator,
            handoff: Mutex::new(()),
        };

        SessionServer {
            flows: Arc::new(flows),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Server-role endpoint.  Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct SessionServer {
    flows: Arc<ServerFlows>,
    next_connection_id: Arc<AtomicU64>,
}

impl SessionServer {

    /// Starts serving a newly opened transport.  The first inbound packet must be a Connect.
    pub fn accept(&self, transport: Arc<dyn Transport>, inbound: PacketStream) -> Arc<MqttConnection> {
        let context = &self.flows.context;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let connection = MqttConnection::new(connection_id, transport, RetryPolicy::from(&context.options), context.options.replay_window(), &context.runtime);

        info!("server - accepted connection {}", connection_id);
        FlowDispatcher::new(connection.clone(), self.flows.clone(), inbound, context.runtime.clone()).spawn();

        connection
    }

    /// Offers an application message to a client: sent if connected, queued if the client is
    /// offline with a session, dropped otherwise.  QoS 0 messages are never queued.
    pub fn publish_to_client(&self, client_id: &str, message: ApplicationMessage) -> GneissResult<ForwardOutcome> {
        let _handoff = self.flows.lock_handoff()?;

        if let Some(connection) = self.flows.registry.get(client_id) {
            return Ok(ForwardOutcome::Sent(publish_message(&self.flows.context, &connection, client_id, message, OutboundQueueType::Application)));
        }

        if message.qos == QualityOfService::AtMostOnce {
            debug!("server - client \"{}\" offline, dropping qos 0 message on \"{}\"", client_id, message.topic);
            return Ok(ForwardOutcome::Dropped);
        }

        if self.flows.context.sessions.save_message(client_id, message)? {
            debug!("server - client \"{}\" offline, message saved", client_id);
            Ok(ForwardOutcome::Saved)
        } else {
            debug!("server - client \"{}\" has no session, dropping message", client_id);
            Ok(ForwardOutcome::Dropped)
        }
    }

    /// Applies connect-time session and will reconciliation without a connection.  Returns
    /// whether a session was present.
    pub fn reconcile_connect(&self, client_id: &str, clean_session: bool, will: Option<Will>) -> GneissResult<bool> {
        let reconciled = self.flows.reconciliation.reconcile_connect(client_id, clean_session, will)?;
        Ok(reconciled.session_present)
    }

    /// Disposes the connection bound to a client id.  Returns false if the client was not
    /// connected.
    pub fn disconnect_client(&self, client_id: &str) -> bool {
        self.flows.registry.remove(client_id)
    }

    /// Session state for every client
    pub fn sessions(&self) -> &SessionStore {
        &self.flows.context.sessions
    }

    /// Connections currently bound to client ids
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.flows.registry
    }

    /// Listener registration for deliveries, terminations, and released wills
    pub fn events(&self) -> &EndpointEvents {
        &self.flows.context.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryOptionsBuilder;
    use crate::events::{listener, ReceivedMessage};
    use crate::flow::sender::PublishResponse;
    use crate::session::*;
    use crate::testing::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RejectAll {}

    impl Authenticator for RejectAll {
        fn authenticate(&self, _connect: &ConnectPacket) -> bool { false }
    }

    fn make_server(handle: &Handle) -> SessionServer {
        let options = DeliveryOptionsBuilder::new()
            .with_ack_timeout(Duration::from_millis(500))
            .with_maximum_qos(QualityOfService::AtLeastOnce)
            .build();
        SessionServerBuilder::new(handle.clone()).with_delivery_options(options).build()
    }

    fn connect_packet(client_id: &str, clean_session: bool) -> MqttPacket {
        MqttPacket::Connect(ConnectPacket {
            client_id: client_id.to_string(),
            clean_session,
            ..Default::default()
        })
    }

    async fn connect_peer(server: &SessionServer, client_id: &str, clean_session: bool) -> (Arc<MqttConnection>, TestPeer, ConnackPacket) {
        let (local, mut peer) = make_test_peer();
        let connection = server.accept(local.transport, local.inbound);
        peer.send(connect_packet(client_id, clean_session)).await;

        match peer.next_packet().await {
            MqttPacket::Connack(connack) => { (connection, peer, connack) }
            other => { panic!("expected connack, got {}", other) }
        }
    }

    fn record_messages(server: &SessionServer) -> Arc<Mutex<Vec<ReceivedMessage>>> {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        server.events().message_received.parallel.add_listener(listener(move |message: Arc<ReceivedMessage>| {
            let sink = sink.clone();
            async move { sink.lock().unwrap().push((*message).clone()); }
        }));
        delivered
    }

    #[test]
    fn inbound_qos2_exchange() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let delivered = record_messages(&server);
            let client_id = random_client_id();

            let (_connection, mut peer, connack) = connect_peer(&server, &client_id, false).await;
            assert_eq!(ConnectReturnCode::Accepted, connack.return_code);
            assert!(!connack.session_present);

            let publish = PublishPacket { packet_id: Some(1), topic: "t".to_string(), qos: QualityOfService::ExactlyOnce, payload: "m1".as_bytes().to_vec(), ..Default::default() };
            peer.send(MqttPacket::Publish(publish.clone())).await;
            assert_matches!(peer.next_packet().await, MqttPacket::Pubrec(PubrecPacket { packet_id: 1 }));

            peer.send(MqttPacket::Publish(PublishPacket { duplicate: true, ..publish })).await;
            assert_matches!(peer.next_packet().await, MqttPacket::Pubrec(PubrecPacket { packet_id: 1 }));

            peer.send(MqttPacket::Pubrel(PubrelPacket { packet_id: 1 })).await;
            assert_matches!(peer.next_packet().await, MqttPacket::Pubcomp(PubcompPacket { packet_id: 1 }));

            let delivered = delivered.lock().unwrap().clone();
            assert_eq!(1, delivered.len());
            assert_eq!(client_id, delivered[0].client_id);
            assert_eq!("m1".as_bytes(), delivered[0].payload.as_slice());

            // the subscription cap does not apply to what a client publishes
            assert_eq!(QualityOfService::ExactlyOnce, delivered[0].qos);
        });
    }

    #[test]
    fn subscribe_grants_capped_qos() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let client_id = random_client_id();
            let (_connection, mut peer, _) = connect_peer(&server, &client_id, false).await;

            peer.send(MqttPacket::Subscribe(SubscribePacket {
                packet_id: 4,
                subscriptions: vec![Subscription::new("a/#", QualityOfService::ExactlyOnce), Subscription::new("b", QualityOfService::AtMostOnce)],
            })).await;

            assert_matches!(peer.next_packet().await, MqttPacket::Suback(suback) => {
                assert_eq!(4, suback.packet_id);
                assert_eq!(vec![SubackReturnCode::GrantedQos1, SubackReturnCode::GrantedQos0], suback.return_codes);
            });

            peer.send(MqttPacket::Unsubscribe(UnsubscribePacket { packet_id: 5, topic_filters: vec!["b".to_string()] })).await;
            assert_matches!(peer.next_packet().await, MqttPacket::Unsuback(UnsubackPacket { packet_id: 5 }));

            let session = server.sessions().read(&client_id).unwrap().unwrap();
            assert_eq!(vec![Subscription::new("a/#", QualityOfService::AtLeastOnce)], session.subscriptions);

            peer.send(MqttPacket::Pingreq(PingreqPacket {})).await;
            assert_matches!(peer.next_packet().await, MqttPacket::Pingresp(_));
        });
    }

    #[test]
    fn authentication_failure_leaves_no_trace() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = SessionServerBuilder::new(handle.clone()).with_authenticator(Arc::new(RejectAll {})).build();
            let (terminated_sender, mut terminated) = mpsc::unbounded_channel();
            server.events().connection_terminated.parallel.add_listener(listener(move |event: Arc<ConnectionTerminated>| {
                let sender = terminated_sender.clone();
                async move { sender.send((event.state, event.client_id.clone(), matches!(event.error, Some(GneissError::AuthenticationFailed(_))))).unwrap(); }
            }));

            let client_id = random_client_id();
            let (_connection, mut peer, connack) = connect_peer(&server, &client_id, false).await;
            assert_eq!(ConnectReturnCode::BadUsernameOrPassword, connack.return_code);
            peer.expect_closed().await;

            assert_eq!(Some((ConnectionState::Faulted, None, true)), terminated.recv().await);
            assert!(server.sessions().read(&client_id).unwrap().is_none());
            assert!(server.registry().is_empty());
        });
    }

    #[test]
    fn empty_client_id_rules() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);

            let (connection, _peer, connack) = connect_peer(&server, "", true).await;
            assert_eq!(ConnectReturnCode::Accepted, connack.return_code);
            let assigned = connection.client_id().unwrap();
            assert!(!assigned.is_empty());
            assert_eq!(vec![assigned], server.registry().active_clients());

            let (_rejected, mut peer, connack) = connect_peer(&server, "", false).await;
            assert_eq!(ConnectReturnCode::IdentifierRejected, connack.return_code);
            peer.expect_closed().await;
        });
    }

    #[test]
    fn second_connect_is_protocol_error() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let (connection, mut peer, _) = connect_peer(&server, &random_client_id(), false).await;

            peer.send(connect_packet("again", false)).await;
            peer.expect_closed().await;
            assert_eq!(ConnectionState::Faulted, connection.state());
        });
    }

    #[test]
    fn reconnect_replays_pending_before_new_traffic() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let client_id = random_client_id();

            server.reconcile_connect(&client_id, false, None).unwrap();
            server.sessions().add_pending_message(&client_id, PendingMessage {
                message: ApplicationMessage::new("t", "old".as_bytes(), QualityOfService::AtLeastOnce, false),
                duplicate: false,
                packet_id: Some(10),
                status: PendingMessageStatus::PendingToSend,
            }).unwrap();

            let (local, mut peer) = make_test_peer();
            let connection = server.accept(local.transport, local.inbound);
            peer.send(connect_packet(&client_id, false)).await;

            // queued as soon as the client id is bound; must still trail the replay
            while server.registry().get(&client_id).is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            let fresh = server.publish_to_client(&client_id, ApplicationMessage::new("t", "new".as_bytes(), QualityOfService::AtLeastOnce, false)).unwrap();

            assert_matches!(peer.next_packet().await, MqttPacket::Connack(ConnackPacket { session_present: true, .. }));
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(10), duplicate: true, .. }));
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(1), duplicate: false, .. }));

            peer.send(MqttPacket::Puback(PubackPacket { packet_id: 10 })).await;
            peer.send(MqttPacket::Puback(PubackPacket { packet_id: 1 })).await;

            let ForwardOutcome::Sent(fresh) = fresh else { panic!("expected the message to be sent") };
            assert_matches!(fresh.complete().await, Ok(PublishResponse::Qos1(PubackPacket { packet_id: 1 })));
            assert_eq!(ConnectionState::Listening, connection.state());
        });
    }

    #[test]
    fn offline_client_messages_are_saved_then_delivered() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let client_id = random_client_id();

            assert_matches!(server.publish_to_client(&client_id, ApplicationMessage::new("t", "x".as_bytes(), QualityOfService::AtLeastOnce, false)), Ok(ForwardOutcome::Dropped));

            server.reconcile_connect(&client_id, false, None).unwrap();
            assert_matches!(server.publish_to_client(&client_id, ApplicationMessage::new("t", "q0".as_bytes(), QualityOfService::AtMostOnce, false)), Ok(ForwardOutcome::Dropped));
            assert_matches!(server.publish_to_client(&client_id, ApplicationMessage::new("t", "a".as_bytes(), QualityOfService::AtLeastOnce, false)), Ok(ForwardOutcome::Saved));
            assert_matches!(server.publish_to_client(&client_id, ApplicationMessage::new("t", "b".as_bytes(), QualityOfService::ExactlyOnce, false)), Ok(ForwardOutcome::Saved));

            let (_connection, mut peer, connack) = connect_peer(&server, &client_id, false).await;
            assert!(connack.session_present);

            assert_matches!(peer.next_packet().await, MqttPacket::Publish(publish) => {
                assert_eq!("a".as_bytes(), publish.payload.as_slice());
                assert_eq!(QualityOfService::AtLeastOnce, publish.qos);
            });
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(publish) => {
                assert_eq!("b".as_bytes(), publish.payload.as_slice());
                assert_eq!(QualityOfService::ExactlyOnce, publish.qos);
            });
        });
    }

    #[test]
    fn eviction_fails_outstanding_waits() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let client_id = random_client_id();

            let (first, mut first_peer, _) = connect_peer(&server, &client_id, false).await;
            let ForwardOutcome::Sent(pending) = server.publish_to_client(&client_id, ApplicationMessage::new("t", "m".as_bytes(), QualityOfService::AtLeastOnce, false)).unwrap() else {
                panic!("expected the message to be sent");
            };
            assert_matches!(first_peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(1), .. }));

            let (second, mut second_peer, connack) = connect_peer(&server, &client_id, false).await;
            assert!(connack.session_present);

            assert_matches!(pending.complete().await, Err(GneissError::ConnectionClosed(_)));
            assert_eq!(ConnectionState::Disposed, first.state());
            first_peer.expect_closed().await;

            // the replacement resumes the interrupted exchange
            assert_matches!(second_peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(1), duplicate: true, .. }));
            assert_eq!(second.id(), server.registry().get(&client_id).unwrap().id());
        });
    }

    #[test]
    fn will_released_only_on_abnormal_end() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let (will_sender, mut wills) = mpsc::unbounded_channel();
            server.events().will_published.sequential.add_listener(listener(move |will: Arc<ConnectionWill>| {
                let sender = will_sender.clone();
                async move { sender.send(will.will.topic.clone()).unwrap(); }
            }));

            let will = Will { topic: "last/words".to_string(), payload: vec![1], qos: QualityOfService::AtLeastOnce, retain: false };

            // graceful disconnect discards the will
            let (local, mut peer) = make_test_peer();
            let connection = server.accept(local.transport, local.inbound);
            peer.send(MqttPacket::Connect(ConnectPacket { client_id: "graceful".to_string(), will: Some(will.clone()), ..Default::default() })).await;
            peer.next_packet().await;
            peer.send(MqttPacket::Disconnect(DisconnectPacket {})).await;
            peer.expect_closed().await;
            assert_eq!(ConnectionState::Completed, connection.state());

            // a dropped transport releases it
            let (local, mut peer) = make_test_peer();
            server.accept(local.transport, local.inbound);
            peer.send(MqttPacket::Connect(ConnectPacket { client_id: "abrupt".to_string(), will: Some(will), ..Default::default() })).await;
            peer.next_packet().await;
            peer.transport.close();

            assert_eq!(Some("last/words".to_string()), tokio::time::timeout(Duration::from_secs(5), wills.recv()).await.unwrap());
            assert!(wills.try_recv().is_err());
        });
    }

    #[test]
    fn clean_session_discarded_on_termination() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let server = make_server(&handle);
            let (terminated_sender, mut terminated) = mpsc::unbounded_channel();
            server.events().connection_terminated.sequential.add_listener(listener(move |event: Arc<ConnectionTerminated>| {
                let sender = terminated_sender.clone();
                async move { sender.send(event.state).unwrap(); }
            }));

            let client_id = random_client_id();
            let (_connection, _peer, _) = connect_peer(&server, &client_id, true).await;
            assert!(server.sessions().read(&client_id).unwrap().is_some());

            assert!(server.disconnect_client(&client_id));
            assert_eq!(Some(ConnectionState::Disposed), terminated.recv().await);
            assert!(server.sessions().read(&client_id).unwrap().is_none());
        });
    }
}
