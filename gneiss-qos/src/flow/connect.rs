/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Session presence decisions on connect, and replay of outstanding work onto the new connection.

Replay only queues packets; it never waits.  Callers queue the connect response first and mark
the connection ready afterwards, so the peer sees the connect response, then the replayed
packets in their original order, then new application traffic.
 */

use crate::connection::{MqttConnection, OutboundQueueType};
use crate::error::GneissResult;
use crate::flow::DeliveryContext;
use crate::flow::sender::{publish_message, resume_pending_message, resume_release};
use crate::mqtt::*;
use crate::session::{AcknowledgementType, ClientSession, ConnectionWill, ReconciledSession, Repository, SessionStore};

use log::*;

use std::sync::Arc;

/// Applies a connect's clean-session flag and will to the stored state for a client id
pub struct ConnectReconciliation {
    sessions: Arc<SessionStore>,
    wills: Arc<dyn Repository<ConnectionWill>>,
}

impl ConnectReconciliation {

    /// Creates a reconciler over the given session store and will repository
    pub fn new(sessions: Arc<SessionStore>, wills: Arc<dyn Repository<ConnectionWill>>) -> Self {
        ConnectReconciliation {
            sessions,
            wills,
        }
    }

    /// Decides session presence and records the connect's will, replacing any earlier one.
    pub fn reconcile_connect(&self, client_id: &str, clean_session: bool, will: Option<Will>) -> GneissResult<ReconciledSession> {
        let reconciled = self.sessions.reconcile(client_id, clean_session)?;

        match will {
            Some(will) => {
                self.wills.upsert(ConnectionWill { client_id: client_id.to_string(), will })?;
            }
            None => {
                self.wills.delete(client_id)?;
            }
        }

        info!("reconcile - client \"{}\" clean={} session_present={}", client_id, clean_session, reconciled.session_present);
        Ok(reconciled)
    }

    /// Removes and returns the will stored for a client id
    pub fn take_will(&self, client_id: &str) -> GneissResult<Option<ConnectionWill>> {
        let will = self.wills.read(client_id)?;
        if will.is_some() {
            self.wills.delete(client_id)?;
        }

        Ok(will)
    }

    /// Discards the will stored for a client id, returning whether there was one
    pub fn delete_will(&self, client_id: &str) -> GneissResult<bool> {
        self.wills.delete(client_id)
    }
}

/// Queues every offline-saved message as a fresh exchange, in enqueue order
pub(crate) fn send_saved_messages(context: &Arc<DeliveryContext>, connection: &Arc<MqttConnection>, client_id: &str) -> GneissResult<usize> {
    let saved = context.sessions.take_saved_messages(client_id)?;
    let count = saved.len();

    for message in saved {
        debug!("replay - client \"{}\" sending saved message on \"{}\"", client_id, message.topic);
        // completion is observed by the exchange's own bookkeeping
        drop(publish_message(context, connection, client_id, message, OutboundQueueType::Protocol));
    }

    Ok(count)
}

/// Queues the replay of a resumed session: saved messages, then in-flight messages under their
/// original ids, then owed acknowledgements.
pub(crate) fn replay_session(context: &Arc<DeliveryContext>, connection: &Arc<MqttConnection>, session: &ClientSession) -> GneissResult<()> {
    let client_id = session.client_id.as_str();

    for packet_id in session.outstanding_packet_ids() {
        context.packet_ids.mark_outstanding(client_id, packet_id)?;
    }

    let saved = send_saved_messages(context, connection, client_id)?;

    for pending in session.pending_messages.iter() {
        resume_pending_message(context, connection, client_id, pending.clone());
    }

    for ack in session.pending_acknowledgements.iter() {
        match ack.ack_type {
            AcknowledgementType::PublishRelease => {
                resume_release(context, connection, client_id, ack.packet_id);
            }
            AcknowledgementType::PublishReceived => {
                debug!("replay - client \"{}\" resending receipt {}", client_id, ack.packet_id);
                drop(connection.submit(MqttPacket::Pubrec(PubrecPacket { packet_id: ack.packet_id }), OutboundQueueType::Protocol));
            }
        }
    }

    info!("replay - client \"{}\" on connection {}: {} saved, {} in flight, {} owed acknowledgement(s)",
        client_id, connection.id(), saved, session.pending_messages.len(), session.pending_acknowledgements.len());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryOptions;
    use crate::retry::RetryPolicy;
    use crate::session::*;
    use crate::testing::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn make_reconciler() -> ConnectReconciliation {
        ConnectReconciliation::new(Arc::new(SessionStore::new_in_memory()), Arc::new(InMemoryRepository::<ConnectionWill>::new()))
    }

    fn make_will(topic: &str) -> Will {
        Will {
            topic: topic.to_string(),
            payload: "gone".as_bytes().to_vec(),
            qos: QualityOfService::AtLeastOnce,
            retain: false,
        }
    }

    #[test]
    fn session_presence_rules() {
        let reconciler = make_reconciler();

        assert!(!reconciler.reconcile_connect("c", false, None).unwrap().session_present);
        assert!(reconciler.reconcile_connect("c", false, None).unwrap().session_present);
        assert!(!reconciler.reconcile_connect("c", true, None).unwrap().session_present);

        // a clean connect for an unknown id still creates a session
        assert!(!reconciler.reconcile_connect("d", true, None).unwrap().session_present);
        assert!(reconciler.sessions.read("d").unwrap().is_some());
    }

    #[test]
    fn will_is_replaced_and_removed() {
        let reconciler = make_reconciler();

        reconciler.reconcile_connect("c", false, Some(make_will("first"))).unwrap();
        reconciler.reconcile_connect("c", false, Some(make_will("second"))).unwrap();
        assert_eq!("second", reconciler.wills.read("c").unwrap().unwrap().will.topic);

        assert_eq!("second", reconciler.take_will("c").unwrap().unwrap().will.topic);
        assert!(reconciler.take_will("c").unwrap().is_none());

        reconciler.reconcile_connect("c", false, Some(make_will("third"))).unwrap();
        reconciler.reconcile_connect("c", false, None).unwrap();
        assert!(!reconciler.delete_will("c").unwrap());
    }

    #[test]
    fn replay_order_and_flags() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let context = Arc::new(DeliveryContext::new(Arc::new(SessionStore::new_in_memory()), DeliveryOptions::default(), handle.clone()));
            let (connection, mut peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_secs(5), 3));
            let client_id = random_client_id();

            context.sessions.reconcile(&client_id, false).unwrap();
            context.sessions.save_message(&client_id, ApplicationMessage::new("saved", "s".as_bytes(), QualityOfService::AtLeastOnce, false)).unwrap();
            context.sessions.add_pending_message(&client_id, PendingMessage {
                message: ApplicationMessage::new("pending", "p".as_bytes(), QualityOfService::AtLeastOnce, false),
                duplicate: false,
                packet_id: Some(1),
                status: PendingMessageStatus::PendingToSend,
            }).unwrap();
            context.sessions.try_add_pending_acknowledgement(&client_id, PendingAcknowledgement { packet_id: 2, ack_type: AcknowledgementType::PublishRelease }).unwrap();
            context.sessions.try_add_pending_acknowledgement(&client_id, PendingAcknowledgement { packet_id: 30, ack_type: AcknowledgementType::PublishReceived }).unwrap();

            let session = context.sessions.reconcile(&client_id, false).unwrap().resumed.unwrap();
            replay_session(&context, &connection, &session).unwrap();

            // the saved message must not reuse ids 1 or 2
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(3), duplicate: false, .. }));
            assert_matches!(peer.next_packet().await, MqttPacket::Publish(PublishPacket { packet_id: Some(1), duplicate: true, .. }));
            assert_matches!(peer.next_packet().await, MqttPacket::Pubrel(PubrelPacket { packet_id: 2 }));
            assert_matches!(peer.next_packet().await, MqttPacket::Pubrec(PubrecPacket { packet_id: 30 }));

            assert!(context.sessions.read(&client_id).unwrap().unwrap().saved_messages.is_empty());

            assert!(connection.retry().complete(MqttPacket::Pubcomp(PubcompPacket { packet_id: 2 })).is_none());
            assert!(connection.retry().complete(MqttPacket::Puback(PubackPacket { packet_id: 1 })).is_none());
            assert!(connection.retry().complete(MqttPacket::Puback(PubackPacket { packet_id: 3 })).is_none());

            tokio::time::sleep(Duration::from_millis(100)).await;
            let session = context.sessions.read(&client_id).unwrap().unwrap();
            assert!(session.pending_messages.is_empty());
            assert_eq!(vec![PendingAcknowledgement { packet_id: 30, ack_type: AcknowledgementType::PublishReceived }], session.pending_acknowledgements);
            assert!(!context.packet_ids.is_outstanding(&client_id, 1));
            assert!(!context.packet_ids.is_outstanding(&client_id, 2));
        });
    }
}
