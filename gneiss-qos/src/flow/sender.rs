/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Sender side of the QoS handshakes.

QoS 1 and 2 messages are recorded as pending in the session before anything is written, so a
connection loss at any point leaves enough state behind to resume the handshake on the next
connection.  Retry exhaustion abandons the message and frees its packet id.
 */

use crate::connection::{MqttConnection, OutboundQueueType};
use crate::error::{GneissError, GneissResult};
use crate::flow::DeliveryContext;
use crate::mqtt::*;
use crate::retry::{begin_exchange, send_and_wait, PendingExchange};
use crate::session::{AcknowledgementType, ApplicationMessage, PendingAcknowledgement, PendingMessage, PendingMessageStatus};
use crate::validate::validate_publish_packet_outbound;

use log::*;
use tokio::sync::oneshot;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Terminal acknowledgement of a completed publish handshake
#[derive(Debug, Eq, PartialEq)]
pub enum PublishResponse {

    /// QoS 0 publishes complete once written
    Qos0,

    /// QoS 1 publishes complete on the matching Puback
    Qos1(PubackPacket),

    /// QoS 2 publishes complete on the matching Pubcomp
    Qos2(PubcompPacket),
}

impl fmt::Display for PublishResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PublishResponse::Qos0 => {
                write!(f, "PublishResponse Qos0")
            }
            PublishResponse::Qos1(puback) => {
                write!(f, "PublishResponse Qos1 ( {} )", puback)
            }
            PublishResponse::Qos2(pubcomp) => {
                write!(f, "PublishResponse Qos2 ( {} )", pubcomp)
            }
        }
    }
}

pub type PublishResult = GneissResult<PublishResponse>;

pub type AsyncPublishResult = Pin<Box<dyn Future<Output = PublishResult> + Send>>;

pub type AsyncStoredResult = Pin<Box<dyn Future<Output = GneissResult<()>> + Send>>;

/// The two completions of a publish.  Either may be awaited independently of the other.
pub struct PublishHandle {

    /// Resolves once the message has been recorded in the session (immediately for QoS 0)
    pub stored: AsyncStoredResult,

    /// Resolves once the QoS handshake has finished
    pub completed: AsyncPublishResult,
}

impl fmt::Debug for PublishHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublishHandle {{ .. }}")
    }
}

impl PublishHandle {

    fn new(stored: oneshot::Receiver<GneissResult<()>>, completed: oneshot::Receiver<PublishResult>) -> Self {
        PublishHandle {
            stored: Box::pin(async move { stored.await? }),
            completed: Box::pin(async move { completed.await? }),
        }
    }

    pub(crate) fn failed(error: GneissError) -> Self {
        let (stored_sender, stored) = oneshot::channel();
        let (completed_sender, completed) = oneshot::channel();
        let _ = completed_sender.send(Err(error));
        drop(stored_sender);
        PublishHandle::new(stored, completed)
    }

    // recorded for delivery on a later connection; this call's handshake will not happen
    pub(crate) fn saved() -> Self {
        let (stored_sender, stored) = oneshot::channel();
        let (completed_sender, completed) = oneshot::channel();
        let _ = stored_sender.send(Ok(()));
        let _ = completed_sender.send(Err(GneissError::new_connection_closed("not connected; message saved for the next connection")));
        PublishHandle::new(stored, completed)
    }

    /// Waits for the full handshake
    pub async fn complete(self) -> PublishResult {
        self.completed.await
    }
}

fn build_publish(message: &ApplicationMessage, packet_id: Option<u16>, duplicate: bool) -> PublishPacket {
    PublishPacket {
        packet_id,
        topic: message.topic.clone(),
        qos: message.qos,
        duplicate,
        retain: message.retain,
        payload: message.payload.clone(),
    }
}

fn expected_response(qos: QualityOfService) -> PacketType {
    match qos {
        QualityOfService::ExactlyOnce => { PacketType::Pubrec }
        _ => { PacketType::Puback }
    }
}

/// Starts delivery of an application message on a connection.  Everything that fixes the
/// message's place in the outbound order happens before this returns.
pub(crate) fn publish_message(context: &Arc<DeliveryContext>, connection: &Arc<MqttConnection>, client_id: &str, message: ApplicationMessage, queue: OutboundQueueType) -> PublishHandle {
    if message.qos == QualityOfService::AtMostOnce {
        let publish = build_publish(&message, None, false);
        if let Err(error) = validate_publish_packet_outbound(&publish) {
            return PublishHandle::failed(error);
        }

        let written = connection.submit(MqttPacket::Publish(publish), queue);
        let (stored_sender, stored) = oneshot::channel();
        let _ = stored_sender.send(Ok(()));

        return PublishHandle {
            stored: Box::pin(async move { stored.await? }),
            completed: Box::pin(async move {
                written.wait().await?;
                Ok(PublishResponse::Qos0)
            }),
        };
    }

    if let Err(error) = validate_publish_packet_outbound(&build_publish(&message, Some(1), false)) {
        return PublishHandle::failed(error);
    }

    let packet_id = match context.packet_ids.allocate(client_id) {
        Ok(packet_id) => { packet_id }
        Err(error) => { return PublishHandle::failed(error); }
    };

    let publish = build_publish(&message, Some(packet_id), false);
    let pending = PendingMessage {
        message,
        duplicate: false,
        packet_id: Some(packet_id),
        status: PendingMessageStatus::PendingToSend,
    };

    if let Err(error) = context.sessions.add_pending_message(client_id, pending) {
        context.packet_ids.free(client_id, packet_id);
        return PublishHandle::failed(error);
    }

    let (stored_sender, stored) = oneshot::channel();
    let _ = stored_sender.send(Ok(()));

    let (completed_sender, completed) = oneshot::channel();
    let completion = start_publish_exchange(context, connection, client_id, publish, queue);
    context.runtime.spawn(async move {
        let _ = completed_sender.send(completion.await);
    });

    PublishHandle::new(stored, completed)
}

/// Resends a pending message under its original packet id with the duplicate flag set and
/// continues its handshake.
pub(crate) fn resume_pending_message(context: &Arc<DeliveryContext>, connection: &Arc<MqttConnection>, client_id: &str, pending: PendingMessage) {
    let Some(packet_id) = pending.packet_id else {
        warn!("replay - client \"{}\" pending message on \"{}\" has no packet id, skipping", client_id, pending.message.topic);
        return;
    };

    info!("replay - client \"{}\" resuming publish {} on connection {}", client_id, packet_id, connection.id());
    let publish = build_publish(&pending.message, Some(packet_id), true);
    let completion = start_publish_exchange(context, connection, client_id, publish, OutboundQueueType::Protocol);
    let client_id = client_id.to_string();
    context.runtime.spawn(async move {
        if let Err(error) = completion.await {
            debug!("replay - client \"{}\" resumed publish {} did not complete: {}", client_id, packet_id, error);
        }
    });
}

/// Resends the Pubrel we still owe for a QoS 2 message and waits for its Pubcomp
pub(crate) fn resume_release(context: &Arc<DeliveryContext>, connection: &Arc<MqttConnection>, client_id: &str, packet_id: u16) {
    info!("replay - client \"{}\" resending release {} on connection {}", client_id, packet_id, connection.id());
    let pubrel = MqttPacket::Pubrel(PubrelPacket { packet_id });
    let exchange = begin_exchange(connection, pubrel, PacketType::Pubcomp, OutboundQueueType::Protocol);
    let context = context.clone();
    let client_id = client_id.to_string();
    let runtime = context.runtime.clone();
    runtime.spawn(async move {
        let result = match exchange {
            Ok(exchange) => { finish_release(&context, &client_id, packet_id, exchange).await }
            Err(error) => { Err(error) }
        };

        if let Err(error) = settle(&context, &client_id, packet_id, result) {
            debug!("replay - client \"{}\" resumed release {} did not complete: {}", client_id, packet_id, error);
        }
    });
}

// Queues the publish and returns a future that drives the rest of the handshake
fn start_publish_exchange(context: &Arc<DeliveryContext>, connection: &Arc<MqttConnection>, client_id: &str, publish: PublishPacket, queue: OutboundQueueType) -> impl Future<Output = PublishResult> + Send + 'static {
    let packet_id = publish.packet_id.unwrap_or(0);
    let qos = publish.qos;
    let exchange = begin_exchange(connection, MqttPacket::Publish(publish), expected_response(qos), queue);
    let context = context.clone();
    let connection = connection.clone();
    let client_id = client_id.to_string();

    async move {
        let result = match exchange {
            Ok(exchange) => { drive_publish(&context, &connection, &client_id, packet_id, exchange).await }
            Err(error) => { Err(error) }
        };

        settle(&context, &client_id, packet_id, result)
    }
}

async fn drive_publish(context: &Arc<DeliveryContext>, connection: &Arc<MqttConnection>, client_id: &str, packet_id: u16, mut exchange: PendingExchange) -> PublishResult {
    exchange.written().await?;
    context.sessions.set_pending_message_status(client_id, packet_id, PendingMessageStatus::PendingToAcknowledge)?;

    match exchange.response().await? {
        MqttPacket::Puback(puback) => {
            context.sessions.remove_pending_message(client_id, packet_id)?;
            context.packet_ids.free(client_id, packet_id);
            debug!("publish - client \"{}\" publish {} acknowledged", client_id, packet_id);
            Ok(PublishResponse::Qos1(puback))
        }
        MqttPacket::Pubrec(_) => {
            context.sessions.remove_pending_message(client_id, packet_id)?;
            context.sessions.try_add_pending_acknowledgement(client_id, PendingAcknowledgement { packet_id, ack_type: AcknowledgementType::PublishRelease })?;

            let pubrel = MqttPacket::Pubrel(PubrelPacket { packet_id });
            let exchange = begin_exchange(connection, pubrel, PacketType::Pubcomp, OutboundQueueType::Protocol)?;
            finish_release(context, client_id, packet_id, exchange).await
        }
        other => {
            Err(GneissError::new_internal_state_error(format!("publish exchange resolved by unexpected {}", other.packet_type())))
        }
    }
}

async fn finish_release(context: &Arc<DeliveryContext>, client_id: &str, packet_id: u16, exchange: PendingExchange) -> PublishResult {
    match exchange.response().await? {
        MqttPacket::Pubcomp(pubcomp) => {
            context.sessions.remove_pending_acknowledgement(client_id, packet_id, AcknowledgementType::PublishRelease)?;
            context.packet_ids.free(client_id, packet_id);
            debug!("publish - client \"{}\" publish {} completed", client_id, packet_id);
            Ok(PublishResponse::Qos2(pubcomp))
        }
        other => {
            Err(GneissError::new_internal_state_error(format!("release exchange resolved by unexpected {}", other.packet_type())))
        }
    }
}

// A closed connection leaves the handshake state in place for the next connection to resume.
// Every other failure abandons the message and releases its packet id.
fn settle(context: &DeliveryContext, client_id: &str, packet_id: u16, result: PublishResult) -> PublishResult {
    match &result {
        Ok(_) | Err(GneissError::ConnectionClosed(_)) => {}
        Err(error) => {
            warn!("publish - client \"{}\" abandoning publish {}: {}", client_id, packet_id, error);
            let _ = context.sessions.remove_pending_message(client_id, packet_id);
            let _ = context.sessions.remove_pending_acknowledgement(client_id, packet_id, AcknowledgementType::PublishRelease);
            context.packet_ids.free(client_id, packet_id);
        }
    }

    result
}

/// Runs a subscribe or unsubscribe exchange under a freshly allocated packet id
pub(crate) async fn subscription_exchange(context: &DeliveryContext, connection: &Arc<MqttConnection>, client_id: &str, build: impl FnOnce(u16) -> MqttPacket, response_type: PacketType) -> GneissResult<MqttPacket> {
    let packet_id = context.packet_ids.allocate(client_id)?;
    let result = send_and_wait(connection, build(packet_id), response_type, OutboundQueueType::Application).await;
    context.packet_ids.free(client_id, packet_id);
    result
}
