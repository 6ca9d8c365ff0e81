/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Receiver side of the QoS handshakes.  A QoS 2 message is handed to the application only when its
PublishReceived record is first created, so retransmissions of the same publish are answered but
never redelivered.

Publishes are handled at the QoS they carry.  The maximum QoS option only caps what subscriptions
are granted: MQTT 3.1.1 has no way to tell a client to publish lower, and answering a QoS 2
publish with a Puback would leave the sender's handshake waiting for a Pubrec forever.
 */

use crate::connection::{MqttConnection, OutboundQueueType};
use crate::error::GneissResult;
use crate::events::ReceivedMessage;
use crate::flow::DeliveryContext;
use crate::mqtt::*;
use crate::session::{AcknowledgementType, PendingAcknowledgement};
use crate::validate::validate_publish_packet_inbound;

use log::*;

use std::sync::Arc;

async fn deliver(context: &DeliveryContext, client_id: String, publish: PublishPacket) {
    context.events.message_received.raise(ReceivedMessage {
        client_id,
        topic: publish.topic,
        payload: publish.payload,
        qos: publish.qos,
        retain: publish.retain,
    }).await;
}

/// Acknowledges and delivers an inbound publish according to its QoS
pub(crate) async fn receive_publish(context: &DeliveryContext, connection: &Arc<MqttConnection>, publish: PublishPacket) -> GneissResult<()> {
    validate_publish_packet_inbound(&publish)?;
    let client_id = connection.require_client_id()?;

    match (publish.qos, publish.packet_id) {
        (QualityOfService::AtLeastOnce, Some(packet_id)) => {
            connection.send(MqttPacket::Puback(PubackPacket { packet_id }), OutboundQueueType::Protocol).await?;
            deliver(context, client_id, publish).await;
        }
        (QualityOfService::ExactlyOnce, Some(packet_id)) => {
            let ack = PendingAcknowledgement { packet_id, ack_type: AcknowledgementType::PublishReceived };
            let first_receipt = context.sessions.try_add_pending_acknowledgement(&client_id, ack)?;

            // the receipt is recorded, so a failed Pubrec must not skip delivery; a retransmission
            // on a later connection will be treated as a duplicate
            let acknowledged = connection.send(MqttPacket::Pubrec(PubrecPacket { packet_id }), OutboundQueueType::Protocol).await;

            if first_receipt {
                deliver(context, client_id, publish).await;
            } else {
                debug!("receive - client \"{}\" publish {} already received, acknowledged again without delivery", client_id, packet_id);
            }

            acknowledged?;
        }
        _ => {
            deliver(context, client_id, publish).await;
        }
    }

    Ok(())
}

/// Completes the receiver side of a QoS 2 exchange.  A release with no matching record is
/// still answered.
pub(crate) async fn receive_pubrel(context: &DeliveryContext, connection: &Arc<MqttConnection>, pubrel: PubrelPacket) -> GneissResult<()> {
    let client_id = connection.require_client_id()?;
    let packet_id = pubrel.packet_id;

    if !context.sessions.remove_pending_acknowledgement(&client_id, packet_id, AcknowledgementType::PublishReceived)? {
        debug!("receive - client \"{}\" release {} has no pending receipt", client_id, packet_id);
    }

    connection.send(MqttPacket::Pubcomp(PubcompPacket { packet_id }), OutboundQueueType::Protocol).await
}
