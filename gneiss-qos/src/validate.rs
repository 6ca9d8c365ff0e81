/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

use crate::error::{GneissError, GneissResult};
use crate::mqtt::*;

use log::*;

pub(crate) const MAXIMUM_STRING_PROPERTY_LENGTH : usize = 65535;

fn check_publish_packet_id(publish: &PublishPacket) -> Option<&'static str> {
    match (publish.qos, publish.packet_id) {
        (QualityOfService::AtMostOnce, Some(_)) => { Some("qos 0 publish must not carry a packet id") }
        (QualityOfService::AtMostOnce, None) => { None }
        (_, None) | (_, Some(0)) => { Some("qos 1 and qos 2 publishes require a non-zero packet id") }
        (_, Some(_)) => { None }
    }
}

pub(crate) fn validate_string_length(value: &str, packet_type: PacketType, function_name: &str, field_name: &str) -> GneissResult<()> {
    if value.len() > MAXIMUM_STRING_PROPERTY_LENGTH {
        let message = format!("{} - {} string field too long", function_name, field_name);
        error!("{}", message);
        return Err(GneissError::new_packet_validation(packet_type, message));
    }

    Ok(())
}

fn validate_topic_name(topic: &str, function_name: &str) -> GneissResult<()> {
    validate_string_length(topic, PacketType::Publish, function_name, "topic")?;

    if topic.is_empty() {
        let message = format!("{} - empty topic", function_name);
        error!("{}", message);
        return Err(GneissError::new_packet_validation(PacketType::Publish, message));
    }

    if topic.contains(['+', '#']) {
        let message = format!("{} - topic \"{}\" contains wildcard characters", function_name, topic);
        error!("{}", message);
        return Err(GneissError::new_packet_validation(PacketType::Publish, message));
    }

    Ok(())
}

fn validate_topic_filters<'a>(filters: impl ExactSizeIterator<Item = &'a str>, packet_type: PacketType, function_name: &str) -> GneissResult<()> {
    if filters.len() == 0 {
        let message = format!("{} - at least one topic filter is required", function_name);
        error!("{}", message);
        return Err(GneissError::new_packet_validation(packet_type, message));
    }

    for filter in filters {
        validate_string_length(filter, packet_type, function_name, "topic_filter")?;
        if filter.is_empty() {
            let message = format!("{} - empty topic filter", function_name);
            error!("{}", message);
            return Err(GneissError::new_packet_validation(packet_type, message));
        }
    }

    Ok(())
}

/// Checks a locally-originated publish before any state is recorded for it.
pub(crate) fn validate_publish_packet_outbound(publish: &PublishPacket) -> GneissResult<()> {
    validate_topic_name(&publish.topic, "validate_publish_packet_outbound")?;

    if let Some(message) = check_publish_packet_id(publish) {
        error!("validate_publish_packet_outbound - {}", message);
        return Err(GneissError::new_packet_validation(PacketType::Publish, message));
    }

    Ok(())
}

/// Checks the packet id rule on a publish received from the peer.  Failures are protocol errors
/// and therefore fatal to the connection.
pub(crate) fn validate_publish_packet_inbound(publish: &PublishPacket) -> GneissResult<()> {
    if let Some(message) = check_publish_packet_id(publish) {
        error!("validate_publish_packet_inbound - {}", message);
        return Err(GneissError::new_protocol_error(message));
    }

    if publish.topic.is_empty() || publish.topic.contains(['+', '#']) {
        error!("validate_publish_packet_inbound - invalid topic \"{}\"", publish.topic);
        return Err(GneissError::new_protocol_error("inbound publish has an invalid topic"));
    }

    Ok(())
}

pub(crate) fn validate_subscribe_packet_outbound(subscribe: &SubscribePacket) -> GneissResult<()> {
    validate_topic_filters(subscribe.subscriptions.iter().map(|subscription| subscription.topic_filter.as_str()), PacketType::Subscribe, "validate_subscribe_packet_outbound")
}

pub(crate) fn validate_unsubscribe_packet_outbound(unsubscribe: &UnsubscribePacket) -> GneissResult<()> {
    validate_topic_filters(unsubscribe.topic_filters.iter().map(|filter| filter.as_str()), PacketType::Unsubscribe, "validate_unsubscribe_packet_outbound")
}

/// Subscribe packets with no filters are malformed per the protocol.
pub(crate) fn validate_subscribe_packet_inbound(subscribe: &SubscribePacket) -> GneissResult<()> {
    validate_subscribe_packet_outbound(subscribe).map_err(|_| { GneissError::new_protocol_error("malformed inbound SubscribePacket") })
}

pub(crate) fn validate_unsubscribe_packet_inbound(unsubscribe: &UnsubscribePacket) -> GneissResult<()> {
    validate_unsubscribe_packet_outbound(unsubscribe).map_err(|_| { GneissError::new_protocol_error("malformed inbound UnsubscribePacket") })
}
