/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing miscellaneous conversion functions related to the MQTT packet model.
 */

use crate::error::{GneissError, GneissResult};
use crate::mqtt::*;

pub(crate) fn mqtt_packet_to_packet_type(packet: &MqttPacket) -> PacketType {
    match packet {
        MqttPacket::Connect(_) => { PacketType::Connect }
        MqttPacket::Connack(_) => { PacketType::Connack }
        MqttPacket::Publish(_) => { PacketType::Publish }
        MqttPacket::Puback(_) => { PacketType::Puback }
        MqttPacket::Pubrec(_) => { PacketType::Pubrec }
        MqttPacket::Pubrel(_) => { PacketType::Pubrel }
        MqttPacket::Pubcomp(_) => { PacketType::Pubcomp }
        MqttPacket::Subscribe(_) => { PacketType::Subscribe }
        MqttPacket::Suback(_) => { PacketType::Suback }
        MqttPacket::Unsubscribe(_) => { PacketType::Unsubscribe }
        MqttPacket::Unsuback(_) => { PacketType::Unsuback }
        MqttPacket::Pingreq(_) => { PacketType::Pingreq }
        MqttPacket::Pingresp(_) => { PacketType::Pingresp }
        MqttPacket::Disconnect(_) => { PacketType::Disconnect }
    }
}

/// Converts a protocol-encoded quality of service value into its enum form
pub fn convert_u8_to_quality_of_service(value: u8) -> GneissResult<QualityOfService> {
    match value {
        0 => { Ok(QualityOfService::AtMostOnce) }
        1 => { Ok(QualityOfService::AtLeastOnce) }
        2 => { Ok(QualityOfService::ExactlyOnce) }
        _ => {
            Err(GneissError::new_protocol_error(format!("invalid quality of service value {}", value)))
        }
    }
}

pub(crate) fn quality_of_service_to_str(qos: QualityOfService) -> &'static str {
    match qos {
        QualityOfService::AtMostOnce => { "AtMostOnce" }
        QualityOfService::AtLeastOnce => { "AtLeastOnce" }
        QualityOfService::ExactlyOnce => { "ExactlyOnce" }
    }
}

pub(crate) fn connect_return_code_to_str(return_code: ConnectReturnCode) -> &'static str {
    match return_code {
        ConnectReturnCode::Accepted => { "Accepted" }
        ConnectReturnCode::UnacceptableProtocolVersion => { "UnacceptableProtocolVersion" }
        ConnectReturnCode::IdentifierRejected => { "IdentifierRejected" }
        ConnectReturnCode::ServerUnavailable => { "ServerUnavailable" }
        ConnectReturnCode::BadUsernameOrPassword => { "BadUsernameOrPassword" }
        ConnectReturnCode::NotAuthorized => { "NotAuthorized" }
    }
}

pub(crate) fn suback_return_code_to_str(return_code: SubackReturnCode) -> &'static str {
    match return_code {
        SubackReturnCode::GrantedQos0 => { "GrantedQos0" }
        SubackReturnCode::GrantedQos1 => { "GrantedQos1" }
        SubackReturnCode::GrantedQos2 => { "GrantedQos2" }
        SubackReturnCode::Failure => { "Failure" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn quality_of_service_conversion() {
        assert_matches!(QualityOfService::try_from(0), Ok(QualityOfService::AtMostOnce));
        assert_matches!(QualityOfService::try_from(2), Ok(QualityOfService::ExactlyOnce));
        assert_matches!(QualityOfService::try_from(3), Err(GneissError::ProtocolError(_)));
    }
}
