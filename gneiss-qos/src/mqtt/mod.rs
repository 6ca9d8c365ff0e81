/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Data model for the MQTT 3.1.1 control packets that the delivery engine consumes and produces.

Packets arrive already decoded from an external codec and leave as typed values for the same
codec to encode; nothing in this crate touches raw bytes.
 */

pub mod utils;

use crate::error::GneissError;

use std::fmt;

/// MQTT message delivery quality of service.
///
/// Enum values match the protocol encoding values.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No response is sent by the
    /// receiver and no retry is performed by the sender. The message arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,

    /// A level of service that ensures that the message arrives at the receiver exactly once.
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QualityOfService {
    type Error = GneissError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        utils::convert_u8_to_quality_of_service(value)
    }
}

/// Result code carried by a Connack packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ConnectReturnCode {

    /// Connection accepted
    #[default]
    Accepted = 0,

    /// The server does not support the requested protocol level
    UnacceptableProtocolVersion = 1,

    /// The client identifier is correct utf-8 but not allowed by the server
    IdentifierRejected = 2,

    /// The network connection has been made but the MQTT service is unavailable
    ServerUnavailable = 3,

    /// The data in the user name or password is malformed or rejected
    BadUsernameOrPassword = 4,

    /// The client is not authorized to connect
    NotAuthorized = 5,
}

/// Per-filter result code carried by a Suback packet.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SubackReturnCode {

    /// Subscription accepted with a maximum delivery QoS of 0
    #[default]
    GrantedQos0 = 0,

    /// Subscription accepted with a maximum delivery QoS of 1
    GrantedQos1 = 1,

    /// Subscription accepted with a maximum delivery QoS of 2
    GrantedQos2 = 2,

    /// Subscription rejected
    Failure = 128,
}

impl From<QualityOfService> for SubackReturnCode {
    fn from(qos: QualityOfService) -> Self {
        match qos {
            QualityOfService::AtMostOnce => SubackReturnCode::GrantedQos0,
            QualityOfService::AtLeastOnce => SubackReturnCode::GrantedQos1,
            QualityOfService::ExactlyOnce => SubackReturnCode::GrantedQos2,
        }
    }
}

/// A message a broker publishes on a client's behalf when the client disconnects abnormally.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Will {

    /// Topic the will message is published to
    pub topic: String,

    /// Will message body
    pub payload: Vec<u8>,

    /// Delivery quality of service of the will message
    pub qos: QualityOfService,

    /// Whether the will message should be retained
    pub retain: bool,
}

/// A single topic filter and the maximum QoS requested for messages matching it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Subscription {

    /// Topic filter to subscribe to
    pub topic_filter: String,

    /// Maximum QoS on which the subscriber will accept publish messages
    pub qos: QualityOfService,
}

impl Subscription {

    /// Creates a new subscription for a topic filter
    pub fn new(topic_filter: &str, qos: QualityOfService) -> Self {
        Subscription {
            topic_filter: topic_filter.to_string(),
            qos,
        }
    }
}

/// Data model of an MQTT CONNECT packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnectPacket {

    /// Client identifier; an empty value asks the server to assign one
    pub client_id: String,

    /// Whether any prior session state for this client id should be discarded
    pub clean_session: bool,

    /// Maximum time interval, in seconds, that is permitted to elapse between outbound packets.  Zero disables
    /// keep alive.
    pub keep_alive_interval_seconds: u16,

    /// Optional user name presented for authentication
    pub username: Option<String>,

    /// Optional password presented for authentication
    pub password: Option<Vec<u8>>,

    /// Optional message to publish on abnormal disconnect
    pub will: Option<Will>,
}

/// Data model of an MQTT CONNACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConnackPacket {

    /// True if the server resumed prior session state for the client id
    pub session_present: bool,

    /// Success indicator or failure reason for the connection attempt
    pub return_code: ConnectReturnCode,
}

/// Data model of an MQTT PUBLISH packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PublishPacket {

    /// Packet id correlating a QoS 1 or 2 exchange.  Must be absent for QoS 0.
    pub packet_id: Option<u16>,

    /// Topic the message is published to
    pub topic: String,

    /// Delivery quality of service
    pub qos: QualityOfService,

    /// True if this is a retransmission of an earlier attempt
    pub duplicate: bool,

    /// Whether the message should be retained by the broker
    pub retain: bool,

    /// Message body
    pub payload: Vec<u8>,
}

/// Data model of an MQTT PUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubackPacket {

    /// Id of the QoS 1 publish this packet is acknowledging
    pub packet_id: u16,
}

/// Data model of an MQTT PUBREC packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrecPacket {

    /// Id of the QoS 2 publish this packet is acknowledging
    pub packet_id: u16,
}

/// Data model of an MQTT PUBREL packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubrelPacket {

    /// Id of the QoS 2 publish this packet is releasing
    pub packet_id: u16,
}

/// Data model of an MQTT PUBCOMP packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PubcompPacket {

    /// Id of the QoS 2 publish this packet completes
    pub packet_id: u16,
}

/// Data model of an MQTT SUBSCRIBE packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubscribePacket {

    /// Packet id correlating the Suback response
    pub packet_id: u16,

    /// Topic filters to subscribe to
    pub subscriptions: Vec<Subscription>,
}

/// Data model of an MQTT SUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubackPacket {

    /// Id of the Subscribe packet this packet is acknowledging
    pub packet_id: u16,

    /// One result per requested subscription, in request order
    pub return_codes: Vec<SubackReturnCode>,
}

/// Data model of an MQTT UNSUBSCRIBE packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubscribePacket {

    /// Packet id correlating the Unsuback response
    pub packet_id: u16,

    /// Topic filters to remove
    pub topic_filters: Vec<String>,
}

/// Data model of an MQTT UNSUBACK packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UnsubackPacket {

    /// Id of the Unsubscribe packet this packet is acknowledging
    pub packet_id: u16,
}

/// Data model of an MQTT PINGREQ packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingreqPacket {}

/// Data model of an MQTT PINGRESP packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PingrespPacket {}

/// Data model of an MQTT DISCONNECT packet
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DisconnectPacket {}

/// Closed set of MQTT control packets.  Inbound dispatch matches on this exactly once.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MqttPacket {
    Connect(ConnectPacket),
    Connack(ConnackPacket),
    Publish(PublishPacket),
    Puback(PubackPacket),
    Pubrec(PubrecPacket),
    Pubrel(PubrelPacket),
    Pubcomp(PubcompPacket),
    Subscribe(SubscribePacket),
    Suback(SubackPacket),
    Unsubscribe(UnsubscribePacket),
    Unsuback(UnsubackPacket),
    Pingreq(PingreqPacket),
    Pingresp(PingrespPacket),
    Disconnect(DisconnectPacket),
}

impl MqttPacket {

    /// Returns the kind of this packet
    pub fn packet_type(&self) -> PacketType {
        utils::mqtt_packet_to_packet_type(self)
    }

    /// Returns the packet id this packet carries, if any.  Connack responses correlate on id 0.
    pub fn packet_id(&self) -> Option<u16> {
        match self {
            MqttPacket::Publish(publish) => publish.packet_id,
            MqttPacket::Puback(puback) => Some(puback.packet_id),
            MqttPacket::Pubrec(pubrec) => Some(pubrec.packet_id),
            MqttPacket::Pubrel(pubrel) => Some(pubrel.packet_id),
            MqttPacket::Pubcomp(pubcomp) => Some(pubcomp.packet_id),
            MqttPacket::Subscribe(subscribe) => Some(subscribe.packet_id),
            MqttPacket::Suback(suback) => Some(suback.packet_id),
            MqttPacket::Unsubscribe(unsubscribe) => Some(unsubscribe.packet_id),
            MqttPacket::Unsuback(unsuback) => Some(unsuback.packet_id),
            MqttPacket::Connack(_) => Some(0),
            _ => None,
        }
    }

    // only publishes carry a duplicate flag; other retransmissions go out unchanged
    pub(crate) fn mark_duplicate(&mut self) {
        if let MqttPacket::Publish(publish) = self {
            publish.duplicate = true;
        }
    }
}

/// An enum indicating the kind of MQTT packet
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Connect,
    Connack,
    Publish,
    Puback,
    Pubrec,
    Pubrel,
    Pubcomp,
    Subscribe,
    Suback,
    Unsubscribe,
    Unsuback,
    Pingreq,
    Pingresp,
    Disconnect,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Connect => { write!(f, "ConnectPacket") }
            PacketType::Connack => { write!(f, "ConnackPacket") }
            PacketType::Publish => { write!(f, "PublishPacket") }
            PacketType::Puback => { write!(f, "PubackPacket") }
            PacketType::Pubrec => { write!(f, "PubrecPacket") }
            PacketType::Pubrel => { write!(f, "PubrelPacket") }
            PacketType::Pubcomp => { write!(f, "PubcompPacket") }
            PacketType::Subscribe => { write!(f, "SubscribePacket") }
            PacketType::Suback => { write!(f, "SubackPacket") }
            PacketType::Unsubscribe => { write!(f, "UnsubscribePacket") }
            PacketType::Unsuback => { write!(f, "UnsubackPacket") }
            PacketType::Pingreq => { write!(f, "PingreqPacket") }
            PacketType::Pingresp => { write!(f, "PingrespPacket") }
            PacketType::Disconnect => { write!(f, "DisconnectPacket") }
        }
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", utils::quality_of_service_to_str(*self))
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", utils::connect_return_code_to_str(*self))
    }
}
