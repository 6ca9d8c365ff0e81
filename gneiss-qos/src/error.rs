/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use crate::mqtt::{ConnectReturnCode, PacketType};

use std::error::Error;
use std::fmt;

/// Additional details about an OperationChannelFailure error variant
#[derive(Debug)]
pub struct OperationChannelFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ProtocolError error variant
#[derive(Debug)]
pub struct ProtocolErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionClosed error variant
#[derive(Debug)]
pub struct ConnectionClosedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an AckTimeoutExceeded error variant
#[derive(Debug)]
pub struct AckTimeoutExceededContext {

    /// type of the packet whose exchange timed out
    pub packet_type: PacketType,

    /// packet id correlating the exchange
    pub packet_id: u16,

    /// number of times the packet was written before giving up
    pub attempts: u32,
}

/// Additional details about a ResourceExhausted error variant
#[derive(Debug)]
pub struct ResourceExhaustedContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an AuthenticationFailed error variant
#[derive(Debug)]
pub struct AuthenticationFailedContext {

    /// client id presented in the rejected Connect packet
    pub client_id: String,
}

/// Additional details about a ConnectionRejected error variant
#[derive(Debug)]
pub struct ConnectionRejectedContext {

    /// return code of the Connack packet that rejected the connection
    pub return_code: ConnectReturnCode,
}

/// Additional details about a SessionNotFound error variant
#[derive(Debug)]
pub struct SessionNotFoundContext {

    /// client id with no session record
    pub client_id: String,
}

/// Additional details about a StorageFailure error variant
#[derive(Debug)]
pub struct StorageFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a PacketValidation error variant
#[derive(Debug)]
pub struct PacketValidationContext {

    /// type of packet that failed validation
    pub packet_type: PacketType,

    source: Box<dyn Error + Send + Sync + 'static>
}

/// Basic error type for the entire gneiss-qos crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum GneissError {

    /// Failure encountered while using an operation completion channel
    OperationChannelFailure(OperationChannelFailureContext),

    /// Peer behavior that violates the MQTT specification in a way that cannot be safely ignored.
    /// Always fatal to the connection it was observed on.
    ProtocolError(ProtocolErrorContext),

    /// Something happened that should never happen.  Always indicates a bug.
    InternalStateError(InternalStateErrorContext),

    /// The connection owning an operation was closed or disposed before the operation finished.
    /// Never retried.
    ConnectionClosed(ConnectionClosedContext),

    /// No matching acknowledgement arrived within the configured number of attempts.  Surfaced to
    /// the caller of the exchange; does not close the connection.
    AckTimeoutExceeded(AckTimeoutExceededContext),

    /// The packet id space for a client is fully outstanding.
    ResourceExhausted(ResourceExhaustedContext),

    /// Connect-time credential rejection.  A Connack with a rejection code has been sent and
    /// the connection is closed; no session state was touched.
    AuthenticationFailed(AuthenticationFailedContext),

    /// The remote endpoint answered a Connect with a failing Connack.
    ConnectionRejected(ConnectionRejectedContext),

    /// An operation required a session record that does not exist.
    SessionNotFound(SessionNotFoundContext),

    /// Error surfaced by a session or will repository backend.
    StorageFailure(StorageFailureContext),

    /// Generic error surfaced by the transport collaborator.
    TransportError(TransportErrorContext),

    /// An outbound packet violates the MQTT specification and was not sent.
    PacketValidation(PacketValidationContext),
}

impl GneissError {

    pub(crate) fn new_operation_channel_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::OperationChannelFailure(
            OperationChannelFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_protocol_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::ProtocolError(
            ProtocolErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_closed(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::ConnectionClosed(
            ConnectionClosedContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_ack_timeout_exceeded(packet_type: PacketType, packet_id: u16, attempts: u32) -> Self {
        GneissError::AckTimeoutExceeded(
            AckTimeoutExceededContext {
                packet_type,
                packet_id,
                attempts,
            }
        )
    }

    pub(crate) fn new_resource_exhausted(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::ResourceExhausted(
            ResourceExhaustedContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_authentication_failed(client_id: &str) -> Self {
        GneissError::AuthenticationFailed(
            AuthenticationFailedContext {
                client_id: client_id.to_string()
            }
        )
    }

    pub(crate) fn new_connection_rejected(return_code: ConnectReturnCode) -> Self {
        GneissError::ConnectionRejected(
            ConnectionRejectedContext {
                return_code
            }
        )
    }

    pub(crate) fn new_session_not_found(client_id: &str) -> Self {
        GneissError::SessionNotFound(
            SessionNotFoundContext {
                client_id: client_id.to_string()
            }
        )
    }

    /// Constructs a new StorageFailure variant from an existing error.  Intended for use by
    /// repository implementations backed by durable storage.
    pub fn new_storage_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::StorageFailure(
            StorageFailureContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new TransportError variant from an existing error.  Typically this should be
    /// an error surfacing from a third-party transport library.
    pub fn new_transport_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::TransportError(
            TransportErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_packet_validation(packet_type: PacketType, source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        GneissError::PacketValidation(
            PacketValidationContext {
                packet_type,
                source : source.into()
            }
        )
    }

    /// Returns true if this error should tear down the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, GneissError::AckTimeoutExceeded(_) | GneissError::PacketValidation(_))
    }
}

impl Error for GneissError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GneissError::OperationChannelFailure(context) => {
                Some(context.source.as_ref())
            }
            GneissError::ProtocolError(context) => {
                Some(context.source.as_ref())
            }
            GneissError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            GneissError::ConnectionClosed(context) => {
                Some(context.source.as_ref())
            }
            GneissError::ResourceExhausted(context) => {
                Some(context.source.as_ref())
            }
            GneissError::StorageFailure(context) => {
                Some(context.source.as_ref())
            }
            GneissError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            GneissError::PacketValidation(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for GneissError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GneissError::OperationChannelFailure(_) => {
                write!(f, "failure encountered while sending/receiving on an operation completion channel")
            }
            GneissError::ProtocolError(_) => {
                write!(f, "peer behavior disallowed by the mqtt spec")
            }
            GneissError::InternalStateError(_) => {
                write!(f, "reached an invalid internal state; almost certainly a bug")
            }
            GneissError::ConnectionClosed(_) => {
                write!(f, "connection was closed; source contains further details")
            }
            GneissError::AckTimeoutExceeded(context) => {
                write!(f, "no response to {} ({}) after {} attempt(s)", context.packet_type, context.packet_id, context.attempts)
            }
            GneissError::ResourceExhausted(_) => {
                write!(f, "packet id space exhausted")
            }
            GneissError::AuthenticationFailed(context) => {
                write!(f, "client \"{}\" failed authentication", context.client_id)
            }
            GneissError::ConnectionRejected(context) => {
                write!(f, "connection rejected with return code {}", context.return_code)
            }
            GneissError::SessionNotFound(context) => {
                write!(f, "no session exists for client \"{}\"", context.client_id)
            }
            GneissError::StorageFailure(_) => {
                write!(f, "session storage failure; source contains further details")
            }
            GneissError::TransportError(_) => {
                write!(f, "transport error; source contains further details")
            }
            GneissError::PacketValidation(context) => {
                write!(f, "{} violates the mqtt spec", context.packet_type)
            }
        }
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for GneissError {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        GneissError::new_operation_channel_failure(err)
    }
}

/// Crate-wide result type for functions that can fail
pub type GneissResult<T> = Result<T, GneissError>;
