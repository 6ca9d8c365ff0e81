/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Per-client session state and the storage abstraction behind it.

Session records are kept in a [`Repository`], a keyed record store with
read/create/update/delete operations.  [`InMemoryRepository`] is the default backend; a durable
backend can be substituted without touching any protocol logic.

[`SessionStore`] layers per-client serialization on top of a repository: every mutation for a
client id runs under that client's lock, while different client ids never contend.
 */

mod memory;

pub use memory::InMemoryRepository;

use crate::error::{GneissError, GneissResult};
use crate::mqtt::{QualityOfService, Subscription, Will};

use log::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A record that can be kept in a [`Repository`]
pub trait StorageRecord : Clone + Send + Sync + 'static {

    /// Key the record is stored under
    fn id(&self) -> &str;
}

/// Keyed record store used for session and will persistence
pub trait Repository<T: StorageRecord> : Send + Sync {

    /// Returns the record stored under an id, if any
    fn read(&self, id: &str) -> GneissResult<Option<T>>;

    /// Stores a new record.  Fails if a record already exists under the same id.
    fn create(&self, record: T) -> GneissResult<()>;

    /// Replaces an existing record.  Fails if no record exists under the same id.
    fn update(&self, record: T) -> GneissResult<()>;

    /// Removes a record, returning whether one existed
    fn delete(&self, id: &str) -> GneissResult<bool>;

    /// Creates or replaces a record
    fn upsert(&self, record: T) -> GneissResult<()> {
        if self.read(record.id())?.is_some() {
            self.update(record)
        } else {
            self.create(record)
        }
    }
}

/// An application-level message: what gets published, independent of any packet id or
/// retransmission state.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ApplicationMessage {

    /// Topic the message is published to
    pub topic: String,

    /// Message body
    pub payload: Vec<u8>,

    /// Requested delivery quality of service
    pub qos: QualityOfService,

    /// Whether the message should be retained
    pub retain: bool,
}

impl ApplicationMessage {

    /// Creates a new application message
    pub fn new(topic: &str, payload: &[u8], qos: QualityOfService, retain: bool) -> Self {
        ApplicationMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        }
    }
}

/// Progress of an outbound QoS 1/2 message that has been recorded in a session
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingMessageStatus {

    /// Recorded but not yet written to a connection
    PendingToSend,

    /// Written at least once; waiting for the peer's acknowledgement
    PendingToAcknowledge,
}

/// An outbound QoS 1/2 message whose handshake has not resolved yet
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingMessage {

    /// The message being delivered
    pub message: ApplicationMessage,

    /// True once the message has been written at least once
    pub duplicate: bool,

    /// Packet id bound to the exchange
    pub packet_id: Option<u16>,

    /// Handshake progress
    pub status: PendingMessageStatus,
}

/// Kind of reply the local side still owes for a QoS 2 exchange
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AcknowledgementType {

    /// Receiver role: a Pubrec was sent and the peer's Pubrel has not arrived yet
    PublishReceived,

    /// Sender role: a Pubrec arrived and our Pubrel has not been completed yet
    PublishRelease,
}

/// A reply that must be remembered across reconnects until the next protocol step acknowledges it
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PendingAcknowledgement {

    /// Packet id of the exchange
    pub packet_id: u16,

    /// Reply owed
    pub ack_type: AcknowledgementType,
}

/// Persisted per-client delivery state
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClientSession {

    /// Client id the session belongs to
    pub client_id: String,

    /// Clean flag of the connection that created or last resumed this session
    pub clean: bool,

    /// Active subscriptions, at most one per topic filter
    pub subscriptions: Vec<Subscription>,

    /// In-flight outbound messages, in enqueue order
    pub pending_messages: Vec<PendingMessage>,

    /// Owed QoS 2 replies, in enqueue order
    pub pending_acknowledgements: Vec<PendingAcknowledgement>,

    /// Messages queued while the client was offline, in enqueue order
    pub saved_messages: Vec<ApplicationMessage>,
}

impl ClientSession {

    /// Creates an empty session
    pub fn new(client_id: &str, clean: bool) -> Self {
        ClientSession {
            client_id: client_id.to_string(),
            clean,
            ..Default::default()
        }
    }

    /// Returns true if an acknowledgement of the given type is owed for a packet id
    pub fn has_pending_acknowledgement(&self, packet_id: u16, ack_type: AcknowledgementType) -> bool {
        self.pending_acknowledgements.iter().any(|ack| ack.packet_id == packet_id && ack.ack_type == ack_type)
    }

    /// Packet ids from the local id space still bound to unresolved exchanges
    pub fn outstanding_packet_ids(&self) -> Vec<u16> {
        let pending = self.pending_messages.iter().filter_map(|pending| pending.packet_id);
        let releases = self.pending_acknowledgements.iter()
            .filter(|ack| ack.ack_type == AcknowledgementType::PublishRelease)
            .map(|ack| ack.packet_id);

        pending.chain(releases).collect()
    }
}

impl StorageRecord for ClientSession {
    fn id(&self) -> &str { self.client_id.as_str() }
}

/// Will message persisted for a connected client
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionWill {

    /// Client id the will belongs to
    pub client_id: String,

    /// The will message
    pub will: Will,
}

impl StorageRecord for ConnectionWill {
    fn id(&self) -> &str { self.client_id.as_str() }
}

/// Outcome of reconciling a connect against stored session state
#[derive(Clone, Debug)]
pub struct ReconciledSession {

    /// Value to report in the Connack
    pub session_present: bool,

    /// The resumed session when one pre-existed and was kept
    pub resumed: Option<ClientSession>,
}

/// Per-client serialized access to session records
pub struct SessionStore {
    repository: Arc<dyn Repository<ClientSession>>,
    client_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {

    /// Creates a session store over an existing repository
    pub fn new(repository: Arc<dyn Repository<ClientSession>>) -> Self {
        SessionStore {
            repository,
            client_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a session store backed by an in-memory repository
    pub fn new_in_memory() -> Self {
        SessionStore::new(Arc::new(InMemoryRepository::<ClientSession>::new()))
    }

    fn client_lock(&self, client_id: &str) -> GneissResult<Arc<Mutex<()>>> {
        let mut locks = self.client_locks.lock().map_err(|_| { GneissError::new_internal_state_error("session lock table poisoned") })?;
        Ok(locks.entry(client_id.to_string()).or_default().clone())
    }

    // the lock entry can only be dropped while nobody else holds a clone of it
    fn prune_client_lock(&self, client_id: &str) {
        if let Ok(mut locks) = self.client_locks.lock() {
            if locks.get(client_id).map_or(false, |lock| Arc::strong_count(lock) == 1) {
                locks.remove(client_id);
            }
        }
    }

    fn with_client<R>(&self, client_id: &str, f: impl FnOnce(&dyn Repository<ClientSession>) -> GneissResult<R>) -> GneissResult<R> {
        let lock = self.client_lock(client_id)?;
        let result = {
            let _guard = lock.lock().map_err(|_| { GneissError::new_internal_state_error("session lock poisoned") })?;
            f(self.repository.as_ref())
        };

        drop(lock);
        result
    }

    fn modify<R>(&self, client_id: &str, f: impl FnOnce(&mut ClientSession) -> R) -> GneissResult<R> {
        self.with_client(client_id, |repository| {
            let mut session = repository.read(client_id)?.ok_or_else(|| { GneissError::new_session_not_found(client_id) })?;
            let result = f(&mut session);
            repository.update(session)?;
            Ok(result)
        })
    }

    /// Returns a snapshot of a client's session
    pub fn read(&self, client_id: &str) -> GneissResult<Option<ClientSession>> {
        self.with_client(client_id, |repository| { repository.read(client_id) })
    }

    /// Decides session presence for a connect and applies the result atomically.
    ///
    /// A clean connect deletes any existing session; a missing session is always created; an
    /// existing session with a non-clean connect is kept and returned for replay.
    pub fn reconcile(&self, client_id: &str, clean_session: bool) -> GneissResult<ReconciledSession> {
        self.with_client(client_id, |repository| {
            match repository.read(client_id)? {
                Some(mut session) => {
                    if clean_session {
                        info!("session store - client \"{}\" connected clean, discarding prior session", client_id);
                        repository.delete(client_id)?;
                        repository.create(ClientSession::new(client_id, true))?;
                        Ok(ReconciledSession { session_present: false, resumed: None })
                    } else {
                        info!("session store - client \"{}\" resuming session", client_id);
                        session.clean = false;
                        repository.update(session.clone())?;
                        Ok(ReconciledSession { session_present: true, resumed: Some(session) })
                    }
                }
                None => {
                    info!("session store - creating session for client \"{}\"", client_id);
                    repository.create(ClientSession::new(client_id, clean_session))?;
                    Ok(ReconciledSession { session_present: false, resumed: None })
                }
            }
        })
    }

    /// Deletes a client's session, returning whether one existed
    pub fn delete(&self, client_id: &str) -> GneissResult<bool> {
        let result = self.with_client(client_id, |repository| { repository.delete(client_id) });
        self.prune_client_lock(client_id);
        result
    }

    /// Appends an in-flight outbound message
    pub fn add_pending_message(&self, client_id: &str, pending: PendingMessage) -> GneissResult<()> {
        self.modify(client_id, |session| { session.pending_messages.push(pending); })
    }

    /// Updates the status of an in-flight message; returns false if no message has that id
    pub fn set_pending_message_status(&self, client_id: &str, packet_id: u16, status: PendingMessageStatus) -> GneissResult<bool> {
        self.modify(client_id, |session| {
            match session.pending_messages.iter_mut().find(|pending| pending.packet_id == Some(packet_id)) {
                Some(pending) => {
                    pending.status = status;
                    if status == PendingMessageStatus::PendingToAcknowledge {
                        pending.duplicate = true;
                    }
                    true
                }
                None => { false }
            }
        })
    }

    /// Removes an in-flight message; returns false if no message has that id
    pub fn remove_pending_message(&self, client_id: &str, packet_id: u16) -> GneissResult<bool> {
        self.modify(client_id, |session| {
            let count = session.pending_messages.len();
            session.pending_messages.retain(|pending| pending.packet_id != Some(packet_id));
            count != session.pending_messages.len()
        })
    }

    /// Records an owed acknowledgement unless an identical record already exists.  Returns true
    /// if the record was added.
    pub fn try_add_pending_acknowledgement(&self, client_id: &str, ack: PendingAcknowledgement) -> GneissResult<bool> {
        self.modify(client_id, |session| {
            if session.has_pending_acknowledgement(ack.packet_id, ack.ack_type) {
                false
            } else {
                session.pending_acknowledgements.push(ack);
                true
            }
        })
    }

    /// Removes an owed acknowledgement; returns false if there was none
    pub fn remove_pending_acknowledgement(&self, client_id: &str, packet_id: u16, ack_type: AcknowledgementType) -> GneissResult<bool> {
        self.modify(client_id, |session| {
            let count = session.pending_acknowledgements.len();
            session.pending_acknowledgements.retain(|ack| ack.packet_id != packet_id || ack.ack_type != ack_type);
            count != session.pending_acknowledgements.len()
        })
    }

    /// Queues a message for a client that is offline.  Returns false if the client has no
    /// session to queue into.
    pub fn save_message(&self, client_id: &str, message: ApplicationMessage) -> GneissResult<bool> {
        match self.modify(client_id, |session| { session.saved_messages.push(message); }) {
            Ok(()) => { Ok(true) }
            Err(GneissError::SessionNotFound(_)) => { Ok(false) }
            Err(error) => { Err(error) }
        }
    }

    /// Removes and returns every queued offline message, in enqueue order
    pub fn take_saved_messages(&self, client_id: &str) -> GneissResult<Vec<ApplicationMessage>> {
        self.modify(client_id, |session| { std::mem::take(&mut session.saved_messages) })
    }

    /// Adds a subscription or replaces the one with the same topic filter
    pub fn set_subscription(&self, client_id: &str, subscription: Subscription) -> GneissResult<()> {
        self.modify(client_id, |session| {
            match session.subscriptions.iter_mut().find(|existing| existing.topic_filter == subscription.topic_filter) {
                Some(existing) => { existing.qos = subscription.qos; }
                None => { session.subscriptions.push(subscription); }
            }
        })
    }

    /// Removes the subscription for a topic filter; returns false if there was none
    pub fn remove_subscription(&self, client_id: &str, topic_filter: &str) -> GneissResult<bool> {
        self.modify(client_id, |session| {
            let count = session.subscriptions.len();
            session.subscriptions.retain(|subscription| subscription.topic_filter != topic_filter);
            count != session.subscriptions.len()
        })
    }

    /// Drops every in-flight message and owed acknowledgement, returning the local packet ids that
    /// were bound to them.  Offline-queued messages are kept.
    pub fn clear_in_flight(&self, client_id: &str) -> GneissResult<Vec<u16>> {
        self.modify(client_id, |session| {
            let packet_ids = session.outstanding_packet_ids();
            session.pending_messages.clear();
            session.pending_acknowledgements.clear();
            packet_ids
        })
    }
}
