/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Client id to active connection mapping.  One connection per client id; the most recent connect
wins and the connection it replaces is disposed.
 */

use crate::connection::MqttConnection;

use log::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// The set of connections currently bound to a client id
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<MqttConnection>>>,
}

impl ConnectionRegistry {

    /// Creates an empty registry
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Binds a connection to a client id.  A connection previously bound to the same id is
    /// disposed, which fails all of its outstanding waits with ConnectionClosed.
    pub fn add(&self, client_id: &str, connection: Arc<MqttConnection>) {
        let evicted = match self.connections.lock() {
            Ok(mut connections) => { connections.insert(client_id.to_string(), connection.clone()) }
            Err(_) => { None }
        };

        if let Some(evicted) = evicted {
            if evicted.id() != connection.id() {
                warn!("registry - client \"{}\" reconnected on connection {}, evicting connection {}", client_id, connection.id(), evicted.id());
                evicted.dispose();
            }
        }
    }

    /// Returns the connection bound to a client id, if it is still connected.  A bound
    /// connection that is no longer connected is unbound and disposed.
    pub fn get(&self, client_id: &str) -> Option<Arc<MqttConnection>> {
        let (current, stale) = match self.connections.lock() {
            Ok(mut connections) => {
                match connections.get(client_id) {
                    Some(connection) if connection.is_connected() => { (Some(connection.clone()), None) }
                    Some(_) => { (None, connections.remove(client_id)) }
                    None => { (None, None) }
                }
            }
            Err(_) => { (None, None) }
        };

        if let Some(stale) = stale {
            debug!("registry - client \"{}\" connection {} is no longer connected, removing", client_id, stale.id());
            stale.dispose();
        }

        current
    }

    /// Unbinds and disposes the connection for a client id.  Returns false if nothing was bound.
    pub fn remove(&self, client_id: &str) -> bool {
        let removed = match self.connections.lock() {
            Ok(mut connections) => { connections.remove(client_id) }
            Err(_) => { None }
        };

        match removed {
            Some(connection) => {
                info!("registry - client \"{}\" connection {} removed", client_id, connection.id());
                connection.dispose();
                true
            }
            None => { false }
        }
    }

    /// Unbinds a client id only if it is still bound to the given connection
    pub(crate) fn remove_if_current(&self, client_id: &str, connection_id: u64) -> bool {
        let removed = match self.connections.lock() {
            Ok(mut connections) => {
                if connections.get(client_id).map_or(false, |connection| connection.id() == connection_id) {
                    connections.remove(client_id)
                } else {
                    None
                }
            }
            Err(_) => { None }
        };

        match removed {
            Some(connection) => {
                connection.dispose();
                true
            }
            None => { false }
        }
    }

    /// Returns true if the client id is bound to some connection other than the given one
    pub(crate) fn is_registered_elsewhere(&self, client_id: &str, connection_id: u64) -> bool {
        match self.connections.lock() {
            Ok(connections) => {
                connections.get(client_id).map_or(false, |connection| connection.id() != connection_id)
            }
            Err(_) => { false }
        }
    }

    /// Client ids with a bound connection
    pub fn active_clients(&self) -> Vec<String> {
        self.connections.lock().map_or(Vec::new(), |connections| connections.keys().cloned().collect())
    }

    /// Number of bound client ids
    pub fn len(&self) -> usize {
        self.connections.lock().map_or(0, |connections| connections.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionState, OutboundQueueType};
    use crate::error::GneissError;
    use crate::mqtt::*;
    use crate::retry::{send_and_wait, RetryPolicy};
    use crate::testing::*;
    use crate::transport::Transport;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn last_connect_wins() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let registry = ConnectionRegistry::new();
            let (first, mut first_peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_secs(10), 3));
            let (second, _second_peer) = make_test_connection_with_id(&handle, 2);

            registry.add("c", first.clone());

            let request = MqttPacket::Publish(PublishPacket { packet_id: Some(1), topic: "t".to_string(), qos: QualityOfService::AtLeastOnce, ..Default::default() });
            let wait = tokio::spawn({
                let first = first.clone();
                async move { send_and_wait(&first, request, PacketType::Puback, OutboundQueueType::Protocol).await }
            });
            first_peer.next_packet().await;

            registry.add("c", second.clone());

            assert_matches!(wait.await.unwrap(), Err(GneissError::ConnectionClosed(_)));
            assert_eq!(ConnectionState::Disposed, first.state());
            assert_eq!(2, registry.get("c").unwrap().id());
            assert!(registry.is_registered_elsewhere("c", 1));
            assert!(!registry.is_registered_elsewhere("c", 2));

            // the evicted connection's cleanup must not unbind its replacement
            assert!(!registry.remove_if_current("c", 1));
            assert_eq!(1, registry.len());
        });
    }

    #[test]
    fn remove_is_idempotent() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let registry = ConnectionRegistry::new();
            let (connection, _peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_secs(10), 3));

            registry.add("c", connection.clone());
            assert_eq!(vec!["c".to_string()], registry.active_clients());

            assert!(registry.remove("c"));
            assert!(!registry.remove("c"));
            assert_eq!(ConnectionState::Disposed, connection.state());
            assert!(registry.is_empty());
        });
    }

    #[test]
    fn get_drops_disconnected_entries() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let handle = runtime.handle().clone();
        runtime.block_on(async {
            let registry = ConnectionRegistry::new();
            let (connection, peer) = make_test_connection(&handle, RetryPolicy::new(Duration::from_secs(10), 3));

            registry.add("c", connection.clone());
            peer.transport.close();

            assert!(registry.get("c").is_none());
            assert!(registry.is_empty());
        });
    }
}
