/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Allocation of the 16-bit identifiers that correlate a QoS 1/2 exchange's request and response
packets.  Identifier spaces are independent per client id.
 */

use crate::error::{GneissError, GneissResult};

use log::*;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug)]
struct ClientPacketIds {

    // next id to check; never zero
    next_packet_id: u16,

    outstanding: HashSet<u16>,
}

impl Default for ClientPacketIds {
    fn default() -> Self {
        ClientPacketIds {
            next_packet_id: 1,
            outstanding: HashSet::new(),
        }
    }
}

impl ClientPacketIds {

    fn acquire_free_packet_id(&mut self, client_id: &str) -> GneissResult<u16> {
        let start_id = self.next_packet_id;
        let mut check_id = start_id;

        loop {
            if self.next_packet_id == u16::MAX {
                self.next_packet_id = 1;
            } else {
                self.next_packet_id += 1;
            }

            if self.outstanding.insert(check_id) {
                return Ok(check_id);
            }

            if self.next_packet_id == start_id {
                error!("acquire_free_packet_id - client \"{}\" has no unbound packet id", client_id);
                return Err(GneissError::new_resource_exhausted("packet id space exhausted"));
            }

            check_id = self.next_packet_id;
        }
    }
}

/// Hands out packet ids that are unique among the ids currently outstanding for a client.
///
/// Ids come from a counter that wraps over 1..=65535, skipping any id that is still outstanding.
#[derive(Debug, Default)]
pub struct PacketIdAllocator {
    clients: Mutex<HashMap<String, ClientPacketIds>>,
}

impl PacketIdAllocator {

    /// Creates an allocator with no outstanding ids
    pub fn new() -> Self {
        PacketIdAllocator::default()
    }

    /// Returns an id not currently outstanding for the client and marks it outstanding.  Fails
    /// with ResourceExhausted if every id is in use.
    pub fn allocate(&self, client_id: &str) -> GneissResult<u16> {
        let mut clients = self.lock_clients()?;
        let ids = clients.entry(client_id.to_string()).or_default();
        let packet_id = ids.acquire_free_packet_id(client_id)?;
        debug!("allocate - client \"{}\" bound packet id {}", client_id, packet_id);
        Ok(packet_id)
    }

    /// Releases an id.  Freeing an id that is not outstanding does nothing.
    pub fn free(&self, client_id: &str, packet_id: u16) {
        if let Ok(mut clients) = self.lock_clients() {
            if let Some(ids) = clients.get_mut(client_id) {
                if ids.outstanding.remove(&packet_id) {
                    debug!("free - client \"{}\" released packet id {}", client_id, packet_id);
                }
            }
        }
    }

    /// Marks an id recovered from session state as outstanding so that fresh allocations skip it.
    pub fn mark_outstanding(&self, client_id: &str, packet_id: u16) -> GneissResult<()> {
        if packet_id == 0 {
            return Err(GneissError::new_internal_state_error("packet id zero is never valid"));
        }

        let mut clients = self.lock_clients()?;
        clients.entry(client_id.to_string()).or_default().outstanding.insert(packet_id);
        Ok(())
    }

    /// Returns true if the id is currently outstanding for the client
    pub fn is_outstanding(&self, client_id: &str, packet_id: u16) -> bool {
        match self.lock_clients() {
            Ok(clients) => {
                clients.get(client_id).map_or(false, |ids| ids.outstanding.contains(&packet_id))
            }
            Err(_) => { false }
        }
    }

    /// Drops all state for a client, typically when its session is deleted.
    pub fn release_client(&self, client_id: &str) {
        if let Ok(mut clients) = self.lock_clients() {
            clients.remove(client_id);
        }
    }

    fn lock_clients(&self) -> GneissResult<std::sync::MutexGuard<'_, HashMap<String, ClientPacketIds>>> {
        self.clients.lock().map_err(|_| { GneissError::new_internal_state_error("packet id allocator lock poisoned") })
    }
}
