//! Directory of connected clients and the lookups the server needs.
//!
//! The registry is the only owner of client records. Every secondary index
//! (network id, slot id, peer, endpoint, TCP endpoint, connection token)
//! stores the client's guid, and a lookup resolves that guid in the primary
//! table. All indices live behind a single reader-writer lock, so an add or
//! remove is observed by readers as one step and readers never block each
//! other.
//!
//! Network ids come from a wrapping 16-bit counter. Ids still held by a live
//! client are skipped, so a wrap never hands out a duplicate.

use crate::client::{Client, PeerId};
use crate::error::RegistryError;
use crate::events::{emit, EventSender, ServerEvent};
use log::{debug, info};
use parking_lot::RwLock;
use shared::NO_NET_ID;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

struct Indices {
    by_guid: HashMap<String, Arc<Client>>,
    by_net_id: HashMap<u16, String>,
    by_slot: Vec<Option<String>>,
    by_peer: HashMap<PeerId, String>,
    by_endpoint: HashMap<SocketAddr, String>,
    by_tcp_endpoint: HashMap<String, String>,
    by_token: HashMap<String, String>,
    next_net_id: u16,
}

impl Indices {
    fn resolve(&self, guid: Option<&String>) -> Option<Arc<Client>> {
        guid.and_then(|guid| self.by_guid.get(guid)).cloned()
    }

    fn owns(&self, client: &Client) -> bool {
        self.by_guid
            .get(client.guid())
            .map_or(false, |owned| std::ptr::eq(owned.as_ref(), client))
    }

    fn allocate_net_id(&mut self) -> Option<u16> {
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next_net_id;
            self.next_net_id = self.next_net_id.wrapping_add(1);

            if candidate == 0 || candidate == NO_NET_ID {
                continue;
            }
            if !self.by_net_id.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

fn remove_if_owned<K: std::hash::Hash + Eq>(map: &mut HashMap<K, String>, key: &K, guid: &str) {
    if map.get(key).map_or(false, |owner| owner == guid) {
        map.remove(key);
    }
}

pub struct ClientRegistry {
    indices: RwLock<Indices>,
    host: RwLock<Option<Weak<Client>>>,
    events: EventSender,
}

impl ClientRegistry {
    /// Creates a registry with `capacity` slots.
    pub fn new(capacity: usize, events: EventSender) -> Self {
        Self {
            indices: RwLock::new(Indices {
                by_guid: HashMap::new(),
                by_net_id: HashMap::new(),
                by_slot: vec![None; capacity],
                by_peer: HashMap::new(),
                by_endpoint: HashMap::new(),
                by_tcp_endpoint: HashMap::new(),
                by_token: HashMap::new(),
                next_net_id: 1,
            }),
            host: RwLock::new(None),
            events,
        }
    }

    /// Registers a new client, assigning the lowest free slot and the next
    /// free network id.
    pub fn make_client(&self, guid: &str) -> Result<Arc<Client>, RegistryError> {
        let mut indices = self.indices.write();

        if indices.by_guid.contains_key(guid) {
            return Err(RegistryError::DuplicateIdentity(guid.to_string()));
        }

        let capacity = indices.by_slot.len();
        let slot_id = indices
            .by_slot
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::Full { capacity })?;

        let net_id = indices
            .allocate_net_id()
            .ok_or(RegistryError::NetIdsExhausted)?;

        let client = Arc::new(Client::new(guid.to_string(), net_id, slot_id as u16));
        indices.by_slot[slot_id] = Some(guid.to_string());
        indices.by_net_id.insert(net_id, guid.to_string());
        indices.by_guid.insert(guid.to_string(), Arc::clone(&client));

        info!(
            "Client {} registered with net id {} in slot {}",
            guid, net_id, slot_id
        );

        Ok(client)
    }

    /// Clears every index entry for `client` and frees its slot.
    ///
    /// Returns `false` if the client was already removed. A stale handle to a
    /// previous client with the same guid never removes its successor.
    pub fn remove_client(&self, client: &Client) -> bool {
        let mut indices = self.indices.write();

        if !indices.owns(client) {
            return false;
        }

        let guid = client.guid().to_string();
        indices.by_guid.remove(&guid);
        remove_if_owned(&mut indices.by_net_id, &client.net_id(), &guid);

        if let Some(slot) = indices.by_slot.get_mut(client.slot_id() as usize) {
            if slot.as_deref() == Some(guid.as_str()) {
                *slot = None;
            }
        }

        if let Some(peer) = client.peer() {
            remove_if_owned(&mut indices.by_peer, &peer, &guid);
        }
        if let Some(endpoint) = client.endpoint() {
            remove_if_owned(&mut indices.by_endpoint, &endpoint, &guid);
        }
        if let Some(tcp_endpoint) = client.tcp_endpoint() {
            remove_if_owned(&mut indices.by_tcp_endpoint, &tcp_endpoint, &guid);
        }
        if let Some(token) = client.connection_token() {
            remove_if_owned(&mut indices.by_token, &token, &guid);
        }

        client.mark_removed();
        drop(indices);

        info!("Client {} (net id {}) removed", guid, client.net_id());
        true
    }

    pub fn assign_peer(&self, client: &Client, peer: PeerId) -> bool {
        let mut indices = self.indices.write();
        if !indices.owns(client) {
            return false;
        }

        let guid = client.guid().to_string();
        let mut slot = client.peer.write();
        if let Some(old) = slot.replace(peer) {
            remove_if_owned(&mut indices.by_peer, &old, &guid);
        }
        indices.by_peer.insert(peer, guid);
        true
    }

    pub fn set_endpoint(&self, client: &Client, endpoint: SocketAddr) -> bool {
        let mut indices = self.indices.write();
        if !indices.owns(client) {
            return false;
        }

        let guid = client.guid().to_string();
        let mut slot = client.endpoint.write();
        if let Some(old) = slot.replace(endpoint) {
            remove_if_owned(&mut indices.by_endpoint, &old, &guid);
        }
        indices.by_endpoint.insert(endpoint, guid);
        true
    }

    pub fn set_tcp_endpoint(&self, client: &Client, endpoint: &str) -> bool {
        let mut indices = self.indices.write();
        if !indices.owns(client) {
            return false;
        }

        let guid = client.guid().to_string();
        let mut slot = client.tcp_endpoint.write();
        if let Some(old) = slot.replace(endpoint.to_string()) {
            remove_if_owned(&mut indices.by_tcp_endpoint, &old, &guid);
        }
        indices.by_tcp_endpoint.insert(endpoint.to_string(), guid);
        true
    }

    pub fn set_connection_token(&self, client: &Client, token: &str) -> bool {
        let mut indices = self.indices.write();
        if !indices.owns(client) {
            return false;
        }

        let guid = client.guid().to_string();
        let mut slot = client.connection_token.write();
        if let Some(old) = slot.replace(token.to_string()) {
            remove_if_owned(&mut indices.by_token, &old, &guid);
        }
        indices.by_token.insert(token.to_string(), guid);
        true
    }

    /// Retires the client's connection token once the handshake has used it.
    pub fn clear_connection_token(&self, client: &Client) -> bool {
        let mut indices = self.indices.write();
        if !indices.owns(client) {
            return false;
        }

        let guid = client.guid().to_string();
        if let Some(old) = client.connection_token.write().take() {
            remove_if_owned(&mut indices.by_token, &old, &guid);
        }
        true
    }

    pub fn get_client_by_guid(&self, guid: &str) -> Option<Arc<Client>> {
        self.indices.read().by_guid.get(guid).cloned()
    }

    pub fn get_client_by_net_id(&self, net_id: u16) -> Option<Arc<Client>> {
        let indices = self.indices.read();
        indices.resolve(indices.by_net_id.get(&net_id))
    }

    pub fn get_client_by_slot_id(&self, slot_id: u16) -> Option<Arc<Client>> {
        let indices = self.indices.read();
        let guid = indices
            .by_slot
            .get(slot_id as usize)
            .and_then(Option::as_ref);
        indices.resolve(guid)
    }

    pub fn get_client_by_peer(&self, peer: PeerId) -> Option<Arc<Client>> {
        let indices = self.indices.read();
        indices.resolve(indices.by_peer.get(&peer))
    }

    pub fn get_client_by_endpoint(&self, endpoint: SocketAddr) -> Option<Arc<Client>> {
        let indices = self.indices.read();
        indices.resolve(indices.by_endpoint.get(&endpoint))
    }

    pub fn get_client_by_tcp_endpoint(&self, endpoint: &str) -> Option<Arc<Client>> {
        let indices = self.indices.read();
        indices.resolve(indices.by_tcp_endpoint.get(endpoint))
    }

    pub fn get_client_by_connection_token(&self, token: &str) -> Option<Arc<Client>> {
        let indices = self.indices.read();
        indices.resolve(indices.by_token.get(token))
    }

    /// Calls `f` for every live client, ordered by network id.
    ///
    /// The lock is released before the first call, so `f` may use the
    /// registry, including removing clients.
    pub fn for_all_clients<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Client>),
    {
        let mut snapshot: Vec<Arc<Client>> =
            self.indices.read().by_guid.values().cloned().collect();
        snapshot.sort_by_key(|client| client.net_id());

        for client in snapshot.iter().filter(|client| client.is_live()) {
            f(client);
        }
    }

    /// The last elected host. It may have disconnected since; callers check
    /// [`Client::is_dead`].
    pub fn get_host(&self) -> Option<Arc<Client>> {
        self.host.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_host(&self, client: Option<&Arc<Client>>) {
        *self.host.write() = client.map(Arc::downgrade);
    }

    /// Handshake accepted: the client now has a peer and endpoint.
    pub fn handle_connecting_client(&self, client: &Arc<Client>) {
        client.touch();
        debug!("Client {} connecting", client.net_id());
        emit(
            &self.events,
            ServerEvent::ClientConnecting {
                net_id: client.net_id(),
                guid: client.guid().to_string(),
            },
        );
    }

    /// Handshake acknowledged by the client.
    pub fn handle_connected_client(&self, client: &Arc<Client>) {
        client.set_connected();
        client.touch();
        info!("Client {} ({}) connected", client.net_id(), client.name());
        emit(
            &self.events,
            ServerEvent::ClientConnected {
                net_id: client.net_id(),
                guid: client.guid().to_string(),
            },
        );
    }

    pub fn capacity(&self) -> usize {
        self.indices.read().by_slot.len()
    }

    /// Returns the number of registered clients
    pub fn len(&self) -> usize {
        self.indices.read().by_guid.len()
    }

    /// Returns true if no clients are registered
    pub fn is_empty(&self) -> bool {
        self.indices.read().by_guid.is_empty()
    }

    #[cfg(test)]
    fn set_next_net_id(&self, next: u16) {
        self.indices.write().next_net_id = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use std::collections::HashSet;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn registry(capacity: usize) -> ClientRegistry {
        ClientRegistry::new(capacity, event_channel())
    }

    #[test]
    fn test_registry_creation() {
        let registry = registry(5);
        assert_eq!(registry.capacity(), 5);
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.get_host().is_none());
    }

    #[test]
    fn test_make_client() {
        let registry = registry(2);
        let client = registry.make_client("license:1").unwrap();

        assert_eq!(client.net_id(), 1);
        assert_eq!(client.slot_id(), 0);
        assert_eq!(registry.len(), 1);
        assert!(!registry.is_empty());
    }

    #[test]
    fn test_make_multiple_clients() {
        let registry = registry(3);
        let first = registry.make_client("license:1").unwrap();
        let second = registry.make_client("license:2").unwrap();

        assert_eq!(first.net_id(), 1);
        assert_eq!(second.net_id(), 2);
        assert_eq!(second.slot_id(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_make_client_max_capacity() {
        let registry = registry(1);
        assert!(registry.make_client("license:1").is_ok());

        let result = registry.make_client("license:2");
        assert_eq!(result.unwrap_err(), RegistryError::Full { capacity: 1 });
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_make_client_duplicate_guid() {
        let registry = registry(2);
        registry.make_client("license:1").unwrap();

        assert_eq!(
            registry.make_client("license:1").unwrap_err(),
            RegistryError::DuplicateIdentity("license:1".to_string())
        );
    }

    #[test]
    fn test_lookups_agree_until_removed() {
        let registry = registry(4);
        let client = registry.make_client("license:1").unwrap();
        registry.assign_peer(&client, 77);
        registry.set_endpoint(&client, test_addr());
        registry.set_tcp_endpoint(&client, "127.0.0.1");
        registry.set_connection_token(&client, "token-1");

        let lookups = [
            registry.get_client_by_guid("license:1"),
            registry.get_client_by_net_id(client.net_id()),
            registry.get_client_by_slot_id(client.slot_id()),
            registry.get_client_by_peer(77),
            registry.get_client_by_endpoint(test_addr()),
            registry.get_client_by_tcp_endpoint("127.0.0.1"),
            registry.get_client_by_connection_token("token-1"),
        ];
        for found in &lookups {
            assert!(Arc::ptr_eq(found.as_ref().unwrap(), &client));
        }

        assert!(registry.remove_client(&client));
        assert!(!client.is_live());
        assert!(registry.get_client_by_guid("license:1").is_none());
        assert!(registry.get_client_by_net_id(client.net_id()).is_none());
        assert!(registry.get_client_by_slot_id(client.slot_id()).is_none());
        assert!(registry.get_client_by_peer(77).is_none());
        assert!(registry.get_client_by_endpoint(test_addr()).is_none());
        assert!(registry.get_client_by_tcp_endpoint("127.0.0.1").is_none());
        assert!(registry.get_client_by_connection_token("token-1").is_none());
    }

    #[test]
    fn test_remove_client_is_idempotent() {
        let registry = registry(2);
        let client = registry.make_client("license:1").unwrap();

        assert!(registry.remove_client(&client));
        assert!(!registry.remove_client(&client));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_handle_does_not_remove_successor() {
        let registry = registry(2);
        let old = registry.make_client("license:1").unwrap();
        registry.remove_client(&old);

        let new = registry.make_client("license:1").unwrap();
        assert!(!registry.remove_client(&old));
        assert!(registry.get_client_by_guid("license:1").is_some());
        assert!(new.is_live());
    }

    #[test]
    fn test_slot_ids_are_reused_not_shared() {
        let registry = registry(3);
        let a = registry.make_client("a").unwrap();
        let b = registry.make_client("b").unwrap();
        let c = registry.make_client("c").unwrap();

        let slots: HashSet<u16> = [&a, &b, &c].iter().map(|c| c.slot_id()).collect();
        assert_eq!(slots.len(), 3);

        registry.remove_client(&b);
        let d = registry.make_client("d").unwrap();
        assert_eq!(d.slot_id(), b.slot_id());
        assert_ne!(d.net_id(), b.net_id());
    }

    #[test]
    fn test_net_id_wrap_skips_live_and_reserved_ids() {
        let registry = registry(4);
        let first = registry.make_client("a").unwrap();
        assert_eq!(first.net_id(), 1);

        registry.set_next_net_id(0xFFFE);
        let second = registry.make_client("b").unwrap();
        assert_eq!(second.net_id(), 0xFFFE);

        // 0xFFFF and 0 are reserved, 1 is still live
        let third = registry.make_client("c").unwrap();
        assert_eq!(third.net_id(), 2);
    }

    #[test]
    fn test_reassigning_endpoint_clears_old_entry() {
        let registry = registry(2);
        let client = registry.make_client("a").unwrap();

        registry.set_endpoint(&client, test_addr());
        registry.set_endpoint(&client, test_addr2());

        assert!(registry.get_client_by_endpoint(test_addr()).is_none());
        assert!(registry.get_client_by_endpoint(test_addr2()).is_some());
    }

    #[test]
    fn test_cleared_token_no_longer_resolves() {
        let registry = registry(4);
        let client = registry.make_client("a").unwrap();
        registry.set_connection_token(&client, "tok");

        assert!(registry.clear_connection_token(&client));
        assert!(registry.get_client_by_connection_token("tok").is_none());
        assert_eq!(client.connection_token(), None);
        assert!(registry.get_client_by_guid("a").is_some());
    }

    #[test]
    fn test_index_updates_ignored_after_removal() {
        let registry = registry(2);
        let client = registry.make_client("a").unwrap();
        registry.remove_client(&client);

        assert!(!registry.set_endpoint(&client, test_addr()));
        assert!(registry.get_client_by_endpoint(test_addr()).is_none());
    }

    #[test]
    fn test_for_all_clients_allows_reentrant_removal() {
        let registry = registry(4);
        for guid in ["a", "b", "c"] {
            registry.make_client(guid).unwrap();
        }

        let mut visited = Vec::new();
        registry.for_all_clients(|client| {
            visited.push(client.net_id());
            registry.remove_client(client);
        });

        assert_eq!(visited, vec![1, 2, 3]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_for_all_clients_skips_removed_entries() {
        let registry = registry(4);
        registry.make_client("a").unwrap();
        let b = registry.make_client("b").unwrap();
        registry.make_client("c").unwrap();

        let mut visited = Vec::new();
        registry.for_all_clients(|client| {
            if client.net_id() == 1 {
                registry.remove_client(&b);
            }
            visited.push(client.net_id());
        });

        assert_eq!(visited, vec![1, 3]);
    }

    #[test]
    fn test_host_reference_goes_stale() {
        let registry = registry(2);
        let client = registry.make_client("a").unwrap();
        registry.set_host(Some(&client));

        assert_eq!(registry.get_host().unwrap().net_id(), client.net_id());

        registry.remove_client(&client);
        let host = registry.get_host().unwrap();
        assert!(host.is_dead());

        drop(host);
        drop(client);
        assert!(registry.get_host().is_none());
    }

    #[test]
    fn test_lifecycle_events() {
        let events = event_channel();
        let mut rx = events.subscribe();
        let registry = ClientRegistry::new(2, events);
        let client = registry.make_client("a").unwrap();

        registry.handle_connecting_client(&client);
        registry.handle_connected_client(&client);

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::ClientConnecting {
                net_id: 1,
                guid: "a".to_string()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::ClientConnected {
                net_id: 1,
                guid: "a".to_string()
            }
        );
        assert!(client.is_connected());
    }

    #[test]
    fn test_concurrent_readers_during_writes() {
        let registry = Arc::new(registry(64));
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let client = registry.make_client(&format!("g{}", i)).unwrap();
                    registry.remove_client(&client);
                }
            })
        };

        for _ in 0..200 {
            registry.for_all_clients(|client| {
                let by_net = registry.get_client_by_net_id(client.net_id());
                if let Some(found) = by_net {
                    assert_eq!(found.guid(), client.guid());
                }
            });
        }

        writer.join().unwrap();
        assert!(registry.is_empty());
    }
}
