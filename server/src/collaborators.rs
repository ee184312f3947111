//! Seams to the subsystems that consume what the dispatch core lets through.
//!
//! The game-state engine, object-id pool, state-bag replication and script
//! event queue live outside this crate. The defaults here log and discard,
//! except the object-id allocator, which hands out sequential ids.

use crate::client::Client;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Authoritative world-state engine, fed routed packets in authoritative mode.
pub trait GameStateSync: Send + Sync {
    fn handle_route(&self, client: &Arc<Client>, target_net_id: u16, payload: &[u8]);

    /// Called once per logical tick on the network context.
    fn tick(&self, _frame: u64) {}
}

pub trait ObjectIdAllocator: Send + Sync {
    /// Returns `count` ids reserved for `client`, in allocation order.
    fn allocate(&self, client: &Client, count: usize) -> Vec<u16>;

    /// Returns every id still reserved for `client` to the pool.
    fn release_client(&self, _client: &Client) {}
}

pub trait StateBagSink: Send + Sync {
    fn handle_state_bag(&self, slot_id: u16, data: &[u8]);
}

pub trait EventSink: Send + Sync {
    fn queue_event(&self, name: &str, payload: &[u8], source: &str);
}

pub struct NullGameState;

impl GameStateSync for NullGameState {
    fn handle_route(&self, client: &Arc<Client>, target_net_id: u16, payload: &[u8]) {
        debug!(
            "Discarding {} routed bytes from {} to {}",
            payload.len(),
            client.net_id(),
            target_net_id
        );
    }
}

pub struct NullStateBags;

impl StateBagSink for NullStateBags {
    fn handle_state_bag(&self, slot_id: u16, data: &[u8]) {
        debug!("Discarding {} state bag bytes from slot {}", data.len(), slot_id);
    }
}

pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn queue_event(&self, name: &str, payload: &[u8], source: &str) {
        debug!("Event {} from {} ({} bytes)", name, source, payload.len());
    }
}

/// Hands out ids from a wrapping counter, never reusing one still reserved.
///
/// Each id remembers the network id it was handed to, so a dropped client's
/// ids go back to the pool in one call.
pub struct SequentialObjectIds {
    state: Mutex<ObjectIdState>,
}

struct ObjectIdState {
    next: u16,
    owners: HashMap<u16, u16>,
}

impl SequentialObjectIds {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ObjectIdState {
                next: 1,
                owners: HashMap::new(),
            }),
        }
    }

    #[cfg(test)]
    fn reserved_count(&self) -> usize {
        self.state.lock().owners.len()
    }
}

impl Default for SequentialObjectIds {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectIdAllocator for SequentialObjectIds {
    fn allocate(&self, client: &Client, count: usize) -> Vec<u16> {
        let mut state = self.state.lock();
        let mut ids = Vec::with_capacity(count);

        // bounded so a full pool returns a short batch instead of spinning
        for _ in 0..=u16::MAX as u32 {
            if ids.len() == count {
                break;
            }

            let candidate = state.next;
            state.next = state.next.wrapping_add(1);
            if candidate != 0 && !state.owners.contains_key(&candidate) {
                state.owners.insert(candidate, client.net_id());
                ids.push(candidate);
            }
        }

        debug!("Allocated {} object ids for {}", ids.len(), client.net_id());
        ids
    }

    fn release_client(&self, client: &Client) {
        let mut state = self.state.lock();
        let before = state.owners.len();
        state.owners.retain(|_, owner| *owner != client.net_id());

        debug!(
            "Released {} object ids of {}",
            before - state.owners.len(),
            client.net_id()
        );
    }
}

/// The set of collaborators a server instance talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub game_state: Arc<dyn GameStateSync>,
    pub object_ids: Arc<dyn ObjectIdAllocator>,
    pub state_bags: Arc<dyn StateBagSink>,
    pub events: Arc<dyn EventSink>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            game_state: Arc::new(NullGameState),
            object_ids: Arc::new(SequentialObjectIds::new()),
            state_bags: Arc::new(NullStateBags),
            events: Arc::new(LoggingEventSink),
        }
    }
}
