//! The record kept for one connected peer.
//!
//! A `Client` is shared behind `Arc` so work handed to another execution
//! context can keep a handle. Fields that feed a registry index are only
//! changed through [`ClientRegistry`](crate::client_registry::ClientRegistry)
//! so every index stays consistent; the rest is plain interior state.

use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Transport-level handle of an accepted peer.
pub type PeerId = u32;

/// Silence after which a host is considered gone for arbitration purposes.
pub const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct Client {
    guid: String,
    net_id: u16,
    slot_id: u16,
    name: RwLock<String>,
    pub(crate) peer: RwLock<Option<PeerId>>,
    pub(crate) endpoint: RwLock<Option<SocketAddr>>,
    pub(crate) tcp_endpoint: RwLock<Option<String>>,
    pub(crate) connection_token: RwLock<Option<String>>,
    has_routed: AtomicBool,
    dropping: AtomicBool,
    removed: AtomicBool,
    connected: AtomicBool,
    network_base: AtomicU32,
    pending_reliable: AtomicU32,
    oldest_unacked: Mutex<Option<Instant>>,
    ping_ms: AtomicU32,
    last_seen: Mutex<Instant>,
}

impl Client {
    pub(crate) fn new(guid: String, net_id: u16, slot_id: u16) -> Self {
        Self {
            guid,
            net_id,
            slot_id,
            name: RwLock::new(String::new()),
            peer: RwLock::new(None),
            endpoint: RwLock::new(None),
            tcp_endpoint: RwLock::new(None),
            connection_token: RwLock::new(None),
            has_routed: AtomicBool::new(false),
            dropping: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            network_base: AtomicU32::new(0),
            pending_reliable: AtomicU32::new(0),
            oldest_unacked: Mutex::new(None),
            ping_ms: AtomicU32::new(0),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn net_id(&self) -> u16 {
        self.net_id
    }

    pub fn slot_id(&self) -> u16 {
        self.slot_id
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.name.write() = name.to_string();
    }

    pub fn peer(&self) -> Option<PeerId> {
        *self.peer.read()
    }

    pub fn endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.read()
    }

    pub fn tcp_endpoint(&self) -> Option<String> {
        self.tcp_endpoint.read().clone()
    }

    pub fn connection_token(&self) -> Option<String> {
        self.connection_token.read().clone()
    }

    pub fn has_routed(&self) -> bool {
        self.has_routed.load(Ordering::Acquire)
    }

    pub fn set_has_routed(&self) {
        self.has_routed.store(true, Ordering::Release);
    }

    pub fn is_dropping(&self) -> bool {
        self.dropping.load(Ordering::Acquire)
    }

    /// Marks the client as dropping; returns `false` if it already was.
    pub(crate) fn begin_drop(&self) -> bool {
        !self.dropping.swap(true, Ordering::AcqRel)
    }

    /// False once the registry has removed this client.
    pub fn is_live(&self) -> bool {
        !self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) -> bool {
        !self.removed.swap(true, Ordering::AcqRel)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn network_base(&self) -> u32 {
        self.network_base.load(Ordering::Acquire)
    }

    pub fn set_network_base(&self, base: u32) {
        self.network_base.store(base, Ordering::Release);
    }

    /// Records inbound traffic; it also acknowledges outstanding reliable sends.
    ///
    /// The time from the oldest unacknowledged send to this datagram becomes
    /// the client's ping.
    pub fn touch(&self) {
        let now = Instant::now();
        *self.last_seen.lock() = now;
        self.pending_reliable.store(0, Ordering::Release);

        if let Some(sent) = self.oldest_unacked.lock().take() {
            let rtt = now.saturating_duration_since(sent).as_millis();
            self.ping_ms
                .store(u32::try_from(rtt).unwrap_or(u32::MAX), Ordering::Release);
        }
    }

    /// Last measured round trip in milliseconds, zero until one completes.
    pub fn ping_ms(&self) -> u32 {
        self.ping_ms.load(Ordering::Acquire)
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    #[cfg(test)]
    pub(crate) fn set_last_seen(&self, instant: Instant) {
        *self.last_seen.lock() = instant;
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen().elapsed() > timeout
    }

    /// Removed, or silent for longer than [`DEAD_TIMEOUT`].
    pub fn is_dead(&self) -> bool {
        !self.is_live() || self.is_timed_out(DEAD_TIMEOUT)
    }

    pub(crate) fn note_reliable_sent(&self) {
        self.pending_reliable.fetch_add(1, Ordering::AcqRel);
        self.oldest_unacked.lock().get_or_insert_with(Instant::now);
    }

    pub fn has_pending_reliable(&self) -> bool {
        self.pending_reliable.load(Ordering::Acquire) > 0
    }
}
