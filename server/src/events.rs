//! Lifecycle notifications broadcast to observers.

use crate::drop_reason::ClientDropReason;
use tokio::sync::broadcast;

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Handshake accepted; the client has a peer and endpoint.
    ClientConnecting { net_id: u16, guid: String },
    /// Handshake acknowledged by the client.
    ClientConnected { net_id: u16, guid: String },
    ClientDropped {
        net_id: u16,
        guid: String,
        reason: ClientDropReason,
        resource: String,
        message: String,
    },
    HostChanged { net_id: u16, network_base: u32 },
    /// A client-originated event accepted past the rate limiters.
    NetEvent { source: u16, name: String },
}

pub type EventSender = broadcast::Sender<ServerEvent>;
pub type EventReceiver = broadcast::Receiver<ServerEvent>;

pub fn event_channel() -> EventSender {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Sends to current subscribers; having none is not an error.
pub fn emit(sender: &EventSender, event: ServerEvent) {
    let _ = sender.send(event);
}
