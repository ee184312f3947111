//! `msgServerEvent`: script events sent by a client to the server.

use super::{FloodGate, SizeGate};
use crate::client::Client;
use crate::drop_reason::ClientDropReason;
use crate::events::ServerEvent;
use crate::game_server::GameServer;
use crate::rate_limiter::RateLimiterDefaults;
use log::debug;
use shared::{NetEvent, MAX_SERVER_EVENT_SIZE};
use std::sync::Arc;

const EVENT_GATE: FloodGate = FloodGate {
    soft: "netEvent",
    soft_defaults: RateLimiterDefaults::new(50.0, 200.0),
    flood: "netEventFlood",
    flood_defaults: RateLimiterDefaults::new(75.0, 300.0),
    reason: ClientDropReason::NetEventRateLimit,
    drop_message: "Reliable network event overflow.",
    what: "net events",
};

const EVENT_SIZE_GATE: SizeGate = SizeGate {
    name: "netEventSize",
    defaults: RateLimiterDefaults::new(128.0 * 1024.0, 16.0 * 1024.0 * 1024.0),
    reason: ClientDropReason::NetEventRateLimit,
    drop_message: "Reliable network event size overflow.",
};

pub fn handle_server_event(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    if body.len() > MAX_SERVER_EVENT_SIZE {
        debug!("Oversized event ({} bytes) from {}", body.len(), client.net_id());
        return;
    }

    if !EVENT_GATE.admit(server, client) || !EVENT_SIZE_GATE.admit(server, client, body.len()) {
        return;
    }

    let Some(event) = NetEvent::decode(body) else {
        debug!("Malformed event from {}", client.net_id());
        return;
    };

    let server_ref = Arc::clone(server);
    let client = Arc::clone(client);
    server.main_context().submit(move || {
        if !client.is_live() {
            return;
        }

        let source = format!("net:{}", client.net_id());
        server_ref
            .collaborators()
            .events
            .queue_event(&event.name, &event.payload, &source);
        server_ref.emit(ServerEvent::NetEvent {
            source: client.net_id(),
            name: event.name,
        });
    });
}
