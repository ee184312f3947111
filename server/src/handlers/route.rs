//! `msgRoute`: peer-to-peer relay, or game-state input in authoritative mode.

use crate::client::Client;
use crate::game_server::GameServer;
use log::{debug, error};
use shared::{RoutePacket, MSG_ROUTE};
use std::sync::Arc;

pub fn handle_route(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    let Some(packet) = RoutePacket::decode(body) else {
        debug!("Malformed route packet from {}", client.net_id());
        return;
    };

    if server.is_authoritative() {
        let server_ref = Arc::clone(server);
        let client = Arc::clone(client);
        let target = packet.net_id;
        let payload = packet.payload.to_vec();

        server.sync_context().submit(move || {
            if !client.is_live() {
                return;
            }
            server_ref
                .collaborators()
                .game_state
                .handle_route(&client, target, &payload);
        });
    } else if let Some(target) = server.registry().get_client_by_net_id(packet.net_id) {
        let forwarded = RoutePacket {
            net_id: client.net_id(),
            payload: packet.payload,
        };

        match forwarded.encode() {
            Some(data) => server.send_to_client(&target, MSG_ROUTE, &data, false),
            None => error!("Failed to encode routed packet from {}", client.net_id()),
        }
    }

    client.set_has_routed();
}
