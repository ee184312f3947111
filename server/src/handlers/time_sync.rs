use crate::client::Client;
use crate::game_server::GameServer;
use log::{debug, error};
use shared::{FixedPayload, TimeSyncRequest, TimeSyncResponse, MSG_TIME_SYNC};
use std::sync::Arc;

/// Echoes the client's clock sample with the server time, reliably.
pub fn handle_time_sync(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    let Some(request) = TimeSyncRequest::decode(body) else {
        debug!("Malformed time sync request from {}", client.net_id());
        return;
    };

    let response = TimeSyncResponse {
        request_time: request.request_time,
        request_seq: request.request_seq,
        server_time: server.server_time_ms(),
    };

    match response.encode() {
        Some(body) => server.send_to_client(client, MSG_TIME_SYNC, &body, true),
        None => error!("Failed to encode time sync reply for {}", client.net_id()),
    }
}
