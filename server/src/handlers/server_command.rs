//! `msgServerCommand`: console commands typed by a client.
//!
//! The command runs on the main context with the sender's privileges. What
//! it prints goes back as a `serverPrint` event rather than a raw reply.

use super::FloodGate;
use crate::client::Client;
use crate::console::Privilege;
use crate::drop_reason::ClientDropReason;
use crate::game_server::GameServer;
use crate::rate_limiter::RateLimiterDefaults;
use log::{debug, error};
use shared::{decode_text, NetEvent, MAX_SERVER_COMMAND_SIZE, MSG_NET_EVENT, NO_NET_ID};
use std::sync::Arc;

pub const SERVER_PRINT_EVENT: &str = "__cfx_internal:serverPrint";

const COMMAND_GATE: FloodGate = FloodGate {
    soft: "command",
    soft_defaults: RateLimiterDefaults::new(5.0, 10.0),
    flood: "commandFlood",
    flood_defaults: RateLimiterDefaults::new(10.0, 20.0),
    reason: ClientDropReason::CommandRateLimit,
    drop_message: "Reliable server command overflow.",
    what: "server commands",
};

pub fn handle_server_command(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    if !COMMAND_GATE.admit(server, client) {
        return;
    }

    let Some(command) = decode_text(body, MAX_SERVER_COMMAND_SIZE) else {
        debug!("Malformed server command from {}", client.net_id());
        return;
    };

    let server_ref = Arc::clone(server);
    let client = Arc::clone(client);
    server.main_context().submit(move || {
        if !client.is_live() {
            return;
        }

        let output = server_ref
            .console()
            .execute(&command, Privilege::Client(client.net_id()));
        if output.is_empty() {
            return;
        }

        let event = NetEvent {
            name: SERVER_PRINT_EVENT.to_string(),
            payload: output.into_bytes(),
        };
        match event.encode_from(NO_NET_ID) {
            Some(body) => server_ref.send_to_client(&client, MSG_NET_EVENT, &body, true),
            None => error!("Failed to encode command output for {}", client.net_id()),
        }
    });
}
