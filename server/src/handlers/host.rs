//! Wire entry points for host arbitration; the logic is in [`crate::host`].

use crate::client::Client;
use crate::game_server::GameServer;
use log::debug;
use shared::{FixedPayload, HostAnnounce, HostVote};
use std::sync::Arc;

/// `msgHeHost`: vouch for a candidate.
pub fn handle_host_vote(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    match HostVote::decode(body) {
        Some(vote) => {
            server.host_arbiter().handle_vote(server, client, vote);
        }
        None => debug!("Malformed host vote from {}", client.net_id()),
    }
}

/// `msgIHost`: claim the host role.
pub fn handle_host_announce(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    match HostAnnounce::decode(body) {
        Some(announce) => {
            server
                .host_arbiter()
                .handle_announce(server, client, announce.network_base);
        }
        None => debug!("Malformed host announce from {}", client.net_id()),
    }
}
