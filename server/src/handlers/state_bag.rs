//! `msgStateBag`: replicated key/value updates.
//!
//! All work, including the limiter checks, happens on the sync context.
//! Three limiters apply: a soft one that drops updates, a flood one that
//! disconnects and a byte budget that also disconnects.

use super::{FloodGate, SizeGate};
use crate::client::Client;
use crate::drop_reason::ClientDropReason;
use crate::game_server::GameServer;
use crate::rate_limiter::RateLimiterDefaults;
use log::debug;
use shared::MAX_STATE_BAG_SIZE;
use std::sync::Arc;

const STATE_BAG_GATE: FloodGate = FloodGate {
    soft: "stateBag",
    soft_defaults: RateLimiterDefaults::new(75.0, 125.0),
    flood: "stateBagFlood",
    flood_defaults: RateLimiterDefaults::new(150.0, 175.0),
    reason: ClientDropReason::StateBagRateLimit,
    drop_message: "Reliable state bag packet overflow.",
    what: "state bag value updates",
};

const STATE_BAG_SIZE_GATE: SizeGate = SizeGate {
    name: "stateBagSize",
    defaults: RateLimiterDefaults::new(128.0 * 1024.0, 256.0 * 1024.0),
    reason: ClientDropReason::StateBagRateLimit,
    drop_message: "Reliable state bag packet overflow.",
};

pub fn handle_state_bag(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    if body.is_empty() || body.len() > MAX_STATE_BAG_SIZE {
        debug!("Discarding {} byte state bag from {}", body.len(), client.net_id());
        return;
    }

    let server_ref = Arc::clone(server);
    let client = Arc::clone(client);
    let data = body.to_vec();

    server.sync_context().submit(move || {
        if !client.is_live() {
            return;
        }

        if !STATE_BAG_GATE.admit(&server_ref, &client)
            || !STATE_BAG_SIZE_GATE.admit(&server_ref, &client, data.len())
        {
            return;
        }

        server_ref
            .collaborators()
            .state_bags
            .handle_state_bag(client.slot_id(), &data);
    });
}
