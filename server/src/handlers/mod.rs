//! Per-message handlers for connected clients.
//!
//! Every handler follows the same order: rate-limit gates keyed by the
//! sender's network id, an optional handoff to the main or sync context,
//! a bounded decode, then the effect. Malformed bodies are dropped with at
//! most a debug log.

pub mod connect;
pub mod host;
pub mod object_ids;
pub mod quit;
pub mod route;
pub mod server_command;
pub mod server_event;
pub mod state_bag;
pub mod time_sync;

use crate::client::Client;
use crate::drop_reason::{ClientDropReason, SERVER_RESOURCE};
use crate::game_server::GameServer;
use crate::rate_limiter::RateLimiterDefaults;
use log::warn;
use shared::{
    MSG_CONNECT_ACK, MSG_HE_HOST, MSG_IQUIT, MSG_I_HOST, MSG_REQUEST_OBJECT_IDS, MSG_ROUTE,
    MSG_SERVER_COMMAND, MSG_SERVER_EVENT, MSG_STATE_BAG, MSG_TIME_SYNC_REQ,
};
use std::collections::HashMap;
use std::sync::Arc;

pub type Handler = fn(&Arc<GameServer>, &Arc<Client>, &[u8]);

/// Tag to handler lookup, filled once at startup.
pub struct HandlerTable {
    handlers: HashMap<u32, Handler>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        let mut table = Self {
            handlers: HashMap::new(),
        };

        table.register(MSG_CONNECT_ACK, connect::handle_connect_ack);
        table.register(MSG_ROUTE, route::handle_route);
        table.register(MSG_TIME_SYNC_REQ, time_sync::handle_time_sync);
        table.register(MSG_IQUIT, quit::handle_quit);
        table.register(MSG_HE_HOST, host::handle_host_vote);
        table.register(MSG_I_HOST, host::handle_host_announce);
        table.register(MSG_SERVER_COMMAND, server_command::handle_server_command);
        table.register(MSG_SERVER_EVENT, server_event::handle_server_event);
        table.register(MSG_STATE_BAG, state_bag::handle_state_bag);
        table.register(MSG_REQUEST_OBJECT_IDS, object_ids::handle_request_object_ids);

        table
    }

    pub fn register(&mut self, tag: u32, handler: Handler) {
        self.handlers.insert(tag, handler);
    }

    pub fn get(&self, tag: u32) -> Option<Handler> {
        self.handlers.get(&tag).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A soft limiter that drops updates paired with a flood limiter that
/// disconnects.
pub(crate) struct FloodGate {
    pub soft: &'static str,
    pub soft_defaults: RateLimiterDefaults,
    pub flood: &'static str,
    pub flood_defaults: RateLimiterDefaults,
    pub reason: ClientDropReason,
    pub drop_message: &'static str,
    pub what: &'static str,
}

impl FloodGate {
    /// Consumes from both limiters; returns `true` when the message may pass.
    pub fn admit(&self, server: &GameServer, client: &Arc<Client>) -> bool {
        let net_id = client.net_id() as u32;

        let hit_soft = !server
            .net_limiter(self.soft, self.soft_defaults)
            .consume(&net_id);
        let hit_flood = !server
            .net_limiter(self.flood, self.flood_defaults)
            .consume(&net_id);

        if !hit_soft {
            return true;
        }

        if hit_flood {
            if !client.is_dropping() {
                warn!(
                    "Client {} {} got dropped for sending too many {}. \
                     If you believe this to be a mistake please increase rateLimiter_{}_rate and rateLimiter_{}_burst.",
                    client.name(),
                    client.net_id(),
                    self.what,
                    self.flood,
                    self.flood
                );
            }

            server.drop_client_with_reason(client, SERVER_RESOURCE, self.reason, self.drop_message);
            return false;
        }

        if !client.is_dropping() && server.log_limiter(self.soft).consume(&net_id) {
            warn!(
                "Client {} {} sent too many {} and had them dropped. \
                 You can raise the limit with `set rateLimiter_{}_rate [new value]` (default {} per second, burst {}).",
                client.name(),
                client.net_id(),
                self.what,
                self.soft,
                self.soft_defaults.rate,
                self.soft_defaults.burst
            );
        }

        false
    }
}

/// Byte-budget limiter; exhausting it disconnects.
pub(crate) struct SizeGate {
    pub name: &'static str,
    pub defaults: RateLimiterDefaults,
    pub reason: ClientDropReason,
    pub drop_message: &'static str,
}

impl SizeGate {
    pub fn admit(&self, server: &GameServer, client: &Arc<Client>, bytes: usize) -> bool {
        let net_id = client.net_id() as u32;
        if server
            .net_limiter(self.name, self.defaults)
            .consume_n(&net_id, bytes as f64)
        {
            return true;
        }

        if !client.is_dropping() {
            warn!(
                "Client {} {} got dropped for sending too much data ({} bytes). \
                 If you believe this to be a mistake please increase rateLimiter_{}_rate.",
                client.name(),
                client.net_id(),
                bytes,
                self.name
            );
        }

        server.drop_client_with_reason(client, SERVER_RESOURCE, self.reason, self.drop_message);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::game_server::test_support::*;

    const GATE: FloodGate = FloodGate {
        soft: "testSoft",
        soft_defaults: RateLimiterDefaults::new(0.001, 2.0),
        flood: "testFlood",
        flood_defaults: RateLimiterDefaults::new(0.001, 3.0),
        reason: ClientDropReason::CommandRateLimit,
        drop_message: "flood",
        what: "test messages",
    };

    #[test]
    fn test_handler_table_contents() {
        let table = HandlerTable::new();
        assert_eq!(table.len(), 10);
        assert!(table.get(MSG_ROUTE).is_some());
        assert!(table.get(shared::MSG_CONNECT).is_none());
        assert!(table.get(0xDEAD_BEEF).is_none());
    }

    #[test]
    fn test_flood_gate_two_tiers() {
        let (server, _rx) = test_server(ServerConfig::default());
        let client = connected_client(&server, "a", 10001);

        assert!(GATE.admit(&server, &client));
        assert!(GATE.admit(&server, &client));
        // soft exhausted, flood still has one token
        assert!(!GATE.admit(&server, &client));
        assert!(client.is_live());
        // both exhausted
        assert!(!GATE.admit(&server, &client));
        assert!(!client.is_live());
        assert!(client.is_dropping());
    }

    #[test]
    fn test_size_gate_disconnects_on_exhaustion() {
        let (server, _rx) = test_server(ServerConfig::default());
        let client = connected_client(&server, "a", 10001);
        let gate = SizeGate {
            name: "testSize",
            defaults: RateLimiterDefaults::new(0.001, 100.0),
            reason: ClientDropReason::StateBagRateLimit,
            drop_message: "too big",
        };

        assert!(gate.admit(&server, &client, 60));
        assert!(!gate.admit(&server, &client, 60));
        assert!(!client.is_live());
    }
}
