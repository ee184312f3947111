//! Host arbitration for servers that do not simulate the world themselves.
//!
//! A host is elected either by announcement (a client claims the role while
//! nobody alive holds it) or by vote (clients vouch for a candidate until it
//! reaches 60% of the clients that have routed traffic). Both paths are
//! no-ops in authoritative mode.
//!
//! The very first vouch for a candidate is recorded as two votes. Thresholds
//! in deployed clients were tuned against that behavior, so it is kept.

use crate::client::Client;
use crate::events::ServerEvent;
use crate::game_server::GameServer;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::{FixedPayload, HostInfo, HostVote, MSG_I_HOST};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Authoritative mode, unknown candidate or vouch for the current host.
    Ignored,
    Counted { votes: u32, needed: u32 },
    Elected { net_id: u16 },
}

/// `ceil(0.6 * routed)`, never less than one.
pub fn votes_needed(routed_clients: usize) -> u32 {
    ((routed_clients as f64 * 0.6).ceil() as u32).max(1)
}

pub struct HostArbiter {
    votes: Mutex<HashMap<u16, u32>>,
}

impl Default for HostArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl HostArbiter {
    pub fn new() -> Self {
        Self {
            votes: Mutex::new(HashMap::new()),
        }
    }

    pub fn tally(&self, candidate: u16) -> Option<u32> {
        self.votes.lock().get(&candidate).copied()
    }

    pub fn is_tally_empty(&self) -> bool {
        self.votes.lock().is_empty()
    }

    pub fn handle_vote(&self, server: &GameServer, voter: &Client, vote: HostVote) -> VoteOutcome {
        if server.is_authoritative() {
            return VoteOutcome::Ignored;
        }

        let registry = server.registry();
        let Some(candidate) = registry.get_client_by_net_id(vote.candidate_net_id) else {
            warn!(
                "Client {} vouched for unknown client {}",
                voter.net_id(),
                vote.candidate_net_id
            );
            return VoteOutcome::Ignored;
        };

        if let Some(host) = registry.get_host() {
            if host.net_id() == candidate.net_id() && host.is_live() {
                debug!(
                    "Client {} vouched for {}, which is already host",
                    voter.net_id(),
                    candidate.net_id()
                );
                return VoteOutcome::Ignored;
            }
        }

        let mut routed = 0;
        registry.for_all_clients(|client| {
            if client.has_routed() {
                routed += 1;
            }
        });
        let needed = votes_needed(routed);

        let votes = {
            let mut tally = self.votes.lock();
            let count = tally.entry(candidate.net_id()).or_insert(1);
            *count += 1;
            let votes = *count;

            if votes >= needed {
                tally.clear();
            }
            votes
        };

        debug!(
            "Client {} vouched for {} ({}/{} votes)",
            voter.net_id(),
            candidate.net_id(),
            votes,
            needed
        );

        if votes < needed {
            return VoteOutcome::Counted { votes, needed };
        }

        info!("Client {} won the host vote", candidate.net_id());
        self.install_host(server, &candidate, vote.network_base);

        VoteOutcome::Elected {
            net_id: candidate.net_id(),
        }
    }

    /// Accepts `claimant` as host if there is none or the current one is dead.
    pub fn handle_announce(
        &self,
        server: &GameServer,
        claimant: &Arc<Client>,
        network_base: u32,
    ) -> bool {
        if server.is_authoritative() {
            return false;
        }

        if let Some(host) = server.registry().get_host() {
            if !host.is_dead() {
                debug!(
                    "Client {} claimed host while {} is alive",
                    claimant.net_id(),
                    host.net_id()
                );
                return false;
            }
        }

        info!(
            "Client {} is now host (base {:#010x})",
            claimant.net_id(),
            network_base
        );
        self.votes.lock().clear();
        self.install_host(server, claimant, network_base);
        true
    }

    fn install_host(&self, server: &GameServer, client: &Arc<Client>, network_base: u32) {
        client.set_network_base(network_base);
        server.registry().set_host(Some(client));

        let info = HostInfo {
            net_id: client.net_id(),
            network_base,
        };

        match info.encode() {
            Some(body) => server.broadcast(MSG_I_HOST, &body, true),
            None => error!("Failed to encode host info for {}", client.net_id()),
        }

        server.emit(ServerEvent::HostChanged {
            net_id: client.net_id(),
            network_base,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::game_server::test_support::*;

    fn routed_clients(server: &GameServer, count: u16) -> Vec<Arc<Client>> {
        (1..=count)
            .map(|i| {
                let client = connected_client(server, &format!("guid{}", i), 10000 + i);
                client.set_has_routed();
                client
            })
            .collect()
    }

    #[test]
    fn test_votes_needed() {
        assert_eq!(votes_needed(0), 1);
        assert_eq!(votes_needed(1), 1);
        assert_eq!(votes_needed(2), 2);
        assert_eq!(votes_needed(5), 3);
        assert_eq!(votes_needed(10), 6);
    }

    #[test]
    fn test_vote_election_with_five_routed_clients() {
        let (server, mut rx) = test_server(ServerConfig::default());
        let clients = routed_clients(&server, 5);
        let arbiter = server.host_arbiter();
        let vote = HostVote {
            candidate_net_id: 1,
            network_base: 0x1234,
        };

        let first = arbiter.handle_vote(&server, &clients[1], vote);
        assert_eq!(first, VoteOutcome::Counted { votes: 2, needed: 3 });
        assert_eq!(arbiter.tally(1), Some(2));
        assert!(server.registry().get_host().is_none());

        let second = arbiter.handle_vote(&server, &clients[2], vote);
        assert_eq!(second, VoteOutcome::Elected { net_id: 1 });
        assert!(arbiter.is_tally_empty());
        assert_eq!(server.registry().get_host().unwrap().net_id(), 1);
        assert_eq!(clients[0].network_base(), 0x1234);

        let broadcasts = sent_with_tag(&drain(&mut rx), MSG_I_HOST);
        assert_eq!(broadcasts.len(), 5);
        for (_, body) in broadcasts {
            assert_eq!(
                HostInfo::decode(&body).unwrap(),
                HostInfo {
                    net_id: 1,
                    network_base: 0x1234
                }
            );
        }
    }

    #[test]
    fn test_vote_for_current_host_not_tallied() {
        let (server, _rx) = test_server(ServerConfig::default());
        let clients = routed_clients(&server, 5);
        server.registry().set_host(Some(&clients[0]));

        let outcome = server.host_arbiter().handle_vote(
            &server,
            &clients[1],
            HostVote {
                candidate_net_id: 1,
                network_base: 7,
            },
        );

        assert_eq!(outcome, VoteOutcome::Ignored);
        assert!(server.host_arbiter().is_tally_empty());
    }

    #[test]
    fn test_vote_for_unknown_candidate_ignored() {
        let (server, _rx) = test_server(ServerConfig::default());
        let clients = routed_clients(&server, 2);

        let outcome = server.host_arbiter().handle_vote(
            &server,
            &clients[0],
            HostVote {
                candidate_net_id: 999,
                network_base: 7,
            },
        );

        assert_eq!(outcome, VoteOutcome::Ignored);
        assert!(server.host_arbiter().is_tally_empty());
    }

    #[test]
    fn test_single_vote_wins_without_routed_clients() {
        let (server, _rx) = test_server(ServerConfig::default());
        let client = connected_client(&server, "solo", 10001);

        let outcome = server.host_arbiter().handle_vote(
            &server,
            &client,
            HostVote {
                candidate_net_id: client.net_id(),
                network_base: 1,
            },
        );

        assert_eq!(
            outcome,
            VoteOutcome::Elected {
                net_id: client.net_id()
            }
        );
    }

    #[test]
    fn test_announce_only_when_no_live_host() {
        let (server, mut rx) = test_server(ServerConfig::default());
        let mut events = server.subscribe();
        let c = connected_client(&server, "c", 10001);
        let d = connected_client(&server, "d", 10002);
        let arbiter = server.host_arbiter();

        assert!(arbiter.handle_announce(&server, &c, 0xDEADBEEF));
        assert_eq!(server.registry().get_host().unwrap().net_id(), c.net_id());

        let broadcasts = sent_with_tag(&drain(&mut rx), MSG_I_HOST);
        assert_eq!(broadcasts.len(), 2);
        assert_eq!(
            HostInfo::decode(&broadcasts[0].1).unwrap(),
            HostInfo {
                net_id: c.net_id(),
                network_base: 0xDEADBEEF
            }
        );

        assert!(!arbiter.handle_announce(&server, &d, 0x1));
        assert_eq!(server.registry().get_host().unwrap().net_id(), c.net_id());
        assert!(sent_with_tag(&drain(&mut rx), MSG_I_HOST).is_empty());

        assert!(matches!(
            events.try_recv().unwrap(),
            ServerEvent::HostChanged {
                network_base: 0xDEADBEEF,
                ..
            }
        ));
    }

    #[test]
    fn test_announce_replaces_dead_host() {
        let (server, _rx) = test_server(ServerConfig::default());
        let c = connected_client(&server, "c", 10001);
        let d = connected_client(&server, "d", 10002);
        let arbiter = server.host_arbiter();

        assert!(arbiter.handle_announce(&server, &c, 1));
        server.drop_client(&c, "gone");

        assert!(arbiter.handle_announce(&server, &d, 2));
        assert_eq!(server.registry().get_host().unwrap().net_id(), d.net_id());
    }

    #[test]
    fn test_arbitration_disabled_when_authoritative() {
        let config = ServerConfig {
            authoritative: true,
            ..ServerConfig::default()
        };
        let (server, mut rx) = test_server(config);
        let c = connected_client(&server, "c", 10001);

        assert!(!server.host_arbiter().handle_announce(&server, &c, 1));
        assert_eq!(
            server.host_arbiter().handle_vote(
                &server,
                &c,
                HostVote {
                    candidate_net_id: c.net_id(),
                    network_base: 1
                }
            ),
            VoteOutcome::Ignored
        );
        assert!(server.registry().get_host().is_none());
        assert!(drain(&mut rx).is_empty());
    }
}
