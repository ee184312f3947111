//! Classification attached to every client drop.

use std::fmt;

/// Resource name used when the server itself initiates a drop.
pub const SERVER_RESOURCE: &str = "_cfx_internal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientDropReason {
    Resource,
    Client,
    Server,
    ClientReplaced,
    ClientConnectionTimedOut,
    ClientConnectionTimedOutWithPendingCommands,
    ServerShutdown,
    StateBagRateLimit,
    NetEventRateLimit,
    LatentNetEventRateLimit,
    CommandRateLimit,
    OneSyncTooManyMissedFrames,
}

impl ClientDropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientDropReason::Resource => "resource",
            ClientDropReason::Client => "client",
            ClientDropReason::Server => "server",
            ClientDropReason::ClientReplaced => "client replaced",
            ClientDropReason::ClientConnectionTimedOut => "timed out",
            ClientDropReason::ClientConnectionTimedOutWithPendingCommands => {
                "timed out with pending commands"
            }
            ClientDropReason::ServerShutdown => "server shutdown",
            ClientDropReason::StateBagRateLimit => "state bag rate limit",
            ClientDropReason::NetEventRateLimit => "net event rate limit",
            ClientDropReason::LatentNetEventRateLimit => "latent net event rate limit",
            ClientDropReason::CommandRateLimit => "command rate limit",
            ClientDropReason::OneSyncTooManyMissedFrames => "too many missed frames",
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            ClientDropReason::StateBagRateLimit
                | ClientDropReason::NetEventRateLimit
                | ClientDropReason::LatentNetEventRateLimit
                | ClientDropReason::CommandRateLimit
        )
    }
}

impl fmt::Display for ClientDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
