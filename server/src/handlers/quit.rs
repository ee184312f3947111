use crate::client::Client;
use crate::drop_reason::ClientDropReason;
use crate::game_server::GameServer;
use log::debug;
use shared::{decode_text, MAX_QUIT_REASON_SIZE};
use std::sync::Arc;

/// `msgIQuit`: the client is leaving. The drop runs on the main context.
pub fn handle_quit(server: &Arc<GameServer>, client: &Arc<Client>, body: &[u8]) {
    let Some(reason) = decode_text(body, MAX_QUIT_REASON_SIZE) else {
        debug!("Malformed quit reason from {}", client.net_id());
        return;
    };

    let server_ref = Arc::clone(server);
    let client = Arc::clone(client);
    server.main_context().submit(move || {
        server_ref.drop_client_with_reason(&client, "", ClientDropReason::Client, &reason);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::events::ServerEvent;
    use crate::game_server::test_support::*;
    use shared::{encode_envelope, MSG_IQUIT};

    fn assert_single_client_drop(events: Vec<ServerEvent>, expected: &str) {
        assert_eq!(events.len(), 1);
        match &events[0] {
            ServerEvent::ClientDropped {
                reason, message, ..
            } => {
                assert_eq!(*reason, ClientDropReason::Client);
                assert_eq!(message, expected);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_quit_with_long_reason() {
        let reason = "r".repeat(1023);

        for body in [reason.clone().into_bytes(), format!("{}\0", reason).into_bytes()] {
            let (server, _rx) = test_server(ServerConfig::default());
            let mut events = server.subscribe();
            connected_client(&server, "a", 10001);

            server.process_datagram(test_addr(10001), &encode_envelope(MSG_IQUIT, &body, true));
            // a second quit before the first is processed must not drop twice
            server.process_datagram(test_addr(10001), &encode_envelope(MSG_IQUIT, &body, true));
            server.main_context().run_pending();

            assert_single_client_drop(drop_events(&mut events), &reason);
            assert!(server.registry().is_empty());
        }
    }

    #[test]
    fn test_oversized_or_invalid_quit_ignored() {
        let (server, _rx) = test_server(ServerConfig::default());
        let mut events = server.subscribe();
        let client = connected_client(&server, "a", 10001);

        let oversized = vec![b'r'; MAX_QUIT_REASON_SIZE + 1];
        handle_quit(&server, &client, &oversized);
        handle_quit(&server, &client, &[0xFF, 0xFE]);

        assert_eq!(server.main_context().run_pending(), 0);
        assert!(drop_events(&mut events).is_empty());
        assert!(client.is_live());
    }
}
