//! Second and third handshake steps, after the out-of-band `connect`.

use crate::client::Client;
use crate::game_server::GameServer;
use log::{debug, error};
use shared::{
    decode_text, ConnectOk, FixedPayload, MAX_CONNECT_TOKEN_SIZE, MSG_CONNECT_OK, NO_NET_ID,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// `msgConnect`: binds the token holder to the sending endpoint.
///
/// A token binds once. A repeat from the bound endpoint before the ack is a
/// retransmission and gets the reply again; anything else is discarded.
pub fn handle_connect(server: &Arc<GameServer>, addr: SocketAddr, body: &[u8]) {
    let Some(token) = decode_text(body, MAX_CONNECT_TOKEN_SIZE) else {
        debug!("Malformed connect token from {}", addr);
        return;
    };

    let registry = server.registry();
    let Some(client) = registry.get_client_by_connection_token(&token) else {
        match registry.get_client_by_endpoint(addr) {
            Some(client) if !client.is_connected() => send_connect_ok(server, &client),
            _ => debug!("Unknown connect token from {}", addr),
        }
        return;
    };

    if client.peer().is_none() {
        registry.assign_peer(&client, server.next_peer_id());
    }
    registry.set_endpoint(&client, addr);
    registry.clear_connection_token(&client);
    registry.handle_connecting_client(&client);

    send_connect_ok(server, &client);
}

fn send_connect_ok(server: &GameServer, client: &Client) {
    let host_net_id = server
        .registry()
        .get_host()
        .filter(|host| !host.is_dead())
        .map_or(NO_NET_ID, |host| host.net_id());

    let reply = ConnectOk {
        net_id: client.net_id(),
        slot_id: client.slot_id(),
        host_net_id,
        authoritative: server.is_authoritative(),
        big_mode: server.config().big_mode,
    };

    match reply.encode() {
        Some(body) => server.send_to_client(client, MSG_CONNECT_OK, &body, true),
        None => error!("Failed to encode connect reply for {}", client.net_id()),
    }
}

/// `msgConnectAck`: the client is fully connected.
pub fn handle_connect_ack(server: &Arc<GameServer>, client: &Arc<Client>, _body: &[u8]) {
    if !client.is_connected() {
        server.registry().handle_connected_client(client);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::events::ServerEvent;
    use crate::game_server::test_support::*;
    use shared::{encode_envelope, MSG_CONNECT, MSG_CONNECT_ACK};

    #[test]
    fn test_connect_binds_endpoint_and_replies() {
        let (server, mut rx) = test_server(ServerConfig::default());
        let mut events = server.subscribe();
        let client = server.registry().make_client("license:a").unwrap();
        server.registry().set_connection_token(&client, "tok");

        server.process_datagram(test_addr(10001), &encode_envelope(MSG_CONNECT, b"tok", true));

        assert!(client.peer().is_some());
        assert_eq!(client.endpoint(), Some(test_addr(10001)));
        let found = server.registry().get_client_by_endpoint(test_addr(10001));
        assert!(Arc::ptr_eq(&found.unwrap(), &client));

        let replies = sent_with_tag(&drain(&mut rx), MSG_CONNECT_OK);
        assert_eq!(replies.len(), 1);
        let reply = ConnectOk::decode(&replies[0].1).unwrap();
        assert_eq!(reply.net_id, client.net_id());
        assert_eq!(reply.slot_id, client.slot_id());
        assert_eq!(reply.host_net_id, NO_NET_ID);
        assert!(!reply.authoritative);

        assert!(matches!(
            events.try_recv().unwrap(),
            ServerEvent::ClientConnecting { .. }
        ));

        server.process_datagram(test_addr(10001), &encode_envelope(MSG_CONNECT_ACK, &[], true));
        assert!(client.is_connected());
        assert!(matches!(
            events.try_recv().unwrap(),
            ServerEvent::ClientConnected { .. }
        ));
    }

    #[test]
    fn test_connect_reports_live_host() {
        let (server, mut rx) = test_server(ServerConfig::default());
        let host = connected_client(&server, "host", 10001);
        server.registry().set_host(Some(&host));

        let client = server.registry().make_client("license:b").unwrap();
        server.registry().set_connection_token(&client, "tok-b");
        server.process_datagram(test_addr(10002), &encode_envelope(MSG_CONNECT, b"tok-b\0", true));

        let replies = sent_with_tag(&drain(&mut rx), MSG_CONNECT_OK);
        assert_eq!(ConnectOk::decode(&replies[0].1).unwrap().host_net_id, host.net_id());
    }

    #[test]
    fn test_unknown_token_discarded() {
        let (server, mut rx) = test_server(ServerConfig::default());
        server.process_datagram(test_addr(10001), &encode_envelope(MSG_CONNECT, b"nope", true));
        server.process_datagram(
            test_addr(10001),
            &encode_envelope(MSG_CONNECT, &[b'x'; MAX_CONNECT_TOKEN_SIZE + 1], true),
        );

        assert!(drain(&mut rx).is_empty());
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_token_binds_once() {
        let (server, mut rx) = test_server(ServerConfig::default());
        let mut events = server.subscribe();
        let client = server.registry().make_client("license:a").unwrap();
        server.registry().set_connection_token(&client, "tok");

        let connect = encode_envelope(MSG_CONNECT, b"tok", true);
        server.process_datagram(test_addr(10001), &connect);
        assert!(server.registry().get_client_by_connection_token("tok").is_none());

        // replay from elsewhere cannot steal the session
        server.process_datagram(test_addr(20002), &connect);
        assert_eq!(client.endpoint(), Some(test_addr(10001)));
        assert!(server.registry().get_client_by_endpoint(test_addr(20002)).is_none());

        // retransmission from the bound endpoint repeats the reply
        server.process_datagram(test_addr(10001), &connect);
        let replies = sent_with_tag(&drain(&mut rx), MSG_CONNECT_OK);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], replies[1]);

        let connecting = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|event| matches!(event, ServerEvent::ClientConnecting { .. }))
            .count();
        assert_eq!(connecting, 1);

        server.process_datagram(test_addr(10001), &encode_envelope(MSG_CONNECT_ACK, &[], true));
        server.process_datagram(test_addr(10001), &connect);
        assert!(sent_with_tag(&drain(&mut rx), MSG_CONNECT_OK).is_empty());
    }
}
