//! Plaintext datagrams exchanged before a client has a network id.
//!
//! The first token names the command and the rest of the line is its
//! argument string. Every command is gated by a limiter keyed on the sender's
//! address, coarsened to the host, except for configured trusted proxies.

use crate::console::Privilege;
use crate::drop_reason::{ClientDropReason, SERVER_RESOURCE};
use crate::error::RegistryError;
use crate::game_server::GameServer;
use crate::rate_limiter::RateLimiterDefaults;
use log::{debug, error, info, warn};
use rand::Rng;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

const INFO_LIMIT: RateLimiterDefaults = RateLimiterDefaults::new(2.0, 10.0);
const RCON_LIMIT: RateLimiterDefaults = RateLimiterDefaults::new(0.2, 5.0);
const CONNECT_LIMIT: RateLimiterDefaults = RateLimiterDefaults::new(2.0, 5.0);

pub const INVALID_PASSWORD_REPLY: &str = "print Invalid password.\n";
pub const RCON_DISABLED_REPLY: &str =
    "print The server must set rcon_password to be able to use this command.\n";

pub fn handle_out_of_band(server: &Arc<GameServer>, addr: SocketAddr, text: &str) {
    let line = text.trim_end_matches(['\0', '\n', '\r']);
    let (command, args) = line.split_once(' ').unwrap_or((line, ""));

    match command {
        "getinfo" => handle_getinfo(server, addr, args),
        "getstatus" => handle_getstatus(server, addr),
        "rcon" => handle_rcon(server, addr, args),
        "connect" => handle_connect(server, addr, args),
        _ => debug!("Unknown out-of-band command {:?} from {}", command, addr),
    }
}

fn admit(server: &GameServer, addr: SocketAddr, name: &str, defaults: RateLimiterDefaults) -> bool {
    if server.is_trusted_proxy(addr.ip()) {
        return true;
    }

    server.address_limiter(name, defaults).consume(&addr)
}

fn variable(server: &GameServer, name: &str) -> String {
    server.console().get_variable(name).unwrap_or_default()
}

fn handle_getinfo(server: &GameServer, addr: SocketAddr, challenge: &str) {
    if !admit(server, addr, "getinfo", INFO_LIMIT) {
        return;
    }

    let mut reply = String::from("infoResponse\n");
    let _ = write!(
        reply,
        "\\hostname\\{}\\clients\\{}\\sv_maxclients\\{}\\gametype\\{}\\mapname\\{}\\challenge\\{}",
        variable(server, "sv_hostname"),
        server.registry().len(),
        variable(server, "sv_maxclients"),
        variable(server, "gametype"),
        variable(server, "mapname"),
        challenge.trim()
    );

    server.send_out_of_band(addr, &reply);
}

fn handle_getstatus(server: &GameServer, addr: SocketAddr) {
    if !admit(server, addr, "getstatus", INFO_LIMIT) {
        return;
    }

    let mut reply = String::from("statusResponse\n");
    for (name, value) in server.console().server_info() {
        let _ = write!(reply, "\\{}\\{}", name, value);
    }
    let _ = write!(reply, "\\clients\\{}\n", server.registry().len());

    server.registry().for_all_clients(|client| {
        let _ = writeln!(
            reply,
            "{} {} \"{}\"",
            client.net_id(),
            client.ping_ms(),
            client.name()
        );
    });

    server.send_out_of_band(addr, &reply);
}

fn handle_rcon(server: &GameServer, addr: SocketAddr, args: &str) {
    let limiter = server.address_limiter("rcon", RCON_LIMIT);
    let trusted = server.is_trusted_proxy(addr.ip());
    if !trusted && !limiter.consume(&addr) {
        debug!("Rate limited rcon attempt from {}", addr);
        return;
    }

    // read live so `set rcon_password` takes effect without a restart
    let password = variable(server, "rcon_password");
    if password.is_empty() {
        server.send_out_of_band(addr, RCON_DISABLED_REPLY);
        return;
    }

    let (given, command) = args.trim_start().split_once(' ').unwrap_or((args.trim(), ""));
    let given = given.trim_matches('"');

    if given != password {
        warn!("Bad rcon password from {}", addr);
        server.send_out_of_band(addr, INVALID_PASSWORD_REPLY);
        return;
    }

    limiter.reset(&addr);
    info!("Rcon from {}: {}", addr, command);

    let output = server.console().execute(command, Privilege::Console);
    server.send_out_of_band(addr, &format!("print {}", output));
}

fn handle_connect(server: &GameServer, addr: SocketAddr, args: &str) {
    if !admit(server, addr, "connect", CONNECT_LIMIT) {
        return;
    }

    let (guid, name) = args.trim().split_once(' ').unwrap_or((args.trim(), ""));
    if guid.is_empty() {
        debug!("Connect without identity from {}", addr);
        return;
    }

    let registry = server.registry();
    if let Some(existing) = registry.get_client_by_guid(guid) {
        server.drop_client_with_reason(
            &existing,
            SERVER_RESOURCE,
            ClientDropReason::ClientReplaced,
            "Reconnecting",
        );
    }

    let client = match registry.make_client(guid) {
        Ok(client) => client,
        Err(RegistryError::Full { .. }) => {
            server.send_out_of_band(addr, "error Server is full.");
            return;
        }
        Err(e) => {
            error!("Could not register {} from {}: {}", guid, addr, e);
            server.send_out_of_band(addr, "error Could not register client.");
            return;
        }
    };

    let token = connection_token();
    client.set_name(name.trim().trim_matches('"'));
    registry.set_tcp_endpoint(&client, &addr.ip().to_string());
    registry.set_connection_token(&client, &token);

    server.send_out_of_band(addr, &format!("connectResponse {}", token));
}

fn connection_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}
