//! The server frame and dispatch shell.
//!
//! `GameServer` owns everything a handler may touch: the client registry,
//! the console, the named rate limiters, the host arbiter, the execution
//! contexts and the outbound packet queue. The transport in
//! [`network`](crate::network) feeds datagrams in through
//! [`GameServer::inbound_sender`] and calls [`GameServer::process_server_frame`]
//! on every poll; packets leave through the [`OutgoingPacket`] channel
//! returned by [`GameServer::new`].

use crate::client::{Client, PeerId};
use crate::client_registry::ClientRegistry;
use crate::collaborators::Collaborators;
use crate::config::ServerConfig;
use crate::console::Console;
use crate::drop_reason::{ClientDropReason, SERVER_RESOURCE};
use crate::events::{emit, event_channel, EventReceiver, EventSender, ServerEvent};
use crate::execution::ExecutionQueue;
use crate::handlers::{self, HandlerTable};
use crate::host::HostArbiter;
use crate::out_of_band;
use crate::rate_limiter::{
    burst_variable, rate_variable, KeyedRateLimiter, RateLimiterDefaults, RateLimiterStore,
};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use shared::{encode_envelope, encode_out_of_band, Envelope, MSG_CONNECT, MSG_DROPPED};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::mpsc;

/// A datagram queued for the sender task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingPacket {
    Connected {
        net_id: u16,
        addr: SocketAddr,
        data: Vec<u8>,
    },
    OutOfBand {
        addr: SocketAddr,
        data: Vec<u8>,
    },
}

impl OutgoingPacket {
    pub fn addr(&self) -> SocketAddr {
        match self {
            OutgoingPacket::Connected { addr, .. } | OutgoingPacket::OutOfBand { addr, .. } => {
                *addr
            }
        }
    }

    pub fn data(&self) -> &[u8] {
        match self {
            OutgoingPacket::Connected { data, .. } | OutgoingPacket::OutOfBand { data, .. } => {
                data
            }
        }
    }
}

#[derive(Debug)]
pub struct InboundDatagram {
    pub addr: SocketAddr,
    pub data: Vec<u8>,
}

type TickObserver = Box<dyn Fn(u64) + Send + Sync>;

struct FrameClock {
    residual_ms: f64,
    frame: u64,
}

pub struct GameServer {
    config: ServerConfig,
    registry: Arc<ClientRegistry>,
    console: Arc<Console>,
    net_limiters: RateLimiterStore<u32>,
    address_limiters: RateLimiterStore<SocketAddr>,
    log_limiters: Mutex<HashMap<&'static str, Arc<KeyedRateLimiter<u32>>>>,
    host: HostArbiter,
    handlers: HandlerTable,
    collaborators: Collaborators,
    main_context: ExecutionQueue,
    sync_context: ExecutionQueue,
    outbox: mpsc::UnboundedSender<OutgoingPacket>,
    inbox_tx: mpsc::UnboundedSender<InboundDatagram>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<InboundDatagram>>,
    events: EventSender,
    clock: Mutex<FrameClock>,
    tick_observers: RwLock<Vec<TickObserver>>,
    next_peer: AtomicU32,
    started: Instant,
}

impl GameServer {
    pub fn new(
        config: ServerConfig,
        collaborators: Collaborators,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutgoingPacket>) {
        let config = config.normalized();
        let console = Arc::new(Console::new());
        let events = event_channel();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        seed_variables(&console, &config);

        let server = Arc::new(Self {
            registry: Arc::new(ClientRegistry::new(config.max_clients, events.clone())),
            net_limiters: RateLimiterStore::new(Arc::clone(&console)),
            address_limiters: RateLimiterStore::new(Arc::clone(&console)),
            log_limiters: Mutex::new(HashMap::new()),
            host: HostArbiter::new(),
            handlers: HandlerTable::new(),
            collaborators,
            main_context: ExecutionQueue::new("main"),
            sync_context: ExecutionQueue::new("sync"),
            outbox,
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            events,
            clock: Mutex::new(FrameClock {
                residual_ms: 0.0,
                frame: 0,
            }),
            tick_observers: RwLock::new(Vec::new()),
            next_peer: AtomicU32::new(1),
            started: Instant::now(),
            console,
            config,
        });

        server.register_console_commands();

        info!(
            "Session core ready: {} slots, {} mode, rcon {}",
            server.config.max_clients,
            if server.config.authoritative {
                "authoritative"
            } else {
                "host-arbitrated"
            },
            if server.config.rcon_enabled() {
                "enabled"
            } else {
                "disabled"
            }
        );

        (server, outbox_rx)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn console(&self) -> &Arc<Console> {
        &self.console
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn host_arbiter(&self) -> &HostArbiter {
        &self.host
    }

    pub fn main_context(&self) -> &ExecutionQueue {
        &self.main_context
    }

    pub fn sync_context(&self) -> &ExecutionQueue {
        &self.sync_context
    }

    pub fn is_authoritative(&self) -> bool {
        self.config.authoritative
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        emit(&self.events, event);
    }

    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundDatagram> {
        self.inbox_tx.clone()
    }

    /// Milliseconds since the server started.
    pub fn server_time_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn frame(&self) -> u64 {
        self.clock.lock().frame
    }

    pub(crate) fn next_peer_id(&self) -> PeerId {
        self.next_peer.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_trusted_proxy(&self, ip: IpAddr) -> bool {
        self.config.trusted_proxies.contains(&ip)
    }

    /// Limiter keyed by client network id, re-tuned from the console.
    pub fn net_limiter(
        &self,
        name: &str,
        defaults: RateLimiterDefaults,
    ) -> Arc<KeyedRateLimiter<u32>> {
        self.net_limiters.get_rate_limiter(name, defaults)
    }

    /// Limiter keyed by the sender's network address.
    pub fn address_limiter(
        &self,
        name: &str,
        defaults: RateLimiterDefaults,
    ) -> Arc<KeyedRateLimiter<SocketAddr>> {
        self.address_limiters.get_rate_limiter(name, defaults)
    }

    /// One warning per second per client for the given channel.
    pub(crate) fn log_limiter(&self, channel: &'static str) -> Arc<KeyedRateLimiter<u32>> {
        let mut limiters = self.log_limiters.lock();
        Arc::clone(
            limiters
                .entry(channel)
                .or_insert_with(|| Arc::new(KeyedRateLimiter::new(1.0, 1.0))),
        )
    }

    pub fn add_tick_observer<F>(&self, observer: F)
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.tick_observers.write().push(Box::new(observer));
    }

    fn queue(&self, packet: OutgoingPacket) {
        if let Err(e) = self.outbox.send(packet) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    /// Best-effort plaintext datagram to an address with no client attached.
    pub fn send_out_of_band(&self, addr: SocketAddr, text: &str) {
        self.queue(OutgoingPacket::OutOfBand {
            addr,
            data: encode_out_of_band(text),
        });
    }

    pub fn send_to_client(&self, client: &Client, tag: u32, body: &[u8], reliable: bool) {
        let Some(addr) = client.endpoint() else {
            debug!("Client {} has no endpoint yet, not sending", client.net_id());
            return;
        };

        if reliable {
            client.note_reliable_sent();
        }

        self.queue(OutgoingPacket::Connected {
            net_id: client.net_id(),
            addr,
            data: encode_envelope(tag, body, reliable),
        });
    }

    /// Sends to every registered client that has completed the handshake
    /// far enough to have an endpoint.
    pub fn broadcast(&self, tag: u32, body: &[u8], reliable: bool) {
        self.registry.for_all_clients(|client| {
            if client.endpoint().is_some() {
                self.send_to_client(client, tag, body, reliable);
            }
        });
    }

    /// Server-initiated drop.
    pub fn drop_client(&self, client: &Arc<Client>, message: &str) -> bool {
        self.drop_client_with_reason(client, SERVER_RESOURCE, ClientDropReason::Server, message)
    }

    /// Tears a client down: final notice, registry removal, drop event.
    ///
    /// Only the first call for a client has any effect.
    pub fn drop_client_with_reason(
        &self,
        client: &Arc<Client>,
        resource: &str,
        reason: ClientDropReason,
        message: &str,
    ) -> bool {
        if !client.begin_drop() {
            return false;
        }

        if reason.is_rate_limit() {
            warn!(
                "Dropping client {} ({}) for flooding [{}]: {}",
                client.net_id(),
                client.name(),
                reason,
                message
            );
        } else {
            info!(
                "Dropping client {} ({}) [{}]: {}",
                client.net_id(),
                client.name(),
                reason,
                message
            );
        }

        self.send_to_client(client, MSG_DROPPED, message.as_bytes(), true);
        self.registry.remove_client(client);

        // queued behind any allocation already submitted for this client
        let object_ids = Arc::clone(&self.collaborators.object_ids);
        let released = Arc::clone(client);
        self.main_context
            .submit(move || object_ids.release_client(&released));

        self.emit(ServerEvent::ClientDropped {
            net_id: client.net_id(),
            guid: client.guid().to_string(),
            reason,
            resource: resource.to_string(),
            message: message.to_string(),
        });

        true
    }

    /// Drains the transport, dispatches what arrived and runs as many logical
    /// ticks as the accumulated frame time covers. Returns the tick count.
    pub fn process_server_frame(self: &Arc<Self>, frame_time_ms: u64) -> u32 {
        loop {
            let datagram = self.inbox_rx.lock().try_recv();
            match datagram {
                Ok(datagram) => self.process_datagram(datagram.addr, &datagram.data),
                Err(_) => break,
            }
        }

        let tick_ms = self.config.tick_duration().as_nanos() as f64 / 1_000_000.0;
        let ticks = {
            let mut clock = self.clock.lock();
            clock.residual_ms += frame_time_ms as f64;

            let mut ticks = 0;
            while clock.residual_ms >= tick_ms {
                clock.residual_ms -= tick_ms;
                ticks += 1;
            }
            ticks
        };

        for _ in 0..ticks {
            self.tick();
        }

        ticks
    }

    fn tick(&self) {
        let frame = {
            let mut clock = self.clock.lock();
            clock.frame += 1;
            clock.frame
        };

        self.check_timeouts();
        self.collaborators.game_state.tick(frame);

        for observer in self.tick_observers.read().iter() {
            observer(frame);
        }
    }

    fn check_timeouts(&self) {
        let timeout = self.config.client_timeout();

        self.registry.for_all_clients(|client| {
            if !client.is_timed_out(timeout) {
                return;
            }

            let reason = if client.has_pending_reliable() {
                ClientDropReason::ClientConnectionTimedOutWithPendingCommands
            } else {
                ClientDropReason::ClientConnectionTimedOut
            };

            warn!("Client {} ({}) timed out", client.net_id(), client.name());
            self.drop_client_with_reason(
                client,
                SERVER_RESOURCE,
                reason,
                &format!("Timed out after {} seconds.", timeout.as_secs()),
            );
        });
    }

    /// Handles one raw datagram. Malformed input is discarded here.
    pub fn process_datagram(self: &Arc<Self>, addr: SocketAddr, data: &[u8]) {
        if let Some(text) = shared::parse_out_of_band(data) {
            out_of_band::handle_out_of_band(self, addr, text);
            return;
        }

        let Some(envelope) = Envelope::parse(data) else {
            debug!("Discarding malformed datagram from {}", addr);
            return;
        };

        if envelope.tag == MSG_CONNECT {
            handlers::connect::handle_connect(self, addr, envelope.body);
            return;
        }

        let Some(client) = self.registry.get_client_by_endpoint(addr) else {
            debug!("Discarding datagram from unknown endpoint {}", addr);
            return;
        };

        client.touch();

        match self.handlers.get(envelope.tag) {
            Some(handler) => handler(self, &client, envelope.body),
            None => debug!(
                "No handler for tag {:#010x} from {}",
                envelope.tag,
                client.net_id()
            ),
        }
    }

    /// Drops every client before the process exits.
    pub fn shutdown(&self) {
        self.registry.for_all_clients(|client| {
            self.drop_client_with_reason(
                client,
                SERVER_RESOURCE,
                ClientDropReason::ServerShutdown,
                "Server shutting down.",
            );
        });
    }

    fn register_console_commands(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.console.register_command("status", false, move |_, output| {
            let Some(server) = weak.upgrade() else {
                return;
            };

            output.push_str(&format!(
                "{} of {} clients connected\n",
                server.registry.len(),
                server.config.max_clients
            ));
            server.registry.for_all_clients(|client| {
                let endpoint = client
                    .endpoint()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| "-".to_string());
                output.push_str(&format!(
                    "{} {} \"{}\" {}\n",
                    client.net_id(),
                    client.guid(),
                    client.name(),
                    endpoint
                ));
            });
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        self.console.register_command("clientkick", true, move |args, output| {
            let Some(server) = weak.upgrade() else {
                return;
            };

            let Some(net_id) = args.first().and_then(|arg| arg.parse::<u16>().ok()) else {
                output.push_str("usage: clientkick <netId> <reason>\n");
                return;
            };

            match server.registry.get_client_by_net_id(net_id) {
                Some(client) => {
                    let reason = if args.len() > 1 {
                        args[1..].join(" ")
                    } else {
                        "Kicked.".to_string()
                    };
                    server.drop_client_with_reason(
                        &client,
                        SERVER_RESOURCE,
                        ClientDropReason::Server,
                        &reason,
                    );
                }
                None => output.push_str(&format!("No client with net id {}.\n", net_id)),
            }
        });
    }
}

fn seed_variables(console: &Console, config: &ServerConfig) {
    console.register_variable("sv_hostname", &config.hostname, true);
    console.register_variable("sv_maxclients", &config.max_clients.to_string(), true);
    console.register_variable("gametype", &config.game_type, true);
    console.register_variable("mapname", &config.map_name, true);
    console.register_protected_variable(
        "rcon_password",
        config.rcon_password.as_deref().unwrap_or(""),
    );

    for (name, limits) in &config.rate_limiters {
        console.set_variable(&rate_variable(name), &limits.rate.to_string());
        console.set_variable(&burst_variable(name), &limits.burst.to_string());
    }
}
