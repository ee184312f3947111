//! UDP transport and the poll loop that drives the server frame.
//!
//! A receiver task forwards raw datagrams into the [`GameServer`] inbox, a
//! sender task drains the outbound queue, and the poll loop calls
//! [`GameServer::process_server_frame`] with the wall time that passed since
//! the previous poll. The main and sync execution contexts run on their own
//! threads for as long as the server does.

use crate::collaborators::Collaborators;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::game_server::{GameServer, InboundDatagram, OutgoingPacket};
use log::{debug, error, info};
use shared::MAX_DATAGRAM_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, MissedTickBehavior};

/// Stops a running [`NetworkServer`] from another task.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

pub struct NetworkServer {
    socket: Arc<UdpSocket>,
    server: Arc<GameServer>,
    outbox_rx: Option<mpsc::UnboundedReceiver<OutgoingPacket>>,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl NetworkServer {
    pub async fn bind(
        config: ServerConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ServerError> {
        let address = config.bind_address();
        let bind_addr: SocketAddr = address
            .parse()
            .map_err(|_| ServerError::InvalidAddress(address.clone()))?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
        let (server, outbox_rx) = GameServer::new(config, collaborators);

        Ok(Self {
            socket,
            server,
            outbox_rx: Some(outbox_rx),
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn game_server(&self) -> &Arc<GameServer> {
        &self.server
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Spawns task that continuously listens for incoming datagrams
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let inbox = self.server.inbound_sender();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let datagram = InboundDatagram {
                            addr,
                            data: buffer[..len].to_vec(),
                        };
                        if inbox.send(datagram).is_err() {
                            debug!("Server inbox closed, receiver stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outbox_rx) = self.outbox_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(packet) = outbox_rx.recv().await {
                let addr = packet.addr();
                if let Err(e) = socket.send_to(packet.data(), addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Polls until ctrl-c or [`ShutdownHandle::shutdown`], then drops every
    /// client.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let _main = self.server.main_context().spawn_worker()?;
        let _sync = self.server.sync_context().spawn_worker()?;
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_frame = Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let elapsed_ms = last_frame.elapsed().as_millis() as u64;
                    // carry the sub-millisecond remainder into the next frame
                    last_frame += Duration::from_millis(elapsed_ms);
                    self.server.process_server_frame(elapsed_ms);
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown requested");
                    break;
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Failed to listen for ctrl-c: {}", e);
                    }
                    info!("Interrupted, shutting down");
                    break;
                }
            }
        }

        self.server.shutdown();
        // give the sender task a moment to flush the drop notices
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(())
    }
}
