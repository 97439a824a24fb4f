//! Server network layer mapping UDP packets onto the session registry

use crate::chat::ChatLog;
use crate::registry::{RegistryConfig, RegistryError, SessionRegistry};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    Packet, PlayerView, SessionId, CHAT_HISTORY_LEN, DEFAULT_PORT, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub type ServerResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Reason sent back when a client reports state for a session we no longer know
pub const REJECT_UNKNOWN_SESSION: &str = "unknown session, please reconnect";

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    Shutdown,
}

/// Messages sent from the server loop to the sender task
#[derive(Debug)]
pub enum OutgoingMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    Multicast {
        packet: Packet,
        addrs: Vec<SocketAddr>,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How often every connected peer receives the full world state
    pub broadcast_interval: Duration,
    pub chat_history: usize,
    pub registry: RegistryConfig,
}

impl ServerConfig {
    /// Checks the broadcast rate and the embedded registry settings
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.broadcast_interval.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "broadcast interval must be greater than zero".to_string(),
            ));
        }
        self.registry.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            broadcast_interval: Duration::from_millis(100),
            chat_history: CHAT_HISTORY_LEN,
            registry: RegistryConfig::default(),
        }
    }
}

/// Cloneable handle that asks a running server to stop
#[derive(Clone)]
pub struct ShutdownHandle {
    server_tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.server_tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server loop already gone");
        }
    }
}

/// Presence server: owns the socket, the registry and the address bindings
pub struct Server {
    socket: Arc<UdpSocket>,
    registry: Arc<SessionRegistry>,
    /// Which session each client address currently speaks for
    peers: HashMap<SocketAddr, SessionId>,
    chat: ChatLog,
    broadcast_interval: Duration,
    tasks: Vec<JoinHandle<()>>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutgoingMessage>,
    out_rx: Option<mpsc::UnboundedReceiver<OutgoingMessage>>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;
        let registry = Arc::new(SessionRegistry::new(config.registry)?);
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            registry,
            peers: HashMap::new(),
            chat: ChatLog::new(config.chat_history),
            broadcast_interval: config.broadcast_interval,
            tasks: Vec::new(),
            server_tx,
            server_rx,
            out_tx,
            out_rx: Some(out_rx),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server_tx: self.server_tx.clone(),
        }
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&mut self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }));
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let Some(mut out_rx) = self.out_rx.take() else {
            return;
        };
        let socket = Arc::clone(&self.socket);

        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutgoingMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, &[addr]).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutgoingMessage::Multicast { packet, addrs } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, &addrs).await {
                            error!("Failed to multicast packet: {}", e);
                        }
                    }
                }
            }
        }));
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addrs: &[SocketAddr],
    ) -> ServerResult<()> {
        let data = serialize(packet)?;
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(format!("packet of {} bytes exceeds datagram limit", data.len()).into());
        }

        for addr in addrs {
            if let Err(e) = socket.send_to(&data, *addr).await {
                error!("Failed to send to {}: {}", addr, e);
            }
        }
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.out_tx.send(OutgoingMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn multicast_packet(&self, packet: Packet, addrs: Vec<SocketAddr>) {
        if addrs.is_empty() {
            return;
        }
        if let Err(e) = self.out_tx.send(OutgoingMessage::Multicast { packet, addrs }) {
            error!("Failed to queue multicast packet: {}", e);
        }
    }

    /// Processes one client packet against the registry
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                if client_version != PROTOCOL_VERSION {
                    warn!(
                        "Client {} uses protocol version {}, expected {}",
                        addr, client_version, PROTOCOL_VERSION
                    );
                    self.send_packet(
                        Packet::Rejected {
                            reason: format!("unsupported protocol version {}", client_version),
                        },
                        addr,
                    );
                    return;
                }

                // A reconnect from the same address replaces its old session
                if let Some(existing_id) = self.peers.remove(&addr) {
                    info!("Replacing session {} for {}", existing_id, addr);
                    self.registry.unregister(existing_id).await;
                }

                let session_id = self.registry.register().await;
                self.peers.insert(addr, session_id);
                info!("Client {} connected as session {}", addr, session_id);

                self.send_packet(
                    Packet::Connected {
                        session_id,
                        timeout_secs: self.registry.config().timeout.as_secs(),
                    },
                    addr,
                );
            }

            Packet::Update {
                x,
                y,
                map,
                direction,
                party,
            } => {
                let accepted = match self.peers.get(&addr).copied() {
                    Some(id) => self.registry.update(id, x, y, map, direction, party).await,
                    None => false,
                };

                if !accepted {
                    if let Some(id) = self.peers.remove(&addr) {
                        info!("Session {} for {} is gone, asking client to reconnect", id, addr);
                    }
                    self.send_packet(
                        Packet::Rejected {
                            reason: REJECT_UNKNOWN_SESSION.to_string(),
                        },
                        addr,
                    );
                }
            }

            Packet::ListRequest => {
                let players = self.world_snapshot().await;
                self.send_packet(Packet::WorldState { players }, addr);
            }

            Packet::Chat { text } => {
                let Some(&from) = self.peers.get(&addr) else {
                    self.send_packet(
                        Packet::Rejected {
                            reason: REJECT_UNKNOWN_SESSION.to_string(),
                        },
                        addr,
                    );
                    return;
                };

                if let Some(line) = self.chat.push(from, &text) {
                    debug!("Chat from session {}: {}", from, line.text);
                    let addrs = self.peers.keys().copied().collect();
                    self.multicast_packet(Packet::ChatMessage { line }, addrs);
                }
            }

            Packet::ChatHistoryRequest { limit } => {
                let limit = (limit as usize).min(CHAT_HISTORY_LEN);
                let lines = self.chat.recent(limit);
                self.send_packet(Packet::ChatHistory { lines }, addr);
            }

            Packet::Disconnect => {
                if let Some(id) = self.peers.remove(&addr) {
                    self.registry.unregister(id).await;
                    info!("Client {} (session {}) disconnected", addr, id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn world_snapshot(&self) -> Vec<PlayerView> {
        let mut players: Vec<PlayerView> = self.registry.list().await.into_values().collect();
        players.sort_by_key(|player| player.id);
        players
    }

    /// Sends the world state to every peer whose session is still alive
    ///
    /// Bindings for sessions the sweep evicted are dropped here.
    async fn broadcast_world_state(&mut self) {
        if self.peers.is_empty() {
            return;
        }

        let players = self.registry.list().await;
        self.peers.retain(|addr, id| {
            let alive = players.contains_key(id);
            if !alive {
                info!("Dropping {} after session {} expired", addr, id);
            }
            alive
        });

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        let mut players: Vec<PlayerView> = players.into_values().collect();
        players.sort_by_key(|player| player.id);

        self.multicast_packet(Packet::WorldState { players }, addrs);
    }

    /// Main server loop: packets, broadcast ticks and shutdown
    ///
    /// Returns an error if the registry's sweep task dies, since sessions
    /// would otherwise never expire.
    pub async fn run(&mut self) -> ServerResult<()> {
        self.registry.start().await?;
        self.spawn_network_receiver();
        self.spawn_network_sender();

        let mut broadcast_timer = interval(self.broadcast_interval);
        broadcast_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick: u64 = 0;

        let registry = Arc::clone(&self.registry);
        let sweep_failure = registry.sweep_failure();
        tokio::pin!(sweep_failure);

        info!("Server started successfully");

        loop {
            tokio::select! {
                failure = &mut sweep_failure => {
                    error!("Stopping server: {}", failure);
                    for task in self.tasks.drain(..) {
                        task.abort();
                    }
                    return Err(failure.into());
                }

                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                }

                _ = broadcast_timer.tick() => {
                    self.broadcast_world_state().await;
                    tick += 1;

                    if tick % 100 == 0 && !self.peers.is_empty() {
                        let sessions = self.registry.len().await;
                        debug!(
                            "Tick {}: {} peers, {} sessions, {} chat lines",
                            tick,
                            self.peers.len(),
                            sessions,
                            self.chat.len()
                        );
                    }
                }
            }
        }

        self.shutdown().await
    }

    /// Stops the network tasks and the registry sweep
    pub async fn shutdown(&mut self) -> ServerResult<()> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.registry.stop().await?;
        Ok(())
    }
}
