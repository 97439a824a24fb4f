use crate::roster::RemoteRoster;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    ChatLine, Direction, Packet, PartySnapshot, SessionId, CHAT_HISTORY_LEN, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::{interval, MissedTickBehavior};

pub type ClientResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// How long to wait for `Connected` before sending another `Connect`
pub const CONNECT_RETRY: Duration = Duration::from_secs(1);

/// What the local player currently reports to the server
#[derive(Debug, Clone, PartialEq)]
pub struct LocalState {
    pub x: f32,
    pub y: f32,
    pub map: String,
    pub direction: Direction,
    pub party: Option<PartySnapshot>,
}

impl LocalState {
    pub fn new(map: impl Into<String>) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            map: map.into(),
            direction: Direction::default(),
            party: None,
        }
    }
}

/// Result of handling one server packet
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected(SessionId),
    /// The server forgot us; the next heartbeat reconnects
    Rejected(String),
    WorldUpdated,
    Chat(ChatLine),
    ChatHistory(Vec<ChatLine>),
    Ignored,
}

pub struct PresenceClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    session_id: Option<SessionId>,
    server_timeout: Option<Duration>,
    /// When the last unanswered `Connect` went out
    connect_sent: Option<Instant>,

    roster: RemoteRoster,
    chat: VecDeque<ChatLine>,
}

impl PresenceClient {
    pub async fn new(server_addr: &str) -> ClientResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        Ok(PresenceClient {
            socket,
            server_addr,
            session_id: None,
            server_timeout: None,
            connect_sent: None,
            roster: RemoteRoster::new(),
            chat: VecDeque::with_capacity(CHAT_HISTORY_LEN),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn is_connected(&self) -> bool {
        self.session_id.is_some()
    }

    /// Inactivity timeout announced by the server on connect
    pub fn server_timeout(&self) -> Option<Duration> {
        self.server_timeout
    }

    pub fn roster(&self) -> &RemoteRoster {
        &self.roster
    }

    pub fn chat_lines(&self) -> impl Iterator<Item = &ChatLine> {
        self.chat.iter()
    }

    async fn send_packet(&self, packet: &Packet) -> ClientResult<()> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    pub async fn connect(&mut self) -> ClientResult<()> {
        info!("Connecting to {}...", self.server_addr);
        self.connect_sent = Some(Instant::now());
        self.send_packet(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
        })
        .await
    }

    /// Reports the local state, or (re)connects if we have no session
    pub async fn send_update(&mut self, state: &LocalState) -> ClientResult<()> {
        if self.session_id.is_none() {
            let waiting = self
                .connect_sent
                .is_some_and(|sent| sent.elapsed() < CONNECT_RETRY);
            if !waiting {
                self.connect().await?;
            }
            return Ok(());
        }

        self.send_packet(&Packet::Update {
            x: state.x,
            y: state.y,
            map: state.map.clone(),
            direction: state.direction,
            party: state.party.clone(),
        })
        .await
    }

    pub async fn request_list(&self) -> ClientResult<()> {
        self.send_packet(&Packet::ListRequest).await
    }

    pub async fn send_chat(&self, text: &str) -> ClientResult<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.send_packet(&Packet::Chat {
            text: text.to_string(),
        })
        .await
    }

    pub async fn request_chat_history(&self, limit: u32) -> ClientResult<()> {
        self.send_packet(&Packet::ChatHistoryRequest { limit }).await
    }

    pub async fn disconnect(&mut self) -> ClientResult<()> {
        if self.session_id.take().is_some() {
            self.send_packet(&Packet::Disconnect).await?;
            info!("Disconnected from {}", self.server_addr);
        }
        self.connect_sent = None;
        self.roster.clear();
        Ok(())
    }

    /// Waits for the next packet from the server
    ///
    /// Datagrams from other addresses and undecodable payloads are skipped.
    pub async fn recv_packet(&self) -> ClientResult<Packet> {
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, addr) = self.socket.recv_from(&mut buffer).await?;
            if addr != self.server_addr {
                debug!("Ignoring datagram from {}", addr);
                continue;
            }

            match deserialize::<Packet>(&buffer[0..len]) {
                Ok(packet) => return Ok(packet),
                Err(e) => warn!("Failed to deserialize packet from server: {}", e),
            }
        }
    }

    pub async fn next_event(&mut self) -> ClientResult<ClientEvent> {
        let packet = self.recv_packet().await?;
        Ok(self.handle_packet(packet))
    }

    pub fn handle_packet(&mut self, packet: Packet) -> ClientEvent {
        match packet {
            Packet::Connected {
                session_id,
                timeout_secs,
            } => {
                info!("Connected! Session ID: {}", session_id);
                self.session_id = Some(session_id);
                self.server_timeout = Some(Duration::from_secs(timeout_secs));
                self.connect_sent = None;
                ClientEvent::Connected(session_id)
            }

            Packet::Rejected { reason } => {
                warn!("Rejected by server: {}", reason);
                self.session_id = None;
                self.connect_sent = None;
                self.roster.clear();
                ClientEvent::Rejected(reason)
            }

            Packet::WorldState { players } => {
                self.roster.apply(players, self.session_id);
                ClientEvent::WorldUpdated
            }

            Packet::ChatMessage { line } => {
                self.push_chat(line.clone());
                ClientEvent::Chat(line)
            }

            Packet::ChatHistory { lines } => {
                self.chat.clear();
                for line in &lines {
                    self.push_chat(line.clone());
                }
                ClientEvent::ChatHistory(lines)
            }

            _ => {
                warn!("Unexpected packet type");
                ClientEvent::Ignored
            }
        }
    }

    fn push_chat(&mut self, line: ChatLine) {
        if self.chat.len() == CHAT_HISTORY_LEN {
            self.chat.pop_front();
        }
        self.chat.push_back(line);
    }

    /// Heartbeats `next_state` every `heartbeat` and processes server packets
    ///
    /// Runs until the socket fails; callers stop it by dropping the future.
    /// A zero `heartbeat` is rejected up front.
    pub async fn run<F>(&mut self, heartbeat: Duration, mut next_state: F) -> ClientResult<()>
    where
        F: FnMut() -> LocalState,
    {
        if heartbeat.is_zero() {
            return Err("heartbeat interval must be greater than zero".into());
        }
        self.connect().await?;

        let mut heartbeat_interval = interval(heartbeat);
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut beats: u64 = 0;

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, addr)) if addr == self.server_addr => {
                            if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                                if let ClientEvent::Chat(line) = self.handle_packet(packet) {
                                    info!("[P{}] {}", line.from, line.text);
                                }
                            }
                        }
                        Ok((_, addr)) => debug!("Ignoring datagram from {}", addr),
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = heartbeat_interval.tick() => {
                    let state = next_state();
                    if let Err(e) = self.send_update(&state).await {
                        error!("Error sending update: {}", e);
                    }

                    beats += 1;
                    if beats % 50 == 0 {
                        let nearby = self.roster.on_map(&state.map).len();
                        info!(
                            "Session {:?}: {} players online, {} on {}",
                            self.session_id,
                            self.roster.len(),
                            nearby,
                            state.map
                        );
                    }
                },
            }
        }
    }
}
