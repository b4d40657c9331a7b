//! WebSocket relay: a group channel service between processes.
//!
//! Architecture:
//! ```text
//! Peer A ──┐                                  ┌──► Peer A
//!          ├── RelayServer ── room (channel) ─┼──► Peer B
//! Peer B ──┘                                  └──► Peer C
//! ```
//!
//! Every connection first sends [`RelayFrame::Join`], then
//! [`RelayFrame::Message`] frames. The server stamps each message with the
//! member id the connection joined as and fans it out to every member of the
//! room, sender included. Frames are bincode-encoded binary messages.
//!
//! [`RelayService`] is the client side: a [`GroupService`] for one activity
//! channel hosted by a relay.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::channel::{
    ChannelId, ChannelInfo, ChannelState, ChatChannel, Envelope, GroupService, MemberId,
    Outbound, TransportError,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Frames exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// First frame of a connection: join a channel under a member id.
    Join { channel: ChannelId, member: MemberId },
    /// One channel message.
    Message(Envelope),
}

impl RelayFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(frame)
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Joins beyond this many members per channel are refused
    pub max_members_per_channel: usize,
    /// Frames buffered per member before it starts lagging
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9190".to_string(),
            max_members_per_channel: 64,
            broadcast_capacity: 256,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
}

/// Members of one channel and the fan-out sender they share.
struct RelayRoom {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    members: HashSet<MemberId>,
}

type Rooms = Arc<RwLock<HashMap<ChannelId, RelayRoom>>>;

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Rooms,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats.clone(), config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.write().await.active_connections -= 1;
            });
        }
    }

    /// Current statistics.
    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Number of members joined to a channel.
    pub async fn member_count(&self, channel: ChannelId) -> usize {
        self.rooms
            .read()
            .await
            .get(&channel)
            .map_or(0, |room| room.members.len())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Rooms,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
    ) -> Result<(), BoxError> {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let mut joined: Option<(ChannelId, MemberId, broadcast::Sender<Arc<Vec<u8>>>)> = None;
        let mut room_rx: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => match msg {
                        Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                            Ok(RelayFrame::Join { channel, member }) if joined.is_none() => {
                                let mut rooms_w = rooms.write().await;
                                let room = rooms_w.entry(channel).or_insert_with(|| RelayRoom {
                                    sender: broadcast::channel(config.broadcast_capacity).0,
                                    members: HashSet::new(),
                                });
                                if room.members.len() >= config.max_members_per_channel {
                                    log::warn!("Channel {channel} is full, refusing {addr}");
                                    return Err(TransportError::ChannelFull(channel).into());
                                }
                                if room.members.contains(&member) {
                                    log::warn!(
                                        "{addr} reused member {member} on channel {channel}, refusing"
                                    );
                                    return Err(TransportError::DuplicateMember(member).into());
                                }
                                room.members.insert(member);
                                room_rx = Some(room.sender.subscribe());
                                joined = Some((channel, member, room.sender.clone()));
                                log::info!("{addr} joined channel {channel} as {member}");
                            }
                            Ok(RelayFrame::Message(envelope)) => {
                                let Some((_, member, sender)) = &joined else {
                                    log::warn!("Message from {addr} before join, dropped");
                                    continue;
                                };
                                let frame = RelayFrame::Message(Envelope {
                                    sender: *member,
                                    text: envelope.text,
                                });
                                // No receivers just means the room emptied meanwhile.
                                let _ = sender.send(Arc::new(frame.encode()?));
                                stats.write().await.total_messages += 1;
                            }
                            Ok(RelayFrame::Join { .. }) => {
                                log::warn!("Duplicate join from {addr}, ignored");
                            }
                            Err(e) => log::warn!("Bad frame from {addr}: {e}"),
                        },
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    },
                    frame = next_frame(&mut room_rx) => match frame {
                        Ok(bytes) => {
                            ws_sender.send(Message::Binary((*bytes).clone().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("{addr} lagged, {n} frames lost");
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    },
                }
            }
        }
        .await;

        if let Some((channel, member, _)) = joined {
            let mut rooms_w = rooms.write().await;
            if let Some(room) = rooms_w.get_mut(&channel) {
                room.members.remove(&member);
                if room.members.is_empty() {
                    rooms_w.remove(&channel);
                }
            }
            log::info!("{member} left channel {channel}");
        }
        result
    }
}

/// Next frame for this connection, or never if it has not joined yet.
async fn next_frame(
    rx: &mut Option<broadcast::Receiver<Arc<Vec<u8>>>>,
) -> Result<Arc<Vec<u8>>, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sending half of a relay-backed channel: queues for the link task.
struct RelayOutbound(mpsc::UnboundedSender<Envelope>);

impl Outbound for RelayOutbound {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.0.send(envelope).map_err(|_| TransportError::Closed)
    }
}

/// Group service for one activity channel hosted by a relay.
#[derive(Debug, Clone)]
pub struct RelayService {
    url: String,
    channel: ChannelId,
    service: String,
    capacity: usize,
}

impl RelayService {
    pub fn new(url: impl Into<String>, channel: ChannelId, service: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            channel,
            service: service.into(),
            capacity: 256,
        }
    }

    /// Inbound messages buffered before the local receiver starts lagging.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl GroupService for RelayService {
    fn offer_channel(&self, service: &str) -> Result<ChannelInfo, TransportError> {
        // The relay creates rooms on first join; offering only names it.
        Ok(ChannelInfo {
            id: self.channel,
            service: service.to_string(),
            state: ChannelState::Open,
        })
    }

    fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError> {
        Ok(vec![ChannelInfo {
            id: self.channel,
            service: self.service.clone(),
            state: ChannelState::Open,
        }])
    }

    /// Spawns the connection on the current tokio runtime and returns at
    /// once. Messages sent before the socket is up are queued in order.
    fn open_channel(&self, info: &ChannelInfo) -> Result<ChatChannel, TransportError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;
        let member = MemberId::new();
        let (inbound_tx, inbound_rx) = broadcast::channel(self.capacity);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let url = self.url.clone();
        let channel = info.id;
        runtime.spawn(async move {
            if let Err(e) = run_link(&url, channel, member, outbound_rx, inbound_tx).await {
                log::error!("Relay link to {url} failed: {e}");
            }
        });

        Ok(ChatChannel::new(
            info.id,
            member,
            Arc::new(RelayOutbound(outbound_tx)),
            inbound_rx,
        ))
    }
}

/// Pump frames between the relay socket and a local channel binding.
async fn run_link(
    url: &str,
    channel: ChannelId,
    member: MemberId,
    mut outbound: mpsc::UnboundedReceiver<Envelope>,
    inbound: broadcast::Sender<Arc<Envelope>>,
) -> Result<(), BoxError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
    let (mut writer, mut reader) = ws_stream.split();

    let join = RelayFrame::Join { channel, member };
    writer.send(Message::Binary(join.encode()?.into())).await?;
    log::debug!("Joined relay channel {channel} as {member}");

    loop {
        tokio::select! {
            envelope = outbound.recv() => match envelope {
                Some(envelope) => {
                    let frame = RelayFrame::Message(envelope);
                    writer.send(Message::Binary(frame.encode()?.into())).await?;
                }
                None => {
                    // Local binding dropped.
                    writer.close().await?;
                    return Ok(());
                }
            },
            msg = reader.next() => match msg {
                Some(Ok(Message::Binary(data))) => match RelayFrame::decode(&data) {
                    Ok(RelayFrame::Message(envelope)) => {
                        let _ = inbound.send(Arc::new(envelope));
                    }
                    Ok(RelayFrame::Join { .. }) => {}
                    Err(e) => log::warn!("Bad frame from relay: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(_)) => {}
            },
        }
    }
}
