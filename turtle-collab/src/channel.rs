//! Transport adapter over a reliable, per-sender ordered group channel.
//!
//! ```text
//!  Session ── broadcast(text) ──► Outbound ──► group service ──► every member
//!                                                                  │
//!  Session ◄── recv() ◄── ChatChannel (drops own echoes) ◄─────────┘
//! ```
//!
//! Group channels deliver a member's own messages back to it, so
//! [`ChatChannel`] drops envelopes whose sender is the local member.
//! Nothing is retried or buffered here; reliability and per-sender FIFO are
//! properties of the group service.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

/// Unique name of one member's connection to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberId(pub Uuid);

impl MemberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a group channel within a group service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a channel still has to be accepted locally before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    LocalPending,
    Open,
}

/// A channel as announced or listed by the group service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    /// Service name the channel was offered for.
    pub service: String,
    pub state: ChannelState,
}

/// One channel message with its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: MemberId,
    pub text: String,
}

/// Transport errors.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    #[error("channel {0} is full")]
    ChannelFull(ChannelId),
    #[error("member {0} already joined")]
    DuplicateMember(MemberId),
    #[error("no async runtime available")]
    NoRuntime,
    #[error("group service state poisoned")]
    Poisoned,
    #[error("transport error: {0}")]
    Other(String),
}

/// Sending half of a channel binding.
pub trait Outbound: Send + Sync {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError>;
}

impl Outbound for broadcast::Sender<Arc<Envelope>> {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.send(Arc::new(envelope))
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }
}

/// Group communication service: offers, lists and opens channels.
pub trait GroupService: Send + Sync {
    /// Offer a new channel for `service`. The offering member is expected to
    /// open it right away.
    fn offer_channel(&self, service: &str) -> Result<ChannelInfo, TransportError>;

    /// Channels that already exist in the shared activity.
    fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError>;

    /// Join a channel, accepting it first if it is locally pending.
    fn open_channel(&self, info: &ChannelInfo) -> Result<ChatChannel, TransportError>;
}

/// A member's binding to one group channel.
pub struct ChatChannel {
    id: ChannelId,
    local: MemberId,
    outbound: Arc<dyn Outbound>,
    inbound: broadcast::Receiver<Arc<Envelope>>,
    lagged: u64,
}

impl ChatChannel {
    pub fn new(
        id: ChannelId,
        local: MemberId,
        outbound: Arc<dyn Outbound>,
        inbound: broadcast::Receiver<Arc<Envelope>>,
    ) -> Self {
        Self {
            id,
            local,
            outbound,
            inbound,
            lagged: 0,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Our unique name on this channel.
    pub fn local_member(&self) -> MemberId {
        self.local
    }

    /// Messages lost because this receiver fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    /// Send one message to every member of the channel.
    pub fn broadcast(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound.deliver(Envelope {
            sender: self.local,
            text: text.into(),
        })
    }

    /// Next message from another member, without waiting.
    ///
    /// `Ok(None)` means nothing is pending right now.
    pub fn try_recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.inbound.try_recv() {
                Ok(envelope) => {
                    if let Some(text) = self.accept(&envelope) {
                        return Ok(Some(text));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Lagged(n)) => self.note_lag(n),
                Err(TryRecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    /// Wait for the next message from another member.
    ///
    /// Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.inbound.recv().await {
                Ok(envelope) => {
                    if let Some(text) = self.accept(&envelope) {
                        return Some(text);
                    }
                }
                Err(RecvError::Lagged(n)) => self.note_lag(n),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&self, envelope: &Envelope) -> Option<String> {
        (envelope.sender != self.local).then(|| envelope.text.clone())
    }

    fn note_lag(&mut self, n: u64) {
        log::warn!("Channel {} receiver lagged, {n} messages lost", self.id);
        self.lagged += n;
    }
}

impl fmt::Debug for ChatChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatChannel")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("lagged", &self.lagged)
            .finish()
    }
}
