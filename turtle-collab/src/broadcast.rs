//! In-process group service with fan-out to every channel member.
//!
//! Uses tokio broadcast channels for O(1) send to all members. Each member
//! gets an independent receiver buffering up to `capacity` messages; a member
//! that falls further behind loses the oldest messages and is told how many.
//! The sender receives its own messages too, as on a real group channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::channel::{
    ChannelId, ChannelInfo, ChannelState, ChatChannel, Envelope, GroupService, MemberId,
    Outbound, TransportError,
};

/// Statistics for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_sent: u64,
    /// Members currently bound; a dropped `ChatChannel` no longer counts.
    pub members: usize,
}

/// Sending half handed to each member; counts messages lock-free.
struct LocalOutbound {
    sender: broadcast::Sender<Arc<Envelope>>,
    messages_sent: Arc<AtomicU64>,
}

impl Outbound for LocalOutbound {
    fn deliver(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.sender.deliver(envelope)?;
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct LocalChannel {
    info: ChannelInfo,
    sender: broadcast::Sender<Arc<Envelope>>,
    messages_sent: Arc<AtomicU64>,
}

/// Group service whose channels live in this process.
///
/// Cheap to share behind an `Arc`; every peer of a test or single-process
/// host uses the same instance.
pub struct LocalGroup {
    channels: RwLock<HashMap<ChannelId, LocalChannel>>,
    next_id: AtomicU64,
    /// Messages buffered per member before it starts lagging.
    capacity: usize,
    /// New-channel notifications.
    announcements: broadcast::Sender<ChannelInfo>,
}

impl LocalGroup {
    /// Create a group service with the given per-member buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (announcements, _) = broadcast::channel(64);
        Self {
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
            announcements,
        }
    }

    /// Subscribe to new-channel notifications.
    ///
    /// Channels offered before subscribing are only visible through
    /// [`GroupService::list_channels`].
    pub fn watch(&self) -> broadcast::Receiver<ChannelInfo> {
        self.announcements.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Statistics for one channel, if it exists.
    pub fn stats(&self, id: ChannelId) -> Option<ChannelStats> {
        let channels = self.channels.read().ok()?;
        channels.get(&id).map(|channel| ChannelStats {
            messages_sent: channel.messages_sent.load(Ordering::Relaxed),
            members: channel.sender.receiver_count(),
        })
    }
}

impl Default for LocalGroup {
    fn default() -> Self {
        Self::new(256)
    }
}

impl GroupService for LocalGroup {
    fn offer_channel(&self, service: &str) -> Result<ChannelInfo, TransportError> {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, _) = broadcast::channel(self.capacity);
        // Other members see the offer as pending until they accept it.
        let info = ChannelInfo {
            id,
            service: service.to_string(),
            state: ChannelState::LocalPending,
        };

        self.channels
            .write()
            .map_err(|_| TransportError::Poisoned)?
            .insert(
                id,
                LocalChannel {
                    info: info.clone(),
                    sender,
                    messages_sent: Arc::new(AtomicU64::new(0)),
                },
            );
        log::debug!("Offered channel {id} for {service}");

        // Nobody watching is fine.
        let _ = self.announcements.send(info.clone());

        Ok(ChannelInfo {
            state: ChannelState::Open,
            ..info
        })
    }

    fn list_channels(&self) -> Result<Vec<ChannelInfo>, TransportError> {
        let channels = self.channels.read().map_err(|_| TransportError::Poisoned)?;
        let mut infos: Vec<ChannelInfo> = channels.values().map(|c| c.info.clone()).collect();
        infos.sort_by_key(|info| info.id.0);
        Ok(infos)
    }

    fn open_channel(&self, info: &ChannelInfo) -> Result<ChatChannel, TransportError> {
        let channels = self.channels.read().map_err(|_| TransportError::Poisoned)?;
        let channel = channels
            .get(&info.id)
            .ok_or(TransportError::UnknownChannel(info.id))?;

        if info.state == ChannelState::LocalPending {
            log::debug!("Accepting channel {}", info.id);
        }

        let member = MemberId::new();
        let outbound = LocalOutbound {
            sender: channel.sender.clone(),
            messages_sent: channel.messages_sent.clone(),
        };
        Ok(ChatChannel::new(
            info.id,
            member,
            Arc::new(outbound),
            channel.sender.subscribe(),
        ))
    }
}
