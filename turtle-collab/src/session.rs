//! Session lifecycle and role negotiation.
//!
//! ```text
//!            on_shared()            hello `t` ──► upsert, materialize,
//!   Idle ───────────────► Sharing                  broadcast full `T`
//!     │
//!     │      on_joined()             first `T`
//!     └─────────────────► Joining ─────────────► Reconciled
//!                           │
//!                           └─ channel bound ──► send hello `t`
//! ```
//!
//! The sharer is authoritative for the directory. A joiner announces itself
//! once its channel is bound and waits for the first directory snapshot;
//! later snapshots are ignored. Every `t` makes the sharer resend the whole
//! directory, so duplicate or late hellos are harmless.

use std::sync::Arc;

use thiserror::Error;

use crate::channel::{ChannelInfo, ChatChannel, GroupService, TransportError};
use crate::directory::AgentDirectory;
use crate::dispatch::{apply_action, dispatch, preserving_selection, Outcome};
use crate::protocol::{Action, DirectorySnapshot, Event, Nick, TurtleColors};
use crate::turtle::Canvas;

/// Default service name channels are offered for.
pub const DEFAULT_SERVICE: &str = "org.laptop.TurtleArtActivity";

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service name used to offer channels and to recognize ours among the
    /// channels of a shared activity.
    pub service: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service: DEFAULT_SERVICE.to_string(),
        }
    }
}

/// The local peer as reported by the presence service.
#[derive(Debug, Clone, PartialEq)]
pub struct Owner {
    pub nick: Nick,
    pub colors: TurtleColors,
}

impl Owner {
    pub fn new(nick: impl Into<String>, colors: TurtleColors) -> Self {
        Self {
            nick: Nick::new(nick),
            colors,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Undetermined,
    Sharer,
    Joiner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sharing,
    Joining,
    Reconciled,
}

/// Handle on the shared activity handed over by the presence service.
#[derive(Clone)]
pub struct SharedActivity {
    service: Arc<dyn GroupService>,
}

impl SharedActivity {
    pub fn new(service: Arc<dyn GroupService>) -> Self {
        Self { service }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("shared activity is missing")]
    NoSharedActivity,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Collaboration state of one shared activity.
pub struct Session {
    config: SessionConfig,
    owner: Owner,
    role: Role,
    phase: Phase,
    /// True while a joiner has not received the sharer's directory.
    waiting_for_turtles: bool,
    directory: Option<AgentDirectory>,
    activity: Option<SharedActivity>,
    channel: Option<ChatChannel>,
}

impl Session {
    pub fn new(owner: Owner, config: SessionConfig) -> Self {
        Self {
            config,
            owner,
            role: Role::Undetermined,
            phase: Phase::Idle,
            waiting_for_turtles: false,
            directory: None,
            activity: None,
            channel: None,
        }
    }

    pub fn with_defaults(owner: Owner) -> Self {
        Self::new(owner, SessionConfig::default())
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_waiting_for_turtles(&self) -> bool {
        self.waiting_for_turtles
    }

    pub fn directory(&self) -> Option<&AgentDirectory> {
        self.directory.as_ref()
    }

    pub fn channel(&self) -> Option<&ChatChannel> {
        self.channel.as_ref()
    }

    /// The local activity became the host of a shared session.
    pub fn on_shared(&mut self, activity: Option<SharedActivity>) -> Result<(), SessionError> {
        let Some(activity) = activity else {
            log::error!("Failed to share activity: shared activity is missing");
            return Err(SessionError::NoSharedActivity);
        };

        self.role = Role::Sharer;
        self.phase = Phase::Sharing;
        self.waiting_for_turtles = false;
        self.directory = Some(AgentDirectory::for_owner(&self.owner));
        let service = activity.service.clone();
        self.activity = Some(activity);

        log::info!("{} is sharing, offering a channel", self.owner.nick);
        let info = service.offer_channel(&self.config.service).map_err(|e| {
            log::error!("Failed to offer channel: {e}");
            e
        })?;
        self.on_new_channel(info)
    }

    /// The local activity attached to an existing shared session.
    pub fn on_joined(&mut self, activity: Option<SharedActivity>) -> Result<(), SessionError> {
        let Some(activity) = activity else {
            log::error!("Failed to join activity: shared activity is missing");
            return Err(SessionError::NoSharedActivity);
        };

        self.role = Role::Joiner;
        self.phase = Phase::Joining;
        self.waiting_for_turtles = true;
        let service = activity.service.clone();
        self.activity = Some(activity);

        log::info!("{} is joining, looking for a channel", self.owner.nick);
        // The sharer's channel may predate our subscription to new-channel
        // notifications, so existing channels are replayed as new ones.
        self.on_channels_listed(service.list_channels());
        Ok(())
    }

    /// Reply to the "list existing channels" query.
    pub fn on_channels_listed(&mut self, reply: Result<Vec<ChannelInfo>, TransportError>) {
        let channels = match reply {
            Ok(channels) => channels,
            Err(e) => {
                log::error!("Listing channels failed: {e}");
                Vec::new()
            }
        };
        for info in channels {
            if let Err(e) = self.on_new_channel(info) {
                log::warn!("Could not bind channel: {e}");
            }
        }
    }

    /// A channel appeared (or was found) in the shared activity.
    ///
    /// Safe to call repeatedly for the same channel.
    pub fn on_new_channel(&mut self, info: ChannelInfo) -> Result<(), SessionError> {
        if info.service != self.config.service {
            log::debug!("Ignoring channel {} for {}", info.id, info.service);
            return Ok(());
        }
        if self.channel.as_ref().is_some_and(|c| c.id() == info.id) {
            log::debug!("Channel {} already bound", info.id);
            return Ok(());
        }
        let Some(activity) = &self.activity else {
            return Err(SessionError::NoSharedActivity);
        };

        let channel = activity.service.open_channel(&info)?;
        log::info!(
            "Bound channel {} as member {}",
            info.id,
            channel.local_member()
        );
        self.channel = Some(channel);

        if self.waiting_for_turtles {
            log::debug!("Requesting the turtle directory");
            self.send_hello();
        }
        Ok(())
    }

    /// Encode and broadcast an event. Returns whether it went out.
    pub fn send_event(&self, event: &Event) -> bool {
        let Some(channel) = &self.channel else {
            return false;
        };
        let wire = match event.encode() {
            Ok(wire) => wire,
            Err(e) => {
                log::error!("Failed to encode '{}' event: {e}", event.tag());
                return false;
            }
        };
        match channel.broadcast(wire) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to send '{}' event: {e}", event.tag());
                false
            }
        }
    }

    /// Apply a local user action to our own turtle and broadcast it.
    pub fn perform<C: Canvas + ?Sized>(&mut self, canvas: &mut C, action: Action) {
        let owner = &self.owner;
        preserving_selection(canvas, |canvas| {
            canvas.materialize(&owner.nick, Some(&owner.colors));
            canvas.set_active(Some(&owner.nick));
            apply_action(canvas, &action);
        });
        self.send_event(&Event::turtle(self.owner.nick.clone(), action));
    }

    /// Reskin our own turtle and re-announce it so peers pick up the colors.
    pub fn change_colors<C: Canvas + ?Sized>(&mut self, canvas: &mut C, colors: TurtleColors) {
        self.owner.colors = colors;
        canvas.materialize(&self.owner.nick, Some(&self.owner.colors));
        if let Some(directory) = &mut self.directory {
            directory.upsert(self.owner.nick.clone(), self.owner.colors.clone());
        }
        self.send_hello();
    }

    /// Dispatch one inbound wire message.
    pub fn receive<C: Canvas + ?Sized>(&mut self, canvas: &mut C, text: &str) -> Outcome {
        dispatch(self, canvas, text)
    }

    /// Dispatch every message that is already waiting on the channel.
    pub fn pump<C: Canvas + ?Sized>(&mut self, canvas: &mut C) -> usize {
        let mut handled = 0;
        while let Some(channel) = self.channel.as_mut() {
            match channel.try_recv() {
                Ok(Some(text)) => {
                    dispatch(self, canvas, &text);
                    handled += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("Channel receive failed: {e}");
                    break;
                }
            }
        }
        handled
    }

    /// Dispatch messages as they arrive until the channel closes.
    pub async fn run<C: Canvas + ?Sized>(&mut self, canvas: &mut C) {
        while let Some(channel) = self.channel.as_mut() {
            let Some(text) = channel.recv().await else {
                log::info!("Channel closed");
                break;
            };
            dispatch(self, canvas, &text);
        }
    }

    fn send_hello(&self) {
        let hello = Event::hello(self.owner.nick.clone(), self.owner.colors.clone());
        self.send_event(&hello);
    }

    /// A peer announced itself (`t`).
    pub(crate) fn handle_hello<C: Canvas + ?Sized>(
        &mut self,
        canvas: &mut C,
        nick: Nick,
        colors: TurtleColors,
    ) {
        if nick != self.owner.nick {
            let directory = self
                .directory
                .get_or_insert_with(|| AgentDirectory::for_owner(&self.owner));
            if directory.upsert(nick.clone(), colors.clone()) {
                log::info!("{nick} joined the session");
            }
            canvas.materialize(&nick, Some(&colors));
        }

        if self.role == Role::Sharer {
            let directory = self
                .directory
                .get_or_insert_with(|| AgentDirectory::for_owner(&self.owner));
            let snapshot = Event::Directory(directory.snapshot().clone());
            log::debug!("Sending directory with {} turtles", directory.len());
            self.send_event(&snapshot);
        }
    }

    /// The sharer's directory arrived (`T`). Returns whether it was applied.
    pub(crate) fn handle_directory<C: Canvas + ?Sized>(
        &mut self,
        canvas: &mut C,
        snapshot: DirectorySnapshot,
    ) -> bool {
        if !self.waiting_for_turtles {
            log::debug!("Ignoring directory, not waiting for one");
            return false;
        }

        for (nick, colors) in &snapshot {
            if *nick != self.owner.nick {
                canvas.materialize(nick, Some(colors));
            }
        }
        // Merge: hellos seen before the snapshot may not be in it yet.
        let directory = self
            .directory
            .get_or_insert_with(|| AgentDirectory::for_owner(&self.owner));
        for (nick, colors) in snapshot {
            directory.upsert(nick, colors);
        }
        log::info!("Reconciled with {} turtles", directory.len());
        self.waiting_for_turtles = false;
        self.phase = Phase::Reconciled;
        true
    }
}
