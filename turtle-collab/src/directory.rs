//! Agent directory: who is in the session and how their turtles look.
//!
//! The sharer owns the authoritative copy and sends it whole to joiners
//! as a `T` event. Entries are never removed; a peer that leaves keeps
//! its entry for the rest of the session.

use crate::protocol::{DirectorySnapshot, Nick, TurtleColors};
use crate::session::Owner;

/// Mapping from peer nick to turtle colors, ordered by nick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentDirectory {
    entries: DirectorySnapshot,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory holding only the local peer.
    pub fn for_owner(owner: &Owner) -> Self {
        let mut directory = Self::new();
        directory.upsert(owner.nick.clone(), owner.colors.clone());
        directory
    }

    /// Colors announced by `nick`, if known.
    pub fn lookup(&self, nick: &Nick) -> Option<&TurtleColors> {
        self.entries.get(nick)
    }

    /// Insert or refresh an entry. Returns `true` if the nick was new.
    pub fn upsert(&mut self, nick: Nick, colors: TurtleColors) -> bool {
        self.entries.insert(nick, colors).is_none()
    }

    pub fn contains(&self, nick: &Nick) -> bool {
        self.entries.contains_key(nick)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Nick, &TurtleColors)> {
        self.entries.iter()
    }

    /// Borrow the entries in wire form.
    pub fn snapshot(&self) -> &DirectorySnapshot {
        &self.entries
    }
}

impl From<DirectorySnapshot> for AgentDirectory {
    fn from(entries: DirectorySnapshot) -> Self {
        Self { entries }
    }
}
