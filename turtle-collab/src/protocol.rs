//! Text wire protocol for turtle events.
//!
//! Wire format (one event per channel message):
//! ```text
//! ┌──────┬─────┬──────────────────────────────┐
//! │ tag  │ '|' │ payload (JSON)               │
//! │ char │     │ e.g. ["alice", [90.0, 40.0]] │
//! └──────┴─────┴──────────────────────────────┘
//! ```
//!
//! The tag set is closed: `t` (hello), `T` (directory snapshot) and nine
//! turtle mutations. Unknown tags decode to [`ProtocolError::UnknownTag`] so
//! that newer peers can add events without breaking older ones.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Separator between the tag and the payload.
pub const SEPARATOR: char = '|';

/// Peer identity: the nickname a peer announced for this session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nick(String);

impl Nick {
    pub fn new(nick: impl Into<String>) -> Self {
        Self(nick.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Nick {
    fn from(nick: &str) -> Self {
        Self(nick.to_string())
    }
}

/// Display attributes of a peer's turtle: stroke and fill colors.
///
/// Travels as the single string `"stroke,fill"`, e.g. `"#FF2B34,#A700FF"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TurtleColors {
    pub stroke: String,
    pub fill: String,
}

impl TurtleColors {
    pub fn new(stroke: impl Into<String>, fill: impl Into<String>) -> Self {
        Self {
            stroke: stroke.into(),
            fill: fill.into(),
        }
    }

    /// Parse a color pair, falling back to the default turtle colors.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl Default for TurtleColors {
    fn default() -> Self {
        Self::new("#008000", "#00A000")
    }
}

impl fmt::Display for TurtleColors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.stroke, self.fill)
    }
}

impl FromStr for TurtleColors {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(stroke), Some(fill), None) if !stroke.is_empty() && !fill.is_empty() => {
                Ok(Self::new(stroke, fill))
            }
            _ => Err(ProtocolError::Colors(s.to_string())),
        }
    }
}

impl Serialize for TurtleColors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TurtleColors {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Snapshot of the directory as it travels in a `T` event.
pub type DirectorySnapshot = BTreeMap<Nick, TurtleColors>;

/// A turtle mutation. Each variant fully describes one primitive call on
/// the rendering surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    /// Move forward by a distance (negative moves backward).
    Forward(f64),
    /// Move along an arc of `angle` degrees with the given radius.
    Arc { angle: f64, radius: f64 },
    /// Set the absolute heading in degrees.
    Heading(f64),
    /// Set the absolute position.
    Position { x: f64, y: f64 },
    PenColor(f64),
    PenGray(f64),
    PenShade(f64),
    PenWidth(f64),
    /// Pen down (`true`) or up (`false`).
    PenDown(bool),
}

impl Action {
    /// Wire tag for this action.
    pub fn tag(&self) -> char {
        match self {
            Action::Forward(_) => 'f',
            Action::Arc { .. } => 'a',
            Action::Heading(_) => 'r',
            Action::Position { .. } => 'x',
            Action::PenColor(_) => 'c',
            Action::PenGray(_) => 'g',
            Action::PenShade(_) => 's',
            Action::PenWidth(_) => 'w',
            Action::PenDown(_) => 'p',
        }
    }
}

/// Top-level protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A peer announces itself and asks the sharer for the directory.
    Hello { nick: Nick, colors: TurtleColors },
    /// Full directory snapshot, sent by the sharer after every hello.
    Directory(DirectorySnapshot),
    /// A mutation of the turtle owned by `nick`.
    Turtle { nick: Nick, action: Action },
}

impl Event {
    pub fn hello(nick: Nick, colors: TurtleColors) -> Self {
        Event::Hello { nick, colors }
    }

    pub fn turtle(nick: Nick, action: Action) -> Self {
        Event::Turtle { nick, action }
    }

    /// Wire tag for this event.
    pub fn tag(&self) -> char {
        match self {
            Event::Hello { .. } => 't',
            Event::Directory(_) => 'T',
            Event::Turtle { action, .. } => action.tag(),
        }
    }

    /// The peer this event is about, if it names one.
    pub fn nick(&self) -> Option<&Nick> {
        match self {
            Event::Hello { nick, .. } | Event::Turtle { nick, .. } => Some(nick),
            Event::Directory(_) => None,
        }
    }

    /// Serialize to the text wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let payload = match self {
            Event::Hello { nick, colors } => to_json((nick, colors)),
            Event::Directory(snapshot) => to_json(snapshot),
            Event::Turtle { nick, action } => match *action {
                Action::Forward(d) => to_json((nick, d)),
                Action::Arc { angle, radius } => to_json((nick, (angle, radius))),
                Action::Heading(h) => to_json((nick, h)),
                Action::Position { x, y } => to_json((nick, (x, y))),
                Action::PenColor(v)
                | Action::PenGray(v)
                | Action::PenShade(v)
                | Action::PenWidth(v) => to_json((nick, v)),
                Action::PenDown(down) => to_json((nick, down)),
            },
        }?;
        Ok(format!("{}{SEPARATOR}{payload}", self.tag()))
    }

    /// Deserialize from the text wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let (tag, payload) = split_wire(text)?;

        let turtle = |action: fn(f64) -> Action| -> Result<Self, ProtocolError> {
            let (nick, value): (Nick, f64) = from_json(tag, payload)?;
            Ok(Event::turtle(nick, action(value)))
        };

        match tag {
            't' => {
                let (nick, colors) = from_json(tag, payload)?;
                Ok(Event::Hello { nick, colors })
            }
            'T' => Ok(Event::Directory(from_json(tag, payload)?)),
            'f' => turtle(Action::Forward),
            'a' => {
                let (nick, (angle, radius)): (Nick, (f64, f64)) = from_json(tag, payload)?;
                Ok(Event::turtle(nick, Action::Arc { angle, radius }))
            }
            'r' => turtle(Action::Heading),
            'x' => {
                let (nick, (x, y)): (Nick, (f64, f64)) = from_json(tag, payload)?;
                Ok(Event::turtle(nick, Action::Position { x, y }))
            }
            'c' => turtle(Action::PenColor),
            'g' => turtle(Action::PenGray),
            's' => turtle(Action::PenShade),
            'w' => turtle(Action::PenWidth),
            'p' => {
                let (nick, down): (Nick, bool) = from_json(tag, payload)?;
                Ok(Event::turtle(nick, Action::PenDown(down)))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Split a wire message into its tag and payload.
///
/// Only the first separator counts; the payload may contain `|`.
pub fn split_wire(text: &str) -> Result<(char, &str), ProtocolError> {
    if text.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let (tag, payload) = text
        .split_once(SEPARATOR)
        .ok_or_else(|| ProtocolError::Malformed(text.to_string()))?;

    let mut chars = tag.chars();
    let tag = match (chars.next(), chars.next()) {
        (Some(c), None) => c,
        _ => return Err(ProtocolError::Malformed(text.to_string())),
    };
    if payload.trim().is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok((tag, payload))
}

fn to_json<T: Serialize>(value: T) -> Result<String, ProtocolError> {
    serde_json::to_string(&value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(tag: char, payload: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(payload).map_err(|source| ProtocolError::Payload { tag, source })
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty event")]
    Empty,
    #[error("malformed event: {0:?}")]
    Malformed(String),
    #[error("unknown event tag {0:?}")]
    UnknownTag(char),
    #[error("bad payload for '{tag}': {source}")]
    Payload {
        tag: char,
        #[source]
        source: serde_json::Error,
    },
    #[error("bad color pair: {0:?}")]
    Colors(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}
