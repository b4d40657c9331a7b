//! # turtle-collab: shared turtle scenes for collaborating peers
//!
//! Keeps every peer's turtle consistent across a shared activity. One peer
//! shares the activity and owns the directory of who is present; others join,
//! announce themselves, receive the directory once, and from then on
//! exchange small mutation events.
//!
//! ## Architecture
//!
//! ```text
//! local action ──► Session::perform ──► Event::encode ──► ChatChannel ──┐
//!                                                                       │
//!                                        group service (LocalGroup or   │
//!                                        RelayServer over WebSocket) ◄──┘
//!                                                                       │
//! Canvas ◄── dispatch (selection kept) ◄── Event::decode ◄── ChatChannel┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Text wire format (`tag|json`) and the event enum
//! - [`directory`]: Nick → colors table owned by the sharer
//! - [`turtle`]: Turtle state, the `Canvas` boundary and an in-memory canvas
//! - [`session`]: Sharer/joiner roles, handshake and reconciliation
//! - [`dispatch`]: Inbound event routing, selection-transparent
//! - [`channel`]: Transport adapter with echo suppression
//! - [`broadcast`]: In-process group service
//! - [`relay`]: WebSocket relay server and client-side group service

pub mod protocol;
pub mod directory;
pub mod turtle;
pub mod session;
pub mod dispatch;
pub mod channel;
pub mod broadcast;
pub mod relay;

// Re-exports for convenience
pub use protocol::{Action, DirectorySnapshot, Event, Nick, ProtocolError, TurtleColors};
pub use directory::AgentDirectory;
pub use turtle::{Canvas, Point, Stroke, Turtle, TurtleRegistry};
pub use session::{
    Owner, Phase, Role, Session, SessionConfig, SessionError, SharedActivity, DEFAULT_SERVICE,
};
pub use dispatch::{dispatch, Outcome};
pub use channel::{
    ChannelId, ChannelInfo, ChannelState, ChatChannel, Envelope, GroupService, MemberId,
    TransportError,
};
pub use broadcast::{ChannelStats, LocalGroup};
pub use relay::{RelayConfig, RelayFrame, RelayServer, RelayService, RelayStats};
