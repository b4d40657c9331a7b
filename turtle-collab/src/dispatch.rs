//! Routes inbound wire events to the session and the canvas.
//!
//! Every dispatch saves the canvas selection register first and restores it
//! afterwards, so remote events never change which turtle the local user
//! has active. A bad event is dropped on its own; the channel keeps going.

use crate::protocol::{Action, Event, ProtocolError};
use crate::session::Session;
use crate::turtle::Canvas;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A remote turtle was mutated.
    Applied,
    /// Handled by the session handshake (`t`, or a `T` that was applied).
    Handshake,
    /// The event was about our own turtle and had already been applied.
    Echo,
    /// Unknown tag, empty message, or a directory nobody waited for.
    Ignored,
    /// Malformed payload.
    Dropped,
}

/// Run `f` on the canvas and put the selection register back afterwards.
pub fn preserving_selection<C, R>(canvas: &mut C, f: impl FnOnce(&mut C) -> R) -> R
where
    C: Canvas + ?Sized,
{
    let saved = canvas.active();
    let result = f(canvas);
    canvas.set_active(saved.as_ref());
    result
}

/// Decode one wire message and apply it.
pub fn dispatch<C: Canvas + ?Sized>(session: &mut Session, canvas: &mut C, text: &str) -> Outcome {
    preserving_selection(canvas, |canvas| match Event::decode(text) {
        Ok(event) => apply(session, canvas, event),
        Err(ProtocolError::UnknownTag(tag)) => {
            log::trace!("Ignoring event with unknown tag {tag:?}");
            Outcome::Ignored
        }
        Err(ProtocolError::Empty) => Outcome::Ignored,
        Err(e) => {
            log::warn!("Dropping event: {e}");
            Outcome::Dropped
        }
    })
}

/// Apply a decoded event. Callers are responsible for the selection register.
pub fn apply<C: Canvas + ?Sized>(session: &mut Session, canvas: &mut C, event: Event) -> Outcome {
    match event {
        Event::Hello { nick, colors } => {
            session.handle_hello(canvas, nick, colors);
            Outcome::Handshake
        }
        Event::Directory(snapshot) => {
            if session.handle_directory(canvas, snapshot) {
                Outcome::Handshake
            } else {
                Outcome::Ignored
            }
        }
        Event::Turtle { nick, action } => {
            if nick == session.owner().nick {
                return Outcome::Echo;
            }
            let colors = session.directory().and_then(|d| d.lookup(&nick));
            canvas.materialize(&nick, colors);
            canvas.set_active(Some(&nick));
            apply_action(canvas, &action);
            Outcome::Applied
        }
    }
}

/// Call the canvas primitive for one action on the active turtle.
pub(crate) fn apply_action<C: Canvas + ?Sized>(canvas: &mut C, action: &Action) {
    match *action {
        Action::Forward(distance) => canvas.forward(distance),
        Action::Arc { angle, radius } => canvas.arc(angle, radius),
        Action::Heading(heading) => canvas.set_heading(heading),
        Action::Position { x, y } => canvas.set_xy(x, y),
        Action::PenColor(color) => canvas.set_color(color),
        Action::PenGray(gray) => canvas.set_gray(gray),
        Action::PenShade(shade) => canvas.set_shade(shade),
        Action::PenWidth(width) => canvas.set_pen_size(width),
        Action::PenDown(down) => canvas.set_pen(down),
    }
}
