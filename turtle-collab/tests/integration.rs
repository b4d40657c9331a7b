//! Integration tests for the sharer/joiner handshake and event exchange.
//!
//! Peers share one in-process `LocalGroup`, so every test is deterministic:
//! messages are delivered as soon as they are sent and each peer drains its
//! channel with `Session::pump`.

use std::sync::Arc;

use tokio::time::{timeout, Duration};
use turtle_collab::broadcast::LocalGroup;
use turtle_collab::channel::GroupService;
use turtle_collab::dispatch::Outcome;
use turtle_collab::protocol::{Action, Event, Nick, TurtleColors};
use turtle_collab::session::{Owner, Phase, Role, Session, SharedActivity};
use turtle_collab::turtle::{Canvas, Point, TurtleRegistry};

/// One peer: its session plus its own canvas, with its own turtle selected.
struct Peer {
    session: Session,
    canvas: TurtleRegistry,
}

impl Peer {
    fn new(nick: &str, stroke: &str, fill: &str) -> Self {
        let owner = Owner::new(nick, TurtleColors::new(stroke, fill));
        let mut canvas = TurtleRegistry::new();
        canvas.materialize(&owner.nick, Some(&owner.colors));
        canvas.set_active(Some(&owner.nick));
        Self {
            session: Session::with_defaults(owner),
            canvas,
        }
    }

    fn nick(&self) -> Nick {
        self.session.owner().nick.clone()
    }

    fn colors(&self) -> TurtleColors {
        self.session.owner().colors.clone()
    }

    fn pump(&mut self) -> usize {
        self.session.pump(&mut self.canvas)
    }

    fn turtle(&self, nick: &str) -> Option<&turtle_collab::Turtle> {
        self.canvas.lookup(&Nick::from(nick))
    }
}

fn activity(group: &Arc<LocalGroup>) -> Option<SharedActivity> {
    Some(SharedActivity::new(group.clone()))
}

/// Alice shares, Bob joins, and both finish the handshake.
fn alice_and_bob(group: &Arc<LocalGroup>) -> (Peer, Peer) {
    let mut alice = Peer::new("alice", "#FF2B34", "#A700FF");
    let mut bob = Peer::new("bob", "#00A0FF", "#008009");

    alice.session.on_shared(activity(group)).unwrap();
    bob.session.on_joined(activity(group)).unwrap();

    assert_eq!(alice.pump(), 1); // bob's hello
    assert_eq!(bob.pump(), 1); // alice's directory
    (alice, bob)
}

#[test]
fn test_join_handshake() {
    let group = Arc::new(LocalGroup::new(64));
    let (alice, bob) = alice_and_bob(&group);

    // Sharer learned about the joiner.
    let directory = alice.session.directory().unwrap();
    assert_eq!(directory.len(), 2);
    assert_eq!(directory.lookup(&bob.nick()), Some(&bob.colors()));
    assert_eq!(alice.turtle("bob").unwrap().colors, bob.colors());

    // Joiner reconciled against the sharer's directory.
    assert_eq!(bob.session.role(), Role::Joiner);
    assert_eq!(bob.session.phase(), Phase::Reconciled);
    assert!(!bob.session.is_waiting_for_turtles());
    assert_eq!(bob.turtle("alice").unwrap().colors, alice.colors());
    assert_eq!(bob.session.directory(), alice.session.directory());

    // Neither peer's selection moved.
    assert_eq!(alice.canvas.active(), Some(alice.nick()));
    assert_eq!(bob.canvas.active(), Some(bob.nick()));
}

#[test]
fn test_remote_forward_is_selection_transparent() {
    let group = Arc::new(LocalGroup::new(64));
    let (mut alice, mut bob) = alice_and_bob(&group);

    alice.session.perform(&mut alice.canvas, Action::Forward(50.0));
    assert_eq!(bob.pump(), 1);

    let remote = bob.turtle("alice").unwrap();
    assert!(remote.position.distance(&Point::new(0.0, 50.0)) < 1e-9);
    assert_eq!(bob.canvas.active(), Some(bob.nick()));
    assert_eq!(bob.turtle("bob").unwrap().position, Point::ORIGIN);

    // The sharer moved its own turtle exactly once.
    assert_eq!(alice.pump(), 0);
    let own = alice.turtle("alice").unwrap();
    assert!(own.position.distance(&Point::new(0.0, 50.0)) < 1e-9);
}

#[test]
fn test_drawing_session_replicates() {
    let group = Arc::new(LocalGroup::new(256));
    let (mut alice, mut bob) = alice_and_bob(&group);

    let square = [
        Action::PenWidth(3.0),
        Action::PenColor(70.0),
        Action::Forward(100.0),
        Action::Heading(90.0),
        Action::Forward(100.0),
        Action::Heading(180.0),
        Action::Forward(100.0),
        Action::PenDown(false),
        Action::Position { x: -20.0, y: 0.0 },
        Action::PenDown(true),
        Action::Arc { angle: -45.0, radius: 30.0 },
        Action::PenGray(50.0),
        Action::PenShade(10.0),
    ];
    for action in square {
        alice.session.perform(&mut alice.canvas, action);
    }
    bob.session.perform(&mut bob.canvas, Action::Forward(-30.0));

    assert_eq!(bob.pump(), square.len());
    assert_eq!(alice.pump(), 1);

    let here = alice.turtle("alice").unwrap();
    let there = bob.turtle("alice").unwrap();
    assert!(here.position.distance(&there.position) < 1e-9);
    assert_eq!(here.heading, there.heading);
    assert_eq!(here.pen_size, there.pen_size);
    assert_eq!(here.color, there.color);
    assert_eq!(here.gray, there.gray);
    assert_eq!(here.shade, there.shade);

    let bob_there = alice.turtle("bob").unwrap();
    assert!(bob_there.position.distance(&Point::new(0.0, -30.0)) < 1e-9);
    assert_eq!(alice.canvas.strokes().len(), bob.canvas.strokes().len());
}

#[test]
fn test_late_joiner_sees_everyone() {
    let group = Arc::new(LocalGroup::new(64));
    let (mut alice, mut bob) = alice_and_bob(&group);

    let mut carol = Peer::new("carol", "#FFFF00", "#00FFFF");
    carol.session.on_joined(activity(&group)).unwrap();

    assert_eq!(alice.pump(), 1); // carol's hello
    assert_eq!(carol.pump(), 1); // directory
    assert_eq!(bob.pump(), 2); // carol's hello, then a directory bob ignores

    assert_eq!(carol.session.phase(), Phase::Reconciled);
    assert!(carol.turtle("alice").is_some());
    assert!(carol.turtle("bob").is_some());
    assert_eq!(alice.session.directory().unwrap().len(), 3);

    // Bob was already reconciled but still picks up carol from her hello.
    assert_eq!(bob.turtle("carol").unwrap().colors, carol.colors());
    assert!(bob.session.directory().unwrap().contains(&carol.nick()));
}

#[test]
fn test_hello_before_snapshot_is_kept() {
    let group = Arc::new(LocalGroup::new(64));
    let mut alice = Peer::new("alice", "#FF2B34", "#A700FF");
    let mut bob = Peer::new("bob", "#00A0FF", "#008009");
    let mut carol = Peer::new("carol", "#FFFF00", "#00FFFF");
    alice.session.on_shared(activity(&group)).unwrap();

    // Both hellos are out before the sharer answers either.
    bob.session.on_joined(activity(&group)).unwrap();
    carol.session.on_joined(activity(&group)).unwrap();

    assert_eq!(alice.pump(), 2);
    // carol's hello, the snapshot answering bob, then the one answering carol.
    assert_eq!(bob.pump(), 3);

    let directory = bob.session.directory().unwrap();
    assert_eq!(directory.len(), 3);
    assert!(directory.contains(&carol.nick()));
    assert_eq!(bob.session.directory(), alice.session.directory());
    assert!(bob.turtle("carol").is_some());

    assert_eq!(carol.pump(), 2);
    assert_eq!(carol.session.directory().unwrap().len(), 3);
}

#[test]
fn test_directory_tracks_latest_announcements() {
    let group = Arc::new(LocalGroup::new(64));
    let mut alice = Peer::new("alice", "#FF2B34", "#A700FF");
    alice.session.on_shared(activity(&group)).unwrap();

    let hellos = [
        ("bob", "#000001,#000002"),
        ("carol", "#000003,#000004"),
        ("bob", "#000005,#000006"),
        ("bob", "#000005,#000006"),
        ("dave", "#000007,#000008"),
    ];
    for (nick, colors) in hellos {
        let wire = Event::hello(Nick::from(nick), colors.parse().unwrap())
            .encode()
            .unwrap();
        let outcome = alice.session.receive(&mut alice.canvas, &wire);
        assert_eq!(outcome, Outcome::Handshake);
    }

    let directory = alice.session.directory().unwrap();
    let entries: Vec<(String, String)> = directory
        .iter()
        .map(|(n, c)| (n.to_string(), c.to_string()))
        .collect();
    assert_eq!(
        entries,
        vec![
            ("alice".to_string(), "#FF2B34,#A700FF".to_string()),
            ("bob".to_string(), "#000005,#000006".to_string()),
            ("carol".to_string(), "#000003,#000004".to_string()),
            ("dave".to_string(), "#000007,#000008".to_string()),
        ]
    );
    assert_eq!(
        alice.turtle("bob").unwrap().colors,
        TurtleColors::new("#000005", "#000006")
    );

    // Every hello was answered with a full directory.
    let info = group.list_channels().unwrap().remove(0);
    assert_eq!(group.stats(info.id).unwrap().messages_sent, hellos.len() as u64);
}

#[test]
fn test_repeated_directory_is_idempotent() {
    let group = Arc::new(LocalGroup::new(64));
    let mut alice = Peer::new("alice", "#FF2B34", "#A700FF");
    let mut bob = Peer::new("bob", "#00A0FF", "#008009");
    alice.session.on_shared(activity(&group)).unwrap();
    bob.session.on_joined(activity(&group)).unwrap();

    // A duplicate hello makes the sharer send the directory twice.
    let hello = Event::hello(bob.nick(), bob.colors()).encode().unwrap();
    let info = group.list_channels().unwrap().remove(0);
    group.open_channel(&info).unwrap().broadcast(hello).unwrap();
    assert_eq!(alice.pump(), 2);

    assert_eq!(bob.pump(), 3); // the duplicate hello and two directories
    let directory = bob.session.directory().cloned();
    let turtles = bob.canvas.len();

    let again = Event::Directory(alice.session.directory().unwrap().snapshot().clone())
        .encode()
        .unwrap();
    assert_eq!(bob.session.receive(&mut bob.canvas, &again), Outcome::Ignored);
    assert_eq!(bob.session.directory().cloned(), directory);
    assert_eq!(bob.canvas.len(), turtles);
    assert_eq!(bob.session.phase(), Phase::Reconciled);
}

#[test]
fn test_joiner_before_offer_uses_notification() {
    let group = Arc::new(LocalGroup::new(64));
    let mut watcher = group.watch();

    let mut bob = Peer::new("bob", "#00A0FF", "#008009");
    bob.session.on_joined(activity(&group)).unwrap();
    assert!(bob.session.channel().is_none());

    let mut alice = Peer::new("alice", "#FF2B34", "#A700FF");
    alice.session.on_shared(activity(&group)).unwrap();

    let announced = watcher.try_recv().unwrap();
    bob.session.on_new_channel(announced).unwrap();

    assert_eq!(alice.pump(), 1);
    assert_eq!(bob.pump(), 1);
    assert_eq!(bob.session.phase(), Phase::Reconciled);
}

#[test]
fn test_garbage_on_the_wire() {
    let group = Arc::new(LocalGroup::new(64));
    let (_alice, mut bob) = alice_and_bob(&group);
    let info = group.list_channels().unwrap().remove(0);
    let rogue = group.open_channel(&info).unwrap();

    for junk in ["z|garbage", "", "f|", "f|not json", "x|[\"alice\", 3]", "nonsense"] {
        rogue.broadcast(junk).unwrap();
    }
    rogue.broadcast("r|[\"alice\", 90]").unwrap();

    assert_eq!(bob.pump(), 7);
    assert_eq!(bob.canvas.len(), 2);
    assert_eq!(bob.turtle("alice").unwrap().heading, 90.0);
    assert_eq!(bob.turtle("alice").unwrap().position, Point::ORIGIN);
    assert_eq!(bob.canvas.active(), Some(bob.nick()));
}

#[test]
fn test_forged_own_events_do_not_mutate() {
    let group = Arc::new(LocalGroup::new(64));
    let (mut alice, _bob) = alice_and_bob(&group);
    let info = group.list_channels().unwrap().remove(0);
    let rogue = group.open_channel(&info).unwrap();

    rogue.broadcast("f|[\"alice\", 100]").unwrap();
    rogue.broadcast("p|[\"alice\", false]").unwrap();
    assert_eq!(alice.pump(), 2);

    let own = alice.turtle("alice").unwrap();
    assert_eq!(own.position, Point::ORIGIN);
    assert!(own.pen_down);
}

#[test]
fn test_color_change_reaches_peers() {
    let group = Arc::new(LocalGroup::new(64));
    let (mut alice, mut bob) = alice_and_bob(&group);

    let colors = TurtleColors::new("#101010", "#202020");
    bob.session.change_colors(&mut bob.canvas, colors.clone());
    assert_eq!(alice.pump(), 1);
    assert_eq!(bob.pump(), 1); // resent directory, ignored

    assert_eq!(alice.turtle("bob").unwrap().colors, colors);
    assert!(alice.turtle("bob").unwrap().custom_shapes);
    assert_eq!(alice.session.directory().unwrap().lookup(&bob.nick()), Some(&colors));
}

#[tokio::test]
async fn test_run_applies_events_as_they_arrive() {
    let group = Arc::new(LocalGroup::new(64));
    let (mut alice, mut bob) = alice_and_bob(&group);

    alice.session.perform(&mut alice.canvas, Action::Heading(45.0));
    alice.session.perform(&mut alice.canvas, Action::Forward(10.0));

    // The channel never closes, so run() only stops at the timeout.
    let result = timeout(
        Duration::from_millis(100),
        bob.session.run(&mut bob.canvas),
    )
    .await;
    assert!(result.is_err());

    let remote = bob.turtle("alice").unwrap();
    assert_eq!(remote.heading, 45.0);
    assert!(remote.position.distance(&alice.turtle("alice").unwrap().position) < 1e-9);
    assert_eq!(bob.canvas.active(), Some(bob.nick()));
}
