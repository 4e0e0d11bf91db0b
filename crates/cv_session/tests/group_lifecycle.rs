//! End-to-end group lifecycle scenarios over the loopback channel.
//!
//! Each participant runs a full `HybridSession`; the test driver owns the
//! hub and pumps deliveries serially, exactly as a transport adapter
//! would. Time is advanced explicitly.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use cv_crypto::sig::SigningKeyPair;
use cv_session::base::SessionConfig;
use cv_session::channel::{ChannelRecv, LoopbackHub};
use cv_session::events::SessionEvent;
use cv_session::hybrid::{Action, HybridSession, OpStatus};
use cv_session::ske::InMemoryDirectory;

const LATENCY: u32 = 16;

struct World {
    hub: LoopbackHub,
    sessions: HashMap<String, HybridSession>,
    events: HashMap<String, Rc<RefCell<Vec<SessionEvent>>>>,
}

impl World {
    fn new(names: &[&str]) -> Self {
        let mut directory = InMemoryDirectory::new();
        let mut statics = HashMap::new();
        for name in names {
            let kp = SigningKeyPair::generate();
            directory.insert(name, kp.public_bytes());
            statics.insert(name.to_string(), kp);
        }
        let directory = Rc::new(directory);

        let mut sessions = HashMap::new();
        let mut events = HashMap::new();
        for name in names {
            let session = HybridSession::new(
                name,
                statics.remove(*name).unwrap(),
                directory.clone(),
                SessionConfig {
                    broadcast_latency: LATENCY,
                    full_ack_interval: 4 * LATENCY,
                    ..SessionConfig::default()
                },
            );
            let sink: Rc<RefCell<Vec<SessionEvent>>> = Rc::new(RefCell::new(Vec::new()));
            let sink2 = sink.clone();
            session
                .events()
                .subscribe(move |ev| sink2.borrow_mut().push(ev.clone()));
            events.insert(name.to_string(), sink);
            sessions.insert(name.to_string(), session);
        }
        Self { hub: LoopbackHub::new(), sessions, events }
    }

    fn execute(&mut self, who: &str, action: Action) -> cv_session::hybrid::OpHandle {
        let session = self.sessions.get_mut(who).unwrap();
        let mut channel = self.hub.handle(who);
        session.execute(&mut channel, action).unwrap()
    }

    /// Deliver queued channel traffic until quiescent.
    fn pump(&mut self) {
        while !self.hub.is_idle() {
            for (to, recv) in self.hub.take_deliveries() {
                let Some(session) = self.sessions.get_mut(&to) else {
                    continue;
                };
                let mut channel = self.hub.handle(&to);
                session.recv(&mut channel, recv).unwrap();
            }
        }
    }

    /// Advance every session's clock, then drain what that produced.
    fn elapse(&mut self, ticks: u32) {
        let names: Vec<String> = self.sessions.keys().cloned().collect();
        for name in names {
            let session = self.sessions.get_mut(&name).unwrap();
            let mut channel = self.hub.handle(&name);
            session.tick(&mut channel, ticks);
        }
        self.pump();
    }

    fn session(&self, who: &str) -> &HybridSession {
        &self.sessions[who]
    }

    fn sid_of(&self, who: &str) -> [u8; 32] {
        self.session(who).current_session().expect("no session").sid()
    }

    fn members_of(&self, who: &str) -> BTreeSet<String> {
        self.session(who).current_session().expect("no session").members().clone()
    }

    fn send_payload(&mut self, who: &str, text: &str) {
        self.execute(who, Action::Send { contents: text.to_string() });
        self.pump();
    }

    /// Bring `names` into one established session: the first bootstraps
    /// the channel, the rest join, the first includes them.
    fn establish(&mut self, names: &[&str]) {
        for name in names {
            self.execute(name, Action::Join);
            self.pump();
        }
        let include: BTreeSet<String> = names[1..].iter().map(|s| s.to_string()).collect();
        let op = self.execute(names[0], Action::Change { include, exclude: BTreeSet::new() });
        self.pump();
        assert_eq!(op.status(), OpStatus::Done, "initial agreement did not complete");
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }
}

#[test]
fn five_party_bootstrap_agrees() {
    let names = ["1", "2", "3", "4", "5"];
    let mut world = World::new(&names);
    world.establish(&names);

    let sid = world.sid_of("1");
    for name in &names {
        assert_eq!(world.sid_of(name), sid, "{name} has a different sid");
        assert_eq!(world.members_of(name), World::set(&names));
        assert_eq!(world.session(name).phase(), "COS_");
    }
    // Everyone saw the same membership event.
    for name in &names {
        let events = world.events[*name].borrow();
        assert!(
            events.iter().any(|ev| matches!(
                ev,
                SessionEvent::SNMembers { include, .. } if include.len() == 5
            )),
            "{name} missing SNMembers"
        );
    }
}

#[test]
fn payload_reaches_every_member_with_one_id() {
    let names = ["1", "2", "3", "4", "5"];
    let mut world = World::new(&names);
    world.establish(&names);

    world.send_payload("1", "hello");

    let mids: Vec<_> = names
        .iter()
        .map(|name| {
            let session = world.session(name).current_session().unwrap();
            let unacked = session.transcript().unacked();
            assert_eq!(unacked.len(), 1, "{name} should hold exactly one payload");
            unacked[0]
        })
        .collect();
    assert!(mids.windows(2).all(|w| w[0] == w[1]), "message ids diverged");

    // Consistency: the auto-ack monitors settle the payload everywhere.
    world.elapse(4 * LATENCY);
    world.elapse(LATENCY);
    for name in &names {
        assert!(
            world.session(name).current_session().unwrap().is_consistent(),
            "{name} did not reach consistency"
        );
    }
}

#[test]
fn join_then_exclude_rotates_membership_and_keys() {
    let names = ["1", "2", "3", "4", "5"];
    let mut world = World::new(&["1", "2", "3", "4", "5", "6", "7"]);
    world.establish(&names);
    let sid_before = world.sid_of("1");

    // "6" and "7" enter the channel, then "4" brings them in.
    world.execute("6", Action::Join);
    world.pump();
    world.execute("7", Action::Join);
    world.pump();
    let op = world.execute(
        "4",
        Action::Change { include: World::set(&["6", "7"]), exclude: BTreeSet::new() },
    );
    world.pump();
    assert_eq!(op.status(), OpStatus::Done);

    let sid_joined = world.sid_of("4");
    assert_ne!(sid_joined, sid_before);
    for name in ["1", "2", "3", "4", "5", "6", "7"] {
        assert_eq!(world.sid_of(name), sid_joined);
        assert_eq!(world.members_of(name), World::set(&["1", "2", "3", "4", "5", "6", "7"]));
    }

    // "3" excludes "1" and "4"; they get kicked once the rotation lands.
    let op = world.execute(
        "3",
        Action::Change { include: BTreeSet::new(), exclude: World::set(&["1", "4"]) },
    );
    world.pump();
    assert_eq!(op.status(), OpStatus::Done);

    let remaining = ["2", "3", "5", "6", "7"];
    let sid_after = world.sid_of("3");
    assert_ne!(sid_after, sid_joined);
    for name in remaining {
        assert_eq!(world.sid_of(name), sid_after);
        assert_eq!(world.members_of(name), World::set(&remaining));
    }
    // The excluded pair was kicked from the channel and tore down.
    for name in ["1", "4"] {
        assert!(world.session(name).current_session().is_none(), "{name} kept a session");
        assert_eq!(world.session(name).phase(), "cosj");
    }
    assert_eq!(world.hub.members(), &World::set(&remaining));

    // The rotated group still talks.
    world.send_payload("6", "fresh epoch");
    for name in remaining {
        let transcript = world.session(name).current_session().unwrap().transcript();
        assert_eq!(transcript.len(), 1, "{name} did not receive the new-epoch payload");
    }
}

#[test]
fn refresh_rotates_key_in_place() {
    let names = ["a", "b", "c"];
    let mut world = World::new(&names);
    world.establish(&names);
    let sid_before = world.sid_of("a");

    let op = world.execute("b", Action::Refresh);
    world.pump();
    assert_eq!(op.status(), OpStatus::Done);

    // Same session id, same members; the epoch underneath moved on.
    for name in &names {
        assert_eq!(world.sid_of(name), sid_before);
        assert_eq!(world.members_of(name), World::set(&names));
        assert!(world.session(name).previous_session().is_some(), "{name} did not rotate");
    }

    // The refreshed epoch carries traffic.
    world.send_payload("c", "under the new key");
    for name in &names {
        assert_eq!(
            world.session(name).current_session().unwrap().transcript().len(),
            1,
            "{name} did not place the post-refresh payload"
        );
    }
}

#[test]
fn part_flow_leaves_channel_cleanly() {
    let names = ["a", "b", "c"];
    let mut world = World::new(&names);
    world.establish(&names);

    world.send_payload("a", "goodbye soon");
    // Everyone acks so the session is consistent before parting.
    world.elapse(4 * LATENCY);
    world.elapse(LATENCY);

    let op = world.execute("a", Action::Part);
    world.pump();
    // b and c acknowledge the close-fins via their monitors; then the
    // grace lap settles a's sub-session and it leaves the channel.
    world.elapse(4 * LATENCY);
    world.elapse(LATENCY);
    world.elapse(LATENCY);
    world.pump();

    assert_eq!(op.status(), OpStatus::Done, "part did not resolve: {:?}", op.status());
    assert!(!world.hub.members().contains("a"));
    assert!(world.session("a").current_session().is_none());

    // The stayers queue the leaver for exclusion and rotate on their own.
    world.pump();
    for name in ["b", "c"] {
        assert_eq!(world.members_of(name), World::set(&["b", "c"]), "{name} kept the leaver");
    }
    assert_eq!(world.sid_of("b"), world.sid_of("c"));
}

#[test]
fn losing_proposal_is_failed_and_winner_completes() {
    let names = ["x", "y", "z"];
    let mut world = World::new(&names);
    world.establish(&names);

    // Both x and y propose concurrently, before any delivery happens.
    let op_x = {
        let session = world.sessions.get_mut("x").unwrap();
        let mut channel = world.hub.handle("x");
        session
            .execute(
                &mut channel,
                Action::Change { include: BTreeSet::new(), exclude: World::set(&["z"]) },
            )
            .unwrap()
    };
    let op_y = {
        let session = world.sessions.get_mut("y").unwrap();
        let mut channel = world.hub.handle("y");
        session
            .execute(
                &mut channel,
                Action::Change { include: BTreeSet::new(), exclude: World::set(&["z"]) },
            )
            .unwrap()
    };
    world.pump();

    // The channel ordered x's packet first, so x's operation wins; y's
    // proposal is rejected and its handle fails.
    assert_eq!(op_x.status(), OpStatus::Done);
    assert!(matches!(op_y.status(), OpStatus::Failed(_)));
    for name in ["x", "y"] {
        assert_eq!(world.members_of(name), World::set(&["x", "y"]));
    }
}

#[test]
fn second_operation_while_pending_is_refused() {
    let names = ["p", "q"];
    let mut world = World::new(&names);
    world.establish(&names);

    let session = world.sessions.get_mut("p").unwrap();
    let mut channel = world.hub.handle("p");
    let first = session
        .execute(
            &mut channel,
            Action::Change { include: World::set(&["r"]), exclude: BTreeSet::new() },
        )
        .unwrap();
    assert_eq!(first.status(), OpStatus::Pending);
    let err = session
        .execute(
            &mut channel,
            Action::Change { include: BTreeSet::new(), exclude: World::set(&["q"]) },
        )
        .unwrap_err();
    assert!(matches!(err, cv_session::SessionError::OperationInProgress));
}

#[test]
fn departed_member_is_flushed_into_an_exclusion() {
    let names = ["a", "b", "c"];
    let mut world = World::new(&names);
    world.establish(&names);

    // "c" walks out of the channel without any protocol goodbye.
    {
        let mut channel = world.hub.handle("c");
        use cv_session::channel::{ChannelSend, GroupChannel};
        channel.send(ChannelSend::LeaveSelf);
    }
    world.pump();

    // The stayers queue "c" for exclusion and one proposal wins.
    for name in ["a", "b"] {
        assert_eq!(
            world.members_of(name),
            World::set(&["a", "b"]),
            "{name} did not rotate c out"
        );
    }
    let sid_a = world.sid_of("a");
    assert_eq!(sid_a, world.sid_of("b"));
}

#[test]
fn late_old_epoch_traffic_is_still_readable() {
    // One of b's packets is held back across a rotation; it must still
    // decrypt at c afterwards, via the retired epoch.
    let mut world2 = World::new(&["a", "b", "c", "d"]);
    world2.establish(&["a", "b", "c"]);

    world2.execute("b", Action::Send { contents: "in flight".to_string() });
    let mut held = Vec::new();
    for (to, recv) in world2.hub.take_deliveries() {
        if to == "c" && matches!(recv, ChannelRecv::Packet { .. }) {
            held.push((to, recv));
        } else {
            let session = world2.sessions.get_mut(&to).unwrap();
            let mut channel = world2.hub.handle(&to);
            session.recv(&mut channel, recv).unwrap();
        }
    }
    world2.pump();

    world2.execute("d", Action::Join);
    world2.pump();
    let op = world2.execute(
        "a",
        Action::Change { include: World::set(&["d"]), exclude: BTreeSet::new() },
    );
    world2.pump();
    assert_eq!(op.status(), OpStatus::Done);

    // Now the held old-epoch packet lands at c.
    for (to, recv) in held {
        let session = world2.sessions.get_mut(&to).unwrap();
        let mut channel = world2.hub.handle(&to);
        session.recv(&mut channel, recv).unwrap();
    }
    world2.pump();

    // c placed it in the retiring sub-session: its old transcript caught
    // up with b's, and the new transcript stayed clean of buffer noise.
    let b_old_len = world2.session("b").previous_session().unwrap().transcript().len();
    let c_old_len = world2.session("c").previous_session().unwrap().transcript().len();
    assert_eq!(c_old_len, b_old_len, "c did not catch up on the old epoch");
    assert!(world2.session("c").current_session().unwrap().transcript().is_empty());
}
