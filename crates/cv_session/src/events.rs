//! Session event fan-out.
//!
//! One `EventContext` per session replaces ad-hoc observables: subscribers
//! register a callback and get a canceller back. Emission is synchronous in
//! registration order; a subscriber MUST NOT mutate the publisher, and
//! re-entrant publishes from inside a callback are buffered and delivered
//! after the current round finishes.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use cv_proto::data::MsgId;

/// Lifecycle state of one sub-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Joined,
    Parting,
    Parted,
    PartFailed,
}

/// Everything the engine reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A message entered the transcript.
    MsgAccepted { mid: MsgId },
    /// Every recipient of the message has now acknowledged it.
    MsgFullyAcked { mid: MsgId },
    /// A buffered message's parents never arrived.
    NotAccepted { author: String, parents: BTreeSet<MsgId> },
    /// The full-ack monitor expired with recipients still missing.
    NotFullyAcked { mid: MsgId },
    /// A ciphertext could not be matched to any known epoch in time.
    /// `sid` names the sub-session whose trial buffer dropped it; all
    /// zeroes when no sub-session existed at all.
    NotDecrypted { sid: [u8; 32], sender: String, size: usize },
    /// The sub-session moved between lifecycle states.
    SNStateChange { new: SessionState, old: SessionState },
    /// Membership changed: who stayed, who came, who went.
    SNMembers {
        remain: BTreeSet<String>,
        include: BTreeSet<String>,
        exclude: BTreeSet<String>,
    },
}

type Subscriber = Box<dyn Fn(&SessionEvent)>;

/// Cancellation handle returned by `subscribe`.
#[derive(Debug, Clone, Copy)]
pub struct EventCanceller(usize);

/// Synchronous publish/subscribe hub.
#[derive(Default)]
pub struct EventContext {
    subscribers: RefCell<Vec<Option<Subscriber>>>,
    pending: RefCell<VecDeque<SessionEvent>>,
    publishing: Cell<bool>,
}

impl EventContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, f: impl Fn(&SessionEvent) + 'static) -> EventCanceller {
        let mut subs = self.subscribers.borrow_mut();
        subs.push(Some(Box::new(f)));
        EventCanceller(subs.len() - 1)
    }

    pub fn cancel(&self, canceller: EventCanceller) {
        if let Some(slot) = self.subscribers.borrow_mut().get_mut(canceller.0) {
            *slot = None;
        }
    }

    pub fn cancel_all(&self) {
        self.subscribers.borrow_mut().clear();
    }

    /// Deliver `event` to every live subscriber. Re-entrant calls queue
    /// behind the one in flight, preserving emission order.
    pub fn publish(&self, event: SessionEvent) {
        self.pending.borrow_mut().push_back(event);
        if self.publishing.get() {
            return;
        }
        self.publishing.set(true);
        loop {
            let next = match self.pending.borrow_mut().pop_front() {
                Some(ev) => ev,
                None => break,
            };
            // Index-based loop with a fresh borrow per step: a callback may
            // publish (queued above) but must not subscribe or cancel.
            let mut i = 0;
            loop {
                let subs = self.subscribers.borrow();
                match subs.get(i) {
                    None => break,
                    Some(None) => {}
                    Some(Some(f)) => f(&next),
                }
                drop(subs);
                i += 1;
            }
        }
        self.publishing.set(false);
    }
}
