//! The broadcast group channel, as the engine consumes it.
//!
//! The transport promises: exactly-once delivery of each packet to every
//! current member (including an echo to the sender), a total order on
//! membership-control packets that every member observes identically, and
//! transport-level sender attribution. Cryptographic authentication is the
//! engine's own job and never relies on the last point.
//!
//! `LoopbackChannel` is an in-process hub honouring that contract, used by
//! the integration scenarios; production embedders adapt their transport.

use std::collections::{BTreeSet, VecDeque};

/// Outbound channel instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSend {
    /// Publish a packet to the current members.
    Packet { pubtxt: String, recipients: BTreeSet<String> },
    /// Enter the channel ourselves.
    EnterSelf,
    /// Leave the channel ourselves.
    LeaveSelf,
    /// Invite other users into the channel.
    Invite { members: BTreeSet<String> },
    /// Kick other users out of the channel.
    Kick { members: BTreeSet<String> },
}

/// Inbound channel deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRecv {
    /// A packet with its transport-attributed sender.
    Packet { pubtxt: String, sender: String },
    /// A membership notice: who entered, who left, the membership now.
    Membership {
        enter: BTreeSet<String>,
        leave: BTreeSet<String>,
        members: BTreeSet<String>,
    },
}

/// What the engine needs from a transport.
pub trait GroupChannel {
    fn send(&mut self, out: ChannelSend);
    /// `None` iff we are not currently in the channel.
    fn cur_members(&self) -> Option<BTreeSet<String>>;
}

// ── Loopback test double ─────────────────────────────────────────────────────

/// A per-member handle onto a shared in-process hub.
///
/// Deliveries queue up globally in one total order; the test driver pumps
/// them with `take_deliveries` and feeds each `(recipient, recv)` pair to
/// the matching engine, which is exactly the serial `recv()` contract.
#[derive(Debug, Default)]
pub struct LoopbackHub {
    members: BTreeSet<String>,
    deliveries: VecDeque<(String, ChannelRecv)>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    pub fn handle(&mut self, owner: &str) -> LoopbackChannel<'_> {
        LoopbackChannel { owner: owner.to_string(), hub: self }
    }

    /// Drain queued deliveries in order.
    pub fn take_deliveries(&mut self) -> Vec<(String, ChannelRecv)> {
        self.deliveries.drain(..).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.deliveries.is_empty()
    }

    fn broadcast_membership(&mut self, enter: BTreeSet<String>, leave: BTreeSet<String>) {
        let members = self.members.clone();
        // Leavers also hear that they left.
        let audience: BTreeSet<String> = members.union(&leave).cloned().collect();
        for member in audience {
            self.deliveries.push_back((
                member,
                ChannelRecv::Membership {
                    enter: enter.clone(),
                    leave: leave.clone(),
                    members: members.clone(),
                },
            ));
        }
    }

    fn apply(&mut self, owner: &str, out: ChannelSend) {
        match out {
            ChannelSend::Packet { pubtxt, recipients } => {
                if !self.members.contains(owner) {
                    return;
                }
                // Exactly-once to every current member, echo included.
                for member in self.members.clone() {
                    if recipients.is_empty() || recipients.contains(&member) || member == owner {
                        self.deliveries.push_back((
                            member,
                            ChannelRecv::Packet {
                                pubtxt: pubtxt.clone(),
                                sender: owner.to_string(),
                            },
                        ));
                    }
                }
            }
            ChannelSend::EnterSelf => {
                if self.members.insert(owner.to_string()) {
                    self.broadcast_membership([owner.to_string()].into(), BTreeSet::new());
                }
            }
            ChannelSend::LeaveSelf => {
                if self.members.remove(owner) {
                    self.broadcast_membership(BTreeSet::new(), [owner.to_string()].into());
                }
            }
            ChannelSend::Invite { members } => {
                let entered: BTreeSet<String> = members
                    .into_iter()
                    .filter(|m| self.members.insert(m.clone()))
                    .collect();
                if !entered.is_empty() {
                    self.broadcast_membership(entered, BTreeSet::new());
                }
            }
            ChannelSend::Kick { members } => {
                let left: BTreeSet<String> = members
                    .into_iter()
                    .filter(|m| self.members.remove(m))
                    .collect();
                if !left.is_empty() {
                    self.broadcast_membership(BTreeSet::new(), left);
                }
            }
        }
    }
}

/// Borrowed per-member view implementing `GroupChannel`.
pub struct LoopbackChannel<'a> {
    owner: String,
    hub: &'a mut LoopbackHub,
}

impl GroupChannel for LoopbackChannel<'_> {
    fn send(&mut self, out: ChannelSend) {
        self.hub.apply(&self.owner.clone(), out);
    }

    fn cur_members(&self) -> Option<BTreeSet<String>> {
        if self.hub.members.contains(&self.owner) {
            Some(self.hub.members.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_broadcasts_membership() {
        let mut hub = LoopbackHub::new();
        hub.handle("a").send(ChannelSend::EnterSelf);
        hub.handle("b").send(ChannelSend::EnterSelf);
        let deliveries = hub.take_deliveries();
        // a hears its own entry, then both hear b's.
        assert_eq!(deliveries.len(), 3);
        assert!(matches!(
            &deliveries[0],
            (to, ChannelRecv::Membership { enter, .. }) if to == "a" && enter.contains("a")
        ));
    }

    #[test]
    fn packet_echoes_to_sender() {
        let mut hub = LoopbackHub::new();
        hub.handle("a").send(ChannelSend::EnterSelf);
        hub.handle("b").send(ChannelSend::EnterSelf);
        hub.take_deliveries();

        hub.handle("a").send(ChannelSend::Packet {
            pubtxt: "hi".into(),
            recipients: BTreeSet::new(),
        });
        let deliveries = hub.take_deliveries();
        let recipients: Vec<&String> = deliveries.iter().map(|(to, _)| to).collect();
        assert_eq!(recipients, ["a", "b"]);
    }

    #[test]
    fn non_member_cannot_send() {
        let mut hub = LoopbackHub::new();
        hub.handle("a").send(ChannelSend::EnterSelf);
        hub.take_deliveries();
        hub.handle("ghost").send(ChannelSend::Packet {
            pubtxt: "boo".into(),
            recipients: BTreeSet::new(),
        });
        assert!(hub.is_idle());
    }
}
