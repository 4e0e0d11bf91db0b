//! ServerOrder: consensus on which greeting proposal the channel accepted.
//!
//! Membership-changing operations ride the channel's total order. Every
//! operation opens with an *initial* packet whose id is the hash of its
//! public text and which names the previous operation's *final* packet id
//! (`prev_pf`). Because every member sees the same packet order, "the
//! first initial packet referencing the current `prev_pf`" picks the same
//! winner everywhere; concurrent proposals lose deterministically and are
//! resolved by hash equality against the proposer's own packet id.

use std::collections::BTreeSet;

use tracing::debug;

use cv_crypto::hash::{sha256_parts, HASH_LEN};

/// Why an initial packet was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderReject {
    /// Another operation holds the floor.
    OperationOngoing,
    /// The packet chains from a different final packet than ours.
    StalePrevPf,
    /// The sender is not in the channel.
    SenderNotInChannel,
    /// We have no order reference yet and the operation does not involve
    /// us, so we cannot adopt its metadata.
    NotSynced,
}

/// Linearisation state for one channel.
#[derive(Debug, Clone)]
pub struct ServerOrder {
    prev_pf: Option<[u8; HASH_LEN]>,
    prev_ch: BTreeSet<String>,
    ongoing: Option<[u8; HASH_LEN]>,
    synced: bool,
}

impl Default for ServerOrder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerOrder {
    pub fn new() -> Self {
        Self {
            prev_pf: None,
            prev_ch: BTreeSet::new(),
            ongoing: None,
            synced: false,
        }
    }

    /// Deterministic packet id over the public text, the attributed
    /// sender and the channel membership at delivery.
    pub fn make_packet_id(
        pubtxt: &[u8],
        sender: &str,
        channel_members: &BTreeSet<String>,
    ) -> [u8; HASH_LEN] {
        let mut parts: Vec<&[u8]> = vec![pubtxt, sender.as_bytes()];
        for member in channel_members {
            parts.push(member.as_bytes());
        }
        sha256_parts(&parts)
    }

    /// The reference value a new proposal of ours must chain from.
    pub fn prev_pf(&self) -> Option<[u8; HASH_LEN]> {
        self.prev_pf
    }

    /// Channel membership recorded at the last final packet.
    pub fn prev_ch(&self) -> &BTreeSet<String> {
        &self.prev_ch
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn has_ongoing_op(&self) -> bool {
        self.ongoing.is_some()
    }

    pub fn ongoing_op(&self) -> Option<[u8; HASH_LEN]> {
        self.ongoing
    }

    /// Bootstrap in an empty channel: we are first, so the order starts
    /// with us. Seeds `prev_pf` with the hash of the empty string.
    pub fn sync_new(&mut self) {
        self.synced = true;
        self.prev_pf = Some(sha256_parts(&[b""]));
        self.prev_ch = BTreeSet::new();
        debug!("server order bootstrapped in empty channel");
    }

    /// Adopt the order reference carried by an operation that includes us
    /// (the invited-member path).
    pub fn sync_to(&mut self, prev_pf: [u8; HASH_LEN], prev_ch: BTreeSet<String>) {
        self.synced = true;
        self.prev_pf = Some(prev_pf);
        self.prev_ch = prev_ch;
        debug!("server order adopted from inviting operation");
    }

    /// Judge the initial packet of a proposed operation.
    ///
    /// `includes_self` lets an unsynced member adopt the proposal's own
    /// metadata when the operation invites it.
    pub fn try_op_start(
        &mut self,
        pi: [u8; HASH_LEN],
        claimed_prev_pf: [u8; HASH_LEN],
        sender: &str,
        channel_members: &BTreeSet<String>,
        self_id: &str,
        includes_self: bool,
    ) -> Result<(), OrderReject> {
        if self.ongoing.is_some() {
            return Err(OrderReject::OperationOngoing);
        }
        if !channel_members.contains(sender) && sender != self_id {
            return Err(OrderReject::SenderNotInChannel);
        }
        if !self.synced {
            if !includes_self {
                return Err(OrderReject::NotSynced);
            }
            self.sync_to(claimed_prev_pf, channel_members.clone());
        }
        if self.prev_pf != Some(claimed_prev_pf) {
            return Err(OrderReject::StalePrevPf);
        }
        self.ongoing = Some(pi);
        Ok(())
    }

    /// Accept a non-initial packet iff it belongs to the ongoing operation.
    pub fn accepts_packet(&self, prev_pi: Option<[u8; HASH_LEN]>) -> bool {
        match (self.ongoing, prev_pi) {
            (Some(op), Some(claimed)) => op == claimed,
            _ => false,
        }
    }

    /// Close the ongoing operation; `pf` is the final packet's id.
    pub fn complete_op(&mut self, pf: [u8; HASH_LEN], channel_members: &BTreeSet<String>) {
        self.prev_pf = Some(pf);
        self.prev_ch = channel_members.clone();
        self.ongoing = None;
    }

    /// Abandon the ongoing operation without moving the reference.
    pub fn abort_op(&mut self) {
        self.ongoing = None;
    }
}
