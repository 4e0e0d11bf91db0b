//! Group key agreement.
//!
//! A chained Diffie-Hellman group key: the state per member is an ordered
//! member list and a vector of intermediate keys, where `int_keys[i]` is
//! the DH value missing exactly participant i's contribution. A member's
//! own slot is the *cardinal* source — multiplying the member's private
//! scalars into it yields the group-wide shared value the symmetric key is
//! derived from.
//!
//! The initial agreement (`ika`) walks an upflow chain through every
//! member and ends in a broadcast downflow; auxiliary operations (join,
//! exclude, refresh, quit) patch the existing tree.
//!
//! Own private scalars live in an append-only list. Cardinals and group
//! keys fold `int_keys[my_pos]` through every retained scalar in order;
//! key-rotating operations first collapse the retained scalars into the
//! own slot and wipe them.

use tracing::debug;
use zeroize::Zeroize;

use cv_crypto::dh::{DhPoint, DhSecret};
use cv_crypto::hash::{hkdf_sha256, HASH_LEN};

use crate::error::SessionError;

/// HKDF context for the symmetric group key.
const GROUP_KEY_INFO: &[u8] = b"mpenc group key";

/// Direction of a key-agreement packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Directed to the next member in the chain.
    Up,
    /// Broadcast to everyone.
    Down,
}

/// One key-agreement payload, before it is merged into a greeting packet.
#[derive(Debug, Clone)]
pub struct GkaMessage {
    pub source: String,
    /// Empty for broadcast.
    pub dest: String,
    pub flow: Flow,
    pub members: Vec<String>,
    pub int_keys: Vec<Option<DhPoint>>,
}

/// Per-member key agreement state.
#[derive(Clone)]
pub struct GkaMember {
    id: String,
    members: Vec<String>,
    int_keys: Vec<Option<DhPoint>>,
    /// Own contributions to the current tree, oldest first.
    priv_keys: Vec<DhSecret>,
    group_key: Option<[u8; HASH_LEN]>,
}

impl GkaMember {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            members: Vec::new(),
            int_keys: Vec::new(),
            priv_keys: Vec::new(),
            group_key: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn group_key(&self) -> Option<&[u8; HASH_LEN]> {
        self.group_key.as_ref()
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Initial key agreement: start the upflow chain.
    pub fn ika(&mut self, others: &[String]) -> Result<GkaMessage, SessionError> {
        check_not_empty(others, "initial agreement")?;
        let mut members = vec![self.id.clone()];
        members.extend_from_slice(others);
        check_distinct(&members)?;

        self.wipe();
        self.members = members;
        self.int_keys = vec![None];
        let cardinal = self.renew(false);
        self.int_keys.push(Some(cardinal));

        Ok(GkaMessage {
            source: self.id.clone(),
            dest: self.members[1].clone(),
            flow: Flow::Up,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Extend the group: renew own contribution and hand the chain to the
    /// first new member.
    pub fn aka_join(&mut self, new_members: &[String]) -> Result<GkaMessage, SessionError> {
        check_not_empty(new_members, "join")?;
        self.check_stable("join")?;
        for member in new_members {
            if self.members.contains(member) {
                return Err(SessionError::DuplicateMember(member.clone()));
            }
        }
        let mut combined = self.members.clone();
        combined.extend_from_slice(new_members);
        check_distinct(&combined)?;
        self.members = combined;

        let cardinal = self.renew(false);
        self.int_keys.push(Some(cardinal));

        Ok(GkaMessage {
            source: self.id.clone(),
            dest: new_members[0].clone(),
            flow: Flow::Up,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    /// Shrink the group and rotate the key, in one broadcast.
    pub fn aka_exclude(&mut self, exclude: &[String]) -> Result<GkaMessage, SessionError> {
        check_not_empty(exclude, "exclusion")?;
        self.check_stable("exclusion")?;
        for member in exclude {
            if member == &self.id {
                return Err(SessionError::SelfExclusion);
            }
            if !self.members.contains(member) {
                return Err(SessionError::NotAMember(member.clone()));
            }
        }

        // Remove member and intermediate key at the same index.
        let mut members = Vec::with_capacity(self.members.len());
        let mut int_keys = Vec::with_capacity(self.int_keys.len());
        for (member, int_key) in self.members.drain(..).zip(self.int_keys.drain(..)) {
            if exclude.contains(&member) {
                if let Some(mut key) = int_key {
                    key.zeroize();
                }
            } else {
                members.push(member);
                int_keys.push(int_key);
            }
        }
        self.members = members;
        self.int_keys = int_keys;

        let cardinal = self.renew(true);
        self.derive_group_key_from(&cardinal);
        self.downflow_message()
    }

    /// Rotate the group key without changing membership.
    pub fn aka_refresh(&mut self) -> Result<GkaMessage, SessionError> {
        self.check_stable("refresh")?;
        let cardinal = self.renew(true);
        self.derive_group_key_from(&cardinal);
        self.downflow_message()
    }

    /// Leave: wipe all own state. The signature exchange carries the
    /// departure on the wire; no key-agreement packet is produced.
    pub fn aka_quit(&mut self) {
        self.wipe();
    }

    // ── Flows ────────────────────────────────────────────────────────────

    /// Process an upflow packet addressed to us: contribute and pass on,
    /// or finish with a broadcast if we are last in the chain.
    pub fn upflow(&mut self, msg: &GkaMessage) -> Result<GkaMessage, SessionError> {
        check_distinct(&msg.members)?;
        if msg.int_keys.len() > msg.members.len() {
            return Err(SessionError::IllegalTransition(format!(
                "{} intermediate keys for {} members",
                msg.int_keys.len(),
                msg.members.len()
            )));
        }
        let my_pos = msg
            .members
            .iter()
            .position(|m| m == &self.id)
            .ok_or_else(|| SessionError::NotAMember(self.id.clone()))?;

        self.members = msg.members.clone();
        self.int_keys = msg.int_keys.clone();
        if self.int_keys.is_empty() {
            self.int_keys = vec![None];
        }

        let cardinal = self.renew(false);
        if my_pos == self.members.len() - 1 {
            self.derive_group_key_from(&cardinal);
            self.downflow_message()
        } else {
            self.int_keys.push(Some(cardinal));
            Ok(GkaMessage {
                source: self.id.clone(),
                dest: self.members[my_pos + 1].clone(),
                flow: Flow::Up,
                members: self.members.clone(),
                int_keys: self.int_keys.clone(),
            })
        }
    }

    /// Process a broadcast downflow: adopt the final intermediate keys and
    /// derive the new group key.
    ///
    /// `initial` distinguishes the first agreement (member lists must match
    /// exactly) from auxiliary operations (the broadcast may shrink ours).
    pub fn downflow(&mut self, msg: &GkaMessage, initial: bool) -> Result<(), SessionError> {
        check_distinct(&msg.members)?;
        if msg.int_keys.len() != msg.members.len() {
            return Err(SessionError::IllegalTransition(format!(
                "downflow carries {} intermediate keys for {} members",
                msg.int_keys.len(),
                msg.members.len()
            )));
        }
        if initial {
            if msg.members != self.members {
                return Err(SessionError::IllegalTransition(
                    "initial downflow member list differs from ours".into(),
                ));
            }
        } else {
            // An auxiliary downflow may shrink the set (exclusion) or
            // extend it (join), but never swap members arbitrarily.
            let shrinks = msg.members.iter().all(|m| self.members.contains(m));
            let extends = self.members.iter().all(|m| msg.members.contains(m));
            if !shrinks && !extends {
                return Err(SessionError::IllegalTransition(
                    "downflow member list is unrelated to ours".into(),
                ));
            }
        }

        let my_pos = msg
            .members
            .iter()
            .position(|m| m == &self.id)
            .ok_or_else(|| SessionError::NotAMember(self.id.clone()))?;

        self.members = msg.members.clone();
        self.int_keys = msg.int_keys.clone();

        let own_slot = self.int_keys[my_pos]
            .ok_or_else(|| SessionError::IllegalTransition("own intermediate key slot is empty".into()))?;
        let cardinal = self.fold_priv_keys(own_slot);
        self.derive_group_key_from(&cardinal);
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────

    /// Contribute a fresh private scalar.
    ///
    /// With `collapse`, retained scalars are first folded into the own
    /// slot and wiped: the rotation discards them while their history
    /// stays in the tree.
    fn renew(&mut self, collapse: bool) -> DhPoint {
        let my_pos = self
            .members
            .iter()
            .position(|m| m == &self.id)
            .expect("renew only runs with self in members");

        if collapse && !self.priv_keys.is_empty() {
            let mut folded = self.int_keys[my_pos].take();
            for key in self.priv_keys.drain(..) {
                folded = Some(key.mult(folded.as_ref()));
            }
            self.int_keys[my_pos] = folded;
            debug!(member = %self.id, "collapsed retained scalars into own slot");
        }

        let fresh = DhSecret::generate();
        for (i, slot) in self.int_keys.iter_mut().enumerate() {
            if i != my_pos {
                *slot = Some(fresh.mult(slot.as_ref()));
            }
        }
        self.priv_keys.push(fresh);

        self.fold_priv_keys_opt(self.int_keys[my_pos])
    }

    /// `int_keys[my_pos]` with every retained scalar multiplied in.
    fn fold_priv_keys(&self, base: DhPoint) -> DhPoint {
        let mut acc = base;
        for key in &self.priv_keys {
            acc = key.shared(&acc);
        }
        acc
    }

    fn fold_priv_keys_opt(&self, base: Option<DhPoint>) -> DhPoint {
        let mut acc = base;
        for key in &self.priv_keys {
            acc = Some(key.mult(acc.as_ref()));
        }
        acc.expect("at least one retained scalar")
    }

    fn derive_group_key_from(&mut self, cardinal: &DhPoint) {
        let mut key = [0u8; HASH_LEN];
        hkdf_sha256(cardinal, GROUP_KEY_INFO, &mut key)
            .expect("HKDF output of one block cannot fail");
        if let Some(old) = self.group_key.as_mut() {
            old.zeroize();
        }
        self.group_key = Some(key);
    }

    fn downflow_message(&self) -> Result<GkaMessage, SessionError> {
        Ok(GkaMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            int_keys: self.int_keys.clone(),
        })
    }

    fn check_stable(&self, what: &'static str) -> Result<(), SessionError> {
        if self.members.is_empty() {
            return Err(SessionError::EmptyMembers(what));
        }
        if self.int_keys.len() != self.members.len() {
            return Err(SessionError::IllegalTransition(format!(
                "{what} attempted mid-flow: {} intermediate keys, {} members",
                self.int_keys.len(),
                self.members.len()
            )));
        }
        Ok(())
    }

    fn wipe(&mut self) {
        // DhSecret zeroizes on drop.
        self.priv_keys.clear();
        for slot in self.int_keys.iter_mut() {
            if let Some(point) = slot.as_mut() {
                point.zeroize();
            }
        }
        self.int_keys.clear();
        if let Some(key) = self.group_key.as_mut() {
            key.zeroize();
        }
        self.group_key = None;
        self.members.clear();
    }
}

impl Drop for GkaMember {
    fn drop(&mut self) {
        self.wipe();
    }
}

fn check_not_empty(members: &[String], what: &'static str) -> Result<(), SessionError> {
    if members.is_empty() {
        Err(SessionError::EmptyMembers(what))
    } else {
        Ok(())
    }
}

fn check_distinct(members: &[String]) -> Result<(), SessionError> {
    for (i, member) in members.iter().enumerate() {
        if members[..i].contains(member) {
            return Err(SessionError::DuplicateMember(member.clone()));
        }
    }
    Ok(())
}
