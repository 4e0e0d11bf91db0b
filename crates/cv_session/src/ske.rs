//! Authenticated signature key exchange.
//!
//! Alongside the key agreement, every member publishes a fresh nonce and an
//! ephemeral Ed25519 key. The session id is the hash of all `(member,
//! nonce)` pairs sorted by member, so every permutation of the exchange
//! yields the same id. Each member then broadcasts a *session signature*,
//! made with their long-term static key, over `sid ‖ ephemeralPub ‖ nonce`
//! — mutually authenticating the ephemeral keys that sign all further
//! traffic.
//!
//! A session signature that verifies false is fatal: the greeting must be
//! aborted and the failure surfaced.

use tracing::debug;
use zeroize::Zeroize;

use cv_crypto::hash::{sha256_parts, HASH_LEN};
use cv_crypto::rng::random_array;
use cv_crypto::sig::{self, SigningKeyPair, SIGNATURE_LEN};

use crate::error::SessionError;
use crate::gka::Flow;

/// Where static (long-term) public keys come from. The directory is the
/// embedder's: key discovery and trust are outside the engine.
pub trait KeyDirectory {
    fn lookup(&self, member: &str) -> Option<[u8; 32]>;
}

/// Plain map directory, enough for tests and single-process embedders.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDirectory {
    keys: std::collections::HashMap<String, [u8; 32]>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, member: &str, key: [u8; 32]) {
        self.keys.insert(member.to_string(), key);
    }
}

impl KeyDirectory for InMemoryDirectory {
    fn lookup(&self, member: &str) -> Option<[u8; 32]> {
        self.keys.get(member).copied()
    }
}

/// One signature-exchange payload, before merging into a greeting packet.
#[derive(Debug, Clone)]
pub struct SkeMessage {
    pub source: String,
    pub dest: String,
    pub flow: Flow,
    pub members: Vec<String>,
    /// Contributions so far, aligned with the leading members.
    pub nonces: Vec<Vec<u8>>,
    pub pub_keys: Vec<[u8; 32]>,
    pub session_signature: Option<[u8; SIGNATURE_LEN]>,
    /// Ephemeral secret revealed on quit.
    pub signing_key: Option<[u8; 32]>,
}

/// Per-member signature-exchange state.
#[derive(Clone)]
pub struct SkeMember {
    id: String,
    static_keys: SigningKeyPair,
    members: Vec<String>,
    eph_keys: Option<SigningKeyPair>,
    nonces: Vec<Vec<u8>>,
    pub_keys: Vec<[u8; 32]>,
    session_id: Option<[u8; HASH_LEN]>,
    authenticated: Vec<bool>,
    /// The sid our own session signature has been broadcast for, if any.
    signed_sid: Option<[u8; HASH_LEN]>,
}

impl SkeMember {
    pub fn new(id: &str, static_keys: SigningKeyPair) -> Self {
        Self {
            id: id.to_string(),
            static_keys,
            members: Vec::new(),
            eph_keys: None,
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_id: None,
            authenticated: Vec::new(),
            signed_sid: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn session_id(&self) -> Option<&[u8; HASH_LEN]> {
        self.session_id.as_ref()
    }

    pub fn ephemeral_keys(&self) -> Option<&SigningKeyPair> {
        self.eph_keys.as_ref()
    }

    /// The verified ephemeral public key of a member, once the exchange
    /// has its contribution.
    pub fn pub_key_of(&self, member: &str) -> Option<[u8; 32]> {
        let pos = self.members.iter().position(|m| m == member)?;
        self.pub_keys.get(pos).copied()
    }

    pub fn pub_keys(&self) -> impl Iterator<Item = (&str, [u8; 32])> {
        self.members
            .iter()
            .zip(self.pub_keys.iter())
            .map(|(m, k)| (m.as_str(), *k))
    }

    /// True once every member's session signature has verified.
    pub fn is_session_acknowledged(&self) -> bool {
        !self.authenticated.is_empty()
            && self.authenticated.len() == self.members.len()
            && self.authenticated.iter().all(|&a| a)
    }

    /// Drop every verified authentication except our own. Used when a
    /// recovery flow restarts signature collection.
    pub fn discard_authentications(&mut self) {
        let my_pos = self.members.iter().position(|m| m == &self.id);
        for (i, slot) in self.authenticated.iter_mut().enumerate() {
            if Some(i) != my_pos {
                *slot = false;
            }
        }
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Start the exchange: first upflow of an initial agreement.
    pub fn commit(&mut self, others: &[String]) -> Result<SkeMessage, SessionError> {
        if others.is_empty() {
            return Err(SessionError::EmptyMembers("signature exchange"));
        }
        let mut members = vec![self.id.clone()];
        members.extend_from_slice(others);
        check_distinct(&members)?;

        self.wipe();
        self.members = members;
        self.contribute();

        Ok(SkeMessage {
            source: self.id.clone(),
            dest: self.members[1].clone(),
            flow: Flow::Up,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: None,
            signing_key: None,
        })
    }

    /// Add our contribution to a passing upflow; finish with a broadcast
    /// if ours completes the set.
    pub fn upflow(&mut self, msg: &SkeMessage) -> Result<SkeMessage, SessionError> {
        check_distinct(&msg.members)?;
        let my_pos = msg
            .members
            .iter()
            .position(|m| m == &self.id)
            .ok_or_else(|| SessionError::NotAMember(self.id.clone()))?;
        if msg.nonces.len() != my_pos || msg.pub_keys.len() != my_pos {
            return Err(SessionError::IllegalTransition(format!(
                "upflow reached position {my_pos} with {} contributions",
                msg.nonces.len()
            )));
        }

        self.members = msg.members.clone();
        self.nonces = msg.nonces.clone();
        self.pub_keys = msg.pub_keys.clone();
        self.session_id = None;
        self.signed_sid = None;
        self.authenticated = vec![false; self.members.len()];
        self.contribute();

        if self.nonces.len() == self.members.len() {
            // We are last: the nonce set is complete, seal it. Our own
            // entry flips only when the broadcast echoes back, so every
            // member completes at the same point of the total order.
            let sid = compute_sid(&self.members, &self.nonces);
            self.session_id = Some(sid);
            let signature = self.sign_session(&sid, my_pos);
            self.signed_sid = Some(sid);
            Ok(SkeMessage {
                source: self.id.clone(),
                dest: String::new(),
                flow: Flow::Down,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.pub_keys.clone(),
                session_signature: Some(signature),
                signing_key: None,
            })
        } else {
            Ok(SkeMessage {
                source: self.id.clone(),
                dest: self.members[self.nonces.len()].clone(),
                flow: Flow::Up,
                members: self.members.clone(),
                nonces: self.nonces.clone(),
                pub_keys: self.pub_keys.clone(),
                session_signature: None,
                signing_key: None,
            })
        }
    }

    /// Process a broadcast: adopt the sealed nonce set if carried, verify
    /// the sender's session signature, and answer with our own signature
    /// the first time we see a new sid.
    pub fn downflow(
        &mut self,
        directory: &dyn KeyDirectory,
        msg: &SkeMessage,
        initial: bool,
    ) -> Result<Option<SkeMessage>, SessionError> {
        check_distinct(&msg.members)?;

        if !msg.nonces.is_empty() {
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
            if msg.nonces.len() != msg.members.len() || msg.pub_keys.len() != msg.members.len() {
                return Err(SessionError::IllegalTransition(
                    "downflow carries an incomplete contribution set".into(),
                ));
            }
            self.members = msg.members.clone();
            self.nonces = msg.nonces.clone();
            self.pub_keys = msg.pub_keys.clone();
        }

        if self.nonces.len() != self.members.len() {
            return Err(SessionError::IllegalTransition(
                "confirm downflow before the nonce set is complete".into(),
            ));
        }

        let sid = compute_sid(&self.members, &self.nonces);
        if self.session_id != Some(sid) {
            self.session_id = Some(sid);
            self.authenticated = vec![false; self.members.len()];
        }
        if self.authenticated.len() != self.members.len() {
            self.authenticated = vec![false; self.members.len()];
        }

        if let Some(signature) = &msg.session_signature {
            self.verify_session_signature(directory, &msg.source, &sid, signature)?;
        }

        let my_pos = self
            .members
            .iter()
            .position(|m| m == &self.id)
            .ok_or_else(|| SessionError::NotAMember(self.id.clone()))?;

        if self.signed_sid != Some(sid) {
            let signature = self.sign_session(&sid, my_pos);
            self.signed_sid = Some(sid);
            return Ok(Some(SkeMessage {
                source: self.id.clone(),
                dest: String::new(),
                flow: Flow::Down,
                members: self.members.clone(),
                nonces: Vec::new(),
                pub_keys: Vec::new(),
                session_signature: Some(signature),
                signing_key: None,
            }));
        }
        Ok(None)
    }

    /// Extend the exchange for a join: hand the chain to the first joiner.
    pub fn join(&mut self, new_members: &[String]) -> Result<SkeMessage, SessionError> {
        if new_members.is_empty() {
            return Err(SessionError::EmptyMembers("join"));
        }
        let mut combined = self.members.clone();
        combined.extend_from_slice(new_members);
        check_distinct(&combined)?;
        self.members = combined;

        // The sid is about to change; everyone re-confirms.
        self.session_id = None;
        self.signed_sid = None;
        self.authenticated = vec![false; self.members.len()];

        Ok(SkeMessage {
            source: self.id.clone(),
            dest: new_members[0].clone(),
            flow: Flow::Up,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: None,
            signing_key: None,
        })
    }

    /// Shrink the exchange for an exclusion, re-sealing the smaller set.
    pub fn exclude(&mut self, exclude: &[String]) -> Result<SkeMessage, SessionError> {
        if exclude.is_empty() {
            return Err(SessionError::EmptyMembers("exclusion"));
        }
        for member in exclude {
            if member == &self.id {
                return Err(SessionError::SelfExclusion);
            }
            if !self.members.contains(member) {
                return Err(SessionError::NotAMember(member.clone()));
            }
        }

        let keep: Vec<usize> = (0..self.members.len())
            .filter(|&i| !exclude.contains(&self.members[i]))
            .collect();
        self.members = keep.iter().map(|&i| self.members[i].clone()).collect();
        self.nonces = keep.iter().map(|&i| self.nonces[i].clone()).collect();
        self.pub_keys = keep.iter().map(|&i| self.pub_keys[i]).collect();

        let my_pos = self
            .members
            .iter()
            .position(|m| m == &self.id)
            .expect("self survives exclusion");

        let sid = compute_sid(&self.members, &self.nonces);
        self.session_id = Some(sid);
        let signature = self.sign_session(&sid, my_pos);
        self.signed_sid = Some(sid);
        self.authenticated = vec![false; self.members.len()];

        Ok(SkeMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: self.members.clone(),
            nonces: self.nonces.clone(),
            pub_keys: self.pub_keys.clone(),
            session_signature: Some(signature),
            signing_key: None,
        })
    }

    /// Count our own session signature as delivered. Called when the
    /// packet that carried it echoes back from the channel, which keeps
    /// completion at the same total-order position for every member.
    pub fn confirm_own(&mut self) {
        let Some(pos) = self.members.iter().position(|m| m == &self.id) else {
            return;
        };
        if self.session_id.is_some() && self.signed_sid == self.session_id {
            self.authenticated[pos] = true;
        }
    }

    /// Leave the session, revealing the finished session's ephemeral
    /// secret so peers can bound what it could ever have signed.
    pub fn quit(&mut self) -> Result<SkeMessage, SessionError> {
        let eph = self
            .eph_keys
            .as_ref()
            .ok_or(SessionError::NotJoined)?;
        Ok(SkeMessage {
            source: self.id.clone(),
            dest: String::new(),
            flow: Flow::Down,
            members: Vec::new(),
            nonces: Vec::new(),
            pub_keys: Vec::new(),
            session_signature: None,
            signing_key: Some(eph.reveal_secret()),
        })
    }

    pub fn wipe(&mut self) {
        self.members.clear();
        self.eph_keys = None;
        for nonce in self.nonces.iter_mut() {
            nonce.zeroize();
        }
        self.nonces.clear();
        self.pub_keys.clear();
        self.session_id = None;
        self.signed_sid = None;
        self.authenticated.clear();
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn contribute(&mut self) {
        let nonce: [u8; 32] = random_array();
        let eph = SigningKeyPair::generate();
        self.nonces.push(nonce.to_vec());
        self.pub_keys.push(eph.public_bytes());
        self.eph_keys = Some(eph);
    }

    fn sign_session(&self, sid: &[u8; HASH_LEN], my_pos: usize) -> [u8; SIGNATURE_LEN] {
        let mut content = Vec::with_capacity(HASH_LEN + 32 + self.nonces[my_pos].len());
        content.extend_from_slice(sid);
        content.extend_from_slice(&self.pub_keys[my_pos]);
        content.extend_from_slice(&self.nonces[my_pos]);
        self.static_keys.sign(&content)
    }

    fn verify_session_signature(
        &mut self,
        directory: &dyn KeyDirectory,
        source: &str,
        sid: &[u8; HASH_LEN],
        signature: &[u8; SIGNATURE_LEN],
    ) -> Result<(), SessionError> {
        let pos = self
            .members
            .iter()
            .position(|m| m == source)
            .ok_or_else(|| SessionError::NotAMember(source.to_string()))?;
        let static_pub = directory
            .lookup(source)
            .ok_or_else(|| SessionError::AuthenticationFailure(source.to_string()))?;

        let mut content = Vec::with_capacity(HASH_LEN + 32 + self.nonces[pos].len());
        content.extend_from_slice(sid);
        content.extend_from_slice(&self.pub_keys[pos]);
        content.extend_from_slice(&self.nonces[pos]);

        sig::verify(&static_pub, &content, signature)
            .map_err(|_| SessionError::AuthenticationFailure(source.to_string()))?;
        self.authenticated[pos] = true;
        debug!(member = source, "session signature verified");
        Ok(())
    }
}

/// `sid := H(m₁ ‖ n₁ ‖ m₂ ‖ n₂ ‖ …)`, pairs sorted by member identifier;
/// members without a contribution yet are skipped.
pub fn compute_sid(members: &[String], nonces: &[Vec<u8>]) -> [u8; HASH_LEN] {
    let mut pairs: Vec<(&String, &Vec<u8>)> = members.iter().zip(nonces.iter()).collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut parts: Vec<&[u8]> = Vec::with_capacity(pairs.len() * 2);
    for (member, nonce) in &pairs {
        parts.push(member.as_bytes());
        parts.push(nonce.as_slice());
    }
    sha256_parts(&parts)
}

fn check_distinct(members: &[String]) -> Result<(), SessionError> {
    for (i, member) in members.iter().enumerate() {
        if members[..i].contains(member) {
            return Err(SessionError::DuplicateMember(member.clone()));
        }
    }
    Ok(())
}
