//! Greeting orchestration.
//!
//! The greeter merges the key agreement and the signature exchange into
//! single wire packets and sequences them through upflow and downflow
//! phases. It owns the operation state machine:
//!
//! ```text
//! NULL → INIT_UPFLOW → INIT_DOWNFLOW → READY
//! READY → AUX_UPFLOW / AUX_DOWNFLOW → READY     (join, exclude, refresh)
//! any   → QUIT
//! ```
//!
//! Packet acceptance ordering is not decided here: the caller consults
//! `ServerOrder` first and only delivers packets the channel's total order
//! accepted. A proposal that may yet lose the ordering race is built on a
//! clone of the greeter and swapped in on acceptance.

use tracing::{debug, warn};
use zeroize::Zeroize;

use cv_crypto::hash::HASH_LEN;
use cv_crypto::sig::SigningKeyPair;

use cv_proto::greeting::{
    self, DecodedGreeting, GreetingMetadata, GreetingWire, MessageType, Operation, TypeFlags,
};

use crate::error::SessionError;
use crate::gka::{Flow, GkaMember, GkaMessage};
use crate::ske::{KeyDirectory, SkeMember, SkeMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GreetState {
    Null,
    InitUpflow,
    InitDownflow,
    Ready,
    AuxUpflow,
    AuxDownflow,
    Quit,
}

/// Everything a completed greeting hands to the next sub-session.
#[derive(Clone)]
pub struct GreetingResult {
    pub sid: [u8; HASH_LEN],
    pub members: Vec<String>,
    pub pub_keys: Vec<(String, [u8; 32])>,
    pub group_key: [u8; HASH_LEN],
}

impl Drop for GreetingResult {
    fn drop(&mut self) {
        self.group_key.zeroize();
    }
}

impl std::fmt::Debug for GreetingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreetingResult")
            .field("members", &self.members)
            .finish_non_exhaustive()
    }
}

/// Outcome of feeding one accepted packet to the greeter.
#[derive(Debug)]
pub enum GreeterOutcome {
    /// The packet is not for us in this state; nothing changed.
    Ignored(&'static str),
    /// The operation excludes us; we keep quiet and wait to be kicked.
    DroppedOut,
    /// The operation advanced; `0` or one packet to publish.
    Progress(Option<Vec<u8>>),
    /// The operation finished; the session material is latched.
    Completed { out: Option<Vec<u8>>, result: GreetingResult },
}

#[derive(Clone)]
pub struct Greeter {
    id: String,
    gka: GkaMember,
    ske: SkeMember,
    state: GreetState,
    operation: Option<Operation>,
    recovering: bool,
    /// Stamped on the first packet of an operation we initiate.
    metadata: Option<GreetingMetadata>,
    /// The accepted initial packet id of the ongoing operation.
    op_pi: Option<[u8; 32]>,
    /// Set when our own broadcast finishes the operation by itself
    /// (refresh): completion is deferred until the echo is accepted.
    pending_own_completion: bool,
}

impl Greeter {
    pub fn new(id: &str, static_keys: SigningKeyPair) -> Self {
        Self {
            id: id.to_string(),
            gka: GkaMember::new(id),
            ske: SkeMember::new(id, static_keys),
            state: GreetState::Null,
            operation: None,
            recovering: false,
            metadata: None,
            op_pi: None,
            pending_own_completion: false,
        }
    }

    pub fn state(&self) -> GreetState {
        self.state
    }

    pub fn operation(&self) -> Option<Operation> {
        self.operation
    }

    pub fn members(&self) -> &[String] {
        self.ske.members()
    }

    /// Our ephemeral signing keys for the latched session, once committed.
    pub fn ephemeral_keys(&self) -> Option<&SigningKeyPair> {
        self.ske.ephemeral_keys()
    }

    /// Record the accepted initial packet id of the current operation;
    /// later packets we emit reference it.
    pub fn set_op_packet_id(&mut self, pi: [u8; 32]) {
        self.op_pi = Some(pi);
    }

    pub fn set_recovering(&mut self, recovering: bool) {
        self.recovering = recovering;
    }

    // ── Initiator operations ─────────────────────────────────────────────

    /// Propose the initial agreement with `others`.
    pub fn start(
        &mut self,
        others: &[String],
        metadata: GreetingMetadata,
    ) -> Result<Vec<u8>, SessionError> {
        if self.state != GreetState::Null {
            return Err(SessionError::IllegalTransition(format!(
                "start from {:?}",
                self.state
            )));
        }
        let gka = self.gka.ika(others)?;
        let ske = self.ske.commit(others)?;
        self.operation = Some(Operation::Start);
        self.metadata = Some(metadata);
        self.state = GreetState::InitUpflow;
        self.encode(
            MessageType::greeting(Operation::Start, self.flags(TypeFlags::GKA | TypeFlags::SKE | TypeFlags::INIT)),
            Some(gka),
            Some(ske),
            true,
        )
    }

    /// Propose extending the group.
    pub fn join(
        &mut self,
        new_members: &[String],
        metadata: GreetingMetadata,
    ) -> Result<Vec<u8>, SessionError> {
        self.check_ready("join")?;
        let gka = self.gka.aka_join(new_members)?;
        let ske = self.ske.join(new_members)?;
        self.operation = Some(Operation::Join);
        self.metadata = Some(metadata);
        self.state = GreetState::AuxUpflow;
        self.encode(
            MessageType::greeting(
                Operation::Join,
                self.flags(TypeFlags::AUX | TypeFlags::GKA | TypeFlags::SKE | TypeFlags::INIT),
            ),
            Some(gka),
            Some(ske),
            true,
        )
    }

    /// Propose shrinking the group; a single broadcast that rotates keys.
    pub fn exclude(
        &mut self,
        exclude: &[String],
        metadata: GreetingMetadata,
    ) -> Result<Vec<u8>, SessionError> {
        self.check_ready("exclude")?;
        let gka = self.gka.aka_exclude(exclude)?;
        let ske = self.ske.exclude(exclude)?;
        self.operation = Some(Operation::Exclude);
        self.metadata = Some(metadata);
        self.state = GreetState::AuxDownflow;
        self.encode(
            MessageType::greeting(
                Operation::Exclude,
                self.flags(
                    TypeFlags::AUX
                        | TypeFlags::DOWN
                        | TypeFlags::GKA
                        | TypeFlags::SKE
                        | TypeFlags::INIT,
                ),
            ),
            Some(gka),
            Some(ske),
            true,
        )
    }

    /// Propose a key refresh; membership and sid are unchanged.
    pub fn refresh(&mut self, metadata: GreetingMetadata) -> Result<Vec<u8>, SessionError> {
        self.check_ready("refresh")?;
        let gka = self.gka.aka_refresh()?;
        self.operation = Some(Operation::Refresh);
        self.metadata = Some(metadata);
        self.state = GreetState::AuxDownflow;
        self.pending_own_completion = true;
        self.encode(
            MessageType::greeting(
                Operation::Refresh,
                self.flags(TypeFlags::AUX | TypeFlags::DOWN | TypeFlags::GKA | TypeFlags::INIT),
            ),
            Some(gka),
            None,
            true,
        )
    }

    /// Leave: reveal the session's ephemeral secret and wipe.
    pub fn quit(&mut self, metadata: GreetingMetadata) -> Result<Vec<u8>, SessionError> {
        if self.state == GreetState::Quit {
            return Err(SessionError::IllegalTransition("quit after quit".into()));
        }
        let ske = self.ske.quit()?;
        self.operation = Some(Operation::Quit);
        self.metadata = Some(metadata);
        let packet = self.encode(
            MessageType::greeting(
                Operation::Quit,
                self.flags(TypeFlags::AUX | TypeFlags::DOWN | TypeFlags::SKE | TypeFlags::INIT),
            ),
            None,
            Some(ske),
            true,
        )?;
        self.gka.aka_quit();
        self.state = GreetState::Quit;
        Ok(packet)
    }

    // ── Incoming ─────────────────────────────────────────────────────────

    /// Feed one packet that `ServerOrder` accepted.
    pub fn process_incoming(
        &mut self,
        directory: &dyn KeyDirectory,
        decoded: &DecodedGreeting,
    ) -> Result<GreeterOutcome, SessionError> {
        let wire = &decoded.wire;

        if self.state == GreetState::Quit {
            return Ok(GreeterOutcome::Ignored("after quit"));
        }
        if wire.source == self.id {
            if self.pending_own_completion {
                self.pending_own_completion = false;
                self.state = GreetState::Ready;
                let result = self.latch_result()?;
                return Ok(GreeterOutcome::Completed { out: None, result });
            }
            // The echo of a packet carrying our session signature is the
            // point where our own confirmation counts.
            if wire.session_signature.is_some() && self.state != GreetState::Ready {
                self.ske.confirm_own();
                if self.ske.is_session_acknowledged() {
                    self.state = GreetState::Ready;
                    self.recovering = false;
                    let result = self.latch_result()?;
                    return Ok(GreeterOutcome::Completed { out: None, result });
                }
                return Ok(GreeterOutcome::Progress(None));
            }
            return Ok(GreeterOutcome::Ignored("own packet"));
        }
        if !wire.members.is_empty() && !wire.members.iter().any(|m| m == &self.id) {
            // The operation moves on without us. Stay quiet; the channel
            // kick is the application-visible part of our exclusion.
            warn!(member = %self.id, "greeting excludes us; awaiting kick");
            return Ok(GreeterOutcome::DroppedOut);
        }
        if !wire.dest.is_empty() && wire.dest != self.id {
            return Ok(GreeterOutcome::Ignored("directed at another member"));
        }

        self.verify_packet(decoded)?;

        let op = wire.ty.operation();
        let down = wire.ty.is_downflow();
        let aux = wire.ty.contains(TypeFlags::AUX);
        self.check_transition(op, down, aux)?;
        self.operation = Some(op);

        // Confirmations straggling in after we latched (the channel delivers
        // every member's confirm to everyone) must not complete us twice.
        let already_complete = self.state == GreetState::Ready
            && self.ske.is_session_acknowledged()
            && matches!(op, Operation::Start | Operation::Join | Operation::Exclude);

        if wire.ty.contains(TypeFlags::RECOVER) && !down {
            // Recovery restart: stale confirmations are void. Downflow
            // packets leave verified entries alone.
            self.ske.discard_authentications();
            self.recovering = true;
        }

        if op == Operation::Quit {
            // Nothing to derive; the quitter's departure is dealt with by
            // a later exclusion. The revealed key is for transcripts.
            return Ok(GreeterOutcome::Progress(None));
        }

        let mut gka_out: Option<GkaMessage> = None;
        if wire.ty.contains(TypeFlags::GKA) {
            let msg = GkaMessage {
                source: wire.source.clone(),
                dest: wire.dest.clone(),
                flow: if down { Flow::Down } else { Flow::Up },
                members: wire.members.clone(),
                int_keys: wire.int_keys.clone(),
            };
            if down {
                self.gka.downflow(&msg, !aux)?;
            } else {
                gka_out = Some(self.gka.upflow(&msg)?);
            }
        }

        let mut ske_out: Option<SkeMessage> = None;
        if wire.ty.contains(TypeFlags::SKE) {
            let msg = SkeMessage {
                source: wire.source.clone(),
                dest: wire.dest.clone(),
                flow: if down { Flow::Down } else { Flow::Up },
                members: wire.members.clone(),
                nonces: wire.nonces.clone(),
                pub_keys: wire.pub_keys.iter().copied().collect(),
                session_signature: wire.session_signature,
                signing_key: wire.signing_key,
            };
            if down {
                ske_out = self.ske.downflow(directory, &msg, !aux)?;
            } else {
                ske_out = Some(self.ske.upflow(&msg)?);
            }
        }

        let out = self.merge_outgoing(op, aux, down, gka_out, ske_out)?;

        if self.ske.is_session_acknowledged() {
            self.state = GreetState::Ready;
            if already_complete {
                return Ok(GreeterOutcome::Progress(out));
            }
            self.recovering = false;
            let result = self.latch_result()?;
            debug!(members = ?result.members, "greeting complete");
            return Ok(GreeterOutcome::Completed { out, result });
        }
        Ok(GreeterOutcome::Progress(out))
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn flags(&self, base: TypeFlags) -> TypeFlags {
        if self.recovering {
            base | TypeFlags::RECOVER
        } else {
            base
        }
    }

    fn check_ready(&self, what: &str) -> Result<(), SessionError> {
        if self.state != GreetState::Ready {
            return Err(SessionError::IllegalTransition(format!(
                "{what} from {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn check_transition(&self, op: Operation, down: bool, aux: bool) -> Result<(), SessionError> {
        use GreetState::*;
        let ok = match (op, down) {
            (Operation::Data, _) => false,
            (Operation::Start, false) => !aux && self.state == Null,
            (Operation::Start, true) => {
                // Ready admits the confirmation tail of the own operation.
                !aux && matches!(self.state, InitUpflow | InitDownflow | Ready)
            }
            (Operation::Join, false) => aux && matches!(self.state, Null | Ready),
            (Operation::Join, true) => {
                aux && matches!(self.state, Ready | AuxUpflow | AuxDownflow)
            }
            (Operation::Exclude | Operation::Refresh, true) => {
                aux && matches!(self.state, Ready | AuxDownflow)
            }
            (Operation::Exclude | Operation::Refresh, false) => false,
            (Operation::Quit, _) => true,
        };
        if ok {
            Ok(())
        } else {
            Err(SessionError::IllegalTransition(format!(
                "{op:?} {} in {:?}",
                if down { "downflow" } else { "upflow" },
                self.state
            )))
        }
    }

    /// Locate the sender's ephemeral key and check the packet signature.
    fn verify_packet(&self, decoded: &DecodedGreeting) -> Result<(), SessionError> {
        let wire = &decoded.wire;
        let from_packet = wire
            .members
            .iter()
            .position(|m| m == &wire.source)
            .and_then(|i| wire.pub_keys.get(i).copied());
        let pub_key = from_packet
            .or_else(|| self.ske.pub_key_of(&wire.source))
            .ok_or_else(|| {
                SessionError::IllegalTransition(format!(
                    "no ephemeral key known for {}",
                    wire.source
                ))
            })?;
        greeting::verify_greeting(&pub_key, &decoded.content, &decoded.signature)
            .map_err(SessionError::from)
    }

    fn merge_outgoing(
        &mut self,
        op: Operation,
        aux: bool,
        incoming_down: bool,
        gka_out: Option<GkaMessage>,
        ske_out: Option<SkeMessage>,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        if gka_out.is_none() && ske_out.is_none() {
            if incoming_down {
                self.state = if aux { GreetState::AuxDownflow } else { GreetState::InitDownflow };
            }
            return Ok(None);
        }

        // An upflow that ends the chain comes back from the key agreement
        // as a broadcast: promote the whole packet to downflow.
        let down = incoming_down
            || matches!(gka_out.as_ref().map(|g| g.flow), Some(Flow::Down))
            || matches!(ske_out.as_ref().map(|s| s.flow), Some(Flow::Down));

        let mut flags = if down { TypeFlags::DOWN } else { TypeFlags::empty() };
        if aux {
            flags |= TypeFlags::AUX;
        }
        if gka_out.is_some() {
            flags |= TypeFlags::GKA;
        }
        if ske_out.is_some() {
            flags |= TypeFlags::SKE;
        }
        let ty = MessageType::greeting(op, self.flags(flags));

        self.state = match (aux, down) {
            (false, false) => GreetState::InitUpflow,
            (false, true) => GreetState::InitDownflow,
            (true, false) => GreetState::AuxUpflow,
            (true, true) => GreetState::AuxDownflow,
        };

        self.encode(ty, gka_out, ske_out, false).map(Some)
    }

    /// Build, sign and serialise one outgoing packet.
    fn encode(
        &self,
        ty: MessageType,
        gka: Option<GkaMessage>,
        ske: Option<SkeMessage>,
        initial: bool,
    ) -> Result<Vec<u8>, SessionError> {
        let dest = gka
            .as_ref()
            .map(|g| g.dest.clone())
            .or_else(|| ske.as_ref().map(|s| s.dest.clone()))
            .unwrap_or_default();
        let members = gka
            .as_ref()
            .map(|g| g.members.clone())
            .or_else(|| ske.as_ref().map(|s| s.members.clone()))
            .unwrap_or_default();

        let wire = GreetingWire {
            source: self.id.clone(),
            dest,
            ty,
            members,
            int_keys: gka.map(|g| g.int_keys).unwrap_or_default(),
            nonces: ske.as_ref().map(|s| s.nonces.clone()).unwrap_or_default(),
            pub_keys: ske.as_ref().map(|s| s.pub_keys.clone()).unwrap_or_default(),
            session_signature: ske.as_ref().and_then(|s| s.session_signature),
            signing_key: ske.as_ref().and_then(|s| s.signing_key),
            metadata: if initial { self.metadata.clone() } else { None },
            prev_pi: if initial { None } else { self.op_pi },
        };

        let signer = self
            .ske
            .ephemeral_keys()
            .ok_or(SessionError::NotJoined)?;
        wire.encode_signed(signer).map_err(SessionError::from)
    }

    fn latch_result(&self) -> Result<GreetingResult, SessionError> {
        Ok(GreetingResult {
            sid: *self
                .ske
                .session_id()
                .ok_or_else(|| SessionError::IllegalTransition("complete without sid".into()))?,
            members: self.ske.members().to_vec(),
            pub_keys: self.ske.pub_keys().map(|(m, k)| (m.to_string(), k)).collect(),
            group_key: *self
                .gka
                .group_key()
                .ok_or_else(|| SessionError::IllegalTransition("complete without group key".into()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ske::InMemoryDirectory;
    use std::collections::HashMap;

    fn metadata() -> GreetingMetadata {
        GreetingMetadata { prev_pf: [0u8; 32], prev_ch: Vec::new() }
    }

    struct Net {
        greeters: HashMap<String, Greeter>,
        directory: InMemoryDirectory,
    }

    impl Net {
        fn new(names: &[&str]) -> Self {
            let mut directory = InMemoryDirectory::new();
            let mut greeters = HashMap::new();
            for name in names {
                let statics = SigningKeyPair::generate();
                directory.insert(name, statics.public_bytes());
                greeters.insert(name.to_string(), Greeter::new(name, statics));
            }
            Self { greeters, directory }
        }

        /// Deliver `packet` to every greeter, the sender's echo included,
        /// until the queue drains. FIFO delivery models the channel's
        /// total order. Returns completions seen.
        fn run(&mut self, first: Vec<u8>, sender: &str) -> HashMap<String, GreetingResult> {
            let mut queue = std::collections::VecDeque::new();
            queue.push_back((sender.to_string(), first));
            let mut results = HashMap::new();
            while let Some((_from, packet)) = queue.pop_front() {
                let decoded = greeting::decode(&packet).unwrap();
                let mut names: Vec<String> = self.greeters.keys().cloned().collect();
                names.sort();
                for name in names {
                    let greeter = self.greeters.get_mut(&name).unwrap();
                    match greeter.process_incoming(&self.directory, &decoded).unwrap() {
                        GreeterOutcome::Progress(Some(out)) => queue.push_back((name.clone(), out)),
                        GreeterOutcome::Completed { out, result } => {
                            if let Some(out) = out {
                                queue.push_back((name.clone(), out));
                            }
                            results.insert(name.clone(), result);
                        }
                        GreeterOutcome::Progress(None)
                        | GreeterOutcome::Ignored(_)
                        | GreeterOutcome::DroppedOut => {}
                    }
                }
            }
            results
        }
    }

    #[test]
    fn five_party_initial_agreement_completes() {
        let names = ["1", "2", "3", "4", "5"];
        let mut net = Net::new(&names);
        let others: Vec<String> = names[1..].iter().map(|s| s.to_string()).collect();
        let first = net
            .greeters
            .get_mut("1")
            .unwrap()
            .start(&others, metadata())
            .unwrap();

        let results = net.run(first, "1");
        // Every member, the initiator included, completes exactly once.
        assert_eq!(results.len(), 5);

        let any = results.values().next().unwrap();
        for result in results.values() {
            assert_eq!(result.sid, any.sid);
            assert_eq!(result.group_key, any.group_key);
            assert_eq!(result.members.len(), 5);
        }
        for (name, greeter) in &net.greeters {
            if results.contains_key(name) {
                assert_eq!(greeter.state(), GreetState::Ready);
            }
        }
    }

    #[test]
    fn start_twice_is_illegal() {
        let mut net = Net::new(&["a", "b"]);
        let a = net.greeters.get_mut("a").unwrap();
        a.start(&["b".to_string()], metadata()).unwrap();
        assert!(matches!(
            a.start(&["b".to_string()], metadata()),
            Err(SessionError::IllegalTransition(_))
        ));
    }

    #[test]
    fn data_type_is_never_a_greeting() {
        let mut net = Net::new(&["a", "b"]);
        let b = net.greeters.get_mut("b").unwrap();
        assert!(matches!(
            b.check_transition(Operation::Data, false, false),
            Err(SessionError::IllegalTransition(_))
        ));
    }
}
