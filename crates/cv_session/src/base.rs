//! SessionBase: one cryptographic epoch of the conversation.
//!
//! A sub-session owns the transcript between two greetings. It packages
//! outgoing bodies into authenticated-encrypted data messages, trial-
//! decrypts inbound ciphertext against its known epochs, buffers what
//! cannot be placed yet (unknown epoch hint, missing parents), tracks
//! acknowledgements with per-message monitors, and runs the shutdown
//! handshake (`fin`).
//!
//! Messages — our own included — enter the transcript only when the
//! channel echoes them back, so every member sees one total order.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, warn};

use cv_crypto::sig::SigningKeyPair;
use cv_proto::data::{self, DecryptedData, EpochKeys, MessageBody, MsgId};
use cv_proto::framing;

use crate::channel::{ChannelSend, GroupChannel};
use crate::error::SessionError;
use crate::events::{EventContext, SessionEvent, SessionState};
use crate::greeter::GreetingResult;
use crate::timer::{TimerHandle, Timers};
use crate::transcript::{Message, Transcript};

/// Tunables, in ticks of the embedder's clock.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper estimate of one broadcast round-trip.
    pub broadcast_latency: u32,
    /// How long a message may sit un-acked before the monitor reacts.
    pub full_ack_interval: u32,
    /// Hard shutdown deadline, as a multiple of the broadcast latency.
    pub fin_timeout_ratio: u32,
    /// Settle delay after the fin is fully acked, same unit.
    pub fin_consistent_ratio: u32,
    /// Exponential padding unit for data messages; 0 disables padding.
    pub padding_size: usize,
    /// Bound on each trial buffer.
    pub trial_buffer_cap: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broadcast_latency: 16,
            full_ack_interval: 64,
            fin_timeout_ratio: 16,
            fin_consistent_ratio: 1,
            padding_size: 128,
            trial_buffer_cap: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BaseTimer {
    Undecryptable(u64),
    MissingParents(u64),
    AckMonitor(MsgId),
    FinTimeout,
    FinGrace,
}

/// What happened to one inbound packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRecv {
    /// Entered the transcript (possibly releasing buffered successors).
    Accepted { mid: MsgId, leave_intent: bool },
    /// Held back until its epoch or parents show up.
    Buffered,
    /// Already known, or not placeable; dropped without effect.
    Dropped,
}

struct PendingDecrypted {
    sender: String,
    decrypted: DecryptedData,
    timer: TimerHandle,
}

pub struct SessionBase {
    owner: String,
    members: BTreeSet<String>,
    /// `epochs[0]` is this session's own epoch; later entries are prior
    /// epochs kept for in-flight traffic.
    epochs: Vec<EpochKeys>,
    signer: SigningKeyPair,
    pub_keys: HashMap<String, [u8; 32]>,
    transcript: Transcript,
    state: SessionState,
    config: SessionConfig,
    timers: Timers<BaseTimer>,
    events: EventContext,

    undecryptable: HashMap<u64, (String, Vec<u8>, TimerHandle)>,
    waiting_parents: HashMap<u64, PendingDecrypted>,
    next_buffer_seq: u64,

    /// Accept tick per message.
    ctime: HashMap<MsgId, u64>,
    /// Fully-acked tick per message.
    ktime: HashMap<MsgId, u64>,
    ack_monitors: HashMap<MsgId, TimerHandle>,

    /// Own messages sent but not yet echoed: (mid, parents referenced).
    pending_sends: VecDeque<(MsgId, BTreeSet<MsgId>)>,

    fin_mid: Option<MsgId>,
}

impl SessionBase {
    pub fn new(
        owner: &str,
        result: &GreetingResult,
        signer: SigningKeyPair,
        config: SessionConfig,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            members: result.members.iter().cloned().collect(),
            epochs: vec![EpochKeys::new(result.sid, result.group_key)],
            signer,
            pub_keys: result.pub_keys.iter().cloned().collect(),
            transcript: Transcript::new(),
            state: SessionState::Joined,
            config,
            timers: Timers::new(),
            events: EventContext::new(),
            undecryptable: HashMap::new(),
            waiting_parents: HashMap::new(),
            next_buffer_seq: 0,
            ctime: HashMap::new(),
            ktime: HashMap::new(),
            ack_monitors: HashMap::new(),
            pending_sends: VecDeque::new(),
            fin_mid: None,
        }
    }

    /// Keep an older epoch decryptable for traffic still in flight.
    pub fn push_prior_epoch(&mut self, epoch: EpochKeys) {
        self.epochs.push(epoch);
    }

    /// This session's own epoch keys (for handing to a successor).
    pub fn own_epoch(&self) -> EpochKeys {
        self.epochs[0].clone()
    }

    pub fn sid(&self) -> [u8; 32] {
        self.epochs[0].sid
    }

    /// Is `hint` the hint byte of one of this session's epochs?
    pub fn covers_hint(&self, hint: u8) -> bool {
        self.epochs.iter().any(|e| e.hint() == hint)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }

    pub fn events(&self) -> &EventContext {
        &self.events
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn is_consistent(&self) -> bool {
        self.transcript.is_consistent()
    }

    /// Ciphertexts we could not decrypt, surrendered to a successor.
    pub fn drain_undecryptable(&mut self) -> Vec<(String, Vec<u8>)> {
        let mut out: Vec<(u64, String, Vec<u8>)> = Vec::new();
        for (seq, (sender, packet, timer)) in self.undecryptable.drain() {
            self.timers.cancel(timer);
            out.push((seq, sender, packet));
        }
        out.sort_by_key(|(seq, _, _)| *seq);
        out.into_iter().map(|(_, s, p)| (s, p)).collect()
    }

    // ── Sending ──────────────────────────────────────────────────────────

    pub fn send_payload(
        &mut self,
        channel: &mut dyn GroupChannel,
        text: &str,
    ) -> Result<MsgId, SessionError> {
        if self.state != SessionState::Joined {
            return Err(SessionError::NotJoined);
        }
        self.send_body(channel, MessageBody::Payload(text.to_string()))
    }

    pub fn send_ack(
        &mut self,
        channel: &mut dyn GroupChannel,
        manual: bool,
    ) -> Result<MsgId, SessionError> {
        self.send_body(channel, MessageBody::ExplicitAck { manual })
    }

    /// Send a consistency probe; `close: true` announces shutdown intent.
    pub fn send_consistency(
        &mut self,
        channel: &mut dyn GroupChannel,
        close: bool,
    ) -> Result<MsgId, SessionError> {
        self.send_body(channel, MessageBody::Consistency { close })
    }

    /// Begin shutdown: a close-consistency message, then either settle
    /// (fully acked, consistent) or time out.
    pub fn fin(&mut self, channel: &mut dyn GroupChannel) -> Result<(), SessionError> {
        if self.state != SessionState::Joined {
            return Ok(());
        }
        let mid = self.send_body(channel, MessageBody::Consistency { close: true })?;
        self.fin_mid = Some(mid);
        self.set_state(SessionState::Parting);
        self.timers.after(
            self.config.fin_timeout_ratio * self.config.broadcast_latency,
            BaseTimer::FinTimeout,
        );
        Ok(())
    }

    /// Release resources: cancel monitors, drop subscriptions, wipe keys.
    pub fn stop(&mut self) {
        self.timers.clear();
        self.ack_monitors.clear();
        self.undecryptable.clear();
        self.waiting_parents.clear();
        self.events.cancel_all();
        // EpochKeys zeroize on drop.
        self.epochs.truncate(1);
    }

    fn send_body(
        &mut self,
        channel: &mut dyn GroupChannel,
        body: MessageBody,
    ) -> Result<MsgId, SessionError> {
        if !matches!(self.state, SessionState::Joined | SessionState::Parting) {
            return Err(SessionError::NotJoined);
        }
        let parents = self.next_parents();
        let parent_list: Vec<MsgId> = parents.iter().copied().collect();
        let (packet, mid) = data::auth_encrypt(
            &self.epochs[0],
            &self.signer,
            &parent_list,
            &body,
            self.config.padding_size,
        )?;
        channel.send(ChannelSend::Packet {
            pubtxt: framing::frame_protocol(&packet),
            recipients: BTreeSet::new(),
        });
        self.pending_sends.push_back((mid, parents));
        debug!(mid = %mid, "data message published");
        Ok(mid)
    }

    /// Parents for the next outgoing message: the transcript heads not
    /// already covered by sends awaiting their echo, plus the latest such
    /// send (which keeps our own messages totally ordered).
    fn next_parents(&self) -> BTreeSet<MsgId> {
        let covered: BTreeSet<MsgId> = self
            .pending_sends
            .iter()
            .flat_map(|(_, parents)| parents.iter().copied())
            .collect();
        let mut parents: BTreeSet<MsgId> = self
            .transcript
            .heads()
            .difference(&covered)
            .copied()
            .collect();
        if let Some((last, _)) = self.pending_sends.back() {
            parents.insert(*last);
        }
        parents
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Feed one unframed data packet from the channel (echoes included).
    pub fn recv_packet(&mut self, sender: &str, packet: &[u8]) -> Result<BaseRecv, SessionError> {
        let Some(pub_key) = self.pub_keys.get(sender).copied() else {
            warn!(sender, "data packet from unknown member dropped");
            return Ok(BaseRecv::Dropped);
        };
        match data::decrypt_verify(packet, &pub_key, &self.epochs) {
            Ok(Some(decrypted)) => self.place(sender, decrypted),
            Ok(None) => {
                // Possibly a future epoch still being negotiated; park it.
                self.buffer_undecryptable(sender, packet.to_vec());
                Ok(BaseRecv::Buffered)
            }
            Err(err) => {
                warn!(sender, %err, "data packet dropped");
                Ok(BaseRecv::Dropped)
            }
        }
    }

    /// Advance time; dispatch every timer that came due.
    pub fn tick(&mut self, channel: &mut dyn GroupChannel, ticks: u32) {
        for key in self.timers.advance(ticks) {
            match key {
                BaseTimer::Undecryptable(seq) => {
                    if let Some((sender, packet, _)) = self.undecryptable.remove(&seq) {
                        self.events.publish(SessionEvent::NotDecrypted {
                            sid: self.sid(),
                            sender,
                            size: packet.len(),
                        });
                    }
                }
                BaseTimer::MissingParents(seq) => {
                    if let Some(pending) = self.waiting_parents.remove(&seq) {
                        self.events.publish(SessionEvent::NotAccepted {
                            author: pending.sender,
                            parents: pending.decrypted.parents.iter().copied().collect(),
                        });
                    }
                }
                BaseTimer::AckMonitor(mid) => {
                    self.ack_monitors.remove(&mid);
                    self.on_ack_monitor(channel, mid);
                }
                BaseTimer::FinTimeout => self.finish_fin(),
                BaseTimer::FinGrace => self.finish_fin(),
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn place(&mut self, sender: &str, decrypted: DecryptedData) -> Result<BaseRecv, SessionError> {
        if self.transcript.contains(&decrypted.mid) {
            return Ok(BaseRecv::Dropped);
        }
        if !decrypted.parents.iter().all(|p| self.transcript.contains(p)) {
            self.buffer_waiting(sender, decrypted);
            return Ok(BaseRecv::Buffered);
        }
        let outcome = self.accept(sender, decrypted)?;
        self.release_waiting();
        Ok(outcome)
    }

    fn accept(&mut self, sender: &str, decrypted: DecryptedData) -> Result<BaseRecv, SessionError> {
        let mid = decrypted.mid;
        let mut recipients = self.members.clone();
        recipients.remove(sender);
        let message = Message {
            mid,
            author: sender.to_string(),
            parents: decrypted.parents.iter().copied().collect(),
            recipients,
            body: decrypted.body.clone(),
        };
        let leave_intent = self.transcript.is_leave_intent(&message);
        let needs_monitor = message.body.needs_ack();

        let newly_acked = match self.transcript.add(message) {
            Ok(acked) => acked,
            Err(err) => {
                warn!(sender, %err, "message violates transcript invariants; dropped");
                return Ok(BaseRecv::Dropped);
            }
        };

        if sender == self.owner {
            if let Some((front, _)) = self.pending_sends.front() {
                if *front == mid {
                    self.pending_sends.pop_front();
                }
            }
        }

        self.ctime.insert(mid, self.timers.now());
        if needs_monitor {
            let handle = self
                .timers
                .after(self.config.full_ack_interval, BaseTimer::AckMonitor(mid));
            self.ack_monitors.insert(mid, handle);
        } else {
            self.ktime.insert(mid, self.timers.now());
        }

        self.events.publish(SessionEvent::MsgAccepted { mid });
        for acked in newly_acked {
            self.on_fully_acked(acked);
        }
        Ok(BaseRecv::Accepted { mid, leave_intent })
    }

    /// Re-place buffered messages whose parents may have arrived.
    fn release_waiting(&mut self) {
        loop {
            let ready: Vec<u64> = self
                .waiting_parents
                .iter()
                .filter(|(_, p)| {
                    p.decrypted
                        .parents
                        .iter()
                        .all(|parent| self.transcript.contains(parent))
                })
                .map(|(seq, _)| *seq)
                .collect();
            if ready.is_empty() {
                return;
            }
            for seq in ready {
                let PendingDecrypted { sender, decrypted, timer } =
                    self.waiting_parents.remove(&seq).expect("listed above");
                self.timers.cancel(timer);
                let _ = self.accept(&sender, decrypted);
            }
        }
    }

    fn on_fully_acked(&mut self, mid: MsgId) {
        self.ktime.insert(mid, self.timers.now());
        if let Some(handle) = self.ack_monitors.remove(&mid) {
            self.timers.cancel(handle);
        }
        self.events.publish(SessionEvent::MsgFullyAcked { mid });
        if self.fin_mid == Some(mid) {
            // The fin is globally acknowledged; settle after a grace lap.
            self.timers.after(
                self.config.fin_consistent_ratio * self.config.broadcast_latency,
                BaseTimer::FinGrace,
            );
        }
    }

    fn on_ack_monitor(&mut self, channel: &mut dyn GroupChannel, mid: MsgId) {
        let Some(unacked) = self.transcript.unackby(&mid) else {
            return;
        };
        if unacked.is_empty() {
            return;
        }
        let self_pending = unacked.contains(&self.owner);
        let others_pending = unacked.iter().any(|m| m != &self.owner);
        if self_pending {
            // Bring ourselves to consistency; descending from the heads
            // acknowledges this message and everything before it.
            if let Err(err) = self.send_ack(channel, false) {
                warn!(%err, "auto-ack failed");
            }
        }
        if others_pending {
            self.events.publish(SessionEvent::NotFullyAcked { mid });
        }
    }

    fn buffer_undecryptable(&mut self, sender: &str, packet: Vec<u8>) {
        if self.undecryptable.len() >= self.config.trial_buffer_cap {
            // FIFO eviction: oldest entry is the least likely to resolve.
            if let Some(seq) = self.undecryptable.keys().min().copied() {
                if let Some((sender, packet, timer)) = self.undecryptable.remove(&seq) {
                    self.timers.cancel(timer);
                    self.events.publish(SessionEvent::NotDecrypted {
                        sid: self.sid(),
                        sender,
                        size: packet.len(),
                    });
                }
            }
        }
        let seq = self.next_buffer_seq;
        self.next_buffer_seq += 1;
        let timer = self
            .timers
            .after(self.config.broadcast_latency, BaseTimer::Undecryptable(seq));
        self.undecryptable.insert(seq, (sender.to_string(), packet, timer));
    }

    fn buffer_waiting(&mut self, sender: &str, decrypted: DecryptedData) {
        if self.waiting_parents.len() >= self.config.trial_buffer_cap {
            if let Some(seq) = self.waiting_parents.keys().min().copied() {
                if let Some(pending) = self.waiting_parents.remove(&seq) {
                    self.timers.cancel(pending.timer);
                    self.events.publish(SessionEvent::NotAccepted {
                        author: pending.sender,
                        parents: pending.decrypted.parents.iter().copied().collect(),
                    });
                }
            }
        }
        let seq = self.next_buffer_seq;
        self.next_buffer_seq += 1;
        let timer = self
            .timers
            .after(self.config.broadcast_latency, BaseTimer::MissingParents(seq));
        self.waiting_parents.insert(
            seq,
            PendingDecrypted { sender: sender.to_string(), decrypted, timer },
        );
    }

    fn finish_fin(&mut self) {
        if !matches!(self.state, SessionState::Parting) {
            return;
        }
        let fin_acked = self
            .fin_mid
            .map(|mid| self.ktime.contains_key(&mid))
            .unwrap_or(false);
        let consistent = fin_acked && self.is_consistent();
        self.timers.clear();
        self.ack_monitors.clear();
        if consistent {
            self.set_state(SessionState::Parted);
        } else {
            self.set_state(SessionState::PartFailed);
        }
    }

    fn set_state(&mut self, new: SessionState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        debug!(?old, ?new, "session state change");
        self.events.publish(SessionEvent::SNStateChange { new, old });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelRecv, LoopbackHub};
    use std::cell::RefCell;
    use std::rc::Rc;

    const LATENCY: u32 = 16;

    fn make_result(names: &[&str]) -> (GreetingResult, HashMap<String, SigningKeyPair>) {
        let mut signers = HashMap::new();
        let mut pub_keys = Vec::new();
        for name in names {
            let kp = SigningKeyPair::generate();
            pub_keys.push((name.to_string(), kp.public_bytes()));
            signers.insert(name.to_string(), kp);
        }
        let result = GreetingResult {
            sid: [3u8; 32],
            members: names.iter().map(|s| s.to_string()).collect(),
            pub_keys,
            group_key: [9u8; 32],
        };
        (result, signers)
    }

    struct Net {
        hub: LoopbackHub,
        sessions: HashMap<String, SessionBase>,
    }

    impl Net {
        fn new(names: &[&str]) -> Self {
            let (result, mut signers) = make_result(names);
            let mut hub = LoopbackHub::new();
            let mut sessions = HashMap::new();
            for name in names {
                hub.handle(name).send(ChannelSend::EnterSelf);
                sessions.insert(
                    name.to_string(),
                    SessionBase::new(
                        name,
                        &result,
                        signers.remove(*name).unwrap(),
                        SessionConfig {
                            broadcast_latency: LATENCY,
                            full_ack_interval: 4 * LATENCY,
                            ..SessionConfig::default()
                        },
                    ),
                );
            }
            hub.take_deliveries();
            Self { hub, sessions }
        }

        /// Deliver queued packets until quiescent.
        fn pump(&mut self) {
            while !self.hub.is_idle() {
                for (to, recv) in self.hub.take_deliveries() {
                    if let ChannelRecv::Packet { pubtxt, sender } = recv {
                        let body = match cv_proto::framing::classify(&pubtxt).unwrap() {
                            cv_proto::framing::Classified::Protocol(body) => body,
                            other => panic!("unexpected frame {other:?}"),
                        };
                        let session = self.sessions.get_mut(&to).unwrap();
                        session.recv_packet(&sender, &body).unwrap();
                    }
                }
            }
        }

        fn tick_all(&mut self, ticks: u32) {
            let names: Vec<String> = self.sessions.keys().cloned().collect();
            for name in names {
                let mut channel = self.hub.handle(&name);
                self.sessions.get_mut(&name).unwrap().tick(&mut channel, ticks);
            }
        }
    }

    #[test]
    fn payload_roundtrip_and_acks() {
        let mut net = Net::new(&["a", "b", "c"]);

        let mid = {
            let session = net.sessions.get_mut("a").unwrap();
            let mut channel = net.hub.handle("a");
            session.send_payload(&mut channel, "hello").unwrap()
        };
        net.pump();
        for name in ["a", "b", "c"] {
            assert!(net.sessions[name].transcript().contains(&mid), "{name} missing message");
        }

        // b and c reply; their messages acknowledge a's.
        for name in ["b", "c"] {
            let session = net.sessions.get_mut(name).unwrap();
            let mut channel = net.hub.handle(name);
            session.send_ack(&mut channel, true).unwrap();
        }
        net.pump();
        for name in ["a", "b", "c"] {
            assert!(
                net.sessions[name].transcript().unackby(&mid).unwrap().is_empty(),
                "{name} still waiting"
            );
            assert!(net.sessions[name].is_consistent());
        }
    }

    #[test]
    fn own_messages_stay_ordered_without_echo() {
        let mut net = Net::new(&["a", "b"]);
        // Two sends before any echo: the second must name the first as
        // parent, or b would reject a's order.
        {
            let session = net.sessions.get_mut("a").unwrap();
            let mut channel = net.hub.handle("a");
            session.send_payload(&mut channel, "one").unwrap();
            session.send_payload(&mut channel, "two").unwrap();
        }
        net.pump();
        assert_eq!(net.sessions["b"].transcript().len(), 2);
        assert_eq!(net.sessions["a"].transcript().len(), 2);
    }

    #[test]
    fn auto_ack_brings_consistency() {
        let mut net = Net::new(&["a", "b"]);
        {
            let session = net.sessions.get_mut("a").unwrap();
            let mut channel = net.hub.handle("a");
            session.send_payload(&mut channel, "ping").unwrap();
        }
        net.pump();
        // b never explicitly acks; its monitor fires an automatic one.
        net.tick_all(4 * LATENCY);
        net.pump();
        for name in ["a", "b"] {
            assert!(net.sessions[name].is_consistent(), "{name} inconsistent");
        }
    }

    #[test]
    fn fin_settles_when_acked() {
        let mut net = Net::new(&["a", "b"]);
        {
            let session = net.sessions.get_mut("a").unwrap();
            let mut channel = net.hub.handle("a");
            session.fin(&mut channel).unwrap();
        }
        assert_eq!(net.sessions["a"].state(), SessionState::Parting);
        net.pump();
        // b acks the fin (its monitor would; be prompt instead).
        {
            let session = net.sessions.get_mut("b").unwrap();
            let mut channel = net.hub.handle("b");
            session.send_ack(&mut channel, true).unwrap();
        }
        net.pump();
        net.tick_all(LATENCY);
        assert_eq!(net.sessions["a"].state(), SessionState::Parted);
    }

    #[test]
    fn fin_times_out_to_part_failed() {
        let mut net = Net::new(&["50", "51", "52"]);
        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let session = net.sessions.get_mut("50").unwrap();
            let sink = events.clone();
            session.events().subscribe(move |ev| sink.borrow_mut().push(ev.clone()));
            let mut channel = net.hub.handle("50");
            session.send_payload(&mut channel, "x").unwrap();
            session.fin(&mut channel).unwrap();
        }
        net.pump();
        // 51 and 52 never ack anything.
        net.tick_all(16 * LATENCY);
        assert_eq!(net.sessions["50"].state(), SessionState::PartFailed);
        assert!(events.borrow().iter().any(|ev| matches!(
            ev,
            SessionEvent::SNStateChange { new: SessionState::PartFailed, .. }
        )));
    }

    #[test]
    fn out_of_order_parents_are_buffered() {
        let mut net = Net::new(&["a", "b"]);
        let (first, second) = {
            let session = net.sessions.get_mut("a").unwrap();
            let mut channel = net.hub.handle("a");
            let first = session.send_payload(&mut channel, "first").unwrap();
            let second = session.send_payload(&mut channel, "second").unwrap();
            (first, second)
        };

        // Deliver to b in reverse order, bypassing the hub.
        let deliveries = net.hub.take_deliveries();
        let mut packets = Vec::new();
        for (to, recv) in deliveries {
            if to != "b" {
                continue;
            }
            if let ChannelRecv::Packet { pubtxt, .. } = recv {
                match cv_proto::framing::classify(&pubtxt).unwrap() {
                    cv_proto::framing::Classified::Protocol(body) => packets.push(body),
                    _ => unreachable!(),
                }
            }
        }
        assert_eq!(packets.len(), 2);

        let session = net.sessions.get_mut("b").unwrap();
        let out = session.recv_packet("a", &packets[1]).unwrap();
        assert_eq!(out, BaseRecv::Buffered);
        let out = session.recv_packet("a", &packets[0]).unwrap();
        assert!(matches!(out, BaseRecv::Accepted { mid, .. } if mid == first));
        // The buffered successor was released.
        assert!(session.transcript().contains(&second));
    }

    #[test]
    fn unknown_epoch_hint_buffers_then_reports() {
        let mut net = Net::new(&["a", "b"]);
        let known_hint = net.sessions["b"].epochs[0].hint();
        // A packet from an epoch b does not know. Pick sid bytes until the
        // hint byte provably differs; identical hints would legitimately
        // trial-decrypt instead of parking.
        let (mut other_result, mut other_signers) = make_result(&["a", "b"]);
        for tag in 10u8.. {
            other_result.sid = [tag; 32];
            other_result.group_key = [tag.wrapping_add(1); 32];
            if EpochKeys::new(other_result.sid, other_result.group_key).hint() != known_hint {
                break;
            }
        }
        let mut foreign = SessionBase::new(
            "a",
            &other_result,
            other_signers.remove("a").unwrap(),
            SessionConfig::default(),
        );
        assert_ne!(foreign.epochs[0].hint(), known_hint);

        let mut channel = net.hub.handle("a");
        foreign.send_payload(&mut channel, "future").unwrap();
        let deliveries = net.hub.take_deliveries();
        let packet = deliveries
            .into_iter()
            .find_map(|(to, recv)| match (to.as_str(), recv) {
                ("b", ChannelRecv::Packet { pubtxt, .. }) => {
                    match cv_proto::framing::classify(&pubtxt).unwrap() {
                        cv_proto::framing::Classified::Protocol(body) => Some(body),
                        _ => None,
                    }
                }
                _ => None,
            })
            .unwrap();

        let events = Rc::new(RefCell::new(Vec::new()));
        {
            let session = net.sessions.get_mut("b").unwrap();
            let sink = events.clone();
            session.events().subscribe(move |ev| sink.borrow_mut().push(ev.clone()));
            // The foreign signer differs from a's registered key, but the
            // hint gate trips first: unknown epoch, so it parks.
            let out = session.recv_packet("a", &packet).unwrap();
            assert_eq!(out, BaseRecv::Buffered);
        }
        net.tick_all(LATENCY);
        // The report names the sub-session whose buffer gave up.
        let expected_sid = net.sessions["b"].sid();
        assert!(events.borrow().iter().any(|ev| matches!(
            ev,
            SessionEvent::NotDecrypted { sid, sender, .. }
                if sender == "a" && *sid == expected_sid
        )));
    }
}
