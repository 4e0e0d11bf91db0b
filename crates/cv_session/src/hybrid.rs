//! HybridSession: the outer state machine.
//!
//! One HybridSession per conversation. It watches the channel (membership
//! notices and packets), gates greeting packets through `ServerOrder`,
//! rotates sub-sessions when a greeting completes, and routes data packets
//! into the right sub-session by epoch hint.
//!
//! Four independent conditions describe where we are: in the channel or
//! not (`C`/`c`), order synced or not (`O`/`o`), a sub-session present or
//! not (`S`/`s`), just-synced or not (`J`/`j`). The reachable combinations
//! are `cos_`, `Cos_`, `COsJ`, `COsj` and `COS_`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::{debug, warn};

use cv_crypto::sig::SigningKeyPair;
use cv_proto::framing::{self, Classified};
use cv_proto::greeting::{self, GreetingMetadata, Operation};
use cv_proto::{data, ProtoError};

use crate::base::{BaseRecv, SessionBase, SessionConfig};
use crate::channel::{ChannelRecv, ChannelSend, GroupChannel};
use crate::error::SessionError;
use crate::events::{EventContext, SessionEvent, SessionState};
use crate::greeter::{GreetState, Greeter, GreeterOutcome, GreetingResult};
use crate::order::ServerOrder;
use crate::ske::KeyDirectory;

/// What the application can ask of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send an application payload.
    Send { contents: String },
    /// Change membership: invite and/or remove members.
    Change {
        include: BTreeSet<String>,
        exclude: BTreeSet<String>,
    },
    /// Rotate the group key without changing membership.
    Refresh,
    /// Enter the channel and wait for (or bootstrap) a session.
    Join,
    /// Wind the session down and leave the channel.
    Part,
}

/// Resolution state of one submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpStatus {
    Pending,
    Done,
    Failed(String),
}

/// One-shot handle the caller can poll; resolves when the matching
/// membership change (or part) lands.
#[derive(Debug, Clone)]
pub struct OpHandle(Rc<RefCell<OpStatus>>);

impl OpHandle {
    fn pending() -> Self {
        Self(Rc::new(RefCell::new(OpStatus::Pending)))
    }

    fn done() -> Self {
        Self(Rc::new(RefCell::new(OpStatus::Done)))
    }

    pub fn status(&self) -> OpStatus {
        self.0.borrow().clone()
    }

    fn resolve(&self) {
        *self.0.borrow_mut() = OpStatus::Done;
    }

    fn fail(&self, why: &str) {
        *self.0.borrow_mut() = OpStatus::Failed(why.to_string());
    }
}

struct OwnOp {
    action: Action,
    handle: OpHandle,
    /// Members invited to the channel whose entry we still await before
    /// the greeting can start.
    awaiting_entry: BTreeSet<String>,
}

pub struct HybridSession {
    id: String,
    static_keys: SigningKeyPair,
    directory: Rc<dyn KeyDirectory>,
    config: SessionConfig,
    events: EventContext,

    in_channel: bool,
    channel_members: BTreeSet<String>,
    channel_just_synced: bool,

    order: ServerOrder,
    /// The session-carrying greeter (READY between operations).
    greeter: Option<Greeter>,
    /// Rollback point: greeter state at the last READY.
    stable_greeter: Option<Greeter>,
    /// Our not-yet-accepted proposal, already holding the op's key state.
    proposal: Option<Greeter>,

    curr: Option<SessionBase>,
    prev: Option<SessionBase>,

    task_exclude: BTreeSet<String>,
    task_leave: BTreeSet<String>,

    own_op: Option<OwnOp>,
    part_pending: bool,
    dropped_inconsistent_session: bool,
}

impl HybridSession {
    pub fn new(
        id: &str,
        static_keys: SigningKeyPair,
        directory: Rc<dyn KeyDirectory>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id: id.to_string(),
            static_keys,
            directory,
            config,
            events: EventContext::new(),
            in_channel: false,
            channel_members: BTreeSet::new(),
            channel_just_synced: false,
            order: ServerOrder::new(),
            greeter: None,
            stable_greeter: None,
            proposal: None,
            curr: None,
            prev: None,
            task_exclude: BTreeSet::new(),
            task_leave: BTreeSet::new(),
            own_op: None,
            part_pending: false,
            dropped_inconsistent_session: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Membership/lifecycle events of the conversation as a whole.
    pub fn events(&self) -> &EventContext {
        &self.events
    }

    pub fn current_session(&self) -> Option<&SessionBase> {
        self.curr.as_ref()
    }

    /// The retiring sub-session, still settling its consistency.
    pub fn previous_session(&self) -> Option<&SessionBase> {
        self.prev.as_ref()
    }

    pub fn dropped_inconsistent_session(&self) -> bool {
        self.dropped_inconsistent_session
    }

    /// The four condition letters, for diagnostics.
    pub fn phase(&self) -> String {
        format!(
            "{}{}{}{}",
            if self.in_channel { 'C' } else { 'c' },
            if self.order.is_synced() { 'O' } else { 'o' },
            if self.curr.is_some() { 'S' } else { 's' },
            if self.curr.is_some() {
                '_'
            } else if self.channel_just_synced {
                'J'
            } else {
                'j'
            },
        )
    }

    // ── Send pipeline ────────────────────────────────────────────────────

    pub fn execute(
        &mut self,
        channel: &mut dyn GroupChannel,
        action: Action,
    ) -> Result<OpHandle, SessionError> {
        match action {
            Action::Send { ref contents } => {
                let session = self.curr.as_mut().ok_or(SessionError::NotJoined)?;
                session.send_payload(channel, contents)?;
                Ok(OpHandle::done())
            }
            Action::Change { ref include, ref exclude } => {
                self.check_inclusion_allowed(include)?;
                if let Some(own) = &self.own_op {
                    if own.action == action {
                        return Ok(own.handle.clone());
                    }
                    return Err(SessionError::OperationInProgress);
                }
                let handle = OpHandle::pending();
                let awaiting: BTreeSet<String> = include
                    .iter()
                    .filter(|m| !self.channel_members.contains(*m))
                    .cloned()
                    .collect();
                if !awaiting.is_empty() {
                    channel.send(ChannelSend::Invite { members: include.clone() });
                }
                self.own_op = Some(OwnOp {
                    action: action.clone(),
                    handle: handle.clone(),
                    awaiting_entry: awaiting.clone(),
                });
                if awaiting.is_empty() {
                    self.start_own_change(channel)?;
                }
                Ok(handle)
            }
            Action::Refresh => {
                if self.curr.is_none() {
                    return Err(SessionError::NotJoined);
                }
                if let Some(own) = &self.own_op {
                    if own.action == Action::Refresh {
                        return Ok(own.handle.clone());
                    }
                    return Err(SessionError::OperationInProgress);
                }
                let metadata = self.make_metadata()?;
                let mut proposal = self
                    .greeter
                    .as_ref()
                    .cloned()
                    .ok_or(SessionError::NotJoined)?;
                let packet = proposal.refresh(metadata)?;
                self.proposal = Some(proposal);
                channel.send(ChannelSend::Packet {
                    pubtxt: framing::frame_protocol(&packet),
                    recipients: BTreeSet::new(),
                });
                let handle = OpHandle::pending();
                self.own_op = Some(OwnOp {
                    action: Action::Refresh,
                    handle: handle.clone(),
                    awaiting_entry: BTreeSet::new(),
                });
                Ok(handle)
            }
            Action::Join => {
                if let Some(own) = &self.own_op {
                    if own.action == Action::Join {
                        return Ok(own.handle.clone());
                    }
                    return Err(SessionError::OperationInProgress);
                }
                let handle = OpHandle::pending();
                self.own_op = Some(OwnOp {
                    action: Action::Join,
                    handle: handle.clone(),
                    awaiting_entry: BTreeSet::new(),
                });
                if !self.in_channel {
                    channel.send(ChannelSend::EnterSelf);
                }
                Ok(handle)
            }
            Action::Part => {
                if let Some(own) = &self.own_op {
                    if own.action == Action::Part {
                        return Ok(own.handle.clone());
                    }
                    return Err(SessionError::OperationInProgress);
                }
                let handle = OpHandle::pending();
                self.own_op = Some(OwnOp {
                    action: Action::Part,
                    handle: handle.clone(),
                    awaiting_entry: BTreeSet::new(),
                });
                self.part_pending = true;
                match self.curr.as_mut() {
                    Some(session) => {
                        // Leave-intent: two consecutive close-fins, the
                        // second chaining straight off the first.
                        session.send_consistency(channel, true)?;
                        session.fin(channel)?;
                    }
                    None => self.leave_channel(channel),
                }
                Ok(handle)
            }
        }
    }

    /// Advance time in the sub-sessions; settle pending part/rotation work.
    pub fn tick(&mut self, channel: &mut dyn GroupChannel, ticks: u32) {
        if let Some(curr) = self.curr.as_mut() {
            curr.tick(channel, ticks);
        }
        if let Some(prev) = self.prev.as_mut() {
            prev.tick(channel, ticks);
        }
        self.settle(channel);
    }

    // ── Recv pipeline ────────────────────────────────────────────────────

    pub fn recv(
        &mut self,
        channel: &mut dyn GroupChannel,
        input: ChannelRecv,
    ) -> Result<(), SessionError> {
        match input {
            ChannelRecv::Membership { enter, leave, members } => {
                self.on_membership(channel, enter, leave, members);
                Ok(())
            }
            ChannelRecv::Packet { pubtxt, sender } => self.on_packet(channel, &pubtxt, &sender),
        }
    }

    fn on_membership(
        &mut self,
        channel: &mut dyn GroupChannel,
        enter: BTreeSet<String>,
        leave: BTreeSet<String>,
        members: BTreeSet<String>,
    ) {
        if leave.contains(&self.id) {
            self.teardown();
            return;
        }
        if enter.contains(&self.id) {
            self.in_channel = true;
            self.channel_members = members;
            if self.channel_members.len() == 1 {
                // Alone in a fresh channel: the order starts with us, and
                // a pending join is as done as it can get — the session
                // itself comes with the first inclusion.
                self.order.sync_new();
                self.channel_just_synced = true;
                if let Some(own) = self.own_op.as_ref() {
                    if own.action == Action::Join {
                        own.handle.resolve();
                        self.own_op = None;
                    }
                }
            }
            debug!(phase = %self.phase(), "entered channel");
            return;
        }
        if !self.in_channel {
            return;
        }
        self.channel_members = members;

        for member in &leave {
            self.task_leave.remove(member);
            let in_session = self
                .curr
                .as_ref()
                .map(|s| s.members().contains(member))
                .unwrap_or(false);
            if in_session {
                self.add_task_exclude(member.clone());
            }
        }
        if !leave.is_empty() {
            // A leaver mid-greeting starves the operation; roll back.
            if self.order.has_ongoing_op() {
                let involved = self
                    .greeter
                    .as_ref()
                    .map(|g| leave.iter().any(|m| g.members().contains(m)))
                    .unwrap_or(false);
                if involved {
                    warn!("greeting participant left the channel; aborting operation");
                    self.abort_greeting();
                    // The next proposal is a recovery: peers must drop any
                    // confirmations collected for the starved operation.
                    if let Some(greeter) = self.greeter.as_mut() {
                        greeter.set_recovering(true);
                    }
                }
            }
        }

        // Invited members arriving unblocks our own pending change.
        let change_unblocked = match self.own_op.as_mut() {
            Some(own) => {
                own.awaiting_entry.retain(|m| !enter.contains(m));
                own.awaiting_entry.is_empty() && matches!(own.action, Action::Change { .. })
            }
            None => false,
        };
        if change_unblocked && !self.order.has_ongoing_op() && self.proposal.is_none() {
            if let Err(err) = self.start_own_change(channel) {
                warn!(%err, "deferred change failed to start");
                self.fail_own_op("change could not start");
            }
        }

        self.flush_tasks(channel);
    }

    fn on_packet(
        &mut self,
        channel: &mut dyn GroupChannel,
        pubtxt: &str,
        sender: &str,
    ) -> Result<(), SessionError> {
        let body = match framing::classify(pubtxt) {
            Ok(Classified::Protocol(body)) => body,
            Ok(Classified::Query(version)) => {
                debug!(sender, version, "query frame ignored");
                return Ok(());
            }
            Ok(Classified::Error(frame)) => {
                warn!(sender, from = %frame.from, text = %frame.text, "error frame received");
                return Ok(());
            }
            Ok(Classified::Plaintext(_)) => return Ok(()),
            Err(err) => {
                warn!(sender, %err, "unclassifiable frame dropped");
                return Ok(());
            }
        };

        if greeting::is_greeting_packet(&body) {
            return self.on_greeting(channel, pubtxt, sender, &body);
        }
        self.on_data(sender, &body)
    }

    fn on_data(&mut self, sender: &str, body: &[u8]) -> Result<(), SessionError> {
        let hint = data::peek_hint(body);
        let prev_covers = match (hint, self.prev.as_ref()) {
            (Some(h), Some(prev)) => prev.covers_hint(h),
            _ => false,
        };
        let target = if prev_covers {
            self.prev.as_mut()
        } else {
            self.curr.as_mut()
        };
        match target {
            Some(session) => {
                let outcome = session.recv_packet(sender, body)?;
                if let BaseRecv::Accepted { leave_intent: true, .. } = outcome {
                    self.add_task_leave(sender.to_string());
                }
                Ok(())
            }
            None => {
                // No sub-session holds any epoch to attribute the drop to.
                self.events.publish(SessionEvent::NotDecrypted {
                    sid: [0u8; 32],
                    sender: sender.to_string(),
                    size: body.len(),
                });
                Ok(())
            }
        }
    }

    fn on_greeting(
        &mut self,
        channel: &mut dyn GroupChannel,
        pubtxt: &str,
        sender: &str,
        body: &[u8],
    ) -> Result<(), SessionError> {
        let decoded = match greeting::decode(body) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(sender, %err, "undecodable greeting dropped");
                return Ok(());
            }
        };
        if decoded.wire.source != sender {
            warn!(sender, claimed = %decoded.wire.source, "greeting source mismatch; dropped");
            return Ok(());
        }
        let pi = ServerOrder::make_packet_id(pubtxt.as_bytes(), sender, &self.channel_members);

        if let Some(metadata) = &decoded.wire.metadata {
            let includes_self = decoded.wire.members.iter().any(|m| m == &self.id);
            let started = self.order.try_op_start(
                pi,
                metadata.prev_pf,
                sender,
                &self.channel_members,
                &self.id,
                includes_self,
            );
            if let Err(reject) = started {
                if sender == self.id {
                    debug!(?reject, "our proposal lost the ordering race");
                    self.proposal = None;
                    self.fail_own_op("proposal rejected by channel order");
                } else {
                    debug!(sender, ?reject, "initial greeting packet rejected");
                }
                return Ok(());
            }
            self.channel_just_synced = false;
            if sender == self.id {
                // Our proposal won: its prepared state becomes current.
                if let Some(proposal) = self.proposal.take() {
                    if self.stable_greeter.is_none() {
                        self.stable_greeter = self.greeter.clone();
                    }
                    self.greeter = Some(proposal);
                }
            } else if self.greeter.is_none()
                || matches!(self.greeter.as_ref().map(|g| g.state()), Some(GreetState::Quit))
            {
                self.greeter = Some(Greeter::new(&self.id, self.static_keys.clone()));
            }
            if let Some(greeter) = self.greeter.as_mut() {
                greeter.set_op_packet_id(pi);
            }
        } else if !self.order.accepts_packet(decoded.wire.prev_pi) {
            debug!(sender, "greeting packet outside the ongoing operation; dropped");
            return Ok(());
        }

        let Some(greeter) = self.greeter.as_mut() else {
            warn!(sender, "greeting packet with no greeter; dropped");
            return Ok(());
        };

        match greeter.process_incoming(self.directory.as_ref(), &decoded) {
            Ok(GreeterOutcome::Ignored(why)) => {
                debug!(sender, why, "greeting packet ignored");
                Ok(())
            }
            Ok(GreeterOutcome::DroppedOut) => {
                // OperationIgnored: processed silently, we await the kick.
                Ok(())
            }
            Ok(GreeterOutcome::Progress(out)) => {
                if let Some(out) = out {
                    channel.send(ChannelSend::Packet {
                        pubtxt: framing::frame_protocol(&out),
                        recipients: BTreeSet::new(),
                    });
                }
                if decoded.wire.ty.operation() == Operation::Quit {
                    // A quit is a single-packet operation: it is its own
                    // final packet and frees the floor immediately.
                    self.order.complete_op(pi, &self.channel_members);
                    self.flush_tasks(channel);
                }
                Ok(())
            }
            Ok(GreeterOutcome::Completed { out, result }) => {
                if let Some(out) = out {
                    channel.send(ChannelSend::Packet {
                        pubtxt: framing::frame_protocol(&out),
                        recipients: BTreeSet::new(),
                    });
                }
                self.order.complete_op(pi, &self.channel_members);
                self.rotate(channel, result);
                Ok(())
            }
            Err(err) => {
                // Structural or authentication failure: the greeting dies,
                // the conversation survives. Surface the error upward and,
                // for authentication failures, onto the wire as well.
                warn!(sender, %err, "greeting aborted");
                if matches!(err, SessionError::AuthenticationFailure(_)) {
                    if let Some(signer) = self.greeter.as_ref().and_then(|g| g.ephemeral_keys()) {
                        let frame = framing::signed_error_frame(
                            signer,
                            &self.id,
                            framing::Severity::Terminal,
                            &err.to_string(),
                        );
                        channel.send(ChannelSend::Packet {
                            pubtxt: framing::frame_error(&frame),
                            recipients: BTreeSet::new(),
                        });
                    }
                }
                self.abort_greeting();
                Err(err)
            }
        }
    }

    // ── Rotation ─────────────────────────────────────────────────────────

    fn rotate(&mut self, channel: &mut dyn GroupChannel, result: GreetingResult) {
        let old_members: BTreeSet<String> = self
            .curr
            .as_ref()
            .map(|s| s.members().clone())
            .unwrap_or_default();
        let new_members: BTreeSet<String> = result.members.iter().cloned().collect();

        // Retire the previous sub-session for good.
        if let Some(mut gone) = self.prev.take() {
            gone.stop();
        }
        if let Some(mut old) = self.curr.take() {
            if !old.is_consistent() {
                self.dropped_inconsistent_session = true;
                warn!("rotating away from an inconsistent sub-session");
            }
            let _ = old.fin(channel);
            self.prev = Some(old);
        }

        let signer = self
            .greeter
            .as_ref()
            .and_then(|g| g.ephemeral_keys())
            .cloned()
            .expect("completed greeting has ephemeral keys");
        let mut session = SessionBase::new(&self.id, &result, signer, self.config.clone());
        if let Some(prev) = self.prev.as_mut() {
            session.push_prior_epoch(prev.own_epoch());
            for (sender, packet) in prev.drain_undecryptable() {
                let _ = session.recv_packet(&sender, &packet);
            }
        }
        self.curr = Some(session);
        self.channel_just_synced = false;
        self.stable_greeter = self.greeter.clone();

        let include: BTreeSet<String> = new_members.difference(&old_members).cloned().collect();
        let exclude: BTreeSet<String> = old_members.difference(&new_members).cloned().collect();
        let remain: BTreeSet<String> = old_members.intersection(&new_members).cloned().collect();
        // Whoever is no longer a session member has been cryptographically
        // excluded; only pending removals of current members stay queued.
        self.task_exclude.retain(|m| new_members.contains(m));

        // Members we excluded have now cryptographically seen their
        // exclusion; kick any that still sit in the channel.
        let to_kick: BTreeSet<String> = exclude
            .iter()
            .filter(|m| self.channel_members.contains(*m))
            .cloned()
            .collect();
        if !to_kick.is_empty() {
            channel.send(ChannelSend::Kick { members: to_kick });
        }

        debug!(phase = %self.phase(), members = ?new_members, "sub-session rotated");
        self.events.publish(SessionEvent::SNMembers {
            remain,
            include: include.clone(),
            exclude,
        });

        self.resolve_own_op(&new_members);
        self.flush_tasks(channel);
    }

    fn resolve_own_op(&mut self, new_members: &BTreeSet<String>) {
        let Some(own) = self.own_op.as_ref() else {
            return;
        };
        let satisfied = match &own.action {
            Action::Join => new_members.contains(&self.id),
            Action::Change { include, exclude } => {
                include.iter().all(|m| new_members.contains(m))
                    && exclude.iter().all(|m| !new_members.contains(m))
            }
            // A losing refresh proposal fails before any rotation lands,
            // so reaching a rotation at all means the key moved on.
            Action::Refresh => true,
            _ => false,
        };
        if satisfied {
            own.handle.resolve();
            self.own_op = None;
        }
    }

    // ── Own proposals ────────────────────────────────────────────────────

    fn start_own_change(&mut self, channel: &mut dyn GroupChannel) -> Result<(), SessionError> {
        let Some(OwnOp { action: Action::Change { include, exclude }, .. }) = self.own_op.as_ref()
        else {
            return Ok(());
        };
        let include: Vec<String> = include.iter().cloned().collect();
        let exclude: Vec<String> = exclude.iter().cloned().collect();

        let metadata = self.make_metadata()?;
        let mut proposal = match (&self.greeter, self.curr.is_some()) {
            (Some(greeter), true) => greeter.clone(),
            _ => Greeter::new(&self.id, self.static_keys.clone()),
        };
        let packet = if self.curr.is_none() {
            // No session yet: the whole change is an initial agreement.
            proposal.start(&include, metadata)?
        } else if !include.is_empty() {
            // Join first; queued exclusions run as a follow-up operation.
            for member in &exclude {
                self.add_task_exclude(member.clone());
            }
            proposal.join(&include, metadata)?
        } else {
            proposal.exclude(&exclude, metadata)?
        };
        self.proposal = Some(proposal);
        channel.send(ChannelSend::Packet {
            pubtxt: framing::frame_protocol(&packet),
            recipients: BTreeSet::new(),
        });
        Ok(())
    }

    /// Propose queued exclusions when the floor is free.
    fn flush_tasks(&mut self, channel: &mut dyn GroupChannel) {
        if self.order.has_ongoing_op() || self.proposal.is_some() || self.part_pending {
            return;
        }
        let Some(curr) = self.curr.as_ref() else {
            return;
        };
        let targets: Vec<String> = self
            .task_exclude
            .iter()
            .filter(|m| curr.members().contains(*m))
            .filter(|m| !self.channel_members.contains(*m))
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let Some(greeter) = self.greeter.as_ref() else {
            return;
        };
        let metadata = match self.make_metadata() {
            Ok(metadata) => metadata,
            Err(_) => return,
        };
        let mut proposal = greeter.clone();
        match proposal.exclude(&targets, metadata) {
            Ok(packet) => {
                debug!(?targets, "proposing exclusion of departed members");
                self.proposal = Some(proposal);
                channel.send(ChannelSend::Packet {
                    pubtxt: framing::frame_protocol(&packet),
                    recipients: BTreeSet::new(),
                });
            }
            Err(err) => warn!(%err, "queued exclusion could not be proposed"),
        }
    }

    fn make_metadata(&self) -> Result<GreetingMetadata, SessionError> {
        let prev_pf = self.order.prev_pf().ok_or_else(|| {
            SessionError::IllegalTransition("proposing before the order is synced".into())
        })?;
        Ok(GreetingMetadata {
            prev_pf,
            prev_ch: self.order.prev_ch().iter().cloned().collect(),
        })
    }

    // ── Housekeeping ─────────────────────────────────────────────────────

    fn check_inclusion_allowed(&self, include: &BTreeSet<String>) -> Result<(), SessionError> {
        for member in include {
            // A member pending removal has not yet seen its own exclusion;
            // it must cycle through the channel before coming back.
            if self.task_exclude.contains(member) || self.task_leave.contains(member) {
                return Err(SessionError::PendingKick(member.clone()));
            }
        }
        Ok(())
    }

    fn add_task_exclude(&mut self, member: String) {
        self.task_leave.remove(&member);
        self.task_exclude.insert(member);
    }

    fn add_task_leave(&mut self, member: String) {
        if !self.task_exclude.contains(&member) {
            self.task_leave.insert(member);
        }
    }

    fn abort_greeting(&mut self) {
        self.order.abort_op();
        self.greeter = self.stable_greeter.clone();
        self.proposal = None;
        self.fail_own_op("greeting aborted");
    }

    fn fail_own_op(&mut self, why: &str) {
        if let Some(own) = self.own_op.take() {
            own.handle.fail(why);
        }
    }

    fn settle(&mut self, channel: &mut dyn GroupChannel) {
        if let Some(prev) = self.prev.as_ref() {
            if matches!(prev.state(), SessionState::Parted | SessionState::PartFailed) {
                if prev.state() == SessionState::PartFailed {
                    self.dropped_inconsistent_session = true;
                }
                if let Some(mut gone) = self.prev.take() {
                    gone.stop();
                }
            }
        }
        if self.part_pending {
            let settled = match self.curr.as_ref() {
                Some(curr) => {
                    matches!(curr.state(), SessionState::Parted | SessionState::PartFailed)
                }
                None => true,
            };
            if settled && self.in_channel {
                // Reveal the session key on the way out, then leave.
                if let Some(greeter) = self.greeter.as_mut() {
                    if greeter.state() == GreetState::Ready {
                        if let Ok(metadata) = Self::metadata_of(&self.order) {
                            if let Ok(packet) = greeter.quit(metadata) {
                                channel.send(ChannelSend::Packet {
                                    pubtxt: framing::frame_protocol(&packet),
                                    recipients: BTreeSet::new(),
                                });
                            }
                        }
                    }
                }
                self.leave_channel(channel);
            }
        }
    }

    fn metadata_of(order: &ServerOrder) -> Result<GreetingMetadata, ProtoError> {
        Ok(GreetingMetadata {
            prev_pf: order.prev_pf().unwrap_or([0u8; 32]),
            prev_ch: order.prev_ch().iter().cloned().collect(),
        })
    }

    fn leave_channel(&mut self, channel: &mut dyn GroupChannel) {
        channel.send(ChannelSend::LeaveSelf);
    }

    /// Losing the channel loses everything: key material, transcript
    /// buffers, ordering state.
    fn teardown(&mut self) {
        debug!(member = %self.id, "left channel; tearing down");
        if let Some(mut session) = self.curr.take() {
            session.stop();
        }
        if let Some(mut session) = self.prev.take() {
            session.stop();
        }
        self.greeter = None;
        self.stable_greeter = None;
        self.proposal = None;
        self.order = ServerOrder::new();
        self.in_channel = false;
        self.channel_members.clear();
        self.channel_just_synced = false;
        self.task_exclude.clear();
        self.task_leave.clear();
        if let Some(own) = self.own_op.take() {
            if own.action == Action::Part {
                own.handle.resolve();
            } else {
                own.handle.fail("left the channel");
            }
        }
        self.part_pending = false;
    }
}
