//! cv_session — Conclave protocol engine
//!
//! End-to-end encrypted group messaging over an untrusted broadcast
//! channel: a chained-DH group key agreement, an authenticated signature
//! key exchange, a causally-ordered transcript with acknowledgement
//! tracking, and the outer session state machine that holds it together.
//!
//! The engine is single-threaded and cooperative. The embedder owns the
//! transport: it feeds `HybridSession::recv` with channel deliveries,
//! drives time with `tick`, and submits application actions through
//! `execute`. Everything the engine wants to say comes back through the
//! channel trait or the event context.
//!
//! # Modules
//! - `channel`    — the broadcast channel contract + loopback test double
//! - `gka`        — group key agreement (chained DH, aux operations)
//! - `ske`        — signature key exchange (nonces, session signatures)
//! - `greeter`    — merges GKA+SKE packets, operation state machine
//! - `order`      — ServerOrder: which proposal the channel accepted
//! - `transcript` — causal message DAG, acknowledgement tracking
//! - `base`       — one sub-session: send/recv, monitors, fin
//! - `hybrid`     — the outer session over channel events
//! - `events`     — subscription fan-out
//! - `timer`      — tick-based timers
//! - `error`      — unified error type

pub mod base;
pub mod channel;
pub mod error;
pub mod events;
pub mod gka;
pub mod greeter;
pub mod hybrid;
pub mod order;
pub mod ske;
pub mod timer;
pub mod transcript;

pub use base::{BaseRecv, SessionBase, SessionConfig};
pub use error::SessionError;
pub use events::{EventContext, SessionEvent, SessionState};
pub use hybrid::{Action, HybridSession, OpHandle, OpStatus};
