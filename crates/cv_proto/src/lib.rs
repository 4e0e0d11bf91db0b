//! cv_proto — Conclave wire codec
//!
//! Everything that touches bytes on the wire lives here: the TLV record
//! layer, the outer ASCII framing, the greeting packet format produced by
//! the key agreement, and the authenticated encryption of data messages.
//!
//! # Modules
//! - `tlv`      — type/length/value records (u16 big-endian type and length)
//! - `framing`  — `?mpENC:` outer framing, query and error messages
//! - `greeting` — greeting packets: message-type flags, members, keys, nonces
//! - `data`     — data-message security: sign, encrypt, trial-decrypt

pub mod data;
pub mod framing;
pub mod greeting;
pub mod tlv;

mod error;

pub use error::ProtoError;

/// The single protocol version this implementation speaks. The receiver
/// rejects any other value.
pub const PROTOCOL_VERSION: u8 = 1;
