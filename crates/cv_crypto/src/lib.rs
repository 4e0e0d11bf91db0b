//! cv_crypto — Conclave cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Raw byte-array in/out: the wire format upstairs is binary TLV, so the
//!   helpers here speak `[u8; 32]` and `[u8; 64]`, not base64 strings.
//!
//! # Module layout
//! - `dh`     — X25519 scalars and points for the group DH tree
//! - `sig`    — Ed25519 signing keypairs (static and ephemeral)
//! - `hash`   — SHA-256 / HMAC-SHA-256 / HKDF-SHA-256
//! - `ctr`    — AES-128-CTR stream cipher for data-message payloads
//! - `rng`    — CSPRNG byte helpers
//! - `error`  — unified error type

pub mod ctr;
pub mod dh;
pub mod error;
pub mod hash;
pub mod rng;
pub mod sig;

pub use error::CryptoError;
