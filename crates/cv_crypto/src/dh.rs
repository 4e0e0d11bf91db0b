//! X25519 scalars and points for the group DH tree.
//!
//! The key agreement upstairs chains scalar multiplications through a vector
//! of intermediate values, so everything here works on raw 32-byte
//! u-coordinates rather than on a fixed two-party handshake shape.
//!
//! `DhSecret` holds a clamped scalar and wipes it on drop. Multiplying by
//! `None` means multiplying the base point (i.e. deriving the public key).

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Length of an X25519 point or scalar.
pub const KEY_LEN: usize = 32;

/// A 32-byte X25519 u-coordinate.
pub type DhPoint = [u8; KEY_LEN];

/// A private X25519 scalar, clamped at generation time. Wiped on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DhSecret([u8; KEY_LEN]);

impl DhSecret {
    /// Generate a fresh random scalar, clamped per X25519.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The matching public value: scalar times the base point.
    pub fn public(&self) -> DhPoint {
        PublicKey::from(&StaticSecret::from(self.0)).to_bytes()
    }

    /// Scalar-multiply an arbitrary point.
    pub fn shared(&self, point: &DhPoint) -> DhPoint {
        StaticSecret::from(self.0)
            .diffie_hellman(&PublicKey::from(*point))
            .to_bytes()
    }

    /// Scalar-multiply `point`, or the base point when `point` is `None`.
    ///
    /// This is the single operation the key-agreement tree is built from:
    /// an empty slot in an intermediate-key vector stands for "no
    /// contributions yet", and multiplying into it starts the chain.
    pub fn mult(&self, point: Option<&DhPoint>) -> DhPoint {
        match point {
            Some(p) => self.shared(p),
            None => self.public(),
        }
    }
}

impl std::fmt::Debug for DhSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DhSecret(..)")
    }
}

/// Parse a wire point, checking only the length; any u-coordinate is a
/// valid multiplication input.
pub fn point_from_slice(bytes: &[u8]) -> Result<DhPoint, CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("DH point must be 32 bytes, got {}", bytes.len())))
}

/// Overwrite a point that held derived secret material.
pub fn wipe_point(point: &mut DhPoint) {
    point.zeroize();
}
