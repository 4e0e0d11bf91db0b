//! Ed25519 signing keypairs.
//!
//! Two kinds of key use the same shape: the long-term static identity key a
//! member is known by in the public-key directory, and the per-session
//! ephemeral key published during the signature key exchange. Secrets are
//! wiped on drop; an ephemeral secret can be deliberately exported once,
//! when a member quits and reveals it.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// An Ed25519 keypair. Drop clears the secret half.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)]
    public: [u8; PUBLIC_KEY_LEN],
    secret: [u8; SECRET_KEY_LEN],
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            secret: signing_key.to_bytes(),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; SECRET_KEY_LEN]) -> Self {
        let signing_key = SigningKey::from_bytes(&bytes);
        Self {
            public: signing_key.verifying_key().to_bytes(),
            secret: bytes,
        }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public
    }

    /// Export the secret half. Only the quit flow calls this, to reveal a
    /// finished session's ephemeral key on the wire.
    pub fn reveal_secret(&self) -> [u8; SECRET_KEY_LEN] {
        self.secret
    }

    /// Sign arbitrary bytes; returns a raw 64-byte Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_LEN] {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes()
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Verify a signature made by any Ed25519 public key.
pub fn verify(public: &[u8], msg: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
    let vk = VerifyingKey::from_bytes(
        public
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?,
    )
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_bytes(
        sig.try_into()
            .map_err(|_| CryptoError::InvalidKey("signature must be 64 bytes".into()))?,
    );
    vk.verify(msg, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let kp = SigningKeyPair::generate();
        let sig = kp.sign(b"forty-two");
        verify(&kp.public_bytes(), b"forty-two", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let kp = SigningKeyPair::generate();
        let sig = kp.sign(b"forty-two");
        assert!(verify(&kp.public_bytes(), b"forty-three", &sig).is_err());
    }

    #[test]
    fn secret_roundtrips_through_reveal() {
        let kp = SigningKeyPair::generate();
        let restored = SigningKeyPair::from_secret_bytes(kp.reveal_secret());
        assert_eq!(kp.public_bytes(), restored.public_bytes());
    }
}
