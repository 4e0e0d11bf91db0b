//! AES-128-CTR for data-message payloads.
//!
//! The wire format pairs CTR with a detached Ed25519 signature instead of
//! an AEAD tag, so this is a bare stream cipher. The IV is a 12-byte random
//! nonce followed by 4 zero counter bytes.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

type Aes128Ctr = Ctr128BE<Aes128>;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;

/// Build the full 16-byte IV from the 12-byte wire nonce.
pub fn iv_from_nonce(nonce: &[u8; NONCE_LEN]) -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    iv[..NONCE_LEN].copy_from_slice(nonce);
    iv
}

pub fn encrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], data: &[u8]) -> Vec<u8> {
    let mut buf = data.to_vec();
    Aes128Ctr::new(key.into(), iv.into()).apply_keystream(&mut buf);
    buf
}

/// CTR decryption is the same keystream application.
pub fn decrypt(key: &[u8; KEY_LEN], iv: &[u8; IV_LEN], data: &[u8]) -> Vec<u8> {
    encrypt(key, iv, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; KEY_LEN];
        let iv = iv_from_nonce(&[9u8; NONCE_LEN]);
        let ct = encrypt(&key, &iv, b"Don't panic!");
        assert_ne!(&ct[..], b"Don't panic!");
        assert_eq!(decrypt(&key, &iv, &ct), b"Don't panic!");
    }

    #[test]
    fn nist_sp800_38a_ctr_vector() {
        // NIST SP 800-38A F.5.1 CTR-AES128.Encrypt, first block.
        let key: [u8; 16] = hex::decode("2b7e151628aed2a6abf7158809cf4f3c")
            .unwrap()
            .try_into()
            .unwrap();
        let iv: [u8; 16] = hex::decode("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff")
            .unwrap()
            .try_into()
            .unwrap();
        let pt = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        let ct = encrypt(&key, &iv, &pt);
        assert_eq!(hex::encode(ct), "874d6191b620e3261bef6864990db6ce");
    }
}
