//! Data-message security.
//!
//! A data message binds its ciphertext to the current `(sessionId, groupKey)`
//! epoch through a one-byte hint and a signature context:
//!
//! ```text
//! SIDKEY_HINT(1)  = sidkeyHash[0]           unauthenticated probe byte
//! MESSAGE_SIGNATURE(64)                     over everything below
//! PROTOCOL_VERSION(1)
//! MESSAGE_TYPE(2) = 0x0000                  participant data
//! MESSAGE_IV(12)                            random CTR nonce
//! MESSAGE_PAYLOAD(n)                        AES-128-CTR ciphertext
//! ```
//!
//! where `sidkeyHash = SHA-256(sessionId ‖ groupKey)` and the signature is
//! `Ed25519("datamsgsig" ‖ sidkeyHash ‖ content)`. The message id is the
//! first 20 bytes of `SHA-256(signature ‖ content)` — unforgeable because
//! the signature is pseudo-random over the key and the content is
//! authenticated.
//!
//! The plaintext inside MESSAGE_PAYLOAD is a 2-byte big-endian length, the
//! TLV-encoded parents and body, then zero padding to an exponentially
//! growing bucket so length leaks only coarsely.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use cv_crypto::ctr::{self, NONCE_LEN};
use cv_crypto::hash::{sha256_parts, HASH_LEN};
use cv_crypto::rng::random_array;
use cv_crypto::sig::{self, SigningKeyPair, SIGNATURE_LEN};

use crate::greeting::MessageType;
use crate::tlv::{self, record};
use crate::{ProtoError, PROTOCOL_VERSION};

pub const SIGN_MAGIC: &[u8] = b"datamsgsig";

/// Length of a message id.
pub const MSG_ID_LEN: usize = 20;

/// Content-derived message identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MsgId(pub [u8; MSG_ID_LEN]);

impl MsgId {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        bytes
            .try_into()
            .map(MsgId)
            .map_err(|_| ProtoError::Decode(format!("message id must be 20 bytes, got {}", bytes.len())))
    }

    pub fn as_bytes(&self) -> &[u8; MSG_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        f.write_str("..")
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Body of a data message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Application content.
    Payload(String),
    /// Acknowledge-only message; `manual` when the user sent it.
    ExplicitAck { manual: bool },
    /// Consistency probe; `close` when it announces the end of the session.
    Consistency { close: bool },
    /// Keep-alive, no semantic content.
    HeartBeat,
}

impl MessageBody {
    const KIND_PAYLOAD: u8 = 0x00;
    const KIND_EXPLICIT_ACK: u8 = 0x01;
    const KIND_CONSISTENCY: u8 = 0x02;
    const KIND_HEARTBEAT: u8 = 0x03;

    /// Does this body expect to be acknowledged by every recipient?
    pub fn needs_ack(&self) -> bool {
        matches!(self, MessageBody::Payload(_) | MessageBody::Consistency { close: true })
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            MessageBody::Payload(text) => {
                let mut out = vec![Self::KIND_PAYLOAD];
                out.extend_from_slice(text.as_bytes());
                out
            }
            MessageBody::ExplicitAck { manual } => vec![Self::KIND_EXPLICIT_ACK, *manual as u8],
            MessageBody::Consistency { close } => vec![Self::KIND_CONSISTENCY, *close as u8],
            MessageBody::HeartBeat => vec![Self::KIND_HEARTBEAT],
        }
    }

    fn decode(value: &[u8]) -> Result<Self, ProtoError> {
        let (&kind, rest) = value
            .split_first()
            .ok_or_else(|| ProtoError::Decode("empty message body".into()))?;
        match kind {
            Self::KIND_PAYLOAD => Ok(MessageBody::Payload(
                String::from_utf8(rest.to_vec())
                    .map_err(|_| ProtoError::Decode("payload is not valid UTF-8".into()))?,
            )),
            Self::KIND_EXPLICIT_ACK => Ok(MessageBody::ExplicitAck {
                manual: flag_byte(rest)?,
            }),
            Self::KIND_CONSISTENCY => Ok(MessageBody::Consistency {
                close: flag_byte(rest)?,
            }),
            Self::KIND_HEARTBEAT => Ok(MessageBody::HeartBeat),
            other => Err(ProtoError::Decode(format!("unknown body kind {other:#04x}"))),
        }
    }
}

fn flag_byte(rest: &[u8]) -> Result<bool, ProtoError> {
    match rest {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(ProtoError::Decode("bad flag byte in message body".into())),
    }
}

/// One `(sessionId, groupKey)` pair a decoder may trial against.
#[derive(Clone, ZeroizeOnDrop)]
pub struct EpochKeys {
    #[zeroize(skip)]
    pub sid: [u8; HASH_LEN],
    pub group_key: [u8; HASH_LEN],
}

impl EpochKeys {
    pub fn new(sid: [u8; HASH_LEN], group_key: [u8; HASH_LEN]) -> Self {
        Self { sid, group_key }
    }

    /// `SHA-256(sessionId ‖ groupKey)`; byte 0 is the wire hint.
    pub fn sidkey_hash(&self) -> [u8; HASH_LEN] {
        sha256_parts(&[&self.sid, &self.group_key])
    }

    pub fn hint(&self) -> u8 {
        self.sidkey_hash()[0]
    }

    /// AES-128 key: the first half of the group key.
    fn cipher_key(&self) -> [u8; ctr::KEY_LEN] {
        let mut key = [0u8; ctr::KEY_LEN];
        key.copy_from_slice(&self.group_key[..ctr::KEY_LEN]);
        key
    }
}

impl std::fmt::Debug for EpochKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochKeys").field("hint", &self.hint()).finish_non_exhaustive()
    }
}

/// Exponential padding bucket: `size · 2^⌈log₂⌈len/size⌉⌉ + 1`, never
/// below `size + 1` and never below `len`.
fn padded_length(len: usize, size: usize) -> usize {
    if size == 0 {
        return len;
    }
    let mut bucket = size;
    while bucket < len {
        bucket *= 2;
    }
    bucket + 1
}

fn encode_plaintext(parents: &[MsgId], body: &MessageBody, padding_size: usize) -> Result<Vec<u8>, ProtoError> {
    let mut inner = Vec::new();
    for parent in parents {
        tlv::encode(&mut inner, record::MESSAGE_PARENT, parent.as_bytes())?;
    }
    tlv::encode(&mut inner, record::MESSAGE_BODY, &body.encode())?;

    if inner.len() > u16::MAX as usize {
        return Err(ProtoError::ValueTooLong(inner.len()));
    }
    let mut out = Vec::with_capacity(2 + inner.len());
    out.extend_from_slice(&(inner.len() as u16).to_be_bytes());
    out.extend_from_slice(&inner);
    out.resize(padded_length(out.len(), padding_size), 0);
    Ok(out)
}

fn decode_plaintext(plain: &[u8]) -> Result<(Vec<MsgId>, MessageBody), ProtoError> {
    if plain.len() < 2 {
        return Err(ProtoError::Decode("plaintext shorter than length prefix".into()));
    }
    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
    let rest = &plain[2..];
    if rest.len() < len {
        return Err(ProtoError::Decode(format!(
            "plaintext length prefix {len} exceeds {} available bytes",
            rest.len()
        )));
    }

    let mut reader = tlv::Reader::new(&rest[..len]);
    let parents = reader
        .take_all(record::MESSAGE_PARENT)?
        .into_iter()
        .map(MsgId::from_slice)
        .collect::<Result<Vec<_>, _>>()?;
    let body = MessageBody::decode(reader.expect(record::MESSAGE_BODY)?)?;
    if let Some(ty) = reader.peek()? {
        return Err(ProtoError::UnknownRecord(ty));
    }
    Ok((parents, body))
}

/// A decrypted and verified data message.
#[derive(Debug, Clone)]
pub struct DecryptedData {
    pub mid: MsgId,
    pub parents: Vec<MsgId>,
    pub body: MessageBody,
    /// Index into the epoch list that matched.
    pub epoch: usize,
}

/// Structural probe: does this TLV body look like a data message, and if
/// so, what is its epoch hint byte?
pub fn peek_hint(packet: &[u8]) -> Option<u8> {
    match tlv::decode(packet) {
        Ok((record::SIDKEY_HINT, [hint], _)) => Some(*hint),
        _ => None,
    }
}

/// Encrypt, sign and frame one data message. Returns the packet and its id.
pub fn auth_encrypt(
    epoch: &EpochKeys,
    signer: &SigningKeyPair,
    parents: &[MsgId],
    body: &MessageBody,
    padding_size: usize,
) -> Result<(Vec<u8>, MsgId), ProtoError> {
    let mut plain = encode_plaintext(parents, body, padding_size)?;
    let nonce: [u8; NONCE_LEN] = random_array();
    let ciphertext = ctr::encrypt(&epoch.cipher_key(), &ctr::iv_from_nonce(&nonce), &plain);
    plain.zeroize();

    let mut content = Vec::new();
    tlv::encode(&mut content, record::PROTOCOL_VERSION, &[PROTOCOL_VERSION])?;
    tlv::encode(&mut content, record::MESSAGE_TYPE, &MessageType::DATA.bits().to_be_bytes())?;
    tlv::encode(&mut content, record::MESSAGE_IV, &nonce)?;
    tlv::encode(&mut content, record::MESSAGE_PAYLOAD, &ciphertext)?;

    let signature = sign_data(signer, &epoch.sidkey_hash(), &content);
    let mid = message_id(&signature, &content);

    let mut packet = Vec::new();
    tlv::encode(&mut packet, record::SIDKEY_HINT, &[epoch.hint()])?;
    tlv::encode(&mut packet, record::MESSAGE_SIGNATURE, &signature)?;
    packet.extend_from_slice(&content);
    Ok((packet, mid))
}

/// Verify and decrypt a data message, trialling every epoch whose hint
/// byte matches. `Ok(None)` means the hint matched no known epoch — the
/// packet is not for us and is dropped without raising.
pub fn decrypt_verify(
    packet: &[u8],
    sender_pub: &[u8; 32],
    epochs: &[EpochKeys],
) -> Result<Option<DecryptedData>, ProtoError> {
    let mut reader = tlv::Reader::new(packet);
    let hint = reader.expect(record::SIDKEY_HINT)?;
    let hint = match hint {
        [b] => *b,
        _ => return Err(ProtoError::Decode("sidkey hint must be 1 byte".into())),
    };
    let signature = tlv::value64(reader.expect(record::MESSAGE_SIGNATURE)?, "message signature")?;
    let content = reader.remaining();

    let candidates: Vec<(usize, &EpochKeys)> = epochs
        .iter()
        .enumerate()
        .filter(|(_, e)| e.hint() == hint)
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    for (index, epoch) in candidates {
        if verify_data(sender_pub, &epoch.sidkey_hash(), content, &signature).is_err() {
            continue;
        }
        let (parents, body) = decode_content(content, epoch)?;
        return Ok(Some(DecryptedData {
            mid: message_id(&signature, content),
            parents,
            body,
            epoch: index,
        }));
    }
    Err(ProtoError::BadSignature)
}

fn decode_content(content: &[u8], epoch: &EpochKeys) -> Result<(Vec<MsgId>, MessageBody), ProtoError> {
    let mut reader = tlv::Reader::new(content);
    let version = reader.expect(record::PROTOCOL_VERSION)?;
    if version != [PROTOCOL_VERSION] {
        return Err(ProtoError::VersionMismatch {
            got: version.first().copied().unwrap_or(0),
            expected: PROTOCOL_VERSION,
        });
    }
    let ty = reader.expect(record::MESSAGE_TYPE)?;
    if ty != MessageType::DATA.bits().to_be_bytes() {
        return Err(ProtoError::Decode("not a participant-data message".into()));
    }
    let nonce: [u8; NONCE_LEN] = reader
        .expect(record::MESSAGE_IV)?
        .try_into()
        .map_err(|_| ProtoError::Decode("message IV must be 12 bytes".into()))?;
    let payload = reader.expect(record::MESSAGE_PAYLOAD)?;
    if let Some(ty) = reader.peek()? {
        return Err(ProtoError::UnknownRecord(ty));
    }

    let mut plain = ctr::decrypt(&epoch.cipher_key(), &ctr::iv_from_nonce(&nonce), payload);
    let result = decode_plaintext(&plain);
    plain.zeroize();
    result
}

/// First 20 bytes of `SHA-256(signature ‖ content)`.
pub fn message_id(signature: &[u8; SIGNATURE_LEN], content: &[u8]) -> MsgId {
    let hash = sha256_parts(&[signature, content]);
    let mut id = [0u8; MSG_ID_LEN];
    id.copy_from_slice(&hash[..MSG_ID_LEN]);
    MsgId(id)
}

fn sign_data(signer: &SigningKeyPair, sidkey_hash: &[u8; HASH_LEN], content: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut msg = Vec::with_capacity(SIGN_MAGIC.len() + HASH_LEN + content.len());
    msg.extend_from_slice(SIGN_MAGIC);
    msg.extend_from_slice(sidkey_hash);
    msg.extend_from_slice(content);
    signer.sign(&msg)
}

fn verify_data(
    public: &[u8; 32],
    sidkey_hash: &[u8; HASH_LEN],
    content: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<(), ProtoError> {
    let mut msg = Vec::with_capacity(SIGN_MAGIC.len() + HASH_LEN + content.len());
    msg.extend_from_slice(SIGN_MAGIC);
    msg.extend_from_slice(sidkey_hash);
    msg.extend_from_slice(content);
    sig::verify(public, &msg, signature).map_err(|_| ProtoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(tag: u8) -> EpochKeys {
        EpochKeys::new([tag; 32], [tag.wrapping_add(1); 32])
    }

    #[test]
    fn padded_length_buckets() {
        assert_eq!(padded_length(5, 0), 5);
        assert_eq!(padded_length(5, 128), 129);
        assert_eq!(padded_length(128, 128), 129);
        assert_eq!(padded_length(129, 128), 257);
        assert_eq!(padded_length(300, 128), 513);
    }

    #[test]
    fn body_roundtrips() {
        for body in [
            MessageBody::Payload("hello".into()),
            MessageBody::ExplicitAck { manual: true },
            MessageBody::ExplicitAck { manual: false },
            MessageBody::Consistency { close: true },
            MessageBody::HeartBeat,
        ] {
            assert_eq!(MessageBody::decode(&body.encode()).unwrap(), body);
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let e = epoch(3);
        let signer = SigningKeyPair::generate();
        let parents = vec![MsgId([1u8; 20]), MsgId([2u8; 20])];
        let body = MessageBody::Payload("hello".into());

        let (packet, mid) = auth_encrypt(&e, &signer, &parents, &body, 128).unwrap();
        let out = decrypt_verify(&packet, &signer.public_bytes(), std::slice::from_ref(&e))
            .unwrap()
            .expect("hint should match");
        assert_eq!(out.mid, mid);
        assert_eq!(out.parents, parents);
        assert_eq!(out.body, body);
        assert_eq!(out.epoch, 0);
    }

    #[test]
    fn unknown_hint_drops_silently() {
        let e = epoch(3);
        let signer = SigningKeyPair::generate();
        let (packet, _) =
            auth_encrypt(&e, &signer, &[], &MessageBody::HeartBeat, 0).unwrap();

        let mut others = Vec::new();
        for tag in 0..8u8 {
            let cand = epoch(tag.wrapping_mul(7).wrapping_add(40));
            if cand.hint() != e.hint() {
                others.push(cand);
            }
        }
        assert_eq!(decrypt_verify(&packet, &signer.public_bytes(), &others).unwrap().is_none(), true);
    }

    #[test]
    fn wrong_signer_is_an_error() {
        let e = epoch(5);
        let signer = SigningKeyPair::generate();
        let imposter = SigningKeyPair::generate();
        let (packet, _) =
            auth_encrypt(&e, &signer, &[], &MessageBody::Payload("x".into()), 0).unwrap();
        assert!(matches!(
            decrypt_verify(&packet, &imposter.public_bytes(), std::slice::from_ref(&e)),
            Err(ProtoError::BadSignature)
        ));
    }

    #[test]
    fn message_id_is_stable_across_decoders() {
        let e = epoch(9);
        let signer = SigningKeyPair::generate();
        let (packet, mid) =
            auth_encrypt(&e, &signer, &[], &MessageBody::Payload("hi".into()), 32).unwrap();
        for _ in 0..3 {
            let out = decrypt_verify(&packet, &signer.public_bytes(), std::slice::from_ref(&e))
                .unwrap()
                .unwrap();
            assert_eq!(out.mid, mid);
        }
    }

    #[test]
    fn epoch_rotation_trials_both_epochs() {
        let old = epoch(11);
        let new = epoch(12);
        let signer = SigningKeyPair::generate();
        let (packet, _) =
            auth_encrypt(&old, &signer, &[], &MessageBody::Payload("late".into()), 0).unwrap();
        // Decoder has rotated: new epoch first, old kept for in-flight traffic.
        let epochs = vec![new, old];
        let out = decrypt_verify(&packet, &signer.public_bytes(), &epochs)
            .unwrap()
            .unwrap();
        assert_eq!(out.epoch, 1);
        assert_eq!(out.body, MessageBody::Payload("late".into()));
    }
}
