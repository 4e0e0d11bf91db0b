//! Greeting packets.
//!
//! A greeting merges one group-key-agreement payload and one signature-key
//! exchange payload into a single signed packet. The 16-bit message type
//! carries the phase and operation:
//!
//! | bit | meaning                              |
//! |-----|--------------------------------------|
//! | 0   | AUX (auxiliary, 0 = initial)         |
//! | 1   | DOWN (broadcast, 0 = directed)       |
//! | 2   | GKA payload present                  |
//! | 3   | SKE payload present                  |
//! | 4–6 | operation code                       |
//! | 7   | INIT (from the operation initiator)  |
//! | 8   | RECOVER (part of a recovery flow)    |
//!
//! Packets are signed with the sender's ephemeral session key; the
//! signature record comes first and covers everything after it.

use bitflags::bitflags;

use cv_crypto::dh::{self, DhPoint};
use cv_crypto::sig::{self, SigningKeyPair, SIGNATURE_LEN};

use crate::tlv::{self, record};
use crate::{ProtoError, PROTOCOL_VERSION};

/// Domain-separation prefix for greeting signatures.
pub const SIGN_MAGIC: &[u8] = b"greetmsgsig";

bitflags! {
    /// Phase bits of the message type (bits 4–6 are the operation code and
    /// live outside the flag set).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u16 {
        const AUX     = 0x0001;
        const DOWN    = 0x0002;
        const GKA     = 0x0004;
        const SKE     = 0x0008;
        const INIT    = 0x0080;
        const RECOVER = 0x0100;
    }
}

const OP_SHIFT: u16 = 4;
const OP_MASK: u16 = 0x0070;

/// What a packet (or a whole flow) is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operation {
    Data = 0,
    Start = 1,
    Join = 2,
    Exclude = 3,
    Refresh = 4,
    Quit = 5,
}

impl Operation {
    fn from_code(code: u16) -> Result<Self, ProtoError> {
        match code {
            0 => Ok(Operation::Data),
            1 => Ok(Operation::Start),
            2 => Ok(Operation::Join),
            3 => Ok(Operation::Exclude),
            4 => Ok(Operation::Refresh),
            5 => Ok(Operation::Quit),
            other => Err(ProtoError::Decode(format!("unknown operation code {other}"))),
        }
    }
}

/// The full 16-bit message type: flags plus operation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageType(u16);

impl MessageType {
    /// Data messages carry the all-zero type.
    pub const DATA: MessageType = MessageType(0);

    pub fn greeting(op: Operation, flags: TypeFlags) -> Self {
        MessageType(flags.bits() | ((op as u16) << OP_SHIFT))
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtoError> {
        // Validate both halves; reject bits outside the defined layout.
        let flag_bits = bits & !OP_MASK;
        TypeFlags::from_bits(flag_bits)
            .ok_or_else(|| ProtoError::Decode(format!("unknown message-type bits {bits:#06x}")))?;
        Operation::from_code((bits & OP_MASK) >> OP_SHIFT)?;
        Ok(MessageType(bits))
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn operation(self) -> Operation {
        Operation::from_code((self.0 & OP_MASK) >> OP_SHIFT)
            .unwrap_or(Operation::Data)
    }

    pub fn flags(self) -> TypeFlags {
        TypeFlags::from_bits_truncate(self.0)
    }

    pub fn contains(self, flags: TypeFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn with(self, flags: TypeFlags) -> Self {
        MessageType(self.0 | flags.bits())
    }

    pub fn without(self, flags: TypeFlags) -> Self {
        MessageType(self.0 & !flags.bits())
    }

    pub fn is_greeting(self) -> bool {
        self.0 != 0
    }

    pub fn is_downflow(self) -> bool {
        self.contains(TypeFlags::DOWN)
    }
}

/// Ordering metadata carried by the first packet of an operation: the
/// packet-id of the previous operation's final packet and the channel
/// membership seen then.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingMetadata {
    pub prev_pf: [u8; 32],
    pub prev_ch: Vec<String>,
}

/// One greeting packet, decoded.
#[derive(Debug, Clone)]
pub struct GreetingWire {
    pub source: String,
    /// Empty string means broadcast.
    pub dest: String,
    pub ty: MessageType,
    pub members: Vec<String>,
    /// Intermediate DH values; an empty record encodes the null slot.
    pub int_keys: Vec<Option<DhPoint>>,
    pub nonces: Vec<Vec<u8>>,
    pub pub_keys: Vec<[u8; 32]>,
    /// The sender's own session-confirmation signature, on downflow.
    pub session_signature: Option<[u8; SIGNATURE_LEN]>,
    /// Ephemeral secret revealed on quit.
    pub signing_key: Option<[u8; 32]>,
    /// Present on the first packet of an operation.
    pub metadata: Option<GreetingMetadata>,
    /// Present on every later packet of an operation: the initial packet-id.
    pub prev_pi: Option<[u8; 32]>,
}

impl GreetingWire {
    pub fn is_broadcast(&self) -> bool {
        self.dest.is_empty()
    }

    /// Serialise the signed region (everything after the signature record).
    fn encode_content(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::new();
        tlv::encode(&mut out, record::PROTOCOL_VERSION, &[PROTOCOL_VERSION])?;
        tlv::encode(&mut out, record::MESSAGE_TYPE, &self.ty.bits().to_be_bytes())?;
        tlv::encode(&mut out, record::SOURCE, self.source.as_bytes())?;
        tlv::encode(&mut out, record::DEST, self.dest.as_bytes())?;
        if let Some(meta) = &self.metadata {
            tlv::encode(&mut out, record::PREV_PF, &meta.prev_pf)?;
            for member in &meta.prev_ch {
                tlv::encode(&mut out, record::PREV_CH, member.as_bytes())?;
            }
        }
        if let Some(prev_pi) = &self.prev_pi {
            tlv::encode(&mut out, record::PREV_PI, prev_pi)?;
        }
        for member in &self.members {
            tlv::encode(&mut out, record::MEMBER, member.as_bytes())?;
        }
        for int_key in &self.int_keys {
            match int_key {
                Some(point) => tlv::encode(&mut out, record::INT_KEY, point)?,
                None => tlv::encode(&mut out, record::INT_KEY, &[])?,
            }
        }
        for nonce in &self.nonces {
            tlv::encode(&mut out, record::NONCE, nonce)?;
        }
        for pub_key in &self.pub_keys {
            tlv::encode(&mut out, record::PUB_KEY, pub_key)?;
        }
        if let Some(session_sig) = &self.session_signature {
            tlv::encode(&mut out, record::SESSION_SIGNATURE, session_sig)?;
        }
        if let Some(signing_key) = &self.signing_key {
            tlv::encode(&mut out, record::SIGNING_KEY, signing_key)?;
        }
        Ok(out)
    }

    /// Serialise and sign with the sender's ephemeral key.
    pub fn encode_signed(&self, signer: &SigningKeyPair) -> Result<Vec<u8>, ProtoError> {
        let content = self.encode_content()?;
        let signature = sign_greeting(signer, &content);
        let mut out = Vec::new();
        tlv::encode(&mut out, record::MESSAGE_SIGNATURE, &signature)?;
        out.extend_from_slice(&content);
        Ok(out)
    }
}

pub fn sign_greeting(signer: &SigningKeyPair, content: &[u8]) -> [u8; SIGNATURE_LEN] {
    let mut msg = Vec::with_capacity(SIGN_MAGIC.len() + content.len());
    msg.extend_from_slice(SIGN_MAGIC);
    msg.extend_from_slice(content);
    signer.sign(&msg)
}

pub fn verify_greeting(public: &[u8; 32], content: &[u8], signature: &[u8]) -> Result<(), ProtoError> {
    let mut msg = Vec::with_capacity(SIGN_MAGIC.len() + content.len());
    msg.extend_from_slice(SIGN_MAGIC);
    msg.extend_from_slice(content);
    sig::verify(public, &msg, signature).map_err(|_| ProtoError::BadSignature)
}

/// A decoded greeting packet plus the material needed to verify it later,
/// once the right ephemeral public key is known.
#[derive(Debug, Clone)]
pub struct DecodedGreeting {
    pub wire: GreetingWire,
    pub signature: [u8; SIGNATURE_LEN],
    /// The signed region, kept verbatim for verification.
    pub content: Vec<u8>,
}

/// Quick structural probe: does this TLV body look like a greeting packet?
pub fn is_greeting_packet(packet: &[u8]) -> bool {
    matches!(tlv::decode(packet), Ok((record::MESSAGE_SIGNATURE, _, _)))
}

pub fn decode(packet: &[u8]) -> Result<DecodedGreeting, ProtoError> {
    let mut reader = tlv::Reader::new(packet);
    let signature = tlv::value64(reader.expect(record::MESSAGE_SIGNATURE)?, "message signature")?;
    let content = reader.remaining().to_vec();

    let version = reader.expect(record::PROTOCOL_VERSION)?;
    if version != [PROTOCOL_VERSION] {
        return Err(ProtoError::VersionMismatch {
            got: version.first().copied().unwrap_or(0),
            expected: PROTOCOL_VERSION,
        });
    }

    let ty_bytes = reader.expect(record::MESSAGE_TYPE)?;
    if ty_bytes.len() != 2 {
        return Err(ProtoError::Decode(format!(
            "message type must be 2 bytes, got {}",
            ty_bytes.len()
        )));
    }
    let ty = MessageType::from_bits(u16::from_be_bytes([ty_bytes[0], ty_bytes[1]]))?;

    let source = string_value(reader.expect(record::SOURCE)?, "source")?;
    let dest = string_value(reader.expect(record::DEST)?, "dest")?;

    let metadata = match reader.take(record::PREV_PF)? {
        Some(prev_pf) => {
            let prev_pf = tlv::value32(prev_pf, "prev-pf packet id")?;
            let prev_ch = reader
                .take_all(record::PREV_CH)?
                .into_iter()
                .map(|v| string_value(v, "prev-ch member"))
                .collect::<Result<Vec<_>, _>>()?;
            Some(GreetingMetadata { prev_pf, prev_ch })
        }
        None => None,
    };

    let prev_pi = reader
        .take(record::PREV_PI)?
        .map(|v| tlv::value32(v, "prev-pi packet id"))
        .transpose()?;

    let members = reader
        .take_all(record::MEMBER)?
        .into_iter()
        .map(|v| string_value(v, "member"))
        .collect::<Result<Vec<_>, _>>()?;

    let int_keys = bounded(reader.take_all(record::INT_KEY)?, members.len())?
        .into_iter()
        .map(|v| {
            if v.is_empty() {
                Ok(None)
            } else {
                dh::point_from_slice(v).map(Some).map_err(ProtoError::from)
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let nonces = bounded(reader.take_all(record::NONCE)?, members.len())?
        .into_iter()
        .map(|v| v.to_vec())
        .collect();

    let pub_keys = bounded(reader.take_all(record::PUB_KEY)?, members.len())?
        .into_iter()
        .map(|v| tlv::value32(v, "ephemeral public key"))
        .collect::<Result<Vec<_>, _>>()?;

    let session_signature = reader
        .take(record::SESSION_SIGNATURE)?
        .map(|v| tlv::value64(v, "session signature"))
        .transpose()?;

    let signing_key = reader
        .take(record::SIGNING_KEY)?
        .map(|v| tlv::value32(v, "revealed signing key"))
        .transpose()?;

    if let Some(ty) = reader.peek()? {
        return Err(ProtoError::UnknownRecord(ty));
    }

    Ok(DecodedGreeting {
        wire: GreetingWire {
            source,
            dest,
            ty,
            members,
            int_keys,
            nonces,
            pub_keys,
            session_signature,
            signing_key,
            metadata,
            prev_pi,
        },
        signature,
        content,
    })
}

fn string_value(value: &[u8], what: &str) -> Result<String, ProtoError> {
    String::from_utf8(value.to_vec())
        .map_err(|_| ProtoError::Decode(format!("{what} is not valid UTF-8")))
}

fn bounded<T>(records: Vec<T>, members: usize) -> Result<Vec<T>, ProtoError> {
    // Upflow packets may carry one intermediate key more than the members
    // they have contributions from, but never more records than members.
    if records.len() > members {
        return Err(ProtoError::TooManyRecords {
            count: records.len(),
            members,
        });
    }
    Ok(records)
}
