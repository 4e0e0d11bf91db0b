use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed packet: {0}")]
    Decode(String),

    #[error("Unexpected TLV record type {got}, wanted {wanted}")]
    UnexpectedRecord { got: u16, wanted: u16 },

    #[error("Unknown TLV record type {0}")]
    UnknownRecord(u16),

    #[error("Record value too long: {0} bytes")]
    ValueTooLong(usize),

    #[error("Protocol version mismatch: got {got}, expected {expected}")]
    VersionMismatch { got: u8, expected: u8 },

    #[error("Array record count {count} exceeds member count {members}")]
    TooManyRecords { count: usize, members: usize },

    #[error("Message signature verification failed")]
    BadSignature,

    #[error("Session hint matches no known epoch")]
    UnknownEpoch,

    #[error(transparent)]
    Crypto(#[from] cv_crypto::CryptoError),
}
