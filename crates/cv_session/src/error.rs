use thiserror::Error;

use cv_crypto::CryptoError;
use cv_proto::ProtoError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Empty member set for {0}")]
    EmptyMembers(&'static str),

    #[error("Duplicate member {0}")]
    DuplicateMember(String),

    #[error("Not a member: {0}")]
    NotAMember(String),

    #[error("Cannot exclude self")]
    SelfExclusion,

    /// Fatal: a session signature verified false under the member's static
    /// key. The greeting must be aborted and the application told.
    #[error("Session authentication by member {0} failed")]
    AuthenticationFailure(String),

    #[error("Illegal state transition: {0}")]
    IllegalTransition(String),

    #[error("Another operation is already in progress")]
    OperationInProgress,

    #[error("Not joined to a session")]
    NotJoined,

    #[error("Member {0} is pending removal and must leave the channel before re-inclusion")]
    PendingKick(String),

    #[error("Transcript: {0}")]
    Transcript(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
