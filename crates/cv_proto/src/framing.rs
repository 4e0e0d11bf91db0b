//! Outer ASCII framing.
//!
//! Protocol packets travel over chat transports that only promise text, so
//! the binary TLV body is base64-wrapped:
//!
//!   `?mpENC:<base64 body>.`            protocol packet
//!   `?mpENCv<N>?`                      query ("which version do you speak")
//!   `?mpENC Error:<b64 sig>:<from>,<severity>:<text>`
//!
//! Anything that carries none of these prefixes is classified as plaintext
//! and passed through untouched.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{ProtoError, PROTOCOL_VERSION};

const PROTOCOL_PREFIX: &str = "?mpENC:";
const QUERY_PREFIX: &str = "?mpENCv";
const ERROR_PREFIX: &str = "?mpENC Error:";

/// How severe an on-wire error report is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Warning,
    Terminal,
}

impl Severity {
    fn as_wire(self) -> &'static str {
        match self {
            Severity::Warning => "WARNING",
            Severity::Terminal => "TERMINAL",
        }
    }

    fn from_wire(s: &str) -> Result<Self, ProtoError> {
        match s {
            "WARNING" => Ok(Severity::Warning),
            "TERMINAL" => Ok(Severity::Terminal),
            other => Err(ProtoError::Decode(format!("unknown severity {other:?}"))),
        }
    }
}

/// A decoded `?mpENC Error:` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    /// Detached signature over `from ‖ severity ‖ text`; absent when the
    /// sender had no session key to sign with.
    pub signature: Option<Vec<u8>>,
    pub from: String,
    pub severity: Severity,
    pub text: String,
}

/// Result of classifying one inbound transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// A protocol packet; the TLV body, base64-decoded.
    Protocol(Vec<u8>),
    /// A `?mpENCv<N>?` query with the advertised version.
    Query(u8),
    /// An error report.
    Error(ErrorFrame),
    /// Not ours; hand back to the application verbatim.
    Plaintext(String),
}

pub fn frame_protocol(body: &[u8]) -> String {
    format!("{PROTOCOL_PREFIX}{}.", STANDARD.encode(body))
}

pub fn frame_query() -> String {
    format!("{QUERY_PREFIX}{PROTOCOL_VERSION}?")
}

pub fn frame_error(frame: &ErrorFrame) -> String {
    let sig = frame
        .signature
        .as_deref()
        .map(|s| STANDARD.encode(s))
        .unwrap_or_default();
    format!(
        "{ERROR_PREFIX}{sig}:{},{}:{}",
        frame.from,
        frame.severity.as_wire(),
        frame.text
    )
}

/// Domain-separation prefix for error-frame signatures.
pub const ERROR_SIGN_MAGIC: &[u8] = b"errormsgsig";

/// The bytes an error frame's signature covers.
pub fn error_signed_content(from: &str, severity: Severity, text: &str) -> Vec<u8> {
    let mut out = ERROR_SIGN_MAGIC.to_vec();
    out.extend_from_slice(format!("{from},{}:{text}", severity.as_wire()).as_bytes());
    out
}

/// Build a signed error frame with the sender's ephemeral session key.
pub fn signed_error_frame(
    signer: &cv_crypto::sig::SigningKeyPair,
    from: &str,
    severity: Severity,
    text: &str,
) -> ErrorFrame {
    let signature = signer.sign(&error_signed_content(from, severity, text));
    ErrorFrame {
        signature: Some(signature.to_vec()),
        from: from.to_string(),
        severity,
        text: text.to_string(),
    }
}

/// Verify an error frame against the claimed sender's ephemeral key.
pub fn verify_error_frame(frame: &ErrorFrame, public: &[u8; 32]) -> Result<(), ProtoError> {
    let signature = frame
        .signature
        .as_deref()
        .ok_or_else(|| ProtoError::Decode("error frame is unsigned".into()))?;
    cv_crypto::sig::verify(
        public,
        &error_signed_content(&frame.from, frame.severity, &frame.text),
        signature,
    )
    .map_err(|_| ProtoError::BadSignature)
}

pub fn classify(raw: &str) -> Result<Classified, ProtoError> {
    if let Some(rest) = raw.strip_prefix(ERROR_PREFIX) {
        return classify_error(rest).map(Classified::Error);
    }
    if let Some(rest) = raw.strip_prefix(PROTOCOL_PREFIX) {
        let body = rest
            .strip_suffix('.')
            .ok_or_else(|| ProtoError::Decode("protocol frame missing terminator".into()))?;
        let bytes = STANDARD
            .decode(body)
            .map_err(|e| ProtoError::Decode(format!("bad base64 body: {e}")))?;
        return Ok(Classified::Protocol(bytes));
    }
    if let Some(rest) = raw.strip_prefix(QUERY_PREFIX) {
        let digits = rest
            .strip_suffix('?')
            .ok_or_else(|| ProtoError::Decode("query frame missing terminator".into()))?;
        let version: u8 = digits
            .parse()
            .map_err(|_| ProtoError::Decode(format!("bad query version {digits:?}")))?;
        return Ok(Classified::Query(version));
    }
    Ok(Classified::Plaintext(raw.to_string()))
}

fn classify_error(rest: &str) -> Result<ErrorFrame, ProtoError> {
    // <b64 sig>:<from>,<severity>:<text>
    let (sig_part, rest) = rest
        .split_once(':')
        .ok_or_else(|| ProtoError::Decode("error frame missing signature separator".into()))?;
    let (origin_part, text) = rest
        .split_once(':')
        .ok_or_else(|| ProtoError::Decode("error frame missing origin separator".into()))?;
    let (from, severity) = origin_part
        .split_once(',')
        .ok_or_else(|| ProtoError::Decode("error frame missing severity".into()))?;

    let signature = if sig_part.is_empty() {
        None
    } else {
        Some(
            STANDARD
                .decode(sig_part)
                .map_err(|e| ProtoError::Decode(format!("bad error signature: {e}")))?,
        )
    };

    Ok(ErrorFrame {
        signature,
        from: from.to_string(),
        severity: Severity::from_wire(severity)?,
        text: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_roundtrip() {
        let framed = frame_protocol(b"\x00\x01\x00\x01\x01");
        assert!(framed.starts_with("?mpENC:"));
        assert!(framed.ends_with('.'));
        match classify(&framed).unwrap() {
            Classified::Protocol(body) => assert_eq!(body, b"\x00\x01\x00\x01\x01"),
            other => panic!("misclassified: {other:?}"),
        }
    }

    #[test]
    fn query_roundtrip() {
        assert_eq!(frame_query(), "?mpENCv1?");
        assert_eq!(classify("?mpENCv1?").unwrap(), Classified::Query(1));
    }

    #[test]
    fn error_roundtrip() {
        let frame = ErrorFrame {
            signature: Some(vec![1, 2, 3]),
            from: "alice@example.com".into(),
            severity: Severity::Terminal,
            text: "Session authentication by member bob failed".into(),
        };
        let raw = frame_error(&frame);
        assert_eq!(classify(&raw).unwrap(), Classified::Error(frame));
    }

    #[test]
    fn unsigned_error_frame() {
        let frame = ErrorFrame {
            signature: None,
            from: "carol".into(),
            severity: Severity::Warning,
            text: "packet dropped".into(),
        };
        let raw = frame_error(&frame);
        assert_eq!(classify(&raw).unwrap(), Classified::Error(frame));
    }

    #[test]
    fn signed_error_frame_verifies() {
        let signer = cv_crypto::sig::SigningKeyPair::generate();
        let frame = signed_error_frame(
            &signer,
            "dave",
            Severity::Terminal,
            "Session authentication by member eve failed",
        );
        let raw = frame_error(&frame);
        let parsed = match classify(&raw).unwrap() {
            Classified::Error(frame) => frame,
            other => panic!("misclassified: {other:?}"),
        };
        verify_error_frame(&parsed, &signer.public_bytes()).unwrap();

        let wrong = cv_crypto::sig::SigningKeyPair::generate();
        assert!(verify_error_frame(&parsed, &wrong.public_bytes()).is_err());
    }

    #[test]
    fn plaintext_passthrough() {
        assert_eq!(
            classify("hello there").unwrap(),
            Classified::Plaintext("hello there".into())
        );
        // A bare "?mpENC" without one of the known prefixes is also plaintext.
        assert_eq!(
            classify("?mpENC hello").unwrap(),
            Classified::Plaintext("?mpENC hello".into())
        );
    }
}
