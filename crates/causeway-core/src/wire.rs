//! Causeway wire format — typed frames for all server-to-server traffic.
//!
//! These types ARE the protocol. A frame is one newline-delimited JSON
//! object on the stream; the `kind` tag selects the variant. Changing a
//! field name here is a breaking change for every federated peer.
//!
//! Frames carry variable-length domain strings, so the encoding is serde
//! JSON rather than a fixed binary layout.

use serde::{Deserialize, Serialize};

/// Base namespace every opening declaration must carry.
/// A peer declaring anything else is rejected with a terminal error frame.
pub const NAMESPACE: &str = "causeway:server";

/// Maximum accepted length of one encoded frame, in bytes.
/// A line longer than this is treated as a protocol violation.
pub const MAX_FRAME_BYTES: usize = 65536;

// ── Opening declaration ───────────────────────────────────────────────────────

/// The first frame on any transport, sent once in each direction.
///
/// `dialback` advertises support for the verification protocol; a peer
/// that leaves it false is a legacy peer, trusted on connectivity alone
/// (if configuration allows it at all). The accepting side stamps `id`
/// with a freshly generated correlation id that doubles as the challenge
/// nonce for every trust claim made on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeader {
    /// Must equal [`NAMESPACE`].
    pub ns: String,
    /// Origin domain the opener claims to speak for. Informational on the
    /// accepting side until a trust claim is verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Peer supports the trust-claim / verification protocol.
    #[serde(default)]
    pub dialback: bool,
    /// Correlation id / challenge nonce, set by the accepting side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StreamHeader {
    /// Header sent by the connecting side, announcing an origin domain.
    pub fn opening(origin: &str) -> Self {
        Self {
            ns: NAMESPACE.to_string(),
            from: Some(origin.to_string()),
            dialback: true,
            id: None,
        }
    }

    /// Header sent by the accepting side, carrying the challenge id.
    pub fn accepting(dialback: bool, id: Option<String>) -> Self {
        Self {
            ns: NAMESPACE.to_string(),
            from: None,
            dialback,
            id,
        }
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// One protocol frame. Every message after the opening declaration is one
/// of these; `Header` itself is the declaration so that a transport speaks
/// a single uniform framing from the first byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Opening declaration, once per transport per direction.
    Header(StreamHeader),

    /// Trust claim: "I am `from`, prove it with this response value."
    /// Sent claimant → verifier on the claimant's outbound stream.
    Claim { to: String, from: String, key: String },

    /// Final answer to a trust claim, verifier → claimant, on the stream
    /// the claim arrived on.
    ClaimResult { to: String, from: String, valid: bool },

    /// Verification challenge, verifier → claimed origin, routed over a
    /// separate connection trusted to the origin's own address.
    Verify {
        to: String,
        from: String,
        id: String,
        key: String,
    },

    /// Answer to a verification challenge, origin → verifier, on the
    /// stream the challenge arrived on. Payload stripped; only validity
    /// survives.
    VerifyResult {
        to: String,
        from: String,
        id: String,
        valid: bool,
    },

    /// Application data. Opaque to this core beyond address validation.
    Packet {
        to: String,
        from: String,
        payload: serde_json::Value,
    },

    /// Terminal protocol-error notice. The sender closes after writing it.
    Error { text: String },
}

impl Frame {
    /// Encode as one wire line (no trailing newline).
    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }

    /// Decode one wire line.
    pub fn decode(line: &str) -> Result<Self, WireError> {
        if line.len() > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge(line.len()));
        }
        serde_json::from_str(line).map_err(WireError::Decode)
    }
}

// ── Dispatch envelope ─────────────────────────────────────────────────────────

/// A frame plus the routing addresses the delivery subsystem saw.
///
/// The envelope `from` can differ from the frame's own origin: a
/// verification request travels with the server's own id as the apparent
/// sender so dispatch can recognize it and restore the true origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub to: String,
    pub from: String,
    pub frame: Frame,
}

impl Envelope {
    pub fn packet(to: &str, from: &str, payload: serde_json::Value) -> Self {
        Self {
            to: to.to_string(),
            from: from.to_string(),
            frame: Frame::Packet {
                to: to.to_string(),
                from: from.to_string(),
                payload,
            },
        }
    }
}

// ── Addresses ─────────────────────────────────────────────────────────────────

/// Extract the domain part of an address (`user@domain` or bare `domain`).
///
/// Returns None for anything malformed — empty domain, embedded
/// whitespace, or a resource separator. Malformed addresses on an
/// untrusted stream are fatal for that stream.
pub fn domain_of(addr: &str) -> Option<&str> {
    let domain = addr.rsplit('@').next().unwrap_or(addr);
    if domain.is_empty()
        || addr.ends_with('@')
        || domain.contains(|c: char| c.is_whitespace() || c == '/')
    {
        return None;
    }
    Some(domain)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("frame of {0} bytes exceeds maximum {MAX_FRAME_BYTES}")]
    FrameTooLarge(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
