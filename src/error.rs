//! Error and disconnect-reason types for the rendezvous engine.

use std::fmt;

// ============================================================================
// Disconnect Reasons
// ============================================================================

/// Terminal outcome reported to the application when a peer session ends.
///
/// Transport-level failures during negotiation are absorbed by the fallback
/// sequence and never surface individually; only one of these reasons is
/// ever delivered per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the established connection (orderly shutdown).
    RemoteClosed,
    /// The remote side refused or cancelled the rendezvous.
    RemoteRefused,
    /// The connection dropped with a hard socket error.
    LostConnection,
    /// The remote side sent data that violates the peer protocol
    /// (bad frame magic, cookie mismatch).
    InvalidData,
    /// The local side closed or rejected the session.
    LocalClosed,
    /// Every connection strategy was exhausted without success.
    CouldNotConnect,
    /// A stale session was torn down to make room for a new attempt
    /// with the same peer.
    Retrying,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::RemoteClosed => write!(f, "remote closed"),
            DisconnectReason::RemoteRefused => write!(f, "remote refused"),
            DisconnectReason::LostConnection => write!(f, "lost connection"),
            DisconnectReason::InvalidData => write!(f, "invalid data"),
            DisconnectReason::LocalClosed => write!(f, "local closed"),
            DisconnectReason::CouldNotConnect => write!(f, "could not connect"),
            DisconnectReason::Retrying => write!(f, "retrying"),
        }
    }
}

// ============================================================================
// Frame Errors
// ============================================================================

/// Errors that can occur when building an outgoing peer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload does not fit in the 16-bit length field.
    PayloadTooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::PayloadTooLarge(size) => {
                write!(f, "frame payload too large: {} bytes", size)
            }
        }
    }
}

impl std::error::Error for FrameError {}

// ============================================================================
// Proposal Errors
// ============================================================================

/// Errors raised while validating or decoding a rendezvous proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalError {
    /// A file-transfer proposal is missing its name, size, or file count.
    IncompleteFileInfo,
    /// Not enough bytes yet to decode a complete message (need N more).
    Incomplete(usize),
    /// The encoded message exceeds the maximum allowed size.
    MessageTooLarge(usize),
    /// Serialization or deserialization failed.
    Codec(String),
}

impl fmt::Display for ProposalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalError::IncompleteFileInfo => {
                write!(f, "file-transfer proposal with incomplete file information")
            }
            ProposalError::Incomplete(needed) => {
                write!(f, "incomplete message, need {} more bytes", needed)
            }
            ProposalError::MessageTooLarge(size) => {
                write!(f, "message too large: {} bytes", size)
            }
            ProposalError::Codec(e) => write!(f, "codec error: {}", e),
        }
    }
}

impl std::error::Error for ProposalError {}

// ============================================================================
// Send Errors
// ============================================================================

/// Errors returned from `RendezvousEngine::send_frame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No session with the given cookie exists.
    UnknownSession,
    /// The session has not finished its post-connect handshake.
    NotReady,
    /// The payload does not fit in a single frame.
    Frame(FrameError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::UnknownSession => write!(f, "unknown session"),
            SendError::NotReady => write!(f, "session not ready"),
            SendError::Frame(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<FrameError> for SendError {
    fn from(e: FrameError) -> Self {
        SendError::Frame(e)
    }
}
