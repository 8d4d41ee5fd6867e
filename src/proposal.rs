//! Rendezvous control messages.
//!
//! Before any peer socket exists, the two participants negotiate over the
//! already-authenticated server channel. This module defines the proposal
//! message exchanged there and its length-prefixed encoding:
//!
//! ```text
//! ┌─────────────┬─────────────────────────────────┐
//! │ Length (4B) │ Payload (bincode-encoded)       │
//! └─────────────┴─────────────────────────────────┘
//! ```
//!
//! The control channel itself is a collaborator; the engine only produces
//! and consumes these messages through the [`ControlChannel`] seam.

use std::io;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::cookie::Cookie;
use crate::error::ProposalError;
use crate::session::{Capability, FileInfo};

// ============================================================================
// Constants
// ============================================================================

/// Maximum encoded proposal size (file names included, 64 KB is plenty).
pub const MAX_MESSAGE_SIZE: u32 = 65536;

/// Length of the message header (4 bytes for length).
pub const HEADER_LEN: usize = 4;

// ============================================================================
// Message Types
// ============================================================================

/// Rendezvous status carried on every control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RendezvousStatus {
    /// "Please connect to me" / "try these candidates instead".
    Propose,
    /// The sender is abandoning or refusing the session.
    Cancel,
    /// The sender connected successfully; stop proposing alternatives.
    Connected,
}

/// One rendezvous control message, correlated to a session by its cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub cookie: Cookie,
    pub capability: Capability,
    pub status: RendezvousStatus,

    /// Candidate address observed by the server (presence data).
    pub verified_ip: Option<IpAddr>,
    /// Candidate address reported by the remote client itself.
    pub client_ip: Option<IpAddr>,
    pub port: u16,

    /// Relay rendezvous point, when the sender wants a relayed session.
    pub relay_ip: Option<IpAddr>,
    pub relay_port: Option<u16>,
    pub use_relay: bool,

    /// Monotonically increasing per-session counter; receivers discard
    /// proposals that do not advance it.
    pub request_number: u32,

    /// Mandatory for file-transfer proposals, absent otherwise.
    pub file: Option<FileInfo>,
}

impl Proposal {
    /// Build a "connect to me at addr:port" proposal.
    pub fn listening(
        cookie: Cookie,
        capability: Capability,
        local_ip: IpAddr,
        port: u16,
        request_number: u32,
        file: Option<FileInfo>,
    ) -> Self {
        Proposal {
            cookie,
            capability,
            status: RendezvousStatus::Propose,
            verified_ip: Some(local_ip),
            client_ip: Some(local_ip),
            port,
            relay_ip: None,
            relay_port: None,
            use_relay: false,
            request_number,
            file,
        }
    }

    /// Build a "meet me at this relay" proposal.
    pub fn relay(
        cookie: Cookie,
        capability: Capability,
        relay: std::net::SocketAddr,
        request_number: u32,
        file: Option<FileInfo>,
    ) -> Self {
        Proposal {
            cookie,
            capability,
            status: RendezvousStatus::Propose,
            verified_ip: None,
            client_ip: None,
            port: 0,
            relay_ip: Some(relay.ip()),
            relay_port: Some(relay.port()),
            use_relay: true,
            request_number,
            file,
        }
    }

    /// Build a cancellation for the given session.
    pub fn cancel(cookie: Cookie, capability: Capability) -> Self {
        Proposal {
            cookie,
            capability,
            status: RendezvousStatus::Cancel,
            verified_ip: None,
            client_ip: None,
            port: 0,
            relay_ip: None,
            relay_port: None,
            use_relay: false,
            request_number: 0,
            file: None,
        }
    }

    /// Build a "we are connected" notification.
    pub fn connected(cookie: Cookie, capability: Capability) -> Self {
        Proposal {
            status: RendezvousStatus::Connected,
            ..Proposal::cancel(cookie, capability)
        }
    }

    /// Validate mandatory fields.
    ///
    /// A file-transfer proposal without complete file metadata is rejected
    /// before any session is created for it.
    pub fn validate(&self) -> Result<(), ProposalError> {
        if self.capability == Capability::FileTransfer
            && self.status == RendezvousStatus::Propose
        {
            match &self.file {
                Some(info) if info.is_complete() => {}
                _ => return Err(ProposalError::IncompleteFileInfo),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Encoding / Decoding
// ============================================================================

/// Encode a proposal with a 4-byte big-endian length prefix.
pub fn encode_proposal(proposal: &Proposal) -> Result<Vec<u8>, ProposalError> {
    let payload =
        bincode::serialize(proposal).map_err(|e| ProposalError::Codec(e.to_string()))?;

    if payload.len() > MAX_MESSAGE_SIZE as usize {
        return Err(ProposalError::MessageTooLarge(payload.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);

    Ok(buf)
}

/// Decode a proposal from a length-prefixed buffer.
///
/// Returns the message and the number of bytes consumed.
pub fn decode_proposal(buf: &[u8]) -> Result<(Proposal, usize), ProposalError> {
    if buf.len() < HEADER_LEN {
        return Err(ProposalError::Incomplete(HEADER_LEN - buf.len()));
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE as usize {
        return Err(ProposalError::MessageTooLarge(length));
    }

    let total_len = HEADER_LEN + length;
    if buf.len() < total_len {
        return Err(ProposalError::Incomplete(total_len - buf.len()));
    }

    let proposal = bincode::deserialize(&buf[HEADER_LEN..total_len])
        .map_err(|e| ProposalError::Codec(e.to_string()))?;

    Ok((proposal, total_len))
}

// ============================================================================
// Control Channel Seam
// ============================================================================

/// The authenticated server channel used to deliver rendezvous messages.
///
/// Shared infrastructure multiplexed by many sessions; the engine sends
/// through it but never manages its lifecycle. Inbound messages are fed to
/// the engine via `RendezvousEngine::handle_control_message`.
pub trait ControlChannel {
    fn send(&mut self, to: &str, proposal: &Proposal) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_file() -> FileInfo {
        FileInfo {
            name: "archive.tar".to_string(),
            total_size: 4096,
            file_count: 3,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let proposal = Proposal::listening(
            Cookie::from_bytes(*b"12345678"),
            Capability::FileTransfer,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)),
            5190,
            1,
            Some(sample_file()),
        );

        let encoded = encode_proposal(&proposal).unwrap();
        let (decoded, consumed) = decode_proposal(&encoded).unwrap();

        assert_eq!(decoded, proposal);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_decode_incomplete() {
        let proposal =
            Proposal::cancel(Cookie::from_bytes(*b"12345678"), Capability::DirectMessage);
        let encoded = encode_proposal(&proposal).unwrap();

        assert!(matches!(
            decode_proposal(&encoded[..2]),
            Err(ProposalError::Incomplete(_))
        ));
        assert!(matches!(
            decode_proposal(&encoded[..encoded.len() - 1]),
            Err(ProposalError::Incomplete(_))
        ));
    }

    #[test]
    fn test_decode_oversized_length() {
        let header = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        assert!(matches!(
            decode_proposal(&header),
            Err(ProposalError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_validate_file_transfer_requires_metadata() {
        let mut proposal = Proposal::listening(
            Cookie::from_bytes(*b"12345678"),
            Capability::FileTransfer,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            5190,
            1,
            None,
        );
        assert_eq!(proposal.validate(), Err(ProposalError::IncompleteFileInfo));

        proposal.file = Some(FileInfo {
            name: String::new(),
            total_size: 10,
            file_count: 1,
        });
        assert_eq!(proposal.validate(), Err(ProposalError::IncompleteFileInfo));

        proposal.file = Some(sample_file());
        assert_eq!(proposal.validate(), Ok(()));
    }

    #[test]
    fn test_validate_direct_message_needs_no_file() {
        let proposal = Proposal::listening(
            Cookie::from_bytes(*b"12345678"),
            Capability::DirectMessage,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            5190,
            1,
            None,
        );
        assert_eq!(proposal.validate(), Ok(()));
    }

    #[test]
    fn test_validate_cancel_skips_file_check() {
        // A cancel for a file transfer carries no metadata and is fine.
        let proposal =
            Proposal::cancel(Cookie::from_bytes(*b"12345678"), Capability::FileTransfer);
        assert_eq!(proposal.validate(), Ok(()));
    }
}
