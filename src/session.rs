//! Peer session entity.
//!
//! A [`PeerSession`] is one rendezvous attempt with one remote identity:
//! negotiation flags, candidate addresses, sockets, buffers, and timers.
//! Each session exclusively owns its descriptors; the registry only indexes
//! them. State transitions are driven by [`crate::negotiate`] and executed
//! by [`crate::engine`].

use std::fmt;
use std::net::IpAddr;
use std::time::Instant;

use mio::net::{TcpListener, TcpStream};
use mio::Token;
use serde::{Deserialize, Serialize};

use crate::cookie::Cookie;
use crate::error::DisconnectReason;
use crate::frame::{FrameAssembler, WriteQueue};
use crate::negotiate::NegotiationState;
use crate::relay::RelayHandshake;

// ============================================================================
// Capability
// ============================================================================

/// The payload kind carried over a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Interactive direct messaging ("ODC2" frames).
    DirectMessage,
    /// Bulk file transfer ("OFT2" frames).
    FileTransfer,
}

impl Capability {
    /// Frame magic expected on every frame of this capability.
    pub fn magic(self) -> [u8; 4] {
        match self {
            Capability::DirectMessage => *b"ODC2",
            Capability::FileTransfer => *b"OFT2",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::DirectMessage => write!(f, "direct-message"),
            Capability::FileTransfer => write!(f, "file-transfer"),
        }
    }
}

// ============================================================================
// File Info
// ============================================================================

/// Mandatory metadata accompanying a file-transfer proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub total_size: u64,
    pub file_count: u32,
}

impl FileInfo {
    /// A proposal with a missing name, zero size, or zero files is
    /// malformed and rejected before any session is created.
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && self.total_size > 0 && self.file_count > 0
    }
}

// ============================================================================
// Peer Session
// ============================================================================

/// One rendezvous session with a remote peer.
pub struct PeerSession {
    /// Engine-internal identifier, stable for the session's lifetime.
    pub(crate) id: u64,
    /// Opaque account-relative handle of the remote participant.
    pub peer: String,
    pub capability: Capability,
    /// Correlation key for every control message and frame of this session.
    /// Never changes after creation.
    pub cookie: Cookie,

    pub(crate) state: NegotiationState,

    // Negotiation flags.
    pub(crate) tried_direct: bool,
    pub(crate) tried_incoming: bool,
    pub(crate) tried_relay: bool,
    /// The connected peer has not proven its identity yet and must present
    /// the session cookie before any payload is accepted.
    pub(crate) is_incoming: bool,
    pub(crate) initiated_locally: bool,
    /// The local user approved this session (immediately true for locally
    /// initiated sessions, set by `accept_proposal` for inbound ones).
    pub(crate) approved: bool,

    // Candidate addresses.
    pub(crate) verified_ip: Option<IpAddr>,
    pub(crate) client_ip: Option<IpAddr>,
    pub(crate) relay_ip: Option<IpAddr>,
    pub(crate) relay_port: Option<u16>,
    pub(crate) port: u16,
    pub(crate) use_relay: bool,

    /// Monotonic counter carried on proposals so the remote side can
    /// discard stale re-proposals.
    pub(crate) request_number: u32,

    // I/O owned by this session. At most one of `listener`/`stream` is
    // open at any instant; the connect slots are only occupied during
    // TRY_DIRECT / TRY_PROXY.
    pub(crate) listener: Option<(Token, TcpListener)>,
    pub(crate) stream: Option<(Token, TcpStream)>,
    pub(crate) connect_verified: Option<(Token, TcpStream)>,
    pub(crate) connect_client: Option<(Token, TcpStream)>,
    pub(crate) connect_timer: Option<Token>,
    pub(crate) relay_handshake: Option<RelayHandshake>,
    pub(crate) write_armed: bool,

    // Buffers.
    pub(crate) assembler: FrameAssembler,
    pub(crate) outgoing: WriteQueue,

    /// True once the post-connect cookie check completed and payload may
    /// flow in both directions.
    pub ready: bool,
    pub(crate) last_activity: Instant,

    /// Link to the application-level transfer (file-transfer sessions).
    pub file: Option<FileInfo>,
}

impl PeerSession {
    pub(crate) fn new(id: u64, capability: Capability, peer: &str, cookie: Cookie) -> Self {
        PeerSession {
            id,
            peer: peer.to_string(),
            capability,
            cookie,
            state: NegotiationState::New,
            tried_direct: false,
            tried_incoming: false,
            tried_relay: false,
            is_incoming: false,
            initiated_locally: false,
            approved: false,
            verified_ip: None,
            client_ip: None,
            relay_ip: None,
            relay_port: None,
            port: 0,
            use_relay: false,
            request_number: 0,
            listener: None,
            stream: None,
            connect_verified: None,
            connect_client: None,
            connect_timer: None,
            relay_handshake: None,
            write_armed: false,
            assembler: FrameAssembler::new(),
            outgoing: WriteQueue::new(),
            ready: false,
            last_activity: Instant::now(),
            file: None,
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True while a direct or relay connect attempt is in flight.
    pub(crate) fn connect_pending(&self) -> bool {
        self.connect_verified.is_some() || self.connect_client.is_some()
    }

    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("capability", &self.capability)
            .field("cookie", &self.cookie)
            .field("state", &self.state)
            .field("ready", &self.ready)
            .finish()
    }
}

/// The terminal outcome chosen when a session is torn down, carried from
/// the decision point to the deferred destruction step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Keep,
    Destroy(DisconnectReason),
}
