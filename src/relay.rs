//! Relay session setup.
//!
//! When neither side can accept a direct connection, both parties connect
//! to a relay rendezvous server. The relay's own protocol is a black box to
//! this engine except for the short setup exchange that binds the TCP
//! connection to a session: we announce the cookie and our role, and the
//! relay answers READY once both legs are joined. Only then does the
//! connection count as established and normal peer frames begin.
//!
//! ```text
//! setup:  ┌────────────────┬────────────┬──────────┬─────────────┐
//!         │ Length (2B BE) │ SETUP (2B) │ Role (1B)│ Cookie (8B) │
//!         └────────────────┴────────────┴──────────┴─────────────┘
//! ready:  ┌────────────────┬────────────┐
//!         │ Length (2B BE) │ READY (2B) │
//!         └────────────────┴────────────┘
//! ```
//!
//! Length counts the bytes after the length field itself.

use crate::cookie::{Cookie, COOKIE_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Command word of the setup packet.
pub const CMD_SETUP: u16 = 0x0002;

/// Command word of the relay's ready acknowledgement.
pub const CMD_READY: u16 = 0x0005;

const LEN_FIELD: usize = 2;
const SETUP_BODY: usize = 2 + 1 + COOKIE_LEN;

/// Which end of the transfer this connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    /// The party that initiated the rendezvous.
    Initiator = 1,
    /// The party that was invited.
    Receiver = 2,
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode the setup packet announcing cookie and role to the relay.
pub fn encode_setup(cookie: &Cookie, role: RelayRole) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LEN_FIELD + SETUP_BODY);
    buf.extend_from_slice(&(SETUP_BODY as u16).to_be_bytes());
    buf.extend_from_slice(&CMD_SETUP.to_be_bytes());
    buf.push(role as u8);
    buf.extend_from_slice(cookie.as_bytes());
    buf
}

/// Parse a setup packet body (length field already stripped). Used by tests
/// standing in for the relay.
pub fn parse_setup(body: &[u8]) -> Option<(RelayRole, Cookie)> {
    if body.len() != SETUP_BODY {
        return None;
    }
    if u16::from_be_bytes([body[0], body[1]]) != CMD_SETUP {
        return None;
    }
    let role = match body[2] {
        1 => RelayRole::Initiator,
        2 => RelayRole::Receiver,
        _ => return None,
    };
    let mut cookie = [0u8; COOKIE_LEN];
    cookie.copy_from_slice(&body[3..3 + COOKIE_LEN]);
    Some((role, Cookie::from_bytes(cookie)))
}

/// Total on-wire length of the relay message starting at `peeked`, once
/// enough bytes are buffered to read the length prefix.
pub fn message_len(peeked: &[u8]) -> Option<usize> {
    if peeked.len() < LEN_FIELD {
        return None;
    }
    Some(LEN_FIELD + u16::from_be_bytes([peeked[0], peeked[1]]) as usize)
}

/// Encode the READY acknowledgement a relay sends once both legs joined.
pub fn encode_ready() -> Vec<u8> {
    let mut buf = Vec::with_capacity(LEN_FIELD + 2);
    buf.extend_from_slice(&2u16.to_be_bytes());
    buf.extend_from_slice(&CMD_READY.to_be_bytes());
    buf
}

// ============================================================================
// Handshake State
// ============================================================================

/// Outcome of feeding bytes into the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayProgress {
    /// Waiting for more bytes from the relay.
    Pending,
    /// The relay acknowledged; the connection is established.
    Ready,
    /// The relay sent something other than a READY acknowledgement.
    Failed,
}

/// Accumulates relay bytes until the READY acknowledgement arrives.
///
/// Alive only between the relay TCP connect and session establishment;
/// destroyed along with the attempt on any failure.
#[derive(Debug, Default)]
pub struct RelayHandshake {
    buf: Vec<u8>,
}

impl RelayHandshake {
    pub fn new() -> Self {
        RelayHandshake::default()
    }

    /// Feed bytes received from the relay socket.
    pub fn on_bytes(&mut self, data: &[u8]) -> RelayProgress {
        self.buf.extend_from_slice(data);

        if self.buf.len() < LEN_FIELD {
            return RelayProgress::Pending;
        }

        let body_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if body_len < 2 {
            return RelayProgress::Failed;
        }
        if self.buf.len() < LEN_FIELD + body_len {
            return RelayProgress::Pending;
        }

        let cmd = u16::from_be_bytes([self.buf[2], self.buf[3]]);
        if cmd == CMD_READY {
            RelayProgress::Ready
        } else {
            log::warn!("relay answered with command {:#06x}, expected READY", cmd);
            RelayProgress::Failed
        }
    }
}
