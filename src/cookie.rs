//! Session cookies.
//!
//! An 8-byte opaque value chosen by the initiator of a rendezvous. The
//! cookie is the sole correlation key for every control message and peer
//! frame belonging to one session, and never changes after creation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Length of a session cookie in bytes.
pub const COOKIE_LEN: usize = 8;

/// An opaque 8-byte rendezvous session cookie.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    /// Generate a fresh random cookie using a CSPRNG.
    pub fn generate() -> Self {
        use ring::rand::{SecureRandom, SystemRandom};
        let rng = SystemRandom::new();
        let mut buf = [0u8; COOKIE_LEN];
        rng.fill(&mut buf).expect("SystemRandom failed");
        Cookie(buf)
    }

    /// Wrap raw cookie bytes received from the remote side.
    pub fn from_bytes(bytes: [u8; COOKIE_LEN]) -> Self {
        Cookie(bytes)
    }

    /// Borrow the raw cookie bytes.
    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }

    /// Compare this cookie against a raw byte slice, e.g. the payload of a
    /// verification frame. Slices of the wrong length never match.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() == COOKIE_LEN && bytes == self.0
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// Debug prints the same hex form as Display; a derived Debug would put an
// array of decimal bytes into every log line.
impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique() {
        let a = Cookie::generate();
        let b = Cookie::generate();
        assert_ne!(a, b, "consecutive CSPRNG cookies should differ");
    }

    #[test]
    fn test_display_hex() {
        let cookie = Cookie::from_bytes([0x00, 0x01, 0xab, 0xcd, 0xef, 0x10, 0x20, 0xff]);
        assert_eq!(format!("{}", cookie), "0001abcdef1020ff");
    }

    #[test]
    fn test_matches() {
        let cookie = Cookie::from_bytes(*b"ABCDEFGH");
        assert!(cookie.matches(b"ABCDEFGH"));
        assert!(!cookie.matches(b"ABCDEFGX"));
        assert!(!cookie.matches(b"ABCDEFG"));
        assert!(!cookie.matches(b"ABCDEFGHI"));
    }
}
