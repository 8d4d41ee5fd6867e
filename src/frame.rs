//! Peer frame codec.
//!
//! Once a rendezvous succeeds, the peer socket carries length-prefixed
//! frames with a fixed 6-byte header:
//!
//! ```text
//! ┌──────────────┬────────────────┬─────────────────────────┐
//! │ Magic (4B)   │ Length (2B BE) │ Payload                 │
//! │ ODC2 / OFT2  │ header incl.   │ (opaque to this engine) │
//! └──────────────┴────────────────┴─────────────────────────┘
//! ```
//!
//! The magic identifies the capability: `ODC2` for direct messaging, `OFT2`
//! for file transfer. The length counts the header itself.

use std::collections::VecDeque;
use std::io::{self, Write};

use crate::error::FrameError;
use crate::session::Capability;

// ============================================================================
// Constants
// ============================================================================

/// Length of the frame header (4-byte magic + 2-byte length).
pub const HEADER_LEN: usize = 6;

/// Largest payload that fits in the 16-bit total-length field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - HEADER_LEN;

// ============================================================================
// Encoding
// ============================================================================

/// Encode one complete frame for the given capability.
pub fn encode_frame(capability: Capability, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let total = HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&capability.magic());
    buf.extend_from_slice(&(total as u16).to_be_bytes());
    buf.extend_from_slice(payload);

    Ok(buf)
}

// ============================================================================
// Read Path
// ============================================================================

/// A socket that can look at pending bytes without consuming them.
///
/// Implemented for `mio::net::TcpStream`; test code substitutes a scripted
/// fake so the read path can be exercised without sockets.
pub trait PeekRead {
    /// Copy pending bytes into `buf` without consuming them.
    fn peek_bytes(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Consume up to `buf.len()` bytes.
    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl PeekRead for mio::net::TcpStream {
    fn peek_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.peek(buf)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use std::io::Read;
        Read::read(self, buf)
    }
}

/// Outcome of one `read_frame` call.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete frame payload was assembled.
    Frame(Vec<u8>),
    /// The socket has no complete frame yet; wait for more readability.
    NeedMore,
    /// The remote side performed an orderly close (zero-byte read).
    Closed,
    /// The frame header did not carry the expected magic, or declared an
    /// impossible length.
    BadMagic,
}

/// Incremental assembly of one incoming frame.
///
/// The assembler peeks at the socket until a full 6-byte header is
/// available, consumes it, then accumulates exactly the declared payload
/// length before yielding the frame and resetting. Only framing is handled
/// here; payload bytes are opaque.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    /// Payload buffer sized to the declared length, present while a frame
    /// body is being accumulated.
    payload: Option<Vec<u8>>,
    /// Bytes of `payload` filled so far.
    filled: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        FrameAssembler::default()
    }

    /// Discard any partially assembled frame.
    pub fn reset(&mut self) {
        self.payload = None;
        self.filled = 0;
    }

    /// True while a frame body is partially accumulated.
    pub fn mid_frame(&self) -> bool {
        self.payload.is_some()
    }

    /// Drive the read path forward by at most one frame.
    ///
    /// Hard I/O errors other than `WouldBlock` are returned as `Err`; the
    /// caller maps them to a lost-connection teardown. `WouldBlock` is
    /// reported as `NeedMore`.
    pub fn read_frame<S: PeekRead>(
        &mut self,
        socket: &mut S,
        expected_magic: [u8; 4],
    ) -> io::Result<ReadOutcome> {
        // Start a new frame: peek at the first 6 bytes to get the length
        // without consuming a partial header.
        if self.payload.is_none() {
            let mut header = [0u8; HEADER_LEN];
            let n = match socket.peek_bytes(&mut header) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::NeedMore)
                }
                Err(e) => return Err(e),
            };

            if n < HEADER_LEN {
                return Ok(ReadOutcome::NeedMore);
            }

            // Consume the header for real.
            let mut consumed = [0u8; HEADER_LEN];
            match socket.read_bytes(&mut consumed) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) if n < HEADER_LEN => {
                    // The peek said six bytes were buffered, so a short read
                    // here means the socket went away underneath us.
                    return Ok(ReadOutcome::Closed);
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::NeedMore)
                }
                Err(e) => return Err(e),
            }

            if consumed[0..4] != expected_magic {
                log::warn!(
                    "expected frame magic {:02x?} but received {:02x?}",
                    expected_magic,
                    &consumed[0..4]
                );
                return Ok(ReadOutcome::BadMagic);
            }

            let total = u16::from_be_bytes([consumed[4], consumed[5]]) as usize;
            if total < HEADER_LEN {
                log::warn!("frame declares impossible length {}", total);
                return Ok(ReadOutcome::BadMagic);
            }

            self.payload = Some(vec![0u8; total - HEADER_LEN]);
            self.filled = 0;
        }

        // Accumulate payload bytes until the declared length is reached.
        loop {
            let buf = match self.payload.as_mut() {
                Some(buf) => buf,
                None => return Ok(ReadOutcome::NeedMore),
            };

            if self.filled == buf.len() {
                break;
            }

            match socket.read_bytes(&mut buf[self.filled..]) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::NeedMore)
                }
                Err(e) => return Err(e),
            }
        }

        let payload = self.payload.take().unwrap_or_default();
        self.filled = 0;
        Ok(ReadOutcome::Frame(payload))
    }
}

// ============================================================================
// Write Path
// ============================================================================

/// Unbounded outgoing byte queue, drained as the socket becomes writable.
#[derive(Debug, Default)]
pub struct WriteQueue {
    buf: VecDeque<u8>,
}

impl WriteQueue {
    pub fn new() -> Self {
        WriteQueue::default()
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Write as many queued bytes as the socket will accept.
    ///
    /// Returns the number of bytes written. `WouldBlock` stops the drain
    /// without error; any other error is returned to the caller.
    pub fn drain<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut written = 0;

        while !self.buf.is_empty() {
            let (front, _) = self.buf.as_slices();
            match w.write(front) {
                Ok(0) => break,
                Ok(n) => {
                    self.buf.drain(..n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }
}

// ============================================================================
// Tests
// ============================================================================
