//! Length-prefixed message framing.
//!
//! Each message travels in a frame: a 4-byte little-endian payload length,
//! the payload, then zero padding so that the whole frame is a multiple of 8
//! bytes. A zero-length payload is legal (an 8-byte all-zero frame). Frames
//! larger than [`MAX_FRAME_LEN`] are a fatal protocol error.
//!
//! The codec here is synchronous and owns no I/O; the daemon's connection
//! pump feeds socket reads into a [`FrameDecoder`] and writes out buffers
//! produced by [`encode_frame`].

use thiserror::Error;

/// Frames are padded to multiples of this.
pub const FRAME_ALIGNMENT: usize = 8;

/// Maximum total frame length (prefix + payload + padding).
pub const MAX_FRAME_LEN: usize = 32768;

/// Maximum payload length that still fits in a maximum-size frame.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - LENGTH_PREFIX_LEN;

const LENGTH_PREFIX_LEN: usize = 4;

const INITIAL_BUF_LEN: usize = 1024;

/// Rounds `n` up to the next multiple of [`FRAME_ALIGNMENT`].
#[inline]
pub const fn round_up_to_alignment(n: usize) -> usize {
    (n + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// An inbound frame announced a length beyond the cap.
    #[error("frame length {len} exceeds maximum {MAX_FRAME_LEN}")]
    TooLong { len: usize },
    /// The peer closed the stream in the middle of a frame.
    #[error("end of stream inside a message frame")]
    EofInMessage,
    /// An outbound payload cannot fit in a frame.
    #[error("payload length {len} exceeds maximum {MAX_PAYLOAD_LEN}")]
    PayloadTooLong { len: usize },
}

/// Encodes one payload as a complete padded frame.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLong { len: payload.len() });
    }
    let frame_len = round_up_to_alignment(LENGTH_PREFIX_LEN + payload.len());
    let mut frame = Vec::with_capacity(frame_len);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.resize(frame_len, 0);
    Ok(frame)
}

/// Incremental frame reader over a byte stream.
///
/// The decoder owns a growable buffer: initially 1 KiB, grown by 1.5x (and to
/// at least the next frame's size) up to the [`MAX_FRAME_LEN`] cap, never
/// larger. Usage is a read loop: obtain the writable tail with
/// [`read_buf`](Self::read_buf), read transport bytes into it, record them
/// with [`advance`](Self::advance), then drain complete frames with
/// [`next_frame`](Self::next_frame). Any trailing partial frame is moved to
/// the front of the buffer by the next `read_buf` call.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    filled: usize,
    pos: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: vec![0; INITIAL_BUF_LEN],
            filled: 0,
            pos: 0,
        }
    }

    /// Total frame length implied by the buffered length prefix, if at least
    /// the prefix has arrived.
    fn pending_frame_len(&self) -> Option<usize> {
        let avail = &self.buf[self.pos..self.filled];
        if avail.len() < LENGTH_PREFIX_LEN {
            return None;
        }
        let payload_len = u32::from_le_bytes(avail[..LENGTH_PREFIX_LEN].try_into().unwrap()) as usize;
        Some(round_up_to_alignment(LENGTH_PREFIX_LEN + payload_len))
    }

    /// Extracts the next complete frame's payload, or `Ok(None)` if more
    /// bytes are needed first.
    pub fn next_frame(&mut self) -> Result<Option<&[u8]>, FrameError> {
        let Some(frame_len) = self.pending_frame_len() else {
            return Ok(None);
        };
        if frame_len > MAX_FRAME_LEN {
            return Err(FrameError::TooLong { len: frame_len });
        }
        if self.filled - self.pos < frame_len {
            return Ok(None);
        }
        let payload_len = u32::from_le_bytes(
            self.buf[self.pos..self.pos + LENGTH_PREFIX_LEN]
                .try_into()
                .unwrap(),
        ) as usize;
        let start = self.pos + LENGTH_PREFIX_LEN;
        self.pos += frame_len;
        Ok(Some(&self.buf[start..start + payload_len]))
    }

    /// Moves any partial frame to the front, grows the buffer if the pending
    /// frame needs it, and returns the writable tail for the next read.
    pub fn read_buf(&mut self) -> &mut [u8] {
        if self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }
        // Ensure the rest of any partial frame will fit on the next read.
        // Grow to at least 1.5x to keep resizing infrequent.
        if let Some(frame_len) = self.pending_frame_len() {
            if frame_len > self.buf.len() && frame_len <= MAX_FRAME_LEN {
                let target = frame_len.max((3 * self.buf.len() / 2).min(MAX_FRAME_LEN));
                self.buf.resize(target, 0);
            }
        }
        &mut self.buf[self.filled..]
    }

    /// Records that `n` bytes were read into the slice returned by
    /// [`read_buf`](Self::read_buf).
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.buf.len());
        self.filled += n;
    }

    /// True if a partial frame is buffered; end of stream in this state is
    /// [`FrameError::EofInMessage`].
    pub fn has_partial(&self) -> bool {
        self.filled > self.pos
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
