//! Cuts single SML transmissions out of the meter's byte stream.
//!
//! Incoming bytes are kept as a lowercase hex string, which is also the
//! representation the OBIS decoder works on. Nothing in here interprets the
//! payload; it only looks for the escape sequences framing a transmission.

use crate::byte_source::{ByteSource, TransportError};
use std::fmt;
use std::time::{Duration, Instant};

/// Escape sequence followed by the version 1 marker, opens every transmission
pub const START_DELIMITER: &str = "1b1b1b1b01010101";
/// Escape sequence followed by 0x1a, closes every transmission
pub const END_DELIMITER: &str = "1b1b1b1b1a";
/// Hex characters from the first end delimiter byte to the end of the frame:
/// the 5 delimiter bytes, the fill byte count and the 2 byte CRC
const END_TAIL_LEN: usize = 16;

/// One complete SML transmission, start delimiter through CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// Lowercase hex of even length, only ever built from received bytes or
    /// input that passed `hex::decode`, so it always decodes
    hex: String,
}

impl RawFrame {
    /// Builds a frame from a hex dump as written by [`crate::read_validator::FileDumpSink`].
    /// Whitespace is ignored so hand-formatted captures can be used as well.
    pub fn from_hex(dump: &str) -> Result<Self, hex::FromHexError> {
        let hex: String = dump
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        hex::decode(&hex)?;
        Ok(Self { hex })
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        hex::decode(&self.hex).unwrap_or_default()
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.hex.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.hex.is_empty()
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// Result of waiting for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleOutcome {
    Frame(RawFrame),
    /// The time budget ran out before a complete frame was buffered
    Incomplete,
}

/// Growing hex buffer holding at most one frame in progress
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: String,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns the frame if it is now complete.
    /// Bytes in front of the start delimiter are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Option<RawFrame> {
        self.buffer.push_str(&hex::encode(chunk));
        self.try_extract()
    }

    /// Currently buffered data as hex
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn try_extract(&mut self) -> Option<RawFrame> {
        let Some(start) = find_aligned(&self.buffer, START_DELIMITER, 0) else {
            // Keep a possibly split start delimiter, drop the rest
            let keep_from = self
                .buffer
                .len()
                .saturating_sub(START_DELIMITER.len() - 2);
            self.buffer.drain(..keep_from);
            return None;
        };
        self.buffer.drain(..start);

        let mut end = find_aligned(&self.buffer, END_DELIMITER, START_DELIMITER.len())?;

        // A transmission that lost its end is superseded by a newer start
        if let Some(restart) =
            rfind_aligned(&self.buffer[..end], START_DELIMITER, START_DELIMITER.len())
        {
            self.buffer.drain(..restart);
            end -= restart;
        }

        if self.buffer.len() < end + END_TAIL_LEN {
            return None;
        }
        let hex: String = self.buffer.drain(..end + END_TAIL_LEN).collect();
        Some(RawFrame { hex })
    }
}

/// Reads from a [`ByteSource`] until one frame is complete or the time budget is used up
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    chunk_timeout: Duration,
}

impl FrameAssembler {
    /// `chunk_timeout` caps how long a single read may block
    pub fn new(chunk_timeout: Duration) -> Self {
        Self { chunk_timeout }
    }

    /// Waits for one complete frame.
    ///
    /// Every call starts from an empty buffer. The elapsed time is checked
    /// before each read, so the budget can be overrun by at most one read
    /// timeout. Transport failures are passed on to the caller.
    pub fn assemble<S: ByteSource + ?Sized>(
        &self,
        source: &mut S,
        time_budget: Duration,
    ) -> Result<AssembleOutcome, TransportError> {
        let started = Instant::now();
        let mut buffer = FrameBuffer::new();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= time_budget {
                return Ok(AssembleOutcome::Incomplete);
            }
            let timeout = (time_budget - elapsed).min(self.chunk_timeout);

            let chunk = source.read_chunk(timeout)?;
            if chunk.is_empty() {
                continue;
            }
            if let Some(frame) = buffer.push(&chunk) {
                return Ok(AssembleOutcome::Frame(frame));
            }
        }
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

/// Finds `needle` in `haystack` at a byte boundary (even hex offset) at or after `from`
pub(crate) fn find_aligned(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if hay.len() < needle.len() {
        return None;
    }
    (from + from % 2..=hay.len() - needle.len())
        .step_by(2)
        .find(|&i| &hay[i..i + needle.len()] == needle)
}

fn rfind_aligned(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let needle = needle.as_bytes();
    if hay.len() < needle.len() {
        return None;
    }
    (from + from % 2..=hay.len() - needle.len())
        .step_by(2)
        .filter(|&i| &hay[i..i + needle.len()] == needle)
        .last()
}
