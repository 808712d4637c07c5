//! Incremental frame parsing.
//!
//! The [`FrameReader`] accepts streamed bytes and yields at most one
//! complete message per [`try_parse`] call. A FIX frame is
//! `8=<BeginString>|9=<BodyLength>|<body>|10=<nnn>|` with SOH after every
//! field; BodyLength counts the bytes between the SOH that ends tag 9 and
//! the first byte of `10=`. Framing errors are fatal to the connection:
//! the session disconnects and the reader is reset.
//!
//! [`try_parse`]: FrameReader::try_parse

use crate::fix::checksum::{calc_checksum, parse_trailer, trailer_matches};
use crate::fix::mem::IncomingMessage;
use thiserror::Error;

/// Fatal framing or checksum failures.
///
/// `code()` exposes the stable diagnostic numbers carried in disconnect
/// logs: −2 checksum not at the BodyLength-implied offset, −3 checksum
/// field malformed, −4 checksum mismatch, −1 for everything that corrupts
/// the frame boundary itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("BeginString mismatch or not first")]
    BeginString,
    #[error("BodyLength missing or malformed")]
    BodyLength,
    #[error("message length {0} exceeds limit {1}")]
    MessageTooLong(usize, usize),
    #[error("CheckSum not at expected position")]
    ChecksumMisplaced,
    #[error("CheckSum field malformed")]
    ChecksumFormat,
    #[error("CheckSum mismatch: declared {declared}, calculated {calculated}")]
    ChecksumMismatch { declared: u32, calculated: u32 },
    #[error("invalid byte {byte:#04x} at offset {at}")]
    FieldSyntax { byte: u8, at: usize },
    #[error("tag {0} exceeds the configured maximum {1}")]
    TagNumber(u32, u32),
}

impl FrameError {
    pub fn code(&self) -> i32 {
        match self {
            FrameError::ChecksumMisplaced => -2,
            FrameError::ChecksumFormat => -3,
            FrameError::ChecksumMismatch { .. } => -4,
            _ => -1,
        }
    }
}

pub struct FrameReader {
    buf: Vec<u8>,
    prefix: Vec<u8>, // "8=<BeginString>\x019="
    max_message_length: usize,
    max_tag_number: u32,
}

impl FrameReader {
    pub fn new(begin_string: &str, max_message_length: usize, max_tag_number: u32) -> Self {
        let mut prefix = Vec::with_capacity(begin_string.len() + 5);
        prefix.extend_from_slice(b"8=");
        prefix.extend_from_slice(begin_string.as_bytes());
        prefix.extend_from_slice(b"\x019=");
        FrameReader {
            buf: Vec::with_capacity(max_message_length),
            prefix,
            max_message_length,
            max_tag_number,
        }
    }

    /// Appends raw bytes from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discards all buffered bytes. Called on disconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Attempts to frame one message into `out`.
    ///
    /// `Ok(true)`: a complete, checksum-valid frame was loaded and indexed.
    /// `Ok(false)`: the buffered prefix is shorter than one frame.
    /// `Err(_)`: the connection is corrupt; the caller must disconnect.
    pub fn try_parse(&mut self, out: &mut IncomingMessage) -> Result<bool, FrameError> {
        let total_len = match self.frame_length()? {
            Some(n) => n,
            None => return Ok(false),
        };
        if self.buf.len() < total_len {
            return Ok(false);
        }

        let frame = &self.buf[..total_len];
        // BodyLength ends at the byte before "10=".
        if &frame[total_len - 7..total_len - 4] != b"10=" {
            return Err(FrameError::ChecksumMisplaced);
        }
        let declared = parse_trailer(frame).ok_or(FrameError::ChecksumFormat)?;
        if !trailer_matches(frame) {
            return Err(FrameError::ChecksumMismatch {
                declared,
                calculated: calc_checksum(&frame[..total_len - 7]),
            });
        }

        if !out.load(frame) {
            return Err(FrameError::MessageTooLong(total_len, self.max_message_length));
        }
        index_fields_bounded(out, self.max_tag_number)?;
        self.buf.drain(..total_len);
        Ok(true)
    }

    /// Total frame length implied by BodyLength, or None when the header
    /// is still incomplete.
    fn frame_length(&self) -> Result<Option<usize>, FrameError> {
        let have = self.buf.len();
        if have < self.prefix.len() + 2 {
            // Catch a wrong protocol version as soon as the bytes differ.
            let cmp = std::cmp::min(have, self.prefix.len());
            if self.buf[..cmp] != self.prefix[..cmp] {
                return Err(FrameError::BeginString);
            }
            return Ok(None);
        }
        if self.buf[..self.prefix.len()] != self.prefix[..] {
            return Err(FrameError::BeginString);
        }

        let mut body_length: usize = 0;
        let mut at = self.prefix.len();
        let mut saw_end = false;
        for b in &self.buf[self.prefix.len()..] {
            at += 1;
            match *b {
                b'0'..=b'9' => {
                    body_length = body_length
                        .checked_mul(10)
                        .and_then(|n| n.checked_add((*b - b'0') as usize))
                        .ok_or(FrameError::BodyLength)?;
                }
                b'\x01' => {
                    saw_end = true;
                    break;
                }
                _ => return Err(FrameError::BodyLength),
            }
        }
        if !saw_end {
            return if at - self.prefix.len() > 9 {
                Err(FrameError::BodyLength)
            } else {
                Ok(None)
            };
        }
        if at == self.prefix.len() + 1 {
            return Err(FrameError::BodyLength);
        }

        // "at" is the first byte counted by BodyLength; the trailer
        // 10=nnn| is 7 more bytes.
        let total = at + body_length + 7;
        if total > self.max_message_length {
            return Err(FrameError::MessageTooLong(total, self.max_message_length));
        }
        Ok(Some(total))
    }
}

/// Scans every `tag=value` field of the loaded frame into the view's index.
pub(crate) fn index_fields(view: &mut IncomingMessage) -> Result<(), FrameError> {
    index_fields_bounded(view, u32::MAX)
}

fn index_fields_bounded(view: &mut IncomingMessage, max_tag: u32) -> Result<(), FrameError> {
    #[derive(PartialEq)]
    enum S {
        Start,
        InTag,
        SeenEquals,
        InField,
    }
    let mut state = S::Start;
    let mut tag_accum: u32 = 0;
    let mut field_start: usize = 0;
    let mut fields: Vec<(u32, usize, usize)> = Vec::new();
    for (i, b) in view.raw().iter().enumerate() {
        match (&state, *b) {
            (S::Start, b'0'..=b'9') | (S::InTag, b'0'..=b'9') => {
                if state == S::Start {
                    tag_accum = 0;
                } else {
                    tag_accum = tag_accum
                        .checked_mul(10)
                        .ok_or(FrameError::TagNumber(u32::MAX, max_tag))?;
                }
                tag_accum += (*b - b'0') as u32;
                state = S::InTag;
            }
            (S::InTag, b'=') => {
                if tag_accum > max_tag {
                    return Err(FrameError::TagNumber(tag_accum, max_tag));
                }
                field_start = i + 1;
                state = S::SeenEquals;
            }
            (S::SeenEquals, b'\x01') | (S::InField, b'\x01') => {
                fields.push((tag_accum, field_start, i - field_start));
                state = S::Start;
            }
            (S::SeenEquals, _) | (S::InField, _) => {
                state = S::InField;
            }
            (_, byte) => {
                return Err(FrameError::FieldSyntax { byte, at: i });
            }
        }
    }
    for (tag, off, len) in fields {
        view.push_field(tag, off, len);
    }
    Ok(())
}

pub(crate) fn bytes_to_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() {
        return None;
    }
    let mut accum: u32 = 0;
    for b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        accum = accum
            .checked_mul(10)?
            .checked_add((b - b'0') as u32)?;
    }
    Some(accum)
}
