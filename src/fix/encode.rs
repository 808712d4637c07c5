//! Message building and encoding.
//!
//! Outgoing messages are assembled with the [`MessageWriter`]: `begin` fixes
//! the BeginString and MsgType(35), `push_*` appends tag/value pairs in the
//! order given, and [`finish`] seals the frame by writing BodyLength(9) and
//! the modulo-256 CheckSum(10) trailer. The writer emits exactly what it is
//! given — the standard header fields 49, 56, 34, 52 must be pushed, in that
//! order, before any body fields.
//!
//! [`finish`]: MessageWriter::finish

use crate::fix::checksum::ChecksumWriter;
use crate::fix::mem::MsgBuf;
use chrono::{DateTime, Utc};
use std::io::Write;

/// Session-layer timestamp format, UTC with millisecond precision.
pub const TIME_FORMAT: &str = "%Y%m%d-%H:%M:%S%.3f";

pub(crate) const SOH: &[u8] = &[b'\x01'];

/// Formats `t` the way SendingTime(52)/OrigSendingTime(122) carry it.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    format!("{}", t.format(TIME_FORMAT))
}

/// An integer rendered to ASCII without allocating.
#[derive(Default)]
pub struct IntBytes([u8; 20], usize);

impl IntBytes {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[self.0.len() - self.1..]
    }
}

impl From<u32> for IntBytes {
    fn from(u: u32) -> Self {
        Self::from(u as u64)
    }
}

impl From<u64> for IntBytes {
    fn from(u: u64) -> Self {
        let mut out: IntBytes = Default::default();
        if u == 0 {
            out.0[out.0.len() - 1] = b'0';
            out.1 = 1;
            return out;
        }
        let mut n = u;
        while n > 0 {
            out.1 += 1;
            out.0[20 - out.1] = b'0' + (n % 10) as u8;
            n /= 10;
        }
        out
    }
}

/// The pre-rendered `49=<sender>|56=<target>|` block for one session.
///
/// Rendered once at session construction so the send path never formats
/// CompIDs.
#[derive(Debug, Clone, Default)]
pub struct HeaderTemplate {
    comp_ids: Vec<u8>,
}

impl HeaderTemplate {
    pub fn new(sender_comp_id: &str, target_comp_id: &str) -> Self {
        let mut comp_ids = Vec::with_capacity(sender_comp_id.len() + target_comp_id.len() + 8);
        comp_ids.extend_from_slice(b"49=");
        comp_ids.extend_from_slice(sender_comp_id.as_bytes());
        comp_ids.extend_from_slice(SOH);
        comp_ids.extend_from_slice(b"56=");
        comp_ids.extend_from_slice(target_comp_id.as_bytes());
        comp_ids.extend_from_slice(SOH);
        HeaderTemplate { comp_ids }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.comp_ids
    }
}

/// Builds one outgoing FIX frame.
#[derive(Debug)]
pub struct MessageWriter {
    preamble: Vec<u8>, // "8=<BeginString>\x019="
    body: Vec<u8>,     // "35=<t>\x01" + caller fields
    msg_type: char,
}

impl MessageWriter {
    pub fn begin(begin_string: &str, msg_type: char) -> Self {
        let mut preamble = Vec::with_capacity(begin_string.len() + 5);
        preamble.extend_from_slice(b"8=");
        preamble.extend_from_slice(begin_string.as_bytes());
        preamble.extend_from_slice(b"\x019=");

        let mut body = Vec::with_capacity(256);
        body.extend_from_slice(b"35=");
        let mut mt = [0u8; 4];
        body.extend_from_slice(msg_type.encode_utf8(&mut mt).as_bytes());
        body.extend_from_slice(SOH);

        MessageWriter {
            preamble,
            body,
            msg_type,
        }
    }

    pub fn msg_type(&self) -> char {
        self.msg_type
    }

    pub fn push(mut self, tag: impl Into<u32>, value: &[u8]) -> Self {
        self.push_mut(tag, value);
        self
    }

    pub fn push_mut(&mut self, tag: impl Into<u32>, value: &[u8]) {
        self.body
            .extend_from_slice(IntBytes::from(tag.into()).as_bytes());
        self.body.push(b'=');
        self.body.extend_from_slice(value);
        self.body.extend_from_slice(SOH);
    }

    pub fn push_int(self, tag: impl Into<u32>, value: u32) -> Self {
        let v = IntBytes::from(value);
        self.push(tag, v.as_bytes())
    }

    pub fn push_char(self, tag: impl Into<u32>, value: char) -> Self {
        let mut b = [0u8; 4];
        let s = value.encode_utf8(&mut b);
        self.push(tag, s.as_bytes())
    }

    pub fn push_timestamp(self, tag: impl Into<u32>, value: DateTime<Utc>) -> Self {
        let s = format_timestamp(value);
        self.push(tag, s.as_bytes())
    }

    /// Appends an already-rendered `tag=value|...` block verbatim.
    pub fn push_raw(mut self, block: &[u8]) -> Self {
        self.body.extend_from_slice(block);
        self
    }

    /// Seals the frame: BodyLength covers everything after its own SOH up
    /// to the first byte of tag 10. The trailer checksum is accumulated by
    /// a [`ChecksumWriter`] while the frame is assembled.
    pub fn finish(self) -> MsgBuf {
        let body_len = IntBytes::from(self.body.len() as u64);
        let capacity = self.preamble.len() + self.body.len() + body_len.as_bytes().len() + 8;
        let mut writer = ChecksumWriter::new(Vec::with_capacity(capacity));
        let _ = writer.write_all(&self.preamble);
        let _ = writer.write_all(body_len.as_bytes());
        let _ = writer.write_all(SOH);
        let _ = writer.write_all(&self.body);
        let checksum = writer.checksum();
        let mut out = writer.into_inner();
        out.extend_from_slice(b"10=");
        out.extend_from_slice(format!("{:0>3}", checksum).as_bytes());
        out.extend_from_slice(SOH);
        out.into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fix::fields::Tags;
    use crate::fix::mem::IncomingMessage;

    #[test]
    fn test_int_bytes() {
        let tests = vec![(1u64, "1"), (1918230917, "1918230917"), (0, "0")];
        for (num, s) in tests {
            assert_eq!(IntBytes::from(num).as_bytes(), s.as_bytes());
        }
    }

    #[test]
    fn test_header_template() {
        let t = HeaderTemplate::new("CLIENT", "SERVER");
        assert_eq!(t.bytes(), b"49=CLIENT\x0156=SERVER\x01");
    }

    #[test]
    fn writer_emits_known_frame() {
        let ts = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let frame = MessageWriter::begin("FIX.4.2", 'Q')
            .push_timestamp(Tags::SendingTime, ts)
            .push(44u32, b"fqwe")
            .push(88u32, b"43")
            .finish();
        assert_eq!(
            String::from_utf8(frame.0).unwrap(),
            "8=FIX.4.2\x019=44\x0135=Q\x0152=19700101-00:00:00.000\x0144=fqwe\x0188=43\x0110=026\x01",
        );
    }

    #[test]
    fn round_trips_through_the_reader() {
        let ts = DateTime::<Utc>::from(std::time::UNIX_EPOCH);
        let template = HeaderTemplate::new("CLIENT", "SERVER");
        let frame = MessageWriter::begin("FIX.4.4", 'A')
            .push_raw(template.bytes())
            .push_int(Tags::MsgSeqNum, 1)
            .push_timestamp(Tags::SendingTime, ts)
            .push_int(Tags::EncryptMethod, 0)
            .push_int(Tags::HeartBtInt, 30)
            .push_char(Tags::ResetSeqNumFlag, 'Y')
            .finish();

        let mut reader = crate::fix::decode::FrameReader::new("FIX.4.4", 4096, 1000);
        let mut view = IncomingMessage::with_capacity(4096, 64);
        reader.extend(frame.as_slice());
        assert_eq!(reader.try_parse(&mut view), Ok(true));
        assert_eq!(view.msg_type(), Some('A'));
        assert_eq!(view.msg_seq_num(), Some(1));
        assert_eq!(view.get_str(Tags::SenderCompID), Some("CLIENT"));
        assert_eq!(view.get_str(Tags::TargetCompID), Some("SERVER"));
        assert_eq!(view.get_int(Tags::HeartBtInt), Some(30));
        assert_eq!(view.get_bool(Tags::ResetSeqNumFlag), Some(true));
        assert_eq!(
            view.get_str(Tags::SendingTime),
            Some("19700101-00:00:00.000")
        );
    }

    #[test]
    fn timestamp_format_is_millisecond_utc() {
        let ts = DateTime::<Utc>::from(std::time::UNIX_EPOCH + std::time::Duration::from_millis(1_500));
        assert_eq!(format_timestamp(ts), "19700101-00:00:01.500");
    }
}
