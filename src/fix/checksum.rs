use std::io::Write;

/// A [`Write`] adapter that sums every byte passing through it.
///
/// The FIX CheckSum(10) is the modulo-256 sum of every byte of the message
/// up to and including the SOH that terminates the field before tag 10.
pub struct ChecksumWriter<W>(W, usize);

impl<W> Write for ChecksumWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for c in buf {
            self.1 += (*c) as usize;
        }
        self.0.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl<W> ChecksumWriter<W> {
    pub fn new(w: W) -> Self {
        ChecksumWriter(w, 0)
    }
    pub fn checksum(&self) -> usize {
        self.1 % 256
    }
    pub fn into_inner(self) -> W {
        self.0
    }
}

pub fn calc_checksum(bytes: &[u8]) -> u32 {
    bytes.iter().map(|c| *c as u32).sum::<u32>() % 256
}

/// Parses the `10=nnn<SOH>` trailer, requiring exactly three ASCII digits.
pub fn parse_trailer(msg_buf: &[u8]) -> Option<u32> {
    if msg_buf.len() < 7 {
        return None;
    }
    let tail = &msg_buf[msg_buf.len() - 7..];
    if &tail[0..3] != b"10="
        || !tail[3..6].iter().all(|byte| byte.is_ascii_digit())
        || tail[6] != b'\x01'
    {
        return None;
    }
    std::str::from_utf8(&tail[3..6]).ok()?.parse().ok()
}

/// Checks the trailer checksum against the sum of all bytes before `10=`.
pub fn trailer_matches(msg_buf: &[u8]) -> bool {
    match parse_trailer(msg_buf) {
        Some(declared) => calc_checksum(&msg_buf[..msg_buf.len() - 7]) == declared,
        None => false,
    }
}
