//! Little-endian field payload encoder/decoder used inside TLV fields.

use super::{SnapshotError, SnapshotResult};

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u32(&mut self) -> SnapshotResult<u32> {
        if self.remaining() < 4 {
            return Err(SnapshotError::UnexpectedEof);
        }
        let b = &self.buf[self.pos..self.pos + 4];
        self.pos += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Fails if any bytes were left unconsumed.
    pub fn finish(self) -> SnapshotResult<()> {
        if self.remaining() != 0 {
            return Err(SnapshotError::InvalidFieldEncoding("trailing bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_stops_at_end_of_buffer() {
        let mut buf = Encoder::new().u32(5).finish();
        buf.push(1);
        let mut d = Decoder::new(&buf);
        assert_eq!(d.u32().unwrap(), 5);
        assert_eq!(d.remaining(), 1);
        assert_eq!(d.u32(), Err(SnapshotError::UnexpectedEof));
    }

    #[test]
    fn finish_rejects_trailing_bytes() {
        let buf = [0u8; 6];
        let mut d = Decoder::new(&buf);
        d.u32().unwrap();
        assert_eq!(
            d.finish(),
            Err(SnapshotError::InvalidFieldEncoding("trailing bytes"))
        );
    }
}
