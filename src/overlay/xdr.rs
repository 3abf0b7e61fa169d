//! Minimal XDR (RFC 4506) primitives for the overlay wire protocol.
//!
//! Everything is big-endian, and opaque/string payloads are padded to a
//! four-byte boundary with zero bytes. Only the shapes the
//! [`StellarMessage`](super::message::StellarMessage) union needs are
//! implemented.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XdrError {
    #[error("unexpected end of XDR input")]
    Truncated,
    #[error("XDR padding bytes were not zero")]
    BadPadding,
    #[error("XDR length {0} exceeds remaining input")]
    LengthOutOfBounds(u32),
    #[error("XDR string is not valid UTF-8")]
    BadUtf8,
    #[error("unknown XDR union discriminant {0}")]
    UnknownDiscriminant(u32),
    #[error("XDR optional flag must be 0 or 1, got {0}")]
    BadOptional(u32),
    #[error("trailing bytes after XDR value")]
    TrailingBytes,
}

/// Cursor over an XDR-encoded buffer.
pub struct XdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        XdrReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fail unless the whole buffer was consumed.
    pub fn finish(self) -> Result<(), XdrError> {
        if self.remaining() != 0 {
            return Err(XdrError::TrailingBytes);
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], XdrError> {
        if self.remaining() < n {
            return Err(XdrError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u32(&mut self) -> Result<u32, XdrError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, XdrError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, XdrError> {
        let hi = self.read_u32()? as u64;
        let lo = self.read_u32()? as u64;
        Ok((hi << 32) | lo)
    }

    pub fn read_i64(&mut self) -> Result<i64, XdrError> {
        Ok(self.read_u64()? as i64)
    }

    /// Fixed-length opaque data, padded to a four-byte boundary.
    pub fn read_opaque_fixed<const N: usize>(&mut self) -> Result<[u8; N], XdrError> {
        let data = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(data);
        self.read_padding(N)?;
        Ok(out)
    }

    /// Variable-length opaque data: u32 length, payload, padding.
    pub fn read_opaque_var(&mut self) -> Result<Vec<u8>, XdrError> {
        let len = self.read_u32()?;
        if len as usize > self.remaining() {
            return Err(XdrError::LengthOutOfBounds(len));
        }
        let data = self.take(len as usize)?.to_vec();
        self.read_padding(len as usize)?;
        Ok(data)
    }

    pub fn read_string(&mut self) -> Result<String, XdrError> {
        let bytes = self.read_opaque_var()?;
        String::from_utf8(bytes).map_err(|_| XdrError::BadUtf8)
    }

    fn read_padding(&mut self, payload_len: usize) -> Result<(), XdrError> {
        let pad = (4 - payload_len % 4) % 4;
        for &b in self.take(pad)? {
            if b != 0 {
                return Err(XdrError::BadPadding);
            }
        }
        Ok(())
    }
}

/// Append-only XDR writer.
#[derive(Default)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        XdrWriter::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    pub fn write_opaque_fixed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.write_padding(data.len());
    }

    pub fn write_opaque_var(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self.write_padding(data.len());
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_opaque_var(s.as_bytes());
    }

    fn write_padding(&mut self, payload_len: usize) {
        let pad = (4 - payload_len % 4) % 4;
        self.buf.extend_from_slice(&[0u8; 3][..pad]);
    }
}
