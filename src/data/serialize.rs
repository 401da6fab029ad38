use byteorder::{ByteOrder, NativeEndian};

use crate::error::{Result, SchedError};

/// A value with a fixed, self-describing wire encoding.
pub trait Serializable: Sized {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(bytes: &[u8]) -> Result<Self>;
}

/// Append-only wire writer.
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_i32(&mut self, v: i32) {
        let mut tmp = [0u8; 4];
        NativeEndian::write_i32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_f32(&mut self, v: f32) {
        let mut tmp = [0u8; 4];
        NativeEndian::write_f32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_u64(&mut self, v: u64) {
        let mut tmp = [0u8; 8];
        NativeEndian::write_u64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_i32_slice(&mut self, vs: &[i32]) {
        for &v in vs {
            self.put_i32(v);
        }
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-style wire reader over a borrowed byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(SchedError::TruncatedMessage {
                needed: self.pos + n,
                got: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(NativeEndian::read_i32(self.take(4)?))
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(NativeEndian::read_f32(self.take(4)?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(NativeEndian::read_u64(self.take(8)?))
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_remaining_bytes(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Consumes the remaining bytes as a sequence of `i32`s. The remainder
    /// must be a whole number of words.
    pub fn get_remaining_i32s(&mut self) -> Result<Vec<i32>> {
        let remaining = self.remaining();
        if remaining % 4 != 0 {
            return Err(SchedError::TruncatedMessage {
                needed: remaining + (4 - remaining % 4),
                got: remaining,
            });
        }
        let mut out = Vec::with_capacity(remaining / 4);
        while self.remaining() > 0 {
            out.push(self.get_i32()?);
        }
        Ok(out)
    }
}

/// Reads the leading `i32` of a message without consuming it. Mirrors the
/// common "first word is the job id" convention of the wire formats.
pub fn peek_i32(bytes: &[u8]) -> Result<i32> {
    Reader::new(bytes).get_i32()
}

/// FNV-1a over raw bytes; the checksum carried by job descriptions and
/// application messages.
pub fn checksum(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
