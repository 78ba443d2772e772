//! Explicit binary encoding for everything the store persists.
//!
//! Each persisted type implements [`Encode`] and [`Decode`] directly; there is
//! no runtime dispatch on type names. All integers are big-endian and read
//! through `zerocopy` so a short buffer is an error rather than a panic.

use bytes::Bytes;
use uuid::Uuid;
use zerocopy::byteorder::big_endian::{I32, I64, U32};
use zerocopy::{FromBytes, IntoBytes};

use crate::error::DecodeError;

pub trait Encode {
    fn encode_into(&self, out: &mut Vec<u8>);

    fn encode(&self) -> Bytes {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        Bytes::from(out)
    }
}

pub trait Decode: Sized {
    fn decode_from(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decodes a complete payload, rejecting trailing bytes.
    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

pub fn put_u8(out: &mut Vec<u8>, value: u8) {
    out.push(value);
}

pub fn put_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(I32::new(value).as_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(U32::new(value).as_bytes());
}

pub fn put_i64(out: &mut Vec<u8>, value: i64) {
    out.extend_from_slice(I64::new(value).as_bytes());
}

pub fn put_uuid(out: &mut Vec<u8>, value: &Uuid) {
    out.extend_from_slice(value.as_bytes());
}

/// Writes `payload` with a u32 length prefix.
pub fn put_bytes(out: &mut Vec<u8>, payload: &[u8]) {
    put_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

/// A forward-only cursor over a borrowed payload.
#[derive(Debug)]
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len()
    }

    fn read<T: FromBytes>(&mut self) -> Result<T, DecodeError> {
        let needed = std::mem::size_of::<T>();
        let (value, rest) = T::read_from_prefix(self.bytes).map_err(|_| DecodeError::Truncated {
            needed,
            remaining: self.bytes.len(),
        })?;
        self.bytes = rest;
        Ok(value)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        self.read::<u8>()
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read::<I32>()?.get())
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(self.read::<U32>()?.get())
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(self.read::<I64>()?.get())
    }

    pub fn uuid(&mut self) -> Result<Uuid, DecodeError> {
        Ok(Uuid::from_bytes(self.read::<[u8; 16]>()?))
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < len {
            return Err(DecodeError::Truncated {
                needed: len,
                remaining: self.bytes.len(),
            });
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    /// Reads a u32 length prefixed byte string.
    pub fn bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u32()? as usize;
        self.slice(len)
    }

    pub fn finish(self) -> Result<(), DecodeError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::Trailing(self.bytes.len()))
        }
    }
}
