//! Canonical wire primitives
//!
//! Numbers are written big-endian with fixed widths on every host. Writing
//! goes straight through [`BufMut`]; reading goes through [`Reader`], which
//! bounds-checks every access and reports the failing offset.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{CoderError, Result};

/// Length marker for a NULL string
pub const NULL_STRING: u32 = u32::MAX;

/// Write an optional string as `u32 length` + UTF-8 bytes
pub fn put_string<B: BufMut>(buf: &mut B, value: Option<&str>) -> Result<()> {
    match value {
        None => buf.put_u32(NULL_STRING),
        Some(s) => {
            let len = u32::try_from(s.len())
                .ok()
                .filter(|len| *len != NULL_STRING)
                .ok_or_else(|| CoderError::Encoding(format!("string of {} bytes", s.len())))?;
            buf.put_u32(len);
            buf.put_slice(s.as_bytes());
        }
    }
    Ok(())
}

/// Bounds-checked reader over a received stream
#[derive(Debug)]
pub struct Reader {
    buf: Bytes,
    len: usize,
}

macro_rules! get_fixed {
    ($name:ident, $ty:ty, $get:ident) => {
        pub fn $name(&mut self) -> Result<$ty> {
            self.need(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$get())
        }
    };
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        let len = buf.len();
        Self { buf, len }
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> usize {
        self.len - self.buf.remaining()
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(CoderError::decoding(
                self.offset(),
                format!("truncated input: needed {} bytes, have {}", n, self.buf.remaining()),
            ));
        }
        Ok(())
    }

    get_fixed!(get_u8, u8, get_u8);
    get_fixed!(get_i8, i8, get_i8);
    get_fixed!(get_u16, u16, get_u16);
    get_fixed!(get_i16, i16, get_i16);
    get_fixed!(get_u32, u32, get_u32);
    get_fixed!(get_i32, i32, get_i32);
    get_fixed!(get_u64, u64, get_u64);
    get_fixed!(get_i64, i64, get_i64);
    get_fixed!(get_f32, f32, get_f32);
    get_fixed!(get_f64, f64, get_f64);

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CoderError::decoding(
                self.offset() - 1,
                format!("invalid boolean byte {}", other),
            )),
        }
    }

    pub fn get_string(&mut self) -> Result<Option<String>> {
        let len = self.get_u32()?;
        if len == NULL_STRING {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len)?;
        let offset = self.offset();
        let raw = self.buf.split_to(len);
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|e| CoderError::decoding(offset, format!("invalid UTF-8: {}", e)))
    }

    /// Read an element count, rejecting counts the remaining input cannot hold
    pub fn get_count(&mut self) -> Result<usize> {
        let count = self.get_u32()? as usize;
        if count > self.remaining() {
            return Err(CoderError::decoding(
                self.offset() - 4,
                format!("count {} exceeds remaining input", count),
            ));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_big_endian_layout() {
        let mut buf = BytesMut::new();
        buf.put_u32(0x0102_0304);
        buf.put_i16(-2);
        buf.put_f32(1.0);
        assert_eq!(&buf[..], &[1, 2, 3, 4, 0xff, 0xfe, 0x3f, 0x80, 0, 0]);

        let mut reader = Reader::new(buf.freeze());
        assert_eq!(reader.get_u32().unwrap(), 0x0102_0304);
        assert_eq!(reader.get_i16().unwrap(), -2);
        assert_eq!(reader.get_f32().unwrap(), 1.0);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_strings() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, Some("héllo")).unwrap();
        put_string(&mut buf, None).unwrap();
        let mut reader = Reader::new(buf.freeze());
        assert_eq!(reader.get_string().unwrap().as_deref(), Some("héllo"));
        assert_eq!(reader.get_string().unwrap(), None);
    }

    #[test]
    fn test_truncated() {
        let mut reader = Reader::new(Bytes::from_static(&[0, 0, 0, 9, b'a']));
        match reader.get_string() {
            Err(CoderError::Decoding { offset, .. }) => assert_eq!(offset, 4),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_bool() {
        let mut reader = Reader::new(Bytes::from_static(&[2]));
        assert!(reader.get_bool().is_err());
    }
}
