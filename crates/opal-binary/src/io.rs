//! Extension traits over `bytes::Buf` / `bytes::BufMut` with explicit
//! length checks, so a truncated datagram surfaces as a decode error
//! instead of a panic.

use crate::error::{BinaryError, Result};
use bytes::{Buf, BufMut, Bytes};

/// Checks that the buffer has enough remaining bytes, failing the read if not.
macro_rules! check_remaining {
    ($buf:expr, $len:expr) => {
        let needed = $len;
        let remaining = $buf.remaining();
        if remaining < needed {
            return Err(BinaryError::UnexpectedEof { needed, remaining });
        }
    };
}

/// Extension trait for `bytes::Buf` providing checked reads of wire primitives.
pub trait BinaryReader: Buf {
    /// Reads a single `u8` byte.
    #[inline]
    fn read_u8(&mut self) -> Result<u8> {
        check_remaining!(self, 1);
        Ok(self.get_u8())
    }

    /// Reads a `u16` in big-endian format.
    #[inline]
    fn read_u16_be(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.get_u16())
    }

    /// Reads a `u32` in big-endian format.
    #[inline]
    fn read_u32_be(&mut self) -> Result<u32> {
        check_remaining!(self, 4);
        Ok(self.get_u32())
    }

    /// Reads exactly `len` bytes into an owned `Bytes`.
    #[inline]
    fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        check_remaining!(self, len);
        Ok(self.copy_to_bytes(len))
    }

    /// Reads a fixed-size array of bytes.
    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        check_remaining!(self, N);
        let mut out = [0u8; N];
        self.copy_to_slice(&mut out);
        Ok(out)
    }

    /// Consumes and returns everything remaining in the buffer.
    #[inline]
    fn read_rest(&mut self) -> Bytes {
        let len = self.remaining();
        self.copy_to_bytes(len)
    }
}

// Every Buf gets the checked reads.
impl<B: Buf + ?Sized> BinaryReader for B {}

/// Extension trait for `bytes::BufMut` providing writes of wire primitives.
///
/// Writes into a growable buffer cannot fail, but they return `Result` so
/// codec implementations compose with the reading side.
pub trait BinaryWriter: BufMut {
    /// Writes a single `u8` byte.
    #[inline]
    fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put_u8(value);
        Ok(())
    }

    /// Writes a `u16` in big-endian format.
    #[inline]
    fn write_u16_be(&mut self, value: u16) -> Result<()> {
        self.put_u16(value);
        Ok(())
    }

    /// Writes a `u32` in big-endian format.
    #[inline]
    fn write_u32_be(&mut self, value: u32) -> Result<()> {
        self.put_u32(value);
        Ok(())
    }

    /// Writes a raw byte slice verbatim.
    #[inline]
    fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.put_slice(value);
        Ok(())
    }
}

impl<B: BufMut + ?Sized> BinaryWriter for B {}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_read_write_primitives() {
        let mut writer = BytesMut::new();
        writer.write_u8(0x41).unwrap();
        writer.write_u16_be(0xBEEF).unwrap();
        writer.write_u32_be(0xDEAD_BEEF).unwrap();
        writer.write_bytes(&[1, 2, 3]).unwrap();

        let expected = Bytes::from_static(&[
            0x41, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF, 1, 2, 3,
        ]);
        assert_eq!(writer.clone().freeze(), expected);

        let mut reader = writer.freeze();
        assert_eq!(reader.read_u8().unwrap(), 0x41);
        assert_eq!(reader.read_u16_be().unwrap(), 0xBEEF);
        assert_eq!(reader.read_u32_be().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.read_rest(), Bytes::from_static(&[1, 2, 3]));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_read_array() {
        let mut reader = Bytes::from_static(&[9, 8, 7, 6, 5]);
        let arr: [u8; 4] = reader.read_array().unwrap();
        assert_eq!(arr, [9, 8, 7, 6]);
        assert_eq!(reader.remaining(), 1);
    }

    #[test]
    fn test_unexpected_eof() {
        let mut reader = Bytes::from_static(&[0x01, 0x02]);
        let result = reader.read_u32_be();
        assert!(matches!(
            result,
            Err(BinaryError::UnexpectedEof { needed: 4, remaining: 2 })
        ));

        let mut short = Bytes::from_static(&[0x01]);
        assert!(short.read_bytes(3).is_err());
        // A failed read must not consume anything.
        assert_eq!(short.remaining(), 1);
    }
}
