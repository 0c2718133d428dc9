use crate::error::Result;
use bytes::{Buf, BufMut};

/// Trait for types that can be decoded from a buffer of wire bytes.
pub trait Readable: Sized {
    /// Reads an instance of `Self` from the reader.
    fn read<B: Buf>(reader: &mut B) -> Result<Self>;
}

/// Trait for types that can be encoded into a buffer of wire bytes.
pub trait Writable {
    /// Writes this instance to the writer.
    fn write<B: BufMut>(&self, writer: &mut B) -> Result<()>;
}
