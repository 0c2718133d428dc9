//! # Opal Binary Utilities
//!
//! Length-checked reading and writing of wire-format primitives on top of
//! the `bytes` crate, plus the `Readable`/`Writable` traits packet types
//! implement.
//!
//! Everything on the wire here is big-endian.

pub mod error;
pub mod io;
pub mod traits;

pub use error::{BinaryError, Result};
pub use io::{BinaryReader, BinaryWriter};
pub use traits::{Readable, Writable};
