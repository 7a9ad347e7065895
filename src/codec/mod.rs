//! Primitive field codec.
//!
//! This module implements the canonical byte representation shared by every node of the
//! grid. Values are encoded into, and decoded out of, a bounded byte window one field at a
//! time. Neither side ever blocks or fails because a window is too small: a field that does
//! not fit is simply not written (or not consumed), and the caller retries it once more room
//! or more data is available.
//!
//! # Binary Format
//!
//! - Integers are fixed-width and big-endian (1, 4 or 8 bytes).
//! - Booleans are a single `0`/`1` byte.
//! - Strings and byte arrays carry a 4-byte length prefix. A length of `-1`
//!   ([`NULL_LENGTH`](header::NULL_LENGTH)) marks an absent value, which is distinct from an
//!   empty one.
//! - Tagged enums are written as their 4-byte ordinal, `-1` when absent.
//!
//! # Outcomes
//!
//! Writers return `Ok(true)` once the field has been committed and `Ok(false)` when the
//! window lacks room, in which case the window is left untouched. Readers return
//! `Ok(Some(value))` once the field is consumed and `Ok(None)` when more bytes are needed.
//! A byte sequence that can never form a valid field is a [`CodecError`].
mod reader;
mod writer;

pub use error::CodecError;
pub use reader::Reader;
pub use writer::Writer;

/// Result of a single read attempt; `Ok(None)` means not enough data yet.
pub type Decoded<T> = Result<Option<T>, CodecError>;

pub mod header {
    pub(crate) const BYTE_SIZE: usize = size_of::<u8>();
    pub(crate) const BOOL_SIZE: usize = size_of::<u8>();
    pub(crate) const INT_SIZE: usize = size_of::<i32>();
    pub(crate) const LONG_SIZE: usize = size_of::<i64>();
    pub(crate) const LENGTH_SIZE: usize = size_of::<i32>();

    /// Length prefix of an absent string or byte array.
    pub const NULL_LENGTH: i32 = -1;
    /// Ordinal of an absent enum value.
    pub const NULL_ORDINAL: i32 = -1;

    /// Largest string or byte array a peer may announce (16 MB).
    pub const MAX_FIELD_LENGTH: usize = 16 * 1024 * 1024;
}

pub mod error {
    use thiserror::Error;

    /// Stream contents that can never decode into a valid message.
    ///
    /// Every variant is a protocol violation: once raised, the position of the stream can no
    /// longer be trusted and the connection must be reset.
    #[derive(Debug, Error, Clone, PartialEq, Eq)]
    pub enum CodecError {
        #[error("unknown message type {0}")]
        UnknownMessageType(u8),

        #[error("unknown {name} ordinal {ordinal}")]
        UnknownOrdinal { name: &'static str, ordinal: i32 },

        #[error("invalid boolean byte {0:#04x}")]
        InvalidBool(u8),

        #[error("invalid length prefix {0}")]
        InvalidLength(i32),

        #[error("field length {len} exceeds limit of {limit} bytes")]
        LengthExceeded { len: usize, limit: usize },

        #[error("string field is not valid UTF-8")]
        InvalidUtf8,

        #[error("[{message}] missing required field '{field}'")]
        MissingField {
            message: &'static str,
            field: &'static str,
        },

        #[error("[{message}] invalid field '{field}': {reason}")]
        InvalidField {
            message: &'static str,
            field: &'static str,
            reason: String,
        },

        #[error("[{message}] field '{field}' still holds an unmarshalled handle")]
        UnpreparedField {
            message: &'static str,
            field: &'static str,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip_through_both_cursors() {
        let mut buf = [0_u8; 32];
        let mut writer = Writer::new(&mut buf);
        assert!(writer.put_string(Some("people")).unwrap());
        assert!(writer.put_string(None).unwrap());
        assert!(writer.put_string(Some("")).unwrap());
        let len = writer.position();

        let mut reader = Reader::new(&buf[..len]);
        assert_eq!(
            reader.get_string().unwrap(),
            Some(Some(String::from("people")))
        );
        assert_eq!(reader.get_string().unwrap(), Some(None));
        assert_eq!(reader.get_string().unwrap(), Some(Some(String::new())));
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn absent_and_empty_have_distinct_encodings() {
        let mut absent = [0_u8; 4];
        Writer::new(&mut absent).put_byte_array(None).unwrap();
        let mut empty = [0_u8; 4];
        Writer::new(&mut empty).put_byte_array(Some(&[])).unwrap();

        assert_eq!(absent, header::NULL_LENGTH.to_be_bytes());
        assert_eq!(empty, [0, 0, 0, 0]);
    }
}
