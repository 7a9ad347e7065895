use bytes::Buf;
use log::trace;
use num_enum::TryFromPrimitive;

use super::{
    CodecError, Decoded,
    header::{
        BOOL_SIZE, BYTE_SIZE, INT_SIZE, LENGTH_SIZE, LONG_SIZE, MAX_FIELD_LENGTH, NULL_LENGTH,
        NULL_ORDINAL,
    },
};

/// Read cursor over the bytes received so far.
///
/// A `get_*` call that finds too few bytes returns `Ok(None)` without moving the cursor, so
/// the caller can append more data and retry the same field.
#[derive(Debug)]
pub struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.src.len() - self.pos
    }

    /// Borrows the next `len` unread bytes without consuming them.
    fn peek(&self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            trace!(
                "insufficient data: need {len} bytes, {} available",
                self.remaining()
            );
            return None;
        }

        let src: &'a [u8] = self.src;
        Some(&src[self.pos..self.pos + len])
    }

    pub fn get_byte(&mut self) -> Decoded<u8> {
        Ok(self.peek(BYTE_SIZE).map(|mut window| {
            self.pos += BYTE_SIZE;
            window.get_u8()
        }))
    }

    pub fn get_bool(&mut self) -> Decoded<bool> {
        let Some(mut window) = self.peek(BOOL_SIZE) else {
            return Ok(None);
        };

        let value = match window.get_u8() {
            0 => false,
            1 => true,
            other => return Err(CodecError::InvalidBool(other)),
        };
        self.pos += BOOL_SIZE;
        Ok(Some(value))
    }

    pub fn get_int(&mut self) -> Decoded<i32> {
        Ok(self.peek(INT_SIZE).map(|mut window| {
            self.pos += INT_SIZE;
            window.get_i32()
        }))
    }

    pub fn get_long(&mut self) -> Decoded<i64> {
        Ok(self.peek(LONG_SIZE).map(|mut window| {
            self.pos += LONG_SIZE;
            window.get_i64()
        }))
    }

    /// Reads a length-prefixed byte array. The outer `Option` is readiness, the inner one
    /// presence.
    pub fn get_byte_array(&mut self) -> Decoded<Option<Vec<u8>>> {
        let Some(mut prefix) = self.peek(LENGTH_SIZE) else {
            return Ok(None);
        };

        let len = match prefix.get_i32() {
            NULL_LENGTH => {
                self.pos += LENGTH_SIZE;
                return Ok(Some(None));
            }
            len if len < 0 => return Err(CodecError::InvalidLength(len)),
            len => len as usize,
        };

        if len > MAX_FIELD_LENGTH {
            return Err(CodecError::LengthExceeded {
                len,
                limit: MAX_FIELD_LENGTH,
            });
        }

        let Some(window) = self.peek(LENGTH_SIZE + len) else {
            return Ok(None);
        };
        self.pos += LENGTH_SIZE + len;
        Ok(Some(Some(window[LENGTH_SIZE..].to_vec())))
    }

    pub fn get_string(&mut self) -> Decoded<Option<String>> {
        let start = self.pos;
        let Some(bytes) = self.get_byte_array()? else {
            return Ok(None);
        };

        match bytes.map(String::from_utf8).transpose() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                self.pos = start;
                Err(CodecError::InvalidUtf8)
            }
        }
    }

    /// Reads a tagged enum by ordinal; an ordinal outside `E` is a protocol violation.
    pub fn get_enum<E>(&mut self) -> Decoded<Option<E>>
    where
        E: TryFromPrimitive<Primitive = i32>,
    {
        let Some(ordinal) = self.get_int()? else {
            return Ok(None);
        };

        if ordinal == NULL_ORDINAL {
            return Ok(Some(None));
        }

        match E::try_from_primitive(ordinal) {
            Ok(value) => Ok(Some(Some(value))),
            Err(_) => {
                self.pos -= INT_SIZE;
                Err(CodecError::UnknownOrdinal {
                    name: E::NAME,
                    ordinal,
                })
            }
        }
    }
}
