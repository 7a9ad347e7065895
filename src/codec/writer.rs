use bytes::BufMut;
use log::trace;

use super::{
    CodecError,
    header::{
        BOOL_SIZE, BYTE_SIZE, INT_SIZE, LENGTH_SIZE, LONG_SIZE, MAX_FIELD_LENGTH, NULL_LENGTH,
        NULL_ORDINAL,
    },
};

/// Write cursor over a bounded outbound window.
///
/// Each `put_*` call either commits the whole field or leaves the window exactly as it was.
#[derive(Debug)]
pub struct Writer<'a> {
    dst: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(dst: &'a mut [u8]) -> Self {
        Self { dst, pos: 0 }
    }

    /// Bytes committed to the window so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.dst.len() - self.pos
    }

    /// Claims `len` bytes of the window, or nothing if they are not all available.
    fn reserve(&mut self, len: usize) -> Option<&mut [u8]> {
        if self.remaining() < len {
            trace!(
                "window exhausted: need {len} bytes, {} remaining",
                self.remaining()
            );
            return None;
        }

        let start = self.pos;
        self.pos += len;
        Some(&mut self.dst[start..start + len])
    }

    pub fn put_byte(&mut self, value: u8) -> Result<bool, CodecError> {
        Ok(match self.reserve(BYTE_SIZE) {
            Some(mut window) => {
                window.put_u8(value);
                true
            }
            None => false,
        })
    }

    pub fn put_bool(&mut self, value: bool) -> Result<bool, CodecError> {
        Ok(match self.reserve(BOOL_SIZE) {
            Some(mut window) => {
                window.put_u8(u8::from(value));
                true
            }
            None => false,
        })
    }

    pub fn put_int(&mut self, value: i32) -> Result<bool, CodecError> {
        Ok(match self.reserve(INT_SIZE) {
            Some(mut window) => {
                window.put_i32(value);
                true
            }
            None => false,
        })
    }

    pub fn put_long(&mut self, value: i64) -> Result<bool, CodecError> {
        Ok(match self.reserve(LONG_SIZE) {
            Some(mut window) => {
                window.put_i64(value);
                true
            }
            None => false,
        })
    }

    pub fn put_byte_array(&mut self, value: Option<&[u8]>) -> Result<bool, CodecError> {
        let Some(bytes) = value else {
            return self.put_int(NULL_LENGTH);
        };

        if bytes.len() > MAX_FIELD_LENGTH {
            return Err(CodecError::LengthExceeded {
                len: bytes.len(),
                limit: MAX_FIELD_LENGTH,
            });
        }

        Ok(match self.reserve(LENGTH_SIZE + bytes.len()) {
            Some(mut window) => {
                // MAX_FIELD_LENGTH fits in an i32.
                window.put_i32(bytes.len() as i32);
                window.put_slice(bytes);
                true
            }
            None => false,
        })
    }

    pub fn put_string(&mut self, value: Option<&str>) -> Result<bool, CodecError> {
        self.put_byte_array(value.map(str::as_bytes))
    }

    /// Writes the ordinal of a tagged enum, or [`NULL_ORDINAL`] when absent.
    pub fn put_enum<E>(&mut self, value: Option<E>) -> Result<bool, CodecError>
    where
        E: Into<i32> + Copy,
    {
        self.put_int(value.map_or(NULL_ORDINAL, Into::into))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_window_is_left_untouched() {
        let mut buf = [0xAA_u8; 6];
        let mut writer = Writer::new(&mut buf);

        assert!(writer.put_int(7).unwrap());
        assert!(!writer.put_long(1).unwrap());
        assert!(!writer.put_string(Some("abc")).unwrap());
        assert_eq!(writer.position(), 4);
        assert_eq!(buf, [0, 0, 0, 7, 0xAA, 0xAA]);
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buf = [0_u8; 13];
        let mut writer = Writer::new(&mut buf);

        writer.put_byte(57).unwrap();
        writer.put_int(0x0102_0304).unwrap();
        writer.put_long(-2).unwrap();

        assert_eq!(buf[0], 57);
        assert_eq!(buf[1..5], [1, 2, 3, 4]);
        assert_eq!(buf[5..], [0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]);
    }

    #[test]
    fn absent_enum_writes_null_ordinal() {
        let mut buf = [0_u8; 4];
        let mut writer = Writer::new(&mut buf);

        assert!(writer.put_enum::<i32>(None).unwrap());
        assert_eq!(i32::from_be_bytes(buf), NULL_ORDINAL);
    }

    #[test]
    fn oversized_array_is_rejected() {
        let mut buf = [0_u8; 8];
        let big = vec![0_u8; MAX_FIELD_LENGTH + 1];

        let err = Writer::new(&mut buf)
            .put_byte_array(Some(&big))
            .unwrap_err();
        assert!(matches!(err, CodecError::LengthExceeded { .. }));
    }
}
