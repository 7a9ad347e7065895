//! Resumable message framing.
//!
//! A message is written as a single discriminator byte followed by the [`Envelope`] fields
//! and then the concrete message's own fields, in the fixed order given by
//! [`Message::FIELDS`]. The order is part of the wire contract: every peer walks the same
//! table.
//!
//! # Resuming
//!
//! [`Message::write_to`] and [`Message::read_from`] may be called any number of times over
//! successive windows. Each call advances through the field table as far as the window
//! allows and returns `Ok(true)` once the last field is done. On `Ok(false)` the message's
//! [`Cursor`] points at the field that stalled; committed fields are never encoded or decoded
//! twice. The discriminator has its own "written" flag, independent of the field cursor.
//!
//! On the reading side the discriminator is consumed by [`MessageReader`], which looks it up
//! in the [`MessageType`] registry before a single field is read.
mod envelope;

use std::fmt;

use log::{debug, trace};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    codec::{CodecError, Reader, Writer},
    protocol::{QueryRequest, QueryResponse},
};

pub use envelope::{Cursor, Envelope, EnvelopeField, Step};

/// Registry of wire discriminators. Values are fixed cluster-wide and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    QueryRequest = 57,
    QueryResponse = 58,
}

/// Maps a discriminator byte onto the registry.
pub fn decode_type(byte: u8) -> Result<MessageType, CodecError> {
    MessageType::try_from_primitive(byte).map_err(|_| CodecError::UnknownMessageType(byte))
}

/// A wire message made of an envelope and a fixed table of fields.
pub trait Message {
    type Field: Copy + fmt::Debug + 'static;

    const TYPE: MessageType;
    const FIELDS: &'static [Self::Field];

    fn envelope(&self) -> &Envelope;

    fn envelope_mut(&mut self) -> &mut Envelope;

    fn write_field(&self, field: Self::Field, w: &mut Writer<'_>) -> Result<bool, CodecError>;

    fn read_field(&mut self, field: Self::Field, r: &mut Reader<'_>)
    -> Result<bool, CodecError>;

    /// Checks the invariants of a fully read message.
    fn validate(&self) -> Result<(), CodecError> {
        Ok(())
    }

    /// Writes as much of the message as `w` has room for.
    fn write_to(&mut self, w: &mut Writer<'_>) -> Result<bool, CodecError> {
        if !self.envelope().cursor().type_written() {
            if !w.put_byte(Self::TYPE.into())? {
                return Ok(false);
            }
            self.envelope_mut().cursor_mut().mark_type_written();
        }

        loop {
            let written = match self.envelope().cursor().step(Self::FIELDS) {
                Step::Envelope(field) => self.envelope().write_field(field, w)?,
                Step::Field(field) => self.write_field(field, w)?,
                Step::Done => return Ok(true),
            };

            if !written {
                trace!(
                    "{:?} write stalled at field {}",
                    Self::TYPE,
                    self.envelope().cursor().next_index()
                );
                return Ok(false);
            }
            self.envelope_mut().cursor_mut().advance();
        }
    }

    /// Reads fields from `r` until the message is complete or the input runs out.
    ///
    /// The discriminator must already have been consumed.
    fn read_from(&mut self, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        loop {
            let read = match self.envelope().cursor().step(Self::FIELDS) {
                Step::Envelope(field) => self.envelope_mut().read_field(field, r)?,
                Step::Field(field) => self.read_field(field, r)?,
                Step::Done => return Ok(true),
            };

            if !read {
                trace!(
                    "{:?} read stalled at field {}",
                    Self::TYPE,
                    self.envelope().cursor().next_index()
                );
                return Ok(false);
            }
            self.envelope_mut().cursor_mut().advance();
        }
    }

    /// Rewinds the cursor so a completed message can be sent again.
    fn reset(&mut self) {
        self.envelope_mut().reset();
    }
}

/// Any message the registry knows how to decode.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyMessage {
    QueryRequest(QueryRequest),
    QueryResponse(QueryResponse),
}

impl AnyMessage {
    /// Blank message of the given type, ready to be read into.
    pub fn empty(kind: MessageType) -> Self {
        match kind {
            MessageType::QueryRequest => Self::QueryRequest(QueryRequest::default()),
            MessageType::QueryResponse => Self::QueryResponse(QueryResponse::default()),
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::QueryRequest(_) => MessageType::QueryRequest,
            Self::QueryResponse(_) => MessageType::QueryResponse,
        }
    }

    pub fn write_to(&mut self, w: &mut Writer<'_>) -> Result<bool, CodecError> {
        match self {
            Self::QueryRequest(m) => m.write_to(w),
            Self::QueryResponse(m) => m.write_to(w),
        }
    }

    pub fn read_from(&mut self, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        match self {
            Self::QueryRequest(m) => m.read_from(r),
            Self::QueryResponse(m) => m.read_from(r),
        }
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        match self {
            Self::QueryRequest(m) => m.validate(),
            Self::QueryResponse(m) => m.validate(),
        }
    }
}

impl From<QueryRequest> for AnyMessage {
    fn from(value: QueryRequest) -> Self {
        Self::QueryRequest(value)
    }
}

impl From<QueryResponse> for AnyMessage {
    fn from(value: QueryResponse) -> Self {
        Self::QueryResponse(value)
    }
}

/// Decodes one inbound message at a time from a fragmented byte stream.
#[derive(Debug, Default)]
pub struct MessageReader {
    partial: Option<AnyMessage>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a message has been started but not finished.
    pub fn in_progress(&self) -> bool {
        self.partial.is_some()
    }

    /// Feeds the reader; returns the message once its last field has been read.
    pub fn read(&mut self, r: &mut Reader<'_>) -> Result<Option<AnyMessage>, CodecError> {
        let message = match self.partial.as_mut() {
            Some(message) => message,
            None => {
                let Some(byte) = r.get_byte()? else {
                    return Ok(None);
                };
                let kind = decode_type(byte)?;
                debug!("decoding {kind:?}");
                self.partial.insert(AnyMessage::empty(kind))
            }
        };

        if !message.read_from(r)? {
            return Ok(None);
        }

        let message = self.partial.take();
        if let Some(message) = &message {
            message.validate()?;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_stable() {
        assert_eq!(u8::from(MessageType::QueryRequest), 57);
        assert_eq!(u8::from(MessageType::QueryResponse), 58);
        assert_eq!(decode_type(57).unwrap(), MessageType::QueryRequest);
    }

    #[test]
    fn unknown_type_is_rejected_before_fields() {
        let bytes = [56_u8, 0, 0, 0, 0];
        let mut reader = MessageReader::new();
        let mut input = Reader::new(&bytes);

        assert_eq!(
            reader.read(&mut input).unwrap_err(),
            CodecError::UnknownMessageType(56)
        );
        assert_eq!(input.position(), 1);
        assert!(!reader.in_progress());
    }

    #[test]
    fn empty_input_is_not_an_error() {
        let mut reader = MessageReader::new();

        assert_eq!(reader.read(&mut Reader::new(&[])).unwrap(), None);
        assert!(!reader.in_progress());
    }
}
