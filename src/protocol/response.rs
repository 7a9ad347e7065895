use std::fmt;

use bincode::{Decode, Encode};

use crate::{
    codec::{CodecError, Reader, Writer},
    marshal::{MarshalError, QueryArg, decode, encode},
    message::{Envelope, Message, MessageType},
};

const MESSAGE: &str = "query response";

/// One result row. Key/value queries produce two columns, field queries one per projection.
pub type Row = Vec<QueryArg>;

/// Describes one column of a field query.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FieldMeta {
    pub name: String,
    pub type_name: String,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Wire fields of [`QueryResponse`], in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseField {
    Data,
    Error,
    Fields,
    Finished,
    Metadata,
    Page,
    RequestId,
}

const RESPONSE_FIELDS: [ResponseField; 7] = [
    ResponseField::Data,
    ResponseField::Error,
    ResponseField::Fields,
    ResponseField::Finished,
    ResponseField::Metadata,
    ResponseField::Page,
    ResponseField::RequestId,
];

/// One page of results, or the failure of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    envelope: Envelope,
    request_id: i64,
    finished: bool,
    fields: bool,
    page: i32,
    data: Option<Vec<u8>>,
    metadata: Option<Vec<u8>>,
    error: Option<String>,
}

impl QueryResponse {
    /// Page `page` of the query `request_id`.
    pub fn page(
        request_id: i64,
        page: i32,
        fields: bool,
        rows: &[Row],
        metadata: Option<&[FieldMeta]>,
        finished: bool,
    ) -> Result<Self, MarshalError> {
        Ok(Self {
            request_id,
            page,
            fields,
            finished,
            data: Some(encode(rows)?),
            metadata: metadata.map(encode).transpose()?,
            ..Self::default()
        })
    }

    /// Final response reporting why the query failed.
    pub fn failed(request_id: i64, page: i32, fields: bool, cause: impl fmt::Display) -> Self {
        Self {
            request_id,
            page,
            fields,
            finished: true,
            error: Some(cause.to_string()),
            ..Self::default()
        }
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn fields(&self) -> bool {
        self.fields
    }

    pub fn page_number(&self) -> i32 {
        self.page
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Rows of this page; empty when the page carries none.
    pub fn rows(&self) -> Result<Vec<Row>, MarshalError> {
        match &self.data {
            Some(data) => decode(data),
            None => Ok(Vec::new()),
        }
    }

    pub fn metadata(&self) -> Result<Option<Vec<FieldMeta>>, MarshalError> {
        self.metadata.as_deref().map(decode).transpose()
    }
}

impl Message for QueryResponse {
    type Field = ResponseField;

    const TYPE: MessageType = MessageType::QueryResponse;
    const FIELDS: &'static [ResponseField] = &RESPONSE_FIELDS;

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn envelope_mut(&mut self) -> &mut Envelope {
        &mut self.envelope
    }

    fn write_field(&self, field: ResponseField, w: &mut Writer<'_>) -> Result<bool, CodecError> {
        match field {
            ResponseField::Data => w.put_byte_array(self.data.as_deref()),
            ResponseField::Error => w.put_string(self.error.as_deref()),
            ResponseField::Fields => w.put_bool(self.fields),
            ResponseField::Finished => w.put_bool(self.finished),
            ResponseField::Metadata => w.put_byte_array(self.metadata.as_deref()),
            ResponseField::Page => w.put_int(self.page),
            ResponseField::RequestId => w.put_long(self.request_id),
        }
    }

    fn read_field(&mut self, field: ResponseField, r: &mut Reader<'_>) -> Result<bool, CodecError> {
        macro_rules! read_into {
            ($read:expr => $target:expr) => {
                match $read? {
                    Some(value) => {
                        $target = value;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            };
        }

        match field {
            ResponseField::Data => read_into!(r.get_byte_array() => self.data),
            ResponseField::Error => read_into!(r.get_string() => self.error),
            ResponseField::Fields => read_into!(r.get_bool() => self.fields),
            ResponseField::Finished => read_into!(r.get_bool() => self.finished),
            ResponseField::Metadata => read_into!(r.get_byte_array() => self.metadata),
            ResponseField::Page => read_into!(r.get_int() => self.page),
            ResponseField::RequestId => read_into!(r.get_long() => self.request_id),
        }
    }

    fn validate(&self) -> Result<(), CodecError> {
        if self.page < 0 {
            return Err(CodecError::InvalidField {
                message: MESSAGE,
                field: "page",
                reason: format!("negative page number {}", self.page),
            });
        }

        if self.error.is_some() && !self.finished {
            return Err(CodecError::InvalidField {
                message: MESSAGE,
                field: "finished",
                reason: "a failed query must be finished".into(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AnyMessage, MessageReader};

    fn write_all(response: &mut QueryResponse) -> Vec<u8> {
        let mut buf = vec![0_u8; 1024];
        let mut w = Writer::new(&mut buf);
        assert!(response.write_to(&mut w).unwrap());
        let len = w.position();
        buf.truncate(len);
        buf
    }

    fn read_byte_by_byte(bytes: &[u8]) -> Result<QueryResponse, CodecError> {
        let mut reader = MessageReader::new();
        let mut pending = Vec::new();

        for byte in bytes {
            pending.push(*byte);
            let mut r = Reader::new(&pending);
            let message = reader.read(&mut r)?;
            let consumed = r.position();
            pending.drain(..consumed);

            if let Some(AnyMessage::QueryResponse(response)) = message {
                return Ok(response);
            }
        }
        panic!("stream ended before the response");
    }

    #[test]
    fn page_round_trips_with_rows_and_metadata() {
        let rows = vec![
            vec![QueryArg::Long(1), QueryArg::Text("ann".into())],
            vec![QueryArg::Long(2), QueryArg::Text("bob".into())],
        ];
        let meta = [FieldMeta::new("id", "i64"), FieldMeta::new("name", "string")];
        let mut response = QueryResponse::page(42, 0, true, &rows, Some(&meta), false).unwrap();

        let bytes = write_all(&mut response);
        assert_eq!(bytes[0], 58);

        let decoded = read_byte_by_byte(&bytes).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoded.rows().unwrap(), rows);
        assert_eq!(decoded.metadata().unwrap(), Some(meta.to_vec()));
        assert!(!decoded.is_finished());
    }

    #[test]
    fn failure_is_final_and_carries_cause() {
        let mut response = QueryResponse::failed(7, 2, false, "class not found");
        let decoded = read_byte_by_byte(&write_all(&mut response)).unwrap();

        assert!(decoded.is_finished());
        assert_eq!(decoded.error(), Some("class not found"));
        assert_eq!(decoded.page_number(), 2);
        assert!(decoded.rows().unwrap().is_empty());
        assert_eq!(decoded.metadata().unwrap(), None);
    }

    #[test]
    fn unfinished_failure_is_rejected() {
        let mut response = QueryResponse::failed(7, 0, false, "boom");
        response.finished = false;

        let err = read_byte_by_byte(&write_all(&mut response)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidField { field: "finished", .. }));
    }
}
