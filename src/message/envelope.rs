use crate::codec::{CodecError, Reader, Writer};

/// Fields carried by every message ahead of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeField {
    DeploymentInfo,
    MessageId,
}

pub(crate) const ENVELOPE_FIELDS: [EnvelopeField; 2] =
    [EnvelopeField::DeploymentInfo, EnvelopeField::MessageId];

/// Next unit of work for a resumable write or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<F> {
    Envelope(EnvelopeField),
    Field(F),
    Done,
}

/// Resume point of a partially written or read message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    type_written: bool,
    next: usize,
}

impl Cursor {
    pub fn type_written(&self) -> bool {
        self.type_written
    }

    pub fn mark_type_written(&mut self) {
        self.type_written = true;
    }

    /// Index of the next field, counting envelope fields first.
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Resolves the cursor against a message's field table.
    pub fn step<F: Copy>(&self, fields: &[F]) -> Step<F> {
        match self.next.checked_sub(ENVELOPE_FIELDS.len()) {
            None => Step::Envelope(ENVELOPE_FIELDS[self.next]),
            Some(i) => fields.get(i).copied().map_or(Step::Done, Step::Field),
        }
    }

    pub fn advance(&mut self) {
        self.next += 1;
    }
}

/// Header state shared by every wire message.
///
/// The cursor is transport bookkeeping and takes no part in equality.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    cursor: Cursor,
    deployment: Option<Vec<u8>>,
    message_id: i64,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.deployment == other.deployment && self.message_id == other.message_id
    }
}

impl Envelope {
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    /// Rewinds the cursor so the message can be written again from the start.
    pub fn reset(&mut self) {
        self.cursor = Cursor::default();
    }

    /// Encoded deployment metadata, see [`DeploymentInfo`](crate::marshal::DeploymentInfo).
    pub fn deployment(&self) -> Option<&[u8]> {
        self.deployment.as_deref()
    }

    pub fn set_deployment(&mut self, payload: Option<Vec<u8>>) {
        self.deployment = payload;
    }

    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    pub fn set_message_id(&mut self, id: i64) {
        self.message_id = id;
    }

    pub(crate) fn write_field(
        &self,
        field: EnvelopeField,
        w: &mut Writer<'_>,
    ) -> Result<bool, CodecError> {
        match field {
            EnvelopeField::DeploymentInfo => w.put_byte_array(self.deployment.as_deref()),
            EnvelopeField::MessageId => w.put_long(self.message_id),
        }
    }

    pub(crate) fn read_field(
        &mut self,
        field: EnvelopeField,
        r: &mut Reader<'_>,
    ) -> Result<bool, CodecError> {
        match field {
            EnvelopeField::DeploymentInfo => match r.get_byte_array()? {
                Some(payload) => self.deployment = payload,
                None => return Ok(false),
            },
            EnvelopeField::MessageId => match r.get_long()? {
                Some(id) => self.message_id = id,
                None => return Ok(false),
            },
        }
        Ok(true)
    }
}
