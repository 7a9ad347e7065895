use std::{
    collections::VecDeque,
    io::{self, Cursor, ErrorKind, Read, Write},
    net::TcpStream,
};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    codec::{CodecError, Reader, Writer, header::MAX_FIELD_LENGTH},
    marshal::MarshalError,
    message::{AnyMessage, Message, MessageReader},
};

/// Default outbound window size in bytes.
pub const DEFAULT_WINDOW: usize = 8 * 1024;

/// Largest window a connection grows to: one maximal field plus its prefix and the
/// discriminator byte.
const MAX_WINDOW: usize = MAX_FIELD_LENGTH + 8;

const READ_CHUNK: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("protocol violation: {0}")]
    Codec(#[from] CodecError),

    #[error("failed to marshal message: {0}")]
    Marshal(#[from] MarshalError),

    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("field does not fit in a {0} byte window")]
    FieldTooLarge(usize),
}

impl TransportError {
    /// Whether the stream position is lost and the connection has to be dropped.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Marshal(_))
    }
}

/// Byte streams that can hand over already-received bytes without blocking.
pub trait PollRead: Read {
    /// Reads whatever has arrived; `Ok(0)` when nothing is waiting.
    fn read_ready(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl PollRead for TcpStream {
    fn read_ready(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.set_nonblocking(true)?;
        let read = self.read(buf);
        self.set_nonblocking(false)?;

        match read {
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(0),
            other => other,
        }
    }
}

impl<B: AsRef<[u8]>> PollRead for Cursor<B> {
    fn read_ready(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }
}

/// Message-oriented connection over any byte stream.
///
/// Outbound messages are written through a bounded window that is flushed to the stream each
/// time it fills up. Inbound bytes are collected in a pending buffer and handed to a
/// [`MessageReader`] until a whole message has been decoded. Messages decoded ahead of time
/// by [`drain_cancels`](Self::drain_cancels) wait in an inbox.
pub struct Connection<T: Read + Write> {
    stream: T,
    window: Vec<u8>,
    pending: Vec<u8>,
    reader: MessageReader,
    inbox: VecDeque<AnyMessage>,
}

impl<T: Read + Write> Connection<T> {
    pub fn new(stream: T) -> Self {
        Self::with_window(stream, DEFAULT_WINDOW)
    }

    pub fn with_window(stream: T, window_size: usize) -> Self {
        Self {
            stream,
            window: vec![0; window_size.clamp(1, MAX_WINDOW)],
            pending: Vec::new(),
            reader: MessageReader::new(),
            inbox: VecDeque::new(),
        }
    }

    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    /// Writes the whole message, one window at a time.
    ///
    /// The window doubles whenever a single field does not fit into it empty.
    pub fn write_message<M: Message>(&mut self, message: &mut M) -> Result<(), TransportError> {
        loop {
            let mut w = Writer::new(&mut self.window);
            let done = message.write_to(&mut w)?;
            let len = w.position();

            self.stream.write_all(&self.window[..len])?;
            if done {
                self.stream.flush()?;
                debug!("sent {:?}", M::TYPE);
                return Ok(());
            }

            if len == 0 {
                let size = self.window.len();
                if size >= MAX_WINDOW {
                    return Err(TransportError::FieldTooLarge(size));
                }
                trace!("growing window from {size} bytes");
                self.window.resize((size * 2).min(MAX_WINDOW), 0);
            }
        }
    }

    /// Blocks until the next message has been read.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between two messages.
    pub fn read_message(&mut self) -> Result<Option<AnyMessage>, TransportError> {
        loop {
            if let Some(message) = self.inbox.pop_front() {
                return Ok(Some(message));
            }
            if let Some(message) = self.decode_pending()? {
                return Ok(Some(message));
            }

            let mut chunk = [0; READ_CHUNK];
            let n = match self.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                if self.pending.is_empty() && !self.reader.in_progress() {
                    return Ok(None);
                }
                return Err(TransportError::Closed);
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    fn decode_pending(&mut self) -> Result<Option<AnyMessage>, TransportError> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let mut r = Reader::new(&self.pending);
        let message = self.reader.read(&mut r)?;
        let consumed = r.position();
        self.pending.drain(..consumed);

        if let Some(message) = &message {
            debug!("received {:?}", message.message_type());
        }
        Ok(message)
    }
}

impl<T: PollRead + Write> Connection<T> {
    /// Ids of the cancel requests among the messages that have already arrived.
    ///
    /// Never blocks. Other complete messages stay queued, in order, for
    /// [`read_message`](Self::read_message).
    pub fn drain_cancels(&mut self) -> Result<Vec<i64>, TransportError> {
        let mut chunk = [0; READ_CHUNK];
        loop {
            let n = self.stream.read_ready(&mut chunk)?;
            self.pending.extend_from_slice(&chunk[..n]);
            if n < chunk.len() {
                break;
            }
        }
        while let Some(message) = self.decode_pending()? {
            self.inbox.push_back(message);
        }

        let mut cancels = Vec::new();
        self.inbox.retain(|message| match message {
            AnyMessage::QueryRequest(request) if request.is_cancel() => {
                cancels.push(request.id());
                false
            }
            _ => true,
        });
        if !cancels.is_empty() {
            trace!("picked up cancels {cancels:?} ahead of the read loop");
        }
        Ok(cancels)
    }
}
