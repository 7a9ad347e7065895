use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};

use crate::{marshal::Marshaller, message::AnyMessage};

use super::{Connection, PageEvent, QueryRequest, QueryState, QueryTracker, TransportError};

/// Requesting side of a connection: submits queries, pulls pages and cancels.
pub struct QueryClient<T: Read + Write> {
    connection: Connection<T>,
    tracker: Arc<QueryTracker>,
    marshaller: Marshaller,
}

impl QueryClient<TcpStream> {
    pub fn connect(
        address: SocketAddr,
        marshaller: Marshaller,
        window_size: usize,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address)?;
        info!("connected to {address}");
        Ok(Self::new(stream, marshaller, window_size))
    }
}

impl<T: Read + Write> QueryClient<T> {
    pub fn new(stream: T, marshaller: Marshaller, window_size: usize) -> Self {
        Self {
            connection: Connection::with_window(stream, window_size),
            tracker: Arc::new(QueryTracker::new()),
            marshaller,
        }
    }

    pub fn tracker(&self) -> &Arc<QueryTracker> {
        &self.tracker
    }

    pub fn next_id(&self) -> i64 {
        self.tracker.next_id()
    }

    /// Marshals and sends a full query, returning its id.
    pub fn submit(&mut self, mut request: QueryRequest) -> Result<i64, TransportError> {
        request.prepare_marshal(&self.marshaller)?;
        self.tracker.issue(&request);
        if let Err(e) = self.connection.write_message(&mut request) {
            self.tracker.forget(request.id());
            return Err(e);
        }

        debug!("submitted query {}", request.id());
        Ok(request.id())
    }

    /// Blocks until the next response and reports what it meant.
    pub fn next_event(&mut self) -> Result<PageEvent, TransportError> {
        loop {
            match self.connection.read_message()? {
                Some(AnyMessage::QueryResponse(response)) => {
                    return Ok(self.tracker.on_response(&response));
                }
                Some(other) => warn!("ignoring {:?} from responder", other.message_type()),
                None => return Err(TransportError::Closed),
            }
        }
    }

    /// Asks for the next page; `false` when the query is not waiting for one.
    pub fn fetch_next_page(&mut self, id: i64) -> Result<bool, TransportError> {
        let Some(mut request) = self.tracker.page_request(id) else {
            return Ok(false);
        };
        self.connection.write_message(&mut request)?;
        Ok(true)
    }

    /// Sends a cancel without waiting for any acknowledgement.
    pub fn cancel(&mut self, id: i64) -> Result<bool, TransportError> {
        let Some(mut request) = self.tracker.cancel(id) else {
            return Ok(false);
        };
        self.connection.write_message(&mut request)?;
        info!("cancelled query {id}");
        Ok(true)
    }

    /// Runs `request` to completion, pulling pages as needed.
    ///
    /// Setting `interrupt` cancels the query before the next page is awaited.
    pub fn run_query<F>(
        &mut self,
        request: QueryRequest,
        interrupt: &AtomicBool,
        mut on_event: F,
    ) -> Result<QueryState, TransportError>
    where
        F: FnMut(&PageEvent),
    {
        let streamed = request.all_pages();
        let id = self.submit(request)?;

        loop {
            let state = self.tracker.state(id).unwrap_or(QueryState::Done);
            if state.is_terminal() {
                self.tracker.forget(id);
                return Ok(state);
            }

            if interrupt.load(Ordering::SeqCst) {
                self.cancel(id)?;
                continue;
            }

            let event = self.next_event()?;
            match &event {
                PageEvent::Page {
                    id: page_id,
                    last: false,
                    ..
                } if *page_id == id => {
                    on_event(&event);
                    if !streamed {
                        self.fetch_next_page(id)?;
                    }
                }
                PageEvent::Page { id: page_id, .. } | PageEvent::Failed { id: page_id, .. }
                    if *page_id == id =>
                {
                    on_event(&event);
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};

    use super::*;
    use crate::{
        marshal::{NodeId, QueryArg},
        protocol::{QueryKind, QueryResponse},
    };

    /// Replays canned responses and records everything the client sends.
    struct Scripted {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client(responses: Vec<QueryResponse>) -> QueryClient<Scripted> {
        let mut encoder = Connection::new(Cursor::new(Vec::new()));
        for mut response in responses {
            encoder.write_message(&mut response).unwrap();
        }
        let stream = Scripted {
            input: Cursor::new(encoder.get_ref().get_ref().clone()),
            output: Vec::new(),
        };
        QueryClient::new(stream, Marshaller::local(NodeId(1)), 32)
    }

    fn sent(client: &QueryClient<Scripted>) -> Vec<QueryRequest> {
        let output = client.connection.get_ref().output.clone();
        let mut decoder = Connection::new(Cursor::new(output));
        let mut requests = Vec::new();
        while let Some(message) = decoder.read_message().unwrap() {
            match message {
                AnyMessage::QueryRequest(request) => requests.push(request),
                other => panic!("client sent {other:?}"),
            }
        }
        requests
    }

    fn scan(id: i64) -> QueryRequest {
        QueryRequest::builder(id, "people")
            .kind(QueryKind::Scan)
            .page_size(1)
            .build()
            .unwrap()
    }

    fn page(page: i32, last: bool) -> QueryResponse {
        QueryResponse::page(1, page, false, &[vec![QueryArg::Int(page)]], None, last).unwrap()
    }

    #[test]
    fn pulls_pages_until_the_last() {
        let mut client = client(vec![page(0, false), page(1, false), page(2, true)]);
        let id = client.next_id();

        let mut seen = Vec::new();
        let state = client
            .run_query(scan(id), &AtomicBool::new(false), |event| {
                if let PageEvent::Page { page, .. } = event {
                    seen.push(*page);
                }
            })
            .unwrap();

        assert_eq!(state, QueryState::Done);
        assert_eq!(seen, vec![0, 1, 2]);

        let requests = sent(&client);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].kind(), Some(QueryKind::Scan));
        assert!(requests[1..].iter().all(|r| r.is_page_request() && r.id() == id));
    }

    #[test]
    fn interrupt_sends_a_cancel() {
        let mut client = client(Vec::new());
        let id = client.next_id();

        let state = client
            .run_query(scan(id), &AtomicBool::new(true), |_| {})
            .unwrap();

        assert_eq!(state, QueryState::Cancelled);
        let requests = sent(&client);
        assert_eq!(requests.len(), 2);
        assert!(requests[1].is_cancel());
        assert_eq!(requests[1].id(), id);
    }

    #[test]
    fn closed_stream_is_reported() {
        let mut client = client(Vec::new());
        client.submit(scan(client.next_id())).unwrap();

        assert!(matches!(client.next_event(), Err(TransportError::Closed)));
    }

    #[test]
    fn failure_ends_the_query() {
        let mut client = client(vec![QueryResponse::failed(1, 0, false, "unknown cache")]);
        let id = client.next_id();

        let mut failures = 0;
        let state = client
            .run_query(scan(id), &AtomicBool::new(false), |event| {
                if matches!(event, PageEvent::Failed { .. }) {
                    failures += 1;
                }
            })
            .unwrap();

        assert_eq!(state, QueryState::Done);
        assert_eq!(failures, 1);
        assert_eq!(sent(&client).len(), 1);
    }

    struct Unwritable;

    impl Read for Unwritable {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for Unwritable {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_submit_leaves_nothing_tracked() {
        let mut client = QueryClient::new(Unwritable, Marshaller::local(NodeId(1)), 64);
        let id = client.next_id();

        assert!(client.submit(scan(id)).is_err());
        assert_eq!(client.tracker().state(id), None);
    }
}
