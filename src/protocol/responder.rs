use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::Write,
    iter::Peekable,
    sync::Arc,
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use super::{
    Connection, FieldMeta, PollRead, QueryRequest, QueryResponse, Row, TransportError,
};
use crate::marshal::{ClassResolver, MarshalError, Marshaller, UnmarshalContext};

/// Cancelled ids remembered per responder before the oldest are forgotten.
const TOMBSTONE_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("unknown cache '{0}'")]
    UnknownCache(String),

    #[error("unsupported query: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

pub type RowStream = Box<dyn Iterator<Item = Row> + Send>;

/// Rows produced by an executor, plus the column descriptors of a field query.
pub struct QueryRows {
    pub rows: RowStream,
    pub metadata: Option<Vec<FieldMeta>>,
}

impl QueryRows {
    pub fn new(rows: impl Iterator<Item = Row> + Send + 'static) -> Self {
        Self {
            rows: Box::new(rows),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<FieldMeta>) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Runs a received query against local data.
///
/// User code slots are resolved through `ctx` only when the executor asks for them.
pub trait QueryExecutor: Send + Sync {
    fn execute(
        &self,
        request: &QueryRequest,
        ctx: &UnmarshalContext<'_>,
    ) -> Result<QueryRows, ExecutionError>;
}

/// Destination of the responses to one connection's queries.
pub trait ResponseSink {
    fn send(&mut self, response: QueryResponse) -> Result<(), TransportError>;

    /// Ids the requester has cancelled since the last call, without waiting for more.
    fn take_cancels(&mut self) -> Result<Vec<i64>, TransportError> {
        Ok(Vec::new())
    }
}

impl<T: PollRead + Write> ResponseSink for Connection<T> {
    fn send(&mut self, mut response: QueryResponse) -> Result<(), TransportError> {
        self.write_message(&mut response)
    }

    fn take_cancels(&mut self) -> Result<Vec<i64>, TransportError> {
        self.drain_cancels()
    }
}

/// Cuts a row stream into pages.
pub struct PageCursor {
    rows: Peekable<RowStream>,
    page_size: usize,
    single: bool,
    next_page: i32,
    done: bool,
}

impl PageCursor {
    pub fn new(rows: RowStream, page_size: i32, single: bool) -> Self {
        Self {
            rows: rows.peekable(),
            page_size: usize::try_from(page_size).unwrap_or(1).max(1),
            single,
            next_page: 0,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Next page number, its rows, and whether it is the last page.
    pub fn next_page(&mut self) -> (i32, Vec<Row>, bool) {
        let limit = if self.single { 1 } else { self.page_size };
        let rows: Vec<Row> = self.rows.by_ref().take(limit).collect();

        self.done = self.single || self.rows.peek().is_none();
        let page = self.next_page;
        self.next_page += 1;
        (page, rows, self.done)
    }
}

struct Running {
    cursor: PageCursor,
    fields: bool,
    all_pages: bool,
}

/// Identifies a query by the connection it came from and its id.
pub type QueryKey = (u64, i64);

/// Queries kept open between page requests, and ids that were cancelled.
#[derive(Default)]
pub struct ActiveQueries {
    running: Mutex<HashMap<QueryKey, Running>>,
    cancelled: Mutex<Tombstones>,
}

#[derive(Default)]
struct Tombstones {
    ids: HashSet<QueryKey>,
    order: VecDeque<QueryKey>,
}

impl Tombstones {
    fn insert(&mut self, key: QueryKey) {
        if !self.ids.insert(key) {
            return;
        }
        self.order.push_back(key);

        if self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

impl ActiveQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the query if it is open and remembers that it was cancelled.
    pub fn cancel(&self, key: QueryKey) {
        let mut running = self.running.lock();
        let closed = running.remove(&key).is_some();
        self.cancelled.lock().insert(key);
        debug!("cancel {key:?} (open: {closed})");
    }

    pub fn is_cancelled(&self, key: QueryKey) -> bool {
        self.cancelled.lock().ids.contains(&key)
    }

    pub fn is_open(&self, key: QueryKey) -> bool {
        self.running.lock().contains_key(&key)
    }

    /// Number of queries waiting for a page request.
    pub fn open(&self) -> usize {
        self.running.lock().len()
    }

    /// Drops every query opened by `peer`.
    pub fn close_peer(&self, peer: u64) {
        self.running.lock().retain(|(owner, _), _| *owner != peer);
    }

    fn take(&self, key: QueryKey) -> Option<Running> {
        self.running.lock().remove(&key)
    }

    fn park(&self, key: QueryKey, query: Running) {
        let mut running = self.running.lock();
        // a cancel may have raced the page that was just sent
        if !self.is_cancelled(key) {
            running.insert(key, query);
        }
    }
}

/// Executes received query requests and answers them page by page.
pub struct QueryResponder {
    executor: Arc<dyn QueryExecutor>,
    marshaller: Marshaller,
    resolver: Arc<dyn ClassResolver>,
    active: Arc<ActiveQueries>,
}

impl QueryResponder {
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        marshaller: Marshaller,
        resolver: Arc<dyn ClassResolver>,
    ) -> Self {
        Self {
            executor,
            marshaller,
            resolver,
            active: Arc::new(ActiveQueries::new()),
        }
    }

    pub fn active(&self) -> &Arc<ActiveQueries> {
        &self.active
    }

    /// Handles one request from `peer`, sending any responses to `sink`.
    ///
    /// Only failures of the sink are returned; query failures are reported to the requester.
    pub fn handle<S: ResponseSink>(
        &self,
        peer: u64,
        request: QueryRequest,
        sink: &mut S,
    ) -> Result<(), TransportError> {
        let key = (peer, request.id());

        if request.is_cancel() {
            self.active.cancel(key);
            return Ok(());
        }

        if self.active.is_cancelled(key) {
            debug!("query {key:?} was cancelled before it ran");
            let empty = QueryResponse::page(request.id(), 0, request.fields(), &[], None, true)?;
            return sink.send(empty);
        }

        if request.is_page_request() {
            let Some(query) = self.active.take(key) else {
                let cause = format!("query {} is not open", request.id());
                return sink.send(QueryResponse::failed(request.id(), 0, request.fields(), cause));
            };
            return self.stream(key, query, None, sink);
        }

        info!(
            "running {:?} query {} on cache {:?} for peer {peer}",
            request.kind(),
            request.id(),
            request.cache_name()
        );

        let rows = request
            .unmarshal_context(&self.marshaller, self.resolver.as_ref())
            .map_err(ExecutionError::from)
            .and_then(|ctx| self.executor.execute(&request, &ctx));

        let rows = match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!("query {key:?} failed: {e}");
                return sink.send(QueryResponse::failed(request.id(), 0, request.fields(), e));
            }
        };

        let metadata = rows.metadata.filter(|_| request.include_metadata());
        let query = Running {
            cursor: PageCursor::new(rows.rows, request.page_size(), request.single()),
            fields: request.fields(),
            all_pages: request.all_pages(),
        };
        self.stream(key, query, metadata, sink)
    }

    /// Sends pages until the last one, or one page when the requester pulls.
    ///
    /// Cancels that reach the sink between pages stop the stream.
    fn stream<S: ResponseSink>(
        &self,
        key: QueryKey,
        mut query: Running,
        mut metadata: Option<Vec<FieldMeta>>,
        sink: &mut S,
    ) -> Result<(), TransportError> {
        let id = key.1;

        loop {
            let (page, rows, last) = query.cursor.next_page();
            let page_metadata = metadata.take();
            let response = QueryResponse::page(
                id,
                page,
                query.fields,
                &rows,
                page_metadata.as_deref(),
                last,
            )
            .unwrap_or_else(|e| QueryResponse::failed(id, page, query.fields, e));
            let finished = response.is_finished();
            sink.send(response)?;

            if finished {
                return Ok(());
            }
            for cancelled in sink.take_cancels()? {
                self.active.cancel((key.0, cancelled));
            }
            if self.active.is_cancelled(key) {
                debug!("query {key:?} cancelled after page {page}");
                return Ok(());
            }
            if !query.all_pages {
                self.active.park(key, query);
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory executor shared by protocol tests.
    use super::*;
    use crate::{
        marshal::{QueryArg, testing::MinAge},
        protocol::{CodeField, QueryKind},
    };

    /// Serves a single cache of `(id, age)` rows; honours a [`MinAge`] key filter.
    pub struct AgeTable {
        pub cache: String,
        pub ages: Vec<i64>,
    }

    impl QueryExecutor for AgeTable {
        fn execute(
            &self,
            request: &QueryRequest,
            ctx: &UnmarshalContext<'_>,
        ) -> Result<QueryRows, ExecutionError> {
            if request.cache_name() != Some(self.cache.as_str()) {
                return Err(ExecutionError::UnknownCache(
                    request.cache_name().unwrap_or_default().to_owned(),
                ));
            }
            if request.kind() != Some(QueryKind::Scan) {
                return Err(ExecutionError::Unsupported(format!("{:?}", request.kind())));
            }

            let min = match request.code(CodeField::KeyFilter, ctx)? {
                Some(code) => code.downcast_ref::<MinAge>().map_or(0, |m| i64::from(m.0)),
                None => 0,
            };
            let rows: Vec<Row> = self
                .ages
                .iter()
                .enumerate()
                .filter(|(_, age)| **age >= min)
                .map(|(i, age)| vec![QueryArg::Long(i as i64), QueryArg::Long(*age)])
                .collect();

            Ok(QueryRows::new(rows.into_iter()).with_metadata(vec![
                FieldMeta::new("id", "i64"),
                FieldMeta::new("age", "i64"),
            ]))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Cursor, Read};

    use super::{testing::AgeTable, *};
    use crate::{
        marshal::{
            BincodeClass, ClassRegistry, CodeKind, NodeId, QueryArg,
            testing::{MIN_AGE_CLASS, MinAge},
        },
        message::{AnyMessage, Message},
        protocol::QueryKind,
    };

    #[derive(Default)]
    struct VecSink(Vec<QueryResponse>);

    impl ResponseSink for VecSink {
        fn send(&mut self, response: QueryResponse) -> Result<(), TransportError> {
            self.0.push(response);
            Ok(())
        }
    }

    /// Reads from a canned input and collects everything written.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl PollRead for Duplex {
        fn read_ready(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Delivers a cancel for `id` once `after` pages have been sent.
    struct CancellingSink {
        sent: Vec<QueryResponse>,
        id: i64,
        after: usize,
    }

    impl ResponseSink for CancellingSink {
        fn send(&mut self, response: QueryResponse) -> Result<(), TransportError> {
            self.sent.push(response);
            Ok(())
        }

        fn take_cancels(&mut self) -> Result<Vec<i64>, TransportError> {
            if self.sent.len() == self.after {
                Ok(vec![self.id])
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn responder() -> QueryResponder {
        let registry = ClassRegistry::new();
        registry.register(BincodeClass::<MinAge>::new(MIN_AGE_CLASS, CodeKind::Predicate));

        QueryResponder::new(
            Arc::new(AgeTable {
                cache: "people".into(),
                ages: vec![12, 35, 41, 67, 29],
            }),
            Marshaller::local(NodeId(2)),
            Arc::new(registry),
        )
    }

    fn scan(id: i64, page_size: i32) -> crate::protocol::QueryRequestBuilder {
        QueryRequest::builder(id, "people")
            .kind(QueryKind::Scan)
            .page_size(page_size)
    }

    /// Request as the responder would receive it off the wire.
    fn received(mut request: QueryRequest) -> QueryRequest {
        request.prepare_marshal(&Marshaller::local(NodeId(1))).unwrap();
        let mut buf = vec![0_u8; 1024];
        let mut w = crate::codec::Writer::new(&mut buf);
        assert!(request.write_to(&mut w).unwrap());
        let len = w.position();

        let mut reader = crate::message::MessageReader::new();
        match reader.read(&mut crate::codec::Reader::new(&buf[..len])).unwrap() {
            Some(crate::message::AnyMessage::QueryRequest(request)) => request,
            other => panic!("decoded {other:?}"),
        }
    }

    fn ids(response: &QueryResponse) -> Vec<Row> {
        response.rows().unwrap()
    }

    #[test]
    fn pages_are_pulled_one_at_a_time() {
        let responder = responder();
        let mut sink = VecSink::default();

        responder
            .handle(1, received(scan(7, 2).build().unwrap()), &mut sink)
            .unwrap();
        assert_eq!(sink.0.len(), 1);
        assert!(!sink.0[0].is_finished());
        assert!(responder.active().is_open((1, 7)));

        let pull = QueryRequest::page_request(7, "people", 2, false, false, false, false);
        responder.handle(1, pull.clone(), &mut sink).unwrap();
        responder.handle(1, pull, &mut sink).unwrap();

        let pages: Vec<_> = sink.0.iter().map(|r| r.page_number()).collect();
        assert_eq!(pages, vec![0, 1, 2]);
        assert_eq!(ids(&sink.0[2]).len(), 1);
        assert!(sink.0[2].is_finished());
        assert!(!responder.active().is_open((1, 7)));
    }

    #[test]
    fn all_pages_streams_without_pulls() {
        let responder = responder();
        let mut sink = VecSink::default();

        let request = scan(3, 2).all_pages(true).include_metadata(true);
        responder
            .handle(1, received(request.build().unwrap()), &mut sink)
            .unwrap();

        assert_eq!(sink.0.len(), 3);
        assert!(sink.0[2].is_finished());
        assert!(sink.0[0].metadata().unwrap().is_some());
        assert!(sink.0[1].metadata().unwrap().is_none());
        assert_eq!(responder.active().open(), 0);
    }

    #[test]
    fn cancel_during_all_pages_stops_the_stream() {
        let responder = responder();
        let mut sink = CancellingSink {
            sent: Vec::new(),
            id: 3,
            after: 2,
        };

        let request = scan(3, 1).all_pages(true);
        responder
            .handle(1, received(request.build().unwrap()), &mut sink)
            .unwrap();

        assert_eq!(sink.sent.len(), 2);
        assert!(sink.sent.iter().all(|r| !r.is_finished()));
        assert!(responder.active().is_cancelled((1, 3)));
        assert_eq!(responder.active().open(), 0);
    }

    #[test]
    fn connection_cancels_reach_a_running_stream() {
        let responder = responder();
        let mut inbound = Connection::new(Cursor::new(Vec::new()));
        inbound
            .write_message(&mut QueryRequest::cancel(3, false))
            .unwrap();
        let mut connection = Connection::new(Duplex {
            input: Cursor::new(inbound.get_ref().get_ref().clone()),
            output: Vec::new(),
        });

        let request = scan(3, 1).all_pages(true);
        responder
            .handle(1, received(request.build().unwrap()), &mut connection)
            .unwrap();

        assert!(responder.active().is_cancelled((1, 3)));
        assert!(connection.read_message().unwrap().is_none());

        let mut sent = Connection::new(Cursor::new(connection.get_ref().output.clone()));
        assert!(matches!(
            sent.read_message().unwrap(),
            Some(AnyMessage::QueryResponse(response)) if !response.is_finished()
        ));
        assert!(sent.read_message().unwrap().is_none());
    }

    #[test]
    fn single_stops_after_first_row() {
        let responder = responder();
        let mut sink = VecSink::default();

        responder
            .handle(1, received(scan(3, 10).single(true).build().unwrap()), &mut sink)
            .unwrap();

        assert_eq!(sink.0.len(), 1);
        assert!(sink.0[0].is_finished());
        assert_eq!(ids(&sink.0[0]).len(), 1);
    }

    #[test]
    fn key_filter_is_resolved_on_demand() {
        let responder = responder();
        let mut sink = VecSink::default();

        let request = scan(5, 10).key_filter(Arc::new(MinAge(40))).build().unwrap();
        responder.handle(1, received(request), &mut sink).unwrap();

        assert_eq!(ids(&sink.0[0]).len(), 2);
        assert!(sink.0[0].is_finished());
    }

    #[test]
    fn cancel_before_query_yields_empty_final_page() {
        let responder = responder();
        let mut sink = VecSink::default();

        responder
            .handle(1, received(QueryRequest::cancel(9, false)), &mut sink)
            .unwrap();
        assert!(sink.0.is_empty());

        responder
            .handle(1, received(scan(9, 2).build().unwrap()), &mut sink)
            .unwrap();
        assert_eq!(sink.0.len(), 1);
        assert!(sink.0[0].is_finished());
        assert!(ids(&sink.0[0]).is_empty());
    }

    #[test]
    fn cancel_closes_open_query() {
        let responder = responder();
        let mut sink = VecSink::default();

        responder
            .handle(2, received(scan(4, 2).build().unwrap()), &mut sink)
            .unwrap();
        responder
            .handle(2, QueryRequest::cancel(4, false), &mut sink)
            .unwrap();
        assert!(!responder.active().is_open((2, 4)));

        // late cancel for a query that never existed is a no-op
        responder
            .handle(2, QueryRequest::cancel(400, false), &mut sink)
            .unwrap();
        assert_eq!(sink.0.len(), 1);
    }

    #[test]
    fn queries_are_keyed_by_peer() {
        let responder = responder();
        let mut sink = VecSink::default();

        responder
            .handle(1, QueryRequest::cancel(6, false), &mut sink)
            .unwrap();
        responder
            .handle(2, received(scan(6, 10).build().unwrap()), &mut sink)
            .unwrap();

        assert_eq!(ids(&sink.0[0]).len(), 5);
    }

    #[test]
    fn failures_become_final_responses() {
        let responder = responder();
        let mut sink = VecSink::default();

        let unknown = QueryRequest::builder(1, "cars")
            .kind(QueryKind::Scan)
            .page_size(1)
            .build()
            .unwrap();
        responder.handle(1, received(unknown), &mut sink).unwrap();

        let pull = QueryRequest::page_request(99, "people", 2, false, false, false, false);
        responder.handle(1, pull, &mut sink).unwrap();

        assert!(sink.0.iter().all(|r| r.is_finished() && r.error().is_some()));
        assert_eq!(sink.0[0].error(), Some("unknown cache 'cars'"));
    }

    #[test]
    fn missing_class_fails_the_query_only() {
        let responder = QueryResponder::new(
            Arc::new(AgeTable {
                cache: "people".into(),
                ages: vec![50],
            }),
            Marshaller::local(NodeId(2)),
            Arc::new(ClassRegistry::new()),
        );
        let mut sink = VecSink::default();

        let request = scan(5, 10).key_filter(Arc::new(MinAge(40))).build().unwrap();
        responder.handle(1, received(request), &mut sink).unwrap();
        responder
            .handle(1, received(scan(6, 10).build().unwrap()), &mut sink)
            .unwrap();

        assert!(sink.0[0].error().unwrap().contains(MIN_AGE_CLASS));
        assert_eq!(ids(&sink.0[1]).len(), 1);
    }

    #[test]
    fn cursor_cuts_rows_into_pages() {
        let rows: RowStream = Box::new((0..5).map(|i| vec![QueryArg::Int(i)]));
        let mut cursor = PageCursor::new(rows, 2, false);

        let mut pages = Vec::new();
        while !cursor.is_done() {
            let (page, rows, last) = cursor.next_page();
            pages.push((page, rows.len(), last));
        }
        assert_eq!(pages, vec![(0, 2, false), (1, 2, false), (2, 1, true)]);

        let mut empty = PageCursor::new(Box::new(std::iter::empty()), 2, false);
        assert_eq!(empty.next_page(), (0, Vec::new(), true));
    }

    #[test]
    fn tombstones_are_bounded() {
        let mut tombstones = Tombstones::default();
        for id in 0..(TOMBSTONE_CAPACITY as i64 + 10) {
            tombstones.insert((0, id));
        }

        assert_eq!(tombstones.ids.len(), TOMBSTONE_CAPACITY);
        assert!(!tombstones.ids.contains(&(0, 0)));
    }
}
