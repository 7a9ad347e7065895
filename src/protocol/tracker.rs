use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
};

use log::{debug, warn};
use parking_lot::Mutex;

use super::{FieldMeta, QueryRequest, QueryResponse, Row};

/// Lifecycle of a query on the requesting node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Issued,
    Paging,
    Done,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }
}

/// What a received response meant for its query.
#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    Page {
        id: i64,
        page: i32,
        rows: Vec<Row>,
        metadata: Option<Vec<FieldMeta>>,
        last: bool,
    },
    Failed {
        id: i64,
        cause: String,
    },
    /// Response for an unknown, finished or cancelled query.
    Ignored {
        id: i64,
    },
}

#[derive(Debug)]
struct Tracked {
    state: QueryState,
    next_page: i32,
    error: Option<String>,
    template: QueryRequest,
}

/// Requester-side table of outstanding queries.
#[derive(Debug, Default)]
pub struct QueryTracker {
    queries: Mutex<HashMap<i64, Tracked>>,
    next_id: AtomicI64,
}

impl QueryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh query id, unique for the lifetime of this tracker.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Starts tracking `request`, which must be a full query.
    pub fn issue(&self, request: &QueryRequest) {
        let template = QueryRequest::page_request(
            request.id(),
            request.cache_name().unwrap_or_default(),
            request.page_size(),
            request.clone_values(),
            request.include_backups(),
            request.fields(),
            request.all_pages(),
        );

        self.queries.lock().insert(
            request.id(),
            Tracked {
                state: QueryState::Issued,
                next_page: 0,
                error: None,
                template,
            },
        );
    }

    pub fn on_response(&self, response: &QueryResponse) -> PageEvent {
        let id = response.request_id();
        let mut queries = self.queries.lock();

        let Some(query) = queries.get_mut(&id).filter(|q| !q.state.is_terminal()) else {
            debug!("dropping response for inactive query {id}");
            return PageEvent::Ignored { id };
        };

        if let Some(cause) = response.error() {
            query.state = QueryState::Done;
            query.error = Some(cause.to_owned());
            return PageEvent::Failed {
                id,
                cause: cause.to_owned(),
            };
        }

        if response.page_number() < query.next_page {
            warn!(
                "query {id}: page {} arrived after page {}",
                response.page_number(),
                query.next_page - 1
            );
            return PageEvent::Ignored { id };
        }

        let decoded = response
            .rows()
            .and_then(|rows| Ok((rows, response.metadata()?)));
        let (rows, metadata) = match decoded {
            Ok(decoded) => decoded,
            Err(e) => {
                query.state = QueryState::Done;
                query.error = Some(e.to_string());
                return PageEvent::Failed {
                    id,
                    cause: e.to_string(),
                };
            }
        };

        query.next_page = response.page_number() + 1;
        query.state = if response.is_finished() {
            QueryState::Done
        } else {
            QueryState::Paging
        };

        PageEvent::Page {
            id,
            page: response.page_number(),
            rows,
            metadata,
            last: response.is_finished(),
        }
    }

    /// Marks the query cancelled and returns the cancel request to send, or `None` when the
    /// query is unknown or already over.
    pub fn cancel(&self, id: i64) -> Option<QueryRequest> {
        let mut queries = self.queries.lock();
        let query = queries.get_mut(&id).filter(|q| !q.state.is_terminal())?;

        query.state = QueryState::Cancelled;
        Some(QueryRequest::cancel(id, query.template.fields()))
    }

    /// Request for the next page of a query that is waiting to be pulled.
    pub fn page_request(&self, id: i64) -> Option<QueryRequest> {
        let queries = self.queries.lock();
        let query = queries.get(&id)?;

        (query.state == QueryState::Paging).then(|| query.template.clone())
    }

    pub fn state(&self, id: i64) -> Option<QueryState> {
        self.queries.lock().get(&id).map(|q| q.state)
    }

    /// Cause reported for a failed query.
    pub fn error(&self, id: i64) -> Option<String> {
        self.queries.lock().get(&id).and_then(|q| q.error.clone())
    }

    /// Stops tracking a query, returning its last state.
    pub fn forget(&self, id: i64) -> Option<QueryState> {
        self.queries.lock().remove(&id).map(|q| q.state)
    }
}
