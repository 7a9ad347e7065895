//! Distributed cache query protocol.
//!
//! A requesting node submits a [`QueryRequest`] to a responding node, which answers with one
//! or more [`QueryResponse`] pages. Both travel over a [`Connection`], which drives the
//! resumable message machinery against a socket.
//!
//! # Requester
//!
//! [`QueryClient`] marshals and sends requests and feeds every response into a
//! [`QueryTracker`]. Per query id the tracker moves through [`QueryState`]:
//!
//! - `Issued` once the request has been sent;
//! - `Paging` after a page that is not the last;
//! - `Done` after the last page or a failure;
//! - `Cancelled` when the requester gave up first.
//!
//! `Done` and `Cancelled` are terminal; responses arriving afterwards are ignored.
//!
//! # Responder
//!
//! [`QueryResponder`] hands each full request to a [`QueryExecutor`] and cuts the rows it
//! returns into pages of `pageSize` rows with a [`PageCursor`]. Without `allPages` the query
//! is parked in [`ActiveQueries`] after each page until the requester pulls the next one with
//! a page request. Cancels are matched by requester and id only; a cancel that arrives
//! before its query makes that query finish at once with an empty final page, and a cancel
//! for an unknown or finished query is ignored.
//!
//! Executor and marshalling failures are sent back as a final response carrying the cause.
//! They never close the connection; protocol violations always do.
mod client;
mod request;
mod responder;
mod response;
mod server;
mod thread;
mod tracker;
mod transport;

use thread::ThreadPool;

pub use client::QueryClient;
pub use request::{CodeField, QueryKind, QueryRequest, QueryRequestBuilder, RequestField};
pub use responder::{
    ActiveQueries, ExecutionError, PageCursor, QueryExecutor, QueryKey, QueryResponder,
    QueryRows, ResponseSink, RowStream,
};
pub use response::{FieldMeta, QueryResponse, ResponseField, Row};
pub use server::QueryServer;
pub use tracker::{PageEvent, QueryState, QueryTracker};
pub use transport::{Connection, DEFAULT_WINDOW, PollRead, TransportError};
