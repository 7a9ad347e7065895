//! Message layer for distributed cache queries.
//!
//! Layers, leaves first:
//!
//! - [`codec`]: primitive fields in and out of bounded byte windows.
//! - [`message`]: resumable, field-by-field writing and reading of whole messages.
//! - [`marshal`]: user code and arguments to opaque payloads and back.
//! - [`protocol`]: query requests, paged responses, cancellation, and the connections that
//!   carry them.
pub mod codec;
pub mod config;
pub mod marshal;
pub mod message;
pub mod protocol;

pub use config::{ConfigError, NodeConfig};
pub use message::{AnyMessage, Message, MessageReader, MessageType};
pub use protocol::{QueryClient, QueryKind, QueryRequest, QueryResponse, QueryServer};
