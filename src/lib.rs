//! Deferred, rollback-aware callbacks scoped to nested in-memory transactions.
//!
//! A [`Connection`] mirrors the transaction discipline of a real database
//! connection for arbitrary application work: [`Operation`]s registered inside
//! a transaction are buffered and run their commit callbacks only when the
//! outermost transaction commits, or their rollback callbacks as soon as the
//! level they were registered at rolls back. An [`Indexer`] tracks buffered
//! operations by key and prunes itself as they are resolved.
//!
//! Everything is single-threaded and synchronous; handles are `Rc`-based.

mod connection;
mod error;
mod indexer;
mod operation;

pub use connection::{Connection, ConnectionConfig, ConnectionId, ConnectionState, Position};
pub use error::{CallbackError, CallbackFailure, Resolution, TransactionError};
pub use indexer::Indexer;
pub use operation::{CallbackResult, Operation, Phase};

// Callback results and metadata are JSON values.
pub use serde_json::Value;
