//! PostgreSQL wire-protocol statement execution engine.
//!
//! SQL text arrives through the [`connection`] dispatcher, is parsed and
//! compiled by the services in [`backend`], turned into a [`PgStatement`] by
//! the [`generator`] chain, cached in the [`StatementCache`], and run against a
//! [`Portal`] whose rows reach the client through an [`outputter`].

pub mod ast;
pub mod backend;
pub mod codec;
pub mod connection;
pub mod copy_stream;
pub mod generator;
pub mod messenger;
pub mod outputter;
pub mod params;
pub mod portal;
pub mod registry;
pub mod server;
pub mod session;
pub mod statement;
pub mod statement_cache;
pub mod statements;
pub mod transaction;

#[cfg(test)]
mod test_util;

pub use backend::{
    Backend, BulkLoader, CompileRequest, CompiledQuery, CopyTarget, Cursor, CursorRequest, DdlExecutor,
    DirectRoutine, OperatorPlan, QueryCompiler, RoutineBody, RoutineCatalog, RoutineDef, RowSink,
    SqlParser, TransactionService, TxnHandle,
};
pub use connection::PgConnection;
pub use messenger::{Messenger, PgMessenger};
pub use portal::{Portal, PortalCursor, PortalState};
pub use registry::{SessionHandle, SessionRegistry};
pub use server::{PgServer, ServerContext};
pub use session::PgSession;
pub use statement::{
    AisGenerationMode, CommandTag, ExecResult, PgStatement, StatementKind, TransactionAbortedMode,
    TransactionMode,
};
pub use statement_cache::{StatementCache, StatementCacheStats, StatementKey};
