//! The executable-statement contract.
//!
//! Every statement the generator chain produces implements [`PgStatement`].
//! Statements are immutable once generated and may be shared by any number of
//! portals; everything that changes while a statement runs (bindings, the
//! retained cursor, row counts) lives in the [`Portal`].

use std::fmt;

use heron_common::error::HeronResult;
use heron_common::types::{DataType, ResultColumn};

use crate::ast::DmlKind;
use crate::backend::Cursor;
use crate::messenger::Messenger;
use crate::outputter::RowOutputter;
use crate::portal::{Portal, PortalCursor, PortalState};
use crate::registry::SessionHandle;
use crate::server::ServerContext;
use crate::session::PgSession;

/// How a statement relates to the session transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Must run outside a transaction block.
    None,
    /// Needs a transaction; read-only work.
    Read,
    /// Needs a writable transaction.
    Write,
    /// Runs with or without a transaction.
    Allowed,
    /// Commits any open transaction first.
    ImplicitCommit,
    /// Commits any open transaction, runs, then continues the block in a new one.
    ImplicitCommitAndNew,
}

/// Whether a statement may run after an earlier statement of the same
/// transaction failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionAbortedMode {
    Allowed,
    NotAllowed,
}

/// Whether a statement is independent of schema identity. `NotAllowed`
/// statements record the schema generation they were compiled against and
/// go stale when it moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AisGenerationMode {
    Allowed,
    NotAllowed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Dml(DmlKind),
    Ddl,
    Prepare,
    Execute,
    Deallocate,
    DeclareCursor,
    Fetch,
    CloseCursor,
    CopyFrom,
    CopyTo,
    Session,
    Admin,
    Explain,
    Call,
    Empty,
}

impl StatementKind {
    pub fn name(&self) -> &'static str {
        match self {
            StatementKind::Dml(k) => k.verb(),
            StatementKind::Ddl => "DDL",
            StatementKind::Prepare => "PREPARE",
            StatementKind::Execute => "EXECUTE",
            StatementKind::Deallocate => "DEALLOCATE",
            StatementKind::DeclareCursor => "DECLARE CURSOR",
            StatementKind::Fetch => "FETCH",
            StatementKind::CloseCursor => "CLOSE CURSOR",
            StatementKind::CopyFrom => "COPY FROM",
            StatementKind::CopyTo => "COPY TO",
            StatementKind::Session => "SESSION",
            StatementKind::Admin => "ADMIN",
            StatementKind::Explain => "EXPLAIN",
            StatementKind::Call => "CALL",
            StatementKind::Empty => "EMPTY",
        }
    }
}

/// CommandComplete tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTag {
    Select(u64),
    Insert(u64),
    Update(u64),
    Delete(u64),
    Copy(u64),
    Fetch(u64),
    /// Static tag such as `BEGIN` or `CREATE TABLE`.
    Verb(String),
    /// Answered with EmptyQueryResponse instead of CommandComplete.
    Empty,
}

impl CommandTag {
    pub fn for_dml(kind: DmlKind, rows: u64) -> Self {
        match kind {
            DmlKind::Select => CommandTag::Select(rows),
            DmlKind::Insert => CommandTag::Insert(rows),
            DmlKind::Update => CommandTag::Update(rows),
            DmlKind::Delete => CommandTag::Delete(rows),
        }
    }

    pub fn verb(v: impl Into<String>) -> Self {
        CommandTag::Verb(v.into())
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandTag::Select(n) => write!(f, "SELECT {n}"),
            CommandTag::Insert(n) => write!(f, "INSERT 0 {n}"),
            CommandTag::Update(n) => write!(f, "UPDATE {n}"),
            CommandTag::Delete(n) => write!(f, "DELETE {n}"),
            CommandTag::Copy(n) => write!(f, "COPY {n}"),
            CommandTag::Fetch(n) => write!(f, "FETCH {n}"),
            CommandTag::Verb(v) => f.write_str(v),
            CommandTag::Empty => Ok(()),
        }
    }
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub tag: CommandTag,
    /// The portal stopped at its row limit and the client should see
    /// PortalSuspended instead of CommandComplete.
    pub suspended: bool,
}

impl ExecResult {
    pub fn complete(tag: CommandTag) -> Self {
        Self {
            tag,
            suspended: false,
        }
    }
}

/// Everything a statement may touch while it runs.
pub struct ExecContext<'a> {
    pub messenger: &'a mut dyn Messenger,
    pub session: &'a mut PgSession,
    pub server: &'a ServerContext,
    /// Send RowDescription ahead of rows. Simple-query execution does;
    /// extended-protocol clients get it from Describe instead.
    pub describe_rows: bool,
}

pub trait PgStatement: Send + Sync + fmt::Debug {
    fn kind(&self) -> StatementKind;

    /// Resolved type of each `$n`, in order.
    fn parameter_types(&self) -> &[DataType] {
        &[]
    }

    /// Result shape; empty when no rows are returned.
    fn result_columns(&self) -> &[ResultColumn] {
        &[]
    }

    fn transaction_mode(&self) -> TransactionMode;

    fn transaction_aborted_mode(&self) -> TransactionAbortedMode {
        TransactionAbortedMode::NotAllowed
    }

    fn ais_generation_mode(&self) -> AisGenerationMode {
        AisGenerationMode::Allowed
    }

    /// Schema generation the statement was compiled against.
    fn ais_generation(&self) -> Option<u64> {
        None
    }

    fn put_in_cache(&self) -> bool {
        false
    }

    fn cost_estimate(&self) -> Option<f64> {
        None
    }

    /// Returns rows whose shape is only known once the first one arrives.
    /// Such statements cannot be described ahead of Execute, so the
    /// extended protocol refuses them.
    fn rows_undescribed(&self) -> bool {
        false
    }

    /// Whether a row limit may leave the portal suspended.
    fn can_suspend(&self, txn_active: bool) -> bool {
        self.transaction_mode() == TransactionMode::Read && txn_active
    }

    /// Run (or resume) the statement for `portal`. A positive `max_rows`
    /// bounds the rows emitted by this call; zero or negative means all.
    fn execute(
        &self,
        ctx: &mut ExecContext<'_>,
        portal: &mut Portal,
        max_rows: i32,
    ) -> HeronResult<ExecResult>;
}

/// A schema-dependent statement compiled against an older generation.
pub fn is_stale(statement: &dyn PgStatement, current_generation: u64) -> bool {
    statement.ais_generation_mode() == AisGenerationMode::NotAllowed
        && statement.ais_generation() != Some(current_generation)
}

/// Rows emitted by one `run_cursor` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRun {
    pub rows: u64,
    pub suspended: bool,
}

/// Drive a portal's cursor into `out` for one execute call.
///
/// Resumes a suspended cursor or opens a new one through `open`, emits up to
/// `max_rows` rows, and leaves the portal suspended or exhausted. The row
/// limit only applies to suspendable portals; everything else runs to
/// completion. Interrupts are checked before opening and before every fetch.
/// On failure the cursor is closed and the portal exhausted.
pub fn run_cursor<F>(
    handle: &SessionHandle,
    portal_cursor: &mut PortalCursor,
    open: F,
    max_rows: i32,
    out: &mut dyn RowOutputter,
) -> HeronResult<CursorRun>
where
    F: FnOnce() -> HeronResult<Box<dyn Cursor>>,
{
    let limit = if max_rows > 0 && portal_cursor.state() != PortalState::Normal {
        Some(max_rows as u64)
    } else {
        None
    };

    handle.check_interrupts()?;
    let mut cursor = match portal_cursor.start_cursor(open)? {
        Some(cursor) => cursor,
        None => {
            // Still an empty result set, so it gets a description.
            out.before_data()?;
            out.after_data()?;
            return Ok(CursorRun {
                rows: 0,
                suspended: false,
            })
        }
    };

    let mut rows = 0u64;
    let pumped = out
        .before_data()
        .and_then(|()| pump(handle, cursor.as_mut(), limit, out, &mut rows))
        .and_then(|stop| out.after_data().map(|()| stop));

    match pumped {
        Ok(hit_limit) => {
            let suspended = portal_cursor.finish_cursor(cursor, rows, hit_limit)?;
            if suspended {
                heron_observability::record_portal_suspended();
            }
            Ok(CursorRun { rows, suspended })
        }
        Err(e) => Err(portal_cursor.abort(cursor, rows, e)),
    }
}

/// Copy rows until the cursor ends or `limit` is reached. Returns whether
/// the limit stopped it.
fn pump(
    handle: &SessionHandle,
    cursor: &mut dyn Cursor,
    limit: Option<u64>,
    out: &mut dyn RowOutputter,
    rows: &mut u64,
) -> HeronResult<bool> {
    loop {
        if limit.is_some_and(|l| *rows >= l) {
            return Ok(true);
        }
        handle.check_interrupts()?;
        match cursor.next()? {
            Some(row) => {
                out.output(&row)?;
                *rows += 1;
            }
            None => return Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::datum::{Datum, Row};
    use heron_common::error::{ExecutionError, HeronError};

    struct Counter {
        next: i64,
        end: i64,
        fail_at: Option<i64>,
    }

    impl Cursor for Counter {
        fn open(&mut self) -> HeronResult<()> {
            Ok(())
        }
        fn next(&mut self) -> HeronResult<Option<Row>> {
            if Some(self.next) == self.fail_at {
                return Err(ExecutionError::DivisionByZero.into());
            }
            if self.next >= self.end {
                return Ok(None);
            }
            self.next += 1;
            Ok(Some(Row::new(vec![Datum::Int64(self.next)])))
        }
        fn close(&mut self) -> HeronResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect {
        rows: Vec<i64>,
        after: usize,
    }

    impl RowOutputter for Collect {
        fn output(&mut self, row: &Row) -> HeronResult<()> {
            self.rows.push(row.get(0).and_then(|d| d.as_i64()).unwrap_or(-1));
            Ok(())
        }
        fn after_data(&mut self) -> HeronResult<()> {
            self.after += 1;
            Ok(())
        }
    }

    fn counter(end: i64) -> impl FnOnce() -> HeronResult<Box<dyn Cursor>> {
        move || {
            Ok(Box::new(Counter {
                next: 0,
                end,
                fail_at: None,
            }) as Box<dyn Cursor>)
        }
    }

    #[test]
    fn test_chunking_preserves_total() {
        for chunk in [0, 1, 3, 4, 12] {
            let handle = SessionHandle::detached(1);
            let mut pc = PortalCursor::new(true, true);
            let mut out = Collect::default();
            let mut calls = 0;
            loop {
                let run = run_cursor(&handle, &mut pc, counter(12), chunk, &mut out).unwrap();
                calls += 1;
                if !run.suspended {
                    break;
                }
            }
            assert_eq!(pc.rows_processed(), 12, "chunk {chunk}");
            assert_eq!(out.rows, (1..=12).collect::<Vec<_>>());
            assert!(calls >= 1);
        }
    }

    #[test]
    fn test_limit_ignored_when_not_suspendable() {
        let handle = SessionHandle::detached(1);
        let mut pc = PortalCursor::new(false, true);
        let mut out = Collect::default();
        let run = run_cursor(&handle, &mut pc, counter(7), 2, &mut out).unwrap();
        assert_eq!(
            run,
            CursorRun {
                rows: 7,
                suspended: false
            }
        );
        assert_eq!(pc.state(), PortalState::Exhausted);
    }

    #[test]
    fn test_exhausted_portal_emits_empty_result() {
        let handle = SessionHandle::detached(1);
        let mut pc = PortalCursor::new(true, true);
        let mut out = Collect::default();
        run_cursor(&handle, &mut pc, counter(2), 0, &mut out).unwrap();
        let run = run_cursor(&handle, &mut pc, counter(2), 0, &mut out).unwrap();
        assert_eq!(run.rows, 0);
        assert!(!run.suspended);
        assert_eq!(out.rows, vec![1, 2]);
        assert_eq!(out.after, 2);
    }

    #[test]
    fn test_cancel_observed_at_open() {
        let handle = SessionHandle::detached(1);
        handle.request_cancel();
        let mut pc = PortalCursor::new(true, true);
        let mut out = Collect::default();
        let err = run_cursor(&handle, &mut pc, counter(3), 0, &mut out).unwrap_err();
        assert!(matches!(err, HeronError::Canceled));
        assert!(out.rows.is_empty());
    }

    #[test]
    fn test_data_error_exhausts_portal() {
        let handle = SessionHandle::detached(1);
        let mut pc = PortalCursor::new(true, true);
        let mut out = Collect::default();
        let open = || {
            Ok(Box::new(Counter {
                next: 0,
                end: 10,
                fail_at: Some(3),
            }) as Box<dyn Cursor>)
        };
        let err = run_cursor(&handle, &mut pc, open, 0, &mut out).unwrap_err();
        assert_eq!(err.pg_sqlstate(), "22012");
        assert_eq!(pc.state(), PortalState::Exhausted);
        assert_eq!(pc.rows_processed(), 3);
    }

    #[test]
    fn test_command_tags() {
        assert_eq!(CommandTag::for_dml(DmlKind::Insert, 3).to_string(), "INSERT 0 3");
        assert_eq!(CommandTag::Select(5).to_string(), "SELECT 5");
        assert_eq!(CommandTag::verb("CREATE TABLE").to_string(), "CREATE TABLE");
        assert_eq!(CommandTag::Fetch(2).to_string(), "FETCH 2");
    }
}
