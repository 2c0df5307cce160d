//! Concrete statement types produced by the generator chain.

use std::collections::VecDeque;

use heron_common::datum::Row;
use heron_common::error::HeronResult;
use heron_common::types::DataType;

use crate::ast::Arg;
use crate::backend::Cursor;
use crate::portal::Portal;
use crate::statement::{
    CommandTag, ExecContext, ExecResult, PgStatement, StatementKind, TransactionAbortedMode,
    TransactionMode,
};

pub mod admin;
pub mod call;
pub mod copy;
pub mod cursor;
pub mod ddl;
pub mod dml;
pub mod explain;
pub mod session_verb;

pub use admin::AdminStatement;
pub use call::CallStatement;
pub use copy::{CopyFromStatement, CopyToStatement};
pub use cursor::{
    CloseCursorStatement, DeallocateStatement, DeclareCursorStatement, ExecuteStatement,
    FetchStatement, PrepareStatement,
};
pub use ddl::DdlStatement;
pub use dml::DmlStatement;
pub use explain::ExplainStatement;
pub use session_verb::SessionStatement;

/// Whitespace-only query text.
#[derive(Debug)]
pub struct EmptyStatement;

impl PgStatement for EmptyStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Empty
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Allowed
    }

    fn transaction_aborted_mode(&self) -> TransactionAbortedMode {
        TransactionAbortedMode::Allowed
    }

    fn execute(&self, _ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        portal.cursor.complete(0);
        Ok(ExecResult::complete(CommandTag::Empty))
    }
}

/// Cursor over rows computed up front (SHOW, EXPLAIN).
pub(crate) struct RowsCursor {
    rows: VecDeque<Row>,
}

impl RowsCursor {
    pub(crate) fn boxed(rows: Vec<Row>) -> Box<dyn Cursor> {
        Box::new(Self { rows: rows.into() })
    }
}

impl Cursor for RowsCursor {
    fn open(&mut self) -> HeronResult<()> {
        Ok(())
    }

    fn next(&mut self) -> HeronResult<Option<Row>> {
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) -> HeronResult<()> {
        self.rows.clear();
        Ok(())
    }
}

/// Parameter types of a statement whose `$n` placeholders appear only as
/// EXECUTE / CALL arguments: `$n` takes the type of the argument slot it
/// fills. Placeholders that fill no slot default to text.
pub(crate) fn arg_param_types(args: &[Arg], slot_types: &[DataType]) -> Vec<DataType> {
    let count = args
        .iter()
        .filter_map(|a| match a {
            Arg::Param(n) => Some(*n),
            Arg::Literal(_) => None,
        })
        .max()
        .unwrap_or(0);
    let mut types = vec![DataType::Text; count];
    for (arg, ty) in args.iter().zip(slot_types) {
        if let Arg::Param(n) = arg {
            if let Some(slot) = n.checked_sub(1).and_then(|i| types.get_mut(i)) {
                *slot = *ty;
            }
        }
    }
    types
}
