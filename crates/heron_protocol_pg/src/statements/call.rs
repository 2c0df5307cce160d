use heron_common::error::HeronResult;
use heron_common::types::{DataType, ResultColumn};

use crate::ast::Arg;
use crate::backend::{CursorRequest, RoutineBody, RoutineDef};
use crate::copy_stream::CopyOutStream;
use crate::outputter::csv::{CsvCopyOutputter, CsvFormat};
use crate::outputter::direct::{run_direct, run_direct_streaming};
use crate::outputter::{self, DirectObjectOutputter};
use crate::params::resolve_args;
use crate::portal::Portal;
use crate::statement::{
    run_cursor, CommandTag, ExecContext, ExecResult, PgStatement, StatementKind, TransactionMode,
};

use super::arg_param_types;

/// `CALL routine(args)`.
///
/// Plan-bodied routines run as an ordinary query cursor. Direct routines
/// push rows through a sink: as DataRows, or for streaming routines as a
/// text COPY stream the client reads while the routine is still running.
#[derive(Debug)]
pub struct CallStatement {
    routine: RoutineDef,
    args: Vec<Arg>,
    param_types: Vec<DataType>,
}

impl CallStatement {
    pub fn new(routine: RoutineDef, args: Vec<Arg>) -> Self {
        let param_types = arg_param_types(&args, &routine.param_types);
        Self {
            routine,
            args,
            param_types,
        }
    }
}

impl PgStatement for CallStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Call
    }

    fn parameter_types(&self) -> &[DataType] {
        &self.param_types
    }

    fn result_columns(&self) -> &[ResultColumn] {
        &self.routine.result_columns
    }

    fn transaction_mode(&self) -> TransactionMode {
        if self.routine.read_only {
            TransactionMode::Read
        } else {
            TransactionMode::Write
        }
    }

    fn rows_undescribed(&self) -> bool {
        matches!(self.routine.body, RoutineBody::Direct(_))
            && !self.routine.streaming
            && self.routine.result_columns.is_empty()
    }

    fn can_suspend(&self, txn_active: bool) -> bool {
        matches!(self.routine.body, RoutineBody::Plan(_)) && self.routine.read_only && txn_active
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, max_rows: i32) -> HeronResult<ExecResult> {
        let args = resolve_args(&self.args, &self.routine.param_types, &portal.bindings)?;
        let txn = ctx.session.txn.handle;
        let columns = &self.routine.result_columns;
        tracing::debug!("session {}: CALL {}", ctx.session.id, self.routine.name);

        match &self.routine.body {
            RoutineBody::Plan(plan) => {
                let mut out = outputter::for_portal(&mut *ctx.messenger, portal, columns, ctx.describe_rows);
                let open = || plan.cursor(&CursorRequest { bindings: &args, txn });
                let run = run_cursor(&ctx.session.handle, &mut portal.cursor, open, max_rows, out.as_mut())?;
                Ok(ExecResult {
                    tag: CommandTag::verb("CALL"),
                    suspended: run.suspended,
                })
            }
            RoutineBody::Direct(routine) if self.routine.streaming => {
                let mut dest = CopyOutStream::new(&mut *ctx.messenger);
                let mut out = CsvCopyOutputter::new(&mut dest, CsvFormat::text(), columns.clone());
                let rows = run_direct_streaming(routine.as_ref(), &args, txn, &ctx.session.handle, &mut out)?;
                heron_observability::record_copy_rows("out", rows);
                portal.cursor.complete(rows);
                Ok(ExecResult::complete(CommandTag::verb("CALL")))
            }
            RoutineBody::Direct(routine) => {
                let mut out = DirectObjectOutputter::new(&mut *ctx.messenger, columns.clone(), ctx.describe_rows);
                let rows = run_direct(routine.as_ref(), &args, txn, &ctx.session.handle, &mut out)?;
                portal.cursor.complete(rows);
                Ok(ExecResult::complete(CommandTag::verb("CALL")))
            }
        }
    }
}
