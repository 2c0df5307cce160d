use heron_common::error::HeronResult;
use heron_common::types::{DataType, ResultColumn};

use crate::ast::DmlKind;
use crate::backend::{CompiledQuery, CursorRequest};
use crate::outputter;
use crate::portal::Portal;
use crate::statement::{
    run_cursor, AisGenerationMode, CommandTag, ExecContext, ExecResult, PgStatement, StatementKind,
    TransactionMode,
};

/// SELECT / INSERT / UPDATE / DELETE compiled to an operator plan.
///
/// Write statements run their cursor to completion; each row the cursor
/// yields is one affected row. When the statement declares result columns
/// (RETURNING) those rows are also sent to the client.
#[derive(Debug)]
pub struct DmlStatement {
    kind: DmlKind,
    sql: String,
    compiled: CompiledQuery,
    generation: u64,
}

impl DmlStatement {
    pub fn new(kind: DmlKind, sql: impl Into<String>, compiled: CompiledQuery, generation: u64) -> Self {
        Self {
            kind,
            sql: sql.into(),
            compiled,
            generation,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl PgStatement for DmlStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Dml(self.kind)
    }

    fn parameter_types(&self) -> &[DataType] {
        &self.compiled.param_types
    }

    fn result_columns(&self) -> &[ResultColumn] {
        &self.compiled.columns
    }

    fn transaction_mode(&self) -> TransactionMode {
        if self.kind.is_query() {
            TransactionMode::Read
        } else {
            TransactionMode::Write
        }
    }

    fn ais_generation_mode(&self) -> AisGenerationMode {
        AisGenerationMode::NotAllowed
    }

    fn ais_generation(&self) -> Option<u64> {
        Some(self.generation)
    }

    fn put_in_cache(&self) -> bool {
        true
    }

    fn cost_estimate(&self) -> Option<f64> {
        self.compiled.cost_estimate
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, max_rows: i32) -> HeronResult<ExecResult> {
        let txn = ctx.session.txn.handle;
        let plan = &self.compiled.plan;
        let mut out = outputter::for_portal(
            &mut *ctx.messenger,
            portal,
            &self.compiled.columns,
            ctx.describe_rows,
        );
        let bindings = portal.bindings.as_slice();
        let open = || plan.cursor(&CursorRequest { bindings, txn });
        let run = run_cursor(&ctx.session.handle, &mut portal.cursor, open, max_rows, out.as_mut())?;

        Ok(ExecResult {
            tag: CommandTag::for_dml(self.kind, portal.cursor.rows_processed()),
            suspended: run.suspended,
        })
    }
}
