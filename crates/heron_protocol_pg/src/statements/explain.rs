use heron_common::datum::{Datum, Row};
use heron_common::error::HeronResult;
use heron_common::types::{DataType, ResultColumn};

use crate::backend::CompiledQuery;
use crate::outputter;
use crate::portal::Portal;
use crate::statement::{
    run_cursor, AisGenerationMode, CommandTag, ExecContext, ExecResult, PgStatement, StatementKind,
    TransactionMode,
};

use super::RowsCursor;

/// `EXPLAIN [VERBOSE] query`: one text row per plan line.
#[derive(Debug)]
pub struct ExplainStatement {
    compiled: CompiledQuery,
    verbose: bool,
    generation: u64,
    columns: Vec<ResultColumn>,
}

impl ExplainStatement {
    pub fn new(compiled: CompiledQuery, verbose: bool, generation: u64) -> Self {
        Self {
            compiled,
            verbose,
            generation,
            columns: vec![ResultColumn::new("QUERY PLAN", DataType::Text)],
        }
    }
}

impl PgStatement for ExplainStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Explain
    }

    fn parameter_types(&self) -> &[DataType] {
        &self.compiled.param_types
    }

    fn result_columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Read
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

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, max_rows: i32) -> HeronResult<ExecResult> {
        let lines = self.compiled.plan.explain(self.verbose);
        let mut out = outputter::for_portal(&mut *ctx.messenger, portal, &self.columns, ctx.describe_rows);
        let open = || {
            let rows = lines
                .into_iter()
                .map(|line| Row::new(vec![Datum::Text(line)]))
                .collect();
            Ok(RowsCursor::boxed(rows))
        };
        let run = run_cursor(&ctx.session.handle, &mut portal.cursor, open, max_rows, out.as_mut())?;
        Ok(ExecResult {
            tag: CommandTag::verb("EXPLAIN"),
            suspended: run.suspended,
        })
    }
}
