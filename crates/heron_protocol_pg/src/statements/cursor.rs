//! SQL-level statement and cursor control: PREPARE / EXECUTE / DEALLOCATE
//! and DECLARE / FETCH / CLOSE.

use std::sync::Arc;
use std::time::Instant;

use heron_common::error::{CompileError, HeronResult, TxnError};
use heron_common::types::{DataType, ResultColumn};

use crate::ast::{Arg, FetchCount};
use crate::params::resolve_args;
use crate::portal::{Portal, PortalCursor};
use crate::session::PreparedStatement;
use crate::statement::{
    AisGenerationMode, CommandTag, ExecContext, ExecResult, PgStatement, StatementKind,
    TransactionAbortedMode, TransactionMode,
};

use super::arg_param_types;

/// `PREPARE name [(types)] AS statement`
#[derive(Debug)]
pub struct PrepareStatement {
    name: String,
    sql: String,
    param_oids: Vec<i32>,
    inner: Arc<dyn PgStatement>,
}

impl PrepareStatement {
    pub fn new(name: String, sql: String, param_oids: Vec<i32>, inner: Arc<dyn PgStatement>) -> Self {
        Self {
            name,
            sql,
            param_oids,
            inner,
        }
    }
}

impl PgStatement for PrepareStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Prepare
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Allowed
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        if ctx.session.prepared.contains_key(&self.name) {
            return Err(CompileError::DuplicatePreparedStatement(self.name.clone()).into());
        }
        ctx.session.prepared.insert(
            self.name.clone(),
            PreparedStatement {
                name: self.name.clone(),
                sql: self.sql.clone(),
                param_oids: self.param_oids.clone(),
                statement: self.inner.clone(),
                prepared_at: Instant::now(),
            },
        );
        portal.cursor.complete(0);
        Ok(ExecResult::complete(CommandTag::verb("PREPARE")))
    }
}

/// `EXECUTE name [(args)]`. The prepared statement is resolved (and
/// regenerated if its schema generation went stale) when this statement is
/// generated, and runs to completion in a portal of its own.
#[derive(Debug)]
pub struct ExecuteStatement {
    args: Vec<Arg>,
    param_types: Vec<DataType>,
    inner: Arc<dyn PgStatement>,
}

impl ExecuteStatement {
    pub fn new(args: Vec<Arg>, inner: Arc<dyn PgStatement>) -> Self {
        let param_types = arg_param_types(&args, inner.parameter_types());
        Self {
            args,
            param_types,
            inner,
        }
    }
}

impl PgStatement for ExecuteStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Execute
    }

    fn parameter_types(&self) -> &[DataType] {
        &self.param_types
    }

    fn result_columns(&self) -> &[ResultColumn] {
        self.inner.result_columns()
    }

    fn transaction_mode(&self) -> TransactionMode {
        self.inner.transaction_mode()
    }

    fn transaction_aborted_mode(&self) -> TransactionAbortedMode {
        self.inner.transaction_aborted_mode()
    }

    fn ais_generation_mode(&self) -> AisGenerationMode {
        self.inner.ais_generation_mode()
    }

    fn ais_generation(&self) -> Option<u64> {
        self.inner.ais_generation()
    }

    fn rows_undescribed(&self) -> bool {
        self.inner.rows_undescribed()
    }

    fn can_suspend(&self, _txn_active: bool) -> bool {
        false
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        let args = resolve_args(&self.args, self.inner.parameter_types(), &portal.bindings)?;
        let mut inner_portal = Portal::new(
            "",
            self.inner.clone(),
            args,
            portal.result_formats.clone(),
            portal.output_format,
            PortalCursor::new(false, false),
        );
        let result = self.inner.execute(ctx, &mut inner_portal, 0);
        portal.cursor.complete(inner_portal.cursor.rows_processed());
        inner_portal.close()?;
        result
    }
}

/// `DEALLOCATE name` / `DEALLOCATE ALL`
#[derive(Debug)]
pub struct DeallocateStatement {
    name: Option<String>,
}

impl DeallocateStatement {
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }
}

impl PgStatement for DeallocateStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Deallocate
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Allowed
    }

    fn transaction_aborted_mode(&self) -> TransactionAbortedMode {
        TransactionAbortedMode::Allowed
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        let tag = match &self.name {
            None => {
                ctx.session.prepared.clear();
                "DEALLOCATE ALL"
            }
            Some(name) => {
                ctx.session
                    .prepared
                    .remove(name)
                    .ok_or_else(|| CompileError::UnknownPreparedStatement(name.clone()))?;
                "DEALLOCATE"
            }
        };
        portal.cursor.complete(0);
        Ok(ExecResult::complete(CommandTag::verb(tag)))
    }
}

/// `DECLARE name CURSOR FOR query`. The cursor is a suspendable portal in
/// the session's portal namespace; it lives until CLOSE or the end of the
/// transaction block.
#[derive(Debug)]
pub struct DeclareCursorStatement {
    name: String,
    query: Arc<dyn PgStatement>,
}

impl DeclareCursorStatement {
    pub fn new(name: String, query: Arc<dyn PgStatement>) -> Self {
        Self { name, query }
    }
}

impl PgStatement for DeclareCursorStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::DeclareCursor
    }

    fn parameter_types(&self) -> &[DataType] {
        self.query.parameter_types()
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Allowed
    }

    fn ais_generation_mode(&self) -> AisGenerationMode {
        self.query.ais_generation_mode()
    }

    fn ais_generation(&self) -> Option<u64> {
        self.query.ais_generation()
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        if !ctx.session.txn.in_block() {
            return Err(TxnError::NoActiveTransaction("DECLARE CURSOR".into()).into());
        }
        if ctx.session.portals.contains_key(&self.name) {
            return Err(CompileError::DuplicateCursor(self.name.clone()).into());
        }
        let cursor_portal = Portal::new(
            self.name.clone(),
            self.query.clone(),
            portal.bindings.clone(),
            Vec::new(),
            ctx.session.output_format,
            PortalCursor::new(true, false),
        );
        ctx.session.portals.insert(self.name.clone(), cursor_portal);
        tracing::debug!("session {}: declared cursor '{}'", ctx.session.id, self.name);
        portal.cursor.complete(0);
        Ok(ExecResult::complete(CommandTag::verb("DECLARE CURSOR")))
    }
}

/// `FETCH [n | ALL] FROM name`
#[derive(Debug)]
pub struct FetchStatement {
    name: String,
    count: FetchCount,
    columns: Vec<ResultColumn>,
}

impl FetchStatement {
    /// `columns` is the shape of the cursor's query, known at generation.
    pub fn new(name: String, count: FetchCount, columns: Vec<ResultColumn>) -> Self {
        Self { name, count, columns }
    }
}

impl PgStatement for FetchStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Fetch
    }

    fn result_columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Allowed
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        portal.cursor.complete(0);
        let limit = match self.count {
            FetchCount::Count(0) => return Ok(ExecResult::complete(CommandTag::Fetch(0))),
            FetchCount::Count(n) => i32::try_from(n).unwrap_or(i32::MAX),
            FetchCount::All => 0,
        };

        let mut cursor_portal = ctx
            .session
            .portals
            .remove(&self.name)
            .ok_or_else(|| CompileError::UnknownCursor(self.name.clone()))?;
        let before = cursor_portal.cursor.rows_processed();
        let statement = cursor_portal.statement.clone();
        let result = statement.execute(ctx, &mut cursor_portal, limit);
        let fetched = cursor_portal.cursor.rows_processed() - before;
        ctx.session.portals.insert(self.name.clone(), cursor_portal);

        result?;
        Ok(ExecResult::complete(CommandTag::Fetch(fetched)))
    }
}

/// `CLOSE name` / `CLOSE ALL`
#[derive(Debug)]
pub struct CloseCursorStatement {
    name: Option<String>,
}

impl CloseCursorStatement {
    pub fn new(name: Option<String>) -> Self {
        Self { name }
    }
}

impl PgStatement for CloseCursorStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::CloseCursor
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Allowed
    }

    fn transaction_aborted_mode(&self) -> TransactionAbortedMode {
        TransactionAbortedMode::Allowed
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        portal.cursor.complete(0);
        let tag = match &self.name {
            None => {
                ctx.session.close_all_portals();
                "CLOSE CURSOR ALL"
            }
            Some(name) => {
                let mut cursor_portal = ctx
                    .session
                    .portals
                    .remove(name)
                    .ok_or_else(|| CompileError::UnknownCursor(name.clone()))?;
                cursor_portal.close()?;
                "CLOSE CURSOR"
            }
        };
        Ok(ExecResult::complete(CommandTag::verb(tag)))
    }
}
