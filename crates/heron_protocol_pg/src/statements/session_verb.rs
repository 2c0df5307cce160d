use heron_common::datum::{Datum, Row};
use heron_common::error::{CompileError, HeronResult};
use heron_common::types::{DataType, ResultColumn};

use crate::ast::SessionNode;
use crate::codec::BackendMessage;
use crate::outputter;
use crate::portal::Portal;
use crate::statement::{
    run_cursor, CommandTag, ExecContext, ExecResult, PgStatement, StatementKind,
    TransactionAbortedMode, TransactionMode,
};
use crate::transaction::{begin_txn, end_txn};

use super::RowsCursor;

/// Transaction control and session settings.
#[derive(Debug)]
pub struct SessionStatement {
    node: SessionNode,
    columns: Vec<ResultColumn>,
}

impl SessionStatement {
    pub fn new(node: SessionNode) -> Self {
        let columns = match &node {
            SessionNode::Show { name } => vec![ResultColumn::new(name.to_lowercase(), DataType::Text)],
            _ => Vec::new(),
        };
        Self { node, columns }
    }
}

fn warn(ctx: &mut ExecContext<'_>, message: &str) -> HeronResult<()> {
    tracing::debug!("session {}: {}", ctx.session.id, message);
    ctx.messenger.send(&BackendMessage::warning(message))
}

impl PgStatement for SessionStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Session
    }

    fn result_columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    fn transaction_mode(&self) -> TransactionMode {
        match self.node {
            SessionNode::DiscardAll => TransactionMode::None,
            _ => TransactionMode::Allowed,
        }
    }

    fn transaction_aborted_mode(&self) -> TransactionAbortedMode {
        match self.node {
            SessionNode::Commit | SessionNode::Rollback => TransactionAbortedMode::Allowed,
            _ => TransactionAbortedMode::NotAllowed,
        }
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, max_rows: i32) -> HeronResult<ExecResult> {
        let tag = match &self.node {
            SessionNode::Begin { read_only } => {
                if ctx.session.txn.in_block() {
                    warn(ctx, "there is already a transaction in progress")?;
                } else if ctx.session.txn.is_active() {
                    // An implicit extended-protocol transaction becomes the block.
                    ctx.session.txn.explicit = true;
                    ctx.session.txn.read_only |= *read_only;
                } else {
                    begin_txn(ctx.server, ctx.session, *read_only, true)?;
                }
                "BEGIN"
            }
            SessionNode::Commit => {
                let failed = ctx.session.txn.failed;
                if !ctx.session.txn.in_block() {
                    warn(ctx, "there is no transaction in progress")?;
                }
                if ctx.session.txn.is_active() {
                    end_txn(ctx.server, ctx.session, !failed)?;
                }
                if failed {
                    "ROLLBACK"
                } else {
                    "COMMIT"
                }
            }
            SessionNode::Rollback => {
                if !ctx.session.txn.in_block() {
                    warn(ctx, "there is no transaction in progress")?;
                }
                if ctx.session.txn.is_active() {
                    end_txn(ctx.server, ctx.session, false)?;
                }
                "ROLLBACK"
            }
            SessionNode::SetTransaction { read_only } => {
                if ctx.session.txn.in_block() {
                    ctx.session.txn.read_only = *read_only;
                } else {
                    warn(ctx, "SET TRANSACTION can only be used in transaction blocks")?;
                }
                "SET"
            }
            SessionNode::Set { name, value } => {
                ctx.session.set_guc(name, value)?;
                "SET"
            }
            SessionNode::Reset { name: None } => {
                ctx.session.reset_all_gucs();
                "RESET"
            }
            SessionNode::Reset { name: Some(name) } => {
                ctx.session.reset_guc(name);
                "RESET"
            }
            SessionNode::Show { name } => {
                let value = ctx
                    .session
                    .get_guc(name)
                    .map(str::to_string)
                    .ok_or_else(|| CompileError::UnknownParameter(name.clone()))?;
                let mut out = outputter::for_portal(&mut *ctx.messenger, portal, &self.columns, ctx.describe_rows);
                let open = || Ok(RowsCursor::boxed(vec![Row::new(vec![Datum::Text(value)])]));
                run_cursor(&ctx.session.handle, &mut portal.cursor, open, max_rows, out.as_mut())?;
                return Ok(ExecResult::complete(CommandTag::verb("SHOW")));
            }
            SessionNode::DiscardAll => {
                ctx.session.discard_all();
                "DISCARD ALL"
            }
        };
        portal.cursor.complete(0);
        Ok(ExecResult::complete(CommandTag::verb(tag)))
    }
}
