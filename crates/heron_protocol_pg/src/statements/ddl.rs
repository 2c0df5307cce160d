use heron_common::error::HeronResult;

use crate::ast::DdlNode;
use crate::portal::Portal;
use crate::statement::{CommandTag, ExecContext, ExecResult, PgStatement, StatementKind, TransactionMode};

/// Schema change, handed to the DDL executor. Every successful change
/// advances the schema generation so cached plans compiled against the old
/// schema go stale.
#[derive(Debug)]
pub struct DdlStatement {
    node: DdlNode,
}

impl DdlStatement {
    pub fn new(node: DdlNode) -> Self {
        Self { node }
    }
}

impl PgStatement for DdlStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Ddl
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::ImplicitCommitAndNew
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        ctx.session.handle.check_interrupts()?;
        ctx.server.backend.ddl.execute(&self.node)?;
        let generation = ctx.server.bump_generation();
        tracing::info!(
            "session {}: {} applied, schema generation now {}",
            ctx.session.id,
            self.node.verb,
            generation
        );
        portal.cursor.complete(0);
        Ok(ExecResult::complete(CommandTag::verb(self.node.verb.clone())))
    }
}
