use heron_common::error::HeronResult;

use crate::ast::AdminNode;
use crate::portal::Portal;
use crate::statement::{CommandTag, ExecContext, ExecResult, PgStatement, StatementKind, TransactionMode};

/// Server administration: act on other sessions through the registry, or
/// stop the server.
#[derive(Debug)]
pub struct AdminStatement {
    node: AdminNode,
}

impl AdminStatement {
    pub fn new(node: AdminNode) -> Self {
        Self { node }
    }
}

impl PgStatement for AdminStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::Admin
    }

    fn transaction_mode(&self) -> TransactionMode {
        match self.node {
            AdminNode::Shutdown => TransactionMode::ImplicitCommit,
            _ => TransactionMode::Allowed,
        }
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        let tag = match self.node {
            AdminNode::InterruptSession(id) => {
                let target = ctx.server.registry.get(id)?;
                tracing::info!("session {} interrupts session {}", ctx.session.id, id);
                target.request_cancel();
                "INTERRUPT SESSION"
            }
            AdminNode::DisconnectSession(id) => {
                let target = ctx.server.registry.get(id)?;
                tracing::info!("session {} disconnects session {}", ctx.session.id, id);
                target.request_disconnect();
                "DISCONNECT SESSION"
            }
            AdminNode::Shutdown => {
                tracing::info!("shutdown requested by session {}", ctx.session.id);
                ctx.server.request_shutdown();
                "SHUTDOWN"
            }
        };
        portal.cursor.complete(0);
        Ok(ExecResult::complete(CommandTag::verb(tag)))
    }
}
