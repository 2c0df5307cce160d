//! Session transaction boundaries driven by each statement's declared
//! [`TransactionMode`] and [`TransactionAbortedMode`].
//!
//! Statements never open or close transactions around themselves; the
//! dispatcher calls [`enter`] before and [`leave`] after running one.

use heron_common::error::{HeronResult, TxnError};

use crate::server::ServerContext;
use crate::session::{PgSession, TxnState};
use crate::statement::{PgStatement, TransactionAbortedMode, TransactionMode};

/// What [`enter`] did, so [`leave`] can undo or continue it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnGuard {
    /// An implicit transaction was opened for this statement.
    pub implicit_opened: bool,
    /// The statement ended an explicit block; reopen it (with this
    /// read-only flag) once the statement is done.
    pub restart_after: Option<bool>,
}

/// Reject statements that may not run in a failed transaction.
pub fn check_aborted(session: &PgSession, stmt: &dyn PgStatement) -> HeronResult<()> {
    if session.txn.failed && stmt.transaction_aborted_mode() == TransactionAbortedMode::NotAllowed {
        return Err(TxnError::InFailedTransaction.into());
    }
    Ok(())
}

/// Arrange the session transaction for `stmt` according to its mode.
pub fn enter(
    server: &ServerContext,
    session: &mut PgSession,
    stmt: &dyn PgStatement,
) -> HeronResult<TxnGuard> {
    check_aborted(session, stmt)?;
    let mut guard = TxnGuard::default();

    match stmt.transaction_mode() {
        TransactionMode::None => {
            if session.txn.in_block() {
                return Err(TxnError::ActiveTransaction(stmt.kind().name().to_string()).into());
            }
            if session.txn.is_active() {
                end_txn(server, session, true)?;
            }
        }
        mode @ (TransactionMode::Read | TransactionMode::Write) => {
            if !session.txn.is_active() {
                begin_txn(server, session, false, false)?;
                guard.implicit_opened = true;
            } else if mode == TransactionMode::Write && session.txn.read_only {
                return Err(TxnError::ReadOnlyTransaction(stmt.kind().name().to_string()).into());
            }
        }
        TransactionMode::Allowed => {}
        TransactionMode::ImplicitCommit => {
            if session.txn.is_active() {
                tracing::debug!("session {}: implicit commit before {}", session.id, stmt.kind().name());
                end_txn(server, session, true)?;
            }
        }
        TransactionMode::ImplicitCommitAndNew => {
            if session.txn.is_active() {
                if session.txn.in_block() {
                    guard.restart_after = Some(session.txn.read_only);
                }
                end_txn(server, session, true)?;
            }
        }
    }
    Ok(guard)
}

/// Finish the transaction work begun by [`enter`]. In simple-query mode an
/// implicit transaction ends with its statement; in the extended protocol
/// it lives until Sync.
pub fn leave(
    server: &ServerContext,
    session: &mut PgSession,
    guard: TxnGuard,
    ok: bool,
    simple: bool,
) -> HeronResult<()> {
    if let Some(read_only) = guard.restart_after {
        begin_txn(server, session, read_only, true)?;
    }
    if ok && simple && session.txn.is_active() && !session.txn.explicit {
        end_txn(server, session, true)?;
    }
    Ok(())
}

/// Record a statement failure against the session transaction.
pub fn mark_failed(server: &ServerContext, session: &mut PgSession, simple: bool) -> HeronResult<()> {
    if session.txn.in_block() {
        session.txn.failed = true;
    } else if session.txn.is_active() {
        if simple {
            end_txn(server, session, false)?;
        } else {
            session.txn.failed = true;
        }
    }
    Ok(())
}

/// Sync ends the implicit extended-protocol transaction.
pub fn sync(server: &ServerContext, session: &mut PgSession) -> HeronResult<()> {
    if session.txn.is_active() && !session.txn.explicit {
        let commit = !session.txn.failed;
        end_txn(server, session, commit)?;
    }
    Ok(())
}

pub fn begin_txn(
    server: &ServerContext,
    session: &mut PgSession,
    read_only: bool,
    explicit: bool,
) -> HeronResult<()> {
    let handle = server.backend.transactions.begin(read_only)?;
    tracing::debug!(
        "session {}: begin txn {} (explicit={}, read_only={})",
        session.id,
        handle.id,
        explicit,
        read_only
    );
    session.txn = TxnState {
        handle: Some(handle),
        explicit,
        failed: false,
        read_only,
    };
    Ok(())
}

/// Commit or roll back the current transaction. Portals opened under it are
/// closed first; the session is left without a transaction either way.
pub fn end_txn(server: &ServerContext, session: &mut PgSession, commit: bool) -> HeronResult<()> {
    session.close_all_portals();
    let state = std::mem::take(&mut session.txn);
    let Some(handle) = state.handle else {
        return Ok(());
    };
    tracing::debug!(
        "session {}: {} txn {}",
        session.id,
        if commit { "commit" } else { "rollback" },
        handle.id
    );
    if commit {
        server.backend.transactions.commit(handle)
    } else {
        server.backend.transactions.rollback(handle)
    }
}
