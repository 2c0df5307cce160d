//! Per-connection protocol state machine.
//!
//! One [`PgConnection`] serves one client: startup, then simple-query and
//! extended-protocol messages until Terminate or disconnect. Statement
//! errors are recovered according to the failing message's [`ErrorMode`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use heron_common::error::{
    finish_with_cleanup, CompileError, ErrorKind, HeronError, HeronResult, ProtocolError,
};

use crate::ast::{ParsedStatement, StatementNode};
use crate::codec::{BackendMessage, ErrorMode, FrontendMessage};
use crate::generator;
use crate::messenger::{Messenger, PgMessenger};
use crate::outputter::{describe_fields, validate_formats};
use crate::params::decode_params;
use crate::portal::{Portal, PortalCursor};
use crate::registry::SessionHandle;
use crate::server::ServerContext;
use crate::session::{PgSession, PreparedStatement};
use crate::statement::{CommandTag, ExecContext, ExecResult, PgStatement, TransactionMode};
use crate::transaction;

/// ParameterStatus values reported at startup.
const REPORTED_PARAMETERS: &[(&str, &str)] = &[
    ("server_version", "server_version"),
    ("server_encoding", "server_encoding"),
    ("client_encoding", "client_encoding"),
    ("DateStyle", "datestyle"),
    ("TimeZone", "timezone"),
    ("integer_datetimes", "integer_datetimes"),
    ("standard_conforming_strings", "standard_conforming_strings"),
    ("application_name", "application_name"),
];

enum Flow {
    Continue,
    Stop,
}

pub struct PgConnection<S: Read + Write> {
    messenger: PgMessenger<S>,
    server: Arc<ServerContext>,
    /// Handed to the session handle so DISCONNECT can wake a blocked read.
    socket: Option<TcpStream>,
    /// An extended-protocol message failed; skip everything up to Sync.
    ignore_until_sync: bool,
}

impl<S: Read + Write> PgConnection<S> {
    pub fn new(stream: S, server: Arc<ServerContext>) -> Self {
        let max_message_size = server.config.server.max_message_size;
        Self {
            messenger: PgMessenger::new(stream, max_message_size),
            server,
            socket: None,
            ignore_until_sync: false,
        }
    }

    pub fn attach_socket(&mut self, socket: TcpStream) {
        self.socket = Some(socket);
    }

    /// Serve the connection to completion.
    pub fn run(mut self) -> HeronResult<()> {
        let Some(mut session) = self.startup()? else {
            return Ok(());
        };
        let session_id = session.id;
        let result = catch_panic("connection", session_id, || self.message_loop(&mut session));
        self.teardown(&mut session);
        result
    }

    fn startup(&mut self) -> HeronResult<Option<PgSession>> {
        loop {
            let Some(msg) = self.messenger.recv_startup()? else {
                return Ok(None);
            };
            match msg {
                FrontendMessage::SslRequest | FrontendMessage::GssEncRequest => {
                    tracing::debug!("declining encryption request");
                    self.messenger.send_raw(b"N")?;
                }
                FrontendMessage::CancelRequest {
                    process_id,
                    secret_key,
                } => {
                    self.server.registry.cancel_with_key(process_id, secret_key);
                    return Ok(None);
                }
                FrontendMessage::Startup { version, params } => {
                    tracing::debug!("Startup: version={}, params={:?}", version, params);
                    let max = self.server.config.server.max_connections;
                    if max > 0 && self.server.active_connections() > max {
                        tracing::warn!("rejecting connection: {} connections active", max);
                        self.messenger.send(&BackendMessage::error(&HeronError::TooManyConnections))?;
                        self.messenger.flush()?;
                        return Ok(None);
                    }
                    return self.start_session(params).map(Some);
                }
                other => {
                    return Err(ProtocolError::UnexpectedMessage(other.code() as char).into());
                }
            }
        }
    }

    fn start_session(&mut self, params: HashMap<String, String>) -> HeronResult<PgSession> {
        let user = params.get("user").cloned().unwrap_or_else(|| "heron".to_string());
        let database = params.get("database").cloned().unwrap_or_else(|| user.clone());
        let handle = Arc::new(SessionHandle::new(self.server.next_session_id(), user, database));
        if let Some(socket) = self.socket.take() {
            handle.attach_socket(socket);
        }
        self.server.registry.register(handle.clone());

        let mut session = PgSession::new(handle.clone(), self.server.config.server.output_format);
        if let Some(app) = params.get("application_name") {
            session.set_guc("application_name", app)?;
        }

        self.messenger.send(&BackendMessage::AuthenticationOk)?;
        for (reported, guc) in REPORTED_PARAMETERS {
            self.messenger.send(&BackendMessage::ParameterStatus {
                name: (*reported).to_string(),
                value: session.get_guc(guc).unwrap_or_default().to_string(),
            })?;
        }
        self.messenger.send(&BackendMessage::BackendKeyData {
            process_id: handle.id,
            secret_key: handle.secret_key,
        })?;
        self.ready_for_query(&session)?;
        tracing::info!(
            "session {} started (user={}, database={})",
            session.id,
            session.user,
            session.database
        );
        Ok(session)
    }

    fn message_loop(&mut self, session: &mut PgSession) -> HeronResult<()> {
        loop {
            if session.handle.disconnect_requested() {
                return self.terminate(session);
            }
            let msg = match self.messenger.recv() {
                Ok(Some(msg)) => msg,
                Ok(None) if session.handle.disconnect_requested() => return self.terminate(session),
                Ok(None) => {
                    tracing::debug!("session {}: client disconnected", session.id);
                    return Ok(());
                }
                Err(_) if session.handle.disconnect_requested() => return self.terminate(session),
                Err(e) => {
                    // Framing is lost; report if possible and close.
                    let _ = self.messenger.send(&BackendMessage::error(&e));
                    let _ = self.messenger.flush();
                    return Err(e);
                }
            };

            if self.ignore_until_sync && !matches!(msg, FrontendMessage::Sync | FrontendMessage::Terminate) {
                tracing::trace!("session {}: skipping '{}' until Sync", session.id, msg.code() as char);
                continue;
            }

            let mode = msg.error_mode();
            let what = format!("message '{}'", msg.code() as char);
            let session_id = session.id;
            match catch_panic(&what, session_id, || self.handle_message(session, msg)) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return Ok(()),
                Err(e) => {
                    if !self.recover(session, &e, mode)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Report `e` and reset for the next message. False when the
    /// connection must close.
    fn recover(&mut self, session: &mut PgSession, e: &HeronError, mode: ErrorMode) -> HeronResult<bool> {
        match e.kind() {
            ErrorKind::Canceled => tracing::info!("session {}: {}", session.id, e),
            ErrorKind::Internal => tracing::error!("session {}: {}", session.id, e),
            ErrorKind::Protocol => tracing::warn!("session {}: {}", session.id, e),
            _ => tracing::debug!("session {}: {}", session.id, e),
        }
        heron_observability::record_error(e.pg_sqlstate());
        self.messenger.send(&BackendMessage::error(e))?;

        if e.pg_severity() == "FATAL" {
            self.messenger.flush()?;
            return Ok(false);
        }
        match mode {
            ErrorMode::Simple => {
                transaction::mark_failed(&self.server, session, true)?;
                self.ready_for_query(session)?;
                Ok(true)
            }
            ErrorMode::Extended => {
                transaction::mark_failed(&self.server, session, false)?;
                self.ignore_until_sync = true;
                self.messenger.flush()?;
                Ok(true)
            }
            ErrorMode::None | ErrorMode::Fatal => {
                self.messenger.flush()?;
                Ok(false)
            }
        }
    }

    fn terminate(&mut self, session: &PgSession) -> HeronResult<()> {
        tracing::info!("session {}: terminated by administrator", session.id);
        let _ = self.messenger.send(&BackendMessage::error(&HeronError::AdminTerminated));
        let _ = self.messenger.flush();
        Ok(())
    }

    fn teardown(&mut self, session: &mut PgSession) {
        if session.txn.is_active() {
            if let Err(e) = transaction::end_txn(&self.server, session, false) {
                tracing::warn!("session {}: rollback at disconnect failed: {}", session.id, e);
            }
        }
        session.close_all_portals();
        self.server.registry.unregister(session.id);
        tracing::info!("session {} closed", session.id);
    }

    fn handle_message(&mut self, session: &mut PgSession, msg: FrontendMessage) -> HeronResult<Flow> {
        tracing::debug!("session {}: message '{}'", session.id, msg.code() as char);
        match msg {
            FrontendMessage::Query(sql) => self.handle_query(session, &sql)?,
            FrontendMessage::Parse {
                name,
                query,
                param_types,
            } => self.handle_parse(session, name, &query, param_types)?,
            FrontendMessage::Bind {
                portal,
                statement,
                param_formats,
                param_values,
                result_formats,
            } => self.handle_bind(session, portal, &statement, &param_formats, &param_values, result_formats)?,
            FrontendMessage::Describe { kind, name } => self.handle_describe(session, kind, &name)?,
            FrontendMessage::Execute { portal, max_rows } => self.handle_execute(session, portal, max_rows)?,
            FrontendMessage::Close { kind, name } => self.handle_close(session, kind, &name)?,
            FrontendMessage::Sync => {
                self.ignore_until_sync = false;
                transaction::sync(&self.server, session)?;
                self.ready_for_query(session)?;
            }
            FrontendMessage::Flush => self.messenger.flush()?,
            FrontendMessage::Terminate => {
                tracing::debug!("session {}: terminate", session.id);
                return Ok(Flow::Stop);
            }
            FrontendMessage::CopyData(_) | FrontendMessage::CopyDone | FrontendMessage::CopyFail(_) => {
                // Leftovers of a COPY that already failed.
                tracing::trace!("session {}: ignoring COPY message outside COPY", session.id);
            }
            other => {
                return Err(ProtocolError::UnexpectedMessage(other.code() as char).into());
            }
        }
        Ok(Flow::Continue)
    }

    fn ready_for_query(&mut self, session: &PgSession) -> HeronResult<()> {
        self.messenger.send(&BackendMessage::ReadyForQuery {
            txn_status: session.txn_status_byte(),
        })?;
        self.messenger.flush()
    }

    // ── simple query ─────────────────────────────────────────────────

    fn handle_query(&mut self, session: &mut PgSession, sql: &str) -> HeronResult<()> {
        session.handle.clear_cancel();
        let statements = self.server.backend.parser.parse(sql)?;
        if statements.is_empty() {
            self.messenger.send(&BackendMessage::EmptyQueryResponse)?;
        }
        for parsed in &statements {
            if parsed.param_count > 0 {
                return Err(CompileError::Semantic("there is no parameter $1".into()).into());
            }
            let stmt = self.server.generate(session, parsed, &[])?;
            self.run_simple(session, stmt)?;
        }
        self.ready_for_query(session)
    }

    fn run_simple(&mut self, session: &mut PgSession, stmt: Arc<dyn PgStatement>) -> HeronResult<()> {
        let guard = transaction::enter(&self.server, session, stmt.as_ref())?;
        let mut portal = Portal::new(
            "",
            stmt,
            Vec::new(),
            Vec::new(),
            session.output_format,
            PortalCursor::new(false, false),
        );
        let result = self.execute_portal(session, &mut portal, 0, true);
        let result = finish_with_cleanup(result, || portal.close());
        let left = transaction::leave(&self.server, session, guard, result.is_ok(), true);
        let outcome = finish_with_cleanup(result, || left)?;
        self.send_completion(&outcome)
    }

    // ── extended protocol ────────────────────────────────────────────

    fn handle_parse(
        &mut self,
        session: &mut PgSession,
        name: String,
        query: &str,
        param_oids: Vec<i32>,
    ) -> HeronResult<()> {
        session.handle.clear_cancel();
        let mut statements = self.server.backend.parser.parse(query)?;
        if statements.len() > 1 {
            return Err(HeronError::Parse(
                "cannot insert multiple commands into a prepared statement".into(),
            ));
        }
        let parsed = statements
            .pop()
            .unwrap_or_else(|| ParsedStatement::new(StatementNode::Empty, "", 0));
        if !name.is_empty() && session.prepared.contains_key(&name) {
            return Err(CompileError::DuplicatePreparedStatement(name).into());
        }

        let stmt = self.server.generate(session, &parsed, &param_oids)?;
        check_describable(stmt.as_ref())?;
        session.prepared.insert(
            name.clone(),
            PreparedStatement {
                name,
                sql: parsed.sql,
                param_oids,
                statement: stmt,
                prepared_at: Instant::now(),
            },
        );
        self.messenger.send(&BackendMessage::ParseComplete)
    }

    fn handle_bind(
        &mut self,
        session: &mut PgSession,
        portal_name: String,
        statement_name: &str,
        param_formats: &[i16],
        param_values: &[Option<Vec<u8>>],
        result_formats: Vec<i16>,
    ) -> HeronResult<()> {
        let stmt = generator::revalidate(&self.server, session, statement_name)?;
        check_describable(stmt.as_ref())?;
        transaction::check_aborted(session, stmt.as_ref())?;
        if !portal_name.is_empty() && session.portals.contains_key(&portal_name) {
            return Err(CompileError::DuplicateCursor(portal_name).into());
        }
        let bindings = decode_params(param_values, param_formats, stmt.parameter_types())?;
        validate_formats(&result_formats, stmt.result_columns().len(), "Bind result format list")?;

        if matches!(stmt.transaction_mode(), TransactionMode::Read | TransactionMode::Write)
            && !session.txn.is_active()
        {
            transaction::begin_txn(&self.server, session, false, false)?;
        }
        let suspendable = stmt.can_suspend(session.txn.is_active());
        let portal = Portal::new(
            portal_name.clone(),
            stmt,
            bindings,
            result_formats,
            session.output_format,
            PortalCursor::new(suspendable, true),
        );
        if let Some(mut replaced) = session.portals.insert(portal_name, portal) {
            replaced.close()?;
        }
        self.messenger.send(&BackendMessage::BindComplete)
    }

    fn handle_describe(&mut self, session: &mut PgSession, kind: u8, name: &str) -> HeronResult<()> {
        let fields = match kind {
            b'S' => {
                let stmt = generator::revalidate(&self.server, session, name)?;
                let type_oids = stmt.parameter_types().iter().map(|t| t.pg_oid()).collect();
                self.messenger.send(&BackendMessage::ParameterDescription { type_oids })?;
                describe_fields(session.output_format, stmt.result_columns(), &[])
            }
            b'P' => {
                let portal = session
                    .portals
                    .get(name)
                    .ok_or_else(|| CompileError::UnknownPortal(name.to_string()))?;
                describe_fields(
                    portal.output_format,
                    portal.statement.result_columns(),
                    &portal.result_formats,
                )
            }
            other => {
                return Err(HeronError::protocol(format!(
                    "invalid Describe kind '{}'",
                    other as char
                )))
            }
        };
        if fields.is_empty() {
            self.messenger.send(&BackendMessage::NoData)
        } else {
            self.messenger.send(&BackendMessage::RowDescription { fields })
        }
    }

    fn handle_execute(&mut self, session: &mut PgSession, portal_name: String, max_rows: i32) -> HeronResult<()> {
        let mut portal = session
            .portals
            .remove(&portal_name)
            .ok_or_else(|| CompileError::UnknownPortal(portal_name.clone()))?;
        let stmt = portal.statement.clone();

        let result = match transaction::enter(&self.server, session, stmt.as_ref()) {
            Ok(guard) => {
                let result = self.execute_portal(session, &mut portal, max_rows, false);
                let left = transaction::leave(&self.server, session, guard, result.is_ok(), false);
                finish_with_cleanup(result, || left)
            }
            Err(e) => Err(e),
        };
        session.portals.insert(portal_name, portal);
        self.send_completion(&result?)
    }

    fn handle_close(&mut self, session: &mut PgSession, kind: u8, name: &str) -> HeronResult<()> {
        match kind {
            b'S' => {
                session.prepared.remove(name);
            }
            b'P' => {
                if let Some(mut portal) = session.portals.remove(name) {
                    portal.close()?;
                }
            }
            other => {
                return Err(HeronError::protocol(format!("invalid Close kind '{}'", other as char)));
            }
        }
        self.messenger.send(&BackendMessage::CloseComplete)
    }

    // ── shared ───────────────────────────────────────────────────────

    fn execute_portal(
        &mut self,
        session: &mut PgSession,
        portal: &mut Portal,
        max_rows: i32,
        describe_rows: bool,
    ) -> HeronResult<ExecResult> {
        let stmt = portal.statement.clone();
        let verb = stmt.kind().name();
        let started = Instant::now();
        let result = {
            let mut ctx = ExecContext {
                messenger: &mut self.messenger,
                session: &mut *session,
                server: self.server.as_ref(),
                describe_rows,
            };
            stmt.execute(&mut ctx, portal, max_rows)
        };
        let elapsed_us = started.elapsed().as_micros() as u64;
        heron_observability::record_execute(verb, elapsed_us, result.is_ok());
        if let Ok(r) = &result {
            tracing::debug!(
                "session {}: {} -> {} ({}us{})",
                session.id,
                verb,
                r.tag,
                elapsed_us,
                if r.suspended { ", suspended" } else { "" }
            );
        }
        result
    }

    fn send_completion(&mut self, result: &ExecResult) -> HeronResult<()> {
        let msg = if result.suspended {
            BackendMessage::PortalSuspended
        } else if result.tag == CommandTag::Empty {
            BackendMessage::EmptyQueryResponse
        } else {
            BackendMessage::CommandComplete {
                tag: result.tag.to_string(),
            }
        };
        self.messenger.send(&msg)
    }
}

/// Extended-protocol clients learn the row shape from Describe, before any
/// DataRow arrives.
fn check_describable(stmt: &dyn PgStatement) -> HeronResult<()> {
    if stmt.rows_undescribed() {
        return Err(CompileError::Unsupported(
            "routine without declared result columns cannot be run through the extended protocol; use a simple query"
                .into(),
        )
        .into());
    }
    Ok(())
}

/// Run `f`, turning a panic into an internal error so the session is still
/// torn down and the worker thread survives.
fn catch_panic<T>(what: &str, session_id: i32, f: impl FnOnce() -> HeronResult<T>) -> HeronResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "<non-string panic payload>".to_string());
            tracing::error!(session_id, "panic while handling {}: {}", what, message);
            Err(HeronError::internal(format!("panic while handling {what}: {message}")))
        }
    }
}
