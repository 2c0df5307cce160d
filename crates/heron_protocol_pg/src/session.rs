use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use heron_common::config::OutputFormat;
use heron_common::error::{CompileError, HeronResult};

use crate::backend::TxnHandle;
use crate::portal::Portal;
use crate::registry::SessionHandle;
use crate::statement::PgStatement;

/// A prepared statement stored in the session, by protocol Parse or SQL PREPARE.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    /// Original SQL with $1, $2, ... placeholders.
    pub sql: String,
    /// Parameter type OIDs declared by the client (0 = unspecified).
    pub param_oids: Vec<i32>,
    pub statement: Arc<dyn PgStatement>,
    pub prepared_at: Instant,
}

/// Transaction bookkeeping of a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnState {
    pub handle: Option<TxnHandle>,
    /// Opened by BEGIN; otherwise implicit (single statement, or until Sync).
    pub explicit: bool,
    /// A statement failed; only COMMIT/ROLLBACK may run.
    pub failed: bool,
    pub read_only: bool,
}

impl TxnState {
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn in_block(&self) -> bool {
        self.explicit && self.handle.is_some()
    }
}

/// Default session GUC variables.
fn default_guc_vars(output_format: OutputFormat) -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("server_version".into(), "15.0.0".into());
    m.insert("server_encoding".into(), "UTF8".into());
    m.insert("client_encoding".into(), "UTF8".into());
    m.insert("standard_conforming_strings".into(), "on".into());
    m.insert("datestyle".into(), "ISO, MDY".into());
    m.insert("timezone".into(), "UTC".into());
    m.insert("integer_datetimes".into(), "on".into());
    m.insert("transaction_read_only".into(), "off".into());
    m.insert("application_name".into(), String::new());
    m.insert("output_format".into(), output_format.as_str().into());
    m
}

/// Per-connection session state.
pub struct PgSession {
    /// Session ID (maps to PG backend process ID).
    pub id: i32,
    pub database: String,
    pub user: String,
    /// Shared with the server registry; carries cancel/disconnect flags.
    pub handle: Arc<SessionHandle>,
    pub txn: TxnState,
    /// Prepared statements: name → PreparedStatement ("" is the unnamed one).
    pub prepared: HashMap<String, PreparedStatement>,
    /// Protocol portals and DECLAREd cursors share one namespace.
    pub portals: HashMap<String, Portal>,
    pub output_format: OutputFormat,
    default_output_format: OutputFormat,
    guc_vars: HashMap<String, String>,
}

impl PgSession {
    pub fn new(handle: Arc<SessionHandle>, output_format: OutputFormat) -> Self {
        Self {
            id: handle.id,
            database: handle.database.clone(),
            user: handle.user.clone(),
            handle,
            txn: TxnState::default(),
            prepared: HashMap::new(),
            portals: HashMap::new(),
            output_format,
            default_output_format: output_format,
            guc_vars: default_guc_vars(output_format),
        }
    }

    /// PG transaction status indicator byte for ReadyForQuery.
    pub fn txn_status_byte(&self) -> u8 {
        if !self.txn.in_block() {
            b'I'
        } else if self.txn.failed {
            b'E'
        } else {
            b'T'
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_active()
    }

    /// Get a GUC variable value.
    pub fn get_guc(&self, name: &str) -> Option<&str> {
        self.guc_vars.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    /// Set a GUC variable value. `output_format` also switches the result
    /// encoding for portals created afterwards.
    pub fn set_guc(&mut self, name: &str, value: &str) -> HeronResult<()> {
        let key = name.to_lowercase();
        if key == "output_format" {
            self.output_format = OutputFormat::parse(value).ok_or_else(|| {
                CompileError::InvalidParameterValue {
                    name: key.clone(),
                    value: value.to_string(),
                }
            })?;
            self.guc_vars.insert(key, self.output_format.as_str().into());
            return Ok(());
        }
        self.guc_vars.insert(key, value.to_string());
        Ok(())
    }

    /// Reset a GUC variable to its default value.
    pub fn reset_guc(&mut self, name: &str) {
        let defaults = default_guc_vars(self.default_output_format);
        let key = name.to_lowercase();
        if key == "output_format" {
            self.output_format = self.default_output_format;
        }
        match defaults.get(&key) {
            Some(default_val) => {
                self.guc_vars.insert(key, default_val.clone());
            }
            None => {
                self.guc_vars.remove(&key);
            }
        }
    }

    /// Reset all GUC variables to defaults.
    pub fn reset_all_gucs(&mut self) {
        self.output_format = self.default_output_format;
        self.guc_vars = default_guc_vars(self.default_output_format);
    }

    pub fn guc_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.guc_vars.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close and drop every portal. Close failures are logged; there is no
    /// client request left to report them against.
    pub fn close_all_portals(&mut self) {
        for (name, mut portal) in self.portals.drain() {
            if let Err(e) = portal.close() {
                tracing::warn!("session {}: closing portal '{}' failed: {}", self.id, name, e);
            }
        }
    }

    /// DISCARD ALL: forget prepared statements, portals and settings.
    pub fn discard_all(&mut self) {
        self.close_all_portals();
        self.prepared.clear();
        self.reset_all_gucs();
    }
}
