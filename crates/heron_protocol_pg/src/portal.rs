use std::sync::Arc;
use std::time::Instant;

use heron_common::config::OutputFormat;
use heron_common::datum::Datum;
use heron_common::error::{HeronError, HeronResult};

use crate::backend::Cursor;
use crate::statement::PgStatement;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    /// Suspendable, nothing opened yet.
    Unopened,
    /// Not suspendable: every call opens and drains a fresh cursor.
    Normal,
    /// Stopped at a row limit; the live cursor is retained.
    Suspended,
    /// Done; no cursor is held.
    Exhausted,
}

/// Cursor bookkeeping of one portal.
///
/// The retained cursor is moved out by `start_cursor` and handed back to
/// `finish_cursor` (or `abort`), so a portal can never hold two live cursors.
pub struct PortalCursor {
    state: PortalState,
    cursor: Option<Box<dyn Cursor>>,
    rows_processed: u64,
    report_suspended: bool,
}

impl PortalCursor {
    /// `suspendable` decides the initial state. `report_suspended` is whether
    /// a suspension is signalled to the client as PortalSuspended.
    pub fn new(suspendable: bool, report_suspended: bool) -> Self {
        Self {
            state: if suspendable {
                PortalState::Unopened
            } else {
                PortalState::Normal
            },
            cursor: None,
            rows_processed: 0,
            report_suspended,
        }
    }

    pub fn state(&self) -> PortalState {
        self.state
    }

    pub fn rows_processed(&self) -> u64 {
        self.rows_processed
    }

    /// The next `start_cursor` will open a new cursor.
    pub fn is_fresh(&self) -> bool {
        matches!(self.state, PortalState::Unopened | PortalState::Normal)
    }

    /// Resume the retained cursor, or open a new one via `open`.
    /// Returns `None` when the portal is exhausted.
    pub fn start_cursor<F>(&mut self, open: F) -> HeronResult<Option<Box<dyn Cursor>>>
    where
        F: FnOnce() -> HeronResult<Box<dyn Cursor>>,
    {
        match self.state {
            PortalState::Unopened | PortalState::Normal => {
                let mut cursor = match open() {
                    Ok(c) => c,
                    Err(e) => {
                        self.state = PortalState::Exhausted;
                        return Err(e);
                    }
                };
                if let Err(e) = cursor.open() {
                    self.state = PortalState::Exhausted;
                    return Err(match cursor.close() {
                        Ok(()) => e,
                        Err(close_err) => close_err.with_original(e),
                    });
                }
                Ok(Some(cursor))
            }
            PortalState::Suspended => match self.cursor.take() {
                Some(cursor) => Ok(Some(cursor)),
                None => {
                    self.state = PortalState::Exhausted;
                    Err(HeronError::internal("suspended portal lost its cursor"))
                }
            },
            PortalState::Exhausted => Ok(None),
        }
    }

    /// Account for a call that produced `rows`. When `suspend` is requested
    /// and the portal is suspendable the cursor is retained; otherwise it is
    /// closed. Returns whether the client should see PortalSuspended.
    pub fn finish_cursor(
        &mut self,
        mut cursor: Box<dyn Cursor>,
        rows: u64,
        suspend: bool,
    ) -> HeronResult<bool> {
        self.rows_processed += rows;
        if suspend && self.state != PortalState::Normal {
            self.state = PortalState::Suspended;
            self.cursor = Some(cursor);
            return Ok(self.report_suspended);
        }
        self.state = PortalState::Exhausted;
        cursor.close()?;
        Ok(false)
    }

    /// Close `cursor` after `error`; the portal ends up exhausted. A close
    /// failure propagates with `error` kept as its original.
    pub fn abort(&mut self, mut cursor: Box<dyn Cursor>, rows: u64, error: HeronError) -> HeronError {
        self.rows_processed += rows;
        self.state = PortalState::Exhausted;
        match cursor.close() {
            Ok(()) => error,
            Err(close_err) => close_err.with_original(error),
        }
    }

    /// Record work done without a cursor (COPY FROM, direct routine calls).
    pub fn complete(&mut self, rows: u64) {
        self.rows_processed += rows;
        self.state = PortalState::Exhausted;
    }

    /// Close any retained cursor and force `Exhausted`. Idempotent.
    pub fn close(&mut self) -> HeronResult<()> {
        self.state = PortalState::Exhausted;
        match self.cursor.take() {
            Some(mut cursor) => cursor.close(),
            None => Ok(()),
        }
    }
}

impl Drop for PortalCursor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("closing portal cursor on drop failed: {}", e);
        }
    }
}

/// A statement bound to parameter values, executable in chunks.
pub struct Portal {
    pub name: String,
    pub statement: Arc<dyn PgStatement>,
    pub bindings: Vec<Datum>,
    /// Per result column: 0 text, 1 binary.
    pub result_formats: Vec<i16>,
    pub output_format: OutputFormat,
    pub cursor: PortalCursor,
    pub created_at: Instant,
}

impl Portal {
    pub fn new(
        name: impl Into<String>,
        statement: Arc<dyn PgStatement>,
        bindings: Vec<Datum>,
        result_formats: Vec<i16>,
        output_format: OutputFormat,
        cursor: PortalCursor,
    ) -> Self {
        Self {
            name: name.into(),
            statement,
            bindings,
            result_formats,
            output_format,
            cursor,
            created_at: Instant::now(),
        }
    }

    pub fn close(&mut self) -> HeronResult<()> {
        self.cursor.close()
    }
}

impl std::fmt::Debug for Portal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Portal")
            .field("name", &self.name)
            .field("state", &self.cursor.state())
            .field("rows_processed", &self.cursor.rows_processed())
            .finish()
    }
}
