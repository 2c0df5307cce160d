use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use heron_common::error::{ExecutionError, HeronResult};
use heron_common::types::{DataType, ResultColumn};

use crate::backend::{CompiledQuery, CopyTarget, CursorRequest};
use crate::codec::BackendMessage;
use crate::copy_stream::{CopyInReader, CopyOutStream, FileDestination};
use crate::outputter::csv::{CsvCopyOutputter, CsvFormat};
use crate::portal::Portal;
use crate::server::ServerContext;
use crate::statement::{
    run_cursor, AisGenerationMode, CommandTag, ExecContext, ExecResult, PgStatement, StatementKind,
    TransactionMode,
};

fn check_server_file(server: &ServerContext, path: &str) -> HeronResult<()> {
    if !server.config.copy.allow_server_files {
        return Err(ExecutionError::InsufficientPrivilege(format!(
            "COPY to or from server file \"{path}\" is not allowed"
        ))
        .into());
    }
    Ok(())
}

/// `COPY table [(columns)] FROM STDIN | 'file'`
#[derive(Debug)]
pub struct CopyFromStatement {
    target: CopyTarget,
    file: Option<String>,
    format: CsvFormat,
    columns: Vec<ResultColumn>,
}

impl CopyFromStatement {
    pub fn new(target: CopyTarget, file: Option<String>, format: CsvFormat, columns: Vec<ResultColumn>) -> Self {
        Self {
            target,
            file,
            format,
            columns,
        }
    }
}

impl PgStatement for CopyFromStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::CopyFrom
    }

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::Write
    }

    fn can_suspend(&self, _txn_active: bool) -> bool {
        false
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        ctx.session.handle.check_interrupts()?;
        let txn = ctx.session.txn.handle;
        let loader = ctx.server.backend.bulk_loader.clone();

        let rows = match &self.file {
            Some(path) => {
                check_server_file(ctx.server, path)?;
                let mut input = BufReader::new(File::open(path)?);
                loader.load(&self.target, &self.format, &mut input, txn)?
            }
            None => {
                ctx.messenger.send(&BackendMessage::CopyInResponse {
                    format: 0,
                    column_formats: vec![0; self.columns.len()],
                })?;
                ctx.messenger.flush()?;

                let mut reader = CopyInReader::new(&mut *ctx.messenger);
                match loader.load(&self.target, &self.format, &mut reader, txn) {
                    Ok(rows) => {
                        if let Err(e) = reader.drain() {
                            return Err(reader.take_failure().unwrap_or_else(|| e.into()));
                        }
                        tracing::debug!("COPY FROM STDIN: {} bytes", reader.bytes_read());
                        rows
                    }
                    Err(e) => return Err(reader.take_failure().unwrap_or(e)),
                }
            }
        };

        heron_observability::record_copy_rows("in", rows);
        portal.cursor.complete(rows);
        Ok(ExecResult::complete(CommandTag::Copy(rows)))
    }
}

/// `COPY table | (query) TO STDOUT | 'file'`. Both sources run as a query
/// cursor; only the destination of the formatted rows differs.
#[derive(Debug)]
pub struct CopyToStatement {
    source: CompiledQuery,
    file: Option<String>,
    format: CsvFormat,
    generation: u64,
}

impl CopyToStatement {
    pub fn new(source: CompiledQuery, file: Option<String>, format: CsvFormat, generation: u64) -> Self {
        Self {
            source,
            file,
            format,
            generation,
        }
    }
}

impl PgStatement for CopyToStatement {
    fn kind(&self) -> StatementKind {
        StatementKind::CopyTo
    }

    fn parameter_types(&self) -> &[DataType] {
        &self.source.param_types
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

    fn can_suspend(&self, _txn_active: bool) -> bool {
        false
    }

    fn execute(&self, ctx: &mut ExecContext<'_>, portal: &mut Portal, _max_rows: i32) -> HeronResult<ExecResult> {
        let txn = ctx.session.txn.handle;
        let plan = &self.source.plan;
        let columns = self.source.columns.clone();
        let bindings = portal.bindings.as_slice();
        let open = || plan.cursor(&CursorRequest { bindings, txn });

        let run = match &self.file {
            Some(path) => {
                check_server_file(ctx.server, path)?;
                let mut dest = FileDestination::create(Path::new(path))?;
                let mut out = CsvCopyOutputter::new(&mut dest, self.format.clone(), columns);
                run_cursor(&ctx.session.handle, &mut portal.cursor, open, 0, &mut out)?
            }
            None => {
                let mut dest = CopyOutStream::new(&mut *ctx.messenger);
                let mut out = CsvCopyOutputter::new(&mut dest, self.format.clone(), columns);
                run_cursor(&ctx.session.handle, &mut portal.cursor, open, 0, &mut out)?
            }
        };

        heron_observability::record_copy_rows("out", run.rows);
        Ok(ExecResult::complete(CommandTag::Copy(portal.cursor.rows_processed())))
    }
}
