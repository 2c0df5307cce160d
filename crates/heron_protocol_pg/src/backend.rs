//! Seams to the collaborators this engine drives but does not implement:
//! parser, optimizer/operator engine, transaction service, DDL executor,
//! routine catalog and bulk loader.

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use heron_common::datum::{Datum, Row};
use heron_common::error::HeronResult;
use heron_common::types::{DataType, ResultColumn};

use crate::ast::{DdlNode, DmlNode, ParsedStatement};
use crate::outputter::csv::CsvFormat;

pub trait SqlParser: Send + Sync {
    /// Split and parse a query string. An empty or comment-only string yields
    /// no statements.
    fn parse(&self, sql: &str) -> HeronResult<Vec<ParsedStatement>>;
}

/// Opaque handle to a backend transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnHandle {
    pub id: u64,
    pub read_only: bool,
}

pub trait TransactionService: Send + Sync {
    fn begin(&self, read_only: bool) -> HeronResult<TxnHandle>;
    fn commit(&self, txn: TxnHandle) -> HeronResult<()>;
    fn rollback(&self, txn: TxnHandle) -> HeronResult<()>;
}

/// What a compiled plan needs in order to produce a cursor.
pub struct CursorRequest<'a> {
    pub bindings: &'a [Datum],
    pub txn: Option<TxnHandle>,
}

/// Row source contract: `open`, then `next` until `None`, then `close`.
pub trait Cursor: Send {
    fn open(&mut self) -> HeronResult<()>;
    fn next(&mut self) -> HeronResult<Option<Row>>;
    fn close(&mut self) -> HeronResult<()>;
}

/// Physical operator tree produced by the compiler. Shared across portals.
pub trait OperatorPlan: Send + Sync + fmt::Debug {
    fn cursor(&self, request: &CursorRequest<'_>) -> HeronResult<Box<dyn Cursor>>;
    /// Plan rendering for EXPLAIN, one line per operator.
    fn explain(&self, verbose: bool) -> Vec<String>;
}

pub struct CompileRequest<'a> {
    pub node: &'a DmlNode,
    /// Client-declared parameter types; `None` where left unspecified.
    pub param_types: &'a [Option<DataType>],
    pub param_count: usize,
}

#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub plan: Arc<dyn OperatorPlan>,
    /// Output shape; empty when the statement returns no rows.
    pub columns: Vec<ResultColumn>,
    /// Resolved type of every `$n`.
    pub param_types: Vec<DataType>,
    pub cost_estimate: Option<f64>,
}

pub trait QueryCompiler: Send + Sync {
    fn compile(&self, request: &CompileRequest<'_>) -> HeronResult<CompiledQuery>;
}

pub trait DdlExecutor: Send + Sync {
    /// Apply a schema change. Runs outside any session transaction.
    fn execute(&self, node: &DdlNode) -> HeronResult<()>;
}

/// Receives rows from a direct-convention routine as it produces them.
pub trait RowSink {
    fn push(&mut self, row: Row) -> HeronResult<()>;
}

/// Routine written against the host API, called with its arguments.
pub trait DirectRoutine: Send + Sync {
    fn invoke(&self, args: &[Datum], txn: Option<TxnHandle>, sink: &mut dyn RowSink)
        -> HeronResult<()>;
}

#[derive(Clone)]
pub enum RoutineBody {
    Direct(Arc<dyn DirectRoutine>),
    /// Routine whose body compiles to an operator plan, run as a cursor.
    Plan(Arc<dyn OperatorPlan>),
}

impl fmt::Debug for RoutineBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutineBody::Direct(_) => f.write_str("Direct"),
            RoutineBody::Plan(p) => write!(f, "Plan({p:?})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutineDef {
    pub name: String,
    pub param_types: Vec<DataType>,
    /// Declared output shape; empty for routines without a fixed shape.
    pub result_columns: Vec<ResultColumn>,
    pub read_only: bool,
    /// Rows are pushed to the client as a COPY stream while the routine runs.
    pub streaming: bool,
    pub body: RoutineBody,
}

pub trait RoutineCatalog: Send + Sync {
    fn resolve(&self, name: &str, arg_count: usize) -> HeronResult<RoutineDef>;
}

/// COPY FROM target: a table and optional column list.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyTarget {
    pub table: String,
    pub columns: Vec<String>,
}

pub trait BulkLoader: Send + Sync {
    /// Column shape of the target, used for CopyInResponse.
    fn describe_target(&self, target: &CopyTarget) -> HeronResult<Vec<ResultColumn>>;
    /// Read delimited records from `input` until end-of-stream and insert
    /// them. Returns the number of rows loaded.
    fn load(
        &self,
        target: &CopyTarget,
        format: &CsvFormat,
        input: &mut dyn Read,
        txn: Option<TxnHandle>,
    ) -> HeronResult<u64>;
}

/// The full set of external services a server runs against.
#[derive(Clone)]
pub struct Backend {
    pub parser: Arc<dyn SqlParser>,
    pub compiler: Arc<dyn QueryCompiler>,
    pub transactions: Arc<dyn TransactionService>,
    pub ddl: Arc<dyn DdlExecutor>,
    pub routines: Arc<dyn RoutineCatalog>,
    pub bulk_loader: Arc<dyn BulkLoader>,
}
