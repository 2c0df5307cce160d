//! Statement node shapes handed over by the SQL parser.
//!
//! The parser owns SQL syntax. This module only fixes the shapes the
//! generator chain matches on; query bodies stay as SQL text for the
//! external compiler.

use heron_common::types::DataType;

/// One parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStatement {
    pub node: StatementNode,
    /// Text of this statement alone, used as the statement-cache key.
    pub sql: String,
    /// Number of distinct `$n` placeholders.
    pub param_count: usize,
}

impl ParsedStatement {
    pub fn new(node: StatementNode, sql: impl Into<String>, param_count: usize) -> Self {
        Self {
            node,
            sql: sql.into(),
            param_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementNode {
    /// SELECT / INSERT / UPDATE / DELETE, compiled by the external optimizer.
    Dml(DmlNode),
    Ddl(DdlNode),
    Prepare {
        name: String,
        param_types: Vec<DataType>,
        statement: Box<ParsedStatement>,
    },
    Execute {
        name: String,
        args: Vec<Arg>,
    },
    /// `None` is DEALLOCATE ALL.
    Deallocate {
        name: Option<String>,
    },
    DeclareCursor {
        name: String,
        query: Box<ParsedStatement>,
    },
    Fetch {
        name: String,
        count: FetchCount,
    },
    /// `None` is CLOSE ALL.
    CloseCursor {
        name: Option<String>,
    },
    Copy(CopyNode),
    Session(SessionNode),
    Admin(AdminNode),
    Explain {
        verbose: bool,
        statement: DmlNode,
    },
    Call(CallNode),
    /// Whitespace or comments only.
    Empty,
}

impl StatementNode {
    /// Short name used in log lines.
    pub fn describe(&self) -> &'static str {
        match self {
            StatementNode::Dml(d) => d.kind.verb(),
            StatementNode::Ddl(_) => "DDL",
            StatementNode::Prepare { .. } => "PREPARE",
            StatementNode::Execute { .. } => "EXECUTE",
            StatementNode::Deallocate { .. } => "DEALLOCATE",
            StatementNode::DeclareCursor { .. } => "DECLARE CURSOR",
            StatementNode::Fetch { .. } => "FETCH",
            StatementNode::CloseCursor { .. } => "CLOSE CURSOR",
            StatementNode::Copy(_) => "COPY",
            StatementNode::Session(_) => "SESSION",
            StatementNode::Admin(_) => "ADMIN",
            StatementNode::Explain { .. } => "EXPLAIN",
            StatementNode::Call(_) => "CALL",
            StatementNode::Empty => "EMPTY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmlKind {
    Select,
    Insert,
    Update,
    Delete,
}

impl DmlKind {
    pub fn verb(&self) -> &'static str {
        match self {
            DmlKind::Select => "SELECT",
            DmlKind::Insert => "INSERT",
            DmlKind::Update => "UPDATE",
            DmlKind::Delete => "DELETE",
        }
    }

    pub fn is_query(&self) -> bool {
        matches!(self, DmlKind::Select)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DmlNode {
    pub kind: DmlKind,
    pub sql: String,
}

impl DmlNode {
    pub fn new(kind: DmlKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DdlNode {
    /// Command tag, e.g. `CREATE TABLE`.
    pub verb: String,
    pub sql: String,
}

/// A literal or placeholder argument to EXECUTE or CALL.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Text form of a literal; `None` is NULL.
    Literal(Option<String>),
    /// `$n`, 1-based.
    Param(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchCount {
    Count(u64),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    /// COPY ... FROM: client or file → table.
    From,
    /// COPY ... TO: table or query → client or file.
    To,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CopyRelation {
    Table { name: String, columns: Vec<String> },
    Query(DmlNode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFormatKind {
    Text,
    Csv,
}

/// Options as written in `WITH (...)`; unset options take defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CopyOptions {
    pub format: Option<CopyFormatKind>,
    pub delimiter: Option<String>,
    pub quote: Option<String>,
    pub escape: Option<String>,
    pub null: Option<String>,
    pub header: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CopyNode {
    pub relation: CopyRelation,
    pub direction: CopyDirection,
    /// Server-local file; `None` is STDIN / STDOUT.
    pub file: Option<String>,
    pub options: CopyOptions,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionNode {
    Begin { read_only: bool },
    Commit,
    Rollback,
    SetTransaction { read_only: bool },
    Set { name: String, value: String },
    /// `None` is RESET ALL.
    Reset { name: Option<String> },
    Show { name: String },
    DiscardAll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdminNode {
    InterruptSession(i32),
    DisconnectSession(i32),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallNode {
    pub routine: String,
    pub args: Vec<Arg>,
}
