#![allow(dead_code, unused_imports)]

//! In-memory backend and scripted client for driving whole connections.
//!
//! The fake backend understands a small SQL dialect over in-memory tables:
//! `CREATE TABLE t (a int, b text)`, `SELECT cols|* FROM t [WHERE c = v]`,
//! `SELECT v, ...` without a table, `INSERT INTO t VALUES (...), ...`,
//! `UPDATE t SET c = v [WHERE c = v]`, `DELETE FROM t [WHERE c = v]`, plus the
//! session, cursor, COPY, admin, EXPLAIN and CALL verbs the engine handles.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, BufReader, Cursor as IoCursor, Read, Write};

use bytes::BytesMut;
use parking_lot::Mutex;

pub use std::sync::Arc;

pub use heron_common::config::{HeronConfig, OutputFormat};
pub use heron_common::datum::{Datum, Row};
pub use heron_common::error::{CompileError, ExecutionError, HeronError, HeronResult};
pub use heron_common::types::{DataType, ResultColumn};
pub use heron_protocol_pg::ast::{
    AdminNode, Arg, CallNode, CopyDirection, CopyFormatKind, CopyNode, CopyOptions, CopyRelation, DdlNode,
    DmlKind, DmlNode, FetchCount, ParsedStatement, SessionNode, StatementNode,
};
pub use heron_protocol_pg::backend::{
    Backend, BulkLoader, CompileRequest, CompiledQuery, CopyTarget, Cursor, CursorRequest, DdlExecutor,
    DirectRoutine, OperatorPlan, QueryCompiler, RoutineBody, RoutineCatalog, RoutineDef, RowSink, SqlParser,
    TransactionService, TxnHandle,
};
pub use heron_protocol_pg::codec::{self, BackendMessage, FrontendMessage, PROTOCOL_VERSION_3};
pub use heron_protocol_pg::outputter::csv::{CsvFormat, CsvReader};
pub use heron_protocol_pg::{PgConnection, ServerContext};

// ── store ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Table {
    pub columns: Vec<ResultColumn>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Default)]
pub struct Store {
    pub tables: BTreeMap<String, Table>,
    /// Table images taken at the first write of each live transaction.
    undo: HashMap<u64, BTreeMap<String, Option<Table>>>,
    next_txn: u64,
    /// BEGIN / COMMIT / ROLLBACK events, in order.
    pub txn_log: Vec<String>,
    /// Number of successful compilations.
    pub compiles: usize,
    pub open_cursors: i64,
}

impl Store {
    fn table(&self, name: &str) -> HeronResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| CompileError::UnknownTable(name.to_string()).into())
    }

    /// Remember `name` as it was before `txn` first wrote to it.
    fn touch(&mut self, txn: Option<TxnHandle>, name: &str) {
        if let Some(txn) = txn {
            let before = self.tables.get(name).cloned();
            self.undo
                .entry(txn.id)
                .or_default()
                .entry(name.to_string())
                .or_insert(before);
        }
    }

    pub fn rows(&self, name: &str) -> Vec<Vec<Option<String>>> {
        self.tables
            .get(name)
            .map(|t| t.rows.iter().map(|r| r.values.iter().map(Datum::to_pg_text).collect()).collect())
            .unwrap_or_default()
    }
}

pub type Shared = Arc<Mutex<Store>>;

fn column_type(name: &str) -> HeronResult<DataType> {
    match name.trim().to_ascii_lowercase().as_str() {
        "int" | "integer" | "bigint" | "int8" => Ok(DataType::Int64),
        "text" | "varchar" => Ok(DataType::Text),
        "bool" | "boolean" => Ok(DataType::Boolean),
        other => Err(CompileError::Unsupported(format!("type {other}")).into()),
    }
}

fn literal(text: &str, ty: DataType) -> HeronResult<Datum> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("null") {
        return Ok(Datum::Null);
    }
    let unquoted = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')).unwrap_or(text);
    Datum::from_pg_text(unquoted, ty).map_err(|e| ExecutionError::InvalidTextRepresentation(e).into())
}

// ── parser ───────────────────────────────────────────────────────────────

pub struct FakeParser;

impl SqlParser for FakeParser {
    fn parse(&self, sql: &str) -> HeronResult<Vec<ParsedStatement>> {
        sql.split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty() && !s.starts_with("--"))
            .map(parse_statement)
            .collect()
    }
}

fn parse_statement(text: &str) -> HeronResult<ParsedStatement> {
    let node = parse_node(text)?;
    let params = match node {
        StatementNode::Prepare { .. } => 0,
        _ => param_count(text),
    };
    Ok(ParsedStatement::new(node, text, params))
}

fn param_count(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let digits: String = text[i + 1..].chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(n) = digits.parse::<usize>() {
                max = max.max(n);
            }
            i += digits.len();
        }
        i += 1;
    }
    max
}

/// Split `text` around the first case-insensitive occurrence of `kw`.
fn split_kw<'a>(text: &'a str, kw: &str) -> Option<(&'a str, &'a str)> {
    let pos = text.to_ascii_uppercase().find(kw)?;
    Some((&text[..pos], &text[pos + kw.len()..]))
}

fn matching_paren(text: &str) -> HeronResult<usize> {
    let mut depth = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
            _ => {}
        }
    }
    Err(HeronError::Parse("unbalanced parentheses".into()))
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .unwrap_or(s)
        .to_string()
}

fn parse_args(list: &str) -> Vec<Arg> {
    if list.trim().is_empty() {
        return Vec::new();
    }
    list.split(',')
        .map(str::trim)
        .map(|a| {
            if let Some(n) = a.strip_prefix('$').and_then(|n| n.parse().ok()) {
                Arg::Param(n)
            } else if a.eq_ignore_ascii_case("null") {
                Arg::Literal(None)
            } else {
                Arg::Literal(Some(unquote(a)))
            }
        })
        .collect()
}

/// `name(a, b)` or `name` into the name and the text between the parens.
fn name_and_parens(text: &str) -> HeronResult<(String, String)> {
    let text = text.trim();
    match text.find('(') {
        Some(open) => {
            let close = open + matching_paren(&text[open..])?;
            Ok((text[..open].trim().to_string(), text[open + 1..close].to_string()))
        }
        None => Ok((text.to_string(), String::new())),
    }
}

fn parse_node(text: &str) -> HeronResult<StatementNode> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let w = |i: usize| words.get(i).map(|s| s.to_ascii_uppercase()).unwrap_or_default();
    let arg = |i: usize| -> HeronResult<String> {
        words
            .get(i)
            .map(|s| s.to_string())
            .ok_or_else(|| HeronError::Parse(format!("unexpected end of statement: {text}")))
    };
    let upper = text.to_ascii_uppercase();

    let node = match w(0).as_str() {
        "SELECT" => StatementNode::Dml(DmlNode::new(DmlKind::Select, text)),
        "INSERT" => StatementNode::Dml(DmlNode::new(DmlKind::Insert, text)),
        "UPDATE" => StatementNode::Dml(DmlNode::new(DmlKind::Update, text)),
        "DELETE" => StatementNode::Dml(DmlNode::new(DmlKind::Delete, text)),
        "CREATE" | "DROP" | "ALTER" => StatementNode::Ddl(DdlNode {
            verb: format!("{} {}", w(0), w(1)),
            sql: text.to_string(),
        }),
        "BEGIN" | "START" => StatementNode::Session(SessionNode::Begin {
            read_only: upper.contains("READ ONLY"),
        }),
        "COMMIT" | "END" => StatementNode::Session(SessionNode::Commit),
        "ROLLBACK" | "ABORT" => StatementNode::Session(SessionNode::Rollback),
        "SET" if w(1) == "TRANSACTION" => StatementNode::Session(SessionNode::SetTransaction {
            read_only: upper.contains("READ ONLY"),
        }),
        "SET" => {
            let rest = text[3..].trim();
            let (name, value) = rest
                .split_once('=')
                .or_else(|| split_kw(rest, " TO "))
                .ok_or_else(|| HeronError::Parse(format!("bad SET: {text}")))?;
            StatementNode::Session(SessionNode::Set {
                name: name.trim().to_string(),
                value: unquote(value),
            })
        }
        "RESET" => StatementNode::Session(SessionNode::Reset {
            name: if w(1) == "ALL" { None } else { Some(arg(1)?) },
        }),
        "SHOW" => StatementNode::Session(SessionNode::Show { name: arg(1)? }),
        "DISCARD" => StatementNode::Session(SessionNode::DiscardAll),
        "PREPARE" => {
            let (head, body) = split_kw(text, " AS ").ok_or_else(|| HeronError::Parse("PREPARE needs AS".into()))?;
            let (name, types) = name_and_parens(&head[7..])?;
            let param_types = if types.trim().is_empty() {
                Vec::new()
            } else {
                types.split(',').map(column_type).collect::<HeronResult<_>>()?
            };
            StatementNode::Prepare {
                name,
                param_types,
                statement: Box::new(parse_statement(body.trim())?),
            }
        }
        "EXECUTE" => {
            let (name, args) = name_and_parens(&text[7..])?;
            StatementNode::Execute {
                name,
                args: parse_args(&args),
            }
        }
        "DEALLOCATE" => StatementNode::Deallocate {
            name: if w(1) == "ALL" { None } else { Some(arg(1)?) },
        },
        "DECLARE" => {
            let (_, query) = split_kw(text, " FOR ").ok_or_else(|| HeronError::Parse("DECLARE needs FOR".into()))?;
            StatementNode::DeclareCursor {
                name: arg(1)?,
                query: Box::new(parse_statement(query.trim())?),
            }
        }
        "FETCH" => {
            let mut rest: Vec<&str> = words[1..].to_vec();
            rest.retain(|w| !w.eq_ignore_ascii_case("FROM") && !w.eq_ignore_ascii_case("IN"));
            let (count, name) = match rest.as_slice() {
                [name] => (FetchCount::Count(1), name.to_string()),
                [count, name] if count.eq_ignore_ascii_case("ALL") => (FetchCount::All, name.to_string()),
                [count, name] => (
                    FetchCount::Count(count.parse().map_err(|_| HeronError::Parse(format!("bad FETCH count {count}")))?),
                    name.to_string(),
                ),
                _ => return Err(HeronError::Parse(format!("bad FETCH: {text}"))),
            };
            StatementNode::Fetch { name, count }
        }
        "CLOSE" => StatementNode::CloseCursor {
            name: if w(1) == "ALL" { None } else { Some(arg(1)?) },
        },
        "COPY" => StatementNode::Copy(parse_copy(text[4..].trim())?),
        "INTERRUPT" | "DISCONNECT" => {
            let id: i32 = arg(2)?
                .parse()
                .map_err(|_| HeronError::Parse(format!("bad session id in {text}")))?;
            StatementNode::Admin(if w(0) == "INTERRUPT" {
                AdminNode::InterruptSession(id)
            } else {
                AdminNode::DisconnectSession(id)
            })
        }
        "SHUTDOWN" => StatementNode::Admin(AdminNode::Shutdown),
        "EXPLAIN" => {
            let verbose = w(1) == "VERBOSE";
            let skip = if verbose { 2 } else { 1 };
            let inner = words[skip..].join(" ");
            match parse_node(&inner)? {
                StatementNode::Dml(statement) => StatementNode::Explain { verbose, statement },
                _ => return Err(HeronError::Parse("EXPLAIN needs a query".into())),
            }
        }
        "CALL" => {
            let (routine, args) = name_and_parens(&text[4..])?;
            StatementNode::Call(CallNode {
                routine,
                args: parse_args(&args),
            })
        }
        _ => {
            return Err(HeronError::Parse(format!(
                "syntax error at or near \"{}\"",
                words.first().copied().unwrap_or_default()
            )))
        }
    };
    Ok(node)
}

fn parse_copy(body: &str) -> HeronResult<CopyNode> {
    let (relation, rest) = if body.starts_with('(') {
        let close = matching_paren(body)?;
        let query = body[1..close].trim();
        (
            CopyRelation::Query(DmlNode::new(DmlKind::Select, query)),
            &body[close + 1..],
        )
    } else {
        let end = body
            .find(|c: char| c.is_whitespace() || c == '(')
            .unwrap_or(body.len());
        let name = body[..end].to_string();
        let mut rest = body[end..].trim_start();
        let mut columns = Vec::new();
        if rest.starts_with('(') {
            let close = matching_paren(rest)?;
            columns = rest[1..close].split(',').map(|c| c.trim().to_string()).collect();
            rest = &rest[close + 1..];
        }
        (CopyRelation::Table { name, columns }, rest)
    };

    let rest = rest.trim();
    let (dir_word, rest) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let direction = match dir_word.to_ascii_uppercase().as_str() {
        "FROM" => CopyDirection::From,
        "TO" => CopyDirection::To,
        other => return Err(HeronError::Parse(format!("expected FROM or TO, got {other}"))),
    };
    let rest = rest.trim();
    let (target, rest) = if rest.starts_with('\'') {
        let close = rest[1..]
            .find('\'')
            .ok_or_else(|| HeronError::Parse("unterminated file name".into()))?;
        (&rest[..close + 2], &rest[close + 2..])
    } else {
        rest.split_once(char::is_whitespace).unwrap_or((rest, ""))
    };
    let file = match target.to_ascii_uppercase().as_str() {
        "STDIN" | "STDOUT" => None,
        _ => Some(unquote(target)),
    };

    let mut options = CopyOptions::default();
    if let Some(open) = rest.find('(') {
        let close = open + matching_paren(&rest[open..])?;
        for item in rest[open + 1..close].split(',') {
            let item = item.trim();
            let (key, value) = item.split_once(char::is_whitespace).unwrap_or((item, "true"));
            let value = unquote(value);
            match key.to_ascii_uppercase().as_str() {
                "FORMAT" => {
                    options.format = Some(match value.to_ascii_lowercase().as_str() {
                        "csv" => CopyFormatKind::Csv,
                        "text" => CopyFormatKind::Text,
                        other => return Err(CompileError::Unsupported(format!("COPY format {other}")).into()),
                    })
                }
                "HEADER" => options.header = Some(matches!(value.to_ascii_lowercase().as_str(), "true" | "on" | "1")),
                "DELIMITER" => options.delimiter = Some(value),
                "QUOTE" => options.quote = Some(value),
                "ESCAPE" => options.escape = Some(value),
                "NULL" => options.null = Some(value),
                other => return Err(HeronError::Parse(format!("unknown COPY option {other}"))),
            }
        }
    }

    Ok(CopyNode {
        relation,
        direction,
        file,
        options,
    })
}

// ── compiler and plans ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Const(Datum),
    Param(usize),
    DivByZero,
}

impl Expr {
    fn eval(&self, bindings: &[Datum]) -> HeronResult<Datum> {
        match self {
            Expr::Const(d) => Ok(d.clone()),
            Expr::Param(n) => bindings
                .get(n - 1)
                .cloned()
                .ok_or_else(|| HeronError::internal(format!("no binding for ${n}"))),
            Expr::DivByZero => Err(ExecutionError::DivisionByZero.into()),
        }
    }
}

#[derive(Debug)]
enum Source {
    Values(Vec<Expr>),
    Scan {
        table: String,
        projection: Vec<usize>,
        filter: Option<(usize, Expr)>,
    },
    Insert {
        table: String,
        rows: Vec<Vec<Expr>>,
    },
    Update {
        table: String,
        set: (usize, Expr),
        filter: Option<(usize, Expr)>,
    },
    Delete {
        table: String,
        filter: Option<(usize, Expr)>,
    },
}

#[derive(Debug)]
pub struct FakePlan {
    store: Shared,
    source: Source,
    label: String,
}

fn matches(row: &Row, filter: &Option<(usize, Datum)>) -> bool {
    match filter {
        None => true,
        Some((col, value)) => row.get(*col) == Some(value),
    }
}

impl OperatorPlan for FakePlan {
    fn cursor(&self, request: &CursorRequest<'_>) -> HeronResult<Box<dyn Cursor>> {
        let b = request.bindings;
        let eval_filter = |f: &Option<(usize, Expr)>| -> HeronResult<Option<(usize, Datum)>> {
            f.as_ref().map(|(c, e)| Ok((*c, e.eval(b)?))).transpose()
        };
        let mut store = self.store.lock();
        let (rows, fail) = match &self.source {
            Source::Values(exprs) => {
                let mut values = Vec::new();
                let mut fail = false;
                for e in exprs {
                    match e {
                        Expr::DivByZero => fail = true,
                        _ => values.push(e.eval(b)?),
                    }
                }
                if fail {
                    (Vec::new(), true)
                } else {
                    (vec![Row::new(values)], false)
                }
            }
            Source::Scan {
                table,
                projection,
                filter,
            } => {
                let filter = eval_filter(filter)?;
                let rows = store
                    .table(table)?
                    .rows
                    .iter()
                    .filter(|r| matches(r, &filter))
                    .map(|r| Row::new(projection.iter().map(|&i| r.get(i).cloned().unwrap_or(Datum::Null)).collect()))
                    .collect();
                (rows, false)
            }
            Source::Insert { table, rows } => {
                let width = store.table(table)?.columns.len();
                let mut new_rows = Vec::with_capacity(rows.len());
                for exprs in rows {
                    let mut values = exprs.iter().map(|e| e.eval(b)).collect::<HeronResult<Vec<_>>>()?;
                    values.resize(width, Datum::Null);
                    new_rows.push(Row::new(values));
                }
                store.touch(request.txn, table);
                let n = new_rows.len();
                if let Some(t) = store.tables.get_mut(table) {
                    t.rows.extend(new_rows);
                }
                (vec![Row::new(Vec::new()); n], false)
            }
            Source::Update { table, set, filter } => {
                let filter = eval_filter(filter)?;
                let value = set.1.eval(b)?;
                store.table(table)?;
                store.touch(request.txn, table);
                let mut n = 0;
                if let Some(t) = store.tables.get_mut(table) {
                    for row in t.rows.iter_mut().filter(|r| matches(r, &filter)) {
                        row.values[set.0] = value.clone();
                        n += 1;
                    }
                }
                (vec![Row::new(Vec::new()); n], false)
            }
            Source::Delete { table, filter } => {
                let filter = eval_filter(filter)?;
                store.table(table)?;
                store.touch(request.txn, table);
                let mut n = 0;
                if let Some(t) = store.tables.get_mut(table) {
                    let before = t.rows.len();
                    t.rows.retain(|r| !matches(r, &filter));
                    n = before - t.rows.len();
                }
                (vec![Row::new(Vec::new()); n], false)
            }
        };
        Ok(Box::new(FakeCursor {
            store: self.store.clone(),
            rows: rows.into(),
            fail,
            open: false,
        }))
    }

    fn explain(&self, verbose: bool) -> Vec<String> {
        let mut lines = vec![self.label.clone()];
        if verbose {
            lines.push(format!("  Source: {:?}", self.source));
        }
        lines
    }
}

pub struct FakeCursor {
    store: Shared,
    rows: VecDeque<Row>,
    /// Raise division by zero once the rows run out.
    fail: bool,
    open: bool,
}

impl Cursor for FakeCursor {
    fn open(&mut self) -> HeronResult<()> {
        self.open = true;
        self.store.lock().open_cursors += 1;
        Ok(())
    }

    fn next(&mut self) -> HeronResult<Option<Row>> {
        match self.rows.pop_front() {
            Some(row) => Ok(Some(row)),
            None if self.fail => Err(ExecutionError::DivisionByZero.into()),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> HeronResult<()> {
        if std::mem::take(&mut self.open) {
            self.store.lock().open_cursors -= 1;
        }
        Ok(())
    }
}

pub struct FakeCompiler {
    store: Shared,
}

struct Binder<'a> {
    declared: &'a [Option<DataType>],
    inferred: Vec<Option<DataType>>,
}

impl Binder<'_> {
    fn expr(&mut self, text: &str, ty: DataType) -> HeronResult<Expr> {
        let text = text.trim();
        if let Some(n) = text.strip_prefix('$').and_then(|n| n.parse::<usize>().ok()) {
            if n == 0 {
                return Err(HeronError::Parse("there is no parameter $0".into()));
            }
            if self.inferred.len() < n {
                self.inferred.resize(n, None);
            }
            self.inferred[n - 1].get_or_insert(ty);
            return Ok(Expr::Param(n));
        }
        if text.replace(' ', "").ends_with("/0") {
            return Ok(Expr::DivByZero);
        }
        Ok(Expr::Const(literal(text, ty)?))
    }

    fn param_types(&self, count: usize) -> Vec<DataType> {
        (0..count)
            .map(|i| {
                self.declared
                    .get(i)
                    .copied()
                    .flatten()
                    .or_else(|| self.inferred.get(i).copied().flatten())
                    .unwrap_or(DataType::Text)
            })
            .collect()
    }
}

fn column_index(table: &Table, name: &str) -> HeronResult<usize> {
    table
        .columns
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| CompileError::UnknownColumn(name.trim().to_string()).into())
}

fn where_clause(binder: &mut Binder<'_>, table: &Table, text: Option<&str>) -> HeronResult<Option<(usize, Expr)>> {
    let Some(text) = text else {
        return Ok(None);
    };
    let (col, value) = text
        .split_once('=')
        .ok_or_else(|| CompileError::Unsupported(format!("WHERE {text}")))?;
    let idx = column_index(table, col)?;
    let expr = binder.expr(value, table.columns[idx].data_type())?;
    Ok(Some((idx, expr)))
}

impl QueryCompiler for FakeCompiler {
    fn compile(&self, request: &CompileRequest<'_>) -> HeronResult<CompiledQuery> {
        let sql = request.node.sql.trim();
        let mut binder = Binder {
            declared: request.param_types,
            inferred: Vec::new(),
        };
        let store = self.store.lock();

        let (source, columns, label) = match request.node.kind {
            DmlKind::Select => match split_kw(sql, " FROM ") {
                None => {
                    let list = sql[6..].trim();
                    let mut exprs = Vec::new();
                    let mut columns = Vec::new();
                    for item in list.split(',') {
                        let item = item.trim();
                        let ty = if item.starts_with('\'') || item.starts_with('$') {
                            DataType::Text
                        } else {
                            DataType::Int64
                        };
                        exprs.push(binder.expr(item, ty)?);
                        columns.push(ResultColumn::new("?column?", ty));
                    }
                    (Source::Values(exprs), columns, "Result".to_string())
                }
                Some((head, tail)) => {
                    let (table_name, filter) = match split_kw(tail, " WHERE ") {
                        Some((t, f)) => (t.trim(), Some(f)),
                        None => (tail.trim(), None),
                    };
                    let table = store.table(table_name)?;
                    let list = head.trim()[6..].trim();
                    let projection: Vec<usize> = if list == "*" {
                        (0..table.columns.len()).collect()
                    } else {
                        list.split(',').map(|c| column_index(table, c)).collect::<HeronResult<_>>()?
                    };
                    let columns: Vec<ResultColumn> = projection.iter().map(|&i| table.columns[i].clone()).collect();
                    let filter = where_clause(&mut binder, table, filter)?;
                    (
                        Source::Scan {
                            table: table_name.to_string(),
                            projection,
                            filter,
                        },
                        columns,
                        format!("Seq Scan on {table_name}"),
                    )
                }
            },
            DmlKind::Insert => {
                let (head, values) =
                    split_kw(sql, " VALUES ").ok_or_else(|| HeronError::Parse("INSERT needs VALUES".into()))?;
                let table_name = head.split_whitespace().nth(2).unwrap_or_default();
                let table = store.table(table_name)?;
                let mut rows = Vec::new();
                let mut rest = values.trim();
                while let Some(open) = rest.find('(') {
                    let close = open + matching_paren(&rest[open..])?;
                    let mut exprs = Vec::new();
                    for (i, v) in rest[open + 1..close].split(',').enumerate() {
                        let ty = table
                            .columns
                            .get(i)
                            .map(|c| c.data_type())
                            .ok_or_else(|| CompileError::Semantic("INSERT has more expressions than target columns".into()))?;
                        exprs.push(binder.expr(v, ty)?);
                    }
                    rows.push(exprs);
                    rest = &rest[close + 1..];
                }
                (
                    Source::Insert {
                        table: table_name.to_string(),
                        rows,
                    },
                    Vec::new(),
                    format!("Insert on {table_name}"),
                )
            }
            DmlKind::Update => {
                let table_name = sql.split_whitespace().nth(1).unwrap_or_default();
                let table = store.table(table_name)?;
                let (_, assignment) =
                    split_kw(sql, " SET ").ok_or_else(|| HeronError::Parse("UPDATE needs SET".into()))?;
                let (assignment, filter) = match split_kw(assignment, " WHERE ") {
                    Some((a, f)) => (a, Some(f)),
                    None => (assignment, None),
                };
                let (col, value) = assignment
                    .split_once('=')
                    .ok_or_else(|| HeronError::Parse("bad SET clause".into()))?;
                let idx = column_index(table, col)?;
                let set = (idx, binder.expr(value, table.columns[idx].data_type())?);
                let filter = where_clause(&mut binder, table, filter)?;
                (
                    Source::Update {
                        table: table_name.to_string(),
                        set,
                        filter,
                    },
                    Vec::new(),
                    format!("Update on {table_name}"),
                )
            }
            DmlKind::Delete => {
                let table_name = sql.split_whitespace().nth(2).unwrap_or_default();
                let table = store.table(table_name)?;
                let filter = split_kw(sql, " WHERE ").map(|(_, f)| f);
                let filter = where_clause(&mut binder, table, filter)?;
                (
                    Source::Delete {
                        table: table_name.to_string(),
                        filter,
                    },
                    Vec::new(),
                    format!("Delete on {table_name}"),
                )
            }
        };
        drop(store);

        let param_types = binder.param_types(request.param_count);
        self.store.lock().compiles += 1;
        Ok(CompiledQuery {
            plan: Arc::new(FakePlan {
                store: self.store.clone(),
                source,
                label,
            }),
            columns,
            param_types,
            cost_estimate: Some(1.0),
        })
    }
}

// ── transactions, DDL, routines, bulk load ───────────────────────────────

pub struct FakeTransactions {
    store: Shared,
}

impl TransactionService for FakeTransactions {
    fn begin(&self, read_only: bool) -> HeronResult<TxnHandle> {
        let mut store = self.store.lock();
        store.next_txn += 1;
        let id = store.next_txn;
        store.txn_log.push(format!("BEGIN {id}"));
        Ok(TxnHandle { id, read_only })
    }

    fn commit(&self, txn: TxnHandle) -> HeronResult<()> {
        let mut store = self.store.lock();
        store.undo.remove(&txn.id);
        store.txn_log.push(format!("COMMIT {}", txn.id));
        Ok(())
    }

    fn rollback(&self, txn: TxnHandle) -> HeronResult<()> {
        let mut store = self.store.lock();
        if let Some(images) = store.undo.remove(&txn.id) {
            for (name, image) in images {
                match image {
                    Some(table) => {
                        store.tables.insert(name, table);
                    }
                    None => {
                        store.tables.remove(&name);
                    }
                }
            }
        }
        store.txn_log.push(format!("ROLLBACK {}", txn.id));
        Ok(())
    }
}

pub struct FakeDdl {
    store: Shared,
}

impl DdlExecutor for FakeDdl {
    fn execute(&self, node: &DdlNode) -> HeronResult<()> {
        let words: Vec<&str> = node.sql.split_whitespace().collect();
        let name = words.get(2).map(|n| n.split('(').next().unwrap_or_default().to_string()).unwrap_or_default();
        let mut store = self.store.lock();
        match node.verb.as_str() {
            "CREATE TABLE" => {
                if store.tables.contains_key(&name) {
                    return Err(CompileError::Semantic(format!("relation \"{name}\" already exists")).into());
                }
                let open = node.sql.find('(').ok_or_else(|| HeronError::Parse("column list expected".into()))?;
                let close = open + matching_paren(&node.sql[open..])?;
                let mut columns = Vec::new();
                for def in node.sql[open + 1..close].split(',') {
                    let mut parts = def.split_whitespace();
                    let col = parts.next().unwrap_or_default();
                    let ty = column_type(parts.next().unwrap_or("text"))?;
                    columns.push(ResultColumn::new(col, ty));
                }
                store.tables.insert(name, Table { columns, rows: Vec::new() });
            }
            "DROP TABLE" => {
                store
                    .tables
                    .remove(&name)
                    .ok_or(CompileError::UnknownTable(name))?;
            }
            "ALTER TABLE" => {
                // ALTER TABLE t ADD [COLUMN] c type
                let rest: Vec<&str> = words[3..]
                    .iter()
                    .copied()
                    .filter(|w| !w.eq_ignore_ascii_case("ADD") && !w.eq_ignore_ascii_case("COLUMN"))
                    .collect();
                let (col, ty) = match rest.as_slice() {
                    [col, ty] => (col.to_string(), column_type(ty)?),
                    _ => return Err(CompileError::Unsupported(node.sql.clone()).into()),
                };
                let table = store
                    .tables
                    .get_mut(&name)
                    .ok_or_else(|| CompileError::UnknownTable(name.clone()))?;
                table.columns.push(ResultColumn::new(col, ty));
                for row in &mut table.rows {
                    row.values.push(Datum::Null);
                }
            }
            other => return Err(CompileError::Unsupported(other.to_string()).into()),
        }
        Ok(())
    }
}

/// Pushes 1..=n.
struct Series;

impl DirectRoutine for Series {
    fn invoke(&self, args: &[Datum], _txn: Option<TxnHandle>, sink: &mut dyn RowSink) -> HeronResult<()> {
        let n = args.first().and_then(Datum::as_i64).unwrap_or(0);
        for i in 1..=n {
            sink.push(Row::new(vec![Datum::Int64(i), Datum::Text(format!("row {i}"))]))?;
        }
        Ok(())
    }
}

/// A routine with a bug in it.
struct Explode;

impl DirectRoutine for Explode {
    fn invoke(&self, _args: &[Datum], _txn: Option<TxnHandle>, _sink: &mut dyn RowSink) -> HeronResult<()> {
        panic!("routine bug");
    }
}

/// Plan-bodied 1..=$1.
#[derive(Debug)]
struct SeriesPlan {
    store: Shared,
}

impl OperatorPlan for SeriesPlan {
    fn cursor(&self, request: &CursorRequest<'_>) -> HeronResult<Box<dyn Cursor>> {
        let n = request.bindings.first().and_then(Datum::as_i64).unwrap_or(0);
        Ok(Box::new(FakeCursor {
            store: self.store.clone(),
            rows: (1..=n).map(|i| Row::new(vec![Datum::Int64(i)])).collect(),
            fail: false,
            open: false,
        }))
    }

    fn explain(&self, _verbose: bool) -> Vec<String> {
        vec!["Function Scan on plan_series".into()]
    }
}

pub struct FakeRoutines {
    store: Shared,
}

impl RoutineCatalog for FakeRoutines {
    fn resolve(&self, name: &str, arg_count: usize) -> HeronResult<RoutineDef> {
        let pair_columns = vec![
            ResultColumn::new("n", DataType::Int64),
            ResultColumn::new("label", DataType::Text),
        ];
        let def = match (name, arg_count) {
            ("series", 1) => RoutineDef {
                name: name.into(),
                param_types: vec![DataType::Int64],
                result_columns: pair_columns,
                read_only: true,
                streaming: false,
                body: RoutineBody::Direct(Arc::new(Series)),
            },
            ("untyped_series", 1) => RoutineDef {
                name: name.into(),
                param_types: vec![DataType::Int64],
                result_columns: Vec::new(),
                read_only: true,
                streaming: false,
                body: RoutineBody::Direct(Arc::new(Series)),
            },
            ("stream_series", 1) => RoutineDef {
                name: name.into(),
                param_types: vec![DataType::Int64],
                result_columns: pair_columns,
                read_only: true,
                streaming: true,
                body: RoutineBody::Direct(Arc::new(Series)),
            },
            ("plan_series", 1) => RoutineDef {
                name: name.into(),
                param_types: vec![DataType::Int64],
                result_columns: vec![ResultColumn::new("n", DataType::Int64)],
                read_only: true,
                streaming: false,
                body: RoutineBody::Plan(Arc::new(SeriesPlan {
                    store: self.store.clone(),
                })),
            },
            ("explode", 0) => RoutineDef {
                name: name.into(),
                param_types: Vec::new(),
                result_columns: pair_columns,
                read_only: false,
                streaming: false,
                body: RoutineBody::Direct(Arc::new(Explode)),
            },
            _ => return Err(CompileError::UnknownRoutine(name.to_string()).into()),
        };
        Ok(def)
    }
}

pub struct FakeLoader {
    store: Shared,
}

impl FakeLoader {
    fn target_columns(table: &Table, target: &CopyTarget) -> HeronResult<Vec<usize>> {
        if target.columns.is_empty() {
            return Ok((0..table.columns.len()).collect());
        }
        target.columns.iter().map(|c| column_index(table, c)).collect()
    }
}

impl BulkLoader for FakeLoader {
    fn describe_target(&self, target: &CopyTarget) -> HeronResult<Vec<ResultColumn>> {
        let store = self.store.lock();
        let table = store.table(&target.table)?;
        Ok(Self::target_columns(table, target)?
            .into_iter()
            .map(|i| table.columns[i].clone())
            .collect())
    }

    fn load(
        &self,
        target: &CopyTarget,
        format: &CsvFormat,
        input: &mut dyn Read,
        txn: Option<TxnHandle>,
    ) -> HeronResult<u64> {
        let (indexes, types, width) = {
            let store = self.store.lock();
            let table = store.table(&target.table)?;
            let indexes = Self::target_columns(table, target)?;
            let types: Vec<DataType> = indexes.iter().map(|&i| table.columns[i].data_type()).collect();
            (indexes, types, table.columns.len())
        };

        let mut reader = CsvReader::new(format, BufReader::new(input));
        let mut rows = Vec::new();
        while let Some(fields) = reader.next_record()? {
            if fields.len() != indexes.len() {
                return Err(ExecutionError::BadCopyFormat(format!(
                    "line {}: expected {} fields, got {}",
                    reader.line(),
                    indexes.len(),
                    fields.len()
                ))
                .into());
            }
            let mut values = vec![Datum::Null; width];
            for ((field, &idx), &ty) in fields.into_iter().zip(&indexes).zip(&types) {
                if let Some(text) = field {
                    values[idx] = Datum::from_pg_text(&text, ty)
                        .map_err(|e| ExecutionError::InvalidTextRepresentation(format!("line {}: {e}", reader.line())))?;
                }
            }
            rows.push(Row::new(values));
        }

        let mut store = self.store.lock();
        store.touch(txn, &target.table);
        let n = rows.len() as u64;
        if let Some(table) = store.tables.get_mut(&target.table) {
            table.rows.extend(rows);
        }
        Ok(n)
    }
}

pub fn fake_backend(store: &Shared) -> Backend {
    Backend {
        parser: Arc::new(FakeParser),
        compiler: Arc::new(FakeCompiler { store: store.clone() }),
        transactions: Arc::new(FakeTransactions { store: store.clone() }),
        ddl: Arc::new(FakeDdl { store: store.clone() }),
        routines: Arc::new(FakeRoutines { store: store.clone() }),
        bulk_loader: Arc::new(FakeLoader { store: store.clone() }),
    }
}

// ── scripted client ──────────────────────────────────────────────────────

/// Replays pre-encoded client bytes and captures everything the server writes.
pub struct ScriptStream {
    input: IoCursor<Vec<u8>>,
    output: Arc<Mutex<Vec<u8>>>,
}

impl Read for ScriptStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for ScriptStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn encode_all(messages: &[FrontendMessage]) -> Vec<u8> {
    let mut out = Vec::new();
    for m in messages {
        out.extend_from_slice(&codec::encode_frontend(m));
    }
    out
}

pub fn decode_all(bytes: &[u8]) -> Vec<BackendMessage> {
    let mut buf = BytesMut::from(bytes);
    let mut out = Vec::new();
    while let Some(msg) = codec::decode_backend(&mut buf).expect("server output decodes") {
        out.push(msg);
    }
    assert!(buf.is_empty(), "trailing partial message: {buf:?}");
    out
}

pub fn startup() -> FrontendMessage {
    let mut params = HashMap::new();
    params.insert("user".to_string(), "tester".to_string());
    params.insert("database".to_string(), "testdb".to_string());
    FrontendMessage::Startup {
        version: PROTOCOL_VERSION_3,
        params,
    }
}

pub struct TestServer {
    pub context: Arc<ServerContext>,
    pub store: Shared,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_config(HeronConfig::default())
    }

    pub fn with_config(config: HeronConfig) -> Self {
        let store: Shared = Arc::new(Mutex::new(Store::default()));
        let context = Arc::new(ServerContext::new(config, fake_backend(&store)));
        Self { context, store }
    }

    /// Run one connection over raw client bytes.
    pub fn run_bytes(&self, input: Vec<u8>) -> (HeronResult<()>, Vec<u8>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let stream = ScriptStream {
            input: IoCursor::new(input),
            output: output.clone(),
        };
        let result = PgConnection::new(stream, self.context.clone()).run();
        let bytes = std::mem::take(&mut *output.lock());
        (result, bytes)
    }

    /// Startup, `script`, Terminate. Returns what followed the startup
    /// ReadyForQuery.
    pub fn session(&self, script: Vec<FrontendMessage>) -> Replies {
        let mut messages = vec![startup()];
        messages.extend(script);
        messages.push(FrontendMessage::Terminate);
        let (result, bytes) = self.run_bytes(encode_all(&messages));
        result.expect("connection ends cleanly");
        let all = decode_all(&bytes);
        let ready = all
            .iter()
            .position(|m| matches!(m, BackendMessage::ReadyForQuery { .. }))
            .expect("startup ReadyForQuery");
        Replies(all[ready + 1..].to_vec())
    }

    /// One session running `sqls` as separate simple queries.
    pub fn simple(&self, sqls: &[&str]) -> Replies {
        self.session(sqls.iter().map(|s| query(s)).collect())
    }

    pub fn setup(&self, sql: &str) {
        let replies = self.simple(&[sql]);
        assert!(replies.errors().is_empty(), "setup failed: {:?}", replies.0);
    }
}

/// Backend messages of one session, with lookup helpers.
#[derive(Debug, Clone)]
pub struct Replies(pub Vec<BackendMessage>);

impl Replies {
    /// One type byte per message, e.g. `"TDDCZ"`.
    pub fn codes(&self) -> String {
        self.0
            .iter()
            .map(|m| codec::encode_message(m)[0] as char)
            .collect()
    }

    pub fn tags(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|m| match m {
                BackendMessage::CommandComplete { tag } => Some(tag.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn rows(&self) -> Vec<Vec<Option<String>>> {
        self.0
            .iter()
            .filter_map(|m| match m {
                BackendMessage::DataRow { values } => Some(
                    values
                        .iter()
                        .map(|v| v.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()))
                        .collect(),
                ),
                _ => None,
            })
            .collect()
    }

    /// First column of every DataRow.
    pub fn column(&self) -> Vec<String> {
        self.rows()
            .into_iter()
            .map(|r| r.into_iter().next().flatten().unwrap_or_default())
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|m| match m {
                BackendMessage::ErrorResponse { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|m| match m {
                BackendMessage::ErrorResponse { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn notices(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|m| match m {
                BackendMessage::NoticeResponse { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Transaction status byte of every ReadyForQuery.
    pub fn statuses(&self) -> String {
        self.0
            .iter()
            .filter_map(|m| match m {
                BackendMessage::ReadyForQuery { txn_status } => Some(*txn_status as char),
                _ => None,
            })
            .collect()
    }

    pub fn copy_text(&self) -> String {
        self.0
            .iter()
            .filter_map(|m| match m {
                BackendMessage::CopyData(data) => Some(String::from_utf8_lossy(data).into_owned()),
                _ => None,
            })
            .collect()
    }
}

// ── frontend message shorthands ──────────────────────────────────────────

pub fn query(sql: &str) -> FrontendMessage {
    FrontendMessage::Query(sql.to_string())
}

pub fn parse(name: &str, sql: &str, param_types: &[i32]) -> FrontendMessage {
    FrontendMessage::Parse {
        name: name.to_string(),
        query: sql.to_string(),
        param_types: param_types.to_vec(),
    }
}

/// Bind with text parameters and text results.
pub fn bind(portal: &str, statement: &str, params: &[Option<&str>]) -> FrontendMessage {
    bind_formats(portal, statement, params, &[])
}

pub fn bind_formats(portal: &str, statement: &str, params: &[Option<&str>], result_formats: &[i16]) -> FrontendMessage {
    FrontendMessage::Bind {
        portal: portal.to_string(),
        statement: statement.to_string(),
        param_formats: Vec::new(),
        param_values: params.iter().map(|p| p.map(|s| s.as_bytes().to_vec())).collect(),
        result_formats: result_formats.to_vec(),
    }
}

pub fn execute(portal: &str, max_rows: i32) -> FrontendMessage {
    FrontendMessage::Execute {
        portal: portal.to_string(),
        max_rows,
    }
}

pub fn describe_statement(name: &str) -> FrontendMessage {
    FrontendMessage::Describe {
        kind: b'S',
        name: name.to_string(),
    }
}

pub fn describe_portal(name: &str) -> FrontendMessage {
    FrontendMessage::Describe {
        kind: b'P',
        name: name.to_string(),
    }
}

pub fn close_portal(name: &str) -> FrontendMessage {
    FrontendMessage::Close {
        kind: b'P',
        name: name.to_string(),
    }
}

pub fn sync() -> FrontendMessage {
    FrontendMessage::Sync
}

pub fn copy_data(text: &str) -> FrontendMessage {
    FrontendMessage::CopyData(text.as_bytes().to_vec())
}

pub fn copy_done() -> FrontendMessage {
    FrontendMessage::CopyDone
}

pub fn copy_fail(reason: &str) -> FrontendMessage {
    FrontendMessage::CopyFail(reason.to_string())
}

/// A server with `items (id int, name text)` holding `n` rows.
pub fn server_with_items(n: i64) -> TestServer {
    let server = TestServer::new();
    server.setup("CREATE TABLE items (id int, name text)");
    if n > 0 {
        let values: Vec<String> = (1..=n).map(|i| format!("({i}, 'item{i}')")).collect();
        server.setup(&format!("INSERT INTO items VALUES {}", values.join(", ")));
    }
    server
}
