//! The generator chain: AST node in, executable statement out.
//!
//! Generation runs in two phases. A fixed, ordered list of matchers is
//! tried against the node; the first one that recognises its shape returns
//! a [`StatementStub`]. [`finish_generating`] then does whatever compilation
//! the stub still needs, once the parameter types are known. Nodes no
//! matcher claims go to the default DML path and the query compiler.

use std::sync::Arc;

use heron_common::error::{CompileError, HeronError, HeronResult};
use heron_common::types::DataType;

use crate::ast::{
    Arg, CallNode, CopyDirection, CopyNode, CopyRelation, DmlKind, DmlNode, FetchCount,
    ParsedStatement, StatementNode,
};
use crate::backend::{CompileRequest, CompiledQuery, CopyTarget};
use crate::outputter::csv::CsvFormat;
use crate::server::ServerContext;
use crate::session::PgSession;
use crate::statement::{is_stale, PgStatement, StatementKind};
use crate::statements::{
    AdminStatement, CallStatement, CloseCursorStatement, CopyFromStatement, CopyToStatement,
    DdlStatement, DeallocateStatement, DeclareCursorStatement, DmlStatement, EmptyStatement,
    ExecuteStatement, ExplainStatement, FetchStatement, PrepareStatement, SessionStatement,
};

/// A statement recognised by a matcher but not yet compiled.
#[derive(Debug)]
pub enum StatementStub {
    /// Needs no further compilation.
    Ready(Arc<dyn PgStatement>),
    Dml(DmlNode),
    Explain {
        verbose: bool,
        node: DmlNode,
    },
    Call(CallNode),
    CopyFrom(CopyNode),
    CopyTo(CopyNode),
    Prepare {
        name: String,
        param_types: Vec<DataType>,
        statement: ParsedStatement,
    },
    Declare {
        name: String,
        query: ParsedStatement,
    },
    Execute {
        name: String,
        args: Vec<Arg>,
    },
    Fetch {
        name: String,
        count: FetchCount,
    },
}

type Matcher = fn(&ParsedStatement) -> Option<StatementStub>;

/// Matchers in evaluation order.
const GENERATORS: &[(&str, Matcher)] = &[
    ("ddl", match_ddl),
    ("cursor", match_cursor),
    ("copy", match_copy),
    ("session", match_session),
    ("admin", match_admin),
    ("explain", match_explain),
    ("call", match_call),
];

fn ready(stmt: impl PgStatement + 'static) -> Option<StatementStub> {
    Some(StatementStub::Ready(Arc::new(stmt)))
}

fn match_ddl(parsed: &ParsedStatement) -> Option<StatementStub> {
    match &parsed.node {
        StatementNode::Ddl(node) => ready(DdlStatement::new(node.clone())),
        _ => None,
    }
}

fn match_cursor(parsed: &ParsedStatement) -> Option<StatementStub> {
    match &parsed.node {
        StatementNode::Prepare {
            name,
            param_types,
            statement,
        } => Some(StatementStub::Prepare {
            name: name.clone(),
            param_types: param_types.clone(),
            statement: (**statement).clone(),
        }),
        StatementNode::Execute { name, args } => Some(StatementStub::Execute {
            name: name.clone(),
            args: args.clone(),
        }),
        StatementNode::Deallocate { name } => ready(DeallocateStatement::new(name.clone())),
        StatementNode::DeclareCursor { name, query } => Some(StatementStub::Declare {
            name: name.clone(),
            query: (**query).clone(),
        }),
        StatementNode::Fetch { name, count } => Some(StatementStub::Fetch {
            name: name.clone(),
            count: *count,
        }),
        StatementNode::CloseCursor { name } => ready(CloseCursorStatement::new(name.clone())),
        _ => None,
    }
}

fn match_copy(parsed: &ParsedStatement) -> Option<StatementStub> {
    match &parsed.node {
        StatementNode::Copy(node) => Some(match node.direction {
            CopyDirection::From => StatementStub::CopyFrom(node.clone()),
            CopyDirection::To => StatementStub::CopyTo(node.clone()),
        }),
        _ => None,
    }
}

fn match_session(parsed: &ParsedStatement) -> Option<StatementStub> {
    match &parsed.node {
        StatementNode::Session(node) => ready(SessionStatement::new(node.clone())),
        _ => None,
    }
}

fn match_admin(parsed: &ParsedStatement) -> Option<StatementStub> {
    match &parsed.node {
        StatementNode::Admin(node) => ready(AdminStatement::new(node.clone())),
        _ => None,
    }
}

fn match_explain(parsed: &ParsedStatement) -> Option<StatementStub> {
    match &parsed.node {
        StatementNode::Explain { verbose, statement } => Some(StatementStub::Explain {
            verbose: *verbose,
            node: statement.clone(),
        }),
        _ => None,
    }
}

fn match_call(parsed: &ParsedStatement) -> Option<StatementStub> {
    match &parsed.node {
        StatementNode::Call(node) => Some(StatementStub::Call(node.clone())),
        _ => None,
    }
}

/// Fallback when no matcher claims the node.
fn default_stub(parsed: &ParsedStatement) -> HeronResult<StatementStub> {
    match &parsed.node {
        StatementNode::Dml(node) => Ok(StatementStub::Dml(node.clone())),
        StatementNode::Empty => Ok(StatementStub::Ready(Arc::new(EmptyStatement))),
        other => Err(HeronError::unsupported(format!(
            "no generator for {} statements",
            other.describe()
        ))),
    }
}

/// First phase: pick the stub for `parsed`.
pub fn stub_for(parsed: &ParsedStatement) -> HeronResult<StatementStub> {
    for (name, matcher) in GENERATORS {
        if let Some(stub) = matcher(parsed) {
            tracing::trace!("generator '{}' matched {}", name, parsed.node.describe());
            return Ok(stub);
        }
    }
    default_stub(parsed)
}

/// Generate an executable statement for `parsed`. `param_types` holds the
/// client-declared type of each `$n` (`None` where unspecified);
/// `generation` is the schema generation read before compiling.
pub fn generate(
    server: &ServerContext,
    session: &mut PgSession,
    parsed: &ParsedStatement,
    param_types: &[Option<DataType>],
    generation: u64,
) -> HeronResult<Arc<dyn PgStatement>> {
    let stub = stub_for(parsed)?;
    finish_generating(stub, server, session, parsed.param_count, param_types, generation)
}

fn compile(
    server: &ServerContext,
    node: &DmlNode,
    param_count: usize,
    param_types: &[Option<DataType>],
) -> HeronResult<CompiledQuery> {
    server.backend.compiler.compile(&CompileRequest {
        node,
        param_types,
        param_count,
    })
}

/// Second phase: semantic compilation of a stub.
pub fn finish_generating(
    stub: StatementStub,
    server: &ServerContext,
    session: &mut PgSession,
    param_count: usize,
    param_types: &[Option<DataType>],
    generation: u64,
) -> HeronResult<Arc<dyn PgStatement>> {
    let stmt: Arc<dyn PgStatement> = match stub {
        StatementStub::Ready(stmt) => stmt,
        StatementStub::Dml(node) => {
            let compiled = compile(server, &node, param_count, param_types)?;
            Arc::new(DmlStatement::new(node.kind, node.sql, compiled, generation))
        }
        StatementStub::Explain { verbose, node } => {
            let compiled = compile(server, &node, param_count, param_types)?;
            Arc::new(ExplainStatement::new(compiled, verbose, generation))
        }
        StatementStub::Call(node) => {
            let routine = server.backend.routines.resolve(&node.routine, node.args.len())?;
            Arc::new(CallStatement::new(routine, node.args))
        }
        StatementStub::CopyFrom(node) => {
            let target = match node.relation {
                CopyRelation::Table { name, columns } => CopyTarget { table: name, columns },
                CopyRelation::Query(_) => {
                    return Err(CompileError::Semantic("COPY FROM requires a table, not a query".into()).into())
                }
            };
            let format = CsvFormat::from_options(&node.options, &server.config.copy)?;
            let columns = server.backend.bulk_loader.describe_target(&target)?;
            Arc::new(CopyFromStatement::new(target, node.file, format, columns))
        }
        StatementStub::CopyTo(node) => {
            let format = CsvFormat::from_options(&node.options, &server.config.copy)?;
            let query = match node.relation {
                CopyRelation::Table { name, columns } => {
                    let list = if columns.is_empty() {
                        "*".to_string()
                    } else {
                        columns.join(", ")
                    };
                    DmlNode::new(DmlKind::Select, format!("SELECT {list} FROM {name}"))
                }
                CopyRelation::Query(query) => query,
            };
            let compiled = compile(server, &query, param_count, param_types)?;
            Arc::new(CopyToStatement::new(compiled, node.file, format, generation))
        }
        StatementStub::Prepare {
            name,
            param_types: declared,
            statement,
        } => {
            let oids: Vec<i32> = declared.iter().map(|t| t.pg_oid()).collect();
            let inner = server.generate(session, &statement, &oids)?;
            Arc::new(PrepareStatement::new(name, statement.sql, oids, inner))
        }
        StatementStub::Declare { name, query } => {
            let inner = server.generate(session, &query, &[])?;
            if !matches!(inner.kind(), StatementKind::Dml(DmlKind::Select)) {
                return Err(CompileError::Semantic(format!(
                    "cursor \"{name}\" must be declared for a SELECT query"
                ))
                .into());
            }
            Arc::new(DeclareCursorStatement::new(name, inner))
        }
        StatementStub::Execute { name, args } => {
            let inner = revalidate(server, session, &name)?;
            Arc::new(ExecuteStatement::new(args, inner))
        }
        StatementStub::Fetch { name, count } => {
            let portal = session
                .portals
                .get(&name)
                .ok_or_else(|| CompileError::UnknownCursor(name.clone()))?;
            let columns = portal.statement.result_columns().to_vec();
            Arc::new(FetchStatement::new(name, count, columns))
        }
    };
    Ok(stmt)
}

/// Look up a prepared statement, regenerating it first if the schema moved
/// on since it was prepared.
pub fn revalidate(
    server: &ServerContext,
    session: &mut PgSession,
    name: &str,
) -> HeronResult<Arc<dyn PgStatement>> {
    let prepared = session
        .prepared
        .get(name)
        .ok_or_else(|| CompileError::UnknownPreparedStatement(name.to_string()))?;
    if !is_stale(prepared.statement.as_ref(), server.current_generation()) {
        return Ok(prepared.statement.clone());
    }

    let sql = prepared.sql.clone();
    let param_oids = prepared.param_oids.clone();
    tracing::debug!("session {}: regenerating stale prepared statement '{}'", session.id, name);

    let mut parsed = server.backend.parser.parse(&sql)?;
    if parsed.len() != 1 {
        return Err(HeronError::internal(format!(
            "prepared statement '{name}' no longer parses to a single statement"
        )));
    }
    let parsed = parsed.remove(0);
    let stmt = server.generate(session, &parsed, &param_oids)?;
    if let Some(entry) = session.prepared.get_mut(name) {
        entry.statement = stmt.clone();
    }
    Ok(stmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AdminNode, DdlNode, SessionNode};

    fn parsed(node: StatementNode) -> ParsedStatement {
        ParsedStatement::new(node, "sql", 0)
    }

    #[test]
    fn test_first_match_wins() {
        let stub = stub_for(&parsed(StatementNode::Ddl(DdlNode {
            verb: "CREATE TABLE".into(),
            sql: "CREATE TABLE t (a int)".into(),
        })))
        .unwrap();
        match stub {
            StatementStub::Ready(stmt) => assert_eq!(stmt.kind(), StatementKind::Ddl),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_dml_falls_through_to_default() {
        let stub = stub_for(&parsed(StatementNode::Dml(DmlNode::new(DmlKind::Select, "SELECT 1")))).unwrap();
        assert!(matches!(stub, StatementStub::Dml(_)));
    }

    #[test]
    fn test_stubs_needing_compilation() {
        let explain = stub_for(&parsed(StatementNode::Explain {
            verbose: true,
            statement: DmlNode::new(DmlKind::Select, "SELECT 1"),
        }))
        .unwrap();
        assert!(matches!(explain, StatementStub::Explain { verbose: true, .. }));

        let fetch = stub_for(&parsed(StatementNode::Fetch {
            name: "c".into(),
            count: FetchCount::All,
        }))
        .unwrap();
        assert!(matches!(fetch, StatementStub::Fetch { .. }));
    }

    #[test]
    fn test_ready_statements_carry_modes() {
        let stub = stub_for(&parsed(StatementNode::Session(SessionNode::Rollback))).unwrap();
        let StatementStub::Ready(stmt) = stub else {
            panic!("session verbs need no compilation");
        };
        assert_eq!(
            stmt.transaction_aborted_mode(),
            crate::statement::TransactionAbortedMode::Allowed
        );

        let stub = stub_for(&parsed(StatementNode::Admin(AdminNode::Shutdown))).unwrap();
        let StatementStub::Ready(stmt) = stub else {
            panic!("admin statements need no compilation");
        };
        assert_eq!(
            stmt.transaction_mode(),
            crate::statement::TransactionMode::ImplicitCommit
        );

        let stub = stub_for(&parsed(StatementNode::Empty)).unwrap();
        let StatementStub::Ready(stmt) = stub else {
            panic!("empty statement");
        };
        assert_eq!(stmt.kind(), StatementKind::Empty);
    }
}
