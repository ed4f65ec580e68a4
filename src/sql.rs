use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::Ms;
use crate::timefmt::{parse_timestamp, parse_window_end, parse_window_start};

/// Parsed command from SQL input.
///
/// `Option<Option<_>>` on update commands separates "column not in SET"
/// (outer `None`) from "SET column = NULL" (inner `None`).
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        username: String,
    },
    UpdateUser {
        id: Ulid,
        username: Option<String>,
        mobile: Option<Option<String>>,
        address: Option<Option<String>>,
    },
    InsertResource {
        id: Ulid,
        name: String,
        kind: String,
    },
    UpdateResource {
        id: Ulid,
        name: Option<String>,
        kind: Option<String>,
    },
    InsertEvent {
        id: Ulid,
        user_id: Ulid,
        title: String,
        start: Ms,
        end: Ms,
        description: Option<String>,
    },
    UpdateEvent {
        id: Ulid,
        user_id: Ulid,
        title: Option<String>,
        start: Option<Ms>,
        end: Option<Ms>,
        description: Option<Option<String>>,
    },
    DeleteEvent {
        id: Ulid,
        user_id: Ulid,
    },
    InsertAllocation {
        id: Ulid,
        event_id: Ulid,
        resource_id: Ulid,
        user_id: Option<Ulid>,
    },
    DeleteAllocation {
        id: Ulid,
        user_id: Option<Ulid>,
    },
    SelectUsers,
    SelectResources,
    SelectEvents {
        user_id: Option<Ulid>,
    },
    SelectAllocations {
        resource_id: Option<Ulid>,
        event_id: Option<Ulid>,
    },
    SelectConflicts {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude_event_id: Option<Ulid>,
    },
    SelectUtilization {
        start: Option<Ms>,
        end: Option<Ms>,
    },
}

/// Parse a single statement. Extended-protocol queries go through here.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let mut cmds = parse_batch(sql)?;
    if cmds.len() > 1 {
        return Err(SqlError::Unsupported(
            "multiple statements in one prepared query".into(),
        ));
    }
    Ok(cmds.remove(0))
}

/// Parse every `;`-separated statement of a simple query, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "users" => {
            let row = insert_fields(insert, "users", &["id", "username"], 2)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.require("id")?)?,
                username: parse_text(row.require("username")?)?,
            })
        }
        "resources" => {
            let row = insert_fields(insert, "resources", &["id", "name", "type"], 3)?;
            Ok(Command::InsertResource {
                id: parse_ulid(row.require("id")?)?,
                name: parse_text(row.require("name")?)?,
                kind: parse_text(row.require("type")?)?,
            })
        }
        "events" => {
            let row = insert_fields(
                insert,
                "events",
                &["id", "user_id", "title", "start", "end", "description"],
                5,
            )?;
            Ok(Command::InsertEvent {
                id: parse_ulid(row.require("id")?)?,
                user_id: parse_ulid(row.require("user_id")?)?,
                title: parse_text(row.require("title")?)?,
                start: parse_ts(row.require("start")?)?,
                end: parse_ts(row.require("end")?)?,
                description: row.get("description").map(parse_text_or_null).transpose()?.flatten(),
            })
        }
        "allocations" => {
            let row = insert_fields(
                insert,
                "allocations",
                &["id", "event_id", "resource_id", "user_id"],
                3,
            )?;
            Ok(Command::InsertAllocation {
                id: parse_ulid(row.require("id")?)?,
                event_id: parse_ulid(row.require("event_id")?)?,
                resource_id: parse_ulid(row.require("resource_id")?)?,
                user_id: row.get("user_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let set = assignment_fields(assignments)?;
    let filter = where_fields(selection)?;

    match table.as_str() {
        "users" => {
            set.only(&["username", "mobile", "address"])?;
            filter.only(&["id"])?;
            Ok(Command::UpdateUser {
                id: parse_ulid(filter.require("id")?)?,
                username: set.get("username").map(parse_text).transpose()?,
                mobile: set.get("mobile").map(parse_text_or_null).transpose()?,
                address: set.get("address").map(parse_text_or_null).transpose()?,
            })
        }
        "resources" => {
            set.only(&["name", "type"])?;
            filter.only(&["id"])?;
            Ok(Command::UpdateResource {
                id: parse_ulid(filter.require("id")?)?,
                name: set.get("name").map(parse_text).transpose()?,
                kind: set.get("type").map(parse_text).transpose()?,
            })
        }
        "events" => {
            set.only(&["title", "start", "end", "description"])?;
            filter.only(&["id", "user_id"])?;
            Ok(Command::UpdateEvent {
                id: parse_ulid(filter.require("id")?)?,
                user_id: parse_ulid(filter.require("user_id")?)?,
                title: set.get("title").map(parse_text).transpose()?,
                start: set.get("start").map(parse_ts).transpose()?,
                end: set.get("end").map(parse_ts).transpose()?,
                description: set.get("description").map(parse_text_or_null).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filter = where_fields(delete.selection.as_ref())?;

    match table.as_str() {
        "events" => {
            filter.only(&["id", "user_id"])?;
            Ok(Command::DeleteEvent {
                id: parse_ulid(filter.require("id")?)?,
                user_id: parse_ulid(filter.require("user_id")?)?,
            })
        }
        "allocations" => {
            filter.only(&["id", "user_id"])?;
            Ok(Command::DeleteAllocation {
                id: parse_ulid(filter.require("id")?)?,
                user_id: filter.get("user_id").map(parse_ulid).transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filter = where_fields(select.selection.as_ref())?;

    match table.as_str() {
        "users" => {
            filter.only(&[])?;
            Ok(Command::SelectUsers)
        }
        "resources" => {
            filter.only(&[])?;
            Ok(Command::SelectResources)
        }
        "events" => {
            filter.only(&["user_id"])?;
            Ok(Command::SelectEvents {
                user_id: filter.get("user_id").map(parse_ulid).transpose()?,
            })
        }
        "allocations" => {
            filter.only(&["resource_id", "event_id"])?;
            Ok(Command::SelectAllocations {
                resource_id: filter.get("resource_id").map(parse_ulid).transpose()?,
                event_id: filter.get("event_id").map(parse_ulid).transpose()?,
            })
        }
        "conflicts" => {
            filter.only(&["resource_id", "start", "end", "exclude_event_id"])?;
            Ok(Command::SelectConflicts {
                resource_id: parse_ulid(filter.require("resource_id")?)?,
                start: parse_ts(filter.require("start")?)?,
                end: parse_ts(filter.require("end")?)?,
                exclude_event_id: filter.get("exclude_event_id").map(parse_ulid).transpose()?,
            })
        }
        "utilization" => {
            filter.only(&["start", "end"])?;
            Ok(Command::SelectUtilization {
                start: filter
                    .get("start")
                    .map(|e| with_string(e, parse_window_start))
                    .transpose()?,
                end: filter
                    .get("end")
                    .map(|e| with_string(e, parse_window_end))
                    .transpose()?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Column/value pairs ────────────────────────────────────────

/// Column name to expression, from an INSERT row, a SET list or a WHERE
/// conjunction of equalities.
struct Fields<'a>(Vec<(String, &'a Expr)>);

impl<'a> Fields<'a> {
    fn get(&self, col: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
    }

    fn require(&self, col: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(col).ok_or(SqlError::MissingColumn(col))
    }

    fn only(&self, allowed: &[&str]) -> Result<(), SqlError> {
        match self.0.iter().find(|(c, _)| !allowed.contains(&c.as_str())) {
            Some((c, _)) => Err(SqlError::UnknownColumn(c.clone())),
            None => Ok(()),
        }
    }
}

/// Map a single-row INSERT onto column names. Without an explicit column
/// list the values are taken positionally from `columns`, and only the
/// first `required` of them must be present.
fn insert_fields<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    columns: &[&str],
    required: usize,
) -> Result<Fields<'a>, SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    let row = match values.rows.as_slice() {
        [] => return Err(SqlError::Parse("empty VALUES".into())),
        [row] => row,
        _ => return Err(SqlError::Unsupported("multi-row INSERT".into())),
    };

    let names: Vec<String> = if insert.columns.is_empty() {
        if row.len() < required || row.len() > columns.len() {
            return Err(SqlError::WrongArity(table, required, row.len()));
        }
        columns[..row.len()].iter().map(|c| c.to_string()).collect()
    } else {
        if insert.columns.len() != row.len() {
            return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
        }
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };

    let fields = Fields(names.into_iter().zip(row.iter()).collect());
    fields.only(columns)?;
    Ok(fields)
}

fn assignment_fields(assignments: &[ast::Assignment]) -> Result<Fields<'_>, SqlError> {
    if assignments.is_empty() {
        return Err(SqlError::Parse("empty SET".into()));
    }
    let mut pairs = Vec::with_capacity(assignments.len());
    for a in assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let col = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        pairs.push((col, &a.value));
    }
    Ok(Fields(pairs))
}

fn where_fields(selection: Option<&Expr>) -> Result<Fields<'_>, SqlError> {
    let mut pairs = Vec::new();
    if let Some(expr) = selection {
        collect_equalities(expr, &mut pairs)?;
    }
    Ok(Fields(pairs))
}

/// Flatten `a = x AND b = y AND ...`; anything else is rejected.
fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            if out.iter().any(|(c, _)| *c == col) {
                return Err(SqlError::Unsupported(format!("repeated filter on {col}")));
            }
            out.push((col, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID '{s}': {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn with_string<E>(expr: &Expr, parse: impl Fn(&str) -> Result<Ms, E>) -> Result<Ms, SqlError> {
    let s = parse_text(expr)?;
    parse(&s).map_err(|_| SqlError::InvalidTimestamp(s))
}

fn parse_ts(expr: &Expr) -> Result<Ms, SqlError> {
    with_string(expr, parse_timestamp)
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    InvalidTimestamp(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::InvalidTimestamp(s) => {
                write!(f, "invalid timestamp '{s}': expected YYYY-MM-DDTHH:MM")
            }
        }
    }
}

impl std::error::Error for SqlError {}
