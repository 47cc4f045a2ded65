use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRoom {
        id: Ulid,
        name: String,
        capacity: u32,
        status: RoomStatus,
    },
    UpdateRoom {
        id: Ulid,
        name: Option<String>,
        capacity: Option<u32>,
        status: Option<RoomStatus>,
    },
    InsertBooking {
        id: Ulid,
        room_id: Ulid,
        requester_id: Ulid,
        start: Ms,
        end: Ms,
        attendees: u32,
        title: String,
        purpose: String,
    },
    /// `UPDATE bookings SET status = 'CANCELLED' WHERE id = .. AND actor_id = ..`
    CancelBooking {
        id: Ulid,
        actor_id: Ulid,
    },
    /// `UPDATE bookings SET title = .., purpose = .. WHERE id = .. AND actor_id = ..`
    UpdateBooking {
        id: Ulid,
        actor_id: Ulid,
        title: Option<String>,
        purpose: Option<String>,
    },
    SelectRooms,
    SelectBookings {
        room_id: Option<Ulid>,
        requester_id: Option<Ulid>,
    },
    /// `SELECT * FROM availability WHERE room_id = .. AND start = ..` —
    /// without an `"end"` filter the deployment slot width applies.
    SelectAvailability {
        room_id: Ulid,
        start: Ms,
        end: Option<Ms>,
    },
    Listen {
        channel: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.to_uppercase().starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Query(query) => parse_select(query),
        // Reservations are never removed — cancellation is an UPDATE.
        Statement::Delete(_) => Err(SqlError::Unsupported(
            "DELETE; cancel bookings with UPDATE bookings SET status = 'CANCELLED'".into(),
        )),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "rooms" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("rooms", 3, values.len()));
            }
            let status = if values.len() >= 4 {
                parse_room_status(&values[3])?
            } else {
                RoomStatus::Active
            };
            Ok(Command::InsertRoom {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                capacity: parse_u32(&values[2])?,
                status,
            })
        }
        "bookings" => {
            if values.len() < 8 {
                return Err(SqlError::WrongArity("bookings", 8, values.len()));
            }
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                room_id: parse_ulid(&values[1])?,
                requester_id: parse_ulid(&values[2])?,
                start: parse_i64(&values[3])?,
                end: parse_i64(&values[4])?,
                attendees: parse_u32(&values[5])?,
                title: parse_string(&values[6])?,
                purpose: parse_string(&values[7])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;

    match table.as_str() {
        "rooms" => {
            let id = extract_where_ulid(selection, "id")?
                .ok_or(SqlError::MissingFilter("id"))?;
            let (mut name, mut capacity, mut status) = (None, None, None);
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "name" => name = Some(parse_string(&a.value)?),
                    "capacity" => capacity = Some(parse_u32(&a.value)?),
                    "status" => status = Some(parse_room_status(&a.value)?),
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }
            if name.is_none() && capacity.is_none() && status.is_none() {
                return Err(SqlError::Parse("UPDATE with no assignments".into()));
            }
            Ok(Command::UpdateRoom { id, name, capacity, status })
        }
        "bookings" => {
            let id = extract_where_ulid(selection, "id")?
                .ok_or(SqlError::MissingFilter("id"))?;
            let actor_id = extract_where_ulid(selection, "actor_id")?
                .ok_or(SqlError::MissingFilter("actor_id"))?;

            let (mut title, mut purpose, mut cancel) = (None, None, false);
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "title" => title = Some(parse_string(&a.value)?),
                    "purpose" => purpose = Some(parse_string(&a.value)?),
                    "status" => {
                        let s = parse_string(&a.value)?;
                        if !s.eq_ignore_ascii_case("CANCELLED") {
                            return Err(SqlError::Unsupported(format!(
                                "status = '{s}'; the only settable status is CANCELLED"
                            )));
                        }
                        cancel = true;
                    }
                    col => return Err(SqlError::UnknownColumn(col.to_string())),
                }
            }

            if cancel {
                if title.is_some() || purpose.is_some() {
                    return Err(SqlError::Unsupported(
                        "mixing status = 'CANCELLED' with metadata assignments".into(),
                    ));
                }
                Ok(Command::CancelBooking { id, actor_id })
            } else if title.is_some() || purpose.is_some() {
                Ok(Command::UpdateBooking { id, actor_id, title, purpose })
            } else {
                Err(SqlError::Parse("UPDATE with no assignments".into()))
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "rooms" => Ok(Command::SelectRooms),
        "bookings" => Ok(Command::SelectBookings {
            room_id: extract_where_ulid(&select.selection, "room_id")?,
            requester_id: extract_where_ulid(&select.selection, "requester_id")?,
        }),
        "availability" => {
            let (mut room_id, mut start, mut end) = (None, None, None);
            if let Some(selection) = &select.selection {
                extract_availability_filters(selection, &mut room_id, &mut start, &mut end)?;
            }
            Ok(Command::SelectAvailability {
                room_id: room_id.ok_or(SqlError::MissingFilter("room_id"))?,
                start: start.ok_or(SqlError::MissingFilter("start"))?,
                end,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn extract_availability_filters(
    expr: &Expr,
    room_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_availability_filters(left, room_id, start, end)?;
                extract_availability_filters(right, room_id, start, end)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("room_id") {
                    *room_id = Some(parse_ulid_expr(right)?);
                } else if col.as_deref() == Some("start") {
                    *start = Some(parse_i64_expr(right)?);
                } else if col.as_deref() == Some("end") {
                    *end = Some(parse_i64_expr(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
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

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            if values.rows.len() > 1 {
                return Err(SqlError::Unsupported("multi-row INSERT".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

/// Walk a WHERE clause of AND'ed equality filters, returning the ULID
/// bound to `column` if present.
fn extract_where_ulid(selection: &Option<Expr>, column: &str) -> Result<Option<Ulid>, SqlError> {
    fn walk(expr: &Expr, column: &str, found: &mut Option<Ulid>) -> Result<(), SqlError> {
        if let Expr::BinaryOp { left, op, right } = expr {
            match op {
                ast::BinaryOperator::And => {
                    walk(left, column, found)?;
                    walk(right, column, found)?;
                }
                ast::BinaryOperator::Eq => {
                    if expr_column_name(left).as_deref() == Some(column) {
                        *found = Some(parse_ulid_expr(right)?);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    let mut found = None;
    if let Some(sel) = selection {
        walk(sel, column, &mut found)?;
    }
    Ok(found)
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_expr(expr)
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    parse_i64_expr(expr)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_room_status(expr: &Expr) -> Result<RoomStatus, SqlError> {
    let s = parse_string(expr)?;
    RoomStatus::parse(&s).ok_or_else(|| SqlError::Parse(format!("bad room status: {s}")))
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
    MissingFilter(&'static str),
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
