use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        email: String,
        role: Role,
        display_name: String,
        password: String,
    },
    SetUserActive {
        user_id: Ulid,
        active: bool,
    },
    InsertTeacherProfile {
        id: Ulid,
        user_id: Ulid,
        display_name: String,
        bio: Option<String>,
        experience_years: u32,
    },
    UpdateTeacherProfile {
        profile_id: Ulid,
        display_name: Option<String>,
        bio: Option<String>,
        experience_years: Option<u32>,
        approved: Option<bool>,
    },
    InsertSlot {
        id: Ulid,
        teacher_id: Ulid,
        start: Ms,
        end: Ms,
    },
    DeleteSlot {
        id: Ulid,
    },
    InsertPackage {
        id: Ulid,
        student_id: Ulid,
        lessons_total: u32,
        expires_at: Ms,
    },
    InsertPayment {
        id: Ulid,
        package_id: Ulid,
        amount_cents: i64,
        currency: String,
        external_reference: Option<String>,
    },
    SetPaymentStatus {
        payment_id: Ulid,
        status: PaymentStatus,
    },
    InsertHold {
        id: Ulid,
        slot_id: Ulid,
        package_id: Ulid,
    },
    ConfirmBooking {
        booking_id: Ulid,
    },
    CancelBooking {
        booking_id: Ulid,
        reason: Option<String>,
    },
    RescheduleBooking {
        booking_id: Ulid,
        new_booking_id: Ulid,
        new_slot_id: Ulid,
    },
    UpdateLesson {
        lesson_id: Ulid,
        status: Option<LessonStatus>,
        topic: Option<String>,
        notes: Option<String>,
    },
    RunJob {
        job: Job,
    },
    Select {
        view: View,
        filters: Filters,
    },
}

/// Maintenance jobs an admin can trigger through `INSERT INTO jobs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    ExpireHolds,
    ExpirePackages,
    ProcessOutbox,
}

impl Job {
    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "expire_holds" => Some(Job::ExpireHolds),
            "expire_packages" => Some(Job::ExpirePackages),
            "process_outbox" => Some(Job::ProcessOutbox),
            _ => None,
        }
    }
}

/// Read models exposed as tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Users,
    OpenSlots,
    TeacherProfiles,
    Bookings,
    Lessons,
    Packages,
    Notifications,
    Outbox,
    AuditLog,
    KpiOverview,
    OperationsOverview,
    DeliveryMetrics,
}

impl View {
    fn from_table(table: &str) -> Option<Self> {
        Some(match table {
            "users" => View::Users,
            "open_slots" => View::OpenSlots,
            "teacher_profiles" => View::TeacherProfiles,
            "bookings" => View::Bookings,
            "lessons" => View::Lessons,
            "packages" => View::Packages,
            "notifications" => View::Notifications,
            "outbox" => View::Outbox,
            "audit_log" => View::AuditLog,
            "kpi_overview" => View::KpiOverview,
            "operations_overview" => View::OperationsOverview,
            "delivery_metrics" => View::DeliveryMetrics,
            _ => return None,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            View::Users => "select_users",
            View::OpenSlots => "select_open_slots",
            View::TeacherProfiles => "select_teacher_profiles",
            View::Bookings => "select_bookings",
            View::Lessons => "select_lessons",
            View::Packages => "select_packages",
            View::Notifications => "select_notifications",
            View::Outbox => "select_outbox",
            View::AuditLog => "select_audit_log",
            View::KpiOverview => "select_kpi_overview",
            View::OperationsOverview => "select_operations_overview",
            View::DeliveryMetrics => "select_delivery_metrics",
        }
    }

    /// Equality filters the view accepts besides pagination.
    fn filter_columns(&self) -> &'static [&'static str] {
        match self {
            View::Users => &["id"],
            View::OpenSlots => &["teacher_id"],
            View::Bookings => &["id"],
            View::Lessons => &["booking_id"],
            View::Packages => &["student_id"],
            View::Outbox => &["aggregate_id"],
            _ => &[],
        }
    }
}

/// `WHERE` clause of a read-model query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub id: Option<Ulid>,
    pub teacher_id: Option<Ulid>,
    pub student_id: Option<Ulid>,
    pub booking_id: Option<Ulid>,
    pub aggregate_id: Option<Ulid>,
    pub page: PageRequest,
}

const USER_COLUMNS: &[&str] = &["id", "email", "role", "display_name", "password"];
const USER_STATUS_COLUMNS: &[&str] = &["user_id", "active"];
const PROFILE_COLUMNS: &[&str] = &["id", "user_id", "display_name", "bio", "experience_years"];
const PROFILE_UPDATE_COLUMNS: &[&str] = &["profile_id", "display_name", "bio", "experience_years", "approved"];
const SLOT_COLUMNS: &[&str] = &["id", "teacher_id", "start", "end"];
const PACKAGE_COLUMNS: &[&str] = &["id", "student_id", "lessons_total", "expires_at"];
const PAYMENT_COLUMNS: &[&str] = &["id", "package_id", "amount_cents", "currency", "external_reference"];
const PAYMENT_STATUS_COLUMNS: &[&str] = &["payment_id", "status"];
const HOLD_COLUMNS: &[&str] = &["id", "slot_id", "package_id"];
const CONFIRMATION_COLUMNS: &[&str] = &["booking_id"];
const CANCELLATION_COLUMNS: &[&str] = &["booking_id", "reason"];
const RESCHEDULE_COLUMNS: &[&str] = &["booking_id", "new_booking_id", "new_slot_id"];
const LESSON_UPDATE_COLUMNS: &[&str] = &["lesson_id", "status", "topic", "notes"];
const JOB_COLUMNS: &[&str] = &["name"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// The read model a SELECT targets, without evaluating its filters.
/// Used to describe result columns of prepared statements.
pub fn select_view(sql: &str) -> Option<View> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let table = table_factor_name(&select.from.first()?.relation).ok()?;
    View::from_table(&table)
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "users" => {
            let row = Row::new(insert, "users", USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: parse_ulid(row.required(0)?)?,
                email: parse_text(row.required(1)?)?,
                role: parse_label(row.required(2)?, "role", Role::parse)?,
                display_name: parse_text(row.required(3)?)?,
                password: parse_text(row.required(4)?)?,
            })
        }
        "user_status" => {
            let row = Row::new(insert, "user_status", USER_STATUS_COLUMNS)?;
            Ok(Command::SetUserActive {
                user_id: parse_ulid(row.required(0)?)?,
                active: parse_bool(row.required(1)?)?,
            })
        }
        "teacher_profiles" => {
            let row = Row::new(insert, "teacher_profiles", PROFILE_COLUMNS)?;
            Ok(Command::InsertTeacherProfile {
                id: parse_ulid(row.required(0)?)?,
                user_id: parse_ulid(row.required(1)?)?,
                display_name: parse_text(row.required(2)?)?,
                bio: row.optional(3).map(parse_text).transpose()?,
                experience_years: row.optional(4).map(parse_u32).transpose()?.unwrap_or(0),
            })
        }
        "teacher_profile_updates" => {
            let row = Row::new(insert, "teacher_profile_updates", PROFILE_UPDATE_COLUMNS)?;
            Ok(Command::UpdateTeacherProfile {
                profile_id: parse_ulid(row.required(0)?)?,
                display_name: row.optional(1).map(parse_text).transpose()?,
                bio: row.optional(2).map(parse_text).transpose()?,
                experience_years: row.optional(3).map(parse_u32).transpose()?,
                approved: row.optional(4).map(parse_bool).transpose()?,
            })
        }
        "slots" => {
            let row = Row::new(insert, "slots", SLOT_COLUMNS)?;
            Ok(Command::InsertSlot {
                id: parse_ulid(row.required(0)?)?,
                teacher_id: parse_ulid(row.required(1)?)?,
                start: parse_i64(row.required(2)?)?,
                end: parse_i64(row.required(3)?)?,
            })
        }
        "packages" => {
            let row = Row::new(insert, "packages", PACKAGE_COLUMNS)?;
            Ok(Command::InsertPackage {
                id: parse_ulid(row.required(0)?)?,
                student_id: parse_ulid(row.required(1)?)?,
                lessons_total: parse_u32(row.required(2)?)?,
                expires_at: parse_i64(row.required(3)?)?,
            })
        }
        "payments" => {
            let row = Row::new(insert, "payments", PAYMENT_COLUMNS)?;
            Ok(Command::InsertPayment {
                id: parse_ulid(row.required(0)?)?,
                package_id: parse_ulid(row.required(1)?)?,
                amount_cents: parse_i64(row.required(2)?)?,
                currency: parse_text(row.required(3)?)?,
                external_reference: row.optional(4).map(parse_text).transpose()?,
            })
        }
        "payment_status" => {
            let row = Row::new(insert, "payment_status", PAYMENT_STATUS_COLUMNS)?;
            Ok(Command::SetPaymentStatus {
                payment_id: parse_ulid(row.required(0)?)?,
                status: parse_label(row.required(1)?, "payment status", PaymentStatus::parse)?,
            })
        }
        "holds" => {
            let row = Row::new(insert, "holds", HOLD_COLUMNS)?;
            Ok(Command::InsertHold {
                id: parse_ulid(row.required(0)?)?,
                slot_id: parse_ulid(row.required(1)?)?,
                package_id: parse_ulid(row.required(2)?)?,
            })
        }
        "confirmations" => {
            let row = Row::new(insert, "confirmations", CONFIRMATION_COLUMNS)?;
            Ok(Command::ConfirmBooking {
                booking_id: parse_ulid(row.required(0)?)?,
            })
        }
        "cancellations" => {
            let row = Row::new(insert, "cancellations", CANCELLATION_COLUMNS)?;
            Ok(Command::CancelBooking {
                booking_id: parse_ulid(row.required(0)?)?,
                reason: row.optional(1).map(parse_text).transpose()?,
            })
        }
        "reschedules" => {
            let row = Row::new(insert, "reschedules", RESCHEDULE_COLUMNS)?;
            Ok(Command::RescheduleBooking {
                booking_id: parse_ulid(row.required(0)?)?,
                new_booking_id: parse_ulid(row.required(1)?)?,
                new_slot_id: parse_ulid(row.required(2)?)?,
            })
        }
        "lesson_updates" => {
            let row = Row::new(insert, "lesson_updates", LESSON_UPDATE_COLUMNS)?;
            Ok(Command::UpdateLesson {
                lesson_id: parse_ulid(row.required(0)?)?,
                status: row
                    .optional(1)
                    .map(|e| parse_label(e, "lesson status", LessonStatus::parse))
                    .transpose()?,
                topic: row.optional(2).map(parse_text).transpose()?,
                notes: row.optional(3).map(parse_text).transpose()?,
            })
        }
        "jobs" => {
            let row = Row::new(insert, "jobs", JOB_COLUMNS)?;
            Ok(Command::RunJob {
                job: parse_label(row.required(0)?, "job", Job::parse)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "slots" => Ok(Command::DeleteSlot { id }),
        "bookings" => Ok(Command::CancelBooking { booking_id: id, reason: None }),
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
    let view = View::from_table(&table).ok_or(SqlError::UnknownTable(table))?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(view, selection, &mut filters)?;
    }
    Ok(Command::Select { view, filters })
}

fn extract_filters(view: View, expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_filters(view, left, filters)?;
            extract_filters(view, right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            match col.as_str() {
                "page_limit" => filters.page.limit = parse_usize(right)?,
                "page_offset" => filters.page.offset = parse_usize(right)?,
                c if !view.filter_columns().contains(&c) => {
                    return Err(SqlError::UnknownColumn(view.label(), col.clone()));
                }
                "id" => filters.id = Some(parse_ulid(right)?),
                "teacher_id" => filters.teacher_id = Some(parse_ulid(right)?),
                "student_id" => filters.student_id = Some(parse_ulid(right)?),
                "booking_id" => filters.booking_id = Some(parse_ulid(right)?),
                "aggregate_id" => filters.aggregate_id = Some(parse_ulid(right)?),
                _ => return Err(SqlError::UnknownColumn(view.label(), col.clone())),
            }
            Ok(())
        }
        Expr::Nested(inner) => extract_filters(view, inner, filters),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── INSERT rows ───────────────────────────────────────────────

/// The single VALUES row of an INSERT, addressed by the table's column order.
/// With a column list, columns may come in any order and may be omitted.
struct Row<'a> {
    table: &'static str,
    columns: &'static [&'static str],
    values: Vec<Option<&'a Expr>>,
}

impl<'a> Row<'a> {
    fn new(insert: &'a ast::Insert, table: &'static str, columns: &'static [&'static str]) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() != 1 {
            return Err(SqlError::Unsupported(format!("{table}: one row per INSERT")));
        }
        let row = &rows[0];
        let mut values = vec![None; columns.len()];

        if insert.columns.is_empty() {
            if row.len() > columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            for (slot, expr) in values.iter_mut().zip(row) {
                *slot = Some(expr);
            }
        } else {
            if insert.columns.len() != row.len() {
                return Err(SqlError::WrongArity(table, insert.columns.len(), row.len()));
            }
            for (ident, expr) in insert.columns.iter().zip(row) {
                let name = ident.value.to_lowercase();
                let i = columns
                    .iter()
                    .position(|c| *c == name)
                    .ok_or(SqlError::UnknownColumn(table, name))?;
                values[i] = Some(expr);
            }
        }
        Ok(Self { table, columns, values })
    }

    fn required(&self, i: usize) -> Result<&'a Expr, SqlError> {
        self.optional(i).ok_or(SqlError::MissingValue(self.table, self.columns[i]))
    }

    /// `None` when the column was omitted or given as NULL.
    fn optional(&self, i: usize) -> Option<&'a Expr> {
        self.values[i].filter(|e| !matches!(extract_value(e), Some(Value::Null)))
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
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
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

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
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
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} is negative")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_label<T>(expr: &Expr, what: &'static str, parse: fn(&str) -> Option<T>) -> Result<T, SqlError> {
    let text = parse_text(expr)?;
    parse(&text).ok_or_else(|| SqlError::Parse(format!("unknown {what}: {text}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    WrongArity(&'static str, usize, usize),
    MissingValue(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected at most {expected} values, got {got}")
            }
            SqlError::MissingValue(t, c) => write!(f, "{t}: missing value for {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn id() -> Ulid {
        Ulid::from_string(ID).unwrap()
    }

    fn other() -> Ulid {
        Ulid::from_string(OTHER).unwrap()
    }

    #[test]
    fn parse_insert_user() {
        let sql = format!(
            "INSERT INTO users (id, email, role, display_name, password) \
             VALUES ('{ID}', 'a@b.io', 'STUDENT', 'Ann', ' spaced pass ')"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertUser {
                id: id(),
                email: "a@b.io".into(),
                role: Role::Student,
                display_name: "Ann".into(),
                password: " spaced pass ".into(),
            }
        );

        let missing = format!("INSERT INTO users (id, email, role, display_name) VALUES ('{ID}', 'a@b.io', 'STUDENT', 'Ann')");
        assert!(parse_sql(&missing).is_err());
    }

    #[test]
    fn named_columns_in_any_order() {
        let sql = format!("INSERT INTO holds (package_id, id, slot_id) VALUES ('{OTHER}', '{ID}', '{OTHER}')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertHold { id: id(), slot_id: other(), package_id: other() }
        );
    }

    #[test]
    fn positional_values_without_column_list() {
        let sql = format!(r#"INSERT INTO slots VALUES ('{ID}', '{OTHER}', 1000, 4600000)"#);
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertSlot { id: id(), teacher_id: other(), start: 1000, end: 4_600_000 }
        );
    }

    #[test]
    fn quoted_end_column() {
        let sql = format!(r#"INSERT INTO slots (id, teacher_id, start, "end") VALUES ('{ID}', '{OTHER}', 1000, 2000)"#);
        assert!(matches!(parse_sql(&sql).unwrap(), Command::InsertSlot { end: 2000, .. }));
    }

    #[test]
    fn optional_columns_omitted_or_null() {
        let sql = format!("INSERT INTO teacher_profiles (id, user_id, display_name) VALUES ('{ID}', '{OTHER}', 'Tess')");
        match parse_sql(&sql).unwrap() {
            Command::InsertTeacherProfile { bio, experience_years, .. } => {
                assert_eq!(bio, None);
                assert_eq!(experience_years, 0);
            }
            cmd => panic!("expected InsertTeacherProfile, got {cmd:?}"),
        }

        let sql = format!(
            "INSERT INTO teacher_profile_updates (profile_id, bio, approved) VALUES ('{ID}', NULL, true)"
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateTeacherProfile {
                profile_id: id(),
                display_name: None,
                bio: None,
                experience_years: None,
                approved: Some(true),
            }
        );
    }

    #[test]
    fn empty_string_is_a_value() {
        let sql = format!("INSERT INTO lesson_updates (lesson_id, notes) VALUES ('{ID}', '')");
        match parse_sql(&sql).unwrap() {
            Command::UpdateLesson { notes, status, .. } => {
                assert_eq!(notes.as_deref(), Some(""));
                assert_eq!(status, None);
            }
            cmd => panic!("expected UpdateLesson, got {cmd:?}"),
        }
    }

    #[test]
    fn missing_required_value() {
        let sql = format!("INSERT INTO payments (id, package_id, amount_cents) VALUES ('{ID}', '{OTHER}', 100)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingValue("payments", "currency"))));
    }

    #[test]
    fn unknown_column_rejected() {
        let sql = format!("INSERT INTO holds (id, slot, package_id) VALUES ('{ID}', '{OTHER}', '{OTHER}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("holds", _))));
    }

    #[test]
    fn multi_row_insert_rejected() {
        let sql = format!("INSERT INTO confirmations (booking_id) VALUES ('{ID}'), ('{OTHER}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_status_labels() {
        let sql = format!("INSERT INTO payment_status (payment_id, status) VALUES ('{ID}', 'Succeeded')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SetPaymentStatus { payment_id: id(), status: PaymentStatus::Succeeded }
        );
        let sql = format!("INSERT INTO payment_status (payment_id, status) VALUES ('{ID}', 'paid')");
        assert!(parse_sql(&sql).is_err());
    }

    #[test]
    fn parse_cancellation_forms() {
        let sql = format!("INSERT INTO cancellations (booking_id, reason) VALUES ('{ID}', 'ill')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::CancelBooking { booking_id: id(), reason: Some("ill".into()) }
        );
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::CancelBooking { booking_id: id(), reason: None });
    }

    #[test]
    fn parse_delete_slot() {
        let sql = format!("DELETE FROM slots WHERE id = '{ID}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteSlot { id: id() });
        assert!(parse_sql("DELETE FROM slots").is_err());
    }

    #[test]
    fn parse_jobs() {
        let sql = "INSERT INTO jobs (name) VALUES ('process_outbox')";
        assert_eq!(parse_sql(sql).unwrap(), Command::RunJob { job: Job::ProcessOutbox });
        assert!(parse_sql("INSERT INTO jobs (name) VALUES ('vacuum')").is_err());
    }

    #[test]
    fn parse_select_with_filters_and_page() {
        let sql = format!("SELECT * FROM open_slots WHERE teacher_id = '{ID}' AND page_limit = 10 AND page_offset = 20");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Select {
                view: View::OpenSlots,
                filters: Filters {
                    teacher_id: Some(id()),
                    page: PageRequest { limit: 10, offset: 20 },
                    ..Filters::default()
                },
            }
        );
    }

    #[test]
    fn select_defaults_to_first_page() {
        match parse_sql("SELECT * FROM audit_log").unwrap() {
            Command::Select { view, filters } => {
                assert_eq!(view, View::AuditLog);
                assert_eq!(filters.page, PageRequest::default());
            }
            cmd => panic!("expected Select, got {cmd:?}"),
        }
    }

    #[test]
    fn select_rejects_foreign_filter() {
        let sql = format!("SELECT * FROM bookings WHERE teacher_id = '{ID}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn(_, _))));
        assert!(matches!(parse_sql("SELECT * FROM slots"), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn select_view_ignores_placeholders() {
        assert_eq!(select_view("SELECT * FROM bookings WHERE id = $1"), Some(View::Bookings));
        assert_eq!(select_view("INSERT INTO jobs (name) VALUES ($1)"), None);
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
