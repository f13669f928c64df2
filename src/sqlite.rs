use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Core value types for SQLite operations
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl Value {
    /// Copies a borrowed SQLite value out of a row.
    ///
    /// Text that is not valid UTF-8 is kept as raw bytes in a [`Value::Blob`].
    pub fn from_ref(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Value::Text(text.to_owned()),
                Err(_) => Value::Blob(bytes.to_vec()),
            },
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Boolean(_) => "boolean",
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// One row of a table, keyed by logical attribute name.
///
/// Decoding helpers never coerce: an integer column holding text is an error,
/// not a parse.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Record {
    pub table: String,
    pub values: HashMap<String, Value>,
}

impl Record {
    /// Create an empty record for `table`
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            values: HashMap::new(),
        }
    }

    /// Add a named value
    pub fn with_value(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, attribute: &str) -> Result<&Value> {
        self.values
            .get(attribute)
            .ok_or_else(|| Error::UnknownAttribute {
                table: self.table.clone(),
                attribute: attribute.to_string(),
            })
    }

    pub fn integer(&self, attribute: &str) -> Result<i64> {
        match self.get(attribute)? {
            Value::Integer(i) => Ok(*i),
            _ => Err(self.mismatch(attribute, "an integer")),
        }
    }

    pub fn optional_integer(&self, attribute: &str) -> Result<Option<i64>> {
        match self.get(attribute)? {
            Value::Null => Ok(None),
            Value::Integer(i) => Ok(Some(*i)),
            _ => Err(self.mismatch(attribute, "an integer or null")),
        }
    }

    pub fn text(&self, attribute: &str) -> Result<String> {
        match self.get(attribute)? {
            Value::Text(s) => Ok(s.clone()),
            _ => Err(self.mismatch(attribute, "text")),
        }
    }

    /// Booleans come back from SQLite as 0/1 integers.
    pub fn boolean(&self, attribute: &str) -> Result<bool> {
        match self.get(attribute)? {
            Value::Boolean(b) => Ok(*b),
            Value::Integer(0) => Ok(false),
            Value::Integer(1) => Ok(true),
            _ => Err(self.mismatch(attribute, "a boolean")),
        }
    }

    fn mismatch(&self, attribute: &str, expected: &'static str) -> Error {
        let found = self.values.get(attribute).map_or("missing", Value::type_name);
        tracing::warn!(
            table = %self.table,
            attribute,
            found,
            "stored value has unexpected type"
        );
        Error::TypeMismatch {
            table: self.table.clone(),
            attribute: attribute.to_string(),
            expected,
        }
    }
}

/// Query operators for building advanced queries
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOperator {
    Equal(Value),
    NotEqual(Value),
    GreaterThan(Value),
    GreaterThanOrEqual(Value),
    LessThan(Value),
    LessThanOrEqual(Value),
    Like(String),
    In(Vec<Value>),
}

/// Query builder for composable, immutable queries.
///
/// Conditions are AND-ed together in insertion order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Query {
    pub conditions: Vec<(String, QueryOperator)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_condition(mut self, field: &str, op: QueryOperator) -> Self {
        self.conditions.push((field.to_string(), op));
        self
    }

    /// Shorthand for an exact-match condition.
    pub fn with_equal(self, field: &str, value: impl Into<Value>) -> Self {
        self.with_condition(field, QueryOperator::Equal(value.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Renders ` WHERE ...` (or nothing), pushing bound values onto `params`.
    fn render_where(&self, params: &mut Vec<Value>) -> String {
        if self.conditions.is_empty() {
            return String::new();
        }
        let clauses: Vec<String> = self
            .conditions
            .iter()
            .map(|(field, op)| render_condition(&quote(field), op, params))
            .collect();
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn render_condition(column: &str, op: &QueryOperator, params: &mut Vec<Value>) -> String {
    let mut bind = |value: &Value| {
        params.push(value.clone());
        format!("?{}", params.len())
    };
    match op {
        QueryOperator::Equal(Value::Null) => format!("{column} IS NULL"),
        QueryOperator::NotEqual(Value::Null) => format!("{column} IS NOT NULL"),
        QueryOperator::Equal(v) => format!("{column} = {}", bind(v)),
        QueryOperator::NotEqual(v) => format!("{column} <> {}", bind(v)),
        QueryOperator::GreaterThan(v) => format!("{column} > {}", bind(v)),
        QueryOperator::GreaterThanOrEqual(v) => format!("{column} >= {}", bind(v)),
        QueryOperator::LessThan(v) => format!("{column} < {}", bind(v)),
        QueryOperator::LessThanOrEqual(v) => format!("{column} <= {}", bind(v)),
        QueryOperator::Like(pattern) => {
            format!("{column} LIKE {}", bind(&Value::Text(pattern.clone())))
        }
        // An empty IN list matches nothing.
        QueryOperator::In(values) if values.is_empty() => "0".to_string(),
        QueryOperator::In(values) => {
            let placeholders: Vec<String> = values.iter().map(&mut bind).collect();
            format!("{column} IN ({})", placeholders.join(", "))
        }
    }
}

/// Quotes an SQL identifier.
pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// CRUD operation types.
///
/// Field names at this level are physical column names.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOperation {
    pub table: String,
    pub data: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOperation {
    pub table: String,
    pub query: Query,
    pub fields: Option<Vec<String>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub order_by: Option<Vec<(String, bool)>>, // (field, is_ascending)
}

impl ReadOperation {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            query: Query::new(),
            fields: None,
            limit: None,
            offset: None,
            order_by: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOperation {
    pub table: String,
    pub query: Query,
    pub updates: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOperation {
    pub table: String,
    pub query: Query,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CrudOperation {
    Create(CreateOperation),
    Read(ReadOperation),
    Update(UpdateOperation),
    Delete(DeleteOperation),
}

/// Result of [`execute_crud`].
#[derive(Debug, Clone, PartialEq)]
pub enum CrudOutcome {
    /// Rowid assigned to the inserted row.
    Inserted(i64),
    /// Rows read, keyed by physical column name.
    Rows(Vec<HashMap<String, Value>>),
    /// Number of rows touched by an update or delete.
    Affected(usize),
}

impl CrudOperation {
    pub fn table(&self) -> &str {
        match self {
            CrudOperation::Create(op) => &op.table,
            CrudOperation::Read(op) => &op.table,
            CrudOperation::Update(op) => &op.table,
            CrudOperation::Delete(op) => &op.table,
        }
    }

    /// Renders the statement and its positional parameters.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = match self {
            CrudOperation::Create(op) => {
                if op.data.is_empty() {
                    format!("INSERT INTO {} DEFAULT VALUES", quote(&op.table))
                } else {
                    let columns: Vec<String> = op.data.iter().map(|(c, _)| quote(c)).collect();
                    let placeholders: Vec<String> = op
                        .data
                        .iter()
                        .map(|(_, v)| {
                            params.push(v.clone());
                            format!("?{}", params.len())
                        })
                        .collect();
                    format!(
                        "INSERT INTO {} ({}) VALUES ({})",
                        quote(&op.table),
                        columns.join(", "),
                        placeholders.join(", ")
                    )
                }
            }
            CrudOperation::Read(op) => {
                let fields = match &op.fields {
                    Some(fields) => fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(", "),
                    None => "*".to_string(),
                };
                let mut sql = format!("SELECT {} FROM {}", fields, quote(&op.table));
                sql.push_str(&op.query.render_where(&mut params));
                if let Some(order_by) = op.order_by.as_ref().filter(|o| !o.is_empty()) {
                    let terms: Vec<String> = order_by
                        .iter()
                        .map(|(f, asc)| format!("{} {}", quote(f), if *asc { "ASC" } else { "DESC" }))
                        .collect();
                    sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
                }
                match (op.limit, op.offset) {
                    (Some(limit), Some(offset)) => {
                        sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"))
                    }
                    (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
                    (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
                    (None, None) => {}
                }
                sql
            }
            CrudOperation::Update(op) => {
                let sets: Vec<String> = op
                    .updates
                    .iter()
                    .map(|(c, v)| {
                        params.push(v.clone());
                        format!("{} = ?{}", quote(c), params.len())
                    })
                    .collect();
                let mut sql = format!("UPDATE {} SET {}", quote(&op.table), sets.join(", "));
                sql.push_str(&op.query.render_where(&mut params));
                sql
            }
            CrudOperation::Delete(op) => {
                let mut sql = format!("DELETE FROM {}", quote(&op.table));
                sql.push_str(&op.query.render_where(&mut params));
                sql
            }
        };
        (sql, params)
    }
}

/// Perform a CRUD operation against `conn`.
///
/// Pass a [`rusqlite::Transaction`] (it derefs to `Connection`) to make the
/// operation part of a larger unit of work.
pub fn execute_crud(conn: &Connection, op: &CrudOperation) -> rusqlite::Result<CrudOutcome> {
    let (sql, params) = op.to_sql();
    tracing::trace!(%sql, params = params.len(), "executing statement");
    match op {
        CrudOperation::Create(_) => {
            conn.execute(&sql, params_from_iter(params.iter()))?;
            Ok(CrudOutcome::Inserted(conn.last_insert_rowid()))
        }
        CrudOperation::Read(_) => {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                let mut map = HashMap::with_capacity(names.len());
                for (idx, name) in names.iter().enumerate() {
                    map.insert(name.clone(), Value::from_ref(row.get_ref(idx)?));
                }
                Ok(map)
            })?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row?);
            }
            Ok(CrudOutcome::Rows(result))
        }
        CrudOperation::Update(_) | CrudOperation::Delete(_) => {
            let affected = conn.execute(&sql, params_from_iter(params.iter()))?;
            Ok(CrudOutcome::Affected(affected))
        }
    }
}

/// Runs a read and returns its rows.
pub fn select(conn: &Connection, op: ReadOperation) -> rusqlite::Result<Vec<HashMap<String, Value>>> {
    match execute_crud(conn, &CrudOperation::Read(op))? {
        CrudOutcome::Rows(rows) => Ok(rows),
        _ => Ok(Vec::new()),
    }
}
