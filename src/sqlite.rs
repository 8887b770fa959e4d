use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::{collections::HashMap, sync::Arc};

use crate::config::SqliteConfig;
use crate::error::{Result, SqliteError};
use crate::retry::RetryPolicy;

/// Core value types for SQLite operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value.into())
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Integer(value.into())
    }
}

/// SQLite has no boolean storage class, booleans are stored as 0/1.
impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Blob(value.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(
                std::str::from_utf8(t)
                    .map_err(|err| FromSqlError::Other(Box::new(err)))?
                    .to_string(),
            ),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        })
    }
}

/// One materialized result row, in result-set column order.
///
/// Column names are shared between all rows of a result set. When a name
/// appears more than once, lookups by name see the last of those columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .rposition(|c| c == column)
            .map(|index| &self.values[index])
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.iter().cloned().zip(self.values).collect()
    }

    // Entries whose name does not appear again later in the row.
    fn named_entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.iter()
            .enumerate()
            .filter(|(index, (column, _))| {
                !self.columns[index + 1..].iter().any(|c| c == column)
            })
            .map(|(_, entry)| entry)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let entries: Vec<_> = self.named_entries().collect();
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (column, value) in entries {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

/// Ordered column/value pairs for inserts and updates
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Fields {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Fields {
    /// Create an empty field list
    pub fn new() -> Self {
        Self::default()
    }
    /// Append a column and its value
    pub fn with_value(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.push(column, value);
        self
    }
    pub fn push(&mut self, column: &str, value: impl Into<Value>) {
        self.columns.push(column.to_string());
        self.values.push(value.into());
    }
    pub fn columns(&self) -> &[String] {
        &self.columns
    }
    pub fn values(&self) -> &[Value] {
        &self.values
    }
    pub fn len(&self) -> usize {
        self.columns.len()
    }
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (column, value) in iter {
            fields.columns.push(column.into());
            fields.values.push(value.into());
        }
        fields
    }
}

/// Equality condition `column = value`
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub value: Value,
}

impl Condition {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Self {
            column: column.to_string(),
            value: value.into(),
        }
    }
}

impl<V: Into<Value>> From<(&str, V)> for Condition {
    fn from((column, value): (&str, V)) -> Self {
        Condition::eq(column, value)
    }
}

/// Declared type of an added column.
///
/// `Custom` carries any other type name (`BOOLEAN`, `VARCHAR(32)`, ...); it is
/// quoted, and SQLite derives the column affinity from the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    Text,
    Real,
    Blob,
    Numeric,
    Custom(String),
}

impl DataType {
    fn as_sql(&self) -> String {
        match self {
            DataType::Integer => "INTEGER".to_string(),
            DataType::Text => "TEXT".to_string(),
            DataType::Real => "REAL".to_string(),
            DataType::Blob => "BLOB".to_string(),
            DataType::Numeric => "NUMERIC".to_string(),
            DataType::Custom(name) => quote_ident(name),
        }
    }
}

/// Constant default for an added column. `ALTER TABLE ... ADD COLUMN` only
/// accepts constant expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DefaultValue {
    Integer(i64),
    Text(String),
    Real(f64),
    Null,
}

impl DefaultValue {
    fn as_sql(&self) -> String {
        match self {
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Real(f) => f.to_string(),
            DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            DefaultValue::Null => "NULL".to_string(),
        }
    }
}

/// Column added by [`SqliteStore::add_column`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: DataType,
    pub default_value: Option<DefaultValue>,
}

impl ColumnDefinition {
    pub fn new(name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            default_value: None,
        }
    }

    pub fn with_default(mut self, default_value: DefaultValue) -> Self {
        self.default_value = Some(default_value);
        self
    }

    fn as_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.data_type.as_sql());
        if let Some(default_value) = &self.default_value {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default_value.as_sql());
        }
        sql
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn insert_statement(table: &str, fields: &Fields) -> String {
    if fields.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table));
    }
    let columns = fields
        .columns()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; fields.len()].join(", ");
    format!(
        "INSERT INTO {}({}) VALUES ({})",
        quote_ident(table),
        columns,
        placeholders
    )
}

fn update_statement(table: &str, fields: &Fields, condition: &Condition) -> String {
    let assignments = fields
        .columns()
        .iter()
        .map(|c| format!("{}=?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {} WHERE {}=?",
        quote_ident(table),
        assignments,
        quote_ident(&condition.column)
    )
}

fn delete_statement(table: &str, column: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {}=?",
        quote_ident(table),
        quote_ident(column)
    )
}

fn select_statement(
    table: &str,
    columns: Option<&[&str]>,
    condition: Option<&Condition>,
) -> String {
    let columns = match columns {
        Some(columns) if !columns.is_empty() => columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "*".to_string(),
    };
    match condition {
        Some(condition) => format!(
            "SELECT {} FROM {} WHERE {}=?",
            columns,
            quote_ident(table),
            quote_ident(&condition.column)
        ),
        None => format!("SELECT {} FROM {}", columns, quote_ident(table)),
    }
}

/// A connection scoped to a single call.
///
/// Statements go through the retry policy of the config it was opened with.
/// Dropping the cursor commits any open transaction and closes the
/// connection; [`DbCursor::commit`] does the same but reports the failure.
/// A failed `commit` is not retried on drop, the open transaction is rolled
/// back when the connection closes.
pub struct DbCursor {
    conn: Connection,
    retry: RetryPolicy,
    committed: bool,
}

impl std::fmt::Debug for DbCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCursor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl DbCursor {
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let conn = Connection::open(&config.db_path)?;
        conn.busy_timeout(config.busy_timeout())?;
        tracing::trace!(path = %config.db_path.display(), "opened sqlite connection");
        Ok(Self {
            conn,
            retry: config.retry_policy(),
            committed: false,
        })
    }

    /// Execute a statement, returning the number of changed rows.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let changed = self
            .retry
            .run(sql, || self.conn.execute(sql, params_from_iter(params)))?;
        Ok(changed)
    }

    /// Run a query and materialize every row.
    ///
    /// A statement without result columns yields an empty list.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = self.retry.run(sql, || {
            let mut stmt = self.conn.prepare(sql)?;
            let columns: Arc<[String]> = stmt
                .column_names()
                .into_iter()
                .map(String::from)
                .collect();
            let mut rows = stmt.query(params_from_iter(params))?;
            let mut result = Vec::new();
            while let Some(row) = rows.next()? {
                let values = (0..columns.len())
                    .map(|index| row.get::<_, Value>(index))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result.push(Row {
                    columns: Arc::clone(&columns),
                    values,
                });
            }
            Ok(result)
        })?;
        Ok(rows)
    }

    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Commit and close.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT")?;
        }
        Ok(())
    }
}

impl Drop for DbCursor {
    fn drop(&mut self) {
        if !self.committed && !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("COMMIT") {
                tracing::warn!(error = %err, "failed to commit sqlite connection on close");
            }
        }
    }
}

/// CRUD helpers over one database file. Each call opens its own
/// [`DbCursor`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    config: SqliteConfig,
}

impl SqliteStore {
    /// Create a store with the given config
    pub fn new(config: SqliteConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    pub fn cursor(&self) -> Result<DbCursor> {
        DbCursor::open(&self.config)
    }

    /// Insert a row and return its row id.
    pub fn insert(&self, table: &str, fields: &Fields) -> Result<i64> {
        let sql = insert_statement(table, fields);
        let cursor = self.cursor()?;
        if let Err(err) = cursor.execute(&sql, fields.values()) {
            if err.is_constraint_violation() {
                tracing::error!(
                    table,
                    columns = ?fields.columns(),
                    values = ?fields.values(),
                    "insert violated a constraint"
                );
            }
            return Err(err);
        }
        let id = cursor.last_insert_rowid();
        cursor.commit()?;
        tracing::debug!(table, id, "inserted row");
        Ok(id)
    }

    /// Update `fields` on the rows matching `condition`, returning how many
    /// rows changed.
    pub fn update(&self, table: &str, fields: &Fields, condition: &Condition) -> Result<usize> {
        if fields.is_empty() {
            return Err(SqliteError::EmptyFields {
                operation: "update",
                table: table.to_string(),
            });
        }
        let sql = update_statement(table, fields, condition);
        let mut params = fields.values().to_vec();
        params.push(condition.value.clone());

        let cursor = self.cursor()?;
        let changed = cursor.execute(&sql, &params)?;
        cursor.commit()?;
        Ok(changed)
    }

    /// Delete the rows where `column = value`.
    pub fn delete(&self, table: &str, column: &str, value: impl Into<Value>) -> Result<usize> {
        let sql = delete_statement(table, column);
        let cursor = self.cursor()?;
        let removed = cursor.execute(&sql, &[value.into()])?;
        cursor.commit()?;
        Ok(removed)
    }

    /// Select `columns` (all when `None` or empty), optionally filtered by
    /// an equality condition.
    pub fn select(
        &self,
        table: &str,
        columns: Option<&[&str]>,
        condition: Option<&Condition>,
    ) -> Result<Vec<Row>> {
        let sql = select_statement(table, columns, condition);
        let params: Vec<Value> = condition.map(|c| c.value.clone()).into_iter().collect();
        let cursor = self.cursor()?;
        let rows = cursor.query(&sql, &params)?;
        cursor.commit()?;
        Ok(rows)
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let cursor = self.cursor()?;
        let rows = cursor.query(sql, params)?;
        cursor.commit()?;
        Ok(rows)
    }

    pub fn add_column(&self, table: &str, column: &ColumnDefinition) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column.as_sql()
        );
        let cursor = self.cursor()?;
        cursor.execute(&sql, &[])?;
        cursor.commit()?;
        tracing::debug!(table, column = %column.name, "added column");
        Ok(())
    }
}
