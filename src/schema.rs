//! Typed table definitions and DDL.
//!
//! A [`ColumnDefinition`] carries two names: the logical `attribute` that
//! models and queries use, and the physical `name` of the column in SQLite.
//! They are equal unless a column is renamed with
//! [`ColumnDefinition::column_name`], which lets a stored column keep its
//! historical name while the code moves on.
//!
//! Relationships are declared separately from foreign keys. A foreign key is
//! what the storage engine enforces; a [`Relationship`] is what the session
//! evaluates, including its cascade rule.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::sqlite::{quote, DeleteOperation, Query, QueryOperator, Value};

/// Schema definition for the SQLite database
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Schema {
    pub tables: Vec<TableDefinition>,
    pub relationships: Vec<Relationship>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tables are created, and inserted into, in the order they are added.
    pub fn add_table(mut self, table: TableDefinition) -> Self {
        self.tables.push(table);
        self
    }

    pub fn add_relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Position of `table` in dependency order; unknown tables sort last.
    pub fn position(&self, table: &str) -> usize {
        self.tables
            .iter()
            .position(|t| t.name == table)
            .unwrap_or(self.tables.len())
    }

    pub fn relationship(&self, parent: &str, child: &str) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|r| r.parent_table == parent && r.child_table == child)
    }

    /// Relationships whose deletes cascade from `parent`.
    pub fn cascades_from<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Relationship> {
        self.relationships
            .iter()
            .filter(move |r| r.parent_table == parent && r.cascades_delete())
    }

    /// Creates every missing table and index.
    ///
    /// Existing tables are left untouched, even if their shape differs from
    /// the definition: there is no migration support. Returns the number of
    /// tables created.
    pub fn create_all(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let mut created = 0;
        for table in &self.tables {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [&table.name],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                tracing::debug!(table = %table.name, "table already exists, skipping");
            } else {
                created += 1;
                tracing::info!(table = %table.name, "creating table");
            }
            conn.execute_batch(&table.create_sql())?;
            for index in &table.indexes {
                conn.execute_batch(&index.create_sql(&table.name))?;
            }
        }
        Ok(created)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: ColumnDefinition) -> Self {
        if column.constraints.contains(&ColumnConstraint::PrimaryKey) {
            self.primary_key.push(column.name.clone());
        }
        self.columns.push(column);
        self
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Looks up a column by logical attribute name.
    pub fn column(&self, attribute: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.attribute == attribute)
    }

    /// Maps a logical attribute to its physical column name.
    pub fn column_name(&self, attribute: &str) -> Result<&str> {
        self.column(attribute)
            .map(|c| c.name.as_str())
            .ok_or_else(|| Error::UnknownAttribute {
                table: self.name.clone(),
                attribute: attribute.to_string(),
            })
    }

    /// Maps a physical column name back to its logical attribute.
    pub fn attribute_of(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.attribute.as_str())
    }

    /// Physical names of every column, in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Rewrites a query on logical attributes into one on physical columns.
    pub fn translate(&self, query: &Query) -> Result<Query> {
        let mut translated = Query::new();
        for (attribute, op) in &query.conditions {
            translated = translated.with_condition(self.column_name(attribute)?, op.clone());
        }
        Ok(translated)
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this table.
    pub fn create_sql(&self) -> String {
        let inline_pk = self.primary_key.len() == 1;
        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.render(inline_pk))
            .collect();
        if self.primary_key.len() > 1 {
            let cols: Vec<String> = self.primary_key.iter().map(|c| quote(c)).collect();
            parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
        }
        for fk in &self.foreign_keys {
            parts.push(fk.render());
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({});",
            quote(&self.name),
            parts.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinition {
    /// Logical name used by models and queries.
    pub attribute: String,
    /// Physical column name.
    pub name: String,
    pub data_type: DataType,
    pub constraints: Vec<ColumnConstraint>,
    pub default_value: Option<DefaultValue>,
}

impl ColumnDefinition {
    pub fn new(attribute: &str, data_type: DataType) -> Self {
        Self {
            attribute: attribute.to_string(),
            name: attribute.to_string(),
            data_type,
            constraints: Vec::new(),
            default_value: None,
        }
    }

    /// Stores the attribute under a different physical column name.
    pub fn column_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_constraint(mut self, constraint: ColumnConstraint) -> Self {
        if !self.constraints.contains(&constraint) {
            self.constraints.push(constraint);
        }
        self
    }

    pub fn primary_key(self) -> Self {
        self.with_constraint(ColumnConstraint::PrimaryKey)
    }

    pub fn not_null(self) -> Self {
        self.with_constraint(ColumnConstraint::NotNull)
    }

    pub fn unique(self) -> Self {
        self.with_constraint(ColumnConstraint::Unique)
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default_value = Some(default);
        self
    }

    fn render(&self, inline_pk: bool) -> String {
        let mut sql = format!("{} {}", quote(&self.name), self.data_type.sql());
        for constraint in &self.constraints {
            match constraint {
                ColumnConstraint::PrimaryKey if inline_pk => sql.push_str(" PRIMARY KEY"),
                ColumnConstraint::PrimaryKey => {}
                // AUTOINCREMENT keeps SQLite from handing out the id of a deleted row.
                ColumnConstraint::AutoIncrement if inline_pk => sql.push_str(" AUTOINCREMENT"),
                ColumnConstraint::AutoIncrement => {}
                ColumnConstraint::NotNull => sql.push_str(" NOT NULL"),
                ColumnConstraint::Unique => sql.push_str(" UNIQUE"),
            }
        }
        if let Some(default) = &self.default_value {
            sql.push_str(&format!(" DEFAULT {}", default.sql()));
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Integer,
    Text,
    /// Text with a declared width. SQLite does not enforce the width.
    Varchar(u32),
    Real,
    Blob,
    /// Stored as 0/1.
    Boolean,
}

impl DataType {
    fn sql(&self) -> String {
        match self {
            DataType::Integer => "INTEGER".to_string(),
            DataType::Text => "TEXT".to_string(),
            DataType::Varchar(width) => format!("VARCHAR({width})"),
            DataType::Real => "REAL".to_string(),
            DataType::Blob => "BLOB".to_string(),
            DataType::Boolean => "BOOLEAN".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnConstraint {
    PrimaryKey,
    /// Only meaningful on a single INTEGER primary key.
    AutoIncrement,
    NotNull,
    Unique,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Integer(i64),
    Text(String),
    Real(f64),
    Boolean(bool),
    Null,
    CurrentTimestamp,
}

impl DefaultValue {
    fn sql(&self) -> String {
        match self {
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            DefaultValue::Real(r) => r.to_string(),
            DefaultValue::Boolean(b) => i64::from(*b).to_string(),
            DefaultValue::Null => "NULL".to_string(),
            DefaultValue::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub foreign_table: String,
    pub foreign_column: String,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
}

impl ForeignKey {
    /// A foreign key with no referential actions.
    pub fn new(column: &str, foreign_table: &str, foreign_column: &str) -> Self {
        Self {
            column: column.to_string(),
            foreign_table: foreign_table.to_string(),
            foreign_column: foreign_column.to_string(),
            on_delete: ForeignKeyAction::NoAction,
            on_update: ForeignKeyAction::NoAction,
        }
    }

    fn render(&self) -> String {
        let mut sql = format!(
            "FOREIGN KEY ({}) REFERENCES {} ({})",
            quote(&self.column),
            quote(&self.foreign_table),
            quote(&self.foreign_column)
        );
        if let Some(action) = self.on_delete.sql() {
            sql.push_str(&format!(" ON DELETE {action}"));
        }
        if let Some(action) = self.on_update.sql() {
            sql.push_str(&format!(" ON UPDATE {action}"));
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForeignKeyAction {
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
}

impl ForeignKeyAction {
    fn sql(&self) -> Option<&'static str> {
        match self {
            ForeignKeyAction::NoAction => None,
            ForeignKeyAction::Cascade => Some("CASCADE"),
            ForeignKeyAction::SetNull => Some("SET NULL"),
            ForeignKeyAction::SetDefault => Some("SET DEFAULT"),
            ForeignKeyAction::Restrict => Some("RESTRICT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexDefinition {
    fn create_sql(&self, table: &str) -> String {
        let cols: Vec<String> = self.columns.iter().map(|c| quote(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
            if self.unique { "UNIQUE " } else { "" },
            quote(&self.name),
            quote(table),
            cols.join(", ")
        )
    }
}

/// What happens to children when their parent is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    /// Children are left alone; the foreign key decides.
    None,
    /// Children are deleted with their parent, and pending children of a
    /// deleted parent are dropped from the unit of work.
    DeleteOrphan,
}

/// A one-to-many relationship between two tables.
#[derive(Debug, Clone, PartialEq)]
pub struct Relationship {
    pub parent_table: String,
    pub child_table: String,
    /// Physical column on the child holding the parent id.
    pub foreign_key: String,
    pub cascade: Cascade,
}

impl Relationship {
    pub fn one_to_many(parent_table: &str, child_table: &str, foreign_key: &str) -> Self {
        Self {
            parent_table: parent_table.to_string(),
            child_table: child_table.to_string(),
            foreign_key: foreign_key.to_string(),
            cascade: Cascade::None,
        }
    }

    pub fn with_cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub fn cascades_delete(&self) -> bool {
        self.cascade == Cascade::DeleteOrphan
    }

    /// Deleting parents `parent_ids` deletes every child row whose foreign
    /// key is one of them. Returns `None` when the rule does not apply.
    pub fn plan_delete(&self, parent_ids: &[i64]) -> Option<DeleteOperation> {
        if !self.cascades_delete() || parent_ids.is_empty() {
            return None;
        }
        let ids = parent_ids.iter().copied().map(Value::Integer).collect();
        Some(DeleteOperation {
            table: self.child_table.clone(),
            query: Query::new().with_condition(&self.foreign_key, QueryOperator::In(ids)),
        })
    }
}
