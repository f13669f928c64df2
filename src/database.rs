//! Database handle and connection configuration.

use rusqlite::Connection;
use serde::Deserialize;

use crate::error::Result;
use crate::schema::Schema;
use crate::session::Session;

/// Database file used when no path is configured.
pub const DEFAULT_DB_PATH: &str = "meubanco.db";

/// SQLite Service configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the SQLite database file. `:memory:` opens a private
    /// in-memory database.
    pub db_path: String,
    /// Busy timeout for the connection, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Whether SQLite enforces foreign keys on this connection.
    pub foreign_keys: bool,
    /// Schema definition for the database
    #[serde(skip)]
    pub schema: Schema,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            busy_timeout_ms: 5_000,
            foreign_keys: true,
            schema: Schema::new(),
        }
    }
}

impl SqliteConfig {
    /// Create a new SQLite config with path and schema
    pub fn new(db_path: impl Into<String>, schema: Schema) -> Self {
        Self {
            db_path: db_path.into(),
            schema,
            ..Self::default()
        }
    }

    pub fn in_memory(schema: Schema) -> Self {
        Self::new(":memory:", schema)
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }
}

/// An open database: one connection plus the schema it is used with.
///
/// Hand out units of work with [`Database::session`] or, preferably,
/// [`Database::with_session`].
pub struct Database {
    conn: Connection,
    schema: Schema,
}

impl Database {
    /// Opens (creating if needed) the configured database file.
    ///
    /// Tables are not created; call [`Database::create_all`].
    pub fn open(config: SqliteConfig) -> Result<Self> {
        tracing::info!(path = %config.db_path, "opening sqlite database");
        let conn = Connection::open(&config.db_path)?;
        conn.execute_batch(&format!(
            "PRAGMA foreign_keys = {};
             PRAGMA busy_timeout = {};",
            if config.foreign_keys { "ON" } else { "OFF" },
            config.busy_timeout_ms
        ))?;
        Ok(Self {
            conn,
            schema: config.schema,
        })
    }

    /// Creates missing tables. Safe to call on every start.
    pub fn create_all(&self) -> Result<usize> {
        let created = self.schema.create_all(&self.conn)?;
        tracing::info!(created, total = self.schema.tables.len(), "schema ready");
        Ok(created)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The underlying connection, for statements outside the session model.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Opens a unit of work. Uncommitted changes are discarded when it drops.
    pub fn session(&self) -> Session<'_> {
        Session::new(&self.conn, &self.schema)
    }

    /// Runs `f` in a fresh session that is released when `f` returns.
    ///
    /// If `f` fails, pending changes are rolled back before the error is
    /// returned. Nothing is committed implicitly.
    pub fn with_session<T>(&self, f: impl FnOnce(&mut Session<'_>) -> Result<T>) -> Result<T> {
        let mut session = self.session();
        let result = f(&mut session);
        if result.is_err() {
            session.rollback();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_pragmas() {
        let config = SqliteConfig {
            busy_timeout_ms: 2_500,
            ..SqliteConfig::in_memory(Schema::new())
        };
        let db = Database::open(config).expect("open");

        let fk: i32 = db
            .connection()
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = db
            .connection()
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500);
    }

    #[test]
    fn defaults_point_at_demo_file() {
        let config = SqliteConfig::default();
        assert_eq!(config.db_path, "meubanco.db");
        assert!(config.foreign_keys);
        assert!(config.schema.tables.is_empty());
    }
}
