//! Error types for the persistence layer.

use rusqlite::ErrorCode;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while defining, opening, or using the database.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A SQLite call failed for a reason other than a constraint.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The storage engine rejected a write (unique, not-null, foreign key).
    ///
    /// Raised at commit time; the whole transaction has been rolled back.
    #[error("constraint violation on '{table}': {message}")]
    ConstraintViolation {
        /// Table the failing statement targeted.
        table: String,
        /// Message reported by SQLite.
        message: String,
    },

    /// The entity has no primary key yet.
    #[error("entity in '{table}' has not been persisted")]
    NotPersistent {
        /// Table the entity maps to.
        table: &'static str,
    },

    /// A refresh found no row for a previously persisted id.
    #[error("row {id} in '{table}' no longer exists")]
    ObjectDeleted {
        /// Table the entity maps to.
        table: &'static str,
        /// Primary key that was looked up.
        id: i64,
    },

    /// A link to another entity could not be turned into a foreign key value.
    #[error("entity in '{table}' references an object that was never persisted")]
    UnresolvedLink {
        /// Table of the entity holding the link.
        table: &'static str,
    },

    /// A handle was not issued by this session.
    #[error("handle for '{table}' does not belong to this session")]
    UnknownHandle {
        /// Table the handle points into.
        table: &'static str,
    },

    /// A query or record named an attribute the table does not declare.
    #[error("table '{table}' has no attribute '{attribute}'")]
    UnknownAttribute {
        /// Table that was searched.
        table: String,
        /// Logical attribute name that was requested.
        attribute: String,
    },

    /// A stored value did not have the type the model expects.
    #[error("attribute '{attribute}' of '{table}' is not {expected}")]
    TypeMismatch {
        /// Table the record came from.
        table: String,
        /// Logical attribute name.
        attribute: String,
        /// Expected type, for display.
        expected: &'static str,
    },

    /// The schema does not declare the table a model maps to.
    #[error("table '{table}' is not part of the schema")]
    UnknownTable {
        /// Table name the model asked for.
        table: String,
    },

    /// No relationship is declared between two tables.
    #[error("no relationship declared from '{parent}' to '{child}'")]
    UnknownRelationship {
        /// Parent (one) side.
        parent: &'static str,
        /// Child (many) side.
        child: &'static str,
    },
}

impl Error {
    /// Classifies a SQLite error raised while writing to `table`.
    pub(crate) fn from_write(table: &str, err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                Error::ConstraintViolation {
                    table: table.to_string(),
                    message: message.unwrap_or_else(|| failure.to_string()),
                }
            }
            other => Error::Database(other),
        }
    }

    /// Returns `true` when the storage engine rejected a write.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Error::ConstraintViolation { .. })
    }
}
