//! SQLite persistence for users and the books they own.
//!
//! # Intention
//!
//! - Declare tables with a typed builder, keeping logical attribute names
//!   apart from physical column names.
//! - Buffer changes in a scoped unit of work and write them in one
//!   transaction on an explicit commit.
//! - Evaluate delete cascades as declared rules, not storage-engine side
//!   effects.
//!
//! # Architectural Boundaries
//!
//! - Only SQLite/database code belongs here.
//! - Single process, single connection per [`Database`]. No pooling, no
//!   migrations, no optimistic locking: concurrent writers are last-write-wins.
//! - Passwords are stored as plain text, exactly as given. This mirrors the
//!   demonstration data model and must not be used for real credentials.

pub mod crud;
pub mod database;
pub mod error;
pub mod model;
pub mod models;
pub mod schema;
pub mod session;
pub mod sqlite;

pub use database::{Database, SqliteConfig, DEFAULT_DB_PATH};
pub use error::{Error, Result};
pub use model::{Handle, Model};
pub use models::{Book, Owner, User};
pub use session::{EntityState, FlushStats, Session};
