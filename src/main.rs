//! Runs the users/books walk-through against `meubanco.db` in the working
//! directory.

use anyhow::Context;
use sqlite_bookshelf::{crud, models, Database, SqliteConfig, DEFAULT_DB_PATH};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let db = Database::open(SqliteConfig::new(DEFAULT_DB_PATH, models::schema()))
        .with_context(|| format!("failed to open {DEFAULT_DB_PATH}"))?;
    db.create_all().context("failed to create tables")?;

    let stdout = std::io::stdout();
    crud::run_demo(&db, &mut stdout.lock())
}
