use rusqlite::{params, Connection, OptionalExtension};
use sqlite_bookshelf::{models, Database, Result, SqliteConfig};
use tempfile::NamedTempFile;

// Helper function to create an in-memory database for testing
fn create_test_db() -> Result<Database> {
    let db = Database::open(SqliteConfig::in_memory(models::schema()))?;
    db.create_all()?;
    Ok(db)
}

// Helper function to open a temporary file-based database
fn open_file_db(file: &NamedTempFile) -> Result<Database> {
    let path = file.path().to_str().unwrap().to_string();
    let db = Database::open(SqliteConfig::new(path, models::schema()))?;
    db.create_all()?;
    Ok(db)
}

fn column_names(conn: &Connection, table: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .unwrap();
    stmt.query_map([], |row| row.get::<_, String>(1))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

fn insert_user(conn: &Connection, email: &str) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO usuarios (name, email, password) VALUES (?1, ?2, ?3)",
        params!["Lira", email, "123123"],
    )?;
    Ok(conn.last_insert_rowid())
}

#[test]
fn physical_columns_match_stored_layout() -> Result<()> {
    let db = create_test_db()?;
    let conn = db.connection();
    assert_eq!(
        column_names(conn, "usuarios"),
        vec!["id", "name", "email", "password", "active"]
    );
    assert_eq!(
        column_names(conn, "livros"),
        vec!["id", "title", "qtde_paginas", "owner_id"]
    );
    Ok(())
}

#[test]
fn active_defaults_to_true_in_storage() -> Result<()> {
    let db = create_test_db()?;
    let id = insert_user(db.connection(), "a@example.com")?;
    let active: bool = db
        .connection()
        .query_row("SELECT active FROM usuarios WHERE id = ?", [id], |row| row.get(0))?;
    assert!(active);
    Ok(())
}

#[test]
fn engine_enforces_unique_email() -> Result<()> {
    let db = create_test_db()?;
    insert_user(db.connection(), "dup@example.com")?;
    let err = insert_user(db.connection(), "dup@example.com").unwrap_err();
    assert_eq!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    );
    Ok(())
}

#[test]
fn engine_enforces_book_owner() -> Result<()> {
    let db = create_test_db()?;
    let err = db
        .connection()
        .execute(
            "INSERT INTO livros (title, qtde_paginas, owner_id) VALUES (?1, ?2, ?3)",
            params!["Orphan", 10, 99],
        )
        .unwrap_err();
    assert_eq!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    );
    Ok(())
}

#[test]
fn engine_rejects_deleting_owner_with_books() -> Result<()> {
    // The foreign key has no ON DELETE action; only the session cascades.
    let db = create_test_db()?;
    let conn = db.connection();
    let owner = insert_user(conn, "owner@example.com")?;
    conn.execute(
        "INSERT INTO livros (title, qtde_paginas, owner_id) VALUES (?1, ?2, ?3)",
        params!["Kept", 120, owner],
    )?;
    assert!(conn
        .execute("DELETE FROM usuarios WHERE id = ?", [owner])
        .is_err());
    Ok(())
}

#[test]
fn ids_are_never_reused() -> Result<()> {
    let db = create_test_db()?;
    let conn = db.connection();
    let first = insert_user(conn, "first@example.com")?;
    conn.execute("DELETE FROM usuarios WHERE id = ?", [first])?;
    let second = insert_user(conn, "second@example.com")?;
    assert!(second > first);
    Ok(())
}

#[test]
fn create_all_leaves_existing_file_untouched() -> Result<()> {
    let temp_file = NamedTempFile::new().unwrap();
    {
        let db = open_file_db(&temp_file)?;
        insert_user(db.connection(), "persisted@example.com")?;
    }

    let db = open_file_db(&temp_file)?;
    assert_eq!(db.create_all()?, 0);
    let name: Option<String> = db
        .connection()
        .query_row(
            "SELECT name FROM usuarios WHERE email = ?",
            ["persisted@example.com"],
            |row| row.get(0),
        )
        .optional()?;
    assert_eq!(name.as_deref(), Some("Lira"));
    Ok(())
}
