use sqlite_bookshelf::models::{self, Book, Owner, User};
use sqlite_bookshelf::sqlite::QueryOperator;
use sqlite_bookshelf::{Database, EntityState, Error, Model, SqliteConfig};
use tempfile::NamedTempFile;

fn test_db() -> Database {
    let db = Database::open(SqliteConfig::in_memory(models::schema())).expect("open");
    db.create_all().expect("create tables");
    db
}

fn count(db: &Database, table: &str) -> i64 {
    db.connection()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count rows")
}

fn seed_user(db: &Database, name: &str, email: &str) -> i64 {
    let mut session = db.session();
    let user = session.add(User::new(name, email, "secret")).unwrap();
    session.commit().expect("commit seed user");
    session.get(&user).and_then(|u| u.id()).expect("seed user id")
}

#[test]
fn pending_rows_are_invisible_until_commit() {
    let db = test_db();
    let mut session = db.session();
    let user = session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();

    assert!(session.has_pending());
    assert!(session.query::<User>().all().unwrap().is_empty());
    assert_eq!(session.get(&user).unwrap().id(), None);

    let stats = session.commit().unwrap();
    assert_eq!(stats.inserted, 1);
    assert!(!session.has_pending());
    assert_eq!(session.state(&user), Some(EntityState::Persistent));
    assert_eq!(session.query::<User>().all().unwrap(), vec![user]);
}

#[test]
fn refresh_reads_back_generated_values() {
    let db = test_db();
    let mut session = db.session();
    let user = session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    assert!(matches!(
        session.refresh(&user),
        Err(Error::NotPersistent { table: "usuarios" })
    ));

    session.commit().unwrap();
    session.get_mut(&user).unwrap().name = "scratch".into();
    session.refresh(&user).unwrap();

    let stored = session.get(&user).unwrap();
    assert_eq!(stored.id(), Some(1));
    assert_eq!(stored.name, "Lira");
    assert!(stored.active);
    assert!(!session.has_pending());
}

#[test]
fn dropping_a_session_discards_pending_changes() {
    let db = test_db();
    {
        let mut session = db.session();
        session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    }
    assert_eq!(count(&db, "usuarios"), 0);
}

#[test]
fn with_session_rolls_back_on_error() {
    let db = test_db();
    let result: sqlite_bookshelf::Result<()> = db.with_session(|session| {
        session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
        Err(Error::NotPersistent { table: "usuarios" })
    });
    assert!(result.is_err());
    assert_eq!(count(&db, "usuarios"), 0);
}

#[test]
fn failed_commit_leaves_entity_without_id() {
    let db = test_db();
    seed_user(&db, "First", "dup@example.com");

    let mut session = db.session();
    let second = session.add(User::new("Second", "dup@example.com", "x")).unwrap();
    let err = session.commit().unwrap_err();

    assert!(err.is_constraint_violation(), "unexpected error: {err}");
    assert_eq!(session.state(&second), Some(EntityState::Detached));
    assert_eq!(session.get(&second).unwrap().id(), None);
    assert!(!session.has_pending());
    drop(session);

    let users = db.session().query::<User>().filter_by("email", "dup@example.com").all().unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(count(&db, "usuarios"), 1);
}

#[test]
fn failed_commit_reverts_loaded_edits() {
    let db = test_db();
    seed_user(&db, "Lira", "lira@example.com");
    seed_user(&db, "Other", "other@example.com");

    let mut session = db.session();
    let lira = session.find_by::<User>("email", "lira@example.com").unwrap().unwrap();
    session.get_mut(&lira).unwrap().name = "Renamed".into();
    session.add(User::new("Clash", "other@example.com", "x")).unwrap();

    assert!(session.commit().is_err());
    assert_eq!(session.get(&lira).unwrap().name, "Lira");
    assert_eq!(session.state(&lira), Some(EntityState::Persistent));

    let stored: String = db
        .connection()
        .query_row("SELECT name FROM usuarios WHERE email = 'lira@example.com'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(stored, "Lira");
}

#[test]
fn identity_map_keeps_in_memory_edits() {
    let db = test_db();
    seed_user(&db, "Lira", "lira@example.com");

    let mut session = db.session();
    let first = session.find_by::<User>("email", "lira@example.com").unwrap().unwrap();
    session.get_mut(&first).unwrap().name = "Edited".into();
    let again = session.find_by::<User>("email", "lira@example.com").unwrap().unwrap();

    assert_eq!(first, again);
    assert_eq!(session.get(&again).unwrap().name, "Edited");
}

#[test]
fn repeated_identical_update_writes_once() {
    let db = test_db();
    seed_user(&db, "Lira", "lira@example.com");

    let mut session = db.session();
    let user = session.find_by::<User>("email", "lira@example.com").unwrap().unwrap();
    session.get_mut(&user).unwrap().name = "Willinelson".into();
    assert_eq!(session.commit().unwrap().updated, 1);
    session.get_mut(&user).unwrap().name = "Willinelson".into();
    assert_eq!(session.commit().unwrap(), Default::default());
}

#[test]
fn book_owner_can_be_the_user_object() {
    let db = test_db();
    let mut session = db.session();
    let user = session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    let book = session.add(Book::new("Nome do Vento", 200, user)).unwrap();
    assert_eq!(session.get(&book).unwrap().owner, Owner::Entity(user));

    let stats = session.commit().unwrap();
    assert_eq!(stats.inserted, 2);

    let user_id = session.get(&user).unwrap().id().unwrap();
    assert_eq!(session.get(&book).unwrap().owner_id(), Some(user_id));
    assert_eq!(session.books_of(&user).unwrap(), vec![book]);
    assert_eq!(session.owner_of(&book).unwrap(), Some(user));
}

#[test]
fn handles_do_not_cross_sessions() {
    let db = test_db();
    let mut first = db.session();
    let user = first.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    first.commit().unwrap();

    let mut second = db.session();
    assert!(second.get(&user).is_none());
    assert!(matches!(second.delete(&user), Err(Error::UnknownHandle { .. })));

    second.add(Book::new("Lost", 10, user)).unwrap();
    assert!(matches!(
        second.commit(),
        Err(Error::UnresolvedLink { table: "livros" })
    ));
    assert_eq!(count(&db, "livros"), 0);
}

#[test]
fn deleting_a_user_cascades_to_books() {
    let db = test_db();
    let owner = seed_user(&db, "Lira", "lira@example.com");
    let other = seed_user(&db, "Other", "other@example.com");
    {
        let mut session = db.session();
        for (title, pages, id) in [("A", 100, owner), ("B", 150, owner), ("C", 90, owner), ("D", 50, other)] {
            session.add(Book::new(title, pages, id)).unwrap();
        }
        session.commit().unwrap();
    }

    let mut session = db.session();
    let user = session.find_by::<User>("id", owner).unwrap().unwrap();
    let loaded = session.books_of(&user).unwrap();
    assert_eq!(loaded.len(), 3);

    session.delete(&user).unwrap();
    let stats = session.commit().unwrap();
    assert_eq!(stats.deleted, 4);
    for book in &loaded {
        assert_eq!(session.state(book), Some(EntityState::Detached));
    }

    let remaining: i64 = db
        .connection()
        .query_row("SELECT COUNT(*) FROM livros WHERE owner_id = ?", [owner], |row| row.get(0))
        .unwrap();
    assert_eq!(remaining, 0);
    assert_eq!(count(&db, "livros"), 1);
}

#[test]
fn cascade_drops_pending_books_of_deleted_user() {
    let db = test_db();
    seed_user(&db, "Lira", "lira@example.com");

    let mut session = db.session();
    let user = session.find_by::<User>("email", "lira@example.com").unwrap().unwrap();
    let book = session.add(Book::new("Never stored", 10, user)).unwrap();
    session.delete(&user).unwrap();
    session.commit().unwrap();

    assert_eq!(session.state(&book), Some(EntityState::Detached));
    assert_eq!(count(&db, "livros"), 0);
    assert_eq!(count(&db, "usuarios"), 0);
}

#[test]
fn cascade_from_cancelled_pending_user_drops_its_books() {
    let db = test_db();
    let mut session = db.session();
    let user = session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    let book = session.add(Book::new("Never stored", 10, user)).unwrap();
    session.delete(&user).unwrap();

    assert_eq!(session.commit().unwrap(), Default::default());
    assert_eq!(session.state(&book), Some(EntityState::Detached));
    assert_eq!(count(&db, "livros"), 0);
}

#[test]
fn book_of_user_whose_insert_failed_is_not_dropped_silently() {
    let db = test_db();
    seed_user(&db, "First", "dup@example.com");

    let mut session = db.session();
    let user = session.add(User::new("Second", "dup@example.com", "x")).unwrap();
    assert!(session.commit().unwrap_err().is_constraint_violation());
    assert_eq!(session.state(&user), Some(EntityState::Detached));

    let book = session.add(Book::new("Lost", 10, user)).unwrap();
    assert!(matches!(
        session.commit(),
        Err(Error::UnresolvedLink { table: "livros" })
    ));
    assert_eq!(session.state(&book), Some(EntityState::Detached));
    assert_eq!(count(&db, "livros"), 0);
}

#[test]
fn book_of_user_deleted_in_earlier_commit_is_not_dropped_silently() {
    let db = test_db();
    let mut session = db.session();
    let user = session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    session.commit().unwrap();
    session.delete(&user).unwrap();
    assert_eq!(session.commit().unwrap().deleted, 1);
    assert_eq!(session.state(&user), Some(EntityState::Detached));

    session.add(Book::new("Lost", 10, user)).unwrap();
    assert!(matches!(
        session.commit(),
        Err(Error::UnresolvedLink { table: "livros" })
    ));
    assert_eq!(count(&db, "livros"), 0);
}

#[test]
fn failed_commit_undoes_cascade() {
    let db = test_db();
    seed_user(&db, "Other", "other@example.com");

    let mut session = db.session();
    let user = session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    let stored = session.add(Book::new("Nome do Vento", 200, user)).unwrap();
    session.commit().unwrap();

    let pending = session.add(Book::new("Never stored", 10, user)).unwrap();
    session.delete(&user).unwrap();
    session.add(User::new("Clash", "other@example.com", "x")).unwrap();
    assert!(session.commit().unwrap_err().is_constraint_violation());

    // Same outcome as a rollback with no cascade: loaded rows are persistent
    // again and pending inserts are detached.
    assert_eq!(session.state(&user), Some(EntityState::Persistent));
    assert_eq!(session.state(&stored), Some(EntityState::Persistent));
    assert_eq!(session.state(&pending), Some(EntityState::Detached));
    assert!(!session.has_pending());
    assert_eq!(count(&db, "livros"), 1);
    assert_eq!(count(&db, "usuarios"), 2);

    // A later commit cascades from scratch.
    session.delete(&user).unwrap();
    let stats = session.commit().unwrap();
    assert_eq!(stats.deleted, 2);
    assert_eq!(session.state(&stored), Some(EntityState::Detached));
    assert_eq!(count(&db, "livros"), 0);
    assert_eq!(count(&db, "usuarios"), 1);
}

#[test]
fn deleting_a_pending_entity_cancels_its_insert() {
    let db = test_db();
    let mut session = db.session();
    let user = session.add(User::new("Lira", "lira@example.com", "123123")).unwrap();
    session.delete(&user).unwrap();
    assert!(!session.has_pending());
    assert_eq!(session.commit().unwrap(), Default::default());
    assert_eq!(count(&db, "usuarios"), 0);
}

#[test]
fn filters_use_logical_attribute_names() {
    let db = test_db();
    let owner = seed_user(&db, "Lira", "lira@example.com");
    {
        let mut session = db.session();
        session.add(Book::new("Short", 90, owner)).unwrap();
        session.add(Book::new("Long", 900, owner)).unwrap();
        session.commit().unwrap();
    }

    let mut session = db.session();
    let long = session
        .query::<Book>()
        .filter("page_count", QueryOperator::GreaterThan(500i64.into()))
        .all()
        .unwrap();
    assert_eq!(long.len(), 1);
    assert_eq!(session.get(&long[0]).unwrap().title, "Long");

    let ordered = session.query::<Book>().order_by("page_count", false).all().unwrap();
    let titles: Vec<_> = ordered.iter().map(|b| session.get(b).unwrap().title.clone()).collect();
    assert_eq!(titles, vec!["Long", "Short"]);

    assert!(matches!(
        session.query::<Book>().filter_by("qtde", 1i64).all(),
        Err(Error::UnknownAttribute { .. })
    ));
}

#[test]
fn concurrent_sessions_are_last_write_wins() {
    let file = NamedTempFile::new().unwrap();
    let path = file.path().to_str().unwrap().to_string();
    let first_db = Database::open(SqliteConfig::new(path.clone(), models::schema())).unwrap();
    first_db.create_all().unwrap();
    let second_db = Database::open(SqliteConfig::new(path, models::schema())).unwrap();
    seed_user(&first_db, "Lira", "lira@example.com");

    let mut a = first_db.session();
    let mut b = second_db.session();
    let in_a = a.find_by::<User>("email", "lira@example.com").unwrap().unwrap();
    let in_b = b.find_by::<User>("email", "lira@example.com").unwrap().unwrap();

    a.get_mut(&in_a).unwrap().name = "From A".into();
    b.get_mut(&in_b).unwrap().name = "From B".into();
    a.commit().unwrap();
    b.commit().unwrap();

    let mut check = first_db.session();
    let user = check.find_by::<User>("email", "lira@example.com").unwrap().unwrap();
    assert_eq!(check.get(&user).unwrap().name, "From B");
}
