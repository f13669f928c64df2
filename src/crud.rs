//! Create, read, update and delete for users and books.
//!
//! Every function opens its own session, so each call is one unit of work
//! and one transaction. Lookups by email return `None` for an unknown
//! address; updates and deletes of an unknown user are no-ops reported as
//! `false`.

use std::io::Write;

use anyhow::Context;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::model::{Handle, Model};
use crate::models::{Book, User};
use crate::session::Session;

/// Email the demonstration registers, looks up, renames and deletes.
pub const DEMO_EMAIL: &str = "123@gmail.com";

fn snapshot<M: Model>(session: &Session<'_>, handle: &Handle<M>) -> Result<M> {
    session
        .get(handle)
        .cloned()
        .ok_or(Error::UnknownHandle { table: M::TABLE })
}

/// Inserts `user` and returns it with its generated id.
///
/// A duplicate email fails with [`Error::ConstraintViolation`] and nothing
/// is written.
pub fn create_user(db: &Database, user: User) -> Result<User> {
    db.with_session(|session| {
        let handle = session.add(user)?;
        session.commit()?;
        session.refresh(&handle)?;
        snapshot(session, &handle)
    })
}

/// Inserts `book`. Its owner must be given by id, since handles from other
/// sessions cannot be resolved.
pub fn create_book(db: &Database, book: Book) -> Result<Book> {
    db.with_session(|session| {
        let handle = session.add(book)?;
        session.commit()?;
        session.refresh(&handle)?;
        snapshot(session, &handle)
    })
}

/// Inserts a user, then a book linked to the in-memory user object, in one
/// session with two commits.
pub fn create_user_with_book(
    db: &Database,
    user: User,
    title: &str,
    page_count: i64,
) -> Result<(User, Book)> {
    db.with_session(|session| {
        let user = session.add(user)?;
        session.commit()?;
        session.refresh(&user)?;

        let book = session.add(Book::new(title, page_count, user))?;
        session.commit()?;
        Ok((snapshot(session, &user)?, snapshot(session, &book)?))
    })
}

/// Every row of `M`, in storage order.
pub fn list_all<M: Model>(db: &Database) -> Result<Vec<M>> {
    db.with_session(|session| {
        let handles = session.query::<M>().all()?;
        handles.iter().map(|h| snapshot(session, h)).collect()
    })
}

/// The user registered under `email`, if any.
pub fn find_user_by_email(db: &Database, email: &str) -> Result<Option<User>> {
    db.with_session(|session| {
        session
            .find_by::<User>("email", email)?
            .map(|h| snapshot(session, &h))
            .transpose()
    })
}

/// The user registered under `email` together with their books.
pub fn find_user_with_books(db: &Database, email: &str) -> Result<Option<(User, Vec<Book>)>> {
    db.with_session(|session| {
        let Some(user) = session.find_by::<User>("email", email)? else {
            return Ok(None);
        };
        let books = session
            .books_of(&user)?
            .iter()
            .map(|h| snapshot(session, h))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some((snapshot(session, &user)?, books)))
    })
}

/// Renames the user registered under `email`. Returns `false` if there is none.
pub fn rename_user(db: &Database, email: &str, name: &str) -> Result<bool> {
    db.with_session(|session| {
        let Some(user) = session.find_by::<User>("email", email)? else {
            return Ok(false);
        };
        if let Some(user) = session.get_mut(&user) {
            user.name = name.to_string();
        }
        session.commit()?;
        Ok(true)
    })
}

/// Deletes the user registered under `email` and, with them, all their books.
/// Returns `false` if there is none.
pub fn delete_user(db: &Database, email: &str) -> Result<bool> {
    db.with_session(|session| {
        let Some(user) = session.find_by::<User>("email", email)? else {
            return Ok(false);
        };
        session.delete(&user)?;
        session.commit()?;
        Ok(true)
    })
}

/// The demonstration walk-through: create, read, update, delete.
pub fn run_demo<W: Write>(db: &Database, out: &mut W) -> anyhow::Result<()> {
    let (user, book) = create_user_with_book(db, User::new("Lira", DEMO_EMAIL, "123123"), "Nome do Vento", 200)
        .context("failed to create demo user and book")?;
    tracing::info!(%user, %book, "created");

    let users = list_all::<User>(db).context("failed to list users")?;
    writeln!(out, "Registered users: [{}]", join(&users))?;

    if let Some((user, books)) = find_user_with_books(db, DEMO_EMAIL).context("failed to look up user")? {
        writeln!(out, "Found user: {}", user.name)?;
        writeln!(out, "User's books: [{}]", join(&books))?;
    }

    if rename_user(db, DEMO_EMAIL, "Willinelson").context("failed to rename user")? {
        tracing::info!(email = DEMO_EMAIL, "renamed");
    }

    if delete_user(db, DEMO_EMAIL).context("failed to delete user")? {
        tracing::info!(email = DEMO_EMAIL, "deleted with their books");
    }
    Ok(())
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items.iter().map(T::to_string).collect::<Vec<_>>().join(", ")
}
