//! The `usuarios` and `livros` tables and their record types.

use std::fmt;

use crate::error::{Error, Result};
use crate::model::{Handle, Links, Model, ParentRef};
use crate::schema::{
    Cascade, ColumnConstraint, ColumnDefinition, DataType, DefaultValue, ForeignKey, Relationship,
    Schema, TableDefinition,
};
use crate::session::Session;
use crate::sqlite::{Record, Value};

/// Table holding [`User`] rows.
pub const USERS_TABLE: &str = "usuarios";
/// Table holding [`Book`] rows.
pub const BOOKS_TABLE: &str = "livros";

/// The registered schema: users first, then the books they own.
///
/// The books foreign key has no `ON DELETE` action. Removing a user's books
/// is the job of the `DeleteOrphan` relationship, applied by the session.
pub fn schema() -> Schema {
    Schema::new()
        .add_table(
            TableDefinition::new(USERS_TABLE)
                .with_column(id_column())
                .with_column(ColumnDefinition::new("name", DataType::Varchar(100)).not_null())
                .with_column(
                    ColumnDefinition::new("email", DataType::Varchar(255))
                        .not_null()
                        .unique(),
                )
                .with_column(ColumnDefinition::new("password", DataType::Varchar(255)).not_null())
                .with_column(
                    ColumnDefinition::new("active", DataType::Boolean)
                        .not_null()
                        .with_default(DefaultValue::Boolean(true)),
                ),
        )
        .add_table(
            TableDefinition::new(BOOKS_TABLE)
                .with_column(id_column())
                .with_column(ColumnDefinition::new("title", DataType::Varchar(200)).not_null())
                .with_column(
                    ColumnDefinition::new("page_count", DataType::Integer)
                        .column_name("qtde_paginas")
                        .not_null(),
                )
                .with_column(ColumnDefinition::new("owner_id", DataType::Integer).not_null())
                .with_foreign_key(ForeignKey::new("owner_id", USERS_TABLE, "id")),
        )
        .add_relationship(
            Relationship::one_to_many(USERS_TABLE, BOOKS_TABLE, "owner_id")
                .with_cascade(Cascade::DeleteOrphan),
        )
}

fn id_column() -> ColumnDefinition {
    ColumnDefinition::new("id", DataType::Integer)
        .primary_key()
        .with_constraint(ColumnConstraint::AutoIncrement)
}

/// A row of `usuarios`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    id: Option<i64>,
    pub name: String,
    /// Unique across all users; the lookup key.
    pub email: String,
    /// Stored as given, in plain text. Not fit for anything beyond a local
    /// demonstration; a real deployment needs a salted hash here.
    pub password: String,
    pub active: bool,
}

impl User {
    /// A new, active user with no id yet.
    pub fn new(name: impl Into<String>, email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            email: email.into(),
            password: password.into(),
            active: true,
        }
    }
}

impl Model for User {
    const TABLE: &'static str = USERS_TABLE;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn attributes(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("name", self.name.clone().into()),
            ("email", self.email.clone().into()),
            ("password", self.password.clone().into()),
            ("active", self.active.into()),
        ]
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: Some(record.integer("id")?),
            name: record.text("name")?,
            email: record.text("email")?,
            password: record.text("password")?,
            active: record.boolean("active")?,
        })
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User(id={}, name={:?}, email={:?})", DisplayId(self.id), self.name, self.email)
    }
}

/// Who owns a [`Book`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// A user tracked by the same session; its id is filled in at commit.
    Entity(Handle<User>),
    /// A user row known by id.
    Id(i64),
}

impl From<Handle<User>> for Owner {
    fn from(handle: Handle<User>) -> Self {
        Owner::Entity(handle)
    }
}

impl From<&Handle<User>> for Owner {
    fn from(handle: &Handle<User>) -> Self {
        Owner::Entity(*handle)
    }
}

impl From<i64> for Owner {
    fn from(id: i64) -> Self {
        Owner::Id(id)
    }
}

/// A row of `livros`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    id: Option<i64>,
    pub title: String,
    /// Stored in column `qtde_paginas`.
    pub page_count: i64,
    pub owner: Owner,
}

impl Book {
    pub fn new(title: impl Into<String>, page_count: i64, owner: impl Into<Owner>) -> Self {
        Self {
            id: None,
            title: title.into(),
            page_count,
            owner: owner.into(),
        }
    }

    /// The owner's id, once known.
    pub fn owner_id(&self) -> Option<i64> {
        match self.owner {
            Owner::Id(id) => Some(id),
            Owner::Entity(_) => None,
        }
    }
}

impl Model for Book {
    const TABLE: &'static str = BOOKS_TABLE;

    fn id(&self) -> Option<i64> {
        self.id
    }

    fn assign_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn attributes(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("title", self.title.clone().into()),
            ("page_count", self.page_count.into()),
            ("owner_id", self.owner_id().into()),
        ]
    }

    fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: Some(record.integer("id")?),
            title: record.text("title")?,
            page_count: record.integer("page_count")?,
            owner: Owner::Id(record.integer("owner_id")?),
        })
    }

    fn resolve_links(&mut self, links: &Links) -> Result<()> {
        if let Owner::Entity(handle) = self.owner {
            let id = links
                .id_of(&handle)
                .ok_or(Error::UnresolvedLink { table: Self::TABLE })?;
            self.owner = Owner::Id(id);
        }
        Ok(())
    }

    fn parent(&self, foreign_key: &str) -> Option<ParentRef> {
        if foreign_key != "owner_id" {
            return None;
        }
        Some(match self.owner {
            Owner::Entity(handle) => handle.as_parent(),
            Owner::Id(id) => ParentRef::Id(id),
        })
    }
}

impl fmt::Display for Book {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Book(id={}, title={:?}, owner_id={})",
            DisplayId(self.id),
            self.title,
            DisplayId(self.owner_id())
        )
    }
}

struct DisplayId(Option<i64>);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(id) => write!(f, "{id}"),
            None => write!(f, "None"),
        }
    }
}

impl Session<'_> {
    /// Books owned by `user`.
    pub fn books_of(&mut self, user: &Handle<User>) -> Result<Vec<Handle<Book>>> {
        self.related::<User, Book>(user)
    }

    /// The user owning `book`, loading it if needed.
    pub fn owner_of(&mut self, book: &Handle<Book>) -> Result<Option<Handle<User>>> {
        let owner = self
            .get(book)
            .ok_or(Error::UnknownHandle { table: Book::TABLE })?
            .owner;
        match owner {
            Owner::Entity(handle) => Ok(Some(handle)),
            Owner::Id(id) => self.find_by::<User>("id", id),
        }
    }
}
