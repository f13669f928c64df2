//! The contract between record types and the session.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::Result;
use crate::sqlite::{Record, Value};

/// A record type mapped to one table.
///
/// Implementors only describe their data: the session decides when rows are
/// written. The primary key is assigned by the storage engine and handed back
/// through [`Model::assign_id`] exactly once.
pub trait Model: Clone + PartialEq + fmt::Debug + 'static {
    /// Physical table name.
    const TABLE: &'static str;

    fn id(&self) -> Option<i64>;

    /// Records the id generated for a freshly inserted row.
    fn assign_id(&mut self, id: i64);

    /// Logical attribute values to write, primary key excluded.
    fn attributes(&self) -> Vec<(&'static str, Value)>;

    /// Builds an instance from a row keyed by logical attribute.
    fn from_record(record: &Record) -> Result<Self>;

    /// Turns links to other tracked entities into foreign key values.
    ///
    /// Runs at flush time, after every parent row has been written.
    fn resolve_links(&mut self, _links: &Links) -> Result<()> {
        Ok(())
    }

    /// The parent this entity points at through `foreign_key`, if any.
    fn parent(&self, _foreign_key: &str) -> Option<ParentRef> {
        None
    }
}

/// Typed key into a session's identity map.
///
/// Only valid for the session that issued it.
pub struct Handle<M> {
    pub(crate) session: u64,
    pub(crate) slot: usize,
    _model: PhantomData<fn() -> M>,
}

impl<M> Handle<M> {
    pub(crate) fn new(session: u64, slot: usize) -> Self {
        Self {
            session,
            slot,
            _model: PhantomData,
        }
    }

    /// This handle as the target of a child's foreign key.
    pub fn as_parent(&self) -> ParentRef {
        ParentRef::Slot {
            session: self.session,
            slot: self.slot,
        }
    }
}

impl<M> Clone for Handle<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for Handle<M> {}

impl<M> PartialEq for Handle<M> {
    fn eq(&self, other: &Self) -> bool {
        self.session == other.session && self.slot == other.slot
    }
}

impl<M> Eq for Handle<M> {}

impl<M> Hash for Handle<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.session.hash(state);
        self.slot.hash(state);
    }
}

impl<M: Model> fmt::Debug for Handle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({}:{})", M::TABLE, self.session, self.slot)
    }
}

/// How a child refers to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentRef {
    /// A tracked entity, persisted or not.
    Slot { session: u64, slot: usize },
    /// A row known only by its primary key.
    Id(i64),
}

/// Primary keys of the entities tracked by one session, as of the current flush.
#[derive(Debug)]
pub struct Links {
    session: u64,
    ids: HashMap<(&'static str, usize), i64>,
}

impl Links {
    pub(crate) fn new(session: u64) -> Self {
        Self {
            session,
            ids: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, table: &'static str, slot: usize, id: i64) {
        self.ids.insert((table, slot), id);
    }

    /// The id of the entity behind `handle`, once it has one.
    pub fn id_of<M: Model>(&self, handle: &Handle<M>) -> Option<i64> {
        if handle.session != self.session {
            return None;
        }
        self.ids.get(&(M::TABLE, handle.slot)).copied()
    }
}
