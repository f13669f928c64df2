//! Unit of work over one connection.
//!
//! A [`Session`] tracks entities in an identity map and buffers every change
//! in memory. Nothing reaches the database until [`Session::commit`], which
//! writes all pending inserts, updates and deletes in a single transaction.
//! Queries never flush: rows added but not yet committed are invisible to
//! them.
//!
//! Commit order follows the schema: inserts and updates run parents first,
//! deletes run children first. Cascades declared on a [`Relationship`] are
//! evaluated here, by the session, not by the storage engine.
//!
//! A session is bound to a borrowed `rusqlite::Connection` and is therefore
//! neither `Send` nor `Sync`. Concurrent sessions on the same file are not
//! coordinated: the last commit to touch a row wins.
//!
//! [`Relationship`]: crate::schema::Relationship

use std::any::Any;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::model::{Handle, Links, Model, ParentRef};
use crate::schema::{Schema, TableDefinition};
use crate::sqlite::{
    execute_crud, select, CreateOperation, CrudOperation, CrudOutcome, DeleteOperation, Query,
    QueryOperator, ReadOperation, Record, UpdateOperation, Value,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Added, waiting for its first commit.
    Pending,
    /// Backed by a row.
    Persistent,
    /// Marked for deletion at the next commit.
    Deleted,
    /// No longer tracked: deleted, or never made it to the database.
    Detached,
}

struct Entry<M> {
    current: M,
    /// Values as last read from or written to the database.
    snapshot: Option<M>,
    state: EntityState,
    /// Values written by the flush in progress, applied once it commits.
    staged: Option<M>,
    /// Caught by a cascade in the flush in progress.
    cascaded: bool,
    /// Pending insert cancelled by [`Session::delete`] since the last flush.
    cancelled: bool,
}

impl<M: Model> Entry<M> {
    /// State the flush in progress treats this entry as having.
    fn flush_state(&self) -> EntityState {
        match (self.cascaded, self.state) {
            (true, EntityState::Pending) => EntityState::Detached,
            (true, EntityState::Persistent) => EntityState::Deleted,
            (_, state) => state,
        }
    }

    /// Whether this entry stops existing with the flush in progress.
    fn leaves_with_flush(&self) -> bool {
        match self.flush_state() {
            EntityState::Deleted => true,
            EntityState::Detached => self.cascaded || self.cancelled,
            EntityState::Pending | EntityState::Persistent => false,
        }
    }

    fn is_dirty(&self) -> bool {
        match self.state {
            EntityState::Pending | EntityState::Deleted => true,
            EntityState::Persistent => self.snapshot.as_ref() != Some(&self.current),
            EntityState::Detached => false,
        }
    }
}

struct Tracked<M> {
    entries: Vec<Entry<M>>,
    by_id: HashMap<i64, usize>,
}

impl<M: Model> Tracked<M> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    fn push(&mut self, current: M, snapshot: Option<M>, state: EntityState) -> usize {
        let slot = self.entries.len();
        if let (Some(id), EntityState::Persistent) = (current.id(), state) {
            self.by_id.insert(id, slot);
        }
        self.entries.push(Entry {
            current,
            snapshot,
            state,
            staged: None,
            cascaded: false,
            cancelled: false,
        });
        slot
    }
}

/// Type-erased view of a [`Tracked`] store, used by the flush.
trait Store {
    fn table(&self) -> &'static str;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn pending_count(&self) -> usize;
    fn record_ids(&self, links: &mut Links);
    /// Ids of persistent rows marked for deletion.
    fn deleted_ids(&self) -> Vec<i64>;
    /// Slots of entities deleted or cancelled in this flush.
    fn gone_slots(&self) -> Vec<usize>;
    /// Stages a delete cascade from a parent; returns how many entities it caught.
    fn cascade(&mut self, session: u64, foreign_key: &str, ids: &[i64], slots: &[usize]) -> usize;
    /// Writes pending inserts and dirty updates; returns (inserted, updated).
    fn write(
        &mut self,
        conn: &Connection,
        table: &TableDefinition,
        links: &mut Links,
    ) -> Result<(usize, usize)>;
    fn finish(&mut self);
    fn discard(&mut self);
}

impl<M: Model> Store for Tracked<M> {
    fn table(&self) -> &'static str {
        M::TABLE
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn pending_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_dirty()).count()
    }

    fn record_ids(&self, links: &mut Links) {
        for (slot, entry) in self.entries.iter().enumerate() {
            if let (EntityState::Persistent | EntityState::Deleted, Some(id)) =
                (entry.state, entry.current.id())
            {
                links.insert(M::TABLE, slot, id);
            }
        }
    }

    fn deleted_ids(&self) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|e| e.flush_state() == EntityState::Deleted)
            .filter_map(|e| e.current.id())
            .collect()
    }

    fn gone_slots(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.leaves_with_flush())
            .map(|(slot, _)| slot)
            .collect()
    }

    fn cascade(&mut self, session: u64, foreign_key: &str, ids: &[i64], slots: &[usize]) -> usize {
        let mut caught = 0;
        for entry in &mut self.entries {
            let orphaned = match entry.current.parent(foreign_key) {
                Some(ParentRef::Id(id)) => ids.contains(&id),
                Some(ParentRef::Slot { session: s, slot }) => s == session && slots.contains(&slot),
                None => false,
            };
            let live = matches!(entry.state, EntityState::Pending | EntityState::Persistent);
            if orphaned && live && !entry.cascaded {
                entry.cascaded = true;
                caught += 1;
            }
        }
        caught
    }

    fn write(
        &mut self,
        conn: &Connection,
        table: &TableDefinition,
        links: &mut Links,
    ) -> Result<(usize, usize)> {
        let pk = primary_key(table);
        let (mut inserted, mut updated) = (0, 0);
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            match entry.flush_state() {
                EntityState::Pending => {
                    let mut row = entry.current.clone();
                    row.resolve_links(links)?;
                    let op = CrudOperation::Create(CreateOperation {
                        table: table.name.clone(),
                        data: physical(table, row.attributes())?,
                    });
                    let id = match execute_crud(conn, &op).map_err(|e| Error::from_write(&table.name, e))? {
                        CrudOutcome::Inserted(id) => id,
                        _ => conn.last_insert_rowid(),
                    };
                    row.assign_id(id);
                    links.insert(M::TABLE, slot, id);
                    entry.staged = Some(row);
                    inserted += 1;
                }
                EntityState::Persistent if entry.is_dirty() => {
                    let (Some(snapshot), Some(id)) = (&entry.snapshot, entry.current.id()) else {
                        continue;
                    };
                    let mut row = entry.current.clone();
                    row.resolve_links(links)?;
                    let before = snapshot.attributes();
                    let changed: Vec<(&'static str, Value)> = row
                        .attributes()
                        .into_iter()
                        .filter(|(attr, value)| {
                            before.iter().find(|(a, _)| a == attr).map(|(_, v)| v) != Some(value)
                        })
                        .collect();
                    if !changed.is_empty() {
                        let op = CrudOperation::Update(UpdateOperation {
                            table: table.name.clone(),
                            query: Query::new().with_equal(pk, id),
                            updates: physical(table, changed)?,
                        });
                        execute_crud(conn, &op).map_err(|e| Error::from_write(&table.name, e))?;
                        updated += 1;
                    }
                    entry.staged = Some(row);
                }
                _ => {}
            }
        }
        Ok((inserted, updated))
    }

    fn finish(&mut self) {
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            let state = entry.flush_state();
            entry.cascaded = false;
            entry.cancelled = false;
            match state {
                EntityState::Pending | EntityState::Persistent => {
                    if let Some(row) = entry.staged.take() {
                        if let Some(id) = row.id() {
                            self.by_id.insert(id, slot);
                        }
                        entry.snapshot = Some(row.clone());
                        entry.current = row;
                        entry.state = EntityState::Persistent;
                    }
                }
                EntityState::Deleted => {
                    if let Some(id) = entry.current.id() {
                        self.by_id.remove(&id);
                    }
                    entry.snapshot = None;
                    entry.state = EntityState::Detached;
                }
                EntityState::Detached => {
                    entry.staged = None;
                    entry.state = EntityState::Detached;
                }
            }
        }
    }

    fn discard(&mut self) {
        for entry in &mut self.entries {
            entry.staged = None;
            entry.cascaded = false;
            entry.cancelled = false;
            match entry.state {
                EntityState::Pending => entry.state = EntityState::Detached,
                EntityState::Persistent | EntityState::Deleted => {
                    if let Some(snapshot) = &entry.snapshot {
                        entry.current = snapshot.clone();
                    }
                    entry.state = EntityState::Persistent;
                }
                EntityState::Detached => {}
            }
        }
    }
}

fn primary_key(table: &TableDefinition) -> &str {
    table.primary_key.first().map_or("id", String::as_str)
}

fn physical(table: &TableDefinition, values: Vec<(&'static str, Value)>) -> Result<Vec<(String, Value)>> {
    values
        .into_iter()
        .map(|(attr, value)| Ok((table.column_name(attr)?.to_string(), value)))
        .collect()
}

/// Row counts written by one commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

/// A scoped unit of work. See the [module docs](self).
pub struct Session<'db> {
    id: u64,
    conn: &'db Connection,
    schema: &'db Schema,
    /// One store per model type, kept in schema order.
    stores: Vec<Box<dyn Store>>,
}

impl<'db> Session<'db> {
    pub(crate) fn new(conn: &'db Connection, schema: &'db Schema) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, "session opened");
        Self {
            id,
            conn,
            schema,
            stores: Vec::new(),
        }
    }

    fn table_def(&self, table: &str) -> Result<&'db TableDefinition> {
        self.schema.table(table).ok_or_else(|| Error::UnknownTable {
            table: table.to_string(),
        })
    }

    fn tracked<M: Model>(&self) -> Option<&Tracked<M>> {
        self.stores
            .iter()
            .find_map(|s| s.as_any().downcast_ref::<Tracked<M>>())
    }

    fn tracked_mut<M: Model>(&mut self) -> Result<&mut Tracked<M>> {
        let idx = match self.stores.iter().position(|s| s.as_any().is::<Tracked<M>>()) {
            Some(idx) => idx,
            None => {
                let position = self.schema.position(M::TABLE);
                let idx = self
                    .stores
                    .iter()
                    .position(|s| self.schema.position(s.table()) > position)
                    .unwrap_or(self.stores.len());
                self.stores.insert(idx, Box::new(Tracked::<M>::new()));
                idx
            }
        };
        self.stores[idx]
            .as_any_mut()
            .downcast_mut::<Tracked<M>>()
            .ok_or_else(|| Error::UnknownTable {
                table: M::TABLE.to_string(),
            })
    }

    fn entry<M: Model>(&self, handle: &Handle<M>) -> Option<&Entry<M>> {
        if handle.session != self.id {
            return None;
        }
        self.tracked::<M>()?.entries.get(handle.slot)
    }

    fn entry_mut<M: Model>(&mut self, handle: &Handle<M>) -> Result<&mut Entry<M>> {
        if handle.session != self.id {
            return Err(Error::UnknownHandle { table: M::TABLE });
        }
        self.tracked_mut::<M>()?
            .entries
            .get_mut(handle.slot)
            .ok_or(Error::UnknownHandle { table: M::TABLE })
    }

    /// Starts tracking `entity`; it is inserted at the next commit.
    ///
    /// An entity that already carries an id is attached as persistent
    /// instead, so only later edits are written. If that row is already
    /// tracked, the existing handle is returned and `entity` is dropped.
    pub fn add<M: Model>(&mut self, entity: M) -> Result<Handle<M>> {
        let session = self.id;
        let store = self.tracked_mut::<M>()?;
        let slot = match entity.id() {
            Some(id) => match store.by_id.get(&id).copied() {
                Some(slot) => slot,
                None => store.push(entity.clone(), Some(entity), EntityState::Persistent),
            },
            None => store.push(entity, None, EntityState::Pending),
        };
        Ok(Handle::new(session, slot))
    }

    /// Marks an entity for deletion at the next commit.
    ///
    /// A pending entity is simply dropped from the unit of work.
    pub fn delete<M: Model>(&mut self, handle: &Handle<M>) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        match entry.state {
            EntityState::Pending => {
                entry.state = EntityState::Detached;
                entry.cancelled = true;
            }
            EntityState::Persistent => entry.state = EntityState::Deleted,
            EntityState::Deleted | EntityState::Detached => {}
        }
        Ok(())
    }

    pub fn get<M: Model>(&self, handle: &Handle<M>) -> Option<&M> {
        self.entry(handle).map(|e| &e.current)
    }

    /// Mutable access to a tracked entity. Edits are detected at commit.
    pub fn get_mut<M: Model>(&mut self, handle: &Handle<M>) -> Option<&mut M> {
        self.entry_mut(handle).ok().map(|e| &mut e.current)
    }

    pub fn state<M: Model>(&self, handle: &Handle<M>) -> Option<EntityState> {
        self.entry(handle).map(|e| e.state)
    }

    /// Number of entities with changes waiting for a commit.
    pub fn pending_count(&self) -> usize {
        self.stores.iter().map(|s| s.pending_count()).sum()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Writes every pending change in one transaction.
    ///
    /// On failure the transaction is rolled back and the session is left as
    /// after [`Session::rollback`]: pending entities are detached without an
    /// id, deletes and edits revert to the last persisted values.
    pub fn commit(&mut self) -> Result<FlushStats> {
        if !self.has_pending() {
            for store in &mut self.stores {
                store.finish();
            }
            tracing::debug!(session = self.id, "commit with nothing pending");
            return Ok(FlushStats::default());
        }
        let conn = self.conn;
        let tx = conn.unchecked_transaction()?;
        let outcome = match self.flush(&tx) {
            Ok(stats) => tx.commit().map(|()| stats).map_err(Error::from),
            Err(err) => {
                drop(tx);
                Err(err)
            }
        };
        match outcome {
            Ok(stats) => {
                for store in &mut self.stores {
                    store.finish();
                }
                tracing::info!(
                    session = self.id,
                    inserted = stats.inserted,
                    updated = stats.updated,
                    deleted = stats.deleted,
                    "committed"
                );
                Ok(stats)
            }
            Err(err) => {
                for store in &mut self.stores {
                    store.discard();
                }
                tracing::warn!(session = self.id, error = %err, "commit failed, rolled back");
                Err(err)
            }
        }
    }

    fn flush(&mut self, conn: &Connection) -> Result<FlushStats> {
        let schema = self.schema;
        let session = self.id;
        let mut links = Links::new(session);
        for store in &self.stores {
            store.record_ids(&mut links);
        }

        let mut deletes: Vec<DeleteOperation> = Vec::new();
        for idx in 0..self.stores.len() {
            let table = self.stores[idx].table();
            let ids = self.stores[idx].deleted_ids();
            let slots = self.stores[idx].gone_slots();
            if !ids.is_empty() {
                let pk = primary_key(self.table_def(table)?);
                let ids_in = ids.iter().copied().map(Value::Integer).collect();
                deletes.push(DeleteOperation {
                    table: table.to_string(),
                    query: Query::new().with_condition(pk, QueryOperator::In(ids_in)),
                });
            }
            for rule in schema.cascades_from(table) {
                let child = self.table_def(&rule.child_table)?;
                let foreign_key = child
                    .attribute_of(&rule.foreign_key)
                    .unwrap_or(rule.foreign_key.as_str());
                if let Some(store) = self.stores.iter_mut().find(|s| s.table() == child.name) {
                    let caught = store.cascade(session, foreign_key, &ids, &slots);
                    if caught > 0 {
                        tracing::debug!(parent = table, child = %child.name, caught, "cascade caught tracked children");
                    }
                }
                if let Some(op) = rule.plan_delete(&ids) {
                    tracing::debug!(parent = table, child = %op.table, parents = ids.len(), "cascading delete");
                    deletes.push(op);
                }
            }
        }

        let mut stats = FlushStats::default();
        for store in &mut self.stores {
            let table = schema.table(store.table()).ok_or_else(|| Error::UnknownTable {
                table: store.table().to_string(),
            })?;
            let (inserted, updated) = store.write(conn, table, &mut links)?;
            stats.inserted += inserted;
            stats.updated += updated;
        }

        deletes.sort_by_key(|op| Reverse(schema.position(&op.table)));
        for op in deletes {
            let table = op.table.clone();
            if let CrudOutcome::Affected(n) = execute_crud(conn, &CrudOperation::Delete(op))
                .map_err(|e| Error::from_write(&table, e))?
            {
                stats.deleted += n;
            }
        }
        Ok(stats)
    }

    /// Discards every pending change. Loaded entities revert to the values
    /// last read from the database.
    pub fn rollback(&mut self) {
        let pending = self.pending_count();
        for store in &mut self.stores {
            store.discard();
        }
        tracing::debug!(session = self.id, pending, "rolled back");
    }

    /// Re-reads an entity's row, replacing its in-memory values.
    pub fn refresh<M: Model>(&mut self, handle: &Handle<M>) -> Result<()> {
        let entry = self.entry(handle).ok_or(Error::UnknownHandle { table: M::TABLE })?;
        let id = match (entry.state, entry.current.id()) {
            (EntityState::Pending, _) | (_, None) => return Err(Error::NotPersistent { table: M::TABLE }),
            (_, Some(id)) => id,
        };
        let pk = primary_key(self.table_def(M::TABLE)?).to_string();
        let mut rows = self.fetch::<M>(Query::new().with_equal(&pk, id), Vec::new(), Some(1), true)?;
        let fresh = rows.pop().ok_or(Error::ObjectDeleted { table: M::TABLE, id })?;
        let entry = self.entry_mut(handle)?;
        entry.snapshot = Some(fresh.clone());
        entry.current = fresh;
        Ok(())
    }

    /// Starts a query over `M`'s table.
    pub fn query<M: Model>(&mut self) -> Select<'_, 'db, M> {
        Select {
            session: self,
            query: Query::new(),
            order_by: Vec::new(),
            limit: None,
            _model: PhantomData,
        }
    }

    /// First entity whose `attribute` equals `value`.
    pub fn find_by<M: Model>(&mut self, attribute: &str, value: impl Into<Value>) -> Result<Option<Handle<M>>> {
        self.query::<M>().filter_by(attribute, value).first()
    }

    /// Children of `parent` through the relationship declared between their tables.
    pub fn related<P: Model, C: Model>(&mut self, parent: &Handle<P>) -> Result<Vec<Handle<C>>> {
        let relationship = self
            .schema
            .relationship(P::TABLE, C::TABLE)
            .ok_or(Error::UnknownRelationship {
                parent: P::TABLE,
                child: C::TABLE,
            })?;
        let id = self
            .get(parent)
            .ok_or(Error::UnknownHandle { table: P::TABLE })?
            .id()
            .ok_or(Error::NotPersistent { table: P::TABLE })?;
        let child = self.table_def(C::TABLE)?;
        let foreign_key = child
            .attribute_of(&relationship.foreign_key)
            .unwrap_or(relationship.foreign_key.as_str());
        self.query::<C>().filter_by(foreign_key, id).all()
    }

    /// Reads rows of `M` matching a query on logical attributes.
    ///
    /// `physical` marks a query already expressed in column names.
    fn fetch<M: Model>(
        &self,
        query: Query,
        order_by: Vec<(String, bool)>,
        limit: Option<u32>,
        physical: bool,
    ) -> Result<Vec<M>> {
        let table = self.table_def(M::TABLE)?;
        let query = if physical { query } else { table.translate(&query)? };
        let order_by = order_by
            .into_iter()
            .map(|(attr, asc)| Ok((table.column_name(&attr)?.to_string(), asc)))
            .collect::<Result<Vec<_>>>()?;
        let op = ReadOperation {
            query,
            fields: Some(table.column_names()),
            limit,
            order_by: Some(order_by).filter(|o| !o.is_empty()),
            ..ReadOperation::new(&table.name)
        };
        let rows = select(self.conn, op)?;
        rows.into_iter()
            .map(|row| {
                let mut record = Record::new(&table.name);
                for (column, value) in row {
                    let attribute = table.attribute_of(&column).unwrap_or(column.as_str()).to_string();
                    record.values.insert(attribute, value);
                }
                M::from_record(&record)
            })
            .collect()
    }

    /// Puts a freshly read entity into the identity map.
    ///
    /// A row that is already tracked keeps its in-memory values.
    fn attach_loaded<M: Model>(&mut self, entity: M) -> Result<Handle<M>> {
        let session = self.id;
        let store = self.tracked_mut::<M>()?;
        let slot = match entity.id().and_then(|id| store.by_id.get(&id).copied()) {
            Some(slot) => slot,
            None => store.push(entity.clone(), Some(entity), EntityState::Persistent),
        };
        Ok(Handle::new(session, slot))
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        let pending = self.pending_count();
        if pending > 0 {
            tracing::debug!(session = self.id, pending, "session closed, discarding uncommitted changes");
        } else {
            tracing::debug!(session = self.id, "session closed");
        }
    }
}

/// A query under construction. Attribute names are logical.
pub struct Select<'s, 'db, M> {
    session: &'s mut Session<'db>,
    query: Query,
    order_by: Vec<(String, bool)>,
    limit: Option<u32>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Select<'_, '_, M> {
    pub fn filter(mut self, attribute: &str, op: QueryOperator) -> Self {
        self.query = self.query.with_condition(attribute, op);
        self
    }

    /// Exact-match filter.
    pub fn filter_by(self, attribute: &str, value: impl Into<Value>) -> Self {
        self.filter(attribute, QueryOperator::Equal(value.into()))
    }

    pub fn order_by(mut self, attribute: &str, ascending: bool) -> Self {
        self.order_by.push((attribute.to_string(), ascending));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Every matching row, in the order the engine returns them unless
    /// [`Select::order_by`] was used.
    pub fn all(self) -> Result<Vec<Handle<M>>> {
        let rows = self
            .session
            .fetch::<M>(self.query, self.order_by, self.limit, false)?;
        rows.into_iter()
            .map(|row| self.session.attach_loaded(row))
            .collect()
    }

    /// The first matching row, if any.
    pub fn first(self) -> Result<Option<Handle<M>>> {
        Ok(self.limit(1).all()?.into_iter().next())
    }
}
