//! In-process backing store for entitymap.
//!
//! [`MemoryStore`] keeps tables in memory and implements [`BackingStore`]
//! with the same observable behavior a SQL store would have:
//!
//! - rows are stored per table, so two entity types mapped to one table
//!   see the same rows
//! - auto-increment primary keys are assigned on insert
//! - each handle has its own transaction with an undo log and named
//!   savepoints; data is shared between clones of a store (no isolation)
//! - every statement is counted in [`StoreStats`], which is how tests prove
//!   that eager loading issues one query per relationship level
//! - [`MemoryStore::fail_next`] makes the next statement of a kind fail

use asupersync::{Cx, Outcome};
use entitymap_core::error::{
    ColumnError, StoreError, StoreErrorKind, TransactionError, TransactionErrorKind,
};
use entitymap_core::{
    BackingStore, ColumnInfo, EntityRecord, EntitySchema, Error, IdentityKey, JoinTable,
    LinkedRow, Result, Row, Value,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Columns = HashMap<&'static str, Value>;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<u64, Columns>,
    /// Last value handed out by auto-increment
    last_auto: i64,
}

impl Table {
    fn find(&self, key: &IdentityKey) -> Option<u64> {
        self.rows
            .iter()
            .find(|(_, row)| matches_key(row, key))
            .map(|(rowid, _)| *rowid)
    }
}

#[derive(Debug, Default)]
struct Database {
    tables: HashMap<&'static str, Table>,
    /// Join table name -> (source tuple, target tuple) pairs
    links: HashMap<&'static str, Vec<(Vec<Value>, Vec<Value>)>>,
    next_rowid: u64,
}

impl Database {
    #[allow(clippy::result_large_err)]
    fn table(&self, schema: &EntitySchema) -> Result<&Table> {
        self.tables
            .get(schema.table)
            .ok_or_else(|| unregistered(schema))
    }

    #[allow(clippy::result_large_err)]
    fn table_mut(&mut self, schema: &EntitySchema) -> Result<&mut Table> {
        self.tables
            .get_mut(schema.table)
            .ok_or_else(|| unregistered(schema))
    }

    fn apply_undo(&mut self, entries: Vec<Undo>) {
        for entry in entries.into_iter().rev() {
            match entry {
                Undo::Inserted { table, rowid } => {
                    if let Some(t) = self.tables.get_mut(table) {
                        t.rows.remove(&rowid);
                    }
                }
                Undo::Deleted { table, rowid, row }
                | Undo::Updated {
                    table,
                    rowid,
                    previous: row,
                } => {
                    if let Some(t) = self.tables.get_mut(table) {
                        t.rows.insert(rowid, row);
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum Undo {
    Inserted {
        table: &'static str,
        rowid: u64,
    },
    Deleted {
        table: &'static str,
        rowid: u64,
        row: Columns,
    },
    Updated {
        table: &'static str,
        rowid: u64,
        previous: Columns,
    },
}

#[derive(Debug, Default)]
struct Transaction {
    active: bool,
    undo: Vec<Undo>,
    /// Savepoint name and undo-log length when it was set
    savepoints: Vec<(String, usize)>,
}

/// Statement kinds, for [`MemoryStore::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Load,
    BatchLoad,
    LinkedLoad,
    Insert,
    Update,
    Delete,
    Commit,
}

#[derive(Debug, Default)]
struct Counters {
    loads: AtomicU64,
    batch_loads: AtomicU64,
    linked_loads: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Snapshot of statement counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub loads: u64,
    pub batch_loads: u64,
    pub linked_loads: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl StoreStats {
    /// Read statements of any kind.
    pub fn queries(&self) -> u64 {
        self.loads + self.batch_loads + self.linked_loads
    }

    /// Write statements of any kind.
    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// In-memory [`BackingStore`].
///
/// Cloning yields a new handle onto the same data with its own
/// transaction; statistics and injected failures are shared.
pub struct MemoryStore {
    db: Arc<Mutex<Database>>,
    counters: Arc<Counters>,
    faults: Arc<Mutex<Vec<StoreOp>>>,
    tx: Mutex<Transaction>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            db: Arc::new(Mutex::new(Database::default())),
            counters: Arc::new(Counters::default()),
            faults: Arc::new(Mutex::new(Vec::new())),
            tx: Mutex::new(Transaction::default()),
        }
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tx(&self) -> MutexGuard<'_, Transaction> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the table of `schema` if it does not exist yet.
    #[allow(clippy::result_large_err)]
    pub fn register(&self, schema: &'static EntitySchema) -> Result<()> {
        schema.validate()?;
        self.db().tables.entry(schema.table).or_default();
        tracing::debug!(entity = schema.name, table = schema.table, "Registered table");
        Ok(())
    }

    /// Insert a row outside any transaction and without counting it.
    #[allow(clippy::result_large_err)]
    pub fn seed(&self, record: &EntityRecord) -> Result<IdentityKey> {
        self.insert_row(record).map(|(key, _)| key)
    }

    /// Add a join-table link between a source and a target key tuple.
    pub fn link(&self, join: &JoinTable, source: &[Value], target: &[Value]) {
        let canonical =
            |values: &[Value]| -> Vec<Value> { values.iter().cloned().map(Value::canonical).collect() };
        self.db()
            .links
            .entry(join.table)
            .or_default()
            .push((canonical(source), canonical(target)));
    }

    /// Read a row without counting a statement.
    pub fn peek(&self, schema: &'static EntitySchema, key: &IdentityKey) -> Option<Row> {
        let db = self.db();
        let table = db.table(schema).ok()?;
        let rowid = table.find(key)?;
        Some(to_row(&column_info(schema), schema, &table.rows[&rowid]))
    }

    /// Rows currently stored in the table of `schema`.
    pub fn row_count(&self, schema: &EntitySchema) -> usize {
        self.db()
            .tables
            .get(schema.table)
            .map_or(0, |t| t.rows.len())
    }

    /// Whether this handle has an open transaction.
    pub fn in_transaction(&self) -> bool {
        self.tx().active
    }

    pub fn stats(&self) -> StoreStats {
        let c = &self.counters;
        StoreStats {
            loads: c.loads.load(Ordering::Relaxed),
            batch_loads: c.batch_loads.load(Ordering::Relaxed),
            linked_loads: c.linked_loads.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            updates: c.updates.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.loads,
            &c.batch_loads,
            &c.linked_loads,
            &c.inserts,
            &c.updates,
            &c.deletes,
            &c.commits,
            &c.rollbacks,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Make the next statement of kind `op` (on any handle) fail.
    pub fn fail_next(&self, op: StoreOp) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op);
    }

    #[allow(clippy::result_large_err)]
    fn check_fault(&self, op: StoreOp) -> Result<()> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(idx) = faults.iter().position(|f| *f == op) {
            faults.remove(idx);
            tracing::debug!(op = ?op, "Injected store failure");
            return Err(Error::Store(StoreError {
                kind: StoreErrorKind::Unavailable,
                entity: None,
                message: format!("injected {op:?} failure"),
                source: None,
            }));
        }
        Ok(())
    }

    fn log(&self, undo: Undo) {
        let mut tx = self.tx();
        if tx.active {
            tx.undo.push(undo);
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    #[allow(clippy::result_large_err)]
    fn load_sync(&self, schema: &'static EntitySchema, key: &IdentityKey) -> Result<Option<Row>> {
        self.check_fault(StoreOp::Load)?;
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        let db = self.db();
        let table = db.table(schema)?;
        let row = table
            .find(key)
            .map(|rowid| to_row(&column_info(schema), schema, &table.rows[&rowid]));
        tracing::trace!(key = %key, found = row.is_some(), "load");
        Ok(row)
    }

    #[allow(clippy::result_large_err)]
    fn batch_load_sync(
        &self,
        schema: &'static EntitySchema,
        columns: &[&'static str],
        tuples: &[Vec<Value>],
    ) -> Result<Vec<Row>> {
        self.check_fault(StoreOp::BatchLoad)?;
        if let Some(unknown) = columns.iter().find(|c| schema.column(c).is_none()) {
            return Err(Error::UnknownColumn(ColumnError {
                entity: schema.name,
                column: (*unknown).to_string(),
            }));
        }
        self.counters.batch_loads.fetch_add(1, Ordering::Relaxed);

        let db = self.db();
        let table = db.table(schema)?;
        let info = column_info(schema);
        let rows: Vec<Row> = table
            .rows
            .values()
            .filter(|row| {
                tuples.iter().any(|tuple| {
                    columns
                        .iter()
                        .zip(tuple)
                        .all(|(c, v)| row.get(c).is_some_and(|x| x.same_as(v)))
                })
            })
            .map(|row| to_row(&info, schema, row))
            .collect();
        tracing::debug!(
            table = schema.table,
            columns = ?columns,
            keys = tuples.len(),
            rows = rows.len(),
            "batch_load"
        );
        Ok(rows)
    }

    #[allow(clippy::result_large_err)]
    fn batch_load_linked_sync(
        &self,
        join: &JoinTable,
        target: &'static EntitySchema,
        sources: &[Vec<Value>],
    ) -> Result<Vec<LinkedRow>> {
        self.check_fault(StoreOp::LinkedLoad)?;
        self.counters.linked_loads.fetch_add(1, Ordering::Relaxed);

        let db = self.db();
        let table = db.table(target)?;
        let info = column_info(target);
        let pk = target.primary_key_names();
        let links = db.links.get(join.table).map_or(&[][..], Vec::as_slice);

        let mut out = Vec::new();
        for source in sources {
            for (linked_source, linked_target) in links {
                if !same_tuple(linked_source, source) {
                    continue;
                }
                let found = table.rows.values().find(|row| {
                    pk.iter()
                        .zip(linked_target)
                        .all(|(c, v)| row.get(c).is_some_and(|x| x.same_as(v)))
                });
                if let Some(row) = found {
                    out.push((linked_source.clone(), to_row(&info, target, row)));
                }
            }
        }
        tracing::debug!(join = join.table, sources = sources.len(), rows = out.len(), "batch_load_linked");
        Ok(out)
    }

    /// Insert without counting or fault injection.
    #[allow(clippy::result_large_err)]
    fn insert_row(&self, record: &EntityRecord) -> Result<(IdentityKey, u64)> {
        let schema = record.schema();
        let mut db = self.db();
        db.next_rowid += 1;
        let rowid = db.next_rowid;
        let table = db.table_mut(schema)?;

        let mut row = Columns::with_capacity(schema.columns.len());
        let mut values = Vec::with_capacity(schema.columns.len());
        for (col, value) in schema.columns.iter().zip(record.value_slice()) {
            let value = if value.is_default() {
                if col.auto_increment {
                    table.last_auto += 1;
                    Value::BigInt(table.last_auto)
                } else {
                    Value::Null
                }
            } else {
                if col.auto_increment {
                    if let Some(n) = value.as_i64() {
                        table.last_auto = table.last_auto.max(n);
                    }
                }
                value.clone().canonical()
            };
            values.push(value.clone());
            row.insert(col.name, value);
        }

        let key = IdentityKey::from_values(schema, &values)?;
        if table.find(&key).is_some() {
            return Err(Error::Store(StoreError {
                kind: StoreErrorKind::Constraint,
                entity: Some(schema.name),
                message: format!("duplicate primary key {key}"),
                source: None,
            }));
        }
        table.rows.insert(rowid, row);
        Ok((key, rowid))
    }

    #[allow(clippy::result_large_err)]
    fn insert_sync(&self, record: &EntityRecord) -> Result<IdentityKey> {
        self.check_fault(StoreOp::Insert)?;
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
        let (key, rowid) = self.insert_row(record)?;
        self.log(Undo::Inserted {
            table: record.schema().table,
            rowid,
        });
        tracing::trace!(key = %key, "insert");
        Ok(key)
    }

    #[allow(clippy::result_large_err)]
    fn update_sync(&self, record: &EntityRecord, changed: &[&'static str]) -> Result<()> {
        self.check_fault(StoreOp::Update)?;
        self.counters.updates.fetch_add(1, Ordering::Relaxed);
        let schema = record.schema();
        let previous = {
            let mut db = self.db();
            let table = db.table_mut(schema)?;
            let rowid = table
                .find(record.key())
                .ok_or_else(|| Error::not_found(schema.name, record.key()))?;
            let Some(row) = table.rows.get_mut(&rowid) else {
                return Err(Error::not_found(schema.name, record.key()));
            };
            let previous = row.clone();
            for column in changed {
                row.insert(*column, record.get(column)?.clone().canonical());
            }
            (rowid, previous)
        };
        self.log(Undo::Updated {
            table: schema.table,
            rowid: previous.0,
            previous: previous.1,
        });
        tracing::trace!(key = %record.key(), columns = ?changed, "update");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn delete_sync(&self, schema: &'static EntitySchema, key: &IdentityKey) -> Result<bool> {
        self.check_fault(StoreOp::Delete)?;
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let removed = {
            let mut db = self.db();
            let table = db.table_mut(schema)?;
            table
                .find(key)
                .and_then(|rowid| table.rows.remove(&rowid).map(|row| (rowid, row)))
        };
        tracing::trace!(key = %key, existed = removed.is_some(), "delete");
        Ok(match removed {
            Some((rowid, row)) => {
                self.log(Undo::Deleted {
                    table: schema.table,
                    rowid,
                    row,
                });
                true
            }
            None => false,
        })
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    #[allow(clippy::result_large_err)]
    fn begin_sync(&self) -> Result<()> {
        let mut tx = self.tx();
        if tx.active {
            return Err(transaction_error(
                TransactionErrorKind::AlreadyActive,
                "transaction already active on this handle",
            ));
        }
        *tx = Transaction {
            active: true,
            ..Transaction::default()
        };
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn commit_sync(&self) -> Result<()> {
        self.check_fault(StoreOp::Commit)?;
        let mut tx = self.tx();
        if !tx.active {
            return Err(not_active());
        }
        *tx = Transaction::default();
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback_sync(&self) {
        let undo = std::mem::take(&mut *self.tx()).undo;
        let undone = undo.len();
        self.db().apply_undo(undo);
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(undone, "rollback");
    }

    #[allow(clippy::result_large_err)]
    fn savepoint_sync(&self, name: &str) -> Result<()> {
        let mut tx = self.tx();
        if !tx.active {
            return Err(not_active());
        }
        let mark = tx.undo.len();
        tx.savepoints.push((name.to_string(), mark));
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn savepoint_index(tx: &Transaction, name: &str) -> Result<usize> {
        if !tx.active {
            return Err(not_active());
        }
        tx.savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| {
                transaction_error(
                    TransactionErrorKind::SavepointNotFound,
                    format!("savepoint '{name}' does not exist"),
                )
            })
    }

    #[allow(clippy::result_large_err)]
    fn rollback_to_sync(&self, name: &str) -> Result<()> {
        let undo = {
            let mut tx = self.tx();
            let idx = Self::savepoint_index(&tx, name)?;
            let mark = tx.savepoints[idx].1;
            tx.savepoints.truncate(idx);
            tx.undo.split_off(mark)
        };
        tracing::debug!(savepoint = name, undone = undo.len(), "rollback to savepoint");
        self.db().apply_undo(undo);
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn release_sync(&self, name: &str) -> Result<()> {
        let mut tx = self.tx();
        let idx = Self::savepoint_index(&tx, name)?;
        tx.savepoints.truncate(idx);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            counters: Arc::clone(&self.counters),
            faults: Arc::clone(&self.faults),
            tx: Mutex::new(Transaction::default()),
        }
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("tables", &self.db().tables.len())
            .field("in_transaction", &self.in_transaction())
            .field("stats", &self.stats())
            .finish()
    }
}

impl BackingStore for MemoryStore {
    fn load(
        &self,
        cx: &Cx,
        schema: &'static EntitySchema,
        key: &IdentityKey,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        statement(cx, move || self.load_sync(schema, key))
    }

    fn batch_load(
        &self,
        cx: &Cx,
        schema: &'static EntitySchema,
        columns: &[&'static str],
        tuples: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        statement(cx, move || self.batch_load_sync(schema, columns, tuples))
    }

    fn batch_load_linked(
        &self,
        cx: &Cx,
        join: &JoinTable,
        target: &'static EntitySchema,
        sources: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<LinkedRow>, Error>> + Send {
        statement(cx, move || self.batch_load_linked_sync(join, target, sources))
    }

    fn insert(
        &self,
        cx: &Cx,
        record: &EntityRecord,
    ) -> impl Future<Output = Outcome<IdentityKey, Error>> + Send {
        statement(cx, move || self.insert_sync(record))
    }

    fn update(
        &self,
        cx: &Cx,
        record: &EntityRecord,
        changed: &[&'static str],
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        statement(cx, move || self.update_sync(record, changed))
    }

    fn delete(
        &self,
        cx: &Cx,
        schema: &'static EntitySchema,
        key: &IdentityKey,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send {
        statement(cx, move || self.delete_sync(schema, key))
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        statement(cx, move || self.begin_sync())
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        statement(cx, move || self.commit_sync())
    }

    // Undo runs even for a cancelled context.
    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.rollback_sync();
        async move { Outcome::Ok(()) }
    }

    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        statement(cx, move || self.savepoint_sync(name))
    }

    fn rollback_to(&self, _cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_to_sync(name);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn release(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send {
        statement(cx, move || self.release_sync(name))
    }
}

/// Run one statement unless the context is already cancelled.
fn statement<T: Send>(
    cx: &Cx,
    run: impl FnOnce() -> Result<T>,
) -> impl Future<Output = Outcome<T, Error>> + Send {
    let outcome = match cx.cancel_reason() {
        Some(reason) => Outcome::Cancelled(reason),
        None => run().map_or_else(Outcome::Err, Outcome::Ok),
    };
    async move { outcome }
}

fn matches_key(row: &Columns, key: &IdentityKey) -> bool {
    key.components()
        .iter()
        .all(|(name, value)| row.get(name).is_some_and(|v| v.same_as(value)))
}

fn same_tuple(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
}

fn column_info(schema: &EntitySchema) -> Arc<ColumnInfo> {
    Arc::new(ColumnInfo::new(
        schema.columns.iter().map(|c| c.name.to_string()).collect(),
    ))
}

fn to_row(info: &Arc<ColumnInfo>, schema: &EntitySchema, row: &Columns) -> Row {
    Row::with_columns(
        Arc::clone(info),
        schema
            .columns
            .iter()
            .map(|c| row.get(c.name).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

fn unregistered(schema: &EntitySchema) -> Error {
    Error::Store(StoreError {
        kind: StoreErrorKind::Other,
        entity: Some(schema.name),
        message: format!("table '{}' is not registered", schema.table),
        source: None,
    })
}

fn transaction_error(kind: TransactionErrorKind, message: impl Into<String>) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.into(),
    })
}

fn not_active() -> Error {
    transaction_error(
        TransactionErrorKind::NotActive,
        "no transaction active on this handle",
    )
}
