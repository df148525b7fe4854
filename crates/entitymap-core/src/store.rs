//! The backing store abstraction.
//!
//! A [`BackingStore`] is the only place where an entitymap unit of work
//! touches persistent state. It works in terms of schemas, identity keys and
//! rows; how those map onto SQL (or anything else) is up to the
//! implementation.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation, and report through `Outcome`.

use crate::error::Error;
use crate::identity::IdentityKey;
use crate::record::EntityRecord;
use crate::relationship::JoinTable;
use crate::row::Row;
use crate::schema::EntitySchema;
use crate::value::Value;
use asupersync::{Cx, Outcome};

/// A target row together with the source key tuple it was linked from.
pub type LinkedRow = (Vec<Value>, Row);

/// Persistent storage used by a unit of work.
///
/// Transactions are per handle: `begin` starts one, `commit`/`rollback` end
/// it, and savepoints nest inside it by name.
///
/// ```rust,ignore
/// store.begin(&cx).await.unwrap();
/// let key = store.insert(&cx, &record).await.unwrap();
/// store.savepoint(&cx, "before_delete").await.unwrap();
/// store.delete(&cx, &PET, &key).await.unwrap();
/// store.rollback_to(&cx, "before_delete").await.unwrap();
/// store.commit(&cx).await.unwrap();
/// ```
pub trait BackingStore: Send + Sync {
    /// Load one row by identity.
    fn load(
        &self,
        cx: &Cx,
        schema: &'static EntitySchema,
        key: &IdentityKey,
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;

    /// Load every row of `schema` whose `columns` match one of `tuples`.
    ///
    /// This is one query with `IN (...)` semantics. Each tuple lines up with
    /// `columns`. Rows come back in no particular order.
    fn batch_load(
        &self,
        cx: &Cx,
        schema: &'static EntitySchema,
        columns: &[&'static str],
        tuples: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Load target rows linked through `join` to any of `sources`.
    ///
    /// One query joining the link table with the target table, filtered on
    /// the join's source columns. Each result carries the source tuple it
    /// matched, so a target linked to several sources appears once per
    /// source.
    fn batch_load_linked(
        &self,
        cx: &Cx,
        join: &JoinTable,
        target: &'static EntitySchema,
        sources: &[Vec<Value>],
    ) -> impl Future<Output = Outcome<Vec<LinkedRow>, Error>> + Send;

    /// Insert a new record and return its final identity.
    ///
    /// Pending (auto-increment) key components are assigned by the store.
    fn insert(
        &self,
        cx: &Cx,
        record: &EntityRecord,
    ) -> impl Future<Output = Outcome<IdentityKey, Error>> + Send;

    /// Write `changed` columns of an existing record.
    fn update(
        &self,
        cx: &Cx,
        record: &EntityRecord,
        changed: &[&'static str],
    ) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Delete one row. Returns whether a row existed.
    fn delete(
        &self,
        cx: &Cx,
        schema: &'static EntitySchema,
        key: &IdentityKey,
    ) -> impl Future<Output = Outcome<bool, Error>> + Send;

    /// Begin a transaction on this handle.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the current transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the current transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Create a savepoint inside the current transaction.
    fn savepoint(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Undo everything done since the named savepoint. The savepoint is
    /// removed together with every later one.
    fn rollback_to(&self, cx: &Cx, name: &str)
    -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Forget the named savepoint, keeping its changes.
    fn release(&self, cx: &Cx, name: &str) -> impl Future<Output = Outcome<(), Error>> + Send;
}
