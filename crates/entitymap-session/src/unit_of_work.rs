//! Pending writes of a unit of work.
//!
//! The write set holds the authoritative copy of every record that was
//! created, modified or deleted since the last flush. It is kept apart from
//! the cache so that cache eviction can never drop an unwritten change.

use crate::flush::{FlushOrderer, FlushPlan, PendingOp};
use entitymap_core::{EntityRecord, IdentityKey};
use serde::Serialize;
use std::collections::HashMap;

/// Records awaiting flush, in the order they were first touched.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    records: HashMap<IdentityKey, EntityRecord>,
    order: Vec<IdentityKey>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    pub fn get_mut(&mut self, key: &IdentityKey) -> Option<&mut EntityRecord> {
        self.records.get_mut(key)
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.records.contains_key(key)
    }

    /// Add or replace a pending record.
    pub fn stage(&mut self, record: EntityRecord) {
        let key = record.key().clone();
        if self.records.insert(key.clone(), record).is_none() {
            self.order.push(key);
        }
    }

    /// Drop a pending record without writing it.
    pub fn discard(&mut self, key: &IdentityKey) -> Option<EntityRecord> {
        let removed = self.records.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    /// Pending records in staging order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityRecord> {
        self.order.iter().filter_map(|k| self.records.get(k))
    }

    /// Pending records of one entity type, in staging order.
    pub fn of_entity<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a EntityRecord> {
        self.iter().filter(move |r| r.entity() == entity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }

    /// Whether flushing would write anything.
    pub fn has_changes(&self) -> bool {
        self.iter().any(|r| PendingOp::for_record(r).is_some())
    }

    /// Count of pending operations by kind.
    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for op in self.iter().filter_map(PendingOp::for_record) {
            match op {
                PendingOp::Insert(_) => counts.new += 1,
                PendingOp::Update { .. } => counts.dirty += 1,
                PendingOp::Delete { .. } => counts.deleted += 1,
            }
        }
        counts
    }

    /// Build the ordered flush plan for the current contents.
    pub fn flush_plan(&self, orderer: &mut FlushOrderer) -> FlushPlan {
        orderer.order(self.iter().filter_map(PendingOp::for_record).collect())
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PendingCounts {
    /// Records pending INSERT
    pub new: usize,
    /// Records pending UPDATE
    pub dirty: usize,
    /// Records pending DELETE
    pub deleted: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::{ColumnDef, EntitySchema, Row, Value};

    static CARD: EntitySchema = EntitySchema::new(
        "card",
        "cards",
        &[ColumnDef::new("id").primary_key(true), ColumnDef::new("suit")],
    );

    fn loaded(id: i64) -> EntityRecord {
        EntityRecord::from_row(
            &CARD,
            &Row::new(
                vec!["id".into(), "suit".into()],
                vec![Value::BigInt(id), Value::from("hearts")],
            ),
        )
        .expect("valid row")
    }

    #[test]
    fn staging_keeps_first_touch_order() {
        let mut writes = WriteSet::new();
        writes.stage(loaded(3));
        writes.stage(loaded(1));
        writes.stage(loaded(3));
        let ids: Vec<i64> = writes
            .iter()
            .map(|r| r.get_as("id").expect("id"))
            .collect();
        assert_eq!(ids, vec![3, 1]);
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn counts_by_operation() {
        let mut writes = WriteSet::new();
        writes.stage(EntityRecord::new(&CARD, [("id", Value::BigInt(1))]).expect("valid"));

        let mut dirty = loaded(2);
        dirty.set("suit", "spades").unwrap();
        writes.stage(dirty);

        let mut gone = loaded(3);
        gone.mark_deleted();
        writes.stage(gone);

        writes.stage(loaded(4));

        let counts = writes.pending_counts();
        assert_eq!(
            counts,
            PendingCounts {
                new: 1,
                dirty: 1,
                deleted: 1
            }
        );
        assert_eq!(counts.total(), 3);
        assert!(writes.has_changes());

        let plan = writes.flush_plan(&mut FlushOrderer::new());
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn discard_forgets_record() {
        let mut writes = WriteSet::new();
        let rec = loaded(5);
        let key = rec.key().clone();
        writes.stage(rec);
        assert!(writes.discard(&key).is_some());
        assert!(writes.is_empty());
        assert!(writes.pending_counts().is_empty());
    }
}
