//! Flush ordering for pending writes.
//!
//! Pending records are turned into store operations and executed in an
//! order that respects foreign keys:
//! - DELETE child-first
//! - INSERT parent-first
//! - UPDATE last, writing only dirty columns
//!
//! Parent/child relations come from the schemas' declared relationships: a
//! `ManyToOne` makes the source depend on the target, `OneToMany` and
//! `OneToOneBackRef` make the target depend on the source.

use asupersync::{Cx, Outcome};
use entitymap_core::{
    BackingStore, EntityRecord, EntitySchema, Error, IdentityKey, RelationKind,
};
use serde::Serialize;
use std::collections::HashMap;

/// A pending store operation.
#[derive(Debug, Clone)]
pub enum PendingOp {
    /// Insert a new row.
    Insert(EntityRecord),
    /// Write the dirty columns of an existing row.
    Update {
        record: EntityRecord,
        columns: Vec<&'static str>,
    },
    /// Delete an existing row.
    Delete {
        schema: &'static EntitySchema,
        key: IdentityKey,
    },
}

impl PendingOp {
    /// Derive the operation a pending record needs, if any.
    ///
    /// A record deleted before it was ever written needs nothing, and so
    /// does a persisted record without dirty columns.
    pub fn for_record(record: &EntityRecord) -> Option<Self> {
        if record.is_deleted() {
            return record.is_persisted().then(|| PendingOp::Delete {
                schema: record.schema(),
                key: record.key().clone(),
            });
        }
        if !record.is_persisted() {
            return Some(PendingOp::Insert(record.clone()));
        }
        let columns = record.changed_columns();
        (!columns.is_empty()).then(|| PendingOp::Update {
            record: record.clone(),
            columns,
        })
    }

    pub fn entity(&self) -> &'static str {
        match self {
            PendingOp::Insert(record) | PendingOp::Update { record, .. } => record.entity(),
            PendingOp::Delete { schema, .. } => schema.name,
        }
    }

    pub fn key(&self) -> &IdentityKey {
        match self {
            PendingOp::Insert(record) | PendingOp::Update { record, .. } => record.key(),
            PendingOp::Delete { key, .. } => key,
        }
    }

    fn schema(&self) -> &'static EntitySchema {
        match self {
            PendingOp::Insert(record) | PendingOp::Update { record, .. } => record.schema(),
            PendingOp::Delete { schema, .. } => schema,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert(_))
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// Orders pending operations by entity dependency depth.
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Entity -> entities it references
    dependencies: HashMap<&'static str, Vec<&'static str>>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema and every schema reachable through its relations.
    pub fn register_schema(&mut self, schema: &'static EntitySchema) {
        if self.dependencies.contains_key(schema.name) {
            return;
        }
        self.dependencies.insert(schema.name, Vec::new());

        for rel in schema.relations {
            let (child, parent) = match rel.kind {
                RelationKind::ManyToOne => (schema.name, rel.target.name),
                RelationKind::OneToMany | RelationKind::OneToOneBackRef => {
                    (rel.target.name, schema.name)
                }
                RelationKind::ManyToManyViaJoin => {
                    self.register_schema(rel.target);
                    continue;
                }
            };
            if child != parent {
                let deps = self.dependencies.entry(child).or_default();
                if !deps.contains(&parent) {
                    deps.push(parent);
                }
            }
            self.register_schema(rel.target);
        }
    }

    /// Length of the longest dependency chain starting at `entity`.
    /// Cycles are cut where they close.
    pub fn depth(&self, entity: &str) -> usize {
        let mut visiting = Vec::new();
        self.depth_inner(entity, &mut visiting)
    }

    fn depth_inner<'a>(&'a self, entity: &'a str, visiting: &mut Vec<&'a str>) -> usize {
        if visiting.contains(&entity) {
            return 0;
        }
        visiting.push(entity);
        let depth = self
            .dependencies
            .get(entity)
            .into_iter()
            .flatten()
            .map(|parent| 1 + self.depth_inner(parent, visiting))
            .max()
            .unwrap_or(0);
        visiting.pop();
        depth
    }

    /// Split and sort operations into a flush plan. Sorting is stable, so
    /// operations on one entity type keep their recorded order.
    pub fn order(&mut self, ops: Vec<PendingOp>) -> FlushPlan {
        for op in &ops {
            self.register_schema(op.schema());
        }

        let mut plan = FlushPlan::new();
        for op in ops {
            match op {
                PendingOp::Delete { .. } => plan.deletes.push(op),
                PendingOp::Insert(_) => plan.inserts.push(op),
                PendingOp::Update { .. } => plan.updates.push(op),
            }
        }

        // Children (deeper) are deleted first, parents inserted first.
        plan.deletes
            .sort_by_key(|op| std::cmp::Reverse(self.depth(op.entity())));
        plan.inserts.sort_by_key(|op| self.depth(op.entity()));
        plan
    }
}

/// Ordered store operations of one flush.
#[derive(Debug, Default)]
pub struct FlushPlan {
    pub deletes: Vec<PendingOp>,
    pub inserts: Vec<PendingOp>,
    pub updates: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    /// Execute the plan against `store`.
    ///
    /// On success every written record has been marked persisted (inserted
    /// records carry their store-assigned key) and is returned through
    /// [`FlushResult::written`].
    #[tracing::instrument(level = "debug", skip(self, cx, store))]
    pub async fn execute<S: BackingStore>(self, cx: &Cx, store: &S) -> Outcome<FlushResult, Error> {
        tracing::info!(
            deletes = self.deletes.len(),
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            "Executing flush plan"
        );

        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for op in self.deletes {
            let PendingOp::Delete { schema, key } = op else {
                continue;
            };
            match store.delete(cx, schema, &key).await {
                Outcome::Ok(existed) => {
                    if !existed {
                        tracing::debug!(key = %key, "Row was already gone at flush");
                    }
                    result.deleted.push(key);
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        for op in self.inserts {
            let PendingOp::Insert(mut record) = op else {
                continue;
            };
            let key = match store.insert(cx, &record).await {
                Outcome::Ok(key) => key,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Err(e) = record.assign_key(key) {
                return Outcome::Err(e);
            }
            record.mark_persisted();
            result.inserted += 1;
            result.written.push(record);
        }

        for op in self.updates {
            let PendingOp::Update { mut record, columns } = op else {
                continue;
            };
            match store.update(cx, &record, &columns).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            record.mark_persisted();
            result.updated += 1;
            result.written.push(record);
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted.len(),
            "Flush complete"
        );

        Outcome::Ok(result)
    }
}

/// Outcome of executing a flush plan.
#[derive(Debug, Default)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    /// Keys whose rows were deleted
    pub deleted: Vec<IdentityKey>,
    /// Inserted and updated records, now persisted
    pub written: Vec<EntityRecord>,
}

impl FlushResult {
    /// Total number of store writes performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted.len()
    }

    /// Summary counts for logging and diagnostics.
    pub fn summary(&self) -> FlushSummary {
        FlushSummary {
            inserted: self.inserted,
            updated: self.updated,
            deleted: self.deleted.len(),
        }
    }
}

/// Serializable counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::{ColumnDef, ReferencePath, Row, Value};

    static TEAM: EntitySchema = EntitySchema::new(
        "team",
        "teams",
        &[ColumnDef::new("id").primary_key(true), ColumnDef::new("name")],
    )
    .relations(&[
        ReferencePath::new("heroes", "team", RelationKind::OneToMany, &HERO)
            .foreign_key(&["team_id"]),
    ]);

    static HERO: EntitySchema = EntitySchema::new(
        "hero",
        "heroes",
        &[
            ColumnDef::new("id").primary_key(true),
            ColumnDef::new("team_id").nullable(true),
        ],
    );

    static POWER: EntitySchema = EntitySchema::new(
        "power",
        "powers",
        &[
            ColumnDef::new("id").primary_key(true),
            ColumnDef::new("hero_id"),
        ],
    )
    .relations(&[
        ReferencePath::new("hero", "power", RelationKind::ManyToOne, &HERO)
            .foreign_key(&["hero_id"]),
    ]);

    fn new_record(schema: &'static EntitySchema, id: i64) -> EntityRecord {
        EntityRecord::new(schema, [("id", Value::BigInt(id))]).expect("valid record")
    }

    fn loaded(schema: &'static EntitySchema, id: i64) -> EntityRecord {
        let names: Vec<String> = schema.columns.iter().map(|c| c.name.to_string()).collect();
        let mut values = vec![Value::BigInt(id)];
        values.resize(names.len(), Value::Null);
        EntityRecord::from_row(schema, &Row::new(names, values)).expect("valid row")
    }

    #[test]
    fn ops_follow_record_state() {
        assert!(PendingOp::for_record(&new_record(&TEAM, 1)).is_some_and(|op| op.is_insert()));

        let mut clean = loaded(&TEAM, 1);
        assert!(PendingOp::for_record(&clean).is_none());
        clean.set("name", "Avengers").unwrap();
        match PendingOp::for_record(&clean) {
            Some(PendingOp::Update { columns, .. }) => assert_eq!(columns, vec!["name"]),
            other => panic!("expected update, got {other:?}"),
        }

        clean.mark_deleted();
        assert!(PendingOp::for_record(&clean).is_some_and(|op| op.is_delete()));

        let mut never_written = new_record(&TEAM, 2);
        never_written.mark_deleted();
        assert!(PendingOp::for_record(&never_written).is_none());
    }

    #[test]
    fn depth_comes_from_both_relation_directions() {
        let mut orderer = FlushOrderer::new();
        orderer.register_schema(&POWER);
        orderer.register_schema(&TEAM);
        assert_eq!(orderer.depth("team"), 0);
        assert_eq!(orderer.depth("hero"), 1);
        assert_eq!(orderer.depth("power"), 2);
    }

    #[test]
    fn inserts_parent_first_deletes_child_first() {
        let mut orderer = FlushOrderer::new();
        orderer.register_schema(&TEAM);
        orderer.register_schema(&POWER);

        let mut doomed_power = loaded(&POWER, 9);
        doomed_power.mark_deleted();
        let mut doomed_team = loaded(&TEAM, 8);
        doomed_team.mark_deleted();

        let ops = [
            new_record(&POWER, 1),
            new_record(&HERO, 1),
            new_record(&TEAM, 1),
            doomed_team,
            doomed_power,
        ]
        .iter()
        .filter_map(PendingOp::for_record)
        .collect();

        let plan = orderer.order(ops);
        assert_eq!(plan.len(), 5);
        let inserts: Vec<_> = plan.inserts.iter().map(PendingOp::entity).collect();
        assert_eq!(inserts, vec!["team", "hero", "power"]);
        let deletes: Vec<_> = plan.deletes.iter().map(PendingOp::entity).collect();
        assert_eq!(deletes, vec!["power", "team"]);
    }

    #[test]
    fn empty_plan() {
        let plan = FlushOrderer::new().order(Vec::new());
        assert!(plan.is_empty());
        assert_eq!(FlushResult::default().total(), 0);
    }
}
