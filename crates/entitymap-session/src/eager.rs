//! Batched eager loading of relationships.
//!
//! An [`EagerPlan`] is a tree of relationship steps compiled from dotted
//! paths such as `"children.grandchildren"`. Paths sharing a prefix share
//! the tree node, so every edge is fetched once. The whole plan is checked
//! against the schemas before anything touches the store.
//!
//! The [`ReferenceResolver`] walks the plan level by level and issues one
//! store query per edge: `N` roots eager-loading one relation cost one
//! query, not `N`. Results are staged in a [`StagedLoad`] and only reach
//! the cache through [`StagedLoad::apply`], so a failed load leaves the
//! cache as it was.

use crate::cache::EntityCache;
use crate::unit_of_work::WriteSet;
use asupersync::{Cx, Outcome};
use entitymap_core::error::{EagerLoadPathError, EntityMismatchError};
use entitymap_core::{
    BackingStore, EntityRecord, EntitySchema, Error, IdentityKey, OrderBy, ReferencePath,
    RelationKind, Row, SortDirection, Value,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// One relationship step and the steps nested below it.
#[derive(Debug, Clone)]
pub struct IncludePath {
    pub relation: &'static ReferencePath,
    pub nested: Vec<IncludePath>,
}

impl IncludePath {
    fn new(relation: &'static ReferencePath) -> Self {
        Self {
            relation,
            nested: Vec::new(),
        }
    }

    fn depth(&self) -> usize {
        1 + self.nested.iter().map(IncludePath::depth).max().unwrap_or(0)
    }

    fn edges(&self) -> usize {
        1 + self.nested.iter().map(IncludePath::edges).sum::<usize>()
    }
}

/// Validated tree of relationships to load for one root entity type.
///
/// ```
/// use entitymap_core::{ColumnDef, EntitySchema, ReferencePath, RelationKind};
/// use entitymap_session::EagerPlan;
///
/// static DIR: EntitySchema = EntitySchema::new(
///     "dir",
///     "dirs",
///     &[ColumnDef::new("id").primary_key(true), ColumnDef::new("parent_id").nullable(true)],
/// )
/// .relations(&[ReferencePath::new("subdirs", "dir", RelationKind::OneToMany, &DIR)
///     .foreign_key(&["parent_id"])]);
///
/// let plan = EagerPlan::new(&DIR)
///     .include("subdirs.subdirs")
///     .unwrap()
///     .include("subdirs")
///     .unwrap();
/// assert_eq!(plan.levels(), 2);
/// assert_eq!(plan.edges(), 2);
/// assert!(EagerPlan::new(&DIR).include("files").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct EagerPlan {
    root: &'static EntitySchema,
    includes: Vec<IncludePath>,
}

impl EagerPlan {
    pub fn new(root: &'static EntitySchema) -> Self {
        Self {
            root,
            includes: Vec::new(),
        }
    }

    /// Compile several dotted paths at once.
    #[allow(clippy::result_large_err)]
    pub fn parse(root: &'static EntitySchema, paths: &[&str]) -> Result<Self, Error> {
        paths
            .iter()
            .try_fold(Self::new(root), |plan, path| plan.include(path))
    }

    /// Add a dotted relationship path.
    ///
    /// Fails with `EagerLoadPath` when a segment is empty or does not name a
    /// relationship of the entity it is resolved against.
    #[allow(clippy::result_large_err)]
    pub fn include(mut self, path: &str) -> Result<Self, Error> {
        let path = path.trim();
        let mut schema = self.root;
        let mut level = &mut self.includes;

        for segment in path.split('.') {
            let Some(relation) = schema.relation(segment).filter(|_| !segment.is_empty()) else {
                return Err(Error::EagerLoadPath(EagerLoadPathError {
                    path: path.to_string(),
                    entity: schema.name,
                    relation: segment.to_string(),
                }));
            };
            let idx = match level.iter().position(|inc| inc.relation.name == segment) {
                Some(idx) => idx,
                None => {
                    level.push(IncludePath::new(relation));
                    level.len() - 1
                }
            };
            level = &mut level[idx].nested;
            schema = relation.target;
        }
        Ok(self)
    }

    pub fn root(&self) -> &'static EntitySchema {
        self.root
    }

    pub fn includes(&self) -> &[IncludePath] {
        &self.includes
    }

    pub fn is_empty(&self) -> bool {
        self.includes.is_empty()
    }

    /// Depth of the deepest path.
    pub fn levels(&self) -> usize {
        self.includes.iter().map(IncludePath::depth).max().unwrap_or(0)
    }

    /// Number of relationship edges, the upper bound on queries issued.
    pub fn edges(&self) -> usize {
        self.includes.iter().map(IncludePath::edges).sum()
    }
}

/// What an eager load fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EagerLoadReport {
    /// Store queries issued
    pub queries: usize,
    /// Rows fetched
    pub records: usize,
    /// Relationship result sets resolved
    pub relations: usize,
}

/// Results of a successful eager load, not yet visible in the cache.
#[derive(Debug, Default)]
pub struct StagedLoad {
    records: Vec<EntityRecord>,
    relations: Vec<(IdentityKey, &'static str, Vec<IdentityKey>)>,
    report: EagerLoadReport,
}

impl StagedLoad {
    pub fn report(&self) -> EagerLoadReport {
        self.report
    }

    /// Resolved result set of `root.relation`.
    pub fn relation(&self, root: &IdentityKey, relation: &str) -> Option<&[IdentityKey]> {
        self.relations
            .iter()
            .rev()
            .find(|(r, name, _)| r == root && *name == relation)
            .map(|(_, _, members)| members.as_slice())
    }

    /// Fetched record for `key`, if this load fetched it.
    pub fn record(&self, key: &IdentityKey) -> Option<&EntityRecord> {
        self.records.iter().rev().find(|r| r.key() == key)
    }

    /// Publish fetched records and result sets to the cache.
    pub fn apply(self, cache: &mut EntityCache) -> EagerLoadReport {
        for record in self.records {
            cache.put(record);
        }
        for (root, relation, members) in self.relations {
            cache.put_relation(root, relation, members);
        }
        self.report
    }
}

/// Resolves eager-load plans against a backing store.
///
/// Records pending in the write set take precedence over fetched rows, and
/// records pending deletion never appear in a result set.
pub struct ReferenceResolver<'a, S> {
    store: &'a S,
    pending: &'a WriteSet,
}

impl<'a, S: BackingStore> ReferenceResolver<'a, S> {
    pub fn new(store: &'a S, pending: &'a WriteSet) -> Self {
        Self { store, pending }
    }

    /// Load `plan` for `roots`, one query per relationship edge.
    #[tracing::instrument(level = "debug", skip(self, cx, roots, plan), fields(root = plan.root.name))]
    pub async fn resolve(
        &self,
        cx: &Cx,
        roots: &[EntityRecord],
        plan: &EagerPlan,
    ) -> Outcome<StagedLoad, Error> {
        if let Some(root) = roots.iter().find(|r| r.entity() != plan.root.name) {
            return Outcome::Err(Error::EntityMismatch(EntityMismatchError {
                expected: plan.root.name,
                actual: root.entity(),
            }));
        }

        let mut staged = StagedLoad::default();
        let live: Vec<EntityRecord> = roots.iter().filter(|r| !r.is_deleted()).cloned().collect();
        let mut frontier: Vec<(Vec<EntityRecord>, &[IncludePath])> =
            vec![(live, plan.includes.as_slice())];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for (parents, includes) in frontier {
                for include in includes {
                    if let Some(reason) = cx.cancel_reason() {
                        return Outcome::Cancelled(reason);
                    }
                    let children = match self
                        .load_edge(cx, include.relation, &parents, &mut staged)
                        .await
                    {
                        Outcome::Ok(children) => children,
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    if !include.nested.is_empty() {
                        next.push((children, include.nested.as_slice()));
                    }
                }
            }
            frontier = next;
        }

        tracing::debug!(
            queries = staged.report.queries,
            records = staged.report.records,
            relations = staged.report.relations,
            "Eager load complete"
        );
        Outcome::Ok(staged)
    }

    /// Resolve one relationship for every parent. Returns the distinct
    /// related records, which become the parents of the next level.
    async fn load_edge(
        &self,
        cx: &Cx,
        rel: &'static ReferencePath,
        parents: &[EntityRecord],
        staged: &mut StagedLoad,
    ) -> Outcome<Vec<EntityRecord>, Error> {
        let Some(parent_schema) = parents.first().map(EntityRecord::schema) else {
            return Outcome::Ok(Vec::new());
        };

        tracing::info!(
            entity = rel.from_entity,
            relation = rel.name,
            target = rel.target.name,
            parent_count = parents.len(),
            "Batch loading relationship"
        );

        let grouped = match rel.kind {
            RelationKind::ManyToOne => self.load_many_to_one(cx, rel, parents, staged).await,
            RelationKind::OneToMany | RelationKind::OneToOneBackRef => {
                self.load_back_references(cx, rel, parent_schema, parents, staged)
                    .await
            }
            RelationKind::ManyToManyViaJoin => {
                self.load_linked(cx, rel, parent_schema, parents, staged)
                    .await
            }
        };
        let (mut sets, pool) = match grouped {
            Outcome::Ok(grouped) => grouped,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let mut seen = HashSet::new();
        let mut children = Vec::new();
        for (_, members) in &mut sets {
            if !rel.order_by.is_empty() {
                members.sort_by(|a, b| compare_by(rel.order_by, &pool[a], &pool[b]));
            }
            if rel.kind == RelationKind::OneToOneBackRef && members.len() > 1 {
                tracing::warn!(
                    relation = rel.name,
                    matches = members.len(),
                    "One-to-one back reference matched several rows, keeping the first"
                );
                members.truncate(1);
            }
            for key in members.iter() {
                if seen.insert(key.clone()) {
                    children.push(pool[key].clone());
                }
            }
        }

        staged.report.relations += sets.len();
        for (root, members) in sets {
            staged.relations.push((root, rel.name, members));
        }
        Outcome::Ok(children)
    }

    async fn load_many_to_one(
        &self,
        cx: &Cx,
        rel: &'static ReferencePath,
        parents: &[EntityRecord],
        staged: &mut StagedLoad,
    ) -> Outcome<Grouped, Error> {
        let target = rel.target;
        let pk_names = target.primary_key_names();
        let mut wanted = Vec::with_capacity(parents.len());
        let mut requested = HashSet::new();
        let mut tuples = Vec::new();

        for parent in parents {
            let tuple = match parent.tuple(rel.foreign_key_columns) {
                Ok(tuple) => tuple,
                Err(e) => return Outcome::Err(e),
            };
            // A null foreign key resolves to nothing and stays out of the batch.
            if tuple.iter().any(Value::is_null) {
                wanted.push((parent.key().clone(), None));
                continue;
            }
            let key = match IdentityKey::new(target, pk_names.iter().copied().zip(tuple)) {
                Ok(key) => key,
                Err(e) => return Outcome::Err(e),
            };
            if !self.pending.contains(&key) && requested.insert(key.clone()) {
                tuples.push(key.values());
            }
            wanted.push((parent.key().clone(), Some(key)));
        }

        let rows = match self
            .fetch(cx, target, &pk_names, &tuples, staged)
            .await
        {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let fetched = match self.stage_rows(target, &rows, staged) {
            Ok(fetched) => fetched,
            Err(e) => return Outcome::Err(e),
        };

        let mut pool = HashMap::new();
        let mut sets = Vec::with_capacity(wanted.len());
        for (parent, key) in wanted {
            let member = key.and_then(|k| self.visible(&k, &fetched).cloned());
            let members = match member {
                Some(record) => {
                    let key = record.key().clone();
                    pool.insert(key.clone(), record);
                    vec![key]
                }
                None => Vec::new(),
            };
            sets.push((parent, members));
        }
        Outcome::Ok((sets, pool))
    }

    async fn load_back_references(
        &self,
        cx: &Cx,
        rel: &'static ReferencePath,
        parent_schema: &'static EntitySchema,
        parents: &[EntityRecord],
        staged: &mut StagedLoad,
    ) -> Outcome<Grouped, Error> {
        let target = rel.target;
        let (order, tuples) = source_tuples(parents);

        let rows = match self
            .fetch(cx, target, rel.foreign_key_columns, &tuples, staged)
            .await
        {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let fetched = match self.stage_rows(target, &rows, staged) {
            Ok(fetched) => fetched,
            Err(e) => return Outcome::Err(e),
        };

        // Fetched rows first (in store order), then pending records that
        // were created or re-pointed in this unit of work.
        let mut candidates: Vec<&EntityRecord> = Vec::new();
        let mut considered = HashSet::new();
        for key in &fetched.keys {
            considered.insert(key.clone());
            if let Some(record) = self.visible(key, &fetched) {
                candidates.push(record);
            }
        }
        for record in self.pending.of_entity(target.name) {
            if !record.is_deleted() && considered.insert(record.key().clone()) {
                candidates.push(record);
            }
        }

        let pk_names = parent_schema.primary_key_names();
        let mut groups: HashMap<IdentityKey, Vec<IdentityKey>> = HashMap::new();
        let mut pool = HashMap::new();
        for record in candidates {
            let tuple = match record.tuple(rel.foreign_key_columns) {
                Ok(tuple) => tuple,
                Err(e) => return Outcome::Err(e),
            };
            if tuple.iter().any(Value::is_null) {
                continue;
            }
            let owner = match IdentityKey::new(parent_schema, pk_names.iter().copied().zip(tuple))
            {
                Ok(owner) => owner,
                Err(e) => return Outcome::Err(e),
            };
            groups
                .entry(owner)
                .or_default()
                .push(record.key().clone());
            pool.insert(record.key().clone(), record.clone());
        }

        let sets = order
            .into_iter()
            .map(|parent| {
                let members = groups.remove(&parent).unwrap_or_default();
                (parent, members)
            })
            .collect();
        Outcome::Ok((sets, pool))
    }

    async fn load_linked(
        &self,
        cx: &Cx,
        rel: &'static ReferencePath,
        parent_schema: &'static EntitySchema,
        parents: &[EntityRecord],
        staged: &mut StagedLoad,
    ) -> Outcome<Grouped, Error> {
        let Some(join) = &rel.join_table else {
            return Outcome::Err(Error::Custom(format!(
                "many-to-many relationship '{}.{}' has no join table",
                rel.from_entity, rel.name
            )));
        };
        let target = rel.target;
        let (order, tuples) = source_tuples(parents);

        let linked = if tuples.is_empty() {
            Vec::new()
        } else {
            staged.report.queries += 1;
            tracing::debug!(join = join.table, sources = tuples.len(), "Issuing linked batch query");
            match self
                .store
                .batch_load_linked(cx, join, target, &tuples)
                .await
            {
                Outcome::Ok(linked) => linked,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        };

        let pk_names = parent_schema.primary_key_names();
        let mut groups: HashMap<IdentityKey, Vec<IdentityKey>> = HashMap::new();
        let mut pool = HashMap::new();
        let mut staged_keys = HashSet::new();
        for (source, row) in &linked {
            let record = match EntityRecord::from_row(target, row) {
                Ok(record) => record,
                Err(e) => return Outcome::Err(e),
            };
            staged.report.records += 1;
            let key = record.key().clone();
            let visible = match self.pending.get(&key) {
                Some(pending) if pending.is_deleted() => continue,
                Some(pending) => pending.clone(),
                None => {
                    if staged_keys.insert(key.clone()) {
                        staged.records.push(record.clone());
                    }
                    record
                }
            };
            let owner = match IdentityKey::new(
                parent_schema,
                pk_names.iter().copied().zip(source.iter().cloned()),
            ) {
                Ok(owner) => owner,
                Err(e) => return Outcome::Err(e),
            };
            let members = groups.entry(owner).or_default();
            if !members.contains(&key) {
                members.push(key.clone());
            }
            pool.insert(key, visible);
        }

        let sets = order
            .into_iter()
            .map(|parent| {
                let members = groups.remove(&parent).unwrap_or_default();
                (parent, members)
            })
            .collect();
        Outcome::Ok((sets, pool))
    }

    /// One `IN (...)` query; nothing is issued for an empty tuple set.
    async fn fetch(
        &self,
        cx: &Cx,
        schema: &'static EntitySchema,
        columns: &[&'static str],
        tuples: &[Vec<Value>],
        staged: &mut StagedLoad,
    ) -> Outcome<Vec<Row>, Error> {
        if tuples.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        staged.report.queries += 1;
        tracing::debug!(
            entity = schema.name,
            columns = ?columns,
            keys = tuples.len(),
            query_count = 1,
            "Issuing batch query"
        );
        self.store.batch_load(cx, schema, columns, tuples).await
    }

    /// Convert fetched rows and stage those not shadowed by the write set.
    #[allow(clippy::result_large_err)]
    fn stage_rows(
        &self,
        schema: &'static EntitySchema,
        rows: &[Row],
        staged: &mut StagedLoad,
    ) -> Result<Fetched, Error> {
        let mut fetched = Fetched::default();
        for row in rows {
            let record = EntityRecord::from_row(schema, row)?;
            staged.report.records += 1;
            let key = record.key().clone();
            if fetched.records.contains_key(&key) {
                continue;
            }
            if !self.pending.contains(&key) {
                staged.records.push(record.clone());
            }
            fetched.keys.push(key.clone());
            fetched.records.insert(key, record);
        }
        Ok(fetched)
    }

    /// The record navigation should see for `key`.
    fn visible<'r>(&'r self, key: &IdentityKey, fetched: &'r Fetched) -> Option<&'r EntityRecord> {
        match self.pending.get(key) {
            Some(pending) if pending.is_deleted() => None,
            Some(pending) => Some(pending),
            None => fetched.records.get(key),
        }
    }
}

/// Result sets per parent, plus the member records by key.
type Grouped = (
    Vec<(IdentityKey, Vec<IdentityKey>)>,
    HashMap<IdentityKey, EntityRecord>,
);

#[derive(Default)]
struct Fetched {
    keys: Vec<IdentityKey>,
    records: HashMap<IdentityKey, EntityRecord>,
}

/// Parent keys in order, and the key tuples of those with a final identity.
fn source_tuples(parents: &[EntityRecord]) -> (Vec<IdentityKey>, Vec<Vec<Value>>) {
    let mut seen = HashSet::new();
    let mut order = Vec::with_capacity(parents.len());
    let mut tuples = Vec::new();
    for parent in parents {
        let key = parent.key();
        if !seen.insert(key.clone()) {
            continue;
        }
        order.push(key.clone());
        if !key.is_pending() {
            tuples.push(key.values());
        }
    }
    (order, tuples)
}

fn compare_by(order: &[OrderBy], a: &EntityRecord, b: &EntityRecord) -> Ordering {
    for term in order {
        let ord = match (a.get(term.column), b.get(term.column)) {
            (Ok(x), Ok(y)) => x.total_cmp(y),
            _ => Ordering::Equal,
        };
        let ord = match term.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::{ColumnDef, JoinTable};

    static POST: EntitySchema = EntitySchema::new(
        "post",
        "posts",
        &[ColumnDef::new("id").primary_key(true), ColumnDef::new("title")],
    )
    .relations(&[
        ReferencePath::new("comments", "post", RelationKind::OneToMany, &COMMENT)
            .foreign_key(&["post_id"])
            .order_by(&[OrderBy::desc("id")]),
        ReferencePath::new("labels", "post", RelationKind::ManyToManyViaJoin, &LABEL)
            .join_table(JoinTable::new("post_labels", &["post_id"], &["label_id"])),
    ]);

    static COMMENT: EntitySchema = EntitySchema::new(
        "comment",
        "comments",
        &[
            ColumnDef::new("id").primary_key(true),
            ColumnDef::new("post_id").nullable(true),
        ],
    )
    .relations(&[
        ReferencePath::new("post", "comment", RelationKind::ManyToOne, &POST)
            .foreign_key(&["post_id"]),
    ]);

    static LABEL: EntitySchema =
        EntitySchema::new("label", "labels", &[ColumnDef::new("id").primary_key(true)]);

    fn record(schema: &'static EntitySchema, pairs: &[(&str, Value)]) -> EntityRecord {
        EntityRecord::new(schema, pairs.iter().cloned()).expect("valid record")
    }

    #[test]
    fn shared_prefixes_merge() {
        let plan = EagerPlan::parse(&POST, &["comments.post.labels", "comments.post", "labels"])
            .unwrap();
        assert_eq!(plan.includes().len(), 2);
        assert_eq!(plan.levels(), 3);
        assert_eq!(plan.edges(), 4);
        assert!(!plan.is_empty());
    }

    #[test]
    fn unknown_and_empty_segments_fail() {
        let err = EagerPlan::new(&POST).include("comments.author").unwrap_err();
        match err {
            Error::EagerLoadPath(e) => {
                assert_eq!(e.entity, "comment");
                assert_eq!(e.relation, "author");
                assert_eq!(e.path, "comments.author");
            }
            other => panic!("expected path error, got {other:?}"),
        }

        let err = EagerPlan::new(&POST).include("comments..post").unwrap_err();
        assert!(matches!(err, Error::EagerLoadPath(e) if e.relation.is_empty()));
        assert!(EagerPlan::new(&POST).include("").is_err());
    }

    #[test]
    fn ordering_terms_apply_in_sequence() {
        let a = record(&COMMENT, &[("id", Value::BigInt(1)), ("post_id", Value::BigInt(5))]);
        let b = record(&COMMENT, &[("id", Value::BigInt(2)), ("post_id", Value::BigInt(5))]);
        let by_post_then_id_desc = [OrderBy::asc("post_id"), OrderBy::desc("id")];
        assert_eq!(compare_by(&by_post_then_id_desc, &a, &b), Ordering::Greater);
        assert_eq!(compare_by(&[], &a, &b), Ordering::Equal);
    }

    #[test]
    fn source_tuples_skip_pending_and_duplicates() {
        static SERIAL: EntitySchema = EntitySchema::new(
            "serial",
            "serials",
            &[ColumnDef::new("id").primary_key(true).auto_increment(true)],
        );
        let pending = EntityRecord::new(&SERIAL, std::iter::empty::<(&str, Value)>()).expect("pending");
        let fixed = record(&SERIAL, &[("id", Value::BigInt(3))]);
        let (order, tuples) = source_tuples(&[fixed.clone(), pending, fixed]);
        assert_eq!(order.len(), 2);
        assert_eq!(tuples, vec![vec![Value::BigInt(3)]]);
    }
}
