//! Per-unit-of-work entity cache.
//!
//! The cache maps identity keys to records, partitioned by entity type. Each
//! partition is bounded by its own capacity and evicts the least recently
//! *accessed* entry when full: `get` refreshes recency, `peek` does not.
//!
//! Besides records the cache keeps relationship result sets, the ordered
//! member keys of `root.relation`, so navigation after an eager load needs
//! no store access. A result set is kept only while its root is cached, and
//! is dropped once a write could change its members or their order.
//!
//! The cache is plain owned data. It is not shared between units of work
//! and is not synchronized.

use asupersync::Outcome;
use entitymap_core::error::CapacityError;
use entitymap_core::{EntityRecord, Error, IdentityKey, RelationKind, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Counters describing cache behavior since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Loader invocations from `get_or_load`
    pub loads: u64,
    /// Entries dropped to respect a capacity
    pub evictions: u64,
    /// Entries dropped through `invalidate`
    pub invalidations: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, or 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: EntityRecord,
    tick: u64,
}

#[derive(Debug, Clone, Default)]
struct Partition {
    entries: HashMap<IdentityKey, CacheEntry>,
    /// Access tick -> key, oldest first
    recency: BTreeMap<u64, IdentityKey>,
}

impl Partition {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn pop_lru(&mut self) -> Option<IdentityKey> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn remove(&mut self, key: &IdentityKey) -> Option<EntityRecord> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry.record)
    }
}

/// Bounded, LRU-evicting identity map for one unit of work.
#[derive(Debug, Clone, Default)]
pub struct EntityCache {
    partitions: HashMap<&'static str, Partition>,
    capacities: HashMap<String, usize>,
    default_capacity: Option<usize>,
    relations: HashMap<IdentityKey, HashMap<&'static str, Vec<IdentityKey>>>,
    tick: u64,
    stats: CacheStats,
}

impl EntityCache {
    /// Create an unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache whose entity types default to `capacity` entries.
    ///
    /// `None` leaves types without an explicit capacity unbounded.
    pub fn with_default_capacity(capacity: Option<usize>) -> Self {
        Self {
            default_capacity: capacity,
            ..Self::default()
        }
    }

    /// Effective capacity for an entity type (`None` = unbounded).
    pub fn capacity(&self, entity: &str) -> Option<usize> {
        self.capacities
            .get(entity)
            .copied()
            .or(self.default_capacity)
    }

    /// Change the capacity of one entity type.
    ///
    /// Shrinking below the current size evicts least-recently-used entries
    /// right away; the evicted keys are returned. A negative capacity is
    /// rejected with `CacheCapacity` and leaves the cache untouched.
    #[allow(clippy::result_large_err)]
    pub fn resize(&mut self, entity: &str, max_entries: i64) -> Result<Vec<IdentityKey>> {
        let Ok(max) = usize::try_from(max_entries) else {
            return Err(Error::CacheCapacity(CapacityError {
                entity: entity.to_string(),
                requested: max_entries,
            }));
        };
        self.capacities.insert(entity.to_string(), max);

        let mut evicted = Vec::new();
        if let Some(partition) = self.partitions.get_mut(entity) {
            while partition.len() > max {
                match partition.pop_lru() {
                    Some(key) => evicted.push(key),
                    None => break,
                }
            }
        }
        for key in &evicted {
            self.relations.remove(key);
        }
        self.stats.evictions += evicted.len() as u64;
        if !evicted.is_empty() {
            tracing::debug!(
                entity = entity,
                max_entries = max,
                evicted = evicted.len(),
                "Cache resized"
            );
        }
        Ok(evicted)
    }

    /// Look up a record and mark it most recently used.
    pub fn get(&mut self, key: &IdentityKey) -> Option<&EntityRecord> {
        self.get_mut(key).map(|r| &*r)
    }

    /// Mutable lookup; refreshes recency like [`EntityCache::get`].
    pub fn get_mut(&mut self, key: &IdentityKey) -> Option<&mut EntityRecord> {
        self.tick += 1;
        let tick = self.tick;
        let Some(partition) = self.partitions.get_mut(key.entity()) else {
            self.stats.misses += 1;
            return None;
        };
        let Some(entry) = partition.entries.get_mut(key) else {
            self.stats.misses += 1;
            return None;
        };
        partition.recency.remove(&entry.tick);
        partition.recency.insert(tick, key.clone());
        entry.tick = tick;
        self.stats.hits += 1;
        Some(&mut entry.record)
    }

    /// Look up a record without touching recency or statistics.
    pub fn peek(&self, key: &IdentityKey) -> Option<&EntityRecord> {
        self.partitions
            .get(key.entity())
            .and_then(|p| p.entries.get(key))
            .map(|e| &e.record)
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.peek(key).is_some()
    }

    /// Return the cached record, or invoke `loader` and cache its result.
    ///
    /// A loader error (or cancellation) leaves the cache exactly as it was.
    /// With a capacity of 0 the loaded record is returned but not retained,
    /// so every call loads again.
    pub async fn get_or_load<F, Fut>(
        &mut self,
        key: &IdentityKey,
        loader: F,
    ) -> Outcome<Option<EntityRecord>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Outcome<Option<EntityRecord>, Error>>,
    {
        if let Some(record) = self.get(key) {
            return Outcome::Ok(Some(record.clone()));
        }

        self.stats.loads += 1;
        let loaded = match loader().await {
            Outcome::Ok(loaded) => loaded,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if let Some(record) = &loaded {
            tracing::trace!(key = %record.key(), "Loaded record into cache");
            self.put(record.clone());
        }
        Outcome::Ok(loaded)
    }

    /// Insert or replace a record.
    ///
    /// When a new key would exceed the type's capacity the least recently
    /// used entry of that type is evicted first and its key returned. With a
    /// capacity of 0 nothing is stored.
    pub fn put(&mut self, record: EntityRecord) -> Option<IdentityKey> {
        let entity = record.entity();
        let capacity = self.capacity(entity);
        if capacity == Some(0) {
            return None;
        }

        self.tick += 1;
        let tick = self.tick;
        let key = record.key().clone();
        let partition = self.partitions.entry(entity).or_default();

        if let Some(entry) = partition.entries.get_mut(&key) {
            partition.recency.remove(&entry.tick);
            partition.recency.insert(tick, key);
            entry.tick = tick;
            entry.record = record;
            return None;
        }

        let evicted = match capacity {
            Some(max) if partition.len() >= max => partition.pop_lru(),
            _ => None,
        };
        partition.recency.insert(tick, key.clone());
        partition.entries.insert(key, CacheEntry { record, tick });

        if let Some(old) = &evicted {
            self.relations.remove(old);
            self.stats.evictions += 1;
            tracing::trace!(entity = entity, evicted = %old, "Evicted least recently used record");
        }
        evicted
    }

    /// Drop one entry (and the relationship result sets rooted at it).
    pub fn invalidate(&mut self, key: &IdentityKey) -> Option<EntityRecord> {
        self.relations.remove(key);
        let removed = self
            .partitions
            .get_mut(key.entity())
            .and_then(|p| p.remove(key));
        if removed.is_some() {
            self.stats.invalidations += 1;
            tracing::trace!(key = %key, "Invalidated cache entry");
        }
        removed
    }

    /// Drop every entry of every type. Pending writes are not the cache's
    /// concern; calling this twice is the same as calling it once.
    pub fn clear(&mut self) {
        self.partitions.clear();
        self.relations.clear();
    }

    /// Records of one entity type, least recently used first.
    pub fn find_all(&self, entity: &str) -> Vec<&EntityRecord> {
        self.partitions.get(entity).map_or_else(Vec::new, |p| {
            p.recency
                .values()
                .filter_map(|key| p.entries.get(key))
                .map(|e| &e.record)
                .collect()
        })
    }

    /// Number of cached records of one entity type.
    pub fn len(&self, entity: &str) -> usize {
        self.partitions.get(entity).map_or(0, Partition::len)
    }

    /// Number of cached records across all types.
    pub fn total_len(&self) -> usize {
        self.partitions.values().map(Partition::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Cache the member keys of `root.relation`, in navigation order.
    ///
    /// Ignored unless the root itself is cached; returns whether the set was
    /// stored.
    pub fn put_relation(
        &mut self,
        root: IdentityKey,
        relation: &'static str,
        members: Vec<IdentityKey>,
    ) -> bool {
        if !self.contains(&root) {
            return false;
        }
        self.relations
            .entry(root)
            .or_default()
            .insert(relation, members);
        true
    }

    /// Cached member keys of `root.relation`, if resolved.
    pub fn relation(&self, root: &IdentityKey, relation: &str) -> Option<&[IdentityKey]> {
        self.relations
            .get(root)
            .and_then(|sets| sets.get(relation))
            .map(Vec::as_slice)
    }

    /// Drop every cached result set that lists `member`.
    pub(crate) fn forget_member(&mut self, member: &IdentityKey) {
        for sets in self.relations.values_mut() {
            sets.retain(|_, members| !members.contains(member));
        }
    }

    /// Drop the result sets that a write to the record of `key` can change.
    ///
    /// `changed` names the columns whose values changed. `None` stands for
    /// a newly created record, which may join any set over its type.
    pub fn forget_affected(&mut self, key: &IdentityKey, changed: Option<&[&str]>) {
        let mut dropped = 0_usize;
        for (root, sets) in &mut self.relations {
            let schema = root.schema();
            sets.retain(|name, _| {
                let Some(rel) = schema.relation(name) else {
                    return false;
                };
                let fk = rel.foreign_key_columns.iter().copied();
                let order = rel.order_by.iter().map(|o| o.column);
                let stale = if rel.kind == RelationKind::ManyToOne && root == key {
                    touches(changed, fk)
                } else if rel.target.name != key.entity() {
                    false
                } else {
                    match rel.kind {
                        RelationKind::ManyToOne => changed.is_none(),
                        RelationKind::OneToMany | RelationKind::OneToOneBackRef => {
                            touches(changed, fk) || touches(changed, order)
                        }
                        RelationKind::ManyToManyViaJoin => touches(changed, order),
                    }
                };
                dropped += usize::from(stale);
                !stale
            });
        }
        self.relations.retain(|_, sets| !sets.is_empty());
        if dropped > 0 {
            tracing::trace!(key = %key, dropped, "Dropped result sets affected by a write");
        }
    }

    /// Number of cached relationship result sets.
    pub fn relation_count(&self) -> usize {
        self.relations.values().map(HashMap::len).sum()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

/// Whether a write that changed `changed` (`None`: every column) involves
/// one of `columns`.
fn touches<'a>(changed: Option<&[&str]>, mut columns: impl Iterator<Item = &'a str>) -> bool {
    changed.is_none_or(|changed| columns.any(|col| changed.iter().any(|c| *c == col)))
}
