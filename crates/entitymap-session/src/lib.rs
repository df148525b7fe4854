//! Unit of work for entitymap.
//!
//! `entitymap-session` is the **transaction-scoped layer**. A [`UnitOfWork`]
//! owns one [`EntityCache`], one change buffer and one write set, and drives
//! them through begin, flush, commit and rollback against a
//! [`BackingStore`].
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one cached record per [`IdentityKey`], bounded per
//!   entity type and evicted least-recently-used first.
//! - **Change tracking**: mutations become buffered [`ChangeEvent`]s that are
//!   collapsed and delivered to [`HookRegistry`] listeners on flush.
//! - **Relationship loading**: [`EagerPlan`]s are resolved with one batched
//!   query per relationship level; lazy navigation is counted for N+1
//!   detection.
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new(store);
//! let key = uow.create(&cx, author).await.unwrap();
//! uow.set(&cx, &key, "name", "Ursula").await.unwrap();
//! let plan = EagerPlan::new(&AUTHOR).include("books.reviews").unwrap();
//! uow.eager_load(&cx, &roots, &plan).await.unwrap();
//! uow.commit(&cx).await.unwrap();
//! ```

pub mod cache;
pub mod config;
pub mod eager;
pub mod flush;
pub mod hooks;
pub mod n1_detection;
pub mod unit_of_work;

pub use cache::{CacheStats, EntityCache};
pub use config::{CachePolicy, UnitOfWorkConfig};
pub use eager::{EagerLoadReport, EagerPlan, IncludePath, ReferenceResolver, StagedLoad};
pub use flush::{FlushOrderer, FlushPlan, FlushResult, FlushSummary, PendingOp};
pub use hooks::{
    ChangeBuffer, ChangeEvent, ChangeType, HookGuard, HookRegistry, Listener, SubscriptionId,
    UnitOfWorkId,
};
pub use n1_detection::{LazyLoadStats, LazyLoadTracker, LoadSite};
pub use unit_of_work::{PendingCounts, WriteSet};

use asupersync::{Cx, Outcome};
use entitymap_core::error::{
    ConfigError, EagerLoadPathError, EntityMismatchError, KeyError, StaleEntityError,
    TransactionError, TransactionErrorKind,
};
use entitymap_core::{
    BackingStore, Entity, EntityRecord, EntitySchema, Error, IdentityKey, Result, Value,
    is_valid_identifier,
};
use std::collections::{HashMap, HashSet};
use std::panic::Location;

/// Store savepoint that makes one flush atomic.
const FLUSH_SAVEPOINT: &str = "entitymap_flush";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    Active,
    Closed,
}

/// Local state captured by [`UnitOfWork::savepoint`].
#[derive(Debug)]
struct Savepoint {
    name: String,
    cache: EntityCache,
    writes: WriteSet,
    changes: ChangeBuffer,
    removed: HashSet<IdentityKey>,
}

// ============================================================================
// UnitOfWork
// ============================================================================

/// Transaction-scoped identity map over a [`BackingStore`].
///
/// Not shared between tasks: every operation takes `&mut self`. Two units of
/// work over the same store never see each other's cache.
///
/// After `commit` or `rollback` the unit of work is idle; the next operation
/// that needs the store begins a new transaction (with `auto_begin`). After
/// [`close`](Self::close) every operation fails with a `Transaction` error.
pub struct UnitOfWork<S: BackingStore> {
    id: UnitOfWorkId,
    store: S,
    config: UnitOfWorkConfig,
    state: TxState,
    cache: EntityCache,
    writes: WriteSet,
    changes: ChangeBuffer,
    /// Keys deleted in the current transaction
    removed: HashSet<IdentityKey>,
    savepoints: Vec<Savepoint>,
    schemas: HashSet<&'static str>,
    orderer: FlushOrderer,
    hooks: HookRegistry,
    lazy: Option<LazyLoadTracker>,
}

impl<S: BackingStore> std::fmt::Debug for UnitOfWork<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cached", &self.cache.total_len())
            .field("pending", &self.writes.len())
            .field("buffered_events", &self.changes.len())
            .field("savepoints", &self.savepoints.len())
            .finish_non_exhaustive()
    }
}

impl<S: BackingStore> UnitOfWork<S> {
    /// Unit of work with the default configuration and the global hook registry.
    pub fn new(store: S) -> Self {
        Self::build(store, UnitOfWorkConfig::default(), EntityCache::new())
    }

    /// Unit of work with `config`. Fails on negative cache capacities.
    #[allow(clippy::result_large_err)]
    pub fn with_config(store: S, config: UnitOfWorkConfig) -> Result<Self> {
        let cache = config.build_cache()?;
        Ok(Self::build(store, config, cache))
    }

    fn build(store: S, config: UnitOfWorkConfig, cache: EntityCache) -> Self {
        let id = UnitOfWorkId::next();
        tracing::debug!(unit_of_work = %id, "Opening unit of work");
        Self {
            id,
            store,
            lazy: config.lazy_load_threshold.map(LazyLoadTracker::new),
            config,
            state: TxState::Idle,
            cache,
            writes: WriteSet::new(),
            changes: ChangeBuffer::new(),
            removed: HashSet::new(),
            savepoints: Vec::new(),
            schemas: HashSet::new(),
            orderer: FlushOrderer::new(),
            hooks: HookRegistry::global().clone(),
        }
    }

    /// Deliver change events to `hooks` instead of the global registry.
    #[must_use]
    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &UnitOfWorkConfig {
        &self.config
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Whether a store transaction is open.
    pub fn is_active(&self) -> bool {
        self.state == TxState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state == TxState::Closed
    }

    /// Events recorded since the last successful delivery.
    pub fn buffered_events(&self) -> &[ChangeEvent] {
        self.changes.events()
    }

    pub fn pending_counts(&self) -> PendingCounts {
        self.writes.pending_counts()
    }

    /// Give the store handle back.
    pub fn into_store(self) -> S {
        self.store
    }

    /// Validate `schema` and make it (and the schemas it relates to) known
    /// to the flush orderer ahead of the first write.
    #[allow(clippy::result_large_err)]
    pub fn register(&mut self, schema: &'static EntitySchema) -> Result<()> {
        schema.validate()?;
        self.remember(schema);
        Ok(())
    }

    fn remember(&mut self, schema: &'static EntitySchema) {
        if self.schemas.insert(schema.name) {
            self.orderer.register_schema(schema);
            for rel in schema.relations {
                self.remember(rel.target);
            }
        }
    }

    /// Schema of `key`'s entity type, made known to the flush orderer.
    fn schema_of(&mut self, key: &IdentityKey) -> &'static EntitySchema {
        let schema = key.schema();
        self.remember(schema);
        schema
    }

    #[allow(clippy::result_large_err)]
    fn ensure_open(&self) -> Result<()> {
        if self.state == TxState::Closed {
            return Err(transaction_error(
                TransactionErrorKind::Closed,
                "unit of work is closed",
            ));
        }
        Ok(())
    }

    fn record_change(&mut self, change_type: ChangeType, key: &IdentityKey) {
        self.changes
            .record(ChangeEvent::new(change_type, key.clone(), self.id));
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Begin a store transaction.
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        if self.state == TxState::Active {
            return Outcome::Err(transaction_error(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already in progress",
            ));
        }
        match self.store.begin(cx).await {
            Outcome::Ok(()) => {
                self.state = TxState::Active;
                tracing::debug!(unit_of_work = %self.id, "Transaction started");
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Make sure a transaction is open, beginning one if configured to.
    async fn ensure_active(&mut self, cx: &Cx) -> Outcome<(), Error> {
        match self.state {
            TxState::Active => Outcome::Ok(()),
            TxState::Idle if self.config.auto_begin => self.begin(cx).await,
            TxState::Idle => Outcome::Err(transaction_error(
                TransactionErrorKind::NotActive,
                "no transaction in progress; call begin() or enable auto_begin",
            )),
            TxState::Closed => Outcome::Err(transaction_error(
                TransactionErrorKind::Closed,
                "unit of work is closed",
            )),
        }
    }

    /// Write pending changes, then deliver buffered events.
    ///
    /// The writes of one flush are atomic: on a store error the store is
    /// rolled back to where the flush started, and the write set and event
    /// buffer are kept. Listener failures are returned after every listener
    /// ran; the events stay buffered and are delivered again by the next
    /// flush or commit.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(unit_of_work = %self.id))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        let summary = match self.write_pending(cx).await {
            Outcome::Ok(summary) => summary,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.apply_policy(self.config.on_flush);
        match self.deliver_events() {
            Ok(()) => Outcome::Ok(summary),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Flush, commit the store transaction and deliver buffered events.
    ///
    /// Afterwards the cache is cleared or retained per `on_commit` and the
    /// unit of work is idle.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(unit_of_work = %self.id))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        let summary = match self.write_pending(cx).await {
            Outcome::Ok(summary) => summary,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if self.state == TxState::Active {
            match self.store.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.state = TxState::Idle;
        self.savepoints.clear();
        self.removed.clear();
        self.apply_policy(self.config.on_commit);
        if let Some(tracker) = &mut self.lazy {
            tracker.reset();
        }
        tracing::info!(
            unit_of_work = %self.id,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            events = self.changes.len(),
            "Committed"
        );

        match self.deliver_events() {
            Ok(()) => Outcome::Ok(summary),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Roll back the store transaction and discard the cache, pending
    /// writes and buffered events. No events are delivered.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(unit_of_work = %self.id))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        let was_active = self.state == TxState::Active;
        self.discard_local();
        self.state = TxState::Idle;
        tracing::info!(unit_of_work = %self.id, "Rolled back");

        if was_active {
            return self.store.rollback(cx).await;
        }
        Outcome::Ok(())
    }

    /// End the unit of work. An open transaction is rolled back.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.state == TxState::Closed {
            return Outcome::Ok(());
        }
        let was_active = self.state == TxState::Active;
        self.discard_local();
        self.state = TxState::Closed;
        tracing::debug!(unit_of_work = %self.id, "Closing unit of work");

        if was_active {
            return self.store.rollback(cx).await;
        }
        Outcome::Ok(())
    }

    fn discard_local(&mut self) {
        self.cache.clear();
        self.writes.clear();
        self.changes.clear();
        self.removed.clear();
        self.savepoints.clear();
    }

    fn apply_policy(&mut self, policy: CachePolicy) {
        if policy == CachePolicy::Clear {
            self.cache.clear();
        }
    }

    /// Execute the write set inside the flush savepoint and fold the
    /// results into the cache.
    async fn write_pending(&mut self, cx: &Cx) -> Outcome<FlushSummary, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        if !self.writes.has_changes() {
            self.writes.clear();
            return Outcome::Ok(FlushSummary::default());
        }
        match self.ensure_active(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let schemas: Vec<_> = self.writes.iter().map(EntityRecord::schema).collect();
        for schema in schemas {
            self.remember(schema);
        }
        let plan = self.writes.flush_plan(&mut self.orderer);

        match self.store.savepoint(cx, FLUSH_SAVEPOINT).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let result = match plan.execute(cx, &self.store).await {
            Outcome::Ok(result) => result,
            Outcome::Err(e) => {
                self.undo_partial_flush(cx).await;
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.undo_partial_flush(cx).await;
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        match self.store.release(cx, FLUSH_SAVEPOINT).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let summary = result.summary();
        for key in &result.deleted {
            self.cache.invalidate(key);
        }
        for record in result.written {
            self.cache.put(record);
        }
        self.writes.clear();
        Outcome::Ok(summary)
    }

    async fn undo_partial_flush(&self, cx: &Cx) {
        match self.store.rollback_to(cx, FLUSH_SAVEPOINT).await {
            Outcome::Ok(()) => {
                tracing::debug!(unit_of_work = %self.id, "Flush rolled back to its savepoint");
            }
            Outcome::Err(e) => {
                tracing::warn!(unit_of_work = %self.id, error = %e, "Failed to undo partial flush");
            }
            _ => {
                tracing::warn!(unit_of_work = %self.id, "Undo of partial flush did not complete");
            }
        }
    }

    /// Deliver the buffered events; keep them if any listener failed.
    #[allow(clippy::result_large_err)]
    fn deliver_events(&mut self) -> Result<()> {
        self.hooks.deliver(self.changes.events())?;
        self.changes.clear();
        // Delivered events must not come back through a savepoint rollback.
        for savepoint in &mut self.savepoints {
            savepoint.changes.clear();
        }
        Ok(())
    }

    // ========================================================================
    // Savepoints
    // ========================================================================

    /// Capture the cache, write set and event buffer under `name`, and set a
    /// store savepoint of the same name.
    pub async fn savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        if !is_valid_identifier(name) || name == FLUSH_SAVEPOINT {
            return Outcome::Err(Error::Config(ConfigError {
                message: format!("'{name}' is not a usable savepoint name"),
                source: None,
            }));
        }
        match self.ensure_active(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        match self.store.savepoint(cx, name).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.savepoints.push(Savepoint {
            name: name.to_string(),
            cache: self.cache.clone(),
            writes: self.writes.clone(),
            changes: self.changes.clone(),
            removed: self.removed.clone(),
        });
        tracing::debug!(savepoint = name, depth = self.savepoints.len(), "Savepoint set");
        Outcome::Ok(())
    }

    /// Restore the state captured by `savepoint(name)`. The savepoint and
    /// every later one are removed.
    pub async fn rollback_to_savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        let idx = match self.savepoint_index(name) {
            Ok(idx) => idx,
            Err(e) => return Outcome::Err(e),
        };
        match self.store.rollback_to(cx, name).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        if let Some(saved) = self.savepoints.drain(idx..).next() {
            self.cache = saved.cache;
            self.writes = saved.writes;
            self.changes = saved.changes;
            self.removed = saved.removed;
        }
        tracing::debug!(savepoint = name, "Rolled back to savepoint");
        Outcome::Ok(())
    }

    /// Forget savepoint `name` (and every later one), keeping current state.
    pub async fn release_savepoint(&mut self, cx: &Cx, name: &str) -> Outcome<(), Error> {
        let idx = match self.savepoint_index(name) {
            Ok(idx) => idx,
            Err(e) => return Outcome::Err(e),
        };
        match self.store.release(cx, name).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        self.savepoints.truncate(idx);
        Outcome::Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn savepoint_index(&self, name: &str) -> Result<usize> {
        self.ensure_open()?;
        self.savepoints
            .iter()
            .rposition(|sp| sp.name == name)
            .ok_or_else(|| {
                transaction_error(
                    TransactionErrorKind::SavepointNotFound,
                    format!("savepoint '{name}' does not exist"),
                )
            })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Look up a record without touching the store.
    ///
    /// Pending records take precedence over cached ones; a deleted record
    /// is not returned.
    pub fn get(&mut self, key: &IdentityKey) -> Option<&EntityRecord> {
        if self.removed.contains(key) {
            return None;
        }
        if let Some(pending) = self.writes.get(key) {
            return (!pending.is_deleted()).then_some(pending);
        }
        self.cache.get(key)
    }

    /// Look up a record, loading it from the store on a cache miss.
    pub async fn get_or_load(
        &mut self,
        cx: &Cx,
        schema: &'static EntitySchema,
        key: &IdentityKey,
    ) -> Outcome<Option<EntityRecord>, Error> {
        if !key.is_of(schema) {
            return Outcome::Err(Error::EntityMismatch(EntityMismatchError {
                expected: schema.name,
                actual: key.entity(),
            }));
        }
        self.remember(schema);
        self.load_visible(cx, key).await
    }

    /// Load a typed entity by key.
    pub async fn find<E: Entity>(
        &mut self,
        cx: &Cx,
        key: &IdentityKey,
    ) -> Outcome<Option<E>, Error> {
        let record = match self.get_or_load(cx, E::schema(), key).await {
            Outcome::Ok(record) => record,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match record.map(|r| E::decode(&r)).transpose() {
            Ok(entity) => Outcome::Ok(entity),
            Err(e) => Outcome::Err(e),
        }
    }

    /// The record visible to this unit of work, loading through the cache.
    async fn load_visible(
        &mut self,
        cx: &Cx,
        key: &IdentityKey,
    ) -> Outcome<Option<EntityRecord>, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        if self.removed.contains(key) {
            return Outcome::Ok(None);
        }
        if let Some(pending) = self.writes.get(key) {
            return Outcome::Ok((!pending.is_deleted()).then(|| pending.clone()));
        }
        if let Some(cached) = self.cache.get(key) {
            return Outcome::Ok(Some(cached.clone()));
        }

        let schema = self.schema_of(key);
        match self.ensure_active(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let store = &self.store;
        self.cache
            .get_or_load(key, || async move {
                match store.load(cx, schema, key).await {
                    Outcome::Ok(Some(row)) => match EntityRecord::from_row(schema, &row) {
                        Ok(record) => Outcome::Ok(Some(record)),
                        Err(e) => Outcome::Err(e),
                    },
                    Outcome::Ok(None) => Outcome::Ok(None),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            })
            .await
    }

    /// The visible record, or a not-found error.
    async fn require(&mut self, cx: &Cx, key: &IdentityKey) -> Outcome<EntityRecord, Error> {
        if self.removed.contains(key) {
            return Outcome::Err(stale(key));
        }
        match self.load_visible(cx, key).await {
            Outcome::Ok(Some(record)) => Outcome::Ok(record),
            Outcome::Ok(None) => Outcome::Err(Error::not_found(key.entity(), key)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Reload a record from the store.
    ///
    /// With `reset_pending_writes` unset, locally modified columns keep
    /// their values and only clean columns are overwritten.
    pub async fn refresh(
        &mut self,
        cx: &Cx,
        key: &IdentityKey,
        reset_pending_writes: bool,
    ) -> Outcome<EntityRecord, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        if self.removed.contains(key) {
            return Outcome::Err(stale(key));
        }
        let schema = self.schema_of(key);
        match self.ensure_active(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        let row = match self.store.load(cx, schema, key).await {
            Outcome::Ok(Some(row)) => row,
            Outcome::Ok(None) => return Outcome::Err(Error::not_found(key.entity(), key)),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let loaded = match EntityRecord::from_row(schema, &row) {
            Ok(loaded) => loaded,
            Err(e) => return Outcome::Err(e),
        };
        let previous = self
            .writes
            .get(key)
            .or_else(|| self.cache.peek(key))
            .cloned();
        let visible = match self.writes.get_mut(key) {
            Some(pending) => {
                if let Err(e) = pending.refresh(&row, reset_pending_writes) {
                    return Outcome::Err(e);
                }
                pending.clone()
            }
            None => loaded.clone(),
        };
        let changed = previous.map(|previous| changed_between(&previous, &visible));
        self.cache.put(loaded);
        self.cache.forget_affected(key, changed.as_deref());
        tracing::debug!(key = %key, reset_pending_writes, "Refreshed record");
        Outcome::Ok(visible)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Add a new record and record a `Created` event.
    ///
    /// A record whose key waits for an auto-increment value is inserted
    /// right away so it has its final identity; other records are written
    /// on flush.
    pub async fn create(&mut self, cx: &Cx, record: EntityRecord) -> Outcome<IdentityKey, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        if record.is_deleted() {
            return Outcome::Err(stale(record.key()));
        }
        if record.is_persisted() {
            return Outcome::Err(Error::InvalidKey(KeyError {
                entity: record.entity(),
                column: None,
                message: format!("{} is already persisted; use modify()", record.key()),
            }));
        }
        self.remember(record.schema());

        let key = record.key().clone();
        let pending_delete = self.writes.get(&key).is_some_and(EntityRecord::is_deleted);
        let already_present = !self.removed.contains(&key)
            && (self.writes.contains(&key) || self.cache.contains(&key));
        if already_present && !pending_delete {
            return Outcome::Err(Error::InvalidKey(KeyError {
                entity: record.entity(),
                column: None,
                message: format!("{key} is already present in this unit of work"),
            }));
        }

        let mut record = record;
        if key.is_pending() || pending_delete {
            match self.ensure_active(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        if pending_delete {
            // Delete-then-reinsert under one key: the delete must reach the
            // store before the insert does.
            match self.store.delete(cx, record.schema(), &key).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
            self.writes.discard(&key);
        }
        if key.is_pending() {
            let assigned = match self.store.insert(cx, &record).await {
                Outcome::Ok(assigned) => assigned,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let Err(e) = record.assign_key(assigned) {
                return Outcome::Err(e);
            }
            record.mark_persisted();
        }

        let key = record.key().clone();
        tracing::trace!(key = %key, persisted = record.is_persisted(), "Created record");
        self.removed.remove(&key);
        if record.is_persisted() {
            self.cache.put(record);
        } else {
            self.writes.stage(record);
        }
        self.cache.forget_affected(&key, None);
        self.record_change(ChangeType::Created, &key);
        Outcome::Ok(key)
    }

    /// Create a record from a typed entity.
    pub async fn create_entity<E: Entity>(
        &mut self,
        cx: &Cx,
        entity: &E,
    ) -> Outcome<IdentityKey, Error> {
        match entity.to_record() {
            Ok(record) => self.create(cx, record).await,
            Err(e) => Outcome::Err(e),
        }
    }

    /// Apply `change` to the visible record of `key`.
    ///
    /// The closure works on a copy: if it fails, nothing changes. An
    /// `Updated` event is recorded only when a value actually changed.
    pub async fn modify<F>(&mut self, cx: &Cx, key: &IdentityKey, change: F) -> Outcome<(), Error>
    where
        F: FnOnce(&mut EntityRecord) -> Result<()>,
    {
        let current = match self.require(cx, key).await {
            Outcome::Ok(record) => record,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut working = current.clone();
        if let Err(e) = change(&mut working) {
            return Outcome::Err(e);
        }
        let changed = changed_between(&current, &working);
        if changed.is_empty() {
            return Outcome::Ok(());
        }

        self.writes.stage(working);
        self.cache.forget_affected(key, Some(changed.as_slice()));
        self.record_change(ChangeType::Updated, key);
        Outcome::Ok(())
    }

    /// Set one column of the visible record of `key`.
    pub async fn set(
        &mut self,
        cx: &Cx,
        key: &IdentityKey,
        column: &str,
        value: impl Into<Value>,
    ) -> Outcome<(), Error> {
        let value = value.into();
        self.modify(cx, key, |record| record.set(column, value))
            .await
    }

    /// Delete the record of `key` and record a `Removed` event.
    ///
    /// Returns `false` when there was nothing to delete. A record created in
    /// this unit of work and never written is simply dropped.
    pub async fn delete(&mut self, cx: &Cx, key: &IdentityKey) -> Outcome<bool, Error> {
        if self.removed.contains(key) {
            return Outcome::Ok(false);
        }
        let mut record = match self.load_visible(cx, key).await {
            Outcome::Ok(Some(record)) => record,
            Outcome::Ok(None) => return Outcome::Ok(false),
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        if record.is_persisted() {
            record.mark_deleted();
            self.writes.stage(record);
        } else {
            self.writes.discard(key);
        }
        self.removed.insert(key.clone());
        self.cache.invalidate(key);
        self.cache.forget_member(key);
        self.record_change(ChangeType::Removed, key);
        tracing::trace!(key = %key, "Deleted record");
        Outcome::Ok(true)
    }

    // ========================================================================
    // Cache Control
    // ========================================================================

    /// Drop one record from the cache. Pending writes are kept.
    pub fn invalidate(&mut self, key: &IdentityKey) -> bool {
        self.cache.invalidate(key).is_some()
    }

    /// Drop every cached record without flushing.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Change the capacity of one entity type, evicting immediately.
    #[allow(clippy::result_large_err)]
    pub fn resize_cache(&mut self, entity: &str, max_entries: i64) -> Result<Vec<IdentityKey>> {
        self.cache.resize(entity, max_entries)
    }

    // ========================================================================
    // Relationship Loading
    // ========================================================================

    /// Load `plan` for `roots` into the cache, one query per relationship
    /// edge. On failure the cache is left untouched.
    #[tracing::instrument(level = "debug", skip(self, cx, roots, plan), fields(roots = roots.len()))]
    pub async fn eager_load(
        &mut self,
        cx: &Cx,
        roots: &[EntityRecord],
        plan: &EagerPlan,
    ) -> Outcome<EagerLoadReport, Error> {
        if let Err(e) = self.ensure_open() {
            return Outcome::Err(e);
        }
        self.remember(plan.root());
        if roots.is_empty() || plan.is_empty() {
            return Outcome::Ok(EagerLoadReport::default());
        }
        match self.ensure_active(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let resolver = ReferenceResolver::new(&self.store, &self.writes);
        match resolver.resolve(cx, roots, plan).await {
            Outcome::Ok(staged) => Outcome::Ok(staged.apply(&mut self.cache)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// [`eager_load`](Self::eager_load) with dotted paths, validated before
    /// any query runs.
    pub async fn eager_load_paths(
        &mut self,
        cx: &Cx,
        schema: &'static EntitySchema,
        roots: &[EntityRecord],
        paths: &[&str],
    ) -> Outcome<EagerLoadReport, Error> {
        let plan = match EagerPlan::parse(schema, paths) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        self.eager_load(cx, roots, &plan).await
    }

    /// Navigate `root.relation`.
    ///
    /// Served from the cache when the result set was eager-loaded and all
    /// its members are still cached. Otherwise the relation is loaded for
    /// this one root, which counts as a lazy load for N+1 detection.
    #[track_caller]
    pub fn related<'a>(
        &'a mut self,
        cx: &'a Cx,
        root: &'a IdentityKey,
        relation: &'a str,
    ) -> impl Future<Output = Outcome<Vec<EntityRecord>, Error>> + 'a {
        let site = Location::caller();
        async move { self.related_at(cx, root, relation, site).await }
    }

    async fn related_at(
        &mut self,
        cx: &Cx,
        root: &IdentityKey,
        relation: &str,
        site: &'static Location<'static>,
    ) -> Outcome<Vec<EntityRecord>, Error> {
        let root_record = match self.require(cx, root).await {
            Outcome::Ok(record) => record,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let schema = root_record.schema();
        let Some(rel) = schema.relation(relation) else {
            return Outcome::Err(Error::EagerLoadPath(EagerLoadPathError {
                path: relation.to_string(),
                entity: schema.name,
                relation: relation.to_string(),
            }));
        };

        if let Some(members) = self.cached_members(root, rel.name) {
            tracing::trace!(root = %root, relation = rel.name, "Relation served from cache");
            return Outcome::Ok(members);
        }

        if let Some(tracker) = &mut self.lazy {
            tracker.record_at(schema.name, rel.name, site);
        }
        match self.ensure_active(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        let plan = match EagerPlan::new(schema).include(rel.name) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        let resolver = ReferenceResolver::new(&self.store, &self.writes);
        let staged = match resolver
            .resolve(cx, std::slice::from_ref(&root_record), &plan)
            .await
        {
            Outcome::Ok(staged) => staged,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let members: Vec<EntityRecord> = staged
            .relation(root, rel.name)
            .unwrap_or_default()
            .iter()
            .filter_map(|key| {
                self.writes
                    .get(key)
                    .or_else(|| staged.record(key))
                    .cloned()
            })
            .collect();
        staged.apply(&mut self.cache);
        Outcome::Ok(members)
    }

    /// Members of a cached result set, if every one is still visible.
    fn cached_members(&mut self, root: &IdentityKey, relation: &str) -> Option<Vec<EntityRecord>> {
        let keys = self.cache.relation(root, relation)?.to_vec();
        let mut members = Vec::with_capacity(keys.len());
        for key in &keys {
            if let Some(pending) = self.writes.get(key) {
                if !pending.is_deleted() {
                    members.push(pending.clone());
                }
                continue;
            }
            members.push(self.cache.get(key)?.clone());
        }
        Some(members)
    }

    // ========================================================================
    // Lazy-load Detection
    // ========================================================================

    /// Warn once a relation has been lazily loaded `threshold` times.
    pub fn enable_lazy_load_detection(&mut self, threshold: usize) {
        self.lazy = Some(LazyLoadTracker::new(threshold));
    }

    pub fn disable_lazy_load_detection(&mut self) {
        self.lazy = None;
    }

    pub fn lazy_load_stats(&self) -> Option<LazyLoadStats> {
        self.lazy.as_ref().map(LazyLoadTracker::stats)
    }

    pub fn lazy_load_tracker(&self) -> Option<&LazyLoadTracker> {
        self.lazy.as_ref()
    }
}

fn transaction_error(kind: TransactionErrorKind, message: impl Into<String>) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.into(),
    })
}

/// Columns whose values differ between two versions of one record.
fn changed_between(before: &EntityRecord, after: &EntityRecord) -> Vec<&'static str> {
    after
        .schema()
        .columns
        .iter()
        .zip(before.value_slice().iter().zip(after.value_slice()))
        .filter(|(_, (old, new))| old != new)
        .map(|(column, _)| column.name)
        .collect()
}

fn stale(key: &IdentityKey) -> Error {
    Error::StaleEntity(StaleEntityError {
        entity: key.entity(),
        key: key.to_string(),
    })
}
