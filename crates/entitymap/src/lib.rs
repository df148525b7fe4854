//! entitymap - a schema-aware, identity-mapped entity cache.
//!
//! One [`UnitOfWork`] is one transactional scope. It owns:
//!
//! - an [`EntityCache`] holding at most one record per [`IdentityKey`],
//!   bounded per entity type and evicted least-recently-used first
//! - a change buffer whose [`ChangeEvent`]s are collapsed per key and
//!   delivered to [`HookRegistry`] listeners on flush and commit
//! - a write set flushed in foreign-key order
//!
//! Relationships declared as [`ReferencePath`]s are loaded by the
//! [`ReferenceResolver`] with one batched query per relationship level.
//!
//! # Quick Start
//!
//! ```ignore
//! use entitymap::prelude::*;
//!
//! static AUTHOR: EntitySchema = EntitySchema::new(
//!     "author",
//!     "authors",
//!     &[ColumnDef::new("id").primary_key(true).auto_increment(true), ColumnDef::new("name")],
//! )
//! .relations(&[ReferencePath::new("books", "author", RelationKind::OneToMany, &BOOK)
//!     .foreign_key(&["author_id"])]);
//!
//! async fn example(cx: &Cx, store: MemoryStore) {
//!     let mut uow = UnitOfWork::new(store);
//!     let author = EntityRecord::new(&AUTHOR, [("name", Value::from("Le Guin"))]).unwrap();
//!     let key = uow.create(cx, author).await.unwrap();
//!     let roots = vec![uow.get(&key).cloned().unwrap()];
//!     uow.eager_load_paths(cx, &AUTHOR, &roots, &["books"]).await.unwrap();
//!     uow.commit(cx).await.unwrap();
//! }
//! ```

pub use entitymap_core::error::{
    CapacityError, ColumnError, ConfigError, EagerLoadPathError, EntityMismatchError, HookError,
    KeyError, ListenerFailure, StaleEntityError, StoreError, StoreErrorKind, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use entitymap_core::{
    BackingStore, Column, ColumnDef, ColumnInfo, Cx, Entity, EntityRecord, EntitySchema, Error,
    FromValue, IdentityKey, JoinTable, LinkedRow, OrderBy, Outcome, RecordState, ReferencePath,
    RelationKind, Result, Row, SortDirection, Value, ValueGenerator, ensure_entity,
    is_valid_identifier,
};
pub use entitymap_session::{
    CachePolicy, CacheStats, ChangeBuffer, ChangeEvent, ChangeType, EagerLoadReport, EagerPlan,
    EntityCache, FlushOrderer, FlushPlan, FlushResult, FlushSummary, HookGuard, HookRegistry,
    IncludePath, LazyLoadStats, LazyLoadTracker, Listener, LoadSite, PendingCounts, PendingOp,
    ReferenceResolver, StagedLoad, SubscriptionId, UnitOfWork, UnitOfWorkConfig, UnitOfWorkId,
    WriteSet,
};

#[cfg(feature = "memory")]
pub use entitymap_memory::{MemoryStore, StoreOp, StoreStats};

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        // Store
        BackingStore,
        CachePolicy,
        ChangeEvent,
        ChangeType,
        Column,
        ColumnDef,
        // asupersync
        Cx,
        EagerPlan,
        Entity,
        EntityRecord,
        EntitySchema,
        Error,
        HookRegistry,
        IdentityKey,
        JoinTable,
        OrderBy,
        Outcome,
        ReferencePath,
        RelationKind,
        Result,
        // Unit of work
        UnitOfWork,
        UnitOfWorkConfig,
        Value,
    };

    #[cfg(feature = "memory")]
    pub use crate::MemoryStore;
}
