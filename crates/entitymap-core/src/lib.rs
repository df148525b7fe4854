//! Core types and traits for entitymap.
//!
//! This crate provides the foundational abstractions of the entity cache:
//!
//! - `EntitySchema` / `ColumnDef` / `ReferencePath` static metadata
//! - `IdentityKey` and `EntityRecord`, the units the cache stores
//! - `Entity` and `Column<T>` for typed access to records
//! - `BackingStore` trait for the persistent side
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod entity;
pub mod error;
pub mod identity;
pub mod record;
pub mod relationship;
pub mod row;
pub mod schema;
pub mod store;
pub mod value;

pub use entity::{Column, Entity, ensure_entity};
pub use error::{
    CapacityError, ColumnError, ConfigError, EagerLoadPathError, EntityMismatchError, Error,
    HookError, KeyError, ListenerFailure, Result, StaleEntityError, StoreError, StoreErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use identity::IdentityKey;
pub use record::{EntityRecord, RecordState};
pub use relationship::{JoinTable, OrderBy, ReferencePath, RelationKind, SortDirection};
pub use row::{ColumnInfo, FromValue, Row};
pub use schema::{ColumnDef, EntitySchema, ValueGenerator, is_valid_identifier};
pub use store::{BackingStore, LinkedRow};
pub use value::Value;
