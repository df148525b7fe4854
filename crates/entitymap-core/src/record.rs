//! In-memory entity records with dirty tracking.

use crate::error::{ColumnError, Error, KeyError, Result, StaleEntityError, TypeError};
use crate::identity::IdentityKey;
use crate::row::{FromValue, Row};
use crate::schema::EntitySchema;
use crate::value::Value;

/// Lifecycle state of a record within a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Not yet written to the store
    New,
    /// Loaded from (or written to) the store
    Persistent,
    /// Deleted; further writes are rejected
    Deleted,
}

/// The cached representation of one row.
///
/// `values` always holds one entry per declared column, in storage order.
/// `snapshot` holds the last persisted values and is empty for a new
/// record, so a new record is always dirty.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    schema: &'static EntitySchema,
    key: IdentityKey,
    values: Vec<Value>,
    snapshot: Option<Vec<Value>>,
    state: RecordState,
    version: u64,
}

impl EntityRecord {
    /// Construct a new (not yet persisted) record.
    ///
    /// Columns not supplied are filled by their client generator,
    /// `Value::Default` for auto-increment columns, or NULL.
    #[allow(clippy::result_large_err)]
    pub fn new<'a>(
        schema: &'static EntitySchema,
        assignments: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Self> {
        let mut values: Vec<Option<Value>> = vec![None; schema.columns.len()];
        for (name, value) in assignments {
            let idx = column_index(schema, name)?;
            values[idx] = Some(value);
        }

        let values: Vec<Value> = values
            .into_iter()
            .zip(schema.columns)
            .map(|(value, col)| match value {
                Some(v) if !v.is_null() || !col.primary_key => v,
                _ => match col.generator {
                    Some(generate) => generate(),
                    None if col.auto_increment => Value::Default,
                    None => Value::Null,
                },
            })
            .collect();

        let key = IdentityKey::from_values(schema, &values)?;
        Ok(Self {
            schema,
            key,
            values,
            snapshot: None,
            state: RecordState::New,
            version: 0,
        })
    }

    /// Construct a persistent record from a store row.
    #[allow(clippy::result_large_err)]
    pub fn from_row(schema: &'static EntitySchema, row: &Row) -> Result<Self> {
        let values = values_from_row(schema, row)?;
        let key = IdentityKey::from_values(schema, &values)?;
        Ok(Self {
            schema,
            key,
            snapshot: Some(values.clone()),
            values,
            state: RecordState::Persistent,
            version: 1,
        })
    }

    pub fn schema(&self) -> &'static EntitySchema {
        self.schema
    }

    /// Entity type tag of this record.
    pub fn entity(&self) -> &'static str {
        self.schema.name
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == RecordState::New
    }

    pub fn is_deleted(&self) -> bool {
        self.state == RecordState::Deleted
    }

    /// Whether the store holds a row for this record.
    pub fn is_persisted(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Number of times this record has been persisted.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Current value of `column`.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, column: &str) -> Result<&Value> {
        let idx = column_index(self.schema, column)?;
        Ok(&self.values[idx])
    }

    /// Current value of `column`, converted to `T`.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, column: &str) -> Result<T> {
        T::from_value(self.get(column)?).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(column.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// Assign `column`.
    ///
    /// Deleted records reject writes with `StaleEntity`. Changing a primary
    /// key column is rejected with `InvalidKey`; a new identity needs a
    /// delete and a fresh insert.
    #[allow(clippy::result_large_err)]
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        if self.is_deleted() {
            return Err(self.stale());
        }
        let idx = column_index(self.schema, column)?;
        let value = value.into();
        let col = &self.schema.columns[idx];
        if col.primary_key && !self.values[idx].same_as(&value) {
            return Err(Error::InvalidKey(KeyError {
                entity: self.schema.name,
                column: Some(col.name),
                message: format!("identity of {} cannot change", self.key),
            }));
        }
        self.values[idx] = value;
        Ok(())
    }

    /// Iterate over (column, value) pairs in storage order.
    pub fn values(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.schema
            .columns
            .iter()
            .map(|c| c.name)
            .zip(self.values.iter())
    }

    /// Values in storage order.
    pub fn value_slice(&self) -> &[Value] {
        &self.values
    }

    /// Values of `columns`, in the given order.
    #[allow(clippy::result_large_err)]
    pub fn tuple(&self, columns: &[&str]) -> Result<Vec<Value>> {
        columns
            .iter()
            .map(|c| self.get(c).cloned())
            .collect()
    }

    /// Whether any column differs from the last persisted snapshot.
    pub fn is_dirty(&self) -> bool {
        match &self.snapshot {
            None => true,
            Some(snapshot) => snapshot
                .iter()
                .zip(&self.values)
                .any(|(old, new)| !old.same_as(new)),
        }
    }

    /// Columns whose value differs from the snapshot (all columns when new).
    pub fn changed_columns(&self) -> Vec<&'static str> {
        match &self.snapshot {
            None => self.schema.columns.iter().map(|c| c.name).collect(),
            Some(snapshot) => self
                .schema
                .columns
                .iter()
                .zip(snapshot.iter().zip(&self.values))
                .filter(|(_, (old, new))| !old.same_as(new))
                .map(|(c, _)| c.name)
                .collect(),
        }
    }

    /// Record that the current values were written to the store.
    pub fn mark_persisted(&mut self) {
        self.snapshot = Some(self.values.clone());
        if self.state == RecordState::New {
            self.state = RecordState::Persistent;
        }
        self.version += 1;
    }

    /// Mark the record deleted. Subsequent writes fail with `StaleEntity`.
    pub fn mark_deleted(&mut self) {
        self.state = RecordState::Deleted;
    }

    /// Adopt the key assigned by the store on insert.
    ///
    /// Only pending components (auto-increment) may change.
    #[allow(clippy::result_large_err)]
    pub fn assign_key(&mut self, key: IdentityKey) -> Result<()> {
        if key.entity() != self.schema.name {
            return Err(Error::EntityMismatch(crate::error::EntityMismatchError {
                expected: self.schema.name,
                actual: key.entity(),
            }));
        }
        for (name, value) in key.components() {
            let idx = column_index(self.schema, name)?;
            let current = &self.values[idx];
            if !current.is_default() && !current.same_as(value) {
                return Err(Error::InvalidKey(KeyError {
                    entity: self.schema.name,
                    column: Some(name),
                    message: format!("store assigned {} but record holds {}", value, current),
                }));
            }
            self.values[idx] = value.clone();
        }
        self.key = key;
        Ok(())
    }

    /// Reload values from a store row.
    ///
    /// With `reset_pending_writes` every column takes the stored value. Without
    /// it, dirty columns keep their in-memory value and only clean columns are
    /// overwritten. Either way the snapshot becomes the stored row.
    #[allow(clippy::result_large_err)]
    pub fn refresh(&mut self, row: &Row, reset_pending_writes: bool) -> Result<()> {
        if self.is_deleted() {
            return Err(self.stale());
        }
        let loaded = values_from_row(self.schema, row)?;
        let key = IdentityKey::from_values(self.schema, &loaded)?;
        if key != self.key && !self.key.is_pending() {
            return Err(Error::InvalidKey(KeyError {
                entity: self.schema.name,
                column: None,
                message: format!("refresh of {} received row for {}", self.key, key),
            }));
        }

        if reset_pending_writes {
            self.values.clone_from(&loaded);
        } else {
            let snapshot = self.snapshot.take();
            for (idx, fresh) in loaded.iter().enumerate() {
                let dirty = match &snapshot {
                    Some(s) => !s[idx].same_as(&self.values[idx]),
                    None => true,
                };
                if !dirty {
                    self.values[idx] = fresh.clone();
                }
            }
        }
        self.key = key;
        self.snapshot = Some(loaded);
        if self.state == RecordState::New {
            self.state = RecordState::Persistent;
        }
        Ok(())
    }

    fn stale(&self) -> Error {
        Error::StaleEntity(StaleEntityError {
            entity: self.schema.name,
            key: self.key.to_string(),
        })
    }
}

#[allow(clippy::result_large_err)]
fn column_index(schema: &'static EntitySchema, column: &str) -> Result<usize> {
    schema.column_index(column).ok_or_else(|| {
        Error::UnknownColumn(ColumnError {
            entity: schema.name,
            column: column.to_string(),
        })
    })
}

#[allow(clippy::result_large_err)]
fn values_from_row(schema: &'static EntitySchema, row: &Row) -> Result<Vec<Value>> {
    schema
        .columns
        .iter()
        .map(|col| {
            row.get_by_name(col.name).cloned().ok_or_else(|| {
                Error::Type(TypeError {
                    expected: "declared column",
                    actual: format!("row for '{}' is missing it", schema.name),
                    column: Some(col.name.to_string()),
                })
            })
        })
        .collect()
}
