//! Error types for entitymap operations.

use std::fmt;

/// The primary error type for all entitymap operations.
#[derive(Debug)]
pub enum Error {
    /// A required identity component is missing or an identity change was attempted
    InvalidKey(KeyError),
    /// Access to a column the entity type does not declare
    UnknownColumn(ColumnError),
    /// Write to a record whose key was deleted or invalidated
    StaleEntity(StaleEntityError),
    /// A cache capacity was configured with a negative value
    CacheCapacity(CapacityError),
    /// A record was read through the accessors of a different entity type
    EntityMismatch(EntityMismatchError),
    /// An eager-load path names a relationship that does not exist
    EagerLoadPath(EagerLoadPathError),
    /// Value conversion errors
    Type(TypeError),
    /// Backing store errors
    Store(StoreError),
    /// Unit-of-work / transaction state errors
    Transaction(TransactionError),
    /// One or more change listeners failed during delivery
    Hook(HookError),
    /// Configuration errors
    Config(ConfigError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct KeyError {
    pub entity: &'static str,
    pub column: Option<&'static str>,
    pub message: String,
}

#[derive(Debug)]
pub struct ColumnError {
    pub entity: &'static str,
    pub column: String,
}

#[derive(Debug)]
pub struct StaleEntityError {
    pub entity: &'static str,
    pub key: String,
}

#[derive(Debug)]
pub struct CapacityError {
    pub entity: String,
    pub requested: i64,
}

#[derive(Debug)]
pub struct EntityMismatchError {
    /// Entity type the caller asked for
    pub expected: &'static str,
    /// Entity type the record is tagged with
    pub actual: &'static str,
}

#[derive(Debug)]
pub struct EagerLoadPathError {
    /// The full dotted path as requested
    pub path: String,
    /// Entity the failing segment was resolved against
    pub entity: &'static str,
    /// The failing segment (empty for empty segments)
    pub relation: String,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub entity: Option<&'static str>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Row does not exist
    NotFound,
    /// Duplicate key or dangling reference
    Constraint,
    /// Store is unreachable or refused the operation
    Unavailable,
    /// Other store failure
    Other,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction has been started
    NotActive,
    /// The unit of work was closed
    Closed,
    /// A transaction is already in progress
    AlreadyActive,
    /// Savepoint not found
    SavepointNotFound,
}

/// Failures collected while delivering change events.
#[derive(Debug)]
pub struct HookError {
    /// Number of events that were being delivered
    pub events: usize,
    /// One entry per failed listener invocation, in delivery order
    pub failures: Vec<ListenerFailure>,
}

#[derive(Debug)]
pub struct ListenerFailure {
    pub subscription: u64,
    pub message: String,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Build a not-found store error for `entity`.
    pub fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        Error::Store(StoreError {
            kind: StoreErrorKind::NotFound,
            entity: Some(entity),
            message: format!("no {} row with key {}", entity, key),
            source: None,
        })
    }

    /// Is this a missing-row store error?
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Store(e) if e.kind == StoreErrorKind::NotFound)
    }

    /// Is this a retryable error (store unavailable)?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(e) if e.kind == StoreErrorKind::Unavailable)
    }

    /// Did a listener fail during event delivery?
    pub fn is_hook_failure(&self) -> bool {
        matches!(self, Error::Hook(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidKey(e) => write!(f, "Invalid key: {}", e),
            Error::UnknownColumn(e) => write!(f, "Unknown column: {}", e),
            Error::StaleEntity(e) => write!(f, "Stale entity: {}", e),
            Error::CacheCapacity(e) => write!(f, "Cache capacity error: {}", e),
            Error::EntityMismatch(e) => write!(f, "Entity mismatch: {}", e),
            Error::EagerLoadPath(e) => write!(f, "Eager-load path error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Store(e) => write!(f, "Store error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Hook(e) => write!(f, "Hook error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}.{}: {}", self.entity, col, self.message),
            None => write!(f, "{}: {}", self.entity, self.message),
        }
    }
}

impl fmt::Display for ColumnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entity '{}' has no column '{}'",
            self.entity, self.column
        )
    }
}

impl fmt::Display for StaleEntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} has been deleted", self.entity, self.key)
    }
}

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max entries for '{}' must not be negative, got {}",
            self.entity, self.requested
        )
    }
}

impl fmt::Display for EntityMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected a '{}' record, found '{}'",
            self.expected, self.actual
        )
    }
}

impl fmt::Display for EagerLoadPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.relation.is_empty() {
            write!(f, "path '{}' contains an empty segment", self.path)
        } else {
            write!(
                f,
                "'{}' is not a relationship of '{}' (path '{}')",
                self.relation, self.entity, self.path
            )
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.len() == 1 {
            let failure = &self.failures[0];
            write!(
                f,
                "listener {} failed while delivering {} event(s): {}",
                failure.subscription, self.events, failure.message
            )
        } else {
            writeln!(
                f,
                "{} listener failures while delivering {} event(s):",
                self.failures.len(),
                self.events
            )?;
            for failure in &self.failures {
                writeln!(f, "  - listener {}: {}", failure.subscription, failure.message)?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<KeyError> for Error {
    fn from(err: KeyError) -> Self {
        Error::InvalidKey(err)
    }
}

impl From<ColumnError> for Error {
    fn from(err: ColumnError) -> Self {
        Error::UnknownColumn(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::Store(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<HookError> for Error {
    fn from(err: HookError) -> Self {
        Error::Hook(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for entitymap operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_helpers() {
        let err = Error::not_found("hero", "hero(id=7)");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Store error: no hero row with key hero(id=7)");
    }

    #[test]
    fn hook_error_lists_every_failure() {
        let err = Error::Hook(HookError {
            events: 3,
            failures: vec![
                ListenerFailure {
                    subscription: 1,
                    message: "boom".to_string(),
                },
                ListenerFailure {
                    subscription: 4,
                    message: "bang".to_string(),
                },
            ],
        });
        let text = err.to_string();
        assert!(err.is_hook_failure());
        assert!(text.contains("2 listener failures while delivering 3 event(s)"));
        assert!(text.contains("listener 1: boom"));
        assert!(text.contains("listener 4: bang"));
    }

    #[test]
    fn eager_path_messages() {
        let unknown = EagerLoadPathError {
            path: "children.pets".to_string(),
            entity: "child",
            relation: "pets".to_string(),
        };
        assert_eq!(
            unknown.to_string(),
            "'pets' is not a relationship of 'child' (path 'children.pets')"
        );

        let empty = EagerLoadPathError {
            path: "children..toys".to_string(),
            entity: "child",
            relation: String::new(),
        };
        assert!(empty.to_string().contains("empty segment"));
    }

    #[test]
    fn store_error_exposes_source() {
        use std::error::Error as _;

        let io = std::io::Error::other("disk gone");
        let err = Error::Store(StoreError {
            kind: StoreErrorKind::Unavailable,
            entity: None,
            message: "store offline".to_string(),
            source: Some(Box::new(io)),
        });
        assert!(err.is_retryable());
        assert!(err.source().is_some());
    }
}
