// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for warehouse operations
//!
//! Schema errors describe an invalid record and are never retried. Backend errors
//! are retried inside the blob and registry layers only when they are transient;
//! everything that escapes those layers is reported with enough context for the
//! caller to decide whether to retry the whole operation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WarehouseError>;

/// A record does not satisfy its schema, or a schema declaration is malformed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("missing primary key field '{field}'")]
    MissingPrimaryKey { field: String },

    #[error("missing required metadata field '{field}'")]
    MissingRequiredMetadata { field: String },

    #[error("type mismatch for field '{field}': expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("invalid schema declaration: {0}")]
    InvalidDeclaration(String),
}

impl SchemaError {
    pub fn type_mismatch(
        field: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        SchemaError::TypeMismatch {
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

/// Failures reported by the index backend or the blob backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("strongly consistent read unavailable: {0}")]
    ConsistentReadUnavailable(String),

    #[error("conditional write conflict on {0}")]
    Conflict(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("corrupt index document {key}: {source}")]
    CorruptDocument {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl BackendError {
    /// Transient failures (timeouts, throttling) are the only ones worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Transient(_)
                | BackendError::ObjectStore(object_store::Error::Generic { .. })
        )
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::ObjectStore(object_store::Error::NotFound { .. })
        )
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BackendError::Conflict(_)
                | BackendError::ObjectStore(object_store::Error::Precondition { .. })
                | BackendError::ObjectStore(object_store::Error::AlreadyExists { .. })
        )
    }
}

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error(
        "transfer of {locator} failed{} after {attempts} attempt(s): {source}",
        chunk.map(|c| format!(" at chunk {c}")).unwrap_or_default()
    )]
    TransferFailed {
        locator: String,
        chunk: Option<usize>,
        attempts: usize,
        #[source]
        source: BackendError,
    },

    #[error("integrity check failed for {locator}: expected {expected}, got {actual}")]
    IntegrityError {
        locator: String,
        expected: String,
        actual: String,
    },

    #[error("consistent read of {key} in {namespace} could not be satisfied: {reason}")]
    ConsistencyViolation {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("migration of entry {key} failed: {reason}")]
    MigrationEntryFailed { key: String, reason: String },

    #[error("{namespace} was superseded by v{active} while the write was in flight")]
    VersionSuperseded { namespace: String, active: u32 },

    #[error("backend version {actual} is older than the required minimum {required}")]
    BackendTooOld { required: String, actual: String },

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("dataset '{dataset}' has no schema version {version}")]
    UnknownSchemaVersion { dataset: String, version: u32 },

    #[error("dataset '{dataset}' has no parser '{parser}'")]
    UnknownParser { dataset: String, parser: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<object_store::Error> for WarehouseError {
    fn from(e: object_store::Error) -> Self {
        WarehouseError::Backend(BackendError::ObjectStore(e))
    }
}

impl WarehouseError {
    /// Whether retrying the whole operation later could succeed
    ///
    /// Schema errors and argument errors never qualify: the input itself is wrong.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            WarehouseError::TransferFailed { .. }
            | WarehouseError::ConsistencyViolation { .. }
            | WarehouseError::VersionSuperseded { .. }
            | WarehouseError::DeadlineExceeded => true,
            WarehouseError::Backend(e) => e.is_transient() || e.is_conflict(),
            _ => false,
        }
    }

    /// Whether this error stops a migration run instead of failing one entry
    #[must_use]
    pub fn aborts_migration(&self) -> bool {
        match self {
            WarehouseError::Backend(e) => !e.is_conflict(),
            WarehouseError::ConsistencyViolation { .. }
            | WarehouseError::BackendTooOld { .. }
            | WarehouseError::Cancelled
            | WarehouseError::DeadlineExceeded => true,
            _ => false,
        }
    }
}
