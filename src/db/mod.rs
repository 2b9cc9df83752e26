pub mod pool;
pub mod repository;
pub mod sqlite;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable at {path}: {reason}")]
    StorageUnavailable { path: String, reason: String },

    #[error("store schema v{found} is newer than this build supports (v{supported})")]
    IncompatibleSchema { found: i64, supported: i64 },

    #[error("migration to v{version} failed: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("operation canceled")]
    Cancelled,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True for conditions that prevent the application from reaching a
    /// usable state; the host must report them and exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::StorageUnavailable { .. }
                | StoreError::IncompatibleSchema { .. }
                | StoreError::MigrationFailed { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Map a rusqlite error to `ConstraintViolation` when it is one, so callers
/// can re-prompt instead of treating it as an internal failure.
pub(crate) fn map_constraint(err: rusqlite::Error, detail: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::ConstraintViolation(detail.to_string())
        }
        _ => StoreError::Sqlite(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_covers_startup_errors() {
        assert!(StoreError::StorageUnavailable {
            path: "/db".into(),
            reason: "gone".into()
        }
        .is_fatal());
        assert!(StoreError::IncompatibleSchema {
            found: 9,
            supported: 3
        }
        .is_fatal());
        assert!(StoreError::MigrationFailed {
            version: 2,
            reason: "syntax".into()
        }
        .is_fatal());

        assert!(!StoreError::Validation {
            field: "last_name",
            reason: "empty".into()
        }
        .is_fatal());
        assert!(!StoreError::NotFound {
            entity: "patient",
            id: "x".into()
        }
        .is_fatal());
        assert!(!StoreError::Cancelled.is_fatal());
    }

    #[test]
    fn validation_message_names_the_field() {
        let err = StoreError::Validation {
            field: "contact_number",
            reason: "must contain 10 or 11 digits".into(),
        };
        let text = err.to_string();
        assert!(text.contains("contact_number"));
    }
}
