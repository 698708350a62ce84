//! Error type shared by every storage component.

use std::io;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything that can go wrong inside the flat-file store.
///
/// Validation, not-found and conflict failures are kept apart so the HTTP
/// layer can map them to different status codes (see [`StoreError::status_code`]).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Caller supplied bad input (malformed URL, short code, missing field).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced short code or user does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A unique key (short code, username) is already taken.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials were rejected or the account is inactive.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Too many attempts inside the current rate-limit window.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Disk I/O failed.
    #[error("storage error while {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: io::Error,
    },

    /// A table file could not be parsed or written as CSV.
    #[error("csv error in {file}: {source}")]
    Csv {
        file: String,
        #[source]
        source: csv::Error,
    },

    /// A table header matched none of the known layouts.
    #[error("unsupported schema for {file}: [{header}]")]
    UnsupportedSchema { file: String, header: String },

    /// The click-table migration could not complete.
    #[error("migration of {file} failed: {reason}")]
    Migration { file: String, reason: String },

    /// Random short-code generation hit its retry cap.
    #[error("could not generate a unique short code after {0} attempts")]
    CodeSpaceExhausted(u32),

    /// Key derivation failed.
    #[error("password hashing failed: {0}")]
    Password(String),
}

impl StoreError {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        StoreError::NotFound(msg.into())
    }

    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        StoreError::Conflict(msg.into())
    }

    pub fn unauthorized<T: Into<String>>(msg: T) -> Self {
        StoreError::Unauthorized(msg.into())
    }

    pub fn rate_limited<T: Into<String>>(msg: T) -> Self {
        StoreError::RateLimited(msg.into())
    }

    pub fn storage<T: Into<String>>(context: T, source: io::Error) -> Self {
        StoreError::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn csv<T: Into<String>>(file: T, source: csv::Error) -> Self {
        StoreError::Csv {
            file: file.into(),
            source,
        }
    }

    /// Transport status the request layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::Validation(_) => 400,
            StoreError::Unauthorized(_) => 401,
            StoreError::NotFound(_) => 404,
            StoreError::Conflict(_) => 409,
            StoreError::RateLimited(_) => 429,
            StoreError::Storage { .. }
            | StoreError::Csv { .. }
            | StoreError::UnsupportedSchema { .. }
            | StoreError::Migration { .. }
            | StoreError::CodeSpaceExhausted(_)
            | StoreError::Password(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_map_to_distinct_statuses() {
        assert_eq!(StoreError::validation("bad url").status_code(), 400);
        assert_eq!(StoreError::not_found("abc123").status_code(), 404);
        assert_eq!(StoreError::conflict("taken").status_code(), 409);
        assert_eq!(StoreError::unauthorized("nope").status_code(), 401);
        assert_eq!(StoreError::rate_limited("login").status_code(), 429);
    }

    #[test]
    fn storage_error_keeps_context() {
        let err = StoreError::storage(
            "writing urls.csv",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.status_code(), 500);
        assert!(err.to_string().contains("writing urls.csv"));
        assert!(err.to_string().contains("denied"));
    }
}
