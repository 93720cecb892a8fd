//! Error types for ddq-rs.

use thiserror::Error;

/// SQLSTATE for a unique/primary-key violation.
const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE for a detected deadlock.
const DEADLOCK_DETECTED: &str = "40P01";
/// SQLSTATE for a serialization failure under concurrent transactions.
const SERIALIZATION_FAILURE: &str = "40001";

#[derive(Debug, Error)]
pub enum Error {
    /// A record with the same identity already exists.
    #[error("duplicate record: {0}")]
    DuplicateKey(String),

    /// The store aborted the statement to break a lock cycle.
    #[error("lock conflict: {0}")]
    Deadlock(String),

    /// Consecutive lock conflicts went past the configured limit.
    #[error("{operation} hit {limit} consecutive lock conflicts")]
    DeadlockLimitExceeded {
        operation: &'static str,
        limit: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("could not send message after {attempts} attempt(s)")]
    SendExhausted { attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[source] sqlx::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Lock conflicts and duplicate keys are retried locally before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::DuplicateKey(_) | Error::Deadlock(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db| db.code())
            .map(|c| c.into_owned());

        match code.as_deref() {
            Some(UNIQUE_VIOLATION) => Error::DuplicateKey(err.to_string()),
            Some(DEADLOCK_DETECTED) | Some(SERIALIZATION_FAILURE) => {
                Error::Deadlock(err.to_string())
            }
            _ => Error::Storage(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_conflicts_only() {
        assert!(Error::DuplicateKey("x".into()).is_transient());
        assert!(Error::Deadlock("x".into()).is_transient());
        assert!(!Error::SendExhausted { attempts: 3 }.is_transient());
        assert!(!Error::Storage(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn non_database_sqlx_errors_stay_storage_errors() {
        let err: Error = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, Error::Storage(sqlx::Error::RowNotFound)));
    }

    #[test]
    fn deadlock_limit_keeps_the_last_conflict_as_source() {
        use std::error::Error as _;

        let err = Error::DeadlockLimitExceeded {
            operation: "claim",
            limit: 2,
            source: Box::new(Error::Deadlock("deadlock detected".into())),
        };
        assert!(err.to_string().contains("claim"));
        assert!(err.source().is_some());
    }
}
