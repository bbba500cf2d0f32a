// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bronto-agent.

use thiserror::Error;

use crate::runtime::RuntimeError;
use bronto_state::StoreError;

/// Agent errors.
///
/// The first four variants are the sentinels callers branch on; everything
/// else is an opaque failure carrying the operation that produced it.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An instance with this id already exists.
    #[error("Instance already exists: {0}")]
    AlreadyExists(u32),

    /// No instance with this id exists.
    #[error("Instance does not exist: {0}")]
    DoesNotExist(u32),

    /// The instance is not offline.
    #[error("Instance is running: {0}")]
    IsRunning(u32),

    /// The instance is not running.
    #[error("Instance is not running: {0}")]
    IsNotRunning(u32),

    /// Every attach session of the instance is in use.
    #[error("Attach session limit reached for instance {0}")]
    AttachLimitReached(u32),

    /// State store operation failed.
    #[error("{operation}: {source}")]
    Store {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },

    /// Container runtime operation failed.
    #[error("{operation}: {source}")]
    Runtime {
        /// Operation that failed.
        operation: &'static str,
        /// Underlying runtime error.
        #[source]
        source: RuntimeError,
    },

    /// The data directory of an instance could not be resolved.
    #[error("Invalid data directory '{path}': {source}")]
    DataDirectory {
        /// Configured path.
        path: String,
        /// Resolution error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A transition task ended abnormally.
    #[error("Transition task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The instance does not exist.
    NotFound,
    /// The request conflicts with the current instance state.
    Conflict,
    /// A store, runtime or I/O failure.
    Backend,
    /// Invalid configuration.
    Configuration,
}

impl Error {
    /// Wrap a store error with the name of the failed operation.
    pub fn store(operation: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| Error::Store { operation, source }
    }

    /// Wrap a runtime error with the name of the failed operation.
    pub fn runtime(operation: &'static str) -> impl FnOnce(RuntimeError) -> Self {
        move |source| Error::Runtime { operation, source }
    }

    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DoesNotExist(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_)
            | Error::IsRunning(_)
            | Error::IsNotRunning(_)
            | Error::AttachLimitReached(_) => ErrorKind::Conflict,
            Error::DataDirectory { .. } | Error::Config(_) => ErrorKind::Configuration,
            Error::Store { .. } | Error::Runtime { .. } | Error::Io(_) | Error::Task(_) => {
                ErrorKind::Backend
            }
        }
    }

    /// HTTP status code the management API answers with.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Backend | ErrorKind::Configuration => 500,
        }
    }
}

/// Result type using the agent [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_status_codes() {
        assert_eq!(Error::DoesNotExist(1).http_status(), 404);
        assert_eq!(Error::AlreadyExists(1).http_status(), 409);
        assert_eq!(Error::IsRunning(1).http_status(), 409);
        assert_eq!(Error::IsNotRunning(1).http_status(), 409);
        assert_eq!(Error::AttachLimitReached(1).http_status(), 409);
    }

    #[test]
    fn test_backend_errors_are_internal() {
        let err = Error::store("get instance")(StoreError::Unavailable("gone".to_string()));
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.http_status(), 500);
        assert_eq!(err.to_string(), "get instance: Store unavailable: gone");

        let err = Error::runtime("start container")(RuntimeError::Other("boom".to_string()));
        assert_eq!(err.http_status(), 500);
        assert!(err.to_string().starts_with("start container: "));
    }

    #[test]
    fn test_data_directory_is_configuration() {
        let err = Error::DataDirectory {
            path: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty path"),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.http_status(), 500);
    }
}
