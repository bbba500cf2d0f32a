// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for bronto-state.

use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Applying the schema migrations failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A record could not be encoded.
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A stored record could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// No record exists for the instance.
    #[error("Instance not found: {0}")]
    NotFound(u32),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether this error reports a missing instance record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
