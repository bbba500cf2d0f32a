// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bronto State - durable instance records for the node agent.
//!
//! This crate owns the durable representation of every game-server instance
//! assigned to a node. Each instance is stored as a pair of records under the
//! decimal form of its id:
//!
//! ```text
//! entries
//! ├── bucket "42"
//! │   ├── instance  → MessagePack(Instance)
//! │   └── config    → MessagePack(InstanceConfig)
//! └── bucket "43"
//!     ├── instance
//!     └── config
//! ```
//!
//! Both entries of a bucket are created and deleted in a single transaction,
//! and field-level mutations (`set_status`, `set_container_id`) are
//! read-modify-write transactions serialized per store.
//!
//! # Backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`SqliteStateStore`] | SQLite via sqlx, used by the agent binary |
//! | [`MemoryStateStore`] | In-process map, used by tests and embedders |
//!
//! # Modules
//!
//! - [`error`]: Error types for store operations
//! - [`record`]: Instance and config records
//! - [`sqlite`]: SQLite-backed store
//! - [`memory`]: In-memory store

#![deny(missing_docs)]

/// Error types for store operations.
pub mod error;

/// In-memory store implementation.
pub mod memory;

/// Instance and config records.
pub mod record;

/// SQLite-backed store implementation.
pub mod sqlite;

pub use error::{Result, StoreError};
pub use memory::MemoryStateStore;
pub use record::{Instance, InstanceConfig, Status};
pub use sqlite::SqliteStateStore;

use async_trait::async_trait;

/// Bucket key holding the encoded [`Instance`].
pub const INSTANCE_KEY: &str = "instance";

/// Bucket key holding the encoded [`InstanceConfig`].
pub const CONFIG_KEY: &str = "config";

/// Name of the bucket holding the records of instance `id`.
pub fn bucket_name(id: u32) -> String {
    id.to_string()
}

/// Transactional store of `instance id → (Instance, InstanceConfig)`.
///
/// Implementations must apply every mutating call as one atomic transaction:
/// a reader never observes an instance without its config, or a half-applied
/// field update. Duplicate ids are not rejected by [`StateStore::add`]; the
/// caller checks existence first.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store both records of a new instance.
    async fn add(&self, instance: &Instance, config: &InstanceConfig) -> Result<()>;

    /// Get an instance record, `None` when no record exists.
    async fn get(&self, id: u32) -> Result<Option<Instance>>;

    /// Get the launch configuration of an instance, `None` when no record exists.
    async fn get_config(&self, id: u32) -> Result<Option<InstanceConfig>>;

    /// List the ids of all stored instances. Order is unspecified.
    async fn list(&self) -> Result<Vec<u32>>;

    /// Delete both records of an instance. Removing an unknown id is a no-op.
    async fn remove(&self, id: u32) -> Result<()>;

    /// Replace the container id of an existing instance.
    ///
    /// Returns [`StoreError::NotFound`] if the instance does not exist.
    async fn set_container_id(&self, id: u32, container_id: &str) -> Result<()>;

    /// Replace the status of an existing instance.
    ///
    /// Moving to [`Status::Starting`] also stamps `start_time` in the same
    /// transaction. Returns [`StoreError::NotFound`] if the instance does not
    /// exist.
    async fn set_status(&self, id: u32, status: Status) -> Result<()>;
}
