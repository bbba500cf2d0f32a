// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed state store.
//!
//! SQLite is used as an ordered, bucket-scoped byte store: the `entries`
//! table is keyed by `(bucket, key)` and values are MessagePack blobs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::record::{Instance, InstanceConfig, Status};
use crate::{CONFIG_KEY, INSTANCE_KEY, StateStore, bucket_name};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed state store.
///
/// Writers are serialized through an in-process lock so that every
/// read-modify-write runs as the only writer transaction of this store.
#[derive(Clone)]
pub struct SqliteStateStore {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl SqliteStateStore {
    /// Create a store from an existing pool. Migrations are not applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Create and initialize a store from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;

        debug!(path = %path.display(), "Opened state store");
        Ok(store)
    }

    /// Create an initialized store backed by a private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn read_entry<T: DeserializeOwned>(&self, id: u32, key: &str) -> Result<Option<T>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM entries WHERE bucket = ? AND key = ?")
                .bind(bucket_name(id))
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((data,)) => Ok(Some(rmp_serde::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn update_instance<F>(&self, id: u32, mapper: F) -> Result<()>
    where
        F: FnOnce(&mut Instance) + Send,
    {
        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT value FROM entries WHERE bucket = ? AND key = ?")
                .bind(bucket_name(id))
                .bind(INSTANCE_KEY)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((data,)) = row else {
            return Err(StoreError::NotFound(id));
        };

        let mut instance: Instance = rmp_serde::from_slice(&data)?;
        mapper(&mut instance);
        let data = encode(&instance)?;

        sqlx::query(
            r#"
            UPDATE entries
            SET value = ?, updated_at = CURRENT_TIMESTAMP
            WHERE bucket = ? AND key = ?
            "#,
        )
        .bind(data)
        .bind(bucket_name(id))
        .bind(INSTANCE_KEY)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn add(&self, instance: &Instance, config: &InstanceConfig) -> Result<()> {
        let instance_data = encode(instance)?;
        let config_data = encode(config)?;
        let bucket = bucket_name(instance.id);

        let _writer = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        for (key, data) in [(INSTANCE_KEY, instance_data), (CONFIG_KEY, config_data)] {
            sqlx::query(
                r#"
                INSERT INTO entries (bucket, key, value, updated_at)
                VALUES (?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(bucket, key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(bucket.as_str())
            .bind(key)
            .bind(data)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: u32) -> Result<Option<Instance>> {
        self.read_entry(id, INSTANCE_KEY).await
    }

    async fn get_config(&self, id: u32) -> Result<Option<InstanceConfig>> {
        self.read_entry(id, CONFIG_KEY).await
    }

    async fn list(&self) -> Result<Vec<u32>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT bucket FROM entries WHERE key = ?")
            .bind(INSTANCE_KEY)
            .fetch_all(&self.pool)
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for (bucket,) in rows {
            match bucket.parse::<u32>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(bucket = %bucket, "Skipping bucket with non-numeric name"),
            }
        }
        Ok(ids)
    }

    async fn remove(&self, id: u32) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        sqlx::query("DELETE FROM entries WHERE bucket = ?")
            .bind(bucket_name(id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_container_id(&self, id: u32, container_id: &str) -> Result<()> {
        let container_id = container_id.to_string();
        self.update_instance(id, move |instance| instance.container_id = container_id)
            .await
    }

    async fn set_status(&self, id: u32, status: Status) -> Result<()> {
        let now = Utc::now();
        self.update_instance(id, move |instance| instance.apply_status(status, now))
            .await
    }
}
