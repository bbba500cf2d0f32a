// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory state store.
//!
//! Holds records in a map guarded by a single async mutex, which makes every
//! call trivially atomic. Writes can be made to fail on demand to exercise
//! the error paths of callers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::StateStore;
use crate::error::{Result, StoreError};
use crate::record::{Instance, InstanceConfig, Status};

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStateStore {
    buckets: Mutex<HashMap<u32, (Instance, InstanceConfig)>>,
    fail_writes: AtomicBool,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent mutating call fail with [`StoreError::Unavailable`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }

    async fn update_instance<F>(&self, id: u32, mapper: F) -> Result<()>
    where
        F: FnOnce(&mut Instance) + Send,
    {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().await;
        let (instance, _) = buckets.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        mapper(instance);
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn add(&self, instance: &Instance, config: &InstanceConfig) -> Result<()> {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().await;
        buckets.insert(instance.id, (instance.clone(), config.clone()));
        Ok(())
    }

    async fn get(&self, id: u32) -> Result<Option<Instance>> {
        let buckets = self.buckets.lock().await;
        Ok(buckets.get(&id).map(|(instance, _)| instance.clone()))
    }

    async fn get_config(&self, id: u32) -> Result<Option<InstanceConfig>> {
        let buckets = self.buckets.lock().await;
        Ok(buckets.get(&id).map(|(_, config)| config.clone()))
    }

    async fn list(&self) -> Result<Vec<u32>> {
        let buckets = self.buckets.lock().await;
        Ok(buckets.keys().copied().collect())
    }

    async fn remove(&self, id: u32) -> Result<()> {
        self.check_writable()?;
        let mut buckets = self.buckets.lock().await;
        buckets.remove(&id);
        Ok(())
    }

    async fn set_container_id(&self, id: u32, container_id: &str) -> Result<()> {
        self.update_instance(id, |instance| {
            instance.container_id = container_id.to_string();
        })
        .await
    }

    async fn set_status(&self, id: u32, status: Status) -> Result<()> {
        let now = Utc::now();
        self.update_instance(id, move |instance| instance.apply_status(status, now))
            .await
    }
}
