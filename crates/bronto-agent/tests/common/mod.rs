// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test fixtures for bronto-agent integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bronto_agent::runtime::MockRuntime;
use bronto_agent::{InstanceManager, ManagerOptions};
use bronto_state::{InstanceConfig, MemoryStateStore, SqliteStateStore, StateStore};

/// Manager wired to a mock runtime, with handles to both fakes.
pub struct Harness {
    pub manager: InstanceManager,
    pub store: Arc<dyn StateStore>,
    pub runtime: Arc<MockRuntime>,
}

pub fn test_options() -> ManagerOptions {
    ManagerOptions {
        stop_grace: Duration::from_secs(1),
        max_attach_sessions: 2,
        log_buffer: 16,
        ..ManagerOptions::default()
    }
}

pub fn test_config(data_directory: &str) -> InstanceConfig {
    InstanceConfig {
        data_directory: data_directory.to_string(),
        server_jar: "paper.jar".to_string(),
        args: vec!["-nogui".to_string()],
        listen_port: 25565,
    }
}

/// Harness over an in-memory store.
pub fn memory_harness(runtime: MockRuntime) -> Harness {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    harness_with(store, runtime)
}

/// Harness over a SQLite in-memory database.
pub async fn sqlite_harness(runtime: MockRuntime) -> Harness {
    let store: Arc<dyn StateStore> = Arc::new(
        SqliteStateStore::in_memory()
            .await
            .expect("Failed to open in-memory SQLite store"),
    );
    harness_with(store, runtime)
}

pub fn harness_with(store: Arc<dyn StateStore>, runtime: MockRuntime) -> Harness {
    let runtime = Arc::new(runtime);
    let manager = InstanceManager::new(store.clone(), runtime.clone(), test_options());
    Harness {
        manager,
        store,
        runtime,
    }
}

impl Harness {
    /// Container id recorded for an instance.
    pub async fn container_id(&self, id: u32) -> String {
        self.store
            .get(id)
            .await
            .expect("store read failed")
            .expect("instance should exist")
            .container_id
    }
}
