// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance lifecycle manager.
//!
//! Owns the instance state machine:
//!
//! ```text
//! Offline ──start──► Starting ──container running──► Running ──stop──► Offline
//!    ▲                  │
//!    └───start failed───┘          Error: left only by remove
//! ```
//!
//! State transitions (`start`, `stop`, `remove`, `add`) are serialized per
//! instance id and run in detached tasks, so a caller that goes away never
//! leaves a transition half applied. Reads (`instance_status`,
//! `get_instance`) take no lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterOptions, ContainerAdapter};
use crate::bridge::{self, LogStream};
use crate::config::{DEFAULT_CONTAINER_PREFIX, DEFAULT_SERVER_IMAGE};
use crate::error::{Error, Result};
use crate::runtime::{AttachOptions, ContainerRuntime, RuntimeError};
use bronto_state::{Instance, InstanceConfig, StateStore, Status};

/// Manager settings.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Image game-server containers are created from
    pub server_image: String,
    /// Prefix of container names
    pub container_prefix: String,
    /// Grace period before a stopping server is killed
    pub stop_grace: Duration,
    /// Concurrent attach sessions per instance
    pub max_attach_sessions: usize,
    /// Lines buffered per log stream
    pub log_buffer: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            server_image: DEFAULT_SERVER_IMAGE.to_string(),
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            stop_grace: Duration::from_secs(60),
            max_attach_sessions: 4,
            log_buffer: 256,
        }
    }
}

/// Status of an instance as reported to API clients.
///
/// `startTime` is only present while the instance is starting or running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Current status
    pub status: Status,
    /// When the current run started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

impl From<&Instance> for StatusReport {
    fn from(instance: &Instance) -> Self {
        Self {
            status: instance.status,
            start_time: if instance.status.is_active() {
                instance.start_time
            } else {
                None
            },
        }
    }
}

type LockMap = StdMutex<HashMap<u32, Arc<Mutex<()>>>>;

/// Exclusive hold on one instance id.
///
/// On drop, the id's mutex is discarded from the lock map when nobody else
/// holds or waits for it.
struct InstanceLock {
    id: u32,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(&self.id)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

struct ManagerInner {
    store: Arc<dyn StateStore>,
    adapter: ContainerAdapter,
    options: ManagerOptions,
    locks: Arc<LockMap>,
    attach_limits: StdMutex<HashMap<u32, Arc<Semaphore>>>,
    stream_tokens: StdMutex<HashMap<u32, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Instance lifecycle manager.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct InstanceManager {
    inner: Arc<ManagerInner>,
}

impl InstanceManager {
    /// Create a manager over a store and a container runtime.
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        options: ManagerOptions,
    ) -> Self {
        let adapter = ContainerAdapter::new(
            store.clone(),
            runtime,
            AdapterOptions {
                server_image: options.server_image.clone(),
                container_prefix: options.container_prefix.clone(),
                stop_grace: options.stop_grace,
            },
        );

        Self {
            inner: Arc::new(ManagerInner {
                store,
                adapter,
                options,
                locks: Arc::new(StdMutex::new(HashMap::new())),
                attach_limits: StdMutex::new(HashMap::new()),
                stream_tokens: StdMutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a new instance. No container is created.
    pub async fn add_instance(&self, id: u32, config: InstanceConfig) -> Result<()> {
        self.detached(move |inner| async move { inner.add(id, config).await })
            .await
    }

    /// Current status of an instance.
    pub async fn instance_status(&self, id: u32) -> Result<Status> {
        Ok(self.inner.load(id).await?.status)
    }

    /// Full record of an instance.
    pub async fn get_instance(&self, id: u32) -> Result<Instance> {
        self.inner.load(id).await
    }

    /// Status of an instance shaped for API responses.
    pub async fn status_report(&self, id: u32) -> Result<StatusReport> {
        let instance = self.inner.load(id).await?;
        Ok(StatusReport::from(&instance))
    }

    /// Ids of all known instances, ascending.
    pub async fn list_instances(&self) -> Result<Vec<u32>> {
        let mut ids = self
            .inner
            .store
            .list()
            .await
            .map_err(Error::store("list instances"))?;
        ids.sort_unstable();
        Ok(ids)
    }

    /// Start an offline instance, creating its container on first start.
    pub async fn start_instance(&self, id: u32) -> Result<()> {
        self.detached(move |inner| async move { inner.start(id).await })
            .await
    }

    /// Gracefully stop a running instance.
    pub async fn stop_instance(&self, id: u32) -> Result<()> {
        self.detached(move |inner| async move { inner.stop(id).await })
            .await
    }

    /// Remove an instance and its container. Unknown ids are ignored.
    pub async fn remove_instance(&self, id: u32) -> Result<()> {
        self.detached(move |inner| async move { inner.remove(id).await })
            .await
    }

    /// Stream the combined output of a running instance.
    ///
    /// The stream ends when the server's output closes, when the instance is
    /// stopped or removed, or on [`InstanceManager::shutdown`].
    pub async fn logs(&self, id: u32) -> Result<LogStream> {
        let inner = &self.inner;
        let instance = inner.load(id).await?;
        if instance.status != Status::Running {
            return Err(Error::IsNotRunning(id));
        }

        let permit = inner.acquire_attach(id)?;
        let cancel = inner.stream_token(id);
        let session = inner
            .adapter
            .attach(&instance.container_id, AttachOptions::output())
            .await?;

        // The instance may have been stopped or removed while attaching.
        match inner.load(id).await {
            Ok(current) if current.status == Status::Running && !cancel.is_cancelled() => {}
            Ok(current) => {
                if current.status != Status::Running {
                    inner.close_streams(id);
                }
                return Err(Error::IsNotRunning(id));
            }
            Err(Error::DoesNotExist(_)) => {
                inner.close_streams(id);
                return Err(Error::DoesNotExist(id));
            }
            Err(e) => return Err(e),
        }

        debug!(instance_id = id, container_id = %instance.container_id, "Opened log stream");
        Ok(bridge::spawn_log_pump(
            id,
            session,
            permit,
            cancel,
            inner.options.log_buffer,
        ))
    }

    /// Write one command line to a running instance's console.
    pub async fn send_command(&self, id: u32, text: &str) -> Result<()> {
        let inner = &self.inner;
        let instance = inner.load(id).await?;
        if instance.status != Status::Running {
            return Err(Error::IsNotRunning(id));
        }

        let _permit = inner.acquire_attach(id)?;
        let session = inner
            .adapter
            .attach(&instance.container_id, AttachOptions::input())
            .await?;

        bridge::send_line(session, text).await?;
        debug!(instance_id = id, "Sent command");
        Ok(())
    }

    /// Reset instances left in `Starting` by an interrupted agent to `Offline`.
    ///
    /// Returns the ids that were reset.
    pub async fn recover_interrupted(&self) -> Result<Vec<u32>> {
        let mut recovered = Vec::new();
        for id in self.list_instances().await? {
            let reset = self
                .detached(move |inner| async move { inner.recover(id).await })
                .await?;
            if reset {
                recovered.push(id);
            }
        }
        Ok(recovered)
    }

    /// End every open log stream.
    pub fn shutdown(&self) {
        info!("Instance manager shutting down");
        self.inner.shutdown.cancel();
    }

    /// Run a transition in its own task so it completes even if the caller
    /// stops polling.
    async fn detached<F, Fut, T>(&self, transition: F) -> Result<T>
    where
        F: FnOnce(Arc<ManagerInner>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(transition(self.inner.clone())).await?
    }
}

impl ManagerInner {
    async fn load(&self, id: u32) -> Result<Instance> {
        self.store
            .get(id)
            .await
            .map_err(Error::store("get instance"))?
            .ok_or(Error::DoesNotExist(id))
    }

    async fn lock_instance(&self, id: u32) -> InstanceLock {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        InstanceLock {
            id,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    fn acquire_attach(&self, id: u32) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut limits = self
                .attach_limits
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            limits
                .entry(id)
                .or_insert_with(|| {
                    let permits = if self.adapter.supports_multiplexed_attach() {
                        self.options.max_attach_sessions.max(1)
                    } else {
                        1
                    };
                    Arc::new(Semaphore::new(permits))
                })
                .clone()
        };
        semaphore
            .try_acquire_owned()
            .map_err(|_| Error::AttachLimitReached(id))
    }

    /// A fresh token for one stream, cancelled with the instance's streams.
    fn stream_token(&self, id: u32) -> CancellationToken {
        let mut tokens = self
            .stream_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tokens
            .entry(id)
            .or_insert_with(|| self.shutdown.child_token())
            .child_token()
    }

    fn close_streams(&self, id: u32) {
        let token = self
            .stream_tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(token) = token {
            token.cancel();
            debug!(instance_id = id, "Closed log streams");
        }
    }

    async fn set_status(&self, id: u32, status: Status) -> Result<()> {
        self.store
            .set_status(id, status)
            .await
            .map_err(Error::store("set instance status"))
    }

    async fn add(&self, id: u32, config: InstanceConfig) -> Result<()> {
        let _lock = self.lock_instance(id).await;

        let existing = self
            .store
            .get(id)
            .await
            .map_err(Error::store("get instance"))?;
        if existing.is_some() {
            return Err(Error::AlreadyExists(id));
        }

        self.store
            .add(&Instance::new(id), &config)
            .await
            .map_err(Error::store("add instance"))?;

        info!(
            instance_id = id,
            data_directory = %config.data_directory,
            listen_port = config.listen_port,
            "Added instance"
        );
        Ok(())
    }

    async fn start(&self, id: u32) -> Result<()> {
        let _lock = self.lock_instance(id).await;

        let instance = self.load(id).await?;
        if instance.status != Status::Offline {
            return Err(Error::IsRunning(id));
        }

        self.set_status(id, Status::Starting).await?;

        let container_id = match self.adapter.ensure_container(id).await {
            Ok(container_id) => container_id,
            Err(e) => {
                self.revert_start(id).await;
                return Err(e);
            }
        };

        if let Err(e) = self.adapter.start(&container_id).await {
            self.revert_start(id).await;
            return Err(e);
        }

        if let Err(e) = self.set_status(id, Status::Running).await {
            self.abort_started(id, &container_id).await;
            return Err(e);
        }

        info!(instance_id = id, container_id = %container_id, "Started instance");
        Ok(())
    }

    /// Return a failed start to `Offline`.
    async fn revert_start(&self, id: u32) {
        if let Err(e) = self.set_status(id, Status::Offline).await {
            error!(instance_id = id, error = %e, "Failed to revert instance to Offline after failed start");
        }
    }

    /// Undo a container start whose `Running` status could not be recorded.
    async fn abort_started(&self, id: u32, container_id: &str) {
        match self.adapter.stop(container_id).await {
            Ok(()) => self.revert_start(id).await,
            Err(stop_err) => {
                error!(
                    instance_id = id,
                    container_id = %container_id,
                    error = %stop_err,
                    "Failed to stop container after failed start"
                );
                if let Err(e) = self.set_status(id, Status::Error).await {
                    error!(instance_id = id, error = %e, "Failed to mark instance as Error");
                }
            }
        }
    }

    async fn stop(&self, id: u32) -> Result<()> {
        let _lock = self.lock_instance(id).await;

        let instance = self.load(id).await?;
        if instance.status != Status::Running {
            return Err(Error::IsNotRunning(id));
        }

        if instance.has_container() {
            self.adapter.stop(&instance.container_id).await?;
        }

        if let Err(e) = self.set_status(id, Status::Offline).await {
            error!(
                instance_id = id,
                container_id = %instance.container_id,
                error = %e,
                "Container stopped but instance status could not be updated"
            );
            return Err(e);
        }
        self.close_streams(id);

        info!(instance_id = id, container_id = %instance.container_id, "Stopped instance");
        Ok(())
    }

    async fn remove(&self, id: u32) -> Result<()> {
        let _lock = self.lock_instance(id).await;

        let Some(instance) = self
            .store
            .get(id)
            .await
            .map_err(Error::store("get instance"))?
        else {
            debug!(instance_id = id, "Instance already removed");
            return Ok(());
        };

        if !matches!(instance.status, Status::Offline | Status::Error) {
            return Err(Error::IsRunning(id));
        }

        if instance.has_container() {
            if instance.status == Status::Error
                && let Err(e) = self.adapter.stop(&instance.container_id).await
            {
                warn!(instance_id = id, container_id = %instance.container_id, error = %e, "Stopping failed instance before removal failed");
            }

            match self.adapter.remove(&instance.container_id).await {
                Ok(()) => {}
                Err(Error::Runtime {
                    source: RuntimeError::ContainerNotFound(_),
                    ..
                }) => {
                    warn!(instance_id = id, container_id = %instance.container_id, "Container already gone");
                }
                Err(e) => return Err(e),
            }
        }

        self.store
            .remove(id)
            .await
            .map_err(Error::store("remove instance"))?;

        self.close_streams(id);
        self.attach_limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        info!(instance_id = id, container_id = %instance.container_id, "Removed instance");
        Ok(())
    }

    async fn recover(&self, id: u32) -> Result<bool> {
        let _lock = self.lock_instance(id).await;

        let Some(instance) = self
            .store
            .get(id)
            .await
            .map_err(Error::store("get instance"))?
        else {
            return Ok(false);
        };
        if instance.status != Status::Starting {
            return Ok(false);
        }

        self.set_status(id, Status::Offline).await?;
        warn!(instance_id = id, "Reset interrupted start to Offline");
        Ok(true)
    }
}
