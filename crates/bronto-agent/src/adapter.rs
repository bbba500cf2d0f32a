// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container lifecycle adapter.
//!
//! The only component issuing mutating calls to the container runtime. It
//! turns an instance's launch config into a container spec, creates the
//! container on first use and records its id before handing it out.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::runtime::{
    AttachOptions, AttachSession, ContainerRuntime, ContainerSpec, PortBinding, VolumeBind,
};
use bronto_state::{InstanceConfig, StateStore};

/// Working directory of the server inside its container.
pub const CONTAINER_WORKDIR: &str = "/data";

/// Port the game server listens on inside its container.
pub const GAME_PORT: u16 = 25565;

/// Settings shared by every container the adapter creates.
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Image the containers run
    pub server_image: String,
    /// Prefix of container names
    pub container_prefix: String,
    /// Grace period before a stopping container is killed
    pub stop_grace: Duration,
}

/// Container lifecycle adapter.
#[derive(Clone)]
pub struct ContainerAdapter {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    options: AdapterOptions,
}

impl ContainerAdapter {
    /// Create an adapter over a store and a runtime.
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        options: AdapterOptions,
    ) -> Self {
        Self {
            store,
            runtime,
            options,
        }
    }

    /// Whether several attach sessions may be open on one container.
    pub fn supports_multiplexed_attach(&self) -> bool {
        self.runtime.supports_multiplexed_attach()
    }

    /// Deterministic container name of an instance.
    pub fn container_name(&self, id: u32) -> String {
        format!("{}-instance-{}", self.options.container_prefix, id)
    }

    /// Build the container spec for an instance.
    pub fn container_spec(&self, id: u32, config: &InstanceConfig) -> Result<ContainerSpec> {
        let host_path = std::path::absolute(Path::new(&config.data_directory)).map_err(
            |source| Error::DataDirectory {
                path: config.data_directory.clone(),
                source,
            },
        )?;

        let mut command = vec![
            "java".to_string(),
            "-jar".to_string(),
            config.server_jar.clone(),
        ];
        command.extend(config.args.iter().cloned());

        Ok(ContainerSpec {
            name: self.container_name(id),
            image: self.options.server_image.clone(),
            command,
            working_dir: CONTAINER_WORKDIR.to_string(),
            binds: vec![VolumeBind {
                host_path,
                container_path: CONTAINER_WORKDIR.to_string(),
            }],
            ports: vec![PortBinding {
                host_port: config.listen_port,
                container_port: GAME_PORT,
                protocol: "tcp".to_string(),
            }],
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            open_stdin: true,
        })
    }

    /// Return the instance's container id, creating the container first if
    /// the instance has none.
    ///
    /// The new id is persisted before it is returned; a failure between
    /// create and persist leaves an orphaned container behind rather than a
    /// record pointing at nothing.
    pub async fn ensure_container(&self, id: u32) -> Result<String> {
        let instance = self
            .store
            .get(id)
            .await
            .map_err(Error::store("get instance"))?
            .ok_or(Error::DoesNotExist(id))?;

        if instance.has_container() {
            debug!(instance_id = id, container_id = %instance.container_id, "Container already exists");
            return Ok(instance.container_id);
        }

        let config = self
            .store
            .get_config(id)
            .await
            .map_err(Error::store("get instance config"))?
            .ok_or(Error::DoesNotExist(id))?;

        let spec = self.container_spec(id, &config)?;
        let created = self
            .runtime
            .create(&spec)
            .await
            .map_err(Error::runtime("create container"))?;

        for warning in &created.warnings {
            warn!(instance_id = id, container_id = %created.id, warning = %warning, "Container created with warning");
        }

        self.store
            .set_container_id(id, &created.id)
            .await
            .map_err(Error::store("set container id"))?;

        info!(
            instance_id = id,
            container_id = %created.id,
            name = %spec.name,
            runtime = self.runtime.runtime_type(),
            "Created container"
        );
        Ok(created.id)
    }

    /// Start a container.
    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.runtime
            .start(container_id)
            .await
            .map_err(Error::runtime("start container"))
    }

    /// Stop a container within the configured grace period.
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        self.runtime
            .stop(container_id, self.options.stop_grace)
            .await
            .map_err(Error::runtime("stop container"))
    }

    /// Remove a stopped container.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        self.runtime
            .remove(container_id)
            .await
            .map_err(Error::runtime("remove container"))
    }

    /// Attach to a container's standard streams.
    pub async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<AttachSession> {
        self.runtime
            .attach(container_id, options)
            .await
            .map_err(Error::runtime("attach container"))
    }
}
