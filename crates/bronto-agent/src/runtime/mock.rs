// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! A runtime implementation that simulates containers in memory. Attach
//! sessions are backed by in-process duplex pipes: tests push output lines
//! with [`MockRuntime::emit_output`] and read what was written to stdin with
//! [`MockRuntime::received_commands`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Mutex;

use super::traits::*;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Mock container state.
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
    stdout_pipes: Vec<DuplexStream>,
    stderr_pipes: Vec<DuplexStream>,
}

impl MockContainer {
    fn close_streams(&mut self) {
        self.stdout_pipes.clear();
        self.stderr_pipes.clear();
    }
}

/// Mock runtime for testing.
pub struct MockRuntime {
    containers: Arc<Mutex<HashMap<String, MockContainer>>>,
    commands: Arc<Mutex<HashMap<String, Vec<String>>>>,
    next_id: AtomicUsize,
    create_calls: AtomicUsize,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    remove_calls: AtomicUsize,
    attach_calls: AtomicUsize,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_remove: AtomicBool,
    /// Optional delay to simulate a slow start call (in milliseconds)
    pub start_delay_ms: u64,
    /// Delay before an opened attach session is handed out (in milliseconds)
    pub attach_delay_ms: u64,
    /// Whether several attach sessions may be open on one container
    pub multiplexed_attach: bool,
    /// Warnings reported by every create call
    pub create_warnings: Vec<String>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a new mock runtime.
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            commands: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicUsize::new(1),
            create_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
            attach_calls: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            start_delay_ms: 0,
            attach_delay_ms: 0,
            multiplexed_attach: true,
            create_warnings: Vec::new(),
        }
    }

    /// Create a mock runtime whose start calls take `delay_ms`.
    pub fn with_start_delay(delay_ms: u64) -> Self {
        Self {
            start_delay_ms: delay_ms,
            ..Self::new()
        }
    }

    /// Hold every attach call for `delay_ms` after its streams are opened.
    pub fn with_attach_delay(mut self, delay_ms: u64) -> Self {
        self.attach_delay_ms = delay_ms;
        self
    }

    /// Report `warnings` from every create call.
    pub fn with_create_warnings(mut self, warnings: Vec<String>) -> Self {
        self.create_warnings = warnings;
        self
    }

    /// Allow only one attach session per container at a time.
    pub fn without_multiplexed_attach(mut self) -> Self {
        self.multiplexed_attach = false;
        self
    }

    /// Number of create calls received.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of start calls received.
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Number of stop calls received.
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of remove calls received.
    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Number of attach calls received.
    pub fn attach_calls(&self) -> usize {
        self.attach_calls.load(Ordering::SeqCst)
    }

    /// Make create calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make start calls fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make stop calls fail.
    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Make remove calls fail.
    pub fn set_fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    /// Whether a container with this id exists.
    pub async fn exists(&self, container_id: &str) -> bool {
        self.containers.lock().await.contains_key(container_id)
    }

    /// Whether the container is running.
    pub async fn is_running(&self, container_id: &str) -> bool {
        let containers = self.containers.lock().await;
        containers
            .get(container_id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Spec the container was created with.
    pub async fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        let containers = self.containers.lock().await;
        containers.get(container_id).map(|c| c.spec.clone())
    }

    /// Write a line to the stdout of every attached session.
    pub async fn emit_output(&self, container_id: &str, line: &str) {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(container_id) {
            write_line_to_all(&mut container.stdout_pipes, line).await;
        }
    }

    /// Write a line to the stderr of every attached session.
    pub async fn emit_error(&self, container_id: &str, line: &str) {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(container_id) {
            write_line_to_all(&mut container.stderr_pipes, line).await;
        }
    }

    /// Simulate the server process exiting on its own.
    pub async fn exit_container(&self, container_id: &str) {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(container_id) {
            container.running = false;
            container.close_streams();
        }
    }

    /// Lines received on the container's stdin.
    pub async fn received_commands(&self, container_id: &str) -> Vec<String> {
        let commands = self.commands.lock().await;
        commands.get(container_id).cloned().unwrap_or_default()
    }

    /// Wait until at least `count` stdin lines were received, or `timeout` elapses.
    pub async fn wait_for_commands(
        &self,
        container_id: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let received = self.received_commands(container_id).await;
            if received.len() >= count || tokio::time::Instant::now() >= deadline {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn write_line_to_all(pipes: &mut Vec<DuplexStream>, line: &str) {
    let mut open = Vec::with_capacity(pipes.len());
    for mut pipe in pipes.drain(..) {
        let written = pipe.write_all(format!("{}\n", line).as_bytes()).await;
        if written.is_ok() {
            open.push(pipe);
        }
    }
    *pipes = open;
}

fn injected(operation: &str) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: format!("mock {}", operation),
        code: Some(1),
        stderr: "Mock failure".to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    fn supports_multiplexed_attach(&self) -> bool {
        self.multiplexed_attach
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(injected("create"));
        }

        let mut containers = self.containers.lock().await;
        if containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::CommandFailed {
                command: "mock create".to_string(),
                code: Some(125),
                stderr: format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            });
        }

        let id = format!("mock-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
                stdout_pipes: Vec::new(),
                stderr_pipes: Vec::new(),
            },
        );

        Ok(CreatedContainer {
            id,
            warnings: self.create_warnings.clone(),
        })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.start_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.start_delay_ms)).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(injected("start"));
        }

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(injected("stop"));
        }

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        container.running = false;
        container.close_streams();
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(injected("remove"));
        }

        let mut containers = self.containers.lock().await;
        match containers.get(container_id) {
            None => Err(RuntimeError::ContainerNotFound(container_id.to_string())),
            Some(container) if container.running => Err(RuntimeError::CommandFailed {
                command: "mock rm".to_string(),
                code: Some(1),
                stderr: "You cannot remove a running container".to_string(),
            }),
            Some(_) => {
                containers.remove(container_id);
                self.commands.lock().await.remove(container_id);
                Ok(())
            }
        }
    }

    async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<AttachSession> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        if !container.running {
            return Err(RuntimeError::AttachFailed(format!(
                "container {} is not running",
                container_id
            )));
        }

        let mut session = AttachSession::new(container_id);

        if options.stdout {
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            container.stdout_pipes.push(server);
            session = session.with_stdout(Box::new(client));
        }
        if options.stderr {
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            container.stderr_pipes.push(server);
            session = session.with_stderr(Box::new(client));
        }
        if options.stdin {
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            let commands = self.commands.clone();
            let container_id = container_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(server).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut commands = commands.lock().await;
                    commands.entry(container_id.clone()).or_default().push(line);
                }
            });
            session = session.with_stdin(Box::new(client));
        }
        drop(containers);

        if self.attach_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.attach_delay_ms)).await;
        }
        Ok(session)
    }
}
