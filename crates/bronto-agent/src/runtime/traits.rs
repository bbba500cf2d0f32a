// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait definitions.
//!
//! Defines the abstract interface the agent consumes from a container engine.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The runtime client could not be invoked.
    #[error("Failed to run {command}: {source}")]
    Spawn {
        /// Command that failed to spawn.
        command: String,
        /// Underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// The runtime rejected a request.
    #[error("{command} failed (exit code {code:?}): {stderr}")]
    CommandFailed {
        /// Command that failed.
        command: String,
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Standard error output.
        stderr: String,
    },

    /// The container does not exist in the runtime.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Attaching to the container's standard streams failed.
    #[error("Attach failed: {0}")]
    AttachFailed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Host directory mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeBind {
    /// Absolute host path.
    pub host_path: PathBuf,
    /// Mount point inside the container.
    pub container_path: String,
}

/// Host port published to a container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
    /// Transport protocol (`tcp` or `udp`).
    pub protocol: String,
}

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name, unique per runtime.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Volume binds.
    pub binds: Vec<VolumeBind>,
    /// Published ports.
    pub ports: Vec<PortBinding>,
    /// Attach standard input.
    pub attach_stdin: bool,
    /// Attach standard output.
    pub attach_stdout: bool,
    /// Attach standard error.
    pub attach_stderr: bool,
    /// Keep standard input open even when nothing is attached.
    pub open_stdin: bool,
}

/// Result of a successful create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    /// Runtime-assigned container id.
    pub id: String,
    /// Non-fatal warnings reported by the runtime.
    pub warnings: Vec<String>,
}

/// Which standard streams an attach session should carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachOptions {
    /// Attach standard input.
    pub stdin: bool,
    /// Attach standard output.
    pub stdout: bool,
    /// Attach standard error.
    pub stderr: bool,
}

impl AttachOptions {
    /// Combined stdout and stderr, for log streaming.
    pub fn output() -> Self {
        Self {
            stdin: false,
            stdout: true,
            stderr: true,
        }
    }

    /// Standard input only, for command injection.
    pub fn input() -> Self {
        Self {
            stdin: true,
            stdout: false,
            stderr: false,
        }
    }
}

/// Boxed read half of an attached stream.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed write half of an attached stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Open attach session to a container's standard streams.
///
/// Dropping the session releases it: stream halves are closed and any client
/// process backing the session is killed. [`AttachSession::close`] lets a
/// client process that was fed stdin run for up to its linger period first,
/// so input still buffered in the client reaches the container.
pub struct AttachSession {
    container_id: String,
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    stderr: Option<BoxedReader>,
    process: Option<Child>,
    linger: Duration,
}

impl AttachSession {
    /// Create a session without streams.
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            stdin: None,
            stdout: None,
            stderr: None,
            process: None,
            linger: Duration::ZERO,
        }
    }

    /// Set the standard input writer.
    pub fn with_stdin(mut self, stdin: BoxedWriter) -> Self {
        self.stdin = Some(stdin);
        self
    }

    /// Set the standard output reader.
    pub fn with_stdout(mut self, stdout: BoxedReader) -> Self {
        self.stdout = Some(stdout);
        self
    }

    /// Set the standard error reader.
    pub fn with_stderr(mut self, stderr: BoxedReader) -> Self {
        self.stderr = Some(stderr);
        self
    }

    /// Tie the lifetime of a client process to this session.
    pub fn with_process(mut self, process: Child) -> Self {
        self.process = Some(process);
        self
    }

    /// How long [`AttachSession::close`] waits for the client process to
    /// exit on its own after stdin is closed.
    pub fn with_process_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }

    /// Container this session is attached to.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Borrow the standard input writer.
    pub fn stdin_mut(&mut self) -> Option<&mut BoxedWriter> {
        self.stdin.as_mut()
    }

    /// Take the standard output reader.
    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    /// Take the standard error reader.
    pub fn take_stderr(&mut self) -> Option<BoxedReader> {
        self.stderr.take()
    }

    /// Close the session: flush and shut down stdin, then end the client process.
    ///
    /// A client process that carried stdin gets the linger period to forward
    /// what it read and exit; it is killed once that runs out. Output-only
    /// clients are killed right away.
    pub async fn close(mut self) -> std::io::Result<()> {
        let fed_stdin = self.stdin.is_some();
        let shutdown = match self.stdin.take() {
            Some(mut stdin) => stdin.shutdown().await,
            None => Ok(()),
        };

        if let Some(mut process) = self.process.take() {
            let exited = fed_stdin
                && !self.linger.is_zero()
                && tokio::time::timeout(self.linger, process.wait())
                    .await
                    .is_ok();
            if !exited {
                let _ = process.start_kill();
                let _ = process.wait().await;
            }
        }

        shutdown
    }
}

impl std::fmt::Debug for AttachSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachSession")
            .field("container_id", &self.container_id)
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .field("process", &self.process.as_ref().and_then(|p| p.id()))
            .field("linger", &self.linger)
            .finish()
    }
}

/// Trait for container runtimes.
///
/// Runtimes are PURE container clients - they do NOT access the state store.
/// Persisting container ids and statuses is handled by the caller.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// Whether several attach sessions may be open on one container at once.
    fn supports_multiplexed_attach(&self) -> bool {
        true
    }

    /// Create a container without starting it.
    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer>;

    /// Start a created or stopped container.
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Stop a running container, killing it once `grace` has elapsed.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()>;

    /// Remove a stopped container.
    async fn remove(&self, container_id: &str) -> Result<()>;

    /// Open an attach session to a container's standard streams.
    async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<AttachSession>;
}
