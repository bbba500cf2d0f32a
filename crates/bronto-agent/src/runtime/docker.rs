// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runtime driven through the `docker` CLI.
//!
//! Every operation is a short-lived `docker` invocation except attach, which
//! keeps a `docker attach` client process alive for the lifetime of the
//! session and exposes its pipes as the container's streams.
//!
//! The attach client writes its own failures to the same stderr pipe as the
//! container's stderr. Lines carrying the CLI's error markers are logged here
//! and kept out of the container's stream.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, warn};

use super::traits::*;

/// Marker the docker CLI prints for unknown containers.
const NO_SUCH_CONTAINER: &str = "No such container";

/// Line prefixes the docker CLI uses for its own errors.
const CLIENT_ERROR_PREFIXES: &[&str] = &[
    "Error response from daemon:",
    "You cannot attach to a stopped container",
    "error during connect:",
    "Cannot connect to the Docker daemon",
];

/// Capacity of the pipe carrying filtered container stderr.
const STDERR_PIPE_CAPACITY: usize = 16 * 1024;

/// Default time a stdin attach client gets to forward input before it is killed.
pub const DEFAULT_ATTACH_LINGER: Duration = Duration::from_secs(1);

/// Docker runtime configuration
#[derive(Debug, Clone)]
pub struct DockerRuntimeConfig {
    /// Path or name of the docker CLI binary
    pub docker_bin: String,
    /// Time a `docker attach` client fed with stdin may take to exit after
    /// its input is closed
    pub attach_linger: Duration,
}

impl Default for DockerRuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            attach_linger: DEFAULT_ATTACH_LINGER,
        }
    }
}

impl DockerRuntimeConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let attach_linger = std::env::var("BRONTO_ATTACH_LINGER_MS")
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ATTACH_LINGER);

        Self {
            docker_bin: std::env::var("BRONTO_DOCKER_BIN")
                .unwrap_or_else(|_| "docker".to_string()),
            attach_linger,
        }
    }
}

/// Container runtime backed by the docker CLI.
pub struct DockerRuntime {
    config: DockerRuntimeConfig,
}

/// Captured output of a successful docker invocation.
struct CommandOutput {
    stdout: String,
    stderr: String,
}

impl DockerRuntime {
    /// Create a new docker runtime
    pub fn new(config: DockerRuntimeConfig) -> Self {
        Self { config }
    }

    /// Create a docker runtime configured from the environment
    pub fn from_env() -> Self {
        Self::new(DockerRuntimeConfig::from_env())
    }

    async fn docker(&self, args: Vec<String>) -> Result<CommandOutput> {
        let subcommand = args.first().map_or("", String::as_str);
        let command = format!("{} {}", self.config.docker_bin, subcommand);
        debug!(command = %command, args = ?args, "Invoking docker");

        let output = Command::new(&self.config.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            if stderr.contains(NO_SUCH_CONTAINER) {
                return Err(RuntimeError::ContainerNotFound(
                    args.last().cloned().unwrap_or_default(),
                ));
            }
            return Err(RuntimeError::CommandFailed {
                command,
                code: output.status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(CommandOutput { stdout, stderr })
    }
}

/// Build the `docker create` arguments for a container spec.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--workdir".to_string(),
        spec.working_dir.clone(),
    ];

    if spec.open_stdin {
        args.push("--interactive".to_string());
    }
    for (enabled, stream) in [
        (spec.attach_stdin, "STDIN"),
        (spec.attach_stdout, "STDOUT"),
        (spec.attach_stderr, "STDERR"),
    ] {
        if enabled {
            args.push("--attach".to_string());
            args.push(stream.to_string());
        }
    }
    for bind in &spec.binds {
        args.push("--volume".to_string());
        args.push(format!(
            "{}:{}",
            bind.host_path.display(),
            bind.container_path
        ));
    }
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(format!(
            "{}:{}/{}",
            port.host_port, port.container_port, port.protocol
        ));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Build the `docker attach` arguments for an attach request.
pub fn attach_args(container_id: &str, options: AttachOptions) -> Vec<String> {
    let mut args = vec!["attach".to_string(), "--sig-proxy=false".to_string()];
    if !options.stdin {
        args.push("--no-stdin".to_string());
    }
    args.push(container_id.to_string());
    args
}

fn piped_if(enabled: bool) -> Stdio {
    if enabled { Stdio::piped() } else { Stdio::null() }
}

/// Whether a stderr line was written by the docker CLI itself.
pub fn is_client_error(line: &str) -> bool {
    CLIENT_ERROR_PREFIXES
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

/// Forward the attach client's stderr line by line, logging and dropping the
/// client's own error lines.
fn filter_client_errors(container_id: String, stderr: ChildStderr) -> BoxedReader {
    let (mut writer, reader) = tokio::io::duplex(STDERR_PIPE_CAPACITY);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if is_client_error(&line) => {
                    warn!(container_id = %container_id, message = %line, "docker attach reported an error");
                }
                Ok(Some(line)) => {
                    let forwarded = match writer.write_all(line.as_bytes()).await {
                        Ok(()) => writer.write_all(b"\n").await,
                        Err(e) => Err(e),
                    };
                    if forwarded.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(container_id = %container_id, error = %e, "Reading attach stderr failed");
                    break;
                }
            }
        }
    });

    Box::new(reader)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<CreatedContainer> {
        let output = self.docker(create_args(spec)).await?;

        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Other(format!(
                "docker create returned no container id for {}",
                spec.name
            )));
        }

        let warnings = output
            .stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        Ok(CreatedContainer { id, warnings })
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker(vec!["start".to_string(), container_id.to_string()])
            .await?;
        Ok(())
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<()> {
        self.docker(vec![
            "stop".to_string(),
            "--time".to_string(),
            grace.as_secs().to_string(),
            container_id.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.docker(vec!["rm".to_string(), container_id.to_string()])
            .await?;
        Ok(())
    }

    async fn attach(&self, container_id: &str, options: AttachOptions) -> Result<AttachSession> {
        let mut child = Command::new(&self.config.docker_bin)
            .args(attach_args(container_id, options))
            .stdin(piped_if(options.stdin))
            .stdout(piped_if(options.stdout))
            .stderr(piped_if(options.stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: format!("{} attach", self.config.docker_bin),
                source,
            })?;

        let mut session = AttachSession::new(container_id);
        if let Some(stdin) = child.stdin.take() {
            session = session.with_stdin(Box::new(stdin));
        }
        if let Some(stdout) = child.stdout.take() {
            session = session.with_stdout(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            session = session.with_stderr(filter_client_errors(container_id.to_string(), stderr));
        }
        if options.stdin {
            session = session.with_process_linger(self.config.attach_linger);
        }

        debug!(container_id = %container_id, pid = ?child.id(), "Attached to container");
        Ok(session.with_process(child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_spec() -> ContainerSpec {
        ContainerSpec {
            name: "bronto-instance-42".to_string(),
            image: "eclipse-temurin:21-jre".to_string(),
            command: vec![
                "java".to_string(),
                "-jar".to_string(),
                "paper.jar".to_string(),
                "-nogui".to_string(),
            ],
            working_dir: "/data".to_string(),
            binds: vec![VolumeBind {
                host_path: PathBuf::from("/srv/a"),
                container_path: "/data".to_string(),
            }],
            ports: vec![PortBinding {
                host_port: 25570,
                container_port: 25565,
                protocol: "tcp".to_string(),
            }],
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            open_stdin: true,
        }
    }

    #[test]
    fn test_create_args() {
        let args = create_args(&test_spec());

        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "bronto-instance-42",
                "--workdir",
                "/data",
                "--interactive",
                "--attach",
                "STDIN",
                "--attach",
                "STDOUT",
                "--attach",
                "STDERR",
                "--volume",
                "/srv/a:/data",
                "--publish",
                "25570:25565/tcp",
                "eclipse-temurin:21-jre",
                "java",
                "-jar",
                "paper.jar",
                "-nogui",
            ]
        );
    }

    #[test]
    fn test_create_args_without_stdin() {
        let spec = ContainerSpec {
            open_stdin: false,
            attach_stdin: false,
            ..test_spec()
        };
        let args = create_args(&spec);

        assert!(!args.contains(&"--interactive".to_string()));
        assert!(!args.contains(&"STDIN".to_string()));
    }

    #[test]
    fn test_attach_args() {
        assert_eq!(
            attach_args("abc", AttachOptions::output()),
            vec!["attach", "--sig-proxy=false", "--no-stdin", "abc"]
        );
        assert_eq!(
            attach_args("abc", AttachOptions::input()),
            vec!["attach", "--sig-proxy=false", "abc"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let runtime = DockerRuntime::new(DockerRuntimeConfig {
            docker_bin: "/nonexistent/docker-binary".to_string(),
            ..Default::default()
        });

        let err = runtime.start("abc").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[test]
    fn test_client_error_lines() {
        assert!(is_client_error(
            "Error response from daemon: No such container: abc"
        ));
        assert!(is_client_error(
            "You cannot attach to a stopped container, start it first"
        ));
        assert!(!is_client_error("[Server thread/WARN]: Can't keep up!"));
        assert!(!is_client_error("  Error response from daemon: indented"));
    }

    /// Runtime whose docker binary is the shell script `body`.
    #[cfg(unix)]
    fn fake_client(dir: &tempfile::TempDir, body: &str) -> DockerRuntime {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        DockerRuntime::new(DockerRuntimeConfig {
            docker_bin: path.display().to_string(),
            attach_linger: Duration::from_secs(2),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_client_receives_command() {
        let dir = tempfile::tempdir().unwrap();
        let received = dir.path().join("received.txt");
        // Stands in for the CLI connecting to the daemon before reading stdin.
        let runtime = fake_client(
            &dir,
            &format!("sleep 0.2\ncat > '{}'", received.display()),
        );

        let session = runtime.attach("abc", AttachOptions::input()).await.unwrap();
        crate::bridge::send_line(session, "say hello\r\n").await.unwrap();

        let contents = std::fs::read_to_string(&received).unwrap();
        assert_eq!(contents, "say hello\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_hung_client_is_killed_after_linger() {
        let dir = tempfile::tempdir().unwrap();
        let mut runtime = fake_client(&dir, "cat > /dev/null\nsleep 30");
        runtime.config.attach_linger = Duration::from_millis(100);

        let session = runtime.attach("abc", AttachOptions::input()).await.unwrap();
        let sent = tokio::time::timeout(
            Duration::from_secs(5),
            crate::bridge::send_line(session, "list"),
        )
        .await
        .expect("close should not wait past the linger period");
        assert!(sent.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_log_pump_reads_client_output() {
        use std::sync::Arc;
        use tokio::sync::Semaphore;
        use tokio_util::sync::CancellationToken;

        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_client(
            &dir,
            "echo '[Server thread/INFO]: Done (3.2s)!'\n\
             echo 'WARN Can not keep up' >&2\n\
             echo 'Error response from daemon: container abc is restarting' >&2",
        );
        let semaphore = Arc::new(Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();

        let session = runtime.attach("abc", AttachOptions::output()).await.unwrap();
        let stream =
            crate::bridge::spawn_log_pump(1, session, permit, CancellationToken::new(), 8);

        let mut lines: Vec<String> = tokio::time::timeout(
            Duration::from_secs(5),
            futures::StreamExt::collect(stream),
        )
        .await
        .expect("stream should end when the client exits");
        lines.sort();
        assert_eq!(
            lines,
            vec!["WARN Can not keep up", "[Server thread/INFO]: Done (3.2s)!"]
        );
    }
}
