// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bronto Agent CLI
//!
//! Drives game-server instances on this node through the docker CLI.
//!
//! Usage:
//!   bronto-agent <command> [options]
//!
//! Commands:
//!   run <id> <data-dir> <jar> <port> [args...]
//!   status <id>
//!   list
//!   stop <id>
//!   remove <id>

use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use bronto_agent::runtime::DockerRuntime;
use bronto_agent::{Config, Error, InstanceManager};
use bronto_state::{InstanceConfig, SqliteStateStore};

fn print_usage() {
    eprintln!(
        r#"Usage: bronto-agent <command> [options]

Manage game-server instances on this node.

COMMANDS:
    run <id> <data-dir> <jar> <port> [args...]
                                    Add (if needed) and start an instance, print its
                                    console, forward stdin lines as commands; Ctrl+C
                                    stops and removes it
    status <id>                     Print instance status as JSON
    list                            List instance ids
    stop <id>                       Stop a running instance
    remove <id>                     Remove an offline instance

ENVIRONMENT:
    DATA_DIR                        Agent data directory (default: .data)
    BRONTO_DATABASE_PATH            SQLite file (default: $DATA_DIR/agent.db)
    BRONTO_DOCKER_BIN               Docker CLI binary (default: docker)
    BRONTO_ATTACH_LINGER_MS         Time a command's attach client gets to deliver
                                    input (default: 1000)
    BRONTO_SERVER_IMAGE             Server image (default: eclipse-temurin:21-jre)
    BRONTO_CONTAINER_PREFIX         Container name prefix (default: bronto)
    BRONTO_STOP_GRACE_SECS          Stop grace period (default: 60)
    BRONTO_MAX_ATTACH_SESSIONS      Attach sessions per instance (default: 4)
    BRONTO_LOG_BUFFER               Buffered log lines per stream (default: 256)

EXAMPLES:
    bronto-agent run 42 ./worlds/survival paper.jar 25570 --nogui
    bronto-agent status 42
"#
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Run {
        id: u32,
        config: InstanceConfig,
    },
    Status {
        id: u32,
    },
    List,
    Stop {
        id: u32,
    },
    Remove {
        id: u32,
    },
    Help,
}

fn parse_id(args: &[String], index: usize) -> Result<u32, String> {
    args.get(index)
        .ok_or("Instance ID required")?
        .parse()
        .map_err(|_| format!("Invalid instance ID: {}", args[index]))
}

fn parse_args_from_vec(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Err("No command specified".to_string());
    }

    match args[1].as_str() {
        "help" | "--help" | "-h" => Ok(Command::Help),
        "run" => {
            let id = parse_id(args, 2)?;
            let data_directory = args.get(3).ok_or("Data directory required")?.clone();
            let server_jar = args.get(4).ok_or("Server jar required")?.clone();
            let listen_port: u16 = args
                .get(5)
                .ok_or("Listen port required")?
                .parse()
                .map_err(|_| "Invalid listen port")?;

            Ok(Command::Run {
                id,
                config: InstanceConfig {
                    data_directory,
                    server_jar,
                    args: args[6..].to_vec(),
                    listen_port,
                },
            })
        }
        "status" => Ok(Command::Status {
            id: parse_id(args, 2)?,
        }),
        "list" => Ok(Command::List),
        "stop" => Ok(Command::Stop {
            id: parse_id(args, 2)?,
        }),
        "remove" => Ok(Command::Remove {
            id: parse_id(args, 2)?,
        }),
        cmd => Err(format!("Unknown command: {}", cmd)),
    }
}

async fn run_instance(
    manager: &InstanceManager,
    id: u32,
    config: InstanceConfig,
) -> anyhow::Result<()> {
    match manager.add_instance(id, config).await {
        Ok(()) => info!(instance_id = id, "Instance added"),
        Err(Error::AlreadyExists(_)) => info!(instance_id = id, "Using existing instance"),
        Err(e) => return Err(e.into()),
    }

    manager.start_instance(id).await?;

    let mut logs = manager.logs(id).await?;
    let printer = tokio::spawn(async move {
        while let Some(line) = logs.next_line().await {
            println!("{}", line);
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(instance_id = id, "Shutdown signal received");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = manager.send_command(id, &line).await {
                        warn!(instance_id = id, error = %e, "Failed to send command");
                    }
                }
                None => stdin_open = false,
            },
        }
    }

    if let Err(e) = manager.stop_instance(id).await {
        warn!(instance_id = id, error = %e, "Failed to stop instance");
    }
    manager.remove_instance(id).await?;

    if let Err(e) = printer.await {
        warn!(error = %e, "Log printer task failed");
    }
    Ok(())
}

async fn execute_command(manager: &InstanceManager, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Run { id, config } => run_instance(manager, id, config).await,
        Command::Status { id } => {
            let report = manager.status_report(id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::List => {
            for id in manager.list_instances().await? {
                let status = manager.instance_status(id).await?;
                println!("{}\t{}", id, status);
            }
            Ok(())
        }
        Command::Stop { id } => Ok(manager.stop_instance(id).await?),
        Command::Remove { id } => Ok(manager.remove_instance(id).await?),
        Command::Help => {
            print_usage();
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bronto_agent=info,bronto_state=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = match parse_args_from_vec(&args) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match run(cmd).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cmd: Command) -> anyhow::Result<()> {
    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        database = %config.database_path.display(),
        image = %config.server_image,
        "Starting bronto agent"
    );

    let store = Arc::new(SqliteStateStore::from_path(&config.database_path).await?);
    let runtime = Arc::new(DockerRuntime::new(config.docker_config()));
    let manager = InstanceManager::new(store.clone(), runtime, config.manager_options());

    let recovered = manager.recover_interrupted().await?;
    if !recovered.is_empty() {
        warn!(instances = ?recovered, "Reset instances left starting by a previous run");
    }

    let result = execute_command(&manager, cmd).await;

    manager.shutdown();
    store.close().await;
    result
}
