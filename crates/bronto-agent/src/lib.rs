// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bronto Agent - game-server instance lifecycle on a node
//!
//! This crate runs on every node of a bronto deployment and manages the
//! game-server instances assigned to it. Each instance is a JVM server
//! process inside a container; the agent keeps a durable record of every
//! instance and reconciles it with the container runtime.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                Management API / bronto-agent CLI              │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ by instance id
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      InstanceManager                          │
//! │     per-id locks · state machine · attach permits · logs      │
//! └──────────────────────────────────────────────────────────────┘
//!          │                     │                      │
//!          ▼                     ▼                      ▼
//! ┌─────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │   StateStore    │  │ ContainerAdapter │  │      bridge      │
//! │ (bronto-state)  │  │                  │  │ LogStream, send  │
//! └─────────────────┘  └──────────────────┘  └──────────────────┘
//!                               │
//!                               ▼
//!                  ┌──────────────────────────┐
//!                  │     ContainerRuntime     │
//!                  │   docker CLI │ mock      │
//!                  └──────────────────────────┘
//! ```
//!
//! # Instance Operations
//!
//! | Operation | Sentinel errors |
//! |-----------|-----------------|
//! | `add_instance` | `AlreadyExists` |
//! | `instance_status`, `get_instance`, `status_report` | `DoesNotExist` |
//! | `start_instance` | `DoesNotExist`, `IsRunning` |
//! | `stop_instance` | `DoesNotExist`, `IsNotRunning` |
//! | `remove_instance` | `IsRunning` (absent ids are ignored) |
//! | `logs`, `send_command` | `DoesNotExist`, `IsNotRunning`, `AttachLimitReached` |
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables the agent reads.

#![deny(missing_docs)]

/// Container lifecycle adapter.
pub mod adapter;

/// Log streaming and command injection over attach sessions.
pub mod bridge;

/// Configuration loaded from the environment.
pub mod config;

/// Error types.
pub mod error;

/// Instance lifecycle manager.
pub mod manager;

/// Container runtime backends.
pub mod runtime;

pub use bridge::LogStream;
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use manager::{InstanceManager, ManagerOptions, StatusReport};
