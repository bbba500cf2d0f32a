// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance and config records.
//!
//! ```text
//!   ┌─────────┐  start   ┌──────────┐  confirmed  ┌─────────┐
//!   │ Offline │ ───────► │ Starting │ ──────────► │ Running │
//!   └─────────┘          └──────────┘             └────┬────┘
//!        ▲                     │ start failed          │ stop
//!        └─────────────────────┴───────────────────────┘
//!
//!   Error: reachable from any state, left only by removing the instance.
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// No server process is running.
    Offline,
    /// A start was issued and has not been confirmed yet.
    Starting,
    /// The container is running.
    Running,
    /// An unrecoverable failure happened; the instance must be removed.
    Error,
}

impl Status {
    /// Get the status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Offline => "Offline",
            Status::Starting => "Starting",
            Status::Running => "Running",
            Status::Error => "Error",
        }
    }

    /// Whether a start time is meaningful for this status.
    pub fn is_active(&self) -> bool {
        matches!(self, Status::Starting | Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Offline" => Ok(Status::Offline),
            "Starting" => Ok(Status::Starting),
            "Running" => Ok(Status::Running),
            "Error" => Ok(Status::Error),
            other => Err(format!("unknown instance status '{}'", other)),
        }
    }
}

/// Durable lifecycle record of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Caller-assigned id, immutable once created.
    pub id: u32,
    /// Current lifecycle status.
    pub status: Status,
    /// When the instance last entered `Starting`. Kept after the instance
    /// stops, and also after a start attempt that failed and fell back to
    /// `Offline`; only meaningful while the status is active.
    pub start_time: Option<DateTime<Utc>>,
    /// Backing container, empty until a container has been created.
    pub container_id: String,
}

impl Instance {
    /// A new offline instance without a container.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            status: Status::Offline,
            start_time: None,
            container_id: String::new(),
        }
    }

    /// Whether a container has been created for this instance.
    pub fn has_container(&self) -> bool {
        !self.container_id.is_empty()
    }

    /// Apply a status change the way every store backend must.
    ///
    /// Entering `Starting` stamps `start_time`; no transition clears it.
    pub fn apply_status(&mut self, status: Status, now: DateTime<Utc>) {
        self.status = status;
        if status == Status::Starting {
            self.start_time = Some(now);
        }
    }
}

/// Launch specification bound to an instance when it is added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    /// Host directory mounted as the server's working directory.
    pub data_directory: String,
    /// Server jar, relative to the data directory.
    pub server_jar: String,
    /// Extra launch arguments appended after the jar.
    pub args: Vec<String>,
    /// Host port bound to the server's game port.
    pub listen_port: u16,
}
