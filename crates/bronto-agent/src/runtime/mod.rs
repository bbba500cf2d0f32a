// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime backends.

pub mod docker;
pub mod mock;
mod traits;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use mock::MockRuntime;
pub use traits::*;
