// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for bronto-agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::manager::ManagerOptions;
use crate::runtime::DockerRuntimeConfig;
use crate::runtime::docker::DEFAULT_ATTACH_LINGER;

/// Default image the game servers run in.
pub const DEFAULT_SERVER_IMAGE: &str = "eclipse-temurin:21-jre";

/// Default prefix of container names.
pub const DEFAULT_CONTAINER_PREFIX: &str = "bronto";

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory of the agent
    pub data_dir: PathBuf,
    /// SQLite database file holding instance records
    pub database_path: PathBuf,
    /// Docker CLI binary
    pub docker_bin: String,
    /// Time a command's attach client may take to deliver input before it is killed
    pub attach_linger: Duration,
    /// Image game-server containers are created from
    pub server_image: String,
    /// Prefix of container names
    pub container_prefix: String,
    /// Grace period given to a server before it is killed on stop
    pub stop_grace: Duration,
    /// Concurrent attach sessions allowed per instance
    pub max_attach_sessions: usize,
    /// Lines buffered per log stream
    pub log_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = PathBuf::from(lookup("DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        let database_path = lookup("BRONTO_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("agent.db"));

        let docker_bin = lookup("BRONTO_DOCKER_BIN").unwrap_or_else(|| "docker".to_string());

        let attach_linger = Duration::from_millis(parse_number(
            &lookup,
            "BRONTO_ATTACH_LINGER_MS",
            DEFAULT_ATTACH_LINGER.as_millis() as u64,
        )?);

        let server_image =
            lookup("BRONTO_SERVER_IMAGE").unwrap_or_else(|| DEFAULT_SERVER_IMAGE.to_string());

        let container_prefix = lookup("BRONTO_CONTAINER_PREFIX")
            .unwrap_or_else(|| DEFAULT_CONTAINER_PREFIX.to_string());
        if container_prefix.is_empty() {
            return Err(ConfigError::EmptyValue("BRONTO_CONTAINER_PREFIX"));
        }

        let stop_grace = Duration::from_secs(parse_number(&lookup, "BRONTO_STOP_GRACE_SECS", 60)?);

        let max_attach_sessions: usize = parse_number(&lookup, "BRONTO_MAX_ATTACH_SESSIONS", 4)?;
        if max_attach_sessions == 0 {
            return Err(ConfigError::InvalidNumber {
                var: "BRONTO_MAX_ATTACH_SESSIONS",
                value: "0".to_string(),
            });
        }

        let log_buffer: usize = parse_number(&lookup, "BRONTO_LOG_BUFFER", 256usize)?.max(1);

        Ok(Self {
            data_dir,
            database_path,
            docker_bin,
            attach_linger,
            server_image,
            container_prefix,
            stop_grace,
            max_attach_sessions,
            log_buffer,
        })
    }

    /// Docker runtime settings derived from this configuration.
    pub fn docker_config(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            docker_bin: self.docker_bin.clone(),
            attach_linger: self.attach_linger,
        }
    }

    /// Manager options derived from this configuration.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            server_image: self.server_image.clone(),
            container_prefix: self.container_prefix.clone(),
            stop_grace: self.stop_grace,
            max_attach_sessions: self.max_attach_sessions,
            log_buffer: self.log_buffer,
        }
    }
}

fn parse_number<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => match value.trim().parse::<T>() {
            Ok(number) => Ok(number),
            Err(_) => Err(ConfigError::InvalidNumber { var, value }),
        },
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric environment variable could not be parsed.
    #[error("Invalid number in {var}: '{value}'")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
    /// A variable that must not be empty is empty.
    #[error("Environment variable {0} must not be empty")]
    EmptyValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();

        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.database_path, PathBuf::from(".data").join("agent.db"));
        assert_eq!(config.docker_bin, "docker");
        assert_eq!(config.attach_linger, Duration::from_secs(1));
        assert_eq!(config.server_image, DEFAULT_SERVER_IMAGE);
        assert_eq!(config.container_prefix, "bronto");
        assert_eq!(config.stop_grace, Duration::from_secs(60));
        assert_eq!(config.max_attach_sessions, 4);
        assert_eq!(config.log_buffer, 256);
    }

    #[test]
    fn test_database_path_follows_data_dir() {
        let config = Config::from_lookup(lookup_from(&[("DATA_DIR", "/var/lib/bronto")])).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/var/lib/bronto/agent.db"));

        let config = Config::from_lookup(lookup_from(&[
            ("DATA_DIR", "/var/lib/bronto"),
            ("BRONTO_DATABASE_PATH", "/tmp/state.db"),
        ]))
        .unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/state.db"));
    }

    #[test]
    fn test_invalid_number() {
        let err =
            Config::from_lookup(lookup_from(&[("BRONTO_STOP_GRACE_SECS", "soon")])).unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                var: "BRONTO_STOP_GRACE_SECS",
                ..
            }
        ));
        assert!(err.to_string().contains("soon"));
    }

    #[test]
    fn test_docker_config() {
        let config = Config::from_lookup(lookup_from(&[
            ("BRONTO_DOCKER_BIN", "/usr/local/bin/podman"),
            ("BRONTO_ATTACH_LINGER_MS", "250"),
        ]))
        .unwrap();

        let docker = config.docker_config();
        assert_eq!(docker.docker_bin, "/usr/local/bin/podman");
        assert_eq!(docker.attach_linger, Duration::from_millis(250));
    }

    #[test]
    fn test_zero_attach_sessions_rejected() {
        let err = Config::from_lookup(lookup_from(&[("BRONTO_MAX_ATTACH_SESSIONS", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
    }

    #[test]
    fn test_manager_options() {
        let config = Config::from_lookup(lookup_from(&[
            ("BRONTO_CONTAINER_PREFIX", "node7"),
            ("BRONTO_STOP_GRACE_SECS", "5"),
        ]))
        .unwrap();
        let options = config.manager_options();

        assert_eq!(options.container_prefix, "node7");
        assert_eq!(options.stop_grace, Duration::from_secs(5));
        assert_eq!(options.max_attach_sessions, 4);
    }
}
