// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

/// Tempo service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL or file path.
    pub database_url: String,
    /// Number of shards the workflow space is partitioned into.
    pub shard_count: u32,
    /// Retention applied to closed-execution visibility rows, in seconds.
    pub visibility_retention_seconds: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TEMPO_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TEMPO_SHARD_COUNT`: number of history shards (default: 4)
    /// - `TEMPO_VISIBILITY_RETENTION_SECONDS`: closed-row TTL (default: 86400)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TEMPO_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TEMPO_DATABASE_URL"))?;

        let shard_count: u32 = std::env::var("TEMPO_SHARD_COUNT")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TEMPO_SHARD_COUNT", "must be a positive integer"))?;
        if shard_count == 0 {
            return Err(ConfigError::Invalid(
                "TEMPO_SHARD_COUNT",
                "must be a positive integer",
            ));
        }

        let visibility_retention_seconds: i64 =
            std::env::var("TEMPO_VISIBILITY_RETENTION_SECONDS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "TEMPO_VISIBILITY_RETENTION_SECONDS",
                        "must be a number of seconds",
                    )
                })?;

        Ok(Self {
            database_url,
            shard_count,
            visibility_retention_seconds,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
