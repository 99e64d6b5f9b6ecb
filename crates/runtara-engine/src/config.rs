// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loaded from environment variables.

use std::time::Duration;

/// Default storage: a private in-memory database.
pub const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";

/// Default grace-period timeout (5 minutes).
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 300_000;

/// Default delay before a deferred continuation fires.
pub const DEFAULT_RESUME_DELAY_MS: u64 = 1_000;

/// Runtara engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// SQLite connection URL for the actor's storage
    pub database_url: String,
    /// How long guarded work may run before a continuation is deferred
    pub grace_period: Duration,
    /// Delay of the deferred continuation
    pub resume_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
            resume_delay: Duration::from_millis(DEFAULT_RESUME_DELAY_MS),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `RUNTARA_ENGINE_DATABASE_URL`: SQLite URL (default: `sqlite::memory:`)
    /// - `RUNTARA_ENGINE_GRACE_PERIOD_MS`: grace-period timeout (default: 300000)
    /// - `RUNTARA_ENGINE_RESUME_DELAY_MS`: continuation delay (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("RUNTARA_ENGINE_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
        if database_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "RUNTARA_ENGINE_DATABASE_URL",
                "must not be empty",
            ));
        }

        let grace_period_ms = millis_from_env(
            "RUNTARA_ENGINE_GRACE_PERIOD_MS",
            DEFAULT_GRACE_PERIOD_MS,
        )?;
        let resume_delay_ms = millis_from_env(
            "RUNTARA_ENGINE_RESUME_DELAY_MS",
            DEFAULT_RESUME_DELAY_MS,
        )?;

        Ok(Self {
            database_url,
            grace_period: Duration::from_millis(grace_period_ms),
            resume_delay: Duration::from_millis(resume_delay_ms),
        })
    }
}

fn millis_from_env(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value: u64 = match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(var, "must be a positive integer"))?,
        Err(_) => default,
    };

    if value == 0 {
        return Err(ConfigError::Invalid(var, "must be greater than zero"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
