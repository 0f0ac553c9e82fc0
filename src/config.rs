// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Console configuration.
//!
//! Stored as JSON in `<config_dir>/clinicgate/config.json`. Every field has a
//! default, so a missing file or a partial file is fine. Key names follow the
//! console's option names (`inactivityTimeout.warningTime`,
//! `session.statusCheckInterval`, ...).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default inactivity timeout: 15 minutes.
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 900_000;

/// Default warning window before the inactivity logout: 2 minutes.
pub const DEFAULT_INACTIVITY_WARNING_MS: u64 = 120_000;

/// Default interval between status/contract checks.
pub const DEFAULT_STATUS_CHECK_INTERVAL_MS: u64 = 30_000;

/// Failed unlock attempts allowed before a lockout.
pub const DEFAULT_MAX_UNLOCK_ATTEMPTS: u32 = 3;

/// Lockout duration after too many failed unlock attempts.
pub const DEFAULT_LOCKOUT_DURATION_MS: u64 = 30_000;

/// Default coalescing window for raw activity events.
pub const DEFAULT_ACTIVITY_THROTTLE_MS: u64 = 500;

/// Environment variable overriding `api.baseUrl`.
pub const API_URL_ENV: &str = "CLINICGATE_API_URL";

/// Backend connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/api".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Inactivity logout settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InactivityConfig {
    /// Milliseconds of inactivity before forced logout. `None`, zero or a
    /// negative value disables the feature.
    pub timeout: Option<i64>,
    /// Milliseconds before the timeout at which the warning opens.
    pub warning_time: u64,
    pub enabled: bool,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            timeout: Some(DEFAULT_INACTIVITY_TIMEOUT_MS as i64),
            warning_time: DEFAULT_INACTIVITY_WARNING_MS,
            enabled: true,
        }
    }
}

impl InactivityConfig {
    /// Hard timeout, or `None` when the feature is off.
    pub fn effective_timeout(&self) -> Option<Duration> {
        match self.positive_timeout_ms() {
            Some(ms) if self.enabled => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }

    /// Warning window, never longer than the timeout.
    pub fn warning_window(&self) -> Duration {
        let timeout = self.positive_timeout_ms().unwrap_or(0);
        Duration::from_millis(self.warning_time.min(timeout))
    }

    fn positive_timeout_ms(&self) -> Option<u64> {
        self.timeout
            .filter(|ms| *ms > 0)
            .and_then(|ms| u64::try_from(ms).ok())
    }
}

/// Session polling settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Milliseconds between liveness/contract checks.
    pub status_check_interval: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            status_check_interval: DEFAULT_STATUS_CHECK_INTERVAL_MS,
        }
    }
}

impl SessionSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.status_check_interval)
    }
}

/// Screen-lock lockout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub lockout_duration_ms: u64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_UNLOCK_ATTEMPTS,
            lockout_duration_ms: DEFAULT_LOCKOUT_DURATION_MS,
        }
    }
}

impl LockoutPolicy {
    pub fn lockout_duration(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lockout_duration_ms as i64)
    }
}

/// Activity monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivityConfig {
    pub throttle_ms: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            throttle_ms: DEFAULT_ACTIVITY_THROTTLE_MS,
        }
    }
}

/// Full console configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsoleConfig {
    pub api: ApiConfig,
    pub inactivity_timeout: InactivityConfig,
    pub session: SessionSettings,
    pub lockout: LockoutPolicy,
    pub activity: ActivityConfig,
}

impl ConsoleConfig {
    /// Normalize values that would otherwise break the timers.
    ///
    /// Returns the list of adjustments made, each of which is also logged.
    pub fn validate(&mut self) -> Vec<String> {
        let mut adjusted = Vec::new();

        if let Some(timeout) = self.inactivity_timeout.positive_timeout_ms() {
            if self.inactivity_timeout.warning_time > timeout {
                adjusted.push(format!(
                    "inactivityTimeout.warningTime {}ms exceeds timeout {}ms; clamped",
                    self.inactivity_timeout.warning_time, timeout
                ));
                self.inactivity_timeout.warning_time = timeout;
            }
        }

        if self.lockout.max_attempts == 0 {
            adjusted.push("lockout.maxAttempts must be at least 1; using 1".to_string());
            self.lockout.max_attempts = 1;
        }

        if self.session.status_check_interval < 1_000 {
            adjusted.push(format!(
                "session.statusCheckInterval {}ms is below 1000ms; using 1000ms",
                self.session.status_check_interval
            ));
            self.session.status_check_interval = 1_000;
        }

        for msg in &adjusted {
            tracing::warn!("CONFIG_ADJUSTED | {}", msg);
        }

        adjusted
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api.base_url = url.trim().to_string();
            }
        }
    }
}

/// Directory holding the console's configuration.
pub fn config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Could not find configuration directory")?
        .join("clinicgate");
    Ok(dir)
}

/// Default configuration file path.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load configuration from `path` (or the default location), apply env
/// overrides and validate.
pub fn load_config(path: Option<&Path>) -> Result<ConsoleConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let mut config = if path.exists() {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?
    } else {
        ConsoleConfig::default()
    };

    config.apply_env();
    config.validate();
    Ok(config)
}

/// Write configuration as pretty JSON.
pub fn save_config(config: &ConsoleConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write config file {:?}", path))?;
    Ok(())
}
