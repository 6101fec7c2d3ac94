//! Publish configuration loaded from TOML, then overridden from the environment.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use xpost_access::{GuardIssuerConfig, KillSwitches, DEFAULT_GUARD_TTL_MS};
use xpost_pool::{CircuitBreakerConfig, PoolConfig};

use crate::coordinator::CoordinatorSettings;
use crate::retry::RetryPolicy;

pub const DISABLE_POSTING_ENV: &str = "XPOST_DISABLE_POSTING";
pub const DISABLE_REPLIES_ENV: &str = "XPOST_DISABLE_REPLIES";
pub const DRAIN_MODE_ENV: &str = "XPOST_DRAIN_MODE";
pub const TEST_BYPASS_GUARD_ENV: &str = "XPOST_TEST_BYPASS_GUARD";
pub const ACCOUNT_HANDLE_ENV: &str = "XPOST_ACCOUNT_HANDLE";

const DEFAULT_RUN_DEADLINE_MS: u64 = 240_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub capacity: usize,
    pub breaker_failure_threshold: usize,
    pub breaker_enabled: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            capacity: 1,
            breaker_failure_threshold: 3,
            breaker_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadSettings {
    /// Whole-operation attempts, each trying composer then reply-chain mode.
    pub max_attempts: usize,
    pub composer_enabled: bool,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            composer_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// Handle of the publishing account; used by the self-reply gate.
    pub account_handle: String,
    pub guard_ttl_ms: u64,
    pub run_deadline_ms: u64,
    pub retry: RetryPolicy,
    pub update_retry_attempts: usize,
    pub update_retry_backoff_ms: u64,
    pub pool: PoolSettings,
    pub thread: ThreadSettings,
    pub kill_switches: KillSwitches,
    pub test_bypass_guard: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            account_handle: String::new(),
            guard_ttl_ms: DEFAULT_GUARD_TTL_MS,
            run_deadline_ms: DEFAULT_RUN_DEADLINE_MS,
            retry: RetryPolicy::default(),
            update_retry_attempts: 3,
            update_retry_backoff_ms: 250,
            pool: PoolSettings::default(),
            thread: ThreadSettings::default(),
            kill_switches: KillSwitches::default(),
            test_bypass_guard: false,
        }
    }
}

impl PublishConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse publish config")
    }

    /// Reads `path`, applies environment overrides and validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides resolved through `lookup`. Unset keys leave values untouched.
    pub fn apply_overrides_from<L>(&mut self, lookup: L) -> Result<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_flag(&lookup, DISABLE_POSTING_ENV)? {
            self.kill_switches.disable_all_posting = value;
        }
        if let Some(value) = parse_flag(&lookup, DISABLE_REPLIES_ENV)? {
            self.kill_switches.disable_reply_posting = value;
        }
        if let Some(value) = parse_flag(&lookup, DRAIN_MODE_ENV)? {
            self.kill_switches.drain_mode = value;
        }
        if let Some(value) = parse_flag(&lookup, TEST_BYPASS_GUARD_ENV)? {
            self.test_bypass_guard = value;
        }
        if let Some(handle) = lookup(ACCOUNT_HANDLE_ENV) {
            let handle = handle.trim();
            if !handle.is_empty() {
                self.account_handle = handle.to_string();
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_handle.trim().trim_start_matches('@').is_empty() {
            bail!("account_handle must be set (or provide {ACCOUNT_HANDLE_ENV})");
        }
        if self.guard_ttl_ms == 0 {
            bail!("guard_ttl_ms must be greater than zero");
        }
        if self.run_deadline_ms == 0 {
            bail!("run_deadline_ms must be greater than zero");
        }
        if self.pool.capacity == 0 {
            bail!("pool.capacity must be greater than zero");
        }
        if self.pool.breaker_enabled && self.pool.breaker_failure_threshold == 0 {
            bail!("pool.breaker_failure_threshold must be greater than zero");
        }
        if self.thread.max_attempts == 0 {
            bail!("thread.max_attempts must be greater than zero");
        }
        if self.update_retry_attempts == 0 {
            bail!("update_retry_attempts must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.retry.rate_limit_jitter_ratio) {
            bail!(
                "retry.rate_limit_jitter_ratio must be within [0, 1], got {}",
                self.retry.rate_limit_jitter_ratio
            );
        }
        let Some(largest_delay) = self.retry.rate_limit_delays_ms.iter().max().copied() else {
            bail!("retry.rate_limit_delays_ms must not be empty");
        };
        if self.retry.rate_limit_floor_ms > largest_delay {
            bail!(
                "retry.rate_limit_floor_ms ({}) exceeds the largest rate-limit delay ({largest_delay})",
                self.retry.rate_limit_floor_ms
            );
        }
        if self
            .retry
            .rate_limit_delays_ms
            .windows(2)
            .any(|pair| pair[0] > pair[1])
        {
            bail!("retry.rate_limit_delays_ms must be non-decreasing");
        }
        Ok(())
    }

    pub fn guard_issuer_config(&self) -> GuardIssuerConfig {
        GuardIssuerConfig {
            ttl_ms: self.guard_ttl_ms,
            kill_switches: self.kill_switches,
            test_bypass: self.test_bypass_guard,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool.capacity,
            breaker: CircuitBreakerConfig {
                enabled: self.pool.breaker_enabled,
                failure_threshold: self.pool.breaker_failure_threshold,
            },
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            account_handle: self.account_handle.clone(),
            run_deadline: Duration::from_millis(self.run_deadline_ms),
            update_retry_attempts: self.update_retry_attempts,
            update_retry_backoff: Duration::from_millis(self.update_retry_backoff_ms),
            thread_max_attempts: self.thread.max_attempts,
            composer_enabled: self.thread.composer_enabled,
        }
    }
}

fn parse_flag<L>(lookup: &L, key: &str) -> Result<Option<bool>>
where
    L: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(None),
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => bail!("{key} must be a boolean flag, got '{other}'"),
    }
}
