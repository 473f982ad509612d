//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `DOCQUEUE_DATABASE_URL`: PostgreSQL connection string (required)
//! - `DOCQUEUE_MAX_CONNECTIONS`: Pool size per process (default: 10)
//! - `DOCQUEUE_LOCK_TIMEOUT_MS`: How long to wait for an advisory lock (default: 30000)
//! - `DOCQUEUE_LOCK_EXPIRY_MS`: Age after which a held lock may be taken over (default: 120000)
//! - `DOCQUEUE_RETRY_COUNT`: Attempts for transient failures (default: 10)
//! - `DOCQUEUE_RETRY_TIMEOUT_MS`: Total time budget for those attempts (default: 120000)
//! - `DOCQUEUE_HEARTBEAT_INTERVAL_MS`: Lease heartbeat period (default: 60000)
//! - `DOCQUEUE_LEASE_TIMEOUT_MS`: Heartbeat age after which a lease is stale (default: 300000)
//! - `DOCQUEUE_REVERT_CHECK_INTERVAL_MS`: Minimum gap between lazy revert sweeps (default: 60000)
//! - `DOCQUEUE_REVERT_SWEEP_INTERVAL_MS`: Period of the background sweeper (default: unset, disabled)
//! - `DOCQUEUE_RANDOM_DEQUEUE`: Random order within a priority band (default: false)
//! - `DOCQUEUE_TRACK_HISTORY`: History flag for newly created workflows (default: false)
//! - `DOCQUEUE_MACHINE_NAME`: Machine recorded on worker leases (default: `HOSTNAME` or localhost)
//! - `DOCQUEUE_USER`: User recorded on skipped files (default: `USER` or unknown)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::queue::{BackoffPolicy, RetryPolicy};

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub timeout: Duration,
    pub expiry: Duration,
    /// Delay schedule between polls while another owner holds the lock.
    pub poll_backoff: BackoffPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            expiry: Duration::from_millis(120_000),
            poll_backoff: BackoffPolicy {
                initial: Duration::from_millis(50),
                max: Duration::from_secs(1),
                multiplier: 2.0,
                jitter: 0.5,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
    pub revert_check_interval: Duration,
    /// `None` leaves reverts to the lazy check on queue calls.
    pub sweep_interval: Option<Duration>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(60_000),
            timeout: Duration::from_millis(300_000),
            revert_check_interval: Duration::from_millis(60_000),
            sweep_interval: None,
        }
    }
}

/// Queue configuration shared by every session of a process.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub lock: LockConfig,
    pub retry: RetryPolicy,
    pub lease: LeaseConfig,
    pub random_dequeue: bool,
    pub track_history: bool,
    pub machine_name: String,
    pub user_name: String,
}

impl QueueConfig {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DOCQUEUE_DATABASE_URL")
            .context("DOCQUEUE_DATABASE_URL environment variable is required")?;

        let parse_or = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(value) => parse_value(key, &value),
                None => Ok(default),
            }
        };
        let millis_or =
            |key: &str, default: u64| parse_or(key, default).map(Duration::from_millis);
        let flag = |key: &str| {
            lookup(key)
                .map(|value| matches!(value.trim(), "true" | "1" | "yes"))
                .unwrap_or(false)
        };

        let lock = LockConfig {
            timeout: millis_or("DOCQUEUE_LOCK_TIMEOUT_MS", 30_000)?,
            expiry: millis_or("DOCQUEUE_LOCK_EXPIRY_MS", 120_000)?,
            ..LockConfig::default()
        };
        let retry = RetryPolicy {
            max_attempts: parse_or("DOCQUEUE_RETRY_COUNT", 10)?.max(1) as u32,
            budget: millis_or("DOCQUEUE_RETRY_TIMEOUT_MS", 120_000)?,
            ..RetryPolicy::default()
        };
        let sweep_interval = match lookup("DOCQUEUE_REVERT_SWEEP_INTERVAL_MS") {
            Some(value) => Some(Duration::from_millis(parse_value(
                "DOCQUEUE_REVERT_SWEEP_INTERVAL_MS",
                &value,
            )?)),
            None => None,
        };
        let lease = LeaseConfig {
            heartbeat_interval: millis_or("DOCQUEUE_HEARTBEAT_INTERVAL_MS", 60_000)?,
            timeout: millis_or("DOCQUEUE_LEASE_TIMEOUT_MS", 300_000)?,
            revert_check_interval: millis_or("DOCQUEUE_REVERT_CHECK_INTERVAL_MS", 60_000)?,
            sweep_interval,
        };

        let machine_name = lookup("DOCQUEUE_MACHINE_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| "localhost".to_string());
        let user_name = lookup("DOCQUEUE_USER")
            .or_else(|| lookup("USER"))
            .unwrap_or_else(|| "unknown".to_string());

        Ok(Self {
            database_url,
            max_connections: parse_or("DOCQUEUE_MAX_CONNECTIONS", 10)? as u32,
            lock,
            retry,
            lease,
            random_dequeue: flag("DOCQUEUE_RANDOM_DEQUEUE"),
            track_history: flag("DOCQUEUE_TRACK_HISTORY"),
            machine_name,
            user_name,
        })
    }

    /// Create a test configuration with short timeouts and an eager revert check.
    pub fn test_config(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            max_connections: 5,
            lock: LockConfig {
                timeout: Duration::from_secs(2),
                expiry: Duration::from_secs(10),
                poll_backoff: BackoffPolicy {
                    initial: Duration::from_millis(5),
                    max: Duration::from_millis(50),
                    multiplier: 2.0,
                    jitter: 0.5,
                },
            },
            retry: RetryPolicy {
                max_attempts: 3,
                budget: Duration::from_secs(5),
                backoff: BackoffPolicy {
                    initial: Duration::from_millis(1),
                    max: Duration::from_millis(10),
                    multiplier: 2.0,
                    jitter: 0.0,
                },
            },
            lease: LeaseConfig {
                heartbeat_interval: Duration::from_millis(100),
                timeout: Duration::from_secs(300),
                revert_check_interval: Duration::ZERO,
                sweep_interval: None,
            },
            random_dequeue: false,
            track_history: false,
            machine_name: "test-machine".to_string(),
            user_name: "tester".to_string(),
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid {key} value `{value}`"))
}
