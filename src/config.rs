//! Configuration types.
//!
//! Everything is read from the environment once at startup. A variable that
//! is set but does not parse is an error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::store::StoreTuning;
use crate::worker::RetryPolicy;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of polling slots, i.e. the bound on parallel executor runs.
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Running tasks whose lease is older than this are reclaimed.
    pub stale_after: Duration,
    /// Periodic reclaim interval (`None` = startup sweep only).
    pub reclaim_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(300), // 5 minutes
            reclaim_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Notification dispatcher configuration.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub poll_interval: Duration,
    /// Minimum time since `finished_at` before delivery.
    pub min_finished_age: Duration,
    /// Delivery attempts before quarantine.
    pub max_attempts: u32,
    /// Rows in `sending` longer than this are returned to the queue.
    pub stale_sending: Duration,
    pub retry: RetryPolicy,
    /// Bound on a single `send_message` call.
    pub send_timeout: Duration,
    pub recover_interval: Duration,
    /// Notifications delivered per tick at most.
    pub batch_size: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            min_finished_age: Duration::ZERO,
            max_attempts: 5,
            stale_sending: Duration::from_secs(120),
            retry: RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
            send_timeout: Duration::from_secs(30),
            recover_interval: Duration::from_secs(60),
            batch_size: 10,
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    pub worker: WorkerConfig,
    pub notify: NotifyConfig,
    pub tuning: StoreTuning,
    pub max_delegations: usize,
    pub shell_timeout: Duration,
    pub telegram_bot_token: Option<SecretString>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/ai-delegate.db"),
            http_port: 8090,
            worker: WorkerConfig::default(),
            notify: NotifyConfig::default(),
            tuning: StoreTuning::default(),
            max_delegations: crate::delegation::DEFAULT_MAX_DELEGATIONS,
            shell_timeout: crate::executors::shell::DEFAULT_TIMEOUT,
            telegram_bot_token: None,
        }
    }
}

impl QueueConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup` (variable name → value).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env(&lookup);

        let retry_base = env.millis("AI_DELEGATE_RETRY_BASE_MS", defaults.worker.retry.base)?;
        let retry_cap = env.millis("AI_DELEGATE_RETRY_CAP_MS", defaults.worker.retry.cap)?;
        if retry_cap < retry_base {
            return Err(ConfigError::InvalidValue {
                key: "AI_DELEGATE_RETRY_CAP_MS".into(),
                message: "must not be below AI_DELEGATE_RETRY_BASE_MS".into(),
            });
        }

        let max_concurrent: usize =
            env.parse("AI_DELEGATE_MAX_CONCURRENT", defaults.worker.max_concurrent)?;
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AI_DELEGATE_MAX_CONCURRENT".into(),
                message: "must be at least 1".into(),
            });
        }

        let max_delegations: usize =
            env.parse("AI_DELEGATE_MAX_DELEGATIONS", defaults.max_delegations)?;
        if max_delegations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AI_DELEGATE_MAX_DELEGATIONS".into(),
                message: "must be at least 1".into(),
            });
        }

        let reclaim_secs: u64 = env.parse(
            "AI_DELEGATE_RECLAIM_SECS",
            defaults.worker.reclaim_interval.map_or(0, |d| d.as_secs()),
        )?;

        let worker = WorkerConfig {
            max_concurrent,
            poll_interval: env.millis("AI_DELEGATE_POLL_MS", defaults.worker.poll_interval)?,
            retry: RetryPolicy::new(retry_base, retry_cap),
            stale_after: env.secs("AI_DELEGATE_STALE_SECS", defaults.worker.stale_after)?,
            reclaim_interval: (reclaim_secs > 0).then(|| Duration::from_secs(reclaim_secs)),
        };

        let notify = NotifyConfig {
            poll_interval: env.millis("AI_DELEGATE_NOTIFY_POLL_MS", defaults.notify.poll_interval)?,
            min_finished_age: env.millis(
                "AI_DELEGATE_NOTIFY_MIN_AGE_MS",
                defaults.notify.min_finished_age,
            )?,
            max_attempts: env.parse(
                "AI_DELEGATE_NOTIFY_MAX_ATTEMPTS",
                defaults.notify.max_attempts,
            )?,
            stale_sending: env.secs(
                "AI_DELEGATE_NOTIFY_STALE_SECS",
                defaults.notify.stale_sending,
            )?,
            retry: RetryPolicy::new(
                env.millis("AI_DELEGATE_NOTIFY_RETRY_MS", defaults.notify.retry.base)?,
                defaults.notify.retry.cap,
            ),
            send_timeout: env.secs(
                "AI_DELEGATE_NOTIFY_SEND_TIMEOUT_SECS",
                defaults.notify.send_timeout,
            )?,
            ..defaults.notify
        };

        let tuning = StoreTuning {
            ack_fallback: env.secs(
                "AI_DELEGATE_ACK_FALLBACK_SECS",
                defaults.tuning.ack_fallback,
            )?,
            ack_grace: env.millis("AI_DELEGATE_ACK_GRACE_MS", defaults.tuning.ack_grace)?,
        };

        Ok(Self {
            db_path: lookup("AI_DELEGATE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: env.parse("AI_DELEGATE_HTTP_PORT", defaults.http_port)?,
            worker,
            notify,
            tuning,
            max_delegations,
            shell_timeout: env.secs("AI_DELEGATE_SHELL_TIMEOUT_SECS", defaults.shell_timeout)?,
            telegram_bot_token: lookup("TELEGRAM_BOT_TOKEN")
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
        })
    }
}

/// Typed access to a variable lookup.
struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{raw}': {e}"),
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }
}
