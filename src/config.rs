//! Configuration types.
//!
//! Everything is read from the environment once at startup. Queue policy
//! knobs (attempts, lease, backoff) live in [`QueueConfig`] so tests can
//! construct tight values directly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Queue engine policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum downloads in flight across all users.
    pub max_concurrent_downloads: usize,
    /// Maximum downloads in flight for one user.
    pub max_user_concurrent_downloads: usize,
    /// Platform calls per second allowed for one session.
    pub rate_limit_per_sec: f64,
    /// Token bucket capacity. 1 keeps any 1-second window at or below the rate.
    pub rate_limit_burst: u32,
    /// Attempts before a task fails permanently.
    pub max_attempts: u32,
    /// Claim lease length.
    pub lease_duration: Duration,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Ceiling for the retry delay.
    pub backoff_max: Duration,
    /// How long tasks wait for re-login before failing with `SessionExpired`.
    pub session_hold_timeout: Duration,
    /// Interval between recovery passes.
    pub recovery_interval: Duration,
    /// Scheduler poll interval when nothing wakes it.
    pub poll_interval: Duration,
    /// Timeout for each platform call (fetch, download chunk).
    pub platform_timeout: Duration,
    /// Timeout for each store operation.
    pub store_timeout: Duration,
    /// Timeout for delivering a finished item to the user.
    pub delivery_timeout: Duration,
    /// Maximum size of one range request.
    pub max_batch_size: u64,
    /// Largest item the bot will download, in bytes.
    pub max_file_size: u64,
    /// Minimum progress delta, in percent, between two user notifications.
    pub progress_step_percent: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 8,
            max_user_concurrent_downloads: 2,
            rate_limit_per_sec: 1.0,
            rate_limit_burst: 1,
            max_attempts: 3,
            lease_duration: Duration::from_secs(120),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(300),
            session_hold_timeout: Duration::from_secs(24 * 3600),
            recovery_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            platform_timeout: Duration::from_secs(300),
            store_timeout: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(300),
            max_batch_size: 10_000,
            max_file_size: 2000 * 1024 * 1024,
            progress_step_percent: 5,
        }
    }
}

impl QueueConfig {
    /// Read queue policy from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_concurrent_downloads: env_parse(
                "MAX_CONCURRENT_DOWNLOADS",
                d.max_concurrent_downloads,
            )?,
            max_user_concurrent_downloads: env_parse(
                "MAX_USER_CONCURRENT_DOWNLOADS",
                d.max_user_concurrent_downloads,
            )?,
            rate_limit_per_sec: env_parse("RATE_LIMIT_PER_SEC", d.rate_limit_per_sec)?,
            rate_limit_burst: env_parse("RATE_LIMIT_BURST", d.rate_limit_burst)?,
            max_attempts: env_parse("MAX_ATTEMPTS", d.max_attempts)?,
            lease_duration: env_secs("LEASE_SECS", d.lease_duration)?,
            backoff_base: Duration::from_millis(env_parse(
                "BACKOFF_BASE_MS",
                d.backoff_base.as_millis() as u64,
            )?),
            backoff_max: env_secs("BACKOFF_MAX_SECS", d.backoff_max)?,
            session_hold_timeout: env_secs("SESSION_HOLD_SECS", d.session_hold_timeout)?,
            recovery_interval: env_secs("RECOVERY_INTERVAL_SECS", d.recovery_interval)?,
            poll_interval: Duration::from_millis(env_parse(
                "POLL_INTERVAL_MS",
                d.poll_interval.as_millis() as u64,
            )?),
            platform_timeout: env_secs("PLATFORM_TIMEOUT_SECS", d.platform_timeout)?,
            store_timeout: env_secs("STORE_TIMEOUT_SECS", d.store_timeout)?,
            delivery_timeout: env_secs("DELIVERY_TIMEOUT_SECS", d.delivery_timeout)?,
            max_batch_size: env_parse("MAX_BATCH_SIZE", d.max_batch_size)?,
            max_file_size: env_parse::<u64>("MAX_FILE_SIZE_MB", d.max_file_size / (1024 * 1024))?
                * 1024
                * 1024,
            progress_step_percent: env_parse("PROGRESS_STEP_PERCENT", d.progress_step_percent)?,
        })
    }

    /// How often a running worker renews its lease.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_duration / 3
    }

    /// Reject values that would deadlock or spin the scheduler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_downloads == 0 {
            return Err(invalid("MAX_CONCURRENT_DOWNLOADS", "must be at least 1"));
        }
        if self.max_user_concurrent_downloads == 0 {
            return Err(invalid("MAX_USER_CONCURRENT_DOWNLOADS", "must be at least 1"));
        }
        if !(self.rate_limit_per_sec > 0.0) {
            return Err(invalid("RATE_LIMIT_PER_SEC", "must be positive"));
        }
        if self.rate_limit_burst == 0 {
            return Err(invalid("RATE_LIMIT_BURST", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.lease_duration.is_zero() {
            return Err(invalid("LEASE_SECS", "must be positive"));
        }
        // A renewal that takes the full store timeout must still land in time.
        if self.heartbeat_interval() + self.store_timeout >= self.lease_duration {
            return Err(invalid(
                "LEASE_SECS",
                "must exceed the renewal interval (a third of the lease) plus STORE_TIMEOUT_SECS",
            ));
        }
        if self.progress_step_percent == 0 || self.progress_step_percent > 100 {
            return Err(invalid("PROGRESS_STEP_PERCENT", "must be between 1 and 100"));
        }
        if self.max_batch_size == 0 {
            return Err(invalid("MAX_BATCH_SIZE", "must be at least 1"));
        }
        Ok(())
    }
}

/// Telegram bot front end.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Users allowed to talk to the bot ("*" for everyone).
    pub allowed_users: Vec<String>,
    /// Numeric ids with access to admin commands.
    pub admins: Vec<i64>,
    /// Chat the Bot API client forwards source messages into to read them.
    pub dump_chat_id: Option<i64>,
}

/// Read-only admin HTTP surface.
#[derive(Debug, Clone)]
pub struct AdminApiConfig {
    pub addr: SocketAddr,
    /// Bearer token required on every admin route when set.
    pub token: Option<SecretString>,
}

/// Task-record backups.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub max_count: usize,
    /// Terminal tasks older than this are pruned by the cleanup pass.
    pub task_retention: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("backups"),
            max_count: 10,
            task_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Whole-process configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram: TelegramConfig,
    pub queue: QueueConfig,
    pub admin_api: AdminApiConfig,
    pub backup: BackupConfig,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    /// Master key for the credential vault. `None` leaves the vault locked.
    pub encryption_key: Option<SecretString>,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("BOT_TOKEN".into()))?;

        let telegram = TelegramConfig {
            bot_token: SecretString::from(bot_token),
            allowed_users: env_list("ALLOWED_USERS", "*"),
            admins: env_list("ADMINS", "")
                .iter()
                .map(|s| {
                    s.parse::<i64>()
                        .map_err(|e| invalid("ADMINS", &format!("{s}: {e}")))
                })
                .collect::<Result<_, _>>()?,
            dump_chat_id: env_opt_parse("DUMP_CHAT_ID")?,
        };

        let admin_api = AdminApiConfig {
            addr: env_parse("ADMIN_API_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            token: std::env::var("ADMIN_API_TOKEN")
                .ok()
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
        };

        let backup_defaults = BackupConfig::default();
        let backup = BackupConfig {
            enabled: env_bool("BACKUP_ENABLED", backup_defaults.enabled),
            dir: std::env::var("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or(backup_defaults.dir),
            max_count: env_parse("MAX_BACKUP_COUNT", backup_defaults.max_count)?,
            task_retention: Duration::from_secs(
                env_parse::<u64>("TASK_RETENTION_DAYS", 30)? * 24 * 3600,
            ),
        };

        let config = Self {
            telegram,
            queue: QueueConfig::from_env()?,
            admin_api,
            backup,
            db_path: std::env::var("DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/bot.db")),
            log_dir: std::env::var("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("logs")),
            encryption_key: std::env::var("ENCRYPTION_KEY")
                .ok()
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        if self.backup.enabled && self.backup.max_count == 0 {
            return Err(invalid("MAX_BACKUP_COUNT", "must be at least 1"));
        }
        Ok(())
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.telegram.admins.contains(&user_id)
    }
}

// ── Env helpers ─────────────────────────────────────────────────────

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Parse `key` if set, else return `default`. Set-but-unparseable is an error.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
        _ => Ok(default),
    }
}

fn env_opt_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, &e.to_string())),
        _ => Ok(None),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "t" | "y" | "yes"
    )
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    split_list(&std::env::var(key).unwrap_or_else(|_| default.to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
