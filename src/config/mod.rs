//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU32, NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::ConditionMissPolicy;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "larder";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_RETRIEVE_LIMIT: u64 = 1000;
const DEFAULT_KEY_DELIMITER: &str = "/";
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_CACHE_MAX_ENTRY_BYTES: u64 = 64 * 1024;
const DEFAULT_LOCK_PREFIX: &str = "lock:";
const DEFAULT_LOCK_HOLD_SECS: u64 = 30;
const DEFAULT_LOCK_MAX_WAIT_MS: u64 = 2000;
const DEFAULT_LOCK_TRIES: u64 = 5;
const DEFAULT_LOCK_RANDOM_DELAY_MICROS: u64 = 10_000;
const DEFAULT_QUEUE_PREFIX: &str = "queue:";
const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_QUEUE_HISTORY_LIMIT: u64 = 32;
const DEFAULT_QUEUE_RETRY_LIMIT: u32 = 3;
const DEFAULT_QUEUE_RETURN_LIMIT: u32 = 10;

/// Command-line arguments for the larder binary.
#[derive(Debug, Parser)]
#[command(
    name = "larder",
    version,
    about = "Cache-aside fetches, locks and work queues over Postgres and Redis"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "LARDER_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Fetch rows by key through the cache.
    Fetch(Box<FetchArgs>),
    /// Wrap a JSON payload in a task and push it onto queues.
    Enqueue(EnqueueArgs),
    /// Pop the next task from the first non-empty queue.
    Dequeue(DequeueArgs),
    /// Acquire the first free lock among the candidate names.
    Lock(LockArgs),
    /// Release a lock, optionally checking the holder token.
    Unlock(UnlockArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DiagnosticsArgs {
    /// Report what would happen without writing to either store.
    #[arg(long = "dry-run", action = clap::ArgAction::SetTrue, global = true)]
    pub dry_run: bool,

    /// Log one event per processed item.
    #[arg(long, short = 'v', action = clap::ArgAction::SetTrue, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    #[command(flatten)]
    pub diagnostics: DiagnosticsArgs,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT", global = true)]
    pub database_max_connections: Option<u32>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL", global = true)]
    pub redis_url: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct FetchArgs {
    /// Table to read, optionally with an alias (`orders o`).
    #[arg(long, value_name = "TABLE")]
    pub table: String,

    /// Key column, optionally qualified (`o.id`); repeat for composite keys.
    #[arg(long = "key", value_name = "COLUMN", required = true)]
    pub key_columns: Vec<String>,

    /// Columns to return; defaults to every column.
    #[arg(long = "column", value_name = "COLUMN")]
    pub columns: Vec<String>,

    /// Cache namespace; defaults to the table name.
    #[arg(long, value_name = "NAME")]
    pub namespace: Option<String>,

    /// Column conditions as JSON, e.g. `[["status", "open", "="], "AND"]`.
    #[arg(long = "where", value_name = "JSON")]
    pub conditions: Option<String>,

    /// Group results by the first N key components.
    #[arg(long = "group-by-first", value_name = "N", default_value_t = 0)]
    pub group_by_first: usize,

    /// Maximum rows returned by the store.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<u64>,

    /// Bypass the cache for this call.
    #[arg(long = "no-cache", action = clap::ArgAction::SetTrue)]
    pub no_cache: bool,

    /// Drop cached entries for the targets instead of fetching them.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub invalidate: bool,

    /// Target keys; each is parsed as JSON and falls back to a plain string.
    #[arg(value_name = "KEY", required = true)]
    pub targets: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct QueueOverrides {
    /// Override the queue key prefix.
    #[arg(long = "queue-prefix", value_name = "PREFIX")]
    pub prefix: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub overrides: QueueOverrides,

    /// Destination queue; repeat to fan out.
    #[arg(long = "queue", value_name = "NAME", required = true)]
    pub queues: Vec<String>,

    /// Task type used for routing.
    #[arg(long = "type", value_name = "TYPE")]
    pub kind: Option<String>,

    /// Task id; generated when absent.
    #[arg(long, value_name = "ID")]
    pub id: Option<String>,

    #[arg(long, value_name = "NAME")]
    pub from: Option<String>,

    #[arg(long, value_name = "NAME")]
    pub to: Option<String>,

    /// Queue receiving a copy of the task once delivered.
    #[arg(long = "in-progress-queue", value_name = "NAME")]
    pub in_progress_queue: Option<String>,

    #[arg(long = "success-queue", value_name = "NAME")]
    pub success_queue: Option<String>,

    #[arg(long = "failure-queue", value_name = "NAME")]
    pub failure_queue: Option<String>,

    #[arg(long = "retry-limit", value_name = "COUNT")]
    pub retry_limit: Option<u32>,

    #[arg(long = "return-limit", value_name = "COUNT")]
    pub return_limit: Option<u32>,

    /// Pause consumers take after returning this task, in milliseconds.
    #[arg(long = "sleep-after-return-ms", value_name = "MS", default_value_t = 0)]
    pub sleep_after_return_ms: u64,

    /// JSON payload.
    #[arg(value_name = "PAYLOAD")]
    pub payload: String,
}

#[derive(Debug, Args, Clone)]
pub struct DequeueArgs {
    #[command(flatten)]
    pub overrides: QueueOverrides,

    /// Queue to pop from, in priority order.
    #[arg(long = "queue", value_name = "NAME", required = true)]
    pub queues: Vec<String>,

    /// Blocking timeout; 0 checks once.
    #[arg(long = "timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<u64>,

    /// Return predicate as JSON, e.g. `{"type": {"include": ["^mail$"]}}`.
    #[arg(long = "return-if", value_name = "JSON")]
    pub return_if: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct LockOverrides {
    /// Override the lock key prefix.
    #[arg(long = "lock-prefix", value_name = "PREFIX")]
    pub prefix: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct LockArgs {
    #[command(flatten)]
    pub overrides: LockOverrides,

    /// Holder token; generated when absent.
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    #[arg(long = "hold-seconds", value_name = "SECONDS")]
    pub hold_seconds: Option<u64>,

    #[arg(long = "max-wait-ms", value_name = "MS")]
    pub max_wait_ms: Option<u64>,

    #[arg(long, value_name = "COUNT")]
    pub tries: Option<u32>,

    /// Candidate lock names, tried in order.
    #[arg(value_name = "NAME", required = true)]
    pub names: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct UnlockArgs {
    #[command(flatten)]
    pub overrides: LockOverrides,

    /// Only release when the lock still holds this token.
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    #[arg(value_name = "NAME")]
    pub name: String,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub retrieval: RetrievalSettings,
    pub cache: CacheSettings,
    pub lock: LockSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub default_limit: NonZeroU64,
    pub key_delimiter: String,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub use_cache: bool,
    pub ttl_seconds: u64,
    pub max_entry_bytes: NonZeroUsize,
    pub compare_columns: bool,
    pub condition_miss_policy: ConditionMissPolicy,
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub prefix: String,
    pub hold: Duration,
    pub max_wait: Duration,
    pub tries: NonZeroU32,
    pub random_delay_micros: u64,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub prefix: String,
    pub timeout: Duration,
    pub history_limit: NonZeroUsize,
    pub retry_limit: u32,
    pub return_limit: u32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("LARDER").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    match &cli.command {
        Command::Fetch(_) => {}
        Command::Enqueue(args) => raw.apply_queue_overrides(&args.overrides),
        Command::Dequeue(args) => raw.apply_queue_overrides(&args.overrides),
        Command::Lock(args) => raw.apply_lock_overrides(&args.overrides),
        Command::Unlock(args) => raw.apply_lock_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    redis: RawRedisSettings,
    retrieval: RawRetrievalSettings,
    cache: RawCacheSettings,
    lock: RawLockSettings,
    queue: RawQueueSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
    }

    fn apply_queue_overrides(&mut self, overrides: &QueueOverrides) {
        if let Some(prefix) = overrides.prefix.as_ref() {
            self.queue.prefix = Some(prefix.clone());
        }
    }

    fn apply_lock_overrides(&mut self, overrides: &LockOverrides) {
        if let Some(prefix) = overrides.prefix.as_ref() {
            self.lock.prefix = Some(prefix.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            redis,
            retrieval,
            cache,
            lock,
            queue,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            redis: build_redis_settings(redis)?,
            retrieval: build_retrieval_settings(retrieval)?,
            cache: build_cache_settings(cache)?,
            lock: build_lock_settings(lock)?,
            queue: build_queue_settings(queue)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::WARN,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_blank(database.url);
    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = non_blank(redis.url).unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    Ok(RedisSettings { url })
}

fn build_retrieval_settings(
    retrieval: RawRetrievalSettings,
) -> Result<RetrievalSettings, LoadError> {
    let default_limit = NonZeroU64::new(retrieval.default_limit.unwrap_or(DEFAULT_RETRIEVE_LIMIT))
        .ok_or_else(|| {
            LoadError::invalid("retrieval.default_limit", "must be greater than zero")
        })?;

    let key_delimiter = retrieval
        .key_delimiter
        .unwrap_or_else(|| DEFAULT_KEY_DELIMITER.to_string());
    if key_delimiter.is_empty() {
        return Err(LoadError::invalid(
            "retrieval.key_delimiter",
            "delimiter must not be empty",
        ));
    }

    Ok(RetrievalSettings {
        default_limit,
        key_delimiter,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let condition_miss_policy = match cache.condition_miss_policy {
        Some(policy) => ConditionMissPolicy::from_str(&policy)
            .map_err(|reason| LoadError::invalid("cache.condition_miss_policy", reason))?,
        None => ConditionMissPolicy::default(),
    };

    Ok(CacheSettings {
        use_cache: cache.use_cache.unwrap_or(true),
        ttl_seconds: cache.ttl_seconds.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        max_entry_bytes: non_zero_usize(
            cache
                .max_entry_bytes
                .unwrap_or(DEFAULT_CACHE_MAX_ENTRY_BYTES),
            "cache.max_entry_bytes",
        )?,
        compare_columns: cache.compare_columns.unwrap_or(true),
        condition_miss_policy,
    })
}

fn build_lock_settings(lock: RawLockSettings) -> Result<LockSettings, LoadError> {
    let prefix = lock
        .prefix
        .unwrap_or_else(|| DEFAULT_LOCK_PREFIX.to_string());

    let hold_seconds = lock.hold_seconds.unwrap_or(DEFAULT_LOCK_HOLD_SECS);
    if hold_seconds == 0 {
        return Err(LoadError::invalid(
            "lock.hold_seconds",
            "must be greater than zero",
        ));
    }

    Ok(LockSettings {
        prefix,
        hold: Duration::from_secs(hold_seconds),
        max_wait: Duration::from_millis(lock.max_wait_ms.unwrap_or(DEFAULT_LOCK_MAX_WAIT_MS)),
        tries: non_zero_u32(lock.tries.unwrap_or(DEFAULT_LOCK_TRIES), "lock.tries")?,
        random_delay_micros: lock
            .random_delay_micros
            .unwrap_or(DEFAULT_LOCK_RANDOM_DELAY_MICROS),
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let prefix = queue
        .prefix
        .unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string());

    Ok(QueueSettings {
        prefix,
        timeout: Duration::from_secs(queue.timeout_seconds.unwrap_or(DEFAULT_QUEUE_TIMEOUT_SECS)),
        history_limit: non_zero_usize(
            queue.history_limit.unwrap_or(DEFAULT_QUEUE_HISTORY_LIMIT),
            "queue.history_limit",
        )?,
        retry_limit: queue.retry_limit.unwrap_or(DEFAULT_QUEUE_RETRY_LIMIT),
        return_limit: queue.return_limit.unwrap_or(DEFAULT_QUEUE_RETURN_LIMIT),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetrievalSettings {
    default_limit: Option<u64>,
    key_delimiter: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    use_cache: Option<bool>,
    ttl_seconds: Option<u64>,
    max_entry_bytes: Option<u64>,
    compare_columns: Option<bool>,
    condition_miss_policy: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLockSettings {
    prefix: Option<String>,
    hold_seconds: Option<u64>,
    max_wait_ms: Option<u64>,
    tries: Option<u64>,
    random_delay_micros: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    prefix: Option<String>,
    timeout_seconds: Option<u64>,
    history_limit: Option<u64>,
    retry_limit: Option<u32>,
    return_limit: Option<u32>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value: usize = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
