//! Environment-driven configuration for the Relay deployment.
//!
//! Every recognized key is parsed up front and validated as a whole;
//! validation failures are collected into a single
//! [`ConfigError::InvalidEnvironment`] so operators see every problem at
//! once instead of fixing them one restart at a time.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid environment: {}", .0.join("; "))]
    InvalidEnvironment(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The `tracing` filter directive this level maps to. `fatal` has no
    /// tracing equivalent and collapses to `error`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: Option<String>,
    /// PEM public keys or shared secrets, from the delimited `PUBLIC_KEYS`.
    pub static_keys: Vec<String>,
    pub leeway: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_min: u32,
    pub pool_max: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub lag_poll_interval: Duration,
    pub lag_warning_secs: f64,
    pub lag_critical_secs: f64,
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub adapter_enabled: bool,
    pub redis_url: Option<String>,
    pub redis_tls: bool,
    pub redis_key_prefix: String,
    pub instance_id: String,
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    pub presence_ttl: Duration,
    pub replay_ttl: Duration,
    pub replay_max_messages: usize,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub nats_url: String,
    pub subject_prefix: String,
    pub partitions: u32,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// Pending-count high-water mark per partition; when set, the producer
    /// throttles instead of silently queueing without bound.
    pub pending_high_water: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_enabled: bool,
    pub bypass: bool,
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: Environment,
    pub port: u16,
    pub log_level: LogLevel,
    pub log_json: bool,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub replica: ReplicaConfig,
    pub socket: SocketConfig,
    pub stream: StreamConfig,
    pub cache: CacheConfig,
    pub message_max_bytes: usize,
    pub disable_rate_limit: bool,
    pub mock_mode: bool,
    pub dev_seed_data: bool,
    pub socket_redis_mock: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().collect())
    }

    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut reasons = Vec::new();
        let src = Source { vars: &vars };

        let env = match src.get("NODE_ENV").as_deref().unwrap_or("development") {
            "development" => Environment::Development,
            "test" => Environment::Test,
            "production" => Environment::Production,
            other => {
                reasons.push(format!(
                    "NODE_ENV must be development|test|production, got {other:?}"
                ));
                Environment::Development
            }
        };

        let port = src.parse_u64("PORT", 8080, &mut reasons).min(u64::from(u16::MAX)) as u16;
        let log_level = match src.get("LOG_LEVEL").as_deref().unwrap_or("info") {
            "fatal" => LogLevel::Fatal,
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            other => {
                reasons.push(format!("LOG_LEVEL {other:?} is not a recognized level"));
                LogLevel::Info
            }
        };
        let log_json = src.parse_bool("LOG_JSON", false, &mut reasons);

        let issuer = src.required("JWT_ISSUER", &mut reasons);
        let audience = src.required("JWT_AUDIENCE", &mut reasons);
        let jwks_url = src.get("JWKS_URL").filter(|v| !v.trim().is_empty());
        let static_keys: Vec<String> = src
            .get("PUBLIC_KEYS")
            .map(|raw| {
                raw.split("||")
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if jwks_url.is_none() && static_keys.is_empty() {
            reasons.push("at least one of JWKS_URL or PUBLIC_KEYS is required".into());
        }
        let leeway_sec = src.parse_u64("TOKEN_LEEWAY_SEC", 30, &mut reasons);
        if leeway_sec > 120 {
            reasons.push(format!("TOKEN_LEEWAY_SEC must be <= 120, got {leeway_sec}"));
        }

        let database_url = src.required("DATABASE_URL", &mut reasons);
        let pool_min = src.parse_u64("DB_POOL_MIN", 2, &mut reasons) as u32;
        let pool_max = src.parse_u64("DB_POOL_MAX", 10, &mut reasons) as u32;
        if pool_min > pool_max {
            reasons.push(format!(
                "DB_POOL_MIN ({pool_min}) must not exceed DB_POOL_MAX ({pool_max})"
            ));
        }
        let connection_timeout_ms = src.parse_u64("DB_CONNECTION_TIMEOUT_MS", 30_000, &mut reasons);
        let idle_timeout_ms = src.parse_u64("DB_IDLE_TIMEOUT_MS", 60_000, &mut reasons);

        let replicas_enabled = src.parse_bool("ENABLE_READ_REPLICAS", false, &mut reasons);
        let replica_url = src.get("REPLICA_DATABASE_URL").filter(|v| !v.trim().is_empty());
        if replicas_enabled && replica_url.is_none() {
            reasons.push("ENABLE_READ_REPLICAS requires REPLICA_DATABASE_URL".into());
        }
        let lag_poll_secs = src.parse_u64("REPLICA_LAG_POLL_INTERVAL", 10, &mut reasons);
        let lag_warning = src.parse_f64("REPLICA_LAG_WARNING_THRESHOLD", 5.0, &mut reasons);
        let lag_critical = src.parse_f64("REPLICA_LAG_CRITICAL_THRESHOLD", 10.0, &mut reasons);
        if lag_warning > lag_critical {
            reasons.push(format!(
                "REPLICA_LAG_WARNING_THRESHOLD ({lag_warning}) must not exceed REPLICA_LAG_CRITICAL_THRESHOLD ({lag_critical})"
            ));
        }

        let adapter_enabled = src.parse_bool("SOCKET_ADAPTER_ENABLED", false, &mut reasons);
        let socket_redis_url = src.get("SOCKET_REDIS_URL").filter(|v| !v.trim().is_empty());
        if adapter_enabled && socket_redis_url.is_none() {
            reasons.push("SOCKET_ADAPTER_ENABLED requires SOCKET_REDIS_URL".into());
        }
        let heartbeat_interval_ms =
            src.parse_u64("SOCKET_HEARTBEAT_INTERVAL_MS", 25_000, &mut reasons);
        let heartbeat_grace_ms = src.parse_u64("SOCKET_HEARTBEAT_GRACE_MS", 10_000, &mut reasons);
        let presence_ttl_ms = src.parse_u64("SOCKET_PRESENCE_TTL_MS", 60_000, &mut reasons);
        if presence_ttl_ms <= heartbeat_interval_ms {
            reasons.push(format!(
                "SOCKET_PRESENCE_TTL_MS ({presence_ttl_ms}) must exceed SOCKET_HEARTBEAT_INTERVAL_MS ({heartbeat_interval_ms})"
            ));
        }
        let replay_ttl_ms = src.parse_u64("SOCKET_REPLAY_CACHE_TTL_MS", 300_000, &mut reasons);
        let replay_max = src.parse_u64("SOCKET_REPLAY_CACHE_MAX_MESSAGES", 500, &mut reasons);
        if !(50..=2000).contains(&replay_max) {
            reasons.push(format!(
                "SOCKET_REPLAY_CACHE_MAX_MESSAGES must be within 50..=2000, got {replay_max}"
            ));
        }

        let partitions = src.parse_u64("STREAM_PARTITIONS", 16, &mut reasons);
        if !(1..=256).contains(&partitions) {
            reasons.push(format!(
                "STREAM_PARTITIONS must be within 1..=256, got {partitions}"
            ));
        }
        let max_retries = src.parse_u64("STREAM_MAX_RETRIES", 3, &mut reasons) as u32;
        let stream_poll_ms = src.parse_u64("STREAM_POLL_INTERVAL_MS", 5_000, &mut reasons);
        let batch_size = src.parse_u64("STREAM_BATCH_SIZE", 10, &mut reasons) as usize;
        let pending_high_water = src
            .get("STREAM_PENDING_HIGH_WATER")
            .and_then(|raw| match raw.parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    reasons.push(format!(
                        "STREAM_PENDING_HIGH_WATER must be an integer, got {raw:?}"
                    ));
                    None
                }
            });

        let cache_enabled = src.parse_bool("ENABLE_REDIS_CACHE", false, &mut reasons);
        let cache_bypass = src.parse_bool("CACHE_BYPASS", false, &mut reasons);
        let cache_redis_url = src.get("REDIS_URL").filter(|v| !v.trim().is_empty());
        if cache_enabled && cache_redis_url.is_none() {
            reasons.push("ENABLE_REDIS_CACHE requires REDIS_URL".into());
        }

        let message_max_bytes = src.parse_u64("MESSAGE_MAX_BYTES", 10_000, &mut reasons) as usize;

        let socket_redis_mock = src.parse_bool("SOCKET_REDIS_MOCK", false, &mut reasons);
        let mock_mode = src.parse_bool("MOCK_MODE", false, &mut reasons);
        let disable_rate_limit = src.parse_bool("DISABLE_RATE_LIMIT", false, &mut reasons);
        let dev_seed_data = src.parse_bool("DEV_SEED_DATA", false, &mut reasons);

        if env.is_production() {
            if !adapter_enabled {
                reasons.push("SOCKET_ADAPTER_ENABLED must be true in production".into());
            }
            for (key, set) in [
                ("SOCKET_REDIS_MOCK", socket_redis_mock),
                ("MOCK_MODE", mock_mode),
                ("DISABLE_RATE_LIMIT", disable_rate_limit),
                ("DEV_SEED_DATA", dev_seed_data),
            ] {
                if set {
                    reasons.push(format!("{key} is not allowed in production"));
                }
            }
        }

        if !reasons.is_empty() {
            return Err(ConfigError::InvalidEnvironment(reasons));
        }

        Ok(AppConfig {
            env,
            port,
            log_level,
            log_json,
            auth: AuthConfig {
                issuer,
                audience,
                jwks_url,
                static_keys,
                leeway: Duration::from_secs(leeway_sec),
            },
            database: DatabaseConfig {
                url: database_url,
                pool_min,
                pool_max,
                connection_timeout: Duration::from_millis(connection_timeout_ms),
                idle_timeout: Duration::from_millis(idle_timeout_ms),
            },
            replica: ReplicaConfig {
                enabled: replicas_enabled,
                url: replica_url,
                lag_poll_interval: Duration::from_secs(lag_poll_secs),
                lag_warning_secs: lag_warning,
                lag_critical_secs: lag_critical,
            },
            socket: SocketConfig {
                adapter_enabled,
                redis_url: socket_redis_url,
                redis_tls: src.parse_bool_silent("SOCKET_REDIS_TLS", false),
                redis_key_prefix: src
                    .get("SOCKET_REDIS_KEY_PREFIX")
                    .unwrap_or_else(|| "relay".into()),
                instance_id: src
                    .get("SOCKET_INSTANCE_ID")
                    .unwrap_or_else(|| format!("relay-{}", std::process::id())),
                heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
                heartbeat_grace: Duration::from_millis(heartbeat_grace_ms),
                presence_ttl: Duration::from_millis(presence_ttl_ms),
                replay_ttl: Duration::from_millis(replay_ttl_ms),
                replay_max_messages: replay_max as usize,
            },
            stream: StreamConfig {
                nats_url: src
                    .get("NATS_URL")
                    .unwrap_or_else(|| "nats://127.0.0.1:4222".into()),
                subject_prefix: src.get("STREAM_SUBJECT_PREFIX").unwrap_or_else(|| "relay".into()),
                partitions: partitions as u32,
                max_retries,
                poll_interval: Duration::from_millis(stream_poll_ms),
                batch_size,
                pending_high_water,
            },
            cache: CacheConfig {
                redis_enabled: cache_enabled,
                bypass: cache_bypass,
                redis_url: cache_redis_url,
            },
            message_max_bytes,
            disable_rate_limit,
            mock_mode,
            dev_seed_data,
            socket_redis_mock,
        })
    }
}

struct Source<'a> {
    vars: &'a HashMap<String, String>,
}

impl Source<'_> {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn required(&self, key: &str, reasons: &mut Vec<String>) -> String {
        match self.get(key) {
            Some(v) if !v.trim().is_empty() => v,
            _ => {
                reasons.push(format!("{key} is required"));
                String::new()
            }
        }
    }

    fn parse_bool(&self, key: &str, default: bool, reasons: &mut Vec<String>) -> bool {
        match self.get(key).as_deref() {
            None => default,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" | "" => false,
                other => {
                    reasons.push(format!("{key} must be a boolean, got {other:?}"));
                    default
                }
            },
        }
    }

    fn parse_bool_silent(&self, key: &str, default: bool) -> bool {
        self.parse_bool(key, default, &mut Vec::new())
    }

    fn parse_u64(&self, key: &str, default: u64, reasons: &mut Vec<String>) -> u64 {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(v) => v,
                Err(_) => {
                    reasons.push(format!("{key} must be an integer, got {raw:?}"));
                    default
                }
            },
        }
    }

    fn parse_f64(&self, key: &str, default: f64, reasons: &mut Vec<String>) -> f64 {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(v) => v,
                Err(_) => {
                    reasons.push(format!("{key} must be a number, got {raw:?}"));
                    default
                }
            },
        }
    }
}
