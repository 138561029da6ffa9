//! Configuration module for vodedge.
//!
//! All settings are driven by environment variables so the edge node stays
//! stateless and container-friendly. Each area of the service has its own
//! config struct with serde support and sensible defaults; [`EdgeConfig::from_env`]
//! assembles the whole tree and [`EdgeConfig::validate`] rejects values that
//! would misconfigure the node.

use crate::cache::CacheMode;
use crate::error::{EdgeError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default maximum object size admitted to the cache by the streaming tee (5 MiB).
pub const DEFAULT_MAX_CACHEABLE_BYTES: u64 = 5 * 1024 * 1024;

/// Maximum rewritten playlist size admitted to the cache (1 MiB).
pub const MAX_PLAYLIST_CACHE_BYTES: u64 = 1024 * 1024;

/// Main configuration for a vodedge node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Origin (S3-compatible object store) configuration.
    pub origin: OriginConfig,
    /// Cache behavior configuration.
    pub cache: CacheConfig,
    /// Redis (L1) backend configuration.
    pub redis: RedisConfig,
    /// Cassandra (L2) backend configuration.
    pub cassandra: CassandraConfig,
    /// Capacity watchdog configuration.
    pub capacity: CapacityConfig,
}

impl EdgeConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            server: ServerConfig::from_env()?,
            origin: OriginConfig::from_env()?,
            cache: CacheConfig::from_env()?,
            redis: RedisConfig::from_env()?,
            cassandra: CassandraConfig::from_env()?,
            capacity: CapacityConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(EdgeError::InvalidConfig {
                field: "server.port".to_string(),
                reason: "port must be non-zero".to_string(),
            });
        }

        if self.cache.max_size == 0 {
            return Err(EdgeError::InvalidConfig {
                field: "cache.max_size".to_string(),
                reason: "cache byte ceiling must be non-zero".to_string(),
            });
        }

        if self.cache.max_items == 0 {
            return Err(EdgeError::InvalidConfig {
                field: "cache.max_items".to_string(),
                reason: "cache item ceiling must be non-zero".to_string(),
            });
        }

        if !(self.cache.redis_memory_threshold > 0.0 && self.cache.redis_memory_threshold <= 1.0) {
            return Err(EdgeError::InvalidConfig {
                field: "cache.redis_memory_threshold".to_string(),
                reason: "must lie in (0, 1]".to_string(),
            });
        }

        for (field, value) in [
            ("capacity.redis_threshold", self.capacity.redis_threshold),
            (
                "capacity.cassandra_threshold",
                self.capacity.cassandra_threshold,
            ),
        ] {
            if !(value > 0.0 && value < 100.0) {
                return Err(EdgeError::InvalidConfig {
                    field: field.to_string(),
                    reason: "threshold must lie in (0, 100)".to_string(),
                });
            }
        }

        if self.cassandra.replication_factor == 0 {
            return Err(EdgeError::InvalidConfig {
                field: "cassandra.replication_factor".to_string(),
                reason: "replication factor must be at least 1".to_string(),
            });
        }

        if self.cassandra.hosts.is_empty() && matches!(self.cache.mode, CacheMode::Cassandra | CacheMode::Hybrid) {
            return Err(EdgeError::InvalidConfig {
                field: "cassandra.hosts".to_string(),
                reason: "at least one contact point is required for cassandra modes".to_string(),
            });
        }

        Ok(())
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Deployment environment (`development`, `production`).
    pub environment: String,
    /// Log level when RUST_LOG is unset.
    pub log_level: String,
    /// First path segment for object routes.
    pub cdn_base: String,
    /// First path segment for admin routes.
    pub proxy_base: String,
    /// Externally visible base URL of this edge, used by the playlist
    /// rewriter. Falls back to `http://{host}:{port}` when unset.
    pub public_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            environment: "development".to_string(),
            log_level: "info".to_string(),
            cdn_base: "cdn".to_string(),
            proxy_base: "proxy".to_string(),
            public_base_url: None,
        }
    }
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_string("HOST", &defaults.host),
            port: env_parse("PORT", defaults.port)?,
            environment: env_string("NODE_ENV", &defaults.environment),
            log_level: env_string("LOG_LEVEL", &defaults.log_level),
            cdn_base: env_string("CDN_BASE_PATH", &defaults.cdn_base),
            proxy_base: env_string("PROXY_BASE_PATH", &defaults.proxy_base),
            public_base_url: env_opt("PUBLIC_BASE_URL"),
        })
    }

    /// The advertised base URL of this edge.
    pub fn public_base(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    /// True when running a production deployment (switches to JSON logs).
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Origin object store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Endpoint URL of the S3-compatible store.
    pub endpoint: String,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Region passed to the client (MinIO accepts any).
    pub region: String,
    /// Bucket used when the request path does not name one.
    pub default_bucket: String,
    /// Use path-style addressing (required for MinIO).
    pub force_path_style: bool,
    /// Connect over TLS.
    pub use_ssl: bool,
    /// Per-request timeout.
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9000".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: "us-east-1".to_string(),
            default_bucket: "vod".to_string(),
            force_path_style: true,
            use_ssl: false,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl OriginConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            endpoint: env_string("S3_ENDPOINT", &defaults.endpoint),
            access_key_id: env_string("S3_ACCESS_KEY_ID", &defaults.access_key_id),
            secret_access_key: env_string("S3_SECRET_ACCESS_KEY", &defaults.secret_access_key),
            region: env_string("S3_REGION", &defaults.region),
            default_bucket: env_string("S3_BUCKET_NAME", &defaults.default_bucket),
            force_path_style: env_parse("S3_FORCE_PATH_STYLE", defaults.force_path_style)?,
            use_ssl: env_parse("S3_USE_SSL", defaults.use_ssl)?,
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT", 30u64)?),
        })
    }
}

/// Cache behavior configuration shared across backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Selected backend.
    pub mode: CacheMode,
    /// Default item TTL.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Period of the memory backend's expiry sweep.
    #[serde(with = "duration_secs")]
    pub check_period: Duration,
    /// Item-count ceiling for the memory backend.
    pub max_items: u64,
    /// Byte ceiling for the memory backend.
    pub max_size: u64,
    /// Largest object the streaming tee will admit to the cache.
    pub max_cacheable_bytes: u64,
    /// Fraction of Redis `maxmemory` treated as this tenant's budget.
    pub redis_memory_threshold: f64,
    /// Row-count ceiling used for Cassandra capacity accounting.
    pub cassandra_max_files: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mode: CacheMode::Memory,
            ttl: Duration::from_secs(3600),
            check_period: Duration::from_secs(600),
            max_items: 1000,
            max_size: 512 * 1024 * 1024,
            max_cacheable_bytes: DEFAULT_MAX_CACHEABLE_BYTES,
            redis_memory_threshold: 0.8,
            cassandra_max_files: 100_000,
        }
    }
}

impl CacheConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let mode = match env::var("CACHE_MODE") {
            Ok(raw) => CacheMode::from_str(&raw).map_err(|_| EdgeError::InvalidConfig {
                field: "CACHE_MODE".to_string(),
                reason: format!("unknown mode '{raw}'"),
            })?,
            Err(_) => defaults.mode,
        };

        Ok(Self {
            mode,
            ttl: Duration::from_secs(env_parse("CACHE_TTL", defaults.ttl.as_secs())?),
            check_period: Duration::from_secs(env_parse(
                "CACHE_CHECK_PERIOD",
                defaults.check_period.as_secs(),
            )?),
            max_items: env_parse("CACHE_MAX_ITEMS", defaults.max_items)?,
            max_size: env_parse("CACHE_MAX_SIZE", defaults.max_size)?,
            max_cacheable_bytes: env_parse("CACHE_MAX_CACHEABLE_BYTES", defaults.max_cacheable_bytes)?,
            redis_memory_threshold: env_parse(
                "REDIS_MEMORY_THRESHOLD",
                defaults.redis_memory_threshold,
            )?,
            cassandra_max_files: env_parse("CASSANDRA_MAX_FILES", defaults.cassandra_max_files)?,
        })
    }
}

/// Redis (L1) connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Key prefix scoping this tenant's entries.
    pub prefix: String,
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            prefix: "vodedge:cache:".to_string(),
            max_retries: 3,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
        }
    }
}

impl RedisConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_string("REDIS_HOST", &defaults.host),
            port: env_parse("REDIS_PORT", defaults.port)?,
            password: env_opt("REDIS_PASSWORD"),
            db: env_parse("REDIS_DB", defaults.db)?,
            prefix: env_string("REDIS_PREFIX", &defaults.prefix),
            max_retries: env_parse("REDIS_MAX_RETRIES", defaults.max_retries)?,
            connect_timeout: Duration::from_secs(env_parse(
                "REDIS_CONNECT_TIMEOUT",
                defaults.connect_timeout.as_secs(),
            )?),
            command_timeout: Duration::from_secs(env_parse(
                "REDIS_COMMAND_TIMEOUT",
                defaults.command_timeout.as_secs(),
            )?),
        })
    }

    /// Connection URL in the form the redis client expects.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Cassandra (L2) connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CassandraConfig {
    /// Contact points, `host:port`.
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Preferred local datacenter.
    pub local_dc: Option<String>,
    /// Consistency level for item reads and writes.
    pub consistency: String,
    /// SimpleStrategy replication factor used at keyspace bootstrap.
    pub replication_factor: u32,
    pub table: String,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for CassandraConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:9042".to_string()],
            keyspace: "vodedge".to_string(),
            username: None,
            password: None,
            local_dc: None,
            consistency: "LOCAL_QUORUM".to_string(),
            replication_factor: 1,
            table: "content_cache".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl CassandraConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let hosts = match env::var("CASSANDRA_HOSTS") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => defaults.hosts,
        };

        Ok(Self {
            hosts,
            keyspace: env_string("CASSANDRA_KEYSPACE", &defaults.keyspace),
            username: env_opt("CASSANDRA_USERNAME"),
            password: env_opt("CASSANDRA_PASSWORD"),
            local_dc: env_opt("CASSANDRA_LOCAL_DC"),
            consistency: env_string("CASSANDRA_CONSISTENCY", &defaults.consistency),
            replication_factor: env_parse(
                "CASSANDRA_REPLICATION_FACTOR",
                defaults.replication_factor,
            )?,
            table: env_string("CASSANDRA_TABLE", &defaults.table),
            connect_timeout: Duration::from_secs(env_parse(
                "CASSANDRA_CONNECT_TIMEOUT",
                defaults.connect_timeout.as_secs(),
            )?),
            request_timeout: Duration::from_secs(env_parse(
                "CASSANDRA_REQUEST_TIMEOUT",
                defaults.request_timeout.as_secs(),
            )?),
        })
    }
}

/// Capacity watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// L1 usage percentage that triggers migration/eviction.
    pub redis_threshold: f64,
    /// L2 usage percentage that triggers eviction.
    pub cassandra_threshold: f64,
    /// Watchdog period.
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            redis_threshold: 85.0,
            cassandra_threshold: 90.0,
            check_interval: Duration::from_secs(60),
        }
    }
}

impl CapacityConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            redis_threshold: env_parse("REDIS_CAPACITY_THRESHOLD", defaults.redis_threshold)?,
            cassandra_threshold: env_parse(
                "CASSANDRA_CAPACITY_THRESHOLD",
                defaults.cassandra_threshold,
            )?,
            check_interval: Duration::from_secs(env_parse(
                "CAPACITY_CHECK_INTERVAL",
                defaults.check_interval.as_secs(),
            )?),
        })
    }
}

// Env parsing helpers

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
{
    match env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| EdgeError::InvalidConfig {
            field: name.to_string(),
            reason: format!("cannot parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

/// Serialize durations as whole seconds, matching the environment contract.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
