//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `#[serde(default = ...)]` functions in this module
//! 2. **Config file**: YAML file named by the `SERVERCONFIG_PATH` env var (default `venn.yml`)
//! 3. **Environment variables**: `VENN__*` env vars override specific fields
//!
//! After deserialization, `${VAR}` references in remote URLs, remote headers and the Redis URI
//! are expanded from the environment, filter presets are resolved into per-remote method maps,
//! and the result is validated.
//!
//! # Example
//!
//! ```yaml
//! bind: ":8545"
//! redis:
//!   uri: "redis://${REDIS_HOST}:6379"
//!   namespace: prod
//! filters:
//!   - name: no-debug
//!     methods: { debug_traceTransaction: false }
//! chains:
//!   - name: ethereum
//!     id: 1
//!     aliases: [mainnet, eth]
//!     block_time_seconds: 12
//!     remotes:
//!       - name: primary
//!         url: "https://eth.example.com/${API_KEY}"
//!         priority: 1
//!         filters: [no-debug]
//! ```

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::Path,
    time::Duration,
};

/// Env var holding the config file path.
pub const CONFIG_PATH_ENV: &str = "SERVERCONFIG_PATH";

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listen address for the RPC server. Go-style `":8545"` is accepted.
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Shared Redis used by the block cache, head stream and election. Optional.
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    #[serde(default)]
    pub election: ElectionConfig,

    /// Per-client-IP throttle. Disabled when absent.
    #[serde(default)]
    pub ratelimit: Option<ClientRateLimitConfig>,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub chains: Vec<ChainConfig>,

    #[serde(default)]
    pub filters: Vec<FilterPreset>,
}

fn default_bind() -> String {
    ":8545".to_string()
}

/// Log output settings. `SLOG_FORMAT` / `SLOG_LEVEL` override these at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of `json`, `tint`, `pretty`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// `debug`/`info`/`warn`/`error` or the slog integers `-4`/`0`/`4`/`8`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { format: default_log_format(), log_level: default_log_level() }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub disabled: bool,

    /// Defaults to `":6060"`.
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    ":6060".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { disabled: false, bind: default_metrics_bind() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URI, env-expandable.
    #[serde(default)]
    pub uri: String,

    /// Cluster node URIs. When set, the first reachable node is used for the pool.
    #[serde(default)]
    pub cluster: Vec<String>,

    /// Key namespace; every key is prefixed with `venn:{namespace}`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl RedisConfig {
    /// Returns the URI used to build the connection pool.
    #[must_use]
    pub fn connection_uri(&self) -> Option<&str> {
        if !self.uri.is_empty() {
            return Some(&self.uri);
        }
        self.cluster.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionStrategyKind {
    Redis,
    #[serde(alias = "always", alias = "always_leader")]
    AlwaysLeader,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Explicit strategy. When unset, `redis` is used if Redis is configured.
    #[serde(default)]
    pub strategy: Option<ElectionStrategyKind>,
}

/// Client-facing throttle: `total` requests per `window` per client key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRateLimitConfig {
    pub total: u32,

    #[serde(with = "humantime_serde", default = "default_ratelimit_window")]
    pub window: Duration,
}

fn default_ratelimit_window() -> Duration {
    Duration::from_secs(1)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub trusted_origins: Vec<String>,

    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Headers (e.g. `X-Forwarded-For`) trusted to carry the client IP.
    #[serde(default)]
    pub trusted_ip_headers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries per (chain, kind) in the in-process LRU. Defaults to `2048`.
    #[serde(default = "default_lru_size")]
    pub lru_size: usize,
}

fn default_lru_size() -> usize {
    2048
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { lru_size: default_lru_size() }
    }
}

/// Named method allow/deny map shared between remotes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPreset {
    pub name: String,

    #[serde(default)]
    pub methods: HashMap<String, bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Evm,
    Solana,
    Near,
    Sui,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Evm => "evm",
            Protocol::Solana => "solana",
            Protocol::Near => "near",
            Protocol::Sui => "sui",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolanaConfig {
    /// `getBlockHeight` (default) or `getSlot`.
    #[serde(default)]
    pub head_method: Option<String>,

    #[serde(default)]
    pub genesis_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NearConfig {
    /// Block finality used by the probe; `final` when unset.
    #[serde(default)]
    pub finality: Option<String>,

    #[serde(default)]
    pub genesis_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiConfig {
    #[serde(default)]
    pub head_method: Option<String>,

    #[serde(default)]
    pub chain_identifier: Option<String>,
}

/// External head source. Accepted for compatibility; not consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadOracleConfig {
    pub url: String,
    #[serde(default)]
    pub expr: String,
}

/// One chain served under `/{name}` (and `/{alias}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub id: u64,

    #[serde(default)]
    pub aliases: Vec<String>,

    pub block_time_seconds: f64,

    #[serde(default)]
    pub protocol: Protocol,

    /// Poll the head of this chain. Defaults to true for EVM chains.
    #[serde(default)]
    pub stalk: Option<bool>,

    #[serde(default)]
    pub forge_block_receipts: bool,

    #[serde(default)]
    pub head_oracles: Vec<HeadOracleConfig>,

    /// Reject requests older than `head - max_block_look_back` for every remote. 0 disables.
    #[serde(default)]
    pub max_block_look_back: u64,

    #[serde(default)]
    pub solana: Option<SolanaConfig>,

    #[serde(default)]
    pub near: Option<NearConfig>,

    #[serde(default)]
    pub sui: Option<SuiConfig>,

    #[serde(default)]
    pub remotes: Vec<RemoteConfig>,
}

impl ChainConfig {
    /// Builds an EVM chain with no remotes and every optional setting at its default.
    #[must_use]
    pub fn new(name: impl Into<String>, id: u64, block_time_seconds: f64) -> Self {
        Self {
            name: name.into(),
            id,
            aliases: Vec::new(),
            block_time_seconds,
            protocol: Protocol::Evm,
            stalk: None,
            forge_block_receipts: false,
            head_oracles: Vec::new(),
            max_block_look_back: 0,
            solana: None,
            near: None,
            sui: None,
            remotes: Vec::new(),
        }
    }

    #[must_use]
    pub fn block_time(&self) -> Duration {
        Duration::from_secs_f64(self.block_time_seconds.max(0.0))
    }

    #[must_use]
    pub fn stalk_enabled(&self) -> bool {
        self.stalk.unwrap_or(self.protocol == Protocol::Evm)
    }

    /// Age past which a "latest" block is considered stale: `max(1m, 2 x blockTime)`.
    #[must_use]
    pub fn head_old_after(&self) -> Duration {
        Duration::from_secs(60).max(self.block_time() * 2)
    }

    /// Reports whether `segment` names this chain.
    #[must_use]
    pub fn matches(&self, segment: &str) -> bool {
        self.name == segment || self.aliases.iter().any(|a| a == segment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRateLimit {
    pub events_per_second: f64,
    pub burst: u32,
}

impl Default for RemoteRateLimit {
    fn default() -> Self {
        Self { events_per_second: 500.0, burst: 1000 }
    }
}

/// One upstream endpoint of a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub name: String,

    /// Env-expandable upstream URL (http, https, ws or wss).
    pub url: String,

    #[serde(default)]
    pub desc: String,

    /// Smaller is tried first.
    #[serde(default)]
    pub priority: i64,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[serde(default)]
    pub rate_limit: Option<RemoteRateLimit>,

    #[serde(with = "humantime_serde", default = "default_health_min")]
    pub health_check_interval_min: Duration,

    #[serde(with = "humantime_serde", default = "default_health_max")]
    pub health_check_interval_max: Duration,

    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub rate_limit_backoff: Duration,

    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub error_backoff_min: Duration,

    #[serde(with = "humantime_serde", default = "default_backoff")]
    pub error_backoff_max: Duration,

    /// Names of [`FilterPreset`]s merged into [`RemoteConfig::methods`].
    #[serde(default)]
    pub filters: Vec<String>,

    #[serde(default)]
    pub send_data_and_input: bool,

    #[serde(default)]
    pub max_block_look_back: u64,

    /// Resolved method map, keyed by lowercase method name.
    #[serde(skip)]
    pub methods: HashMap<String, bool>,
}

fn default_health_min() -> Duration {
    Duration::from_secs(60)
}

fn default_health_max() -> Duration {
    Duration::from_secs(3600)
}

fn default_backoff() -> Duration {
    Duration::from_secs(5)
}

impl RemoteConfig {
    /// Builds a remote with every optional setting at its default.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>, priority: i64) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            desc: String::new(),
            priority,
            headers: HashMap::new(),
            rate_limit: None,
            health_check_interval_min: default_health_min(),
            health_check_interval_max: default_health_max(),
            rate_limit_backoff: default_backoff(),
            error_backoff_min: default_backoff(),
            error_backoff_max: default_backoff(),
            filters: Vec::new(),
            send_data_and_input: false,
            max_block_look_back: 0,
            methods: HashMap::new(),
        }
    }

    /// Effective look-back horizon: the smaller non-zero of the chain and remote settings.
    #[must_use]
    pub fn effective_look_back(&self, chain: &ChainConfig) -> u64 {
        match (chain.max_block_look_back, self.max_block_look_back) {
            (0, r) => r,
            (c, 0) => c,
            (c, r) => c.min(r),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a YAML file with environment variable overrides.
    ///
    /// Environment variables with the `VENN__` prefix can override any configuration value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, resolved or validated.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let path = config_path.as_ref().to_string_lossy().to_string();
        let builder = Config::builder()
            .add_source(File::new(&path, FileFormat::Yaml).required(true))
            .add_source(Environment::with_prefix("VENN").prefix_separator("__").separator("__"))
            .build()?;

        let config: AppConfig = builder.try_deserialize()?;
        config.finalize()
    }

    /// Parses configuration from an in-memory YAML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the document cannot be parsed, resolved or validated.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.finalize()
    }

    /// Loads configuration from `SERVERCONFIG_PATH`, falling back to `venn.yml`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "venn.yml".to_string());
        Self::from_file(path)
    }

    /// Expands env references, resolves filter presets and validates.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Message`] describing the first problem found.
    pub fn finalize(mut self) -> Result<Self, ConfigError> {
        if let Some(redis) = self.redis.as_mut() {
            redis.uri = expand_env(&redis.uri);
            for node in &mut redis.cluster {
                *node = expand_env(node);
            }
        }

        let presets: HashMap<&str, &FilterPreset> =
            self.filters.iter().map(|f| (f.name.as_str(), f)).collect();

        for chain in &mut self.chains {
            for remote in &mut chain.remotes {
                remote.url = expand_env(&remote.url);
                for value in remote.headers.values_mut() {
                    *value = expand_env(value);
                }
                let mut methods = HashMap::new();
                for name in &remote.filters {
                    let preset = presets.get(name.as_str()).ok_or_else(|| {
                        ConfigError::Message(format!(
                            "remote {} on chain {} references unknown filter {name}",
                            remote.name, chain.name
                        ))
                    })?;
                    for (method, allowed) in &preset.methods {
                        methods.insert(method.to_ascii_lowercase(), *allowed);
                    }
                }
                remote.methods = methods;
            }
        }

        self.validate().map_err(ConfigError::Message)?;
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid setting.
    pub fn validate(&self) -> Result<(), String> {
        parse_bind(&self.bind).map_err(|e| format!("invalid bind {}: {e}", self.bind))?;

        if !self.metrics.disabled {
            parse_bind(&self.metrics.bind)
                .map_err(|e| format!("invalid metrics bind {}: {e}", self.metrics.bind))?;
        }

        if !["json", "tint", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json', 'tint' or 'pretty'".to_string());
        }

        if self.election.strategy == Some(ElectionStrategyKind::Redis) && self.redis.is_none() {
            return Err("election strategy 'redis' requires a redis section".to_string());
        }

        if let Some(redis) = &self.redis {
            if redis.connection_uri().is_none() {
                return Err("redis section requires uri or cluster".to_string());
            }
        }

        if let Some(rl) = &self.ratelimit {
            if rl.total == 0 || rl.window.is_zero() {
                return Err("ratelimit total and window must be greater than 0".to_string());
            }
        }

        if self.cache.lru_size == 0 {
            return Err("cache lru_size must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for chain in &self.chains {
            for key in std::iter::once(&chain.name).chain(chain.aliases.iter()) {
                if key.is_empty() {
                    return Err("chain names and aliases must not be empty".to_string());
                }
                if !seen.insert(key.as_str()) {
                    return Err(format!("duplicate chain name or alias: {key}"));
                }
            }

            if chain.block_time_seconds.is_nan() || chain.block_time_seconds <= 0.0 {
                return Err(format!("chain {}: block_time_seconds must be positive", chain.name));
            }

            if chain.remotes.is_empty() {
                return Err(format!("chain {} has no remotes", chain.name));
            }

            if chain.protocol != Protocol::Evm
                && (chain.stalk == Some(true) || chain.forge_block_receipts)
            {
                return Err(format!(
                    "chain {}: stalk and forge_block_receipts are only supported for evm",
                    chain.name
                ));
            }

            let mut remote_names = HashSet::new();
            for remote in &chain.remotes {
                if !remote_names.insert(remote.name.as_str()) {
                    return Err(format!("chain {}: duplicate remote {}", chain.name, remote.name));
                }
                let parsed = url::Url::parse(&remote.url)
                    .map_err(|e| format!("remote {}: invalid url: {e}", remote.name))?;
                if !["http", "https", "ws", "wss"].contains(&parsed.scheme()) {
                    return Err(format!(
                        "remote {}: unsupported url scheme {}",
                        remote.name,
                        parsed.scheme()
                    ));
                }
                if remote.health_check_interval_min > remote.health_check_interval_max {
                    return Err(format!(
                        "remote {}: health_check_interval_min exceeds max",
                        remote.name
                    ));
                }
                if remote.error_backoff_min > remote.error_backoff_max {
                    return Err(format!("remote {}: error_backoff_min exceeds max", remote.name));
                }
                if let Some(rl) = &remote.rate_limit {
                    if rl.events_per_second <= 0.0 || rl.burst == 0 {
                        return Err(format!(
                            "remote {}: rate_limit requires positive events_per_second and burst",
                            remote.name
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Returns the configured election strategy, defaulting on Redis availability.
    #[must_use]
    pub fn election_strategy(&self) -> ElectionStrategyKind {
        match (self.election.strategy, &self.redis) {
            (Some(kind), _) => kind,
            (None, Some(_)) => ElectionStrategyKind::Redis,
            (None, None) => ElectionStrategyKind::AlwaysLeader,
        }
    }

    /// Finds a chain by name or alias.
    #[must_use]
    pub fn chain(&self, segment: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.matches(segment))
    }
}

/// Parses a listen address, accepting the `":port"` shorthand.
///
/// # Errors
///
/// Returns the address parse error.
pub fn parse_bind(bind: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if let Some(port) = bind.strip_prefix(':') {
        return format!("0.0.0.0:{port}").parse();
    }
    bind.parse()
}

/// Expands `${VAR}` and `$VAR` references from the process environment.
///
/// Unset variables expand to the empty string.
#[must_use]
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for n in chars.by_ref() {
                if n == '}' {
                    break;
                }
                name.push(n);
            }
        } else {
            while let Some(&n) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '_' {
                    name.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            if name.is_empty() {
                out.push('$');
                continue;
            }
        }
        out.push_str(&std::env::var(&name).unwrap_or_default());
    }

    out
}
