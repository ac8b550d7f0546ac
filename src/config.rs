use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Outbound service endpoints
    pub upstream: UpstreamConfig,

    /// Webhook classification and replay settings
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Cookie names and cache TTLs for the UI flow
    #[serde(default)]
    pub session: SessionConfig,

    /// Namespace resolution settings
    #[serde(default)]
    pub resolve: ResolveConfig,

    /// Durable store settings
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Per-request timeout for proxied backend responses, in seconds (default: 30)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            response_timeout_secs: default_response_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Base URLs for the external collaborators
#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    /// Pod lifecycle backend (idler)
    pub idler_url: String,
    /// Tenant directory
    pub tenant_url: String,
    /// Code-hosting lookup (clone URL to owner)
    pub wit_url: String,
    /// Identity/token verification service
    pub auth_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Header carrying the webhook-source marker (default: User-Agent)
    #[serde(default = "default_source_header")]
    pub source_header: String,

    /// Prefix identifying webhook producers on the source header
    #[serde(default = "default_source_prefix")]
    pub source_prefix: String,

    /// Interval between replay passes, in seconds (default: 30)
    #[serde(default = "default_replay_interval")]
    pub replay_interval_secs: u64,

    /// Retry count at which a buffered request is no longer replayed (default: 100)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            source_header: default_source_header(),
            source_prefix: default_source_prefix(),
            replay_interval_secs: default_replay_interval(),
            max_retries: default_max_retries(),
        }
    }
}

impl WebhookConfig {
    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.replay_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Name prefix identifying session cookies (default: JSESSIONID)
    #[serde(default = "default_session_prefix")]
    pub cookie_prefix: String,

    /// Exact name of the idled-marker cookie (default: JenkinsIdled)
    #[serde(default = "default_idled_cookie")]
    pub idled_cookie: String,

    /// TTL for cookie-value to route cache entries, in seconds (default: 1h)
    #[serde(default = "default_session_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_prefix: default_session_prefix(),
            idled_cookie: default_idled_cookie(),
            cache_ttl_secs: default_session_ttl(),
        }
    }
}

impl SessionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolveConfig {
    /// TTL for clone-URL to namespace cache entries, in seconds (default: 12h)
    #[serde(default = "default_repo_ttl")]
    pub repo_cache_ttl_secs: u64,

    /// Resolution attempts on the webhook path before giving up (default: 15)
    #[serde(default = "default_resolve_attempts")]
    pub max_attempts: u32,

    /// Backoff between resolution attempts, in seconds (default: 1)
    #[serde(default = "default_resolve_backoff")]
    pub backoff_secs: u64,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            repo_cache_ttl_secs: default_repo_ttl(),
            max_attempts: default_resolve_attempts(),
            backoff_secs: default_resolve_backoff(),
        }
    }
}

impl ResolveConfig {
    pub fn repo_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.repo_cache_ttl_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Path to the sqlite database file (default: wakegate.db)
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Interval between usage-statistics log lines, in seconds (default: 5m)
    #[serde(default = "default_stats_interval")]
    pub stats_log_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            stats_log_interval_secs: default_stats_interval(),
        }
    }
}

impl StorageConfig {
    pub fn stats_log_interval(&self) -> Duration {
        Duration::from_secs(self.stats_log_interval_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, url) in [
            ("idler_url", &self.upstream.idler_url),
            ("tenant_url", &self.upstream.tenant_url),
            ("wit_url", &self.upstream.wit_url),
            ("auth_url", &self.upstream.auth_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("upstream.{} must be an http(s) URL, got '{}'", name, url);
            }
        }
        if self.webhook.source_prefix.trim().is_empty() {
            anyhow::bail!("webhook.source_prefix must not be empty");
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_response_timeout() -> u64 {
    30
}

fn default_source_header() -> String {
    "User-Agent".to_string()
}

fn default_source_prefix() -> String {
    "GitHub-Hookshot".to_string()
}

fn default_replay_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    100
}

fn default_session_prefix() -> String {
    "JSESSIONID".to_string()
}

fn default_idled_cookie() -> String {
    "JenkinsIdled".to_string()
}

fn default_session_ttl() -> u64 {
    3600
}

fn default_repo_ttl() -> u64 {
    43200
}

fn default_resolve_attempts() -> u32 {
    15
}

fn default_resolve_backoff() -> u64 {
    1
}

fn default_db_path() -> String {
    "wakegate.db".to_string()
}

fn default_stats_interval() -> u64 {
    300
}
