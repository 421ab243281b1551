//! Settings and configuration module
//!
//! Provides the acquisition layer's configuration surface with:
//! - JSON loading
//! - Environment overrides
//! - Per-section defaults

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// File name used for the cache database inside the cache directory.
pub const CACHE_DB_FILE: &str = "acquisition-cache.redb";
/// File name used for the session vault inside the stealth directory.
pub const SESSION_DB_FILE: &str = "stealth-sessions.redb";

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Top-level settings for the acquisition layer.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AcquisitionSettings {
    pub proxy: ProxySettings,
    pub cache: CacheSettings,
    pub captcha: CaptchaSettings,
    pub providers: ProviderSettings,
    pub trends: TrendDefaults,
    pub stealth: StealthSettings,
}

impl AcquisitionSettings {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary lookup (the process environment in
    /// production, a map in tests).
    pub fn apply_env_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup: &lookup };

        if let Some(enabled) = env.flag("USE_PROXY")? {
            self.proxy.enabled = enabled;
        }
        if let Some(secs) = env.parse::<u64>("PROXY_ROTATION_INTERVAL")? {
            self.proxy.rotation_interval_secs = secs;
        }
        if let Some(max) = env.parse::<u32>("MAX_REQUESTS_PER_IP")? {
            self.proxy.max_requests_per_proxy = max;
        }
        if let Some(minutes) = env.parse::<u64>("IP_COOLDOWN_MINUTES")? {
            self.proxy.blacklist_cooldown_minutes = minutes;
        }

        let username = env.string("SMARTPROXY_USERNAME");
        let password = env.string("SMARTPROXY_PASSWORD");
        if let (Some(username), Some(password)) = (username, password) {
            let mut vendor = self.proxy.vendor.take().unwrap_or_default();
            vendor.username = username;
            vendor.password = password;
            if let Some(endpoint) = env.string("SMARTPROXY_ENDPOINT") {
                vendor.endpoint = endpoint;
            }
            if let Some(port) = env.parse::<u16>("SMARTPROXY_PORT")? {
                vendor.port = port;
            }
            if let Some(raw) = env.string("SMARTPROXY_ADDITIONAL_PORTS") {
                vendor.additional_ports = parse_ports(&raw)?;
            }
            self.proxy.vendor = Some(vendor);
        }

        if let Some(raw) = env.string("CUSTOM_PROXIES") {
            self.proxy.custom_proxies =
                serde_json::from_str(&raw).map_err(|_| ConfigError::InvalidValue {
                    key: "CUSTOM_PROXIES",
                    value: raw.clone(),
                })?;
        }

        if let Some(enabled) = env.flag("USE_CACHE")? {
            self.cache.enabled = enabled;
        }
        if let Some(dir) = env.string("CACHE_DIRECTORY") {
            self.cache.directory = Some(PathBuf::from(dir));
        }
        if let Some(secs) = env.parse::<u64>("CACHE_EXPIRATION_SECONDS")? {
            self.cache.trend_ttl_secs = secs;
        }

        if let Some(service) = env.parse::<CaptchaService>("CAPTCHA_SERVICE")? {
            self.captcha.service = service;
        }
        let key_var = match self.captcha.service {
            CaptchaService::TwoCaptcha => Some("TWOCAPTCHA_API_KEY"),
            CaptchaService::CapSolver => Some("CAPSOLVER_API_KEY"),
            CaptchaService::Disabled => None,
        };
        if let Some(key) = key_var.and_then(|var| env.string(var)) {
            self.captcha.api_key = Some(key);
        }

        if let Some(key) = env.string("SERPAPI_KEY") {
            self.providers.serpapi_key = Some(key);
        }
        if let Some(enabled) = env.flag("USE_SERPAPI")? {
            self.providers.use_serpapi = enabled;
        }

        if let Some(geo) = env.string("TRENDS_GEO") {
            self.trends.geo = geo;
        }
        if let Some(timeframe) = env.string("TRENDS_TIMEFRAME") {
            self.trends.timeframe = timeframe;
        }

        Ok(self)
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
            None => Ok(None),
        }
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.string(key) {
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(Some(true)),
                "0" | "false" | "no" | "off" => Ok(Some(false)),
                _ => Err(ConfigError::InvalidValue { key, value: raw }),
            },
            None => Ok(None),
        }
    }
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u16>().map_err(|_| ConfigError::InvalidValue {
                key: "SMARTPROXY_ADDITIONAL_PORTS",
                value: raw.to_string(),
            })
        })
        .collect()
}

/// Whether a provider may continue without a proxy when the pool is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyPolicy {
    #[default]
    Preferred,
    Required,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub enabled: bool,
    pub rotation_interval_secs: u64,
    pub max_requests_per_proxy: u32,
    pub blacklist_cooldown_minutes: u64,
    pub policy: ProxyPolicy,
    pub vendor: Option<VendorProxy>,
    pub custom_proxies: Vec<CustomProxy>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            rotation_interval_secs: 300,
            max_requests_per_proxy: 10,
            blacklist_cooldown_minutes: 30,
            policy: ProxyPolicy::Preferred,
            vendor: None,
            custom_proxies: Vec::new(),
        }
    }
}

impl ProxySettings {
    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    pub fn blacklist_cooldown(&self) -> Duration {
        Duration::from_secs(self.blacklist_cooldown_minutes * 60)
    }
}

/// Rotating vendor gateway (one proxy entry per port).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VendorProxy {
    pub endpoint: String,
    pub port: u16,
    pub additional_ports: Vec<u16>,
    pub username: String,
    pub password: String,
    pub protocol: String,
}

impl Default for VendorProxy {
    fn default() -> Self {
        Self {
            endpoint: "gate.smartproxy.com".into(),
            port: 7000,
            additional_ports: Vec::new(),
            username: String::new(),
            password: String::new(),
            protocol: "http".into(),
        }
    }
}

/// Statically configured proxy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CustomProxy {
    pub server: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub directory: Option<PathBuf>,
    pub trend_ttl_secs: u64,
    pub heuristic_ttl_secs: u64,
    pub article_ttl_secs: u64,
    pub marker_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            trend_ttl_secs: 24 * 60 * 60,
            heuristic_ttl_secs: 15 * 60,
            article_ttl_secs: 30 * 24 * 60 * 60,
            marker_ttl_secs: 90 * 24 * 60 * 60,
        }
    }
}

impl CacheSettings {
    pub fn database_path(&self) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| dir.join(CACHE_DB_FILE))
    }
}

/// Captcha solving service selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum CaptchaService {
    #[default]
    #[serde(rename = "2captcha", alias = "twocaptcha")]
    TwoCaptcha,
    #[serde(rename = "capsolver")]
    CapSolver,
    #[serde(rename = "none", alias = "disabled")]
    Disabled,
}

impl FromStr for CaptchaService {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "2captcha" | "twocaptcha" => Ok(Self::TwoCaptcha),
            "capsolver" => Ok(Self::CapSolver),
            "none" | "disabled" | "off" => Ok(Self::Disabled),
            other => Err(format!("unknown captcha service `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptchaSettings {
    pub service: CaptchaService,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for CaptchaSettings {
    fn default() -> Self {
        Self {
            service: CaptchaService::TwoCaptcha,
            api_key: None,
            timeout_secs: 120,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub serpapi_key: Option<String>,
    pub use_serpapi: bool,
    pub serpapi_base_url: String,
    pub serpapi_timeout_secs: u64,
    pub google_trends_timeout_secs: u64,
    pub article_timeout_secs: u64,
    pub max_soft_retries: u32,
    pub retry_backoff_ms: u64,
    /// Minimum spacing between direct HTTP requests across providers.
    pub min_request_interval_ms: u64,
    pub batch_concurrency: usize,
    pub extra_heuristic_scores: BTreeMap<String, u8>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            serpapi_key: None,
            use_serpapi: true,
            serpapi_base_url: "https://serpapi.com".into(),
            serpapi_timeout_secs: 30,
            google_trends_timeout_secs: 60,
            article_timeout_secs: 45,
            max_soft_retries: 2,
            retry_backoff_ms: 1000,
            min_request_interval_ms: 1000,
            batch_concurrency: 4,
            extra_heuristic_scores: BTreeMap::new(),
        }
    }
}

/// Geo/timeframe defaults applied when callers omit them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrendDefaults {
    pub geo: String,
    pub timeframe: String,
    pub hl: String,
    pub tz: i32,
}

impl Default for TrendDefaults {
    fn default() -> Self {
        Self {
            geo: "CA".into(),
            timeframe: "now 7-d".into(),
            hl: "en-CA".into(),
            tz: 360,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StealthSettings {
    pub identity: String,
    pub directory: Option<PathBuf>,
    pub previsit_url: String,
    pub human_simulation: bool,
    pub min_navigation_interval_ms: u64,
    pub headless: bool,
}

impl Default for StealthSettings {
    fn default() -> Self {
        Self {
            identity: "trendscraper".into(),
            directory: None,
            previsit_url: "https://www.google.com/".into(),
            human_simulation: true,
            min_navigation_interval_ms: 1000,
            headless: true,
        }
    }
}

impl StealthSettings {
    pub fn vault_path(&self) -> Option<PathBuf> {
        self.directory.as_ref().map(|dir| dir.join(SESSION_DB_FILE))
    }
}
