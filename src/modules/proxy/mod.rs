//! Proxy rotation and health tracking utilities.
//!
//! Tracks the egress pool, blacklists failing endpoints, and hands out the
//! least recently used proxy that is still under its per-window request
//! ceiling. All mutation happens behind the pool's own lock so callers can
//! share a cloned handle across tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use url::Url;

use crate::config::{CustomProxy, ProxySettings, VendorProxy};

mod verify;

pub use verify::{DEFAULT_CHECK_TIMEOUT, DEFAULT_CHECK_URL, ProxyCheck};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("no proxy available: all proxies are blacklisted or over their request ceiling")]
    NoProxyAvailable,
    #[error("invalid proxy definition `{0}`")]
    InvalidProxy(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "http" => Some(ProxyProtocol::Http),
            "https" => Some(ProxyProtocol::Https),
            "socks5" | "socks5h" | "socks" => Some(ProxyProtocol::Socks5),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    password: String,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Window after which a proxy's request count starts over.
    pub rotation_interval: Duration,
    /// Requests a proxy may serve within one window.
    pub max_requests_per_proxy: u32,
    /// Default blacklist duration applied by providers on failure.
    pub blacklist_cooldown: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::from_secs(300),
            max_requests_per_proxy: 10,
            blacklist_cooldown: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&ProxySettings> for ProxyConfig {
    fn from(settings: &ProxySettings) -> Self {
        Self {
            rotation_interval: settings.rotation_interval(),
            max_requests_per_proxy: settings.max_requests_per_proxy.max(1),
            blacklist_cooldown: settings.blacklist_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Blacklist {
    Clear,
    Until(Instant),
    Retired,
}

/// A single egress proxy and its usage bookkeeping.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    address: String,
    credentials: Option<ProxyCredentials>,
    protocol: ProxyProtocol,
    request_count: u32,
    window_started_at: Instant,
    last_used_at: Option<Instant>,
    blacklist: Blacklist,
    successes: u64,
    failures: u64,
}

impl ProxyEntry {
    fn new(address: String, credentials: Option<ProxyCredentials>, protocol: ProxyProtocol) -> Self {
        Self {
            address,
            credentials,
            protocol,
            request_count: 0,
            window_started_at: Instant::now(),
            last_used_at: None,
            blacklist: Blacklist::Clear,
            successes: 0,
            failures: 0,
        }
    }

    /// `host:port` of the proxy.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn protocol(&self) -> ProxyProtocol {
        self.protocol
    }

    pub fn credentials(&self) -> Option<&ProxyCredentials> {
        self.credentials.as_ref()
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    pub fn last_used_at(&self) -> Option<Instant> {
        self.last_used_at
    }

    /// End of the current blacklist window, if any. Retired proxies report
    /// `None` here and `true` from [`ProxyEntry::is_retired`].
    pub fn blacklisted_until(&self) -> Option<Instant> {
        match self.blacklist {
            Blacklist::Until(until) => Some(until),
            _ => None,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.blacklist == Blacklist::Retired
    }

    fn is_blacklisted(&self, now: Instant) -> bool {
        match self.blacklist {
            Blacklist::Clear => false,
            Blacklist::Until(until) => until > now,
            Blacklist::Retired => true,
        }
    }

    fn roll_window(&mut self, now: Instant, interval: Duration) {
        if now.duration_since(self.window_started_at) >= interval {
            self.request_count = 0;
            self.window_started_at = now;
        }
    }

    /// URL understood by `reqwest::Proxy::all`, credentials included.
    pub fn proxy_url(&self) -> String {
        match &self.credentials {
            Some(creds) => format!(
                "{}://{}:{}@{}",
                self.protocol.scheme(),
                creds.username,
                creds.password,
                self.address
            ),
            None => format!("{}://{}", self.protocol.scheme(), self.address),
        }
    }
}

impl fmt::Display for ProxyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some(creds) => write!(
                f,
                "{}://{}:****@{}",
                self.protocol.scheme(),
                creds.username,
                self.address
            ),
            None => write!(f, "{}://{}", self.protocol.scheme(), self.address),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyHealthReport {
    pub total_proxies: usize,
    pub available_proxies: usize,
    pub blacklisted_proxies: usize,
    pub retired_proxies: usize,
    pub at_ceiling: usize,
    pub details: HashMap<String, ProxyStats>,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyStats {
    pub successes: u64,
    pub failures: u64,
    pub request_count: u32,
    pub last_used: Option<Instant>,
    pub blacklisted_until: Option<Instant>,
}

/// Shared proxy pool. Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct ProxyPool {
    config: ProxyConfig,
    entries: Arc<Mutex<Vec<ProxyEntry>>>,
}

impl ProxyPool {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Build a pool from the vendor gateway and the custom proxy list.
    pub fn from_settings(settings: &ProxySettings) -> Result<Self, ProxyError> {
        let pool = Self::new(ProxyConfig::from(settings));
        if let Some(vendor) = &settings.vendor {
            pool.add_vendor(vendor)?;
        }
        for custom in &settings.custom_proxies {
            pool.add_custom(custom)?;
        }
        log::info!("proxy pool initialised with {} proxies", pool.len());
        Ok(pool)
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Blacklist duration to use when a caller has no better estimate.
    pub fn default_cooldown(&self) -> Duration {
        self.config.blacklist_cooldown
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProxyEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a proxy. Returns `false` when the address is already known.
    pub fn add(
        &self,
        address: impl Into<String>,
        credentials: Option<ProxyCredentials>,
        protocol: ProxyProtocol,
    ) -> bool {
        let address = address.into();
        let mut entries = self.lock();
        if entries.iter().any(|entry| entry.address == address) {
            return false;
        }
        entries.push(ProxyEntry::new(address, credentials, protocol));
        true
    }

    /// Register a proxy written as `scheme://[user:pass@]host:port`.
    pub fn add_url(&self, raw: &str) -> Result<bool, ProxyError> {
        let parsed = Url::parse(raw).map_err(|_| ProxyError::InvalidProxy(raw.to_string()))?;
        let protocol = ProxyProtocol::parse(parsed.scheme())
            .ok_or_else(|| ProxyError::InvalidProxy(raw.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::InvalidProxy(raw.to_string()))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| ProxyError::InvalidProxy(raw.to_string()))?;
        let credentials = (!parsed.username().is_empty()).then(|| {
            ProxyCredentials::new(parsed.username(), parsed.password().unwrap_or_default())
        });
        Ok(self.add(format!("{host}:{port}"), credentials, protocol))
    }

    fn add_vendor(&self, vendor: &VendorProxy) -> Result<(), ProxyError> {
        let protocol = ProxyProtocol::parse(&vendor.protocol)
            .ok_or_else(|| ProxyError::InvalidProxy(vendor.protocol.clone()))?;
        let credentials = (!vendor.username.is_empty())
            .then(|| ProxyCredentials::new(&vendor.username, &vendor.password));
        for port in std::iter::once(vendor.port).chain(vendor.additional_ports.iter().copied()) {
            self.add(
                format!("{}:{}", vendor.endpoint, port),
                credentials.clone(),
                protocol,
            );
        }
        Ok(())
    }

    fn add_custom(&self, custom: &CustomProxy) -> Result<(), ProxyError> {
        let protocol = match custom.protocol.as_deref() {
            Some(raw) => ProxyProtocol::parse(raw)
                .ok_or_else(|| ProxyError::InvalidProxy(custom.server.clone()))?,
            None => ProxyProtocol::Http,
        };
        let server = custom
            .server
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&custom.server);
        if server.is_empty() {
            return Err(ProxyError::InvalidProxy(custom.server.clone()));
        }
        let credentials = custom.username.as_ref().map(|username| {
            ProxyCredentials::new(username, custom.password.clone().unwrap_or_default())
        });
        self.add(server, credentials, protocol);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Select the least recently used proxy that is neither blacklisted nor
    /// over its request ceiling for the current rotation window.
    pub fn acquire(&self) -> Result<ProxyEntry, ProxyError> {
        let now = Instant::now();
        let ceiling = self.config.max_requests_per_proxy;
        let mut entries = self.lock();

        for entry in entries.iter_mut() {
            entry.roll_window(now, self.config.rotation_interval);
        }

        let selected = entries
            .iter_mut()
            .filter(|entry| !entry.is_blacklisted(now) && entry.request_count < ceiling)
            .min_by_key(|entry| entry.last_used_at)
            .ok_or(ProxyError::NoProxyAvailable)?;

        selected.last_used_at = Some(now);
        log::debug!("acquired proxy {selected}");
        Ok(selected.clone())
    }

    pub fn report_success(&self, proxy: &ProxyEntry) {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.address == proxy.address) {
            entry.request_count = entry.request_count.saturating_add(1);
            entry.successes += 1;
            entry.last_used_at = Some(Instant::now());
        }
    }

    /// Blacklist `proxy` for `cooldown` from now. Later calls replace the
    /// window; a retired proxy stays retired.
    pub fn report_failure(&self, proxy: &ProxyEntry, cooldown: Duration) {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.address == proxy.address) {
            entry.failures += 1;
            if entry.blacklist != Blacklist::Retired {
                entry.blacklist = Blacklist::Until(Instant::now() + cooldown);
            }
            log::warn!(
                "blacklisted proxy {} for {:.0}s",
                entry,
                cooldown.as_secs_f64()
            );
        }
    }

    /// Remove `proxy` from rotation for the rest of the pool's lifetime.
    pub fn retire(&self, proxy: &ProxyEntry) {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|entry| entry.address == proxy.address) {
            entry.blacklist = Blacklist::Retired;
            log::warn!("retired proxy {entry}");
        }
    }

    pub fn health_report(&self) -> ProxyHealthReport {
        let now = Instant::now();
        let entries = self.lock();
        let mut details = HashMap::new();
        let mut available = 0;
        let mut blacklisted = 0;
        let mut retired = 0;
        let mut at_ceiling = 0;

        for entry in entries.iter() {
            if entry.is_retired() {
                retired += 1;
            } else if entry.is_blacklisted(now) {
                blacklisted += 1;
            } else if entry.request_count >= self.config.max_requests_per_proxy
                && now.duration_since(entry.window_started_at) < self.config.rotation_interval
            {
                at_ceiling += 1;
            } else {
                available += 1;
            }
            details.insert(
                entry.to_string(),
                ProxyStats {
                    successes: entry.successes,
                    failures: entry.failures,
                    request_count: entry.request_count,
                    last_used: entry.last_used_at,
                    blacklisted_until: entry.blacklisted_until(),
                },
            );
        }

        ProxyHealthReport {
            total_proxies: entries.len(),
            available_proxies: available,
            blacklisted_proxies: blacklisted,
            retired_proxies: retired,
            at_ceiling,
            details,
        }
    }
}

impl Default for ProxyPool {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}
