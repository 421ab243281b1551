//! Liveness checks for pooled proxies.

use std::time::Duration;

use serde_json::Value;

use super::{ProxyEntry, ProxyPool};

/// Echo endpoint reporting the caller's public address as `{"ip": ...}`.
pub const DEFAULT_CHECK_URL: &str = "https://api.ipify.org?format=json";
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a single proxy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCheck {
    /// The proxy relayed the check; `egress_ip` is what the endpoint saw.
    Healthy { egress_ip: Option<String> },
    Failed { reason: String },
}

impl ProxyCheck {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProxyCheck::Healthy { .. })
    }
}

impl ProxyPool {
    /// Check `proxy` against [`DEFAULT_CHECK_URL`].
    pub async fn verify(&self, proxy: &ProxyEntry) -> ProxyCheck {
        self.verify_with(proxy, DEFAULT_CHECK_URL, DEFAULT_CHECK_TIMEOUT)
            .await
    }

    /// Send one GET to `check_url` through `proxy`. Anything but a 200
    /// blacklists the proxy for the pool's default cooldown. A passing check
    /// leaves the request counters alone.
    pub async fn verify_with(&self, proxy: &ProxyEntry, check_url: &str, timeout: Duration) -> ProxyCheck {
        let check = check_once(proxy, check_url, timeout).await;
        match &check {
            ProxyCheck::Healthy { egress_ip } => {
                log::info!(
                    "proxy {} is working, egress ip {}",
                    proxy,
                    egress_ip.as_deref().unwrap_or("unknown")
                );
            }
            ProxyCheck::Failed { reason } => {
                log::warn!("proxy {} failed its check: {}", proxy, reason);
                self.report_failure(proxy, self.default_cooldown());
            }
        }
        check
    }

    /// Check every proxy that is not retired, in registration order.
    pub async fn verify_all(&self, check_url: &str, timeout: Duration) -> Vec<(String, ProxyCheck)> {
        let candidates: Vec<ProxyEntry> = self
            .lock()
            .iter()
            .filter(|entry| !entry.is_retired())
            .cloned()
            .collect();
        let mut results = Vec::with_capacity(candidates.len());
        for proxy in candidates {
            let check = self.verify_with(&proxy, check_url, timeout).await;
            results.push((proxy.to_string(), check));
        }
        results
    }
}

async fn check_once(proxy: &ProxyEntry, check_url: &str, timeout: Duration) -> ProxyCheck {
    let failed = |reason: String| ProxyCheck::Failed { reason };
    let route = match reqwest::Proxy::all(proxy.proxy_url()) {
        Ok(route) => route,
        Err(err) => return failed(format!("invalid proxy: {err}")),
    };
    let client = match reqwest::Client::builder().proxy(route).timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => return failed(format!("http client unavailable: {err}")),
    };
    let response = match client.get(check_url).send().await {
        Ok(response) => response,
        Err(err) => return failed(err.to_string()),
    };
    let status = response.status().as_u16();
    if status != 200 {
        return failed(format!("status {status}"));
    }
    let egress_ip = response
        .json::<Value>()
        .await
        .ok()
        .and_then(|body| body.get("ip").and_then(Value::as_str).map(str::to_string));
    ProxyCheck::Healthy { egress_ip }
}
