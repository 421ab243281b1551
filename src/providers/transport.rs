use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderValue};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::ProviderError;
use crate::fallback::CancelSignal;
use crate::modules::proxy::ProxyEntry;

const DEFAULT_USER_AGENT: &str = concat!("trendscraper-rs/", env!("CARGO_PKG_VERSION"));

/// Minimum spacing between outbound requests, shared by every holder of a
/// clone. Callers reserve the next free slot, so concurrent requests queue up
/// one interval apart instead of bursting.
#[derive(Debug, Clone)]
pub struct RequestGate {
    interval: Duration,
    next_slot: Arc<Mutex<Option<Instant>>>,
}

impl Default for RequestGate {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl RequestGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for this caller's slot. The slot stays consumed even when the
    /// wait is cancelled.
    pub async fn wait(&self, cancel: &CancelSignal) -> Result<(), ProviderError> {
        if self.interval.is_zero() {
            return Ok(());
        }
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = Some(slot + self.interval);
            slot
        };
        let delay = slot.saturating_duration_since(Instant::now());
        if delay.is_zero() {
            return Ok(());
        }
        log::trace!("request gate holding for {:?}", delay);
        if cancel.sleep(delay).await {
            Ok(())
        } else {
            Err(ProviderError::Cancelled)
        }
    }
}

/// reqwest clients keyed by egress proxy, built lazily and reused.
#[derive(Debug)]
pub struct HttpClientPool {
    base_headers: HeaderMap,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
    gate: RequestGate,
}

impl Default for HttpClientPool {
    fn default() -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json, text/html;q=0.9, */*;q=0.8"));
        Self::new(headers)
    }
}

impl HttpClientPool {
    pub fn new(base_headers: HeaderMap) -> Self {
        Self {
            base_headers,
            clients: Mutex::new(HashMap::new()),
            gate: RequestGate::default(),
        }
    }

    /// Space requests made through this pool by `gate`. Pools sharing a
    /// gate share its spacing.
    pub fn with_gate(mut self, gate: RequestGate) -> Self {
        self.gate = gate;
        self
    }

    /// Hold until the gate allows the next request.
    pub async fn throttle(&self, cancel: &CancelSignal) -> Result<(), ProviderError> {
        self.gate.wait(cancel).await
    }

    pub async fn client(&self, proxy: Option<&ProxyEntry>) -> Result<reqwest::Client, ProviderError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(ProxyEntry::proxy_url);
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .default_headers(self.base_headers.clone());

        if let Some(endpoint) = &key {
            let proxy = reqwest::Proxy::all(endpoint)
                .map_err(|err| ProviderError::Configuration(format!("invalid proxy: {err}")))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| ProviderError::Transient(format!("http client unavailable: {err}")))?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

/// Map a reqwest failure onto the provider taxonomy.
pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else if err.is_decode() {
        ProviderError::InvalidResponse(err.to_string())
    } else {
        ProviderError::Transient(err.to_string())
    }
}
