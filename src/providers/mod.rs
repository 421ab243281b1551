//! Data providers consulted by the fallback chain.
//!
//! Trend providers return a raw 0-100 interest score for a query; article
//! providers return extracted article text. Every failure is classified so
//! the chain can decide between retrying, falling back, or disabling the
//! provider.

pub mod article;
pub mod google_trends;
pub mod heuristic;
pub mod serpapi;
mod transport;

pub use article::{ArticleDocument, BrowserArticleProvider, HttpArticleProvider};
pub use google_trends::GoogleTrendsProvider;
pub use heuristic::HeuristicEstimator;
pub use serpapi::SerpApiProvider;
pub use transport::{HttpClientPool, RequestGate};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::challenges::{CaptchaChallenge, CaptchaToken, ChallengeDetector, PageSignal};
use crate::config::{ProxyPolicy, TrendDefaults};
use crate::fallback::CancelSignal;
use crate::modules::cache::keys;
use crate::modules::proxy::{ProxyEntry, ProxyError, ProxyPool};
use crate::modules::stealth::{Session, StealthError};

/// How the fallback chain reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried within the same state up to the soft-retry bound.
    Soft,
    /// Ends this provider's turn; the chain advances.
    Hard,
    /// Provider disabled for the lifetime of the chain.
    Fatal,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("verification challenge detected at {}", .0.page_url)]
    ChallengeDetected(Box<CaptchaChallenge>),
    #[error("challenge could not be resolved: {0}")]
    ChallengeUnresolved(String),
    #[error("no proxy available")]
    NoProxyAvailable,
    #[error("provider misconfigured: {0}")]
    Configuration(String),
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
    #[error("provider attempt cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn class(&self) -> FailureClass {
        match self {
            ProviderError::Transient(_) | ProviderError::Timeout(_) => FailureClass::Soft,
            ProviderError::Configuration(_) => FailureClass::Fatal,
            ProviderError::ChallengeDetected(_)
            | ProviderError::ChallengeUnresolved(_)
            | ProviderError::NoProxyAvailable
            | ProviderError::InvalidResponse(_)
            | ProviderError::Cancelled => FailureClass::Hard,
        }
    }

    /// Whether the egress proxy plausibly caused this failure.
    fn implicates_proxy(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::Timeout(_) | ProviderError::ChallengeDetected(_)
        )
    }
}

impl From<StealthError> for ProviderError {
    fn from(err: StealthError) -> Self {
        match err {
            StealthError::Timeout(timeout) => ProviderError::Timeout(timeout),
            StealthError::Cancelled => ProviderError::Cancelled,
            other => ProviderError::Transient(other.to_string()),
        }
    }
}

/// Per-attempt view of shared services handed to a provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderContext<'a> {
    pub proxies: Option<&'a ProxyPool>,
    pub policy: ProxyPolicy,
    pub cancel: &'a CancelSignal,
    /// Solved challenge from the previous attempt in this state.
    pub captcha_token: Option<&'a CaptchaToken>,
    pub attempt: u32,
    pub timeout: Duration,
}

impl<'a> ProviderContext<'a> {
    /// Context with no proxies, no token and no cancellation.
    pub fn detached(cancel: &'a CancelSignal, timeout: Duration) -> Self {
        Self {
            proxies: None,
            policy: ProxyPolicy::Preferred,
            cancel,
            captcha_token: None,
            attempt: 1,
            timeout,
        }
    }

    /// Borrow a proxy for this attempt. An exhausted pool means proceeding
    /// without one under [`ProxyPolicy::Preferred`].
    pub fn acquire_proxy(&self) -> Result<Option<ProxyEntry>, ProviderError> {
        let Some(pool) = self.proxies.filter(|pool| !pool.is_empty()) else {
            return Ok(None);
        };
        match pool.acquire() {
            Ok(proxy) => Ok(Some(proxy)),
            Err(ProxyError::NoProxyAvailable) if self.policy == ProxyPolicy::Preferred => {
                log::debug!("no proxy available; continuing without one");
                Ok(None)
            }
            Err(_) => Err(ProviderError::NoProxyAvailable),
        }
    }

    /// Feed the attempt outcome back to the pool.
    pub fn report_proxy<T>(&self, proxy: Option<&ProxyEntry>, outcome: &Result<T, ProviderError>) {
        let (Some(pool), Some(proxy)) = (self.proxies, proxy) else {
            return;
        };
        match outcome {
            Ok(_) => pool.report_success(proxy),
            Err(err) if err.implicates_proxy() => {
                log::info!("blacklisting proxy {} after: {}", proxy, err);
                pool.report_failure(proxy, pool.default_cooldown());
            }
            Err(_) => {}
        }
    }
}

/// Normalized trend lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrendQuery {
    pub keyword: String,
    pub geo: String,
    pub timeframe: String,
}

impl TrendQuery {
    /// Empty `geo` or `timeframe` fall back to `defaults`.
    pub fn new(keyword: &str, geo: &str, timeframe: &str, defaults: &TrendDefaults) -> Self {
        let pick = |value: &str, fallback: &str| {
            let value = value.trim();
            if value.is_empty() {
                fallback.to_string()
            } else {
                value.to_string()
            }
        };
        Self {
            keyword: keyword.split_whitespace().collect::<Vec<_>>().join(" "),
            geo: pick(geo, &defaults.geo).to_uppercase(),
            timeframe: pick(timeframe, &defaults.timeframe),
        }
    }

    pub fn cache_key(&self) -> String {
        keys::trend(&self.keyword, &self.geo, &self.timeframe)
    }
}

/// Interest score in `0..=100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendScore {
    pub value: u8,
    /// Provider name, or `heuristic`.
    pub source: String,
    pub estimated: bool,
    #[serde(skip)]
    pub cached: bool,
    pub fetched_at: DateTime<Utc>,
}

impl TrendScore {
    pub fn live(raw: f64, source: &str) -> Self {
        Self {
            value: clamp_score(raw),
            source: source.to_string(),
            estimated: false,
            cached: false,
            fetched_at: Utc::now(),
        }
    }

    pub fn estimate(value: u8) -> Self {
        Self {
            value: value.min(100),
            source: heuristic::NAME.to_string(),
            estimated: true,
            cached: false,
            fetched_at: Utc::now(),
        }
    }
}

pub(crate) fn clamp_score(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

pub(crate) fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[async_trait]
pub trait TrendProvider: Send + Sync {
    fn name(&self) -> &'static str;
    /// Raw score for `query`; the chain clamps and rounds it.
    async fn fetch_score(&self, query: &TrendQuery, ctx: &ProviderContext<'_>) -> Result<f64, ProviderError>;
}

#[async_trait]
pub trait ArticleProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_article(&self, url: &Url, ctx: &ProviderContext<'_>) -> Result<ArticleDocument, ProviderError>;
}

/// Classify a navigation result: challenge, rate limit, or usable page.
pub(crate) fn screen_page(detector: &ChallengeDetector, signal: &PageSignal) -> Result<(), ProviderError> {
    if let Some(challenge) = detector.inspect(signal) {
        return Err(ProviderError::ChallengeDetected(Box::new(challenge)));
    }
    match signal.status {
        200..=299 => Ok(()),
        401 | 403 => Err(ProviderError::Transient(format!("access denied ({})", signal.status))),
        407 => Err(ProviderError::Transient("proxy authentication required (407)".into())),
        408 | 429 | 500..=599 => Err(ProviderError::Transient(format!("status {}", signal.status))),
        status => Err(ProviderError::InvalidResponse(format!("status {status} from {}", signal.url))),
    }
}

/// Submit a solved token back to the page that challenged the session.
pub(crate) async fn submit_token(
    session: &mut Session,
    detector: &ChallengeDetector,
    token: &CaptchaToken,
) -> Result<(), ProviderError> {
    let challenge = &token.challenge;
    let action = match challenge.context.get("form_action") {
        Some(action) => challenge.page_url.join(action).map_err(|err| {
            ProviderError::ChallengeUnresolved(format!("bad challenge form action: {err}"))
        })?,
        None => challenge.page_url.clone(),
    };
    let mut fields = vec![("g-recaptcha-response".to_string(), token.token.clone())];
    if challenge.challenge_type == crate::challenges::ChallengeType::HCaptcha {
        fields.push(("h-captcha-response".to_string(), token.token.clone()));
    }
    if challenge.challenge_type == crate::challenges::ChallengeType::Turnstile {
        fields.push(("cf-turnstile-response".to_string(), token.token.clone()));
    }
    for name in ["q", "continue"] {
        if let Some(value) = challenge.context.get(name) {
            fields.push((name.to_string(), value.clone()));
        }
    }

    let signal = session.submit_form(&action, &fields).await?;
    if detector.detect(&signal) {
        return Err(ProviderError::ChallengeUnresolved(format!(
            "{} rejected the solved token",
            signal.url
        )));
    }
    session.mark_challenge_passed();
    log::info!("challenge token accepted by {}", signal.url);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::proxy::{ProxyConfig, ProxyProtocol};

    #[test]
    fn classifies_failures() {
        assert_eq!(ProviderError::Transient("x".into()).class(), FailureClass::Soft);
        assert_eq!(ProviderError::Timeout(Duration::from_secs(1)).class(), FailureClass::Soft);
        assert_eq!(ProviderError::Configuration("x".into()).class(), FailureClass::Fatal);
        assert_eq!(ProviderError::NoProxyAvailable.class(), FailureClass::Hard);
        assert_eq!(ProviderError::InvalidResponse("x".into()).class(), FailureClass::Hard);
    }

    #[test]
    fn scores_are_clamped_and_rounded() {
        assert_eq!(TrendScore::live(77.6, "serpapi").value, 78);
        assert_eq!(TrendScore::live(130.0, "serpapi").value, 100);
        assert_eq!(TrendScore::live(-4.0, "serpapi").value, 0);
        assert_eq!(TrendScore::live(f64::NAN, "serpapi").value, 0);
        assert!(TrendScore::estimate(85).estimated);
    }

    #[test]
    fn query_applies_defaults() {
        let defaults = TrendDefaults::default();
        let query = TrendQuery::new("  Express   Entry ", "", "", &defaults);
        assert_eq!(query.keyword, "Express Entry");
        assert_eq!(query.geo, "CA");
        assert_eq!(query.timeframe, "now 7-d");
        assert_eq!(query.cache_key(), TrendQuery::new("express entry", "ca", "now 7-d", &defaults).cache_key());
    }

    #[test]
    fn proxy_policy_decides_exhaustion() {
        let pool = ProxyPool::new(ProxyConfig {
            max_requests_per_proxy: 1,
            ..ProxyConfig::default()
        });
        pool.add("10.0.0.1:8080", None, ProxyProtocol::Http);
        let proxy = pool.acquire().unwrap();
        pool.report_success(&proxy);

        let cancel = CancelSignal::never();
        let mut ctx = ProviderContext::detached(&cancel, Duration::from_secs(1));
        ctx.proxies = Some(&pool);
        assert!(ctx.acquire_proxy().unwrap().is_none());

        ctx.policy = ProxyPolicy::Required;
        assert!(matches!(ctx.acquire_proxy(), Err(ProviderError::NoProxyAvailable)));
    }

    #[test]
    fn failed_attempt_blacklists_proxy() {
        let pool = ProxyPool::new(ProxyConfig::default());
        pool.add("10.0.0.1:8080", None, ProxyProtocol::Http);
        let cancel = CancelSignal::never();
        let mut ctx = ProviderContext::detached(&cancel, Duration::from_secs(1));
        ctx.proxies = Some(&pool);

        let proxy = ctx.acquire_proxy().unwrap().unwrap();
        let outcome: Result<(), ProviderError> = Err(ProviderError::Transient("reset".into()));
        ctx.report_proxy(Some(&proxy), &outcome);
        assert!(pool.acquire().is_err());
    }
    #[test]
    fn proxy_auth_rejection_blames_the_proxy() {
        let signal = PageSignal::new(
            Url::parse("https://news.example.ca/story").unwrap(),
            407,
            "<html><body>Proxy Authentication Required</body></html>",
        );
        let err = screen_page(&ChallengeDetector::new(), &signal).unwrap_err();
        assert!(matches!(err, ProviderError::Transient(_)));
        assert!(err.implicates_proxy());

        let pool = ProxyPool::new(ProxyConfig::default());
        pool.add("10.0.0.2:8080", None, ProxyProtocol::Http);
        let cancel = CancelSignal::never();
        let mut ctx = ProviderContext::detached(&cancel, Duration::from_secs(1));
        ctx.proxies = Some(&pool);
        let proxy = ctx.acquire_proxy().unwrap().unwrap();
        ctx.report_proxy(Some(&proxy), &Err::<(), _>(err));
        assert_eq!(pool.health_report().blacklisted_proxies, 1);
    }
}
